//! Mapping resampled voxel values to colour.
//!
//! Each volume kind carries a [`DisplayKind`] that decides how its resliced
//! components turn into RGBA: window/level greyscale for scalars, a lookup
//! table for label maps, per-channel windowing for vectors, one selected
//! gradient for diffusion-weighted data and a scalar reduction for tensors.

use image::{GrayImage, Luma, Rgba, RgbaImage};

use crate::enums::{Interpolation, TensorScalarMode, VolumeKind};
use crate::reslice::{ResampleChannel, Resliced};

/// Colours indexed by label value.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    colors: Vec<[u8; 4]>,
}

impl LookupTable {
    pub fn new(colors: Vec<[u8; 4]>) -> Self {
        Self { colors }
    }

    /// Label 0 transparent, other labels cycle through a fixed palette.
    pub fn labels() -> Self {
        const PALETTE: [[u8; 4]; 8] = [
            [128, 174, 128, 255],
            [241, 214, 145, 255],
            [177, 122, 101, 255],
            [111, 184, 210, 255],
            [216, 101, 79, 255],
            [221, 130, 101, 255],
            [144, 238, 144, 255],
            [192, 104, 88, 255],
        ];
        let mut colors = vec![[0, 0, 0, 0]];
        colors.extend(PALETTE.iter().cycle().take(255).copied());
        Self { colors }
    }

    /// Colour of `index`; values past the table wrap around, negative
    /// values are transparent.
    pub fn color(&self, index: i64) -> [u8; 4] {
        if index < 0 || self.colors.is_empty() {
            return [0, 0, 0, 0];
        }
        if index == 0 {
            return self.colors[0];
        }
        let len = self.colors.len() as i64;
        if index < len {
            return self.colors[index as usize];
        }
        // Wrap while skipping entry 0, which stays reserved for background.
        let wrapped = 1 + (index - 1) % (len - 1).max(1);
        self.colors[wrapped as usize]
    }

    /// Colour for a normalised intensity in `[0, 1]`.
    pub fn sample(&self, t: f64) -> [u8; 4] {
        if self.colors.is_empty() {
            return [0, 0, 0, 0];
        }
        let last = self.colors.len() - 1;
        self.colors[(t.clamp(0.0, 1.0) * last as f64).round() as usize]
    }
}

/// Per-kind display parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayKind {
    Scalar {
        /// Optional colour map applied after window/level
        color_map: Option<LookupTable>,
    },
    Label {
        lookup: LookupTable,
        outline_thickness: u32,
    },
    Vector,
    DiffusionWeighted {
        component: usize,
    },
    DiffusionTensor {
        scalar_mode: TensorScalarMode,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayProperties {
    pub kind: DisplayKind,
    pub window: f64,
    pub level: f64,
    pub auto_window_level: bool,
    pub apply_threshold: bool,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    pub auto_threshold: bool,
    /// Linear sampling unless the volume is a label map
    pub interpolate: bool,
}

impl DisplayProperties {
    pub fn for_kind(kind: VolumeKind) -> Self {
        let display_kind = match kind {
            VolumeKind::Scalar => DisplayKind::Scalar { color_map: None },
            VolumeKind::Label => DisplayKind::Label {
                lookup: LookupTable::labels(),
                outline_thickness: 1,
            },
            VolumeKind::Vector => DisplayKind::Vector,
            VolumeKind::DiffusionWeighted => DisplayKind::DiffusionWeighted { component: 0 },
            VolumeKind::DiffusionTensor => DisplayKind::DiffusionTensor {
                scalar_mode: TensorScalarMode::default(),
            },
        };
        Self {
            kind: display_kind,
            window: 256.0,
            level: 128.0,
            auto_window_level: true,
            apply_threshold: false,
            lower_threshold: f64::MIN,
            upper_threshold: f64::MAX,
            auto_threshold: false,
            interpolate: kind != VolumeKind::Label,
        }
    }

    pub fn is_label_map(&self) -> bool {
        matches!(self.kind, DisplayKind::Label { .. })
    }

    pub fn outline_thickness(&self) -> Option<u32> {
        match self.kind {
            DisplayKind::Label {
                outline_thickness, ..
            } => Some(outline_thickness),
            _ => None,
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        if self.is_label_map() || !self.interpolate {
            Interpolation::Nearest
        } else {
            Interpolation::Linear
        }
    }

    /// Tensor volumes resample their tensor field, everything else the scalars.
    pub fn resample_channel(&self) -> ResampleChannel {
        match self.kind {
            DisplayKind::DiffusionTensor { .. } => ResampleChannel::Tensors,
            _ => ResampleChannel::Scalars,
        }
    }

    /// Whether the layer should report a stencil of the in-volume region.
    /// Label maps and thresholded volumes do.
    pub fn uses_background_mask(&self) -> bool {
        self.is_label_map() || self.apply_threshold
    }

    /// Copy for a layer's private use, with every automatic adjustment off.
    pub fn slice_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.auto_window_level = false;
        clone.auto_threshold = false;
        clone
    }

    pub fn apply_auto_levels(&mut self, (min, max): (f64, f64)) {
        if self.auto_window_level {
            self.window = (max - min).max(f64::EPSILON);
            self.level = 0.5 * (max + min);
        }
        if self.auto_threshold {
            self.lower_threshold = min;
            self.upper_threshold = max;
        }
    }

    #[inline]
    fn window_level(&self, value: f64) -> f64 {
        let low = self.level - 0.5 * self.window;
        ((value - low) / self.window).clamp(0.0, 1.0)
    }

    #[inline]
    fn passes_threshold(&self, value: f64) -> bool {
        !self.apply_threshold || (self.lower_threshold..=self.upper_threshold).contains(&value)
    }

    fn grey(&self, value: f64, color_map: Option<&LookupTable>) -> [u8; 4] {
        let t = self.window_level(value);
        match color_map {
            Some(map) => map.sample(t),
            None => {
                let v = (t * 255.0).round() as u8;
                [v, v, v, 255]
            }
        }
    }

    fn pixel(&self, components: &[f64]) -> [u8; 4] {
        match &self.kind {
            DisplayKind::Scalar { color_map } => {
                let value = components[0];
                if !self.passes_threshold(value) {
                    return [0, 0, 0, 0];
                }
                self.grey(value, color_map.as_ref())
            }
            DisplayKind::Label { lookup, .. } => lookup.color(components[0].round() as i64),
            DisplayKind::Vector => {
                let channel = |c: usize| {
                    let value = components.get(c).copied().unwrap_or(0.0);
                    (self.window_level(value) * 255.0).round() as u8
                };
                [channel(0), channel(1), channel(2), 255]
            }
            DisplayKind::DiffusionWeighted { component } => {
                let value = components[(*component).min(components.len() - 1)];
                if !self.passes_threshold(value) {
                    return [0, 0, 0, 0];
                }
                self.grey(value, None)
            }
            DisplayKind::DiffusionTensor { scalar_mode } => {
                let value = match <&[f64; 9]>::try_from(components) {
                    Ok(tensor) => tensor_scalar(*scalar_mode, tensor),
                    Err(_) => 0.0,
                };
                if !self.passes_threshold(value) {
                    return [0, 0, 0, 0];
                }
                self.grey(value, None)
            }
        }
    }

    /// Colour a resliced block. Frames along z are stacked top to bottom.
    ///
    /// Returns the RGBA image and, if [`uses_background_mask`] holds, the
    /// in-volume stencil (255 inside, 0 outside).
    ///
    /// [`uses_background_mask`]: DisplayProperties::uses_background_mask
    pub fn map_to_rgba(&self, resliced: &Resliced) -> (RgbaImage, Option<GrayImage>) {
        let (width, height, depth) = resliced.extent();
        let mut image = RgbaImage::new(width as u32, (height * depth) as u32);
        let mut stencil = self
            .uses_background_mask()
            .then(|| GrayImage::new(width as u32, (height * depth) as u32));

        for z in 0..depth {
            for y in 0..height {
                let row = (z * height + y) as u32;
                for x in 0..width {
                    if !resliced.inside[[z, y, x]] {
                        continue;
                    }
                    let lane = resliced.values.slice(ndarray::s![z, y, x, ..]);
                    let components: Vec<f64> = lane.iter().copied().collect();
                    image.put_pixel(x as u32, row, Rgba(self.pixel(&components)));
                    if let Some(stencil) = stencil.as_mut() {
                        stencil.put_pixel(x as u32, row, Luma([255]));
                    }
                }
            }
        }
        (image, stencil)
    }
}

/// Reduce a row-major 3×3 diffusion tensor to one scalar.
pub fn tensor_scalar(mode: TensorScalarMode, tensor: &[f64; 9]) -> f64 {
    let trace = tensor[0] + tensor[4] + tensor[8];
    match mode {
        TensorScalarMode::Trace => trace,
        TensorScalarMode::MeanDiffusivity => trace / 3.0,
        TensorScalarMode::FractionalAnisotropy => {
            let mean = trace / 3.0;
            let norm: f64 = tensor.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm == 0.0 {
                return 0.0;
            }
            let deviatoric: f64 = tensor
                .iter()
                .enumerate()
                .map(|(index, v)| {
                    let d = if index % 4 == 0 { v - mean } else { *v };
                    d * d
                })
                .sum::<f64>()
                .sqrt();
            (1.5f64).sqrt() * deviatoric / norm
        }
    }
}
