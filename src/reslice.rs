use glam::{DVec3, DVec4};
use ndarray::{Array3, Array4, ArrayView4};
use rayon::prelude::*;
use tracing::trace;

use crate::enums::Interpolation;
use crate::error::ResliceError;
use crate::interpolator::Interpolator;
use crate::transform::XyToIjk;
use crate::volume::{ImageData, VoxelArray, VoxelValue, dispatch};

/// Which buffer of an [`ImageData`] gets resampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleChannel {
    #[default]
    Scalars,
    /// The 9-component tensor field
    Tensors,
}

/// Resampled values on the output pixel grid.
///
/// `values` is indexed `[z, y, x, component]`; `inside[[z, y, x]]` is
/// `false` where the pixel fell outside the volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Resliced {
    pub values: Array4<f64>,
    pub inside: Array3<bool>,
}

impl Resliced {
    /// Output size as `(width, height, depth)`.
    pub fn extent(&self) -> (usize, usize, usize) {
        let (depth, height, width, _) = self.values.dim();
        (width, height, depth)
    }

    pub fn components(&self) -> usize {
        self.values.dim().3
    }
}

/// Resample `image` on the `dimensions` output grid through `transform`.
///
/// # Errors
///
/// Returns [`ResliceError::UnsupportedScalarType`] for 64-bit integer voxels
/// and [`ResliceError::ShapeMismatch`] when the tensor channel is requested
/// for an image without tensors.
pub fn reslice(
    image: &ImageData,
    channel: ResampleChannel,
    transform: &XyToIjk,
    dimensions: [u32; 3],
    interpolation: Interpolation,
) -> Result<Resliced, ResliceError> {
    match channel {
        ResampleChannel::Scalars => {
            let scalars = image.scalars();
            if !scalars.scalar_type().is_exact_in_f64() {
                return Err(ResliceError::UnsupportedScalarType(scalars.scalar_type()));
            }
            dispatch!(scalars, array => resample(array.view(), transform, dimensions, interpolation))
        }
        ResampleChannel::Tensors => {
            let tensors = image.tensors().ok_or_else(|| {
                let (depth, height, width) = image.dim();
                ResliceError::ShapeMismatch {
                    expected: vec![depth, height, width, 9],
                    actual: vec![],
                }
            })?;
            resample(tensors.view(), transform, dimensions, interpolation)
        }
    }
}

fn resample<T: VoxelValue>(
    volume: ArrayView4<'_, T>,
    transform: &XyToIjk,
    dimensions: [u32; 3],
    interpolation: Interpolation,
) -> Result<Resliced, ResliceError> {
    let [width, height, depth] = dimensions.map(|d| d as usize);
    let components = volume.dim().3;

    let sample = |ijk: DVec3, out: &mut [f64]| match interpolation {
        Interpolation::Nearest => Interpolator::nearest(&volume, ijk, out),
        Interpolation::Linear => Interpolator::trilinear(&volume, ijk, out),
    };

    // Permutation fast path: the x-driven offsets are shared by every row.
    let x_steps: Option<Vec<DVec3>> = match transform {
        XyToIjk::Linear {
            matrix,
            permutation: true,
        } => {
            let step = matrix.x_axis.truncate();
            Some((0..width).map(|x| step * x as f64).collect())
        }
        _ => None,
    };
    trace!(
        width,
        height,
        depth,
        components,
        fast_path = x_steps.is_some(),
        "resampling"
    );

    let rows: Vec<(Vec<f64>, Vec<bool>)> = (0..depth * height)
        .into_par_iter()
        .map(|row| {
            let z = (row / height) as f64;
            let y = (row % height) as f64;
            let mut values = vec![0.0; width * components];
            let mut inside = vec![false; width];

            match (&x_steps, transform) {
                (Some(steps), XyToIjk::Linear { matrix, .. }) => {
                    let origin = (*matrix * DVec4::new(0.0, y, z, 1.0)).truncate();
                    for (x, step) in steps.iter().enumerate() {
                        let out = &mut values[x * components..(x + 1) * components];
                        inside[x] = sample(origin + *step, out);
                    }
                }
                _ => {
                    for x in 0..width {
                        let ijk = transform.map(DVec3::new(x as f64, y, z));
                        let out = &mut values[x * components..(x + 1) * components];
                        inside[x] = sample(ijk, out);
                    }
                }
            }
            (values, inside)
        })
        .collect();

    let mut values = Vec::with_capacity(depth * height * width * components);
    let mut inside = Vec::with_capacity(depth * height * width);
    for (row_values, row_inside) in rows {
        values.extend(row_values);
        inside.extend(row_inside);
    }

    let expected = vec![depth, height, width, components];
    let values = Array4::from_shape_vec((depth, height, width, components), values).map_err(|_| {
        ResliceError::ShapeMismatch {
            expected: expected.clone(),
            actual: vec![],
        }
    })?;
    let inside = Array3::from_shape_vec((depth, height, width), inside).map_err(|_| {
        ResliceError::ShapeMismatch {
            expected,
            actual: vec![],
        }
    })?;
    Ok(Resliced { values, inside })
}
