//! Per-view compositing of the background, foreground and label layers.
//!
//! A [`SliceCompositor`] owns the three [`SliceLayer`]s of one slice view,
//! resolves the volumes named by the view's composite node, blends the layer
//! rasters for both resolutions and keeps the geometry of the plane shown in
//! 3D views. It also carries the slice-view operations that need to know the
//! bound volumes: fitting, UVW extents, resizing and interaction helpers.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use glam::{DMat3, DMat4, DVec3};
use image::RgbaImage;
use image::imageops;
use tracing::debug;

use crate::blend::{self, BlendInput};
use crate::composite_node::{CompositeInteraction, CompositeNode};
use crate::config::Config;
use crate::enums::{BlendMode, LayerKind, Resolution, ResolutionMode, SliceSpacingMode};
use crate::guard::ReentrancyCounter;
use crate::node::NodeEvent;
use crate::observer::{Notifier, Priority, Subscription};
use crate::scene::{NodeRef, Scene, SceneEvent};
use crate::slice_layer::{LayerOutput, SliceLayer};
use crate::slice_link::SliceActions;
use crate::slice_node::{SliceInteraction, SliceNode, SliceViewState};
use crate::timestamp::TimeStamp;
use crate::transform::XyToIjk;
use crate::volume::VolumeNode;

const DEFAULT_UVW_DIMENSION: u32 = 200;
/// Largest angle between the slice normal and a voxel axis that still
/// counts as aligned.
const AXIS_ALIGNMENT_DEGREES: f64 = 0.1;

/// Samples needed to cover `extent` at `spacing`, at most `max`.
fn samples_along(extent: f64, spacing: f64, max: u32) -> u32 {
    let steps = (extent / spacing).clamp(0.0, f64::from(max));
    (steps as u32).saturating_add(1).min(max)
}

/// Slider range for the slice offset, in millimetres along the normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceOffsetRange {
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

/// Where a slice offset falls in the lowest volume's voxel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceIndex {
    /// 1-based index along the voxel axis parallel to the normal
    Index(u32),
    /// No voxel axis is parallel to the slice normal
    Rotated,
    OutOfVolume,
    NoVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorEvent {
    Modified,
    /// Add or Subtract was requested without both inputs
    BlendModeDowngraded {
        requested: BlendMode,
        effective: BlendMode,
    },
}

/// The textured plane shown in 3D views.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicePlane {
    /// RAS corners of the pixel rectangle `(0, 0)`, `(w, 0)`, `(0, h)`, `(w, h)`
    pub corners: [DVec3; 4],
    pub interpolate_texture: bool,
    pub visible: bool,
}

impl Default for SlicePlane {
    fn default() -> Self {
        Self {
            corners: [DVec3::ZERO; 4],
            interpolate_texture: true,
            visible: false,
        }
    }
}

impl SlicePlane {
    /// Interleaved `x, y, z, u, v` vertices in corner order.
    pub fn vertices(&self) -> [[f32; 5]; 4] {
        const UV: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let mut vertices = [[0.0; 5]; 4];
        for (vertex, (corner, uv)) in vertices.iter_mut().zip(self.corners.iter().zip(UV)) {
            *vertex = [corner.x as f32, corner.y as f32, corner.z as f32, uv[0], uv[1]];
        }
        vertices
    }

    /// [`vertices`](SlicePlane::vertices) as raw bytes, ready for upload.
    pub fn vertex_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.vertices()).to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BlendKey {
    outputs: [Option<TimeStamp>; 3],
    composite: TimeStamp,
}

#[derive(Debug, Default)]
struct BlendCache {
    key: Option<BlendKey>,
    image: Option<Rc<RgbaImage>>,
}

#[derive(Debug)]
struct CompositorState {
    blends: [BlendCache; 2],
    plane: SlicePlane,
    requested_mode: BlendMode,
    effective_mode: BlendMode,
    mtime: TimeStamp,
}

#[derive(Debug)]
pub struct SliceCompositor {
    config: Config,
    scene: Weak<Scene>,
    slice: Rc<SliceNode>,
    composite: Rc<CompositeNode>,
    layers: [Rc<SliceLayer>; 3],
    state: RefCell<CompositorState>,
    updating: ReentrancyCounter,
    events: Notifier<CompositorEvent>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl SliceCompositor {
    /// Create the compositor of the view `layout_name`, adding its slice and
    /// composite nodes to the scene if needed.
    pub fn new(scene: &Rc<Scene>, layout_name: &str) -> Rc<Self> {
        let config = scene.config().clone();
        let layers = [0, 1, 2].map(|_| SliceLayer::new(config.clone()));
        layers[LayerKind::Label.index()].set_label_layer(true);
        let compositor = Rc::new(Self {
            slice: scene.add_slice_node(layout_name),
            composite: scene.add_composite_node(layout_name),
            scene: Rc::downgrade(scene),
            config,
            layers,
            state: RefCell::new(CompositorState {
                blends: Default::default(),
                plane: SlicePlane::default(),
                requested_mode: BlendMode::Alpha,
                effective_mode: BlendMode::Alpha,
                mtime: TimeStamp::now(),
            }),
            updating: ReentrancyCounter::new(),
            events: Notifier::new(),
            subscriptions: RefCell::new(Vec::new()),
        });
        compositor.connect(scene);
        compositor.update_pipeline();
        compositor
    }

    fn connect(self: &Rc<Self>, scene: &Scene) {
        let mut subscriptions = Vec::new();
        // Low priority: the layers observing the same nodes update first.
        subscriptions.push(
            self.slice
                .events()
                .subscribe(Priority::Low, Self::on_change(Rc::downgrade(self))),
        );
        subscriptions.push(
            self.composite
                .events()
                .subscribe(Priority::Low, Self::on_change(Rc::downgrade(self))),
        );
        for layer in &self.layers {
            subscriptions.push(
                layer
                    .events()
                    .subscribe(Priority::Low, Self::on_change(Rc::downgrade(self))),
            );
        }
        let weak = Rc::downgrade(self);
        subscriptions.push(scene.events().subscribe(Priority::Low, move |event| {
            if let SceneEvent::NodeAdded(NodeRef::Volume(_)) | SceneEvent::NodeRemoved(NodeRef::Volume(_)) = event {
                if let Some(compositor) = weak.upgrade() {
                    compositor.update_pipeline();
                }
            }
        }));
        *self.subscriptions.borrow_mut() = subscriptions;
    }

    fn on_change(weak: Weak<Self>) -> impl Fn(&NodeEvent) + 'static {
        move |_| {
            if let Some(compositor) = weak.upgrade() {
                compositor.update_pipeline();
            }
        }
    }

    pub fn events(&self) -> &Notifier<CompositorEvent> {
        &self.events
    }

    pub fn slice_node(&self) -> &Rc<SliceNode> {
        &self.slice
    }

    pub fn composite_node(&self) -> &Rc<CompositeNode> {
        &self.composite
    }

    pub fn layer(&self, kind: LayerKind) -> &Rc<SliceLayer> {
        &self.layers[kind.index()]
    }

    pub fn layout_name(&self) -> String {
        self.slice.layout_name()
    }

    pub fn mtime(&self) -> TimeStamp {
        self.state.borrow().mtime
    }

    /// Assign scene volumes to the three layers through the composite node.
    pub fn set_layers(
        &self,
        background: Option<&Rc<VolumeNode>>,
        foreground: Option<&Rc<VolumeNode>>,
        label: Option<&Rc<VolumeNode>>,
    ) {
        let volumes = [background, foreground, label];
        self.composite.modify(|c| {
            for kind in LayerKind::ALL {
                c.set_volume_id(kind, volumes[kind.index()].map(|v| v.id()));
            }
        });
        self.update_pipeline();
    }

    fn bind_layers(&self, volumes: [Option<&Rc<VolumeNode>>; 3]) -> bool {
        let mut rebound = false;
        for kind in LayerKind::ALL {
            let layer = &self.layers[kind.index()];
            let volume = volumes[kind.index()];
            if !layer.is_bound_to(volume) || layer.slice_node().is_none() {
                layer.bind(volume, Some(&self.slice));
                rebound = true;
            }
        }
        rebound
    }

    /// Rebind layers from the composite node and reblend whatever changed.
    ///
    /// Emits [`CompositorEvent::Modified`] only if a layer output, a
    /// compositing parameter or the plane geometry changed.
    pub fn update_pipeline(&self) {
        let Some(_guard) = self.updating.try_enter() else {
            return;
        };

        let composite = self.composite.snapshot();
        let scene = self.scene.upgrade();
        let volumes: [Option<Rc<VolumeNode>>; 3] = LayerKind::ALL.map(|kind| {
            let id = composite.volume_id(kind)?;
            scene.as_ref()?.volume(id)
        });
        let rebound = self.bind_layers([volumes[0].as_ref(), volumes[1].as_ref(), volumes[2].as_ref()]);
        if rebound {
            debug!(view = %self.layout_name(), "layers rebound");
            self.set_slice_extents_to_slice_node();
        }

        let outputs: [[Option<Rc<LayerOutput>>; 3]; 2] =
            Resolution::ALL.map(|resolution| self.layers.each_ref().map(|layer| layer.output(resolution)));
        let requested = composite.compositing;
        let effective = blend::effective_mode(
            requested,
            outputs[0][LayerKind::Background.index()].is_some(),
            outputs[0][LayerKind::Foreground.index()].is_some(),
        );
        let slice = self.slice.snapshot();
        let plane = self.compute_plane(&slice, outputs[0][LayerKind::Label.index()].is_some());

        let (modified, downgraded) = {
            let mut state = self.state.borrow_mut();
            let mut modified = false;
            for resolution in Resolution::ALL {
                let outputs = &outputs[resolution.index()];
                let key = BlendKey {
                    outputs: outputs.each_ref().map(|o| o.as_ref().map(|o| o.mtime)),
                    composite: self.composite.mtime(),
                };
                let cache = &mut state.blends[resolution.index()];
                if cache.key == Some(key) {
                    continue;
                }
                let input = |kind: LayerKind| {
                    outputs[kind.index()].as_ref().map(|output| BlendInput {
                        image: &output.image,
                        opacity: composite.opacity(kind),
                    })
                };
                cache.image = blend::composite(
                    requested,
                    input(LayerKind::Background),
                    input(LayerKind::Foreground),
                    input(LayerKind::Label),
                    composite.clip_to_background_volume,
                )
                .map(Rc::new);
                cache.key = Some(key);
                modified = true;
            }
            if state.plane != plane {
                state.plane = plane;
                modified = true;
            }
            let modes_changed = (requested, effective) != (state.requested_mode, state.effective_mode);
            let downgraded = modes_changed && effective != requested;
            state.requested_mode = requested;
            state.effective_mode = effective;
            if modified {
                state.mtime = TimeStamp::now();
            }
            (modified, downgraded)
        };

        if downgraded {
            debug!(view = %self.layout_name(), ?requested, "blend mode needs two inputs, using alpha");
            self.events.emit(CompositorEvent::BlendModeDowngraded { requested, effective });
        }
        if modified {
            self.events.emit(CompositorEvent::Modified);
        }
    }

    /// The blend mode used by the last update.
    pub fn effective_blend_mode(&self) -> BlendMode {
        self.state.borrow().effective_mode
    }

    pub fn composited_image(&self, resolution: Resolution) -> Option<Rc<RgbaImage>> {
        self.state.borrow().blends[resolution.index()].image.clone()
    }

    /// Texture for the 3D plane: the UVW blend, or the active XY frame when
    /// the texture follows the 2D view.
    pub fn composited_texture(&self) -> Option<RgbaImage> {
        let slice = self.slice.state();
        match slice.resolution_mode() {
            ResolutionMode::Match2DView => {
                let image = self.composited_image(Resolution::Xy)?;
                let [width, height, depth] = slice.dimensions();
                let frame = slice.active_slice.min(depth.saturating_sub(1));
                Some(imageops::crop_imm(&*image, 0, frame * height, width, height).to_image())
            }
            _ => self.composited_image(Resolution::Uvw).map(|image| (*image).clone()),
        }
    }

    pub fn slice_plane(&self) -> SlicePlane {
        self.state.borrow().plane.clone()
    }

    fn compute_plane(&self, slice: &SliceViewState, has_label: bool) -> SlicePlane {
        let (matrix, [width, height, _], z) = match slice.resolution_mode() {
            ResolutionMode::Match2DView => (slice.xy_to_ras(), slice.dimensions(), slice.active_slice as f64),
            _ => (slice.uvw_to_ras(), slice.uvw_dimensions(), 0.0),
        };
        let (w, h) = (width as f64, height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .map(|(x, y)| matrix.transform_point3(DVec3::new(x, y, z)));
        SlicePlane {
            corners,
            interpolate_texture: !has_label,
            visible: slice.slice_visible,
        }
    }

    fn bound_volumes(&self) -> Vec<Rc<VolumeNode>> {
        self.layers.iter().filter_map(|layer| layer.volume()).collect()
    }

    /// The first bound volume that has voxels, in layer order.
    fn lowest_volume(&self) -> Option<Rc<VolumeNode>> {
        self.bound_volumes()
            .into_iter()
            .find(|volume| volume.borrow().image().is_some())
    }

    /// Bounding box of one volume's voxel grid after `ras_to_frame`.
    ///
    /// The box runs through the outer voxel faces, or through the outer
    /// voxel centers when `voxel_centers` is set.
    fn volume_bounds_in(volume: &VolumeNode, ras_to_frame: &DMat4, voxel_centers: bool) -> Option<(DVec3, DVec3)> {
        let volume = volume.borrow();
        let (depth, height, width) = volume.dim()?;
        let ijk_to_frame = *ras_to_frame * volume.ijk_to_world();
        let margin = if voxel_centers { 0.0 } else { 0.5 };
        let lo = DVec3::splat(-margin);
        let hi = DVec3::new(width as f64, height as f64, depth as f64) - (1.0 - margin);
        let mut bounds: Option<(DVec3, DVec3)> = None;
        for corner in 0..8 {
            let ijk = DVec3::new(
                if corner & 1 == 0 { lo.x } else { hi.x },
                if corner & 2 == 0 { lo.y } else { hi.y },
                if corner & 4 == 0 { lo.z } else { hi.z },
            );
            let point = ijk_to_frame.transform_point3(ijk);
            bounds = Some(match bounds {
                None => (point, point),
                Some((min, max)) => (min.min(point), max.max(point)),
            });
        }
        bounds
    }

    fn volumes_slice_bounds(&self, volumes: &[Rc<VolumeNode>]) -> Option<(DVec3, DVec3)> {
        let slice_to_ras = self.slice.state().slice_to_ras;
        if slice_to_ras.determinant().abs() < f64::EPSILON {
            return None;
        }
        let ras_to_slice = slice_to_ras.inverse();
        volumes
            .iter()
            .filter_map(|volume| Self::volume_bounds_in(volume, &ras_to_slice, false))
            .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
    }

    /// Union of the bound volumes' extents in slice coordinates.
    pub fn slice_bounds(&self) -> Option<(DVec3, DVec3)> {
        self.volumes_slice_bounds(&self.bound_volumes())
    }

    /// Extent of the lowest volume in the frame slice offsets are measured
    /// in: slice axes around the RAS origin.
    fn lowest_volume_offset_bounds(&self, voxel_centers: bool) -> Option<(DVec3, DVec3)> {
        let rotation = self.slice.state().rotation();
        if rotation.determinant().abs() < f64::EPSILON {
            return None;
        }
        let ras_to_rotated = DMat4::from_mat3(rotation.inverse());
        Self::volume_bounds_in(&*self.lowest_volume()?, &ras_to_rotated, voxel_centers)
    }

    fn volume_slice_spacing(volume: &VolumeNode, slice: &SliceViewState) -> DVec3 {
        if slice.slice_spacing_mode == SliceSpacingMode::Prescribed {
            return slice.prescribed_spacing;
        }
        let ijk_to_world = volume.borrow().ijk_to_world();
        if ijk_to_world.determinant().abs() < f64::EPSILON {
            return DVec3::ONE;
        }
        let world_to_ijk = DMat3::from_mat4(ijk_to_world.inverse());
        let rotation = slice.rotation();
        let spacing = |axis: usize| {
            let steps = (world_to_ijk * rotation.col(axis).normalize_or_zero()).length();
            if steps > 0.0 { 1.0 / steps } else { 1.0 }
        };
        DVec3::new(spacing(0), spacing(1), spacing(2))
    }

    /// Voxel spacing of the first bound volume measured along the slice
    /// axes, or the prescribed spacing.
    pub fn lowest_volume_slice_spacing(&self) -> DVec3 {
        let slice = self.slice.snapshot();
        if slice.slice_spacing_mode == SliceSpacingMode::Prescribed {
            return slice.prescribed_spacing;
        }
        match self.lowest_volume() {
            Some(volume) => Self::volume_slice_spacing(&volume, &slice),
            None => DVec3::ONE,
        }
    }

    /// Range a slice offset slider should cover, and its step.
    ///
    /// The range spans the outer voxel centers of the lowest volume along the
    /// normal. A volume thinner than one step gets one blank step on either
    /// side so its only slice sits in the middle.
    pub fn slice_offset_range_resolution(&self) -> Option<SliceOffsetRange> {
        let (min, max) = self.lowest_volume_offset_bounds(true)?;
        let resolution = self.lowest_volume_slice_spacing().z;
        if max.z - min.z < resolution {
            let center = 0.5 * (min.z + max.z);
            return Some(SliceOffsetRange {
                min: center - resolution,
                max: center + resolution,
                resolution,
            });
        }
        Some(SliceOffsetRange {
            min: min.z,
            max: max.z,
            resolution,
        })
    }

    /// Move the slice offset to the center of the voxel slab it lies in.
    pub fn snap_slice_offset_to_ijk(&self) {
        let Some((min, _)) = self.lowest_volume_offset_bounds(false) else {
            return;
        };
        let spacing = self.lowest_volume_slice_spacing().z;
        if spacing <= 0.0 {
            return;
        }
        let slab = ((self.slice_offset() - min.z) / spacing).floor();
        self.set_slice_offset((slab + 0.5) * spacing + min.z);
    }

    /// 1-based index of the voxel slice of the lowest volume shown at
    /// `offset`.
    pub fn slice_index_from_offset(&self, offset: f64) -> SliceIndex {
        let Some(volume) = self.lowest_volume() else {
            return SliceIndex::NoVolume;
        };
        let volume = volume.borrow();
        let Some((depth, height, width)) = volume.dim() else {
            return SliceIndex::NoVolume;
        };
        let ijk_to_world = volume.ijk_to_world();
        let rotation = self.slice.state().rotation();
        if rotation.determinant().abs() < f64::EPSILON {
            return SliceIndex::Rotated;
        }
        let normal = rotation.col(2).normalize_or_zero();
        let aligned = (0..3).find_map(|axis| {
            let direction = ijk_to_world.col(axis).truncate();
            let spacing = direction.length();
            let misalignment = normal
                .dot(direction.normalize_or_zero())
                .clamp(-1.0, 1.0)
                .acos()
                .to_degrees();
            if misalignment < AXIS_ALIGNMENT_DEGREES {
                Some((axis, spacing))
            } else if (misalignment - 180.0).abs() < AXIS_ALIGNMENT_DEGREES {
                Some((axis, -spacing))
            } else {
                None
            }
        });
        let Some((axis, spacing)) = aligned else {
            return SliceIndex::Rotated;
        };

        let origin = (rotation.inverse() * ijk_to_world.w_axis.truncate()).z;
        let index = ((offset - origin) / spacing).round() as i64 + 1;
        let count = [width, height, depth][axis] as i64;
        if (1..=count).contains(&index) {
            SliceIndex::Index(index as u32)
        } else {
            SliceIndex::OutOfVolume
        }
    }

    /// Update the UVW grid of the slice node for its resolution mode.
    pub fn set_slice_extents_to_slice_node(&self) {
        let slice = self.slice.snapshot();
        let fov = slice.field_of_view();
        let extent = self.slice_bounds().map(|(min, max)| max - min).unwrap_or(fov);
        let min_spacing = self.lowest_volume_slice_spacing().min_element();
        let max_dimensions = slice.uvw_max_dimensions();

        let (extents, dimensions) = match slice.resolution_mode() {
            ResolutionMode::Custom => return,
            ResolutionMode::Match2DView => (fov, slice.dimensions()),
            ResolutionMode::MatchVolumes => {
                let max_extent = extent.x.max(extent.y);
                let dim = if min_spacing > 0.0 {
                    (max_extent / min_spacing).round().max(1.0) as u32
                } else {
                    DEFAULT_UVW_DIMENSION
                };
                (DVec3::new(max_extent, max_extent, extent.z), [dim, dim, 1])
            }
            ResolutionMode::FovMatch2DViewSpacingMatchVolumes => {
                let dim = |axis: usize| {
                    if min_spacing > 0.0 {
                        (fov[axis] / min_spacing + 0.5).ceil() as u32
                    } else {
                        DEFAULT_UVW_DIMENSION
                    }
                };
                (fov, [dim(0), dim(1), 1])
            }
            ResolutionMode::FovMatchVolumesSpacingMatch2DView => {
                let dims = slice.dimensions();
                let dim = |axis: usize| {
                    let spacing = fov[axis] / dims[axis].max(1) as f64;
                    if spacing > 0.0 {
                        samples_along(extent[axis], spacing, max_dimensions[axis])
                    } else {
                        DEFAULT_UVW_DIMENSION
                    }
                };
                (extent, [dim(0), dim(1), 1])
            }
        };
        self.slice
            .modify(|s| s.set_uvw_extents_and_dimensions(extents, dimensions));
    }

    /// Zoom and center the view so every bound volume is visible in a
    /// `width × height` pixel viewport.
    pub fn fit_slice_to_all(&self, width: u32, height: u32) {
        self.fit_slice_to_volumes(&self.bound_volumes(), width, height);
    }

    pub fn fit_slice_to_volume(&self, volume: &Rc<VolumeNode>, width: u32, height: u32) {
        self.fit_slice_to_volumes(std::slice::from_ref(volume), width, height);
    }

    /// Fit to the lowest volume when the view is clipped to the background,
    /// to all bound volumes otherwise.
    pub fn fit_slice_to_background(&self, width: u32, height: u32) {
        if self.composite.state().clip_to_background_volume {
            if let Some(volume) = self.lowest_volume() {
                self.fit_slice_to_volume(&volume, width, height);
            }
        } else {
            self.fit_slice_to_all(width, height);
        }
    }

    fn fit_slice_to_volumes(&self, volumes: &[Rc<VolumeNode>], width: u32, height: u32) {
        let Some((min, max)) = self.volumes_slice_bounds(volumes) else {
            return;
        };
        let extent = max - min;
        let center = 0.5 * (min + max);
        let (width, height) = (width.max(1), height.max(1));
        let aspect = height as f64 / width as f64;
        let (mut fov_x, mut fov_y) = (extent.x, extent.y);
        if fov_y < fov_x * aspect {
            fov_y = fov_x * aspect;
        } else {
            fov_x = fov_y / aspect;
        }
        let slice = self.slice.snapshot();
        let spacing = volumes
            .iter()
            .find(|volume| volume.borrow().image().is_some())
            .map_or(DVec3::ONE, |volume| Self::volume_slice_spacing(volume, &slice));

        {
            let _batch = self.slice.begin_update();
            self.slice.modify(|s| {
                let depth = s.dimensions()[2];
                let center_ras = s.slice_to_ras.transform_point3(center);
                s.set_field_of_view(DVec3::new(fov_x, fov_y, spacing.z * depth as f64));
                s.set_dimensions([width, height, depth]);
                s.slice_to_ras.w_axis = center_ras.extend(1.0);
                s.set_xyz_origin(DVec3::ZERO);
            });
            self.set_slice_extents_to_slice_node();
        }
    }

    /// Give the smaller viewport side a field of view of `fov` millimetres,
    /// keeping square pixels and the slab thickness. Needs a background
    /// volume with voxels.
    pub fn fit_fov_to_background(&self, fov: f64) {
        let Some(background) = self.layers[LayerKind::Background.index()].volume() else {
            return;
        };
        if background.borrow().image().is_none() {
            return;
        }
        self.slice.modify(|s| {
            let [width, height, _] = s.dimensions();
            let (width, height) = (width as f64, height as f64);
            let depth = s.field_of_view().z;
            let fov = if width < height {
                DVec3::new(fov, fov * height / width, depth)
            } else {
                DVec3::new(fov * width / height, fov, depth)
            };
            s.set_field_of_view(fov);
        });
    }

    /// Adapt dimensions to a new viewport, keeping pixels square and the
    /// extent along the less-resized axis unchanged.
    pub fn resize_slice_node(&self, width: u32, height: u32) {
        let (rows, columns) = self.slice.state().layout_grid;
        let width = (width / columns.max(1)).max(1);
        let height = (height / rows.max(1)).max(1);

        let _batch = self.slice.begin_update();
        self.slice.modify(|s| {
            let [old_width, old_height, depth] = s.dimensions();
            let old_fov = s.field_of_view();
            let scale_x = width as f64 / old_width as f64;
            let scale_y = height as f64 / old_height as f64;
            let magnitude = |scale: f64| if scale >= 1.0 { scale } else { 1.0 / scale };
            let fov = if magnitude(scale_x) < magnitude(scale_y) {
                DVec3::new(old_fov.x, old_fov.x * height as f64 / width as f64, old_fov.z)
            } else {
                DVec3::new(old_fov.y * width as f64 / height as f64, old_fov.y, old_fov.z)
            };
            s.set_field_of_view(fov);
            s.set_dimensions([width, height, depth]);
        });
        self.set_slice_extents_to_slice_node();
    }

    pub fn slice_offset(&self) -> f64 {
        self.slice.state().slice_offset()
    }

    pub fn set_slice_offset(&self, offset: f64) {
        self.slice.modify(|s| s.set_slice_offset(offset));
    }

    /// Align the slice with the voxel axes of the background volume.
    pub fn rotate_to_background_volume_plane(&self) {
        let Some(volume) = self.layers[LayerKind::Background.index()].volume() else {
            return;
        };
        let ijk_to_world = volume.borrow().ijk_to_world();
        self.slice.modify(|s| s.rotate_to_volume_plane(&ijk_to_world));
    }

    /// Begin a user interaction on the slice node. Linked views follow only
    /// for hot-linked controls, or for reformat with any linked control.
    pub fn start_slice_node_interaction(&self, flags: SliceInteraction) {
        let (linked, hot_linked) = self.link_mode();
        self.slice.set_interaction_flags(flags);
        if (hot_linked || flags == SliceInteraction::MULTIPLANAR_REFORMAT) && linked {
            self.slice.set_interacting(true);
        }
    }

    /// End the interaction, pushing the final state to linked views.
    pub fn end_slice_node_interaction(&self) {
        let (linked, _) = self.link_mode();
        if linked {
            self.slice.set_interacting(true);
            self.slice.touch();
            self.slice.set_interacting(false);
        }
        self.slice.set_interaction_flags(SliceInteraction::empty());
    }

    /// Begin dragging the slice offset.
    pub fn start_slice_offset_interaction(&self) {
        self.start_slice_node_interaction(SliceInteraction::SLICE_TO_RAS);
    }

    pub fn end_slice_offset_interaction(&self) {
        self.end_slice_node_interaction();
    }

    /// Whether `ras` (world coordinates) lies inside the voxel grid of the
    /// background or foreground volume, including the half voxel border.
    pub fn is_event_inside_volume(&self, background: bool, ras: DVec3) -> bool {
        let kind = if background { LayerKind::Background } else { LayerKind::Foreground };
        let Some(volume) = self.layers[kind.index()].volume() else {
            return false;
        };
        let volume = volume.borrow();
        let Some((depth, height, width)) = volume.dim() else {
            return false;
        };
        let Ok(ras_to_ijk) = volume.ras_to_ijk() else {
            return false;
        };
        let world_to_ijk = match XyToIjk::compose(DMat4::IDENTITY, volume.parent_transform(), ras_to_ijk, 0.0) {
            Ok(chain) => chain,
            Err(e) => {
                debug!(volume = %volume.id, "cannot map event into volume: {}", e);
                return false;
            }
        };
        let ijk = world_to_ijk.map(ras);
        let upper = DVec3::new(width as f64, height as f64, depth as f64) - 0.5;
        ijk.cmpge(DVec3::splat(-0.5)).all() && ijk.cmple(upper).all()
    }

    pub fn start_composite_interaction(&self, flags: CompositeInteraction) {
        let (linked, hot_linked) = self.link_mode();
        self.composite.set_interaction_flags(flags);
        if hot_linked && linked {
            self.composite.set_interacting(true);
        }
    }

    pub fn end_composite_interaction(&self) {
        let (linked, _) = self.link_mode();
        if linked {
            self.composite.set_interacting(true);
            self.composite.touch();
            self.composite.set_interacting(false);
        }
        self.composite.set_interaction_flags(CompositeInteraction::empty());
    }

    fn link_mode(&self) -> (bool, bool) {
        let composite = self.composite.state();
        (composite.linked_control, composite.hot_linked_control)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Looks up compositors by layout name to serve link broadcast actions.
#[derive(Debug, Default)]
pub struct CompositorRegistry {
    compositors: RefCell<Vec<Weak<SliceCompositor>>>,
}

impl CompositorRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn register(&self, compositor: &Rc<SliceCompositor>) {
        let mut compositors = self.compositors.borrow_mut();
        compositors.retain(|weak| weak.strong_count() > 0);
        compositors.push(Rc::downgrade(compositor));
    }

    pub fn compositor(&self, layout_name: &str) -> Option<Rc<SliceCompositor>> {
        self.compositors
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|compositor| compositor.layout_name() == layout_name)
    }
}

impl SliceActions for CompositorRegistry {
    fn fit_slice_to_all(&self, slice: &SliceNode) {
        if let Some(compositor) = self.compositor(&slice.layout_name()) {
            let [width, height, _] = slice.state().dimensions();
            compositor.fit_slice_to_all(width, height);
        }
    }

    fn rotate_to_background_volume_plane(&self, slice: &SliceNode) {
        if let Some(compositor) = self.compositor(&slice.layout_name()) {
            compositor.rotate_to_background_volume_plane();
        }
    }
}
