//! Geometry of one 2D slice view.
//!
//! `SliceToRAS` places the slice plane in patient space: its columns are the
//! screen x axis, screen y axis and plane normal, its translation the plane
//! center. From it and the view parameters two pixel grids are derived:
//!
//!  - XY: on-screen pixels, `XYToRAS = SliceToRAS · XYToSlice`
//!  - UVW: a fixed texture grid, `UVWToRAS = SliceToRAS · UVWToSlice`

use std::rc::Rc;

use bitflags::bitflags;
use glam::{DMat3, DMat4, DVec3, DVec4};

use crate::config::Config;
use crate::enums::{JumpMode, Orientation, ResolutionMode, SliceSpacingMode};
use crate::node::{Node, NodeState};

bitflags! {
    /// Which slice properties a linked interaction propagates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SliceInteraction: u32 {
        const SLICE_TO_RAS = 1;
        const FIELD_OF_VIEW = 2;
        const ORIENTATION = 4;
        const RESET_FIELD_OF_VIEW = 8;
        const MULTIPLANAR_REFORMAT = 16;
        const XYZ_ORIGIN = 32;
        const LABEL_OUTLINE = 64;
        const SLICE_VISIBLE = 128;
        const SLICE_SPACING = 256;
        const RESET_ORIENTATION = 512;
        const ROTATE_TO_BACKGROUND_VOLUME_PLANE = 1024;
    }
}

const PRESET_TOLERANCE: f64 = 1e-3;
const OFFSET_EPSILON: f64 = 1e-6;

/// Rotation block of a named orientation. `Reformat` has none.
pub fn orientation_preset(orientation: Orientation, patient_right_is_screen_left: bool) -> Option<DMat3> {
    let lr = if patient_right_is_screen_left { -1.0 } else { 1.0 };
    match orientation {
        Orientation::Axial => Some(DMat3::from_cols(
            DVec3::new(lr, 0.0, 0.0),
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
        )),
        Orientation::Sagittal => Some(DMat3::from_cols(
            DVec3::new(0.0, -1.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
            DVec3::new(-1.0, 0.0, 0.0),
        )),
        Orientation::Coronal => Some(DMat3::from_cols(
            DVec3::new(lr, 0.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
            DVec3::new(0.0, 1.0, 0.0),
        )),
        Orientation::Reformat => None,
    }
}

/// Whether the normalised columns of two rotation blocks agree component
/// by component within `tolerance`.
pub fn rotations_match(a: &DMat3, b: &DMat3, tolerance: f64) -> bool {
    (0..3).all(|i| {
        a.col(i)
            .normalize_or_zero()
            .abs_diff_eq(b.col(i).normalize_or_zero(), tolerance)
    })
}

fn rotation_of(matrix: &DMat4) -> DMat3 {
    DMat3::from_mat4(*matrix)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceViewState {
    pub layout_name: String,
    pub view_group: i32,
    pub slice_to_ras: DMat4,
    field_of_view: DVec3,
    dimensions: [u32; 3],
    xyz_origin: DVec3,
    uvw_extents: DVec3,
    uvw_dimensions: [u32; 3],
    uvw_max_dimensions: [u32; 3],
    uvw_origin: DVec3,
    pub active_slice: u32,
    resolution_mode: ResolutionMode,
    orientation: Orientation,
    pub default_orientation: Orientation,
    pub patient_right_is_screen_left: bool,
    pub slice_visible: bool,
    pub use_label_outline: bool,
    pub slice_spacing_mode: SliceSpacingMode,
    pub prescribed_spacing: DVec3,
    pub jump_mode: JumpMode,
    /// Lightbox layout as `(rows, columns)`
    pub layout_grid: (u32, u32),
    pub interacting: bool,
    pub interaction_flags: SliceInteraction,
    pub interaction_flags_modifier: SliceInteraction,
    xy_to_slice: DMat4,
    xy_to_ras: DMat4,
    uvw_to_slice: DMat4,
    uvw_to_ras: DMat4,
}

impl SliceViewState {
    pub fn new(layout_name: impl Into<String>, config: &Config) -> Self {
        let field_of_view = DVec3::from_array(config.default_field_of_view);
        let default_orientation = Orientation::Axial;
        let rotation = orientation_preset(default_orientation, config.patient_right_is_screen_left)
            .unwrap_or(DMat3::IDENTITY);
        let mut state = Self {
            layout_name: layout_name.into(),
            view_group: 0,
            slice_to_ras: DMat4::from_mat3(rotation),
            field_of_view,
            dimensions: [256, 256, 1],
            xyz_origin: DVec3::ZERO,
            uvw_extents: field_of_view,
            uvw_dimensions: [256, 256, 1],
            uvw_max_dimensions: config.uvw_max_dimensions,
            uvw_origin: DVec3::ZERO,
            active_slice: 0,
            resolution_mode: ResolutionMode::default(),
            orientation: default_orientation,
            default_orientation,
            patient_right_is_screen_left: config.patient_right_is_screen_left,
            slice_visible: false,
            use_label_outline: false,
            slice_spacing_mode: SliceSpacingMode::Automatic,
            prescribed_spacing: DVec3::ONE,
            jump_mode: JumpMode::default(),
            layout_grid: (1, 1),
            interacting: false,
            interaction_flags: SliceInteraction::empty(),
            interaction_flags_modifier: SliceInteraction::all(),
            xy_to_slice: DMat4::IDENTITY,
            xy_to_ras: DMat4::IDENTITY,
            uvw_to_slice: DMat4::IDENTITY,
            uvw_to_ras: DMat4::IDENTITY,
        };
        state.update_matrices();
        state
    }

    pub fn field_of_view(&self) -> DVec3 {
        self.field_of_view
    }

    pub fn set_field_of_view(&mut self, field_of_view: DVec3) {
        self.field_of_view = field_of_view;
    }

    pub fn dimensions(&self) -> [u32; 3] {
        self.dimensions
    }

    pub fn set_dimensions(&mut self, dimensions: [u32; 3]) {
        self.dimensions = dimensions.map(|d| d.max(1));
        self.active_slice = self.active_slice.min(self.dimensions[2] - 1);
    }

    pub fn xyz_origin(&self) -> DVec3 {
        self.xyz_origin
    }

    /// Pan inside the view. The texture grid follows unless it is pinned to
    /// the volumes.
    pub fn set_xyz_origin(&mut self, origin: DVec3) {
        self.xyz_origin = origin;
        if self.resolution_mode != ResolutionMode::MatchVolumes {
            self.uvw_origin = origin;
        }
    }

    pub fn uvw_extents(&self) -> DVec3 {
        self.uvw_extents
    }

    pub fn uvw_dimensions(&self) -> [u32; 3] {
        self.uvw_dimensions
    }

    pub fn uvw_max_dimensions(&self) -> [u32; 3] {
        self.uvw_max_dimensions
    }

    pub fn uvw_origin(&self) -> DVec3 {
        self.uvw_origin
    }

    pub fn set_uvw_max_dimensions(&mut self, max: [u32; 3]) {
        self.uvw_max_dimensions = max.map(|d| d.max(1));
        let (extents, dimensions) = (self.uvw_extents, self.uvw_dimensions);
        self.set_uvw_extents_and_dimensions(extents, dimensions);
    }

    /// Dimensions are clamped to `[1, uvw_max_dimensions]`.
    pub fn set_uvw_extents_and_dimensions(&mut self, extents: DVec3, dimensions: [u32; 3]) {
        self.uvw_extents = extents;
        for (axis, dim) in dimensions.iter().enumerate() {
            self.uvw_dimensions[axis] = (*dim).clamp(1, self.uvw_max_dimensions[axis]);
        }
    }

    pub fn resolution_mode(&self) -> ResolutionMode {
        self.resolution_mode
    }

    pub fn set_resolution_mode(&mut self, mode: ResolutionMode) {
        self.resolution_mode = mode;
        self.uvw_origin = match mode {
            ResolutionMode::MatchVolumes => DVec3::ZERO,
            _ => self.xyz_origin,
        };
    }

    pub fn xy_to_slice(&self) -> DMat4 {
        self.xy_to_slice
    }

    pub fn xy_to_ras(&self) -> DMat4 {
        self.xy_to_ras
    }

    pub fn uvw_to_slice(&self) -> DMat4 {
        self.uvw_to_slice
    }

    pub fn uvw_to_ras(&self) -> DMat4 {
        self.uvw_to_ras
    }

    /// Name of the current orientation, `Reformat` unless the rotation
    /// matches a preset.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn rotation(&self) -> DMat3 {
        rotation_of(&self.slice_to_ras)
    }

    /// Unit plane normal in RAS.
    pub fn normal(&self) -> DVec3 {
        self.slice_to_ras.z_axis.truncate().normalize_or_zero()
    }

    pub fn center(&self) -> DVec3 {
        self.slice_to_ras.w_axis.truncate()
    }

    /// Replace the rotation block, keeping the plane center.
    pub fn set_rotation(&mut self, rotation: DMat3) {
        self.slice_to_ras.x_axis = rotation.x_axis.extend(0.0);
        self.slice_to_ras.y_axis = rotation.y_axis.extend(0.0);
        self.slice_to_ras.z_axis = rotation.z_axis.extend(0.0);
    }

    /// Switch to a named orientation. Returns `false` for `Reformat`, which
    /// has no preset.
    pub fn set_orientation(&mut self, orientation: Orientation) -> bool {
        match orientation_preset(orientation, self.patient_right_is_screen_left) {
            Some(rotation) => {
                self.set_rotation(rotation);
                true
            }
            None => false,
        }
    }

    pub fn reset_orientation(&mut self) -> bool {
        self.set_orientation(self.default_orientation)
    }

    /// Rotate the plane about its own center so that `from` maps to `to`.
    pub fn rotate_normal(&mut self, from: DVec3, to: DVec3) {
        let (from, to) = (from.normalize_or_zero(), to.normalize_or_zero());
        if from == DVec3::ZERO || to == DVec3::ZERO {
            return;
        }
        let axis = from.cross(to);
        let rotation = if axis.length() >= 1e-12 {
            DMat3::from_axis_angle(axis.normalize(), from.dot(to).clamp(-1.0, 1.0).acos())
        } else if from.dot(to) < 0.0 {
            // Flipped normal: any axis perpendicular to it will do.
            DMat3::from_axis_angle(from.any_orthonormal_vector(), std::f64::consts::PI)
        } else {
            return;
        };
        self.set_rotation(rotation * self.rotation());
    }

    /// Align the slice axes with the closest voxel axes of a volume.
    ///
    /// The normal is matched first, then screen x and screen y, each to the
    /// unused voxel axis with the largest absolute cosine. Signs follow the
    /// current axes so the view does not flip.
    pub fn rotate_to_volume_plane(&mut self, ijk_to_ras: &DMat4) {
        let volume = rotation_of(ijk_to_ras);
        let directions = [0, 1, 2].map(|i| volume.col(i).normalize_or_zero());
        let current = self.rotation();
        let mut used = [false; 3];
        let mut columns = [DVec3::ZERO; 3];
        for axis in [2, 0, 1] {
            let target = current.col(axis).normalize_or_zero();
            let best = (0..3)
                .filter(|v| !used[*v])
                .max_by(|a, b| {
                    directions[*a]
                        .dot(target)
                        .abs()
                        .total_cmp(&directions[*b].dot(target).abs())
                });
            let Some(best) = best else {
                return;
            };
            used[best] = true;
            let sign = if directions[best].dot(target) < 0.0 { -1.0 } else { 1.0 };
            columns[axis] = directions[best] * sign;
        }
        self.set_rotation(DMat3::from_cols(columns[0], columns[1], columns[2]));
    }

    /// Position of the plane along its normal, in slice coordinates.
    pub fn slice_offset(&self) -> f64 {
        let rotation = self.rotation();
        if rotation.determinant().abs() < f64::EPSILON {
            return 0.0;
        }
        (rotation.inverse() * self.center()).z
    }

    pub fn set_slice_offset(&mut self, offset: f64) {
        let rotation = self.rotation();
        if rotation.determinant().abs() < f64::EPSILON {
            return;
        }
        let mut local = rotation.inverse() * self.center();
        if (local.z - offset).abs() <= OFFSET_EPSILON {
            return;
        }
        local.z = offset;
        self.slice_to_ras.w_axis = (rotation * local).extend(1.0);
    }

    /// Distance between consecutive slices along the normal.
    pub fn slice_spacing(&self) -> f64 {
        match self.slice_spacing_mode {
            SliceSpacingMode::Prescribed => self.prescribed_spacing.z,
            SliceSpacingMode::Automatic => self.xy_to_ras.z_axis.truncate().length(),
        }
    }

    pub fn jump_slice(&mut self, ras: DVec3) {
        match self.jump_mode {
            JumpMode::Centered => self.jump_slice_by_centering(ras),
            JumpMode::Offset => self.jump_slice_by_offsetting(ras),
        }
    }

    /// Move the plane center onto `ras`.
    pub fn jump_slice_by_centering(&mut self, ras: DVec3) {
        let offset = self.active_slice as f64 * self.slice_spacing();
        self.slice_to_ras.w_axis = (ras - self.normal() * offset).extend(1.0);
    }

    /// Move the plane along its normal until it contains `ras`.
    pub fn jump_slice_by_offsetting(&mut self, ras: DVec3) {
        let normal = self.normal();
        let distance = (ras - self.center()).dot(normal) - self.active_slice as f64 * self.slice_spacing();
        self.slice_to_ras.w_axis = (self.center() + normal * distance).extend(1.0);
    }

    /// Recompute XY/UVW mappings and the orientation name.
    pub fn update_matrices(&mut self) {
        let mut xy_to_slice = DMat4::IDENTITY;
        let mut translation = DVec3::ZERO;
        for axis in 0..3 {
            let spacing = self.field_of_view[axis] / self.dimensions[axis].max(1) as f64;
            xy_to_slice.col_mut(axis)[axis] = spacing;
            translation[axis] = -0.5 * self.field_of_view[axis] + self.xyz_origin[axis];
        }
        translation.z = 0.0;
        xy_to_slice.w_axis = translation.extend(1.0);
        self.xy_to_slice = xy_to_slice;
        self.xy_to_ras = self.slice_to_ras * xy_to_slice;

        let mut uvw_to_slice = DMat4::IDENTITY;
        let mut translation = DVec3::ZERO;
        for axis in 0..2 {
            let spacing = self.uvw_extents[axis] / self.uvw_dimensions[axis].max(1) as f64;
            uvw_to_slice.col_mut(axis)[axis] = spacing;
            translation[axis] = -0.5 * self.uvw_extents[axis] + self.uvw_origin[axis];
        }
        uvw_to_slice.w_axis = DVec4::new(translation.x, translation.y, 0.0, 1.0);
        self.uvw_to_slice = uvw_to_slice;
        self.uvw_to_ras = self.slice_to_ras * uvw_to_slice;

        let rotation = self.rotation();
        self.orientation = [Orientation::Axial, Orientation::Sagittal, Orientation::Coronal]
            .into_iter()
            .find(|preset| {
                orientation_preset(*preset, self.patient_right_is_screen_left)
                    .is_some_and(|r| rotations_match(&r, &rotation, PRESET_TOLERANCE))
            })
            .unwrap_or(Orientation::Reformat);
    }
}

impl NodeState for SliceViewState {
    fn layout_name(&self) -> &str {
        &self.layout_name
    }

    fn view_group(&self) -> i32 {
        self.view_group
    }

    fn after_modify(&mut self) {
        self.update_matrices();
    }
}

pub type SliceNode = Node<SliceViewState>;

impl Node<SliceViewState> {
    /// Set the interaction flags without notifying observers.
    pub fn set_interaction_flags(&self, flags: SliceInteraction) {
        self.modify_silently(|s| s.interaction_flags = flags);
    }

    pub fn set_interacting(&self, interacting: bool) {
        self.modify_silently(|s| s.interacting = interacting);
    }

    pub fn is_interacting(&self) -> bool {
        self.state().interacting
    }
}

pub fn new_slice_node(layout_name: &str, config: &Config) -> Rc<SliceNode> {
    Node::new(SliceViewState::new(layout_name, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SliceViewState {
        SliceViewState::new("Red", &Config::default())
    }

    #[test]
    fn test_default_is_axial() {
        let state = state();
        assert_eq!(state.orientation(), Orientation::Axial);
        assert_eq!(state.field_of_view(), DVec3::new(250.0, 250.0, 1.0));
        assert_eq!(state.normal(), DVec3::Z);
    }

    #[test]
    fn test_xy_to_ras_maps_view_center_to_plane_center() {
        let mut state = state();
        state.set_dimensions([200, 100, 1]);
        state.set_field_of_view(DVec3::new(200.0, 100.0, 1.0));
        state.slice_to_ras.w_axis = DVec4::new(10.0, 20.0, 30.0, 1.0);
        state.update_matrices();
        let center = state.xy_to_ras().transform_point3(DVec3::new(100.0, 50.0, 0.0));
        assert!(center.abs_diff_eq(DVec3::new(10.0, 20.0, 30.0), 1e-12));
        // Patient right on screen left: +x on screen goes towards R = -x in RAS.
        let right = state.xy_to_ras().transform_point3(DVec3::new(200.0, 50.0, 0.0));
        assert!(right.abs_diff_eq(DVec3::new(-90.0, 20.0, 30.0), 1e-12));
    }

    #[test]
    fn test_uvw_ignores_depth_spacing() {
        let mut state = state();
        state.set_uvw_extents_and_dimensions(DVec3::new(100.0, 50.0, 80.0), [10, 5, 4]);
        state.update_matrices();
        let uvw = state.uvw_to_slice();
        assert_eq!(uvw.x_axis.x, 10.0);
        assert_eq!(uvw.y_axis.y, 10.0);
        assert_eq!(uvw.z_axis.z, 1.0);
        assert_eq!(uvw.w_axis, DVec4::new(-50.0, -25.0, 0.0, 1.0));
    }

    #[test]
    fn test_uvw_dimensions_clamped() {
        let mut state = state();
        state.set_uvw_max_dimensions([64, 64, 1]);
        state.set_uvw_extents_and_dimensions(DVec3::ONE, [100, 0, 5]);
        assert_eq!(state.uvw_dimensions(), [64, 1, 1]);
    }

    #[test]
    fn test_orientation_presets_are_recognised() {
        let mut state = state();
        assert!(state.set_orientation(Orientation::Sagittal));
        state.update_matrices();
        assert_eq!(state.orientation(), Orientation::Sagittal);
        assert_eq!(state.normal(), DVec3::new(-1.0, 0.0, 0.0));
        assert!(!state.set_orientation(Orientation::Reformat));

        state.rotate_normal(state.normal(), DVec3::new(-1.0, 0.2, 0.0));
        state.update_matrices();
        assert_eq!(state.orientation(), Orientation::Reformat);
        assert!(state.reset_orientation());
        state.update_matrices();
        assert_eq!(state.orientation(), Orientation::Axial);
    }

    #[test]
    fn test_slice_offset_round_trip() {
        let mut state = state();
        state.set_orientation(Orientation::Coronal);
        state.set_slice_offset(12.5);
        assert!((state.slice_offset() - 12.5).abs() < 1e-12);
        assert!(state.center().abs_diff_eq(DVec3::new(0.0, 12.5, 0.0), 1e-12));
        let before = state.slice_to_ras;
        state.set_slice_offset(12.5 + 1e-9);
        assert_eq!(state.slice_to_ras, before);
    }

    #[test]
    fn test_jump_modes() {
        let mut state = state();
        state.jump_slice_by_offsetting(DVec3::new(40.0, 50.0, 7.0));
        assert!(state.center().abs_diff_eq(DVec3::new(0.0, 0.0, 7.0), 1e-12));

        state.jump_mode = JumpMode::Centered;
        state.jump_slice(DVec3::new(40.0, 50.0, 7.0));
        assert!(state.center().abs_diff_eq(DVec3::new(40.0, 50.0, 7.0), 1e-12));
    }

    #[test]
    fn test_prescribed_spacing() {
        let mut state = state();
        state.slice_spacing_mode = SliceSpacingMode::Prescribed;
        state.prescribed_spacing = DVec3::new(1.0, 1.0, 2.5);
        assert_eq!(state.slice_spacing(), 2.5);
    }

    #[test]
    fn test_resolution_mode_moves_uvw_origin() {
        let mut state = state();
        state.set_xyz_origin(DVec3::new(3.0, 4.0, 0.0));
        assert_eq!(state.uvw_origin(), DVec3::new(3.0, 4.0, 0.0));
        state.set_resolution_mode(ResolutionMode::MatchVolumes);
        assert_eq!(state.uvw_origin(), DVec3::ZERO);
        state.set_xyz_origin(DVec3::new(5.0, 5.0, 0.0));
        assert_eq!(state.uvw_origin(), DVec3::ZERO);
    }

    #[test]
    fn test_rotate_to_volume_plane() {
        let mut state = state();
        state.set_rotation(DMat3::from_rotation_x(0.1) * DMat3::from_diagonal(DVec3::new(-1.0, 1.0, 1.0)));
        state.rotate_to_volume_plane(&DMat4::from_scale(DVec3::new(0.5, 0.5, 2.0)));
        state.update_matrices();
        assert_eq!(state.orientation(), Orientation::Axial);
    }

    #[test]
    fn test_interaction_bookkeeping_is_silent() {
        let node = new_slice_node("Red", &Config::default());
        let before = node.mtime();
        node.set_interacting(true);
        node.set_interaction_flags(SliceInteraction::FIELD_OF_VIEW);
        assert!(node.is_interacting());
        assert_eq!(node.mtime(), before);
    }

    #[test]
    fn test_rotate_normal_flips_antiparallel() {
        let mut state = state();
        let normal = state.normal();
        let handedness = state.rotation().determinant();
        state.rotate_normal(normal, -normal);
        assert!(state.normal().abs_diff_eq(-normal, 1e-12));
        assert!((state.rotation().determinant() - handedness).abs() < 1e-12);

        let rotation = state.rotation();
        state.rotate_normal(normal, normal);
        assert_eq!(state.rotation(), rotation);
    }
}
