use bitflags::bitflags;
use glam::DVec3;

use crate::enums::RenderMode;
use crate::node::{Node, NodeState};

bitflags! {
    /// Which 3D view properties a linked interaction propagates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ViewInteraction: u32 {
        const CAMERA = 1;
        const ZOOM = 2;
        const BOX_VISIBLE = 4;
        const BOX_LABEL_VISIBLE = 8;
        const BACKGROUND_COLOR = 16;
        const RENDER_MODE = 32;
        const ORIENTATION_MARKER = 64;
        const RULER_TYPE = 128;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: DVec3,
    pub focal_point: DVec3,
    pub view_up: DVec3,
    pub view_angle: f64,
    pub parallel_scale: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: DVec3::new(0.0, 500.0, 0.0),
            focal_point: DVec3::ZERO,
            view_up: DVec3::Z,
            view_angle: 30.0,
            parallel_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrientationMarker {
    #[default]
    None,
    Cube,
    Human,
    Axes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RulerType {
    #[default]
    None,
    Thin,
    Thick,
}

/// State of one 3D view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub layout_name: String,
    pub view_group: i32,
    pub camera: Camera,
    pub box_visible: bool,
    pub box_label_visible: bool,
    pub background_color: [f64; 3],
    pub render_mode: RenderMode,
    pub orientation_marker: OrientationMarker,
    pub ruler_type: RulerType,
    pub interacting: bool,
    pub interaction_flags: ViewInteraction,
    pub interaction_flags_modifier: ViewInteraction,
}

impl ViewState {
    pub fn new(layout_name: impl Into<String>) -> Self {
        Self {
            layout_name: layout_name.into(),
            view_group: 0,
            camera: Camera::default(),
            box_visible: true,
            box_label_visible: true,
            background_color: [0.757, 0.765, 0.910],
            render_mode: RenderMode::default(),
            orientation_marker: OrientationMarker::default(),
            ruler_type: RulerType::default(),
            interacting: false,
            interaction_flags: ViewInteraction::empty(),
            interaction_flags_modifier: ViewInteraction::all(),
        }
    }
}

impl NodeState for ViewState {
    fn layout_name(&self) -> &str {
        &self.layout_name
    }

    fn view_group(&self) -> i32 {
        self.view_group
    }
}

pub type ViewNode = Node<ViewState>;

impl Node<ViewState> {
    pub fn set_interaction_flags(&self, flags: ViewInteraction) {
        self.modify_silently(|v| v.interaction_flags = flags);
    }

    pub fn set_interacting(&self, interacting: bool) {
        self.modify_silently(|v| v.interacting = interacting);
    }
}
