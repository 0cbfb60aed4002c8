use bitflags::bitflags;

use crate::enums::{BlendMode, LayerKind};
use crate::node::{Node, NodeState};

bitflags! {
    /// Which layer assignments a linked interaction propagates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompositeInteraction: u32 {
        const FOREGROUND_VOLUME = 1;
        const BACKGROUND_VOLUME = 2;
        const LABEL_VOLUME = 4;
        const FOREGROUND_OPACITY = 8;
        const LABEL_OPACITY = 16;
    }
}

/// Layer assignment and blending parameters of one slice view.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeConfig {
    pub layout_name: String,
    pub view_group: i32,
    pub background_volume_id: Option<String>,
    pub foreground_volume_id: Option<String>,
    pub label_volume_id: Option<String>,
    pub background_opacity: f64,
    pub foreground_opacity: f64,
    pub label_opacity: f64,
    pub compositing: BlendMode,
    pub clip_to_background_volume: bool,
    pub linked_control: bool,
    pub hot_linked_control: bool,
    pub interacting: bool,
    pub interaction_flags: CompositeInteraction,
    pub interaction_flags_modifier: CompositeInteraction,
}

impl CompositeConfig {
    pub fn new(layout_name: impl Into<String>) -> Self {
        Self {
            layout_name: layout_name.into(),
            view_group: 0,
            background_volume_id: None,
            foreground_volume_id: None,
            label_volume_id: None,
            background_opacity: 1.0,
            foreground_opacity: 0.0,
            label_opacity: 1.0,
            compositing: BlendMode::Alpha,
            clip_to_background_volume: true,
            linked_control: false,
            hot_linked_control: false,
            interacting: false,
            interaction_flags: CompositeInteraction::empty(),
            interaction_flags_modifier: CompositeInteraction::all(),
        }
    }

    pub fn volume_id(&self, layer: LayerKind) -> Option<&str> {
        match layer {
            LayerKind::Background => self.background_volume_id.as_deref(),
            LayerKind::Foreground => self.foreground_volume_id.as_deref(),
            LayerKind::Label => self.label_volume_id.as_deref(),
        }
    }

    pub fn set_volume_id(&mut self, layer: LayerKind, id: Option<String>) {
        match layer {
            LayerKind::Background => self.background_volume_id = id,
            LayerKind::Foreground => self.foreground_volume_id = id,
            LayerKind::Label => self.label_volume_id = id,
        }
    }

    pub fn opacity(&self, layer: LayerKind) -> f64 {
        match layer {
            LayerKind::Background => self.background_opacity,
            LayerKind::Foreground => self.foreground_opacity,
            LayerKind::Label => self.label_opacity,
        }
    }
}

impl NodeState for CompositeConfig {
    fn layout_name(&self) -> &str {
        &self.layout_name
    }

    fn view_group(&self) -> i32 {
        self.view_group
    }
}

pub type CompositeNode = Node<CompositeConfig>;

impl Node<CompositeConfig> {
    pub fn set_interaction_flags(&self, flags: CompositeInteraction) {
        self.modify_silently(|c| c.interaction_flags = flags);
    }

    pub fn set_interacting(&self, interacting: bool) {
        self.modify_silently(|c| c.interacting = interacting);
    }

    pub fn is_interacting(&self) -> bool {
        self.state().interacting
    }
}
