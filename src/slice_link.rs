//! Propagation of interactive slice and composite edits to linked views.
//!
//! When a slice node is edited while `interacting` is set and its view has
//! linking enabled (`linked_control` on the composite node of the same
//! layout), the edit is replayed on every other slice node of the same view
//! group, restricted to the fields named by
//! `interaction_flags & interaction_flags_modifier`.
//! Composite nodes are linked the same way. Nothing is propagated during a
//! scene batch (import, restore, close) or while a broadcast is running.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use glam::DVec3;
use tracing::{debug, trace};

use crate::composite_node::{CompositeConfig, CompositeInteraction, CompositeNode};
use crate::config::Config;
use crate::enums::Orientation;
use crate::guard::ReentrancyCounter;
use crate::node::{Node, NodeState};
use crate::observer::{Priority, Subscription};
use crate::scene::{NodeRef, Scene, SceneEvent};
use crate::slice_node::{SliceInteraction, SliceNode, SliceViewState, rotations_match};

/// View operations a broadcast needs but slice nodes cannot perform alone.
pub trait SliceActions {
    /// Fit the view of `slice` to all of its volumes.
    fn fit_slice_to_all(&self, slice: &SliceNode);

    /// Align `slice` with the voxel axes of its background volume.
    fn rotate_to_background_volume_plane(&self, slice: &SliceNode);
}

pub struct SliceLinkBroadcaster {
    scene: Weak<Scene>,
    config: Config,
    broadcasting: ReentrancyCounter,
    last_normals: RefCell<HashMap<String, DVec3>>,
    actions: RefCell<Option<Rc<dyn SliceActions>>>,
    node_subscriptions: RefCell<Vec<(NodeRef, Subscription)>>,
    scene_subscription: RefCell<Option<Subscription>>,
}

impl fmt::Debug for SliceLinkBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceLinkBroadcaster")
            .field("broadcasting", &self.broadcasting.depth())
            .field("nodes", &self.node_subscriptions.borrow().len())
            .field("has_actions", &self.actions.borrow().is_some())
            .finish_non_exhaustive()
    }
}

impl SliceLinkBroadcaster {
    /// Observe the slice and composite nodes of `scene`, including nodes
    /// added later.
    pub fn new(scene: &Rc<Scene>) -> Rc<Self> {
        let broadcaster = Rc::new(Self {
            scene: Rc::downgrade(scene),
            config: scene.config().clone(),
            broadcasting: ReentrancyCounter::new(),
            last_normals: RefCell::new(HashMap::new()),
            actions: RefCell::new(None),
            node_subscriptions: RefCell::new(Vec::new()),
            scene_subscription: RefCell::new(None),
        });

        let weak = Rc::downgrade(&broadcaster);
        let subscription = scene.events().subscribe(Priority::Normal, move |event| {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.on_scene_event(event);
            }
        });
        *broadcaster.scene_subscription.borrow_mut() = Some(subscription);

        for slice in scene.slice_nodes() {
            broadcaster.attach_slice(&slice);
        }
        for composite in scene.composite_nodes() {
            broadcaster.attach_composite(&composite);
        }
        broadcaster
    }

    pub fn set_actions(&self, actions: Option<Rc<dyn SliceActions>>) {
        *self.actions.borrow_mut() = actions;
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.is_active()
    }

    fn on_scene_event(self: &Rc<Self>, event: &SceneEvent) {
        match event {
            SceneEvent::Started(kind) => {
                trace!(?kind, "suspending link broadcast");
                self.broadcasting.increment();
            }
            SceneEvent::Ended(kind) => {
                trace!(?kind, "resuming link broadcast");
                self.broadcasting.decrement();
            }
            SceneEvent::NodeAdded(NodeRef::Slice(name)) => {
                if let Some(slice) = self.scene.upgrade().and_then(|s| s.slice_node(name)) {
                    self.attach_slice(&slice);
                }
            }
            SceneEvent::NodeAdded(NodeRef::Composite(name)) => {
                if let Some(composite) = self.scene.upgrade().and_then(|s| s.composite_node(name)) {
                    self.attach_composite(&composite);
                }
            }
            SceneEvent::NodeRemoved(node @ (NodeRef::Slice(name) | NodeRef::Composite(name))) => {
                self.node_subscriptions
                    .borrow_mut()
                    .retain(|(candidate, _)| candidate != node);
                if let NodeRef::Slice(_) = node {
                    self.last_normals.borrow_mut().remove(name);
                }
            }
            _ => {}
        }
    }

    fn attach_slice(self: &Rc<Self>, slice: &Rc<SliceNode>) {
        let name = slice.layout_name();
        self.last_normals
            .borrow_mut()
            .insert(name.clone(), slice.state().normal());
        let weak = Rc::downgrade(self);
        let node = Rc::downgrade(slice);
        let subscription = slice.events().subscribe(Priority::Normal, move |_| {
            if let (Some(broadcaster), Some(slice)) = (weak.upgrade(), node.upgrade()) {
                broadcaster.on_slice_modified(&slice);
            }
        });
        self.node_subscriptions
            .borrow_mut()
            .push((NodeRef::Slice(name), subscription));
    }

    fn attach_composite(self: &Rc<Self>, composite: &Rc<CompositeNode>) {
        let weak = Rc::downgrade(self);
        let node = Rc::downgrade(composite);
        let subscription = composite.events().subscribe(Priority::Normal, move |_| {
            if let (Some(broadcaster), Some(composite)) = (weak.upgrade(), node.upgrade()) {
                broadcaster.on_composite_modified(&composite);
            }
        });
        self.node_subscriptions
            .borrow_mut()
            .push((NodeRef::Composite(composite.layout_name()), subscription));
    }

    fn on_slice_modified(&self, source: &Rc<SliceNode>) {
        let state = source.snapshot();
        let flags = state.interaction_flags & state.interaction_flags_modifier;
        let previous_normal = self.last_normals.borrow().get(&state.layout_name).copied();

        let linked = self.is_linked(&state.layout_name);
        if !self.broadcasting.is_active() && state.interacting && !flags.is_empty() && linked {
            let _guard = self.broadcasting.enter();
            debug!(view = %state.layout_name, ?flags, "broadcasting slice edit");
            for peer in self.peers(source, |scene| scene.slice_nodes()) {
                self.broadcast_slice(&state, flags, previous_normal, &peer);
            }
        }

        self.last_normals
            .borrow_mut()
            .insert(state.layout_name.clone(), source.state().normal());
    }

    fn broadcast_slice(
        &self,
        source: &SliceViewState,
        flags: SliceInteraction,
        previous_normal: Option<DVec3>,
        peer: &SliceNode,
    ) {
        let tolerance = self.config.orientation_tolerance;
        peer.modify(|p| {
            let same_orientation = rotations_match(&source.rotation(), &p.rotation(), tolerance);

            if flags.contains(SliceInteraction::SLICE_TO_RAS) && same_orientation {
                p.slice_to_ras = source.slice_to_ras;
            }
            if flags.contains(SliceInteraction::XYZ_ORIGIN) && same_orientation {
                p.set_xyz_origin(source.xyz_origin());
            }
            if flags.contains(SliceInteraction::FIELD_OF_VIEW) {
                let source_fov = source.field_of_view();
                let peer_fov = p.field_of_view();
                if peer_fov.x > 0.0 {
                    p.set_field_of_view(DVec3::new(
                        source_fov.x,
                        source_fov.x * peer_fov.y / peer_fov.x,
                        peer_fov.z,
                    ));
                }
            }
            if flags.contains(SliceInteraction::ORIENTATION) {
                match source.orientation() {
                    Orientation::Reformat => p.set_rotation(source.rotation()),
                    preset => {
                        p.set_orientation(preset);
                    }
                }
            }
            if flags.contains(SliceInteraction::RESET_ORIENTATION) {
                p.reset_orientation();
            }
            if flags.contains(SliceInteraction::LABEL_OUTLINE) {
                p.use_label_outline = source.use_label_outline;
            }
            if flags.contains(SliceInteraction::SLICE_VISIBLE) {
                p.slice_visible = source.slice_visible;
            }
            if flags.contains(SliceInteraction::SLICE_SPACING) {
                p.slice_spacing_mode = source.slice_spacing_mode;
                p.prescribed_spacing = source.prescribed_spacing;
            }
            if flags.contains(SliceInteraction::MULTIPLANAR_REFORMAT) {
                if let Some(previous) = previous_normal {
                    p.rotate_normal(previous, source.normal());
                }
            }
        });

        let actions = self.actions.borrow().clone();
        if let Some(actions) = actions {
            if flags.contains(SliceInteraction::RESET_FIELD_OF_VIEW) {
                actions.fit_slice_to_all(peer);
            }
            if flags.contains(SliceInteraction::ROTATE_TO_BACKGROUND_VOLUME_PLANE) {
                actions.rotate_to_background_volume_plane(peer);
            }
        }
    }

    fn on_composite_modified(&self, source: &Rc<CompositeNode>) {
        let state = source.snapshot();
        let flags = state.interaction_flags & state.interaction_flags_modifier;
        if self.broadcasting.is_active() || !state.interacting || flags.is_empty() || !state.linked_control {
            return;
        }
        let _guard = self.broadcasting.enter();
        debug!(view = %state.layout_name, ?flags, "broadcasting composite edit");
        for peer in self.peers(source, |scene| scene.composite_nodes()) {
            peer.modify(|p| copy_composite_fields(&state, flags, p));
        }
    }

    /// Whether the composite node of `layout_name` has linking enabled.
    fn is_linked(&self, layout_name: &str) -> bool {
        self.scene
            .upgrade()
            .and_then(|scene| scene.composite_node(layout_name))
            .is_some_and(|composite| composite.state().linked_control)
    }

    /// Nodes of the source's view group other than the source itself.
    fn peers<S: NodeState>(
        &self,
        source: &Rc<Node<S>>,
        nodes: impl FnOnce(&Scene) -> Vec<Rc<Node<S>>>,
    ) -> Vec<Rc<Node<S>>> {
        let Some(scene) = self.scene.upgrade() else {
            return Vec::new();
        };
        let group = source.view_group();
        nodes(&scene)
            .into_iter()
            .filter(|node| !Rc::ptr_eq(node, source) && node.view_group() == group)
            .collect()
    }
}

fn copy_composite_fields(source: &CompositeConfig, flags: CompositeInteraction, peer: &mut CompositeConfig) {
    if flags.contains(CompositeInteraction::BACKGROUND_VOLUME) {
        peer.background_volume_id = source.background_volume_id.clone();
    }
    if flags.contains(CompositeInteraction::FOREGROUND_VOLUME) {
        peer.foreground_volume_id = source.foreground_volume_id.clone();
    }
    if flags.contains(CompositeInteraction::LABEL_VOLUME) {
        peer.label_volume_id = source.label_volume_id.clone();
    }
    if flags.contains(CompositeInteraction::FOREGROUND_OPACITY) {
        peer.foreground_opacity = source.foreground_opacity;
    }
    if flags.contains(CompositeInteraction::LABEL_OPACITY) {
        peer.label_opacity = source.label_opacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::BatchKind;
    use std::cell::Cell;

    fn linked_scene(names: &[&str]) -> (Rc<Scene>, Rc<SliceLinkBroadcaster>) {
        let scene = Scene::new(Config::default());
        for name in names {
            scene.add_slice_node(name);
            scene.add_composite_node(name).modify(|c| c.linked_control = true);
        }
        let broadcaster = SliceLinkBroadcaster::new(&scene);
        (scene, broadcaster)
    }

    fn interact(slice: &SliceNode, flags: SliceInteraction, edit: impl FnOnce(&mut SliceViewState)) {
        slice.set_interaction_flags(flags);
        slice.set_interacting(true);
        slice.modify(edit);
        slice.set_interacting(false);
    }

    #[test]
    fn test_field_of_view_keeps_peer_aspect() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        green.modify(|s| s.set_field_of_view(DVec3::new(100.0, 50.0, 2.0)));

        interact(&red, SliceInteraction::FIELD_OF_VIEW, |s| {
            s.set_field_of_view(DVec3::new(200.0, 300.0, 1.0))
        });
        assert_eq!(green.state().field_of_view(), DVec3::new(200.0, 100.0, 2.0));
    }

    #[test]
    fn test_position_needs_matching_orientation() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green", "Yellow"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        let yellow = scene.slice_node("Yellow").unwrap();
        green.modify(|s| {
            s.set_orientation(Orientation::Coronal);
        });
        let green_before = green.state().slice_to_ras;

        interact(
            &red,
            SliceInteraction::SLICE_TO_RAS | SliceInteraction::FIELD_OF_VIEW,
            |s| {
                s.slice_to_ras.w_axis.z = 12.0;
                s.set_field_of_view(DVec3::new(300.0, 300.0, 1.0));
            },
        );
        assert_eq!(yellow.state().center().z, 12.0);
        assert_eq!(green.state().slice_to_ras, green_before);
        assert_eq!(green.state().field_of_view().x, 300.0);
    }

    #[test]
    fn test_view_groups_are_isolated() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        green.modify(|s| s.view_group = 1);
        interact(&red, SliceInteraction::SLICE_VISIBLE, |s| s.slice_visible = true);
        assert!(!green.state().slice_visible);
    }

    #[test]
    fn test_not_interacting_does_not_broadcast() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        red.set_interaction_flags(SliceInteraction::LABEL_OUTLINE);
        red.modify(|s| s.use_label_outline = true);
        assert!(!scene.slice_node("Green").unwrap().state().use_label_outline);
    }

    #[test]
    fn test_modifier_masks_flags() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        red.modify_silently(|s| s.interaction_flags_modifier = SliceInteraction::SLICE_VISIBLE);
        interact(
            &red,
            SliceInteraction::SLICE_VISIBLE | SliceInteraction::LABEL_OUTLINE,
            |s| {
                s.slice_visible = true;
                s.use_label_outline = true;
            },
        );
        let green = scene.slice_node("Green").unwrap();
        assert!(green.state().slice_visible);
        assert!(!green.state().use_label_outline);
    }

    #[test]
    fn test_import_suppresses_broadcast() {
        let (scene, broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        {
            let _import = scene.begin(BatchKind::Import);
            assert!(broadcaster.is_broadcasting());
            interact(&red, SliceInteraction::SLICE_VISIBLE, |s| s.slice_visible = true);
        }
        assert!(!broadcaster.is_broadcasting());
        assert!(!scene.slice_node("Green").unwrap().state().slice_visible);
    }

    #[test]
    fn test_reformat_replays_rotation() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        green.modify(|s| {
            s.set_orientation(Orientation::Coronal);
        });
        let green_normal = green.state().normal();
        let from = red.state().normal();
        let tilt = glam::DMat3::from_rotation_x(0.2);

        interact(&red, SliceInteraction::MULTIPLANAR_REFORMAT, |s| {
            s.set_rotation(tilt * s.rotation())
        });
        let to = red.state().normal();
        assert!(to.abs_diff_eq(tilt * from, 1e-12));
        assert!(green.state().normal().abs_diff_eq(tilt * green_normal, 1e-12));
    }

    #[test]
    fn test_reset_field_of_view_uses_actions() {
        struct Counting(Cell<u32>);
        impl SliceActions for Counting {
            fn fit_slice_to_all(&self, _slice: &SliceNode) {
                self.0.set(self.0.get() + 1);
            }
            fn rotate_to_background_volume_plane(&self, _slice: &SliceNode) {}
        }

        let (scene, broadcaster) = linked_scene(&["Red", "Green", "Yellow"]);
        let actions = Rc::new(Counting(Cell::new(0)));
        broadcaster.set_actions(Some(actions.clone()));
        let red = scene.slice_node("Red").unwrap();
        red.set_interaction_flags(SliceInteraction::RESET_FIELD_OF_VIEW);
        red.set_interacting(true);
        red.touch();
        red.set_interacting(false);
        assert_eq!(actions.0.get(), 2);
    }

    #[test]
    fn test_composite_fields() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.composite_node("Red").unwrap();
        red.set_interaction_flags(CompositeInteraction::FOREGROUND_VOLUME | CompositeInteraction::LABEL_OPACITY);
        red.set_interacting(true);
        red.modify(|c| {
            c.foreground_volume_id = Some("mr".into());
            c.label_opacity = 0.3;
            c.background_volume_id = Some("ct".into());
        });
        red.set_interacting(false);

        let green = scene.composite_node("Green").unwrap().snapshot();
        assert_eq!(green.foreground_volume_id.as_deref(), Some("mr"));
        assert_eq!(green.label_opacity, 0.3);
        assert_eq!(green.background_volume_id, None);
    }

    #[test]
    fn test_late_nodes_are_linked() {
        let (scene, _broadcaster) = linked_scene(&["Red"]);
        let green = scene.add_slice_node("Green");
        let red = scene.slice_node("Red").unwrap();
        interact(&red, SliceInteraction::SLICE_VISIBLE, |s| s.slice_visible = true);
        assert!(green.state().slice_visible);
    }

    #[test]
    fn test_position_within_orientation_tolerance() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green", "Yellow"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        let yellow = scene.slice_node("Yellow").unwrap();
        // Default tolerance is 1e-3 per normalised basis component.
        green.modify(|s| s.set_rotation(glam::DMat3::from_rotation_z(5e-4) * s.rotation()));
        yellow.modify(|s| s.set_rotation(glam::DMat3::from_rotation_z(1.2e-3) * s.rotation()));
        let yellow_before = yellow.snapshot();

        interact(
            &red,
            SliceInteraction::SLICE_TO_RAS | SliceInteraction::XYZ_ORIGIN | SliceInteraction::FIELD_OF_VIEW,
            |s| {
                s.slice_to_ras.w_axis.z = 7.0;
                s.set_xyz_origin(DVec3::new(1.0, 2.0, 0.0));
                s.set_field_of_view(DVec3::new(150.0, 150.0, 1.0));
            },
        );

        let red = red.snapshot();
        let green = green.snapshot();
        assert_eq!(green.slice_to_ras, red.slice_to_ras);
        assert_eq!(green.xyz_origin(), DVec3::new(1.0, 2.0, 0.0));

        let yellow = yellow.snapshot();
        assert_eq!(yellow.slice_to_ras, yellow_before.slice_to_ras);
        assert_eq!(yellow.xyz_origin(), yellow_before.xyz_origin());
        assert_eq!(yellow.field_of_view().x, 150.0);
    }

    #[test]
    fn test_unlinked_view_does_not_broadcast() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        scene.composite_node("Red").unwrap().modify(|c| c.linked_control = false);
        let red = scene.slice_node("Red").unwrap();
        interact(&red, SliceInteraction::SLICE_VISIBLE, |s| s.slice_visible = true);
        assert!(!scene.slice_node("Green").unwrap().state().slice_visible);

        let composite = scene.composite_node("Red").unwrap();
        composite.set_interaction_flags(CompositeInteraction::LABEL_OPACITY);
        composite.set_interacting(true);
        composite.modify(|c| c.label_opacity = 0.25);
        composite.set_interacting(false);
        assert_ne!(scene.composite_node("Green").unwrap().state().label_opacity, 0.25);
    }

    #[test]
    fn test_reformat_replays_flip() {
        let (scene, _broadcaster) = linked_scene(&["Red", "Green"]);
        let red = scene.slice_node("Red").unwrap();
        let green = scene.slice_node("Green").unwrap();
        green.modify(|s| {
            s.set_orientation(Orientation::Sagittal);
        });
        let green_before = green.state().rotation();
        let red_normal = red.state().normal();

        interact(&red, SliceInteraction::MULTIPLANAR_REFORMAT, |s| {
            s.set_rotation(glam::DMat3::from_rotation_x(std::f64::consts::PI) * s.rotation())
        });
        assert!(red.state().normal().abs_diff_eq(-red_normal, 1e-12));

        let flip = glam::DMat3::from_axis_angle(red_normal.any_orthonormal_vector(), std::f64::consts::PI);
        let green_after = green.state().rotation();
        assert!(green_after.abs_diff_eq(flip * green_before, 1e-9));
        assert!(!green_after.abs_diff_eq(green_before, 1e-6));
    }
}
