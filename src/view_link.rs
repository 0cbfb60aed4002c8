//! Propagation of interactive 3D view edits to the views of the same group.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::guard::ReentrancyCounter;
use crate::observer::{Priority, Subscription};
use crate::scene::{NodeRef, Scene, SceneEvent};
use crate::view_node::{ViewInteraction, ViewNode, ViewState};

#[derive(Debug)]
pub struct ViewLinkBroadcaster {
    scene: Weak<Scene>,
    broadcasting: ReentrancyCounter,
    node_subscriptions: RefCell<Vec<(String, Subscription)>>,
    scene_subscription: RefCell<Option<Subscription>>,
}

impl ViewLinkBroadcaster {
    pub fn new(scene: &Rc<Scene>) -> Rc<Self> {
        let broadcaster = Rc::new(Self {
            scene: Rc::downgrade(scene),
            broadcasting: ReentrancyCounter::new(),
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

        for view in scene.view_nodes() {
            broadcaster.attach(&view);
        }
        broadcaster
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.is_active()
    }

    fn on_scene_event(self: &Rc<Self>, event: &SceneEvent) {
        match event {
            SceneEvent::Started(_) => self.broadcasting.increment(),
            SceneEvent::Ended(_) => self.broadcasting.decrement(),
            SceneEvent::NodeAdded(NodeRef::View(name)) => {
                if let Some(view) = self.scene.upgrade().and_then(|s| s.view_node(name)) {
                    self.attach(&view);
                }
            }
            SceneEvent::NodeRemoved(NodeRef::View(name)) => {
                self.node_subscriptions
                    .borrow_mut()
                    .retain(|(candidate, _)| candidate != name);
            }
            _ => {}
        }
    }

    fn attach(self: &Rc<Self>, view: &Rc<ViewNode>) {
        let weak = Rc::downgrade(self);
        let node = Rc::downgrade(view);
        let subscription = view.events().subscribe(Priority::Normal, move |_| {
            if let (Some(broadcaster), Some(view)) = (weak.upgrade(), node.upgrade()) {
                broadcaster.on_view_modified(&view);
            }
        });
        self.node_subscriptions
            .borrow_mut()
            .push((view.layout_name(), subscription));
    }

    fn on_view_modified(&self, source: &Rc<ViewNode>) {
        let state = source.snapshot();
        let flags = state.interaction_flags & state.interaction_flags_modifier;
        if self.broadcasting.is_active() || !state.interacting || flags.is_empty() {
            return;
        }
        let Some(scene) = self.scene.upgrade() else {
            return;
        };
        let _guard = self.broadcasting.enter();
        debug!(view = %state.layout_name, ?flags, "broadcasting view edit");
        for peer in scene.view_nodes() {
            if Rc::ptr_eq(&peer, source) || peer.view_group() != state.view_group {
                continue;
            }
            peer.modify(|p| copy_view_fields(&state, flags, p));
        }
    }
}

fn copy_view_fields(source: &ViewState, flags: ViewInteraction, peer: &mut ViewState) {
    if flags.contains(ViewInteraction::CAMERA) {
        peer.camera.position = source.camera.position;
        peer.camera.focal_point = source.camera.focal_point;
        peer.camera.view_up = source.camera.view_up;
    }
    if flags.contains(ViewInteraction::ZOOM) {
        peer.camera.view_angle = source.camera.view_angle;
        peer.camera.parallel_scale = source.camera.parallel_scale;
    }
    if flags.contains(ViewInteraction::BOX_VISIBLE) {
        peer.box_visible = source.box_visible;
    }
    if flags.contains(ViewInteraction::BOX_LABEL_VISIBLE) {
        peer.box_label_visible = source.box_label_visible;
    }
    if flags.contains(ViewInteraction::BACKGROUND_COLOR) {
        peer.background_color = source.background_color;
    }
    if flags.contains(ViewInteraction::RENDER_MODE) {
        peer.render_mode = source.render_mode;
    }
    if flags.contains(ViewInteraction::ORIENTATION_MARKER) {
        peer.orientation_marker = source.orientation_marker;
    }
    if flags.contains(ViewInteraction::RULER_TYPE) {
        peer.ruler_type = source.ruler_type;
    }
}
