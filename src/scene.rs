use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::composite_node::{CompositeConfig, CompositeNode};
use crate::config::Config;
use crate::node::Node;
use crate::observer::Notifier;
use crate::slice_node::{SliceNode, SliceViewState};
use crate::view_node::{ViewNode, ViewState};
use crate::volume::{Volume, VolumeNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Volume(String),
    Slice(String),
    Composite(String),
    View(String),
}

/// Scene-wide operations that suppress link broadcasting while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Batch,
    Import,
    Restore,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneEvent {
    NodeAdded(NodeRef),
    NodeRemoved(NodeRef),
    Started(BatchKind),
    Ended(BatchKind),
}

/// Registry of the volumes and view nodes the pipeline works on.
#[derive(Debug)]
pub struct Scene {
    config: Config,
    volumes: RefCell<BTreeMap<String, Rc<VolumeNode>>>,
    slices: RefCell<Vec<Rc<SliceNode>>>,
    composites: RefCell<Vec<Rc<CompositeNode>>>,
    views: RefCell<Vec<Rc<ViewNode>>>,
    events: Notifier<SceneEvent>,
}

impl Scene {
    pub fn new(config: Config) -> Rc<Self> {
        Rc::new(Self {
            config,
            volumes: RefCell::new(BTreeMap::new()),
            slices: RefCell::new(Vec::new()),
            composites: RefCell::new(Vec::new()),
            views: RefCell::new(Vec::new()),
            events: Notifier::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Notifier<SceneEvent> {
        &self.events
    }

    /// Add a volume, replacing any volume with the same id.
    pub fn add_volume(&self, volume: Volume) -> Rc<VolumeNode> {
        let id = volume.id.clone();
        let node = VolumeNode::new(volume);
        let replaced = self.volumes.borrow_mut().insert(id.clone(), Rc::clone(&node));
        if replaced.is_some() {
            debug!(volume = %id, "replacing volume");
            self.events.emit(SceneEvent::NodeRemoved(NodeRef::Volume(id.clone())));
        }
        self.events.emit(SceneEvent::NodeAdded(NodeRef::Volume(id)));
        node
    }

    /// Drop the scene's reference. Layers bound to the volume stop drawing
    /// it once no other strong reference remains.
    pub fn remove_volume(&self, id: &str) -> bool {
        let removed = self.volumes.borrow_mut().remove(id);
        match removed {
            Some(node) => {
                drop(node);
                self.events.emit(SceneEvent::NodeRemoved(NodeRef::Volume(id.to_owned())));
                true
            }
            None => false,
        }
    }

    pub fn volume(&self, id: &str) -> Option<Rc<VolumeNode>> {
        self.volumes.borrow().get(id).cloned()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.volumes.borrow().keys().cloned().collect()
    }

    /// The slice node with this layout name, created on first use.
    pub fn add_slice_node(&self, layout_name: &str) -> Rc<SliceNode> {
        if let Some(existing) = self.slice_node(layout_name) {
            return existing;
        }
        let node = Node::new(SliceViewState::new(layout_name, &self.config));
        self.slices.borrow_mut().push(Rc::clone(&node));
        self.events.emit(SceneEvent::NodeAdded(NodeRef::Slice(layout_name.to_owned())));
        node
    }

    pub fn add_composite_node(&self, layout_name: &str) -> Rc<CompositeNode> {
        if let Some(existing) = self.composite_node(layout_name) {
            return existing;
        }
        let node = Node::new(CompositeConfig::new(layout_name));
        self.composites.borrow_mut().push(Rc::clone(&node));
        self.events
            .emit(SceneEvent::NodeAdded(NodeRef::Composite(layout_name.to_owned())));
        node
    }

    pub fn add_view_node(&self, layout_name: &str) -> Rc<ViewNode> {
        if let Some(existing) = self.view_node(layout_name) {
            return existing;
        }
        let node = Node::new(ViewState::new(layout_name));
        self.views.borrow_mut().push(Rc::clone(&node));
        self.events.emit(SceneEvent::NodeAdded(NodeRef::View(layout_name.to_owned())));
        node
    }

    pub fn slice_node(&self, layout_name: &str) -> Option<Rc<SliceNode>> {
        find(&self.slices, layout_name)
    }

    pub fn composite_node(&self, layout_name: &str) -> Option<Rc<CompositeNode>> {
        find(&self.composites, layout_name)
    }

    pub fn view_node(&self, layout_name: &str) -> Option<Rc<ViewNode>> {
        find(&self.views, layout_name)
    }

    pub fn slice_nodes(&self) -> Vec<Rc<SliceNode>> {
        self.slices.borrow().clone()
    }

    pub fn composite_nodes(&self) -> Vec<Rc<CompositeNode>> {
        self.composites.borrow().clone()
    }

    pub fn view_nodes(&self) -> Vec<Rc<ViewNode>> {
        self.views.borrow().clone()
    }

    pub fn remove_slice_node(&self, layout_name: &str) -> bool {
        let removed = remove(&self.slices, layout_name);
        if removed {
            self.events
                .emit(SceneEvent::NodeRemoved(NodeRef::Slice(layout_name.to_owned())));
        }
        removed
    }

    pub fn remove_composite_node(&self, layout_name: &str) -> bool {
        let removed = remove(&self.composites, layout_name);
        if removed {
            self.events
                .emit(SceneEvent::NodeRemoved(NodeRef::Composite(layout_name.to_owned())));
        }
        removed
    }

    pub fn remove_view_node(&self, layout_name: &str) -> bool {
        let removed = remove(&self.views, layout_name);
        if removed {
            self.events
                .emit(SceneEvent::NodeRemoved(NodeRef::View(layout_name.to_owned())));
        }
        removed
    }

    /// Announce a scene-wide operation; the end is announced when the
    /// returned guard drops.
    pub fn begin(&self, kind: BatchKind) -> SceneBatch<'_> {
        self.events.emit(SceneEvent::Started(kind));
        SceneBatch { scene: self, kind }
    }
}

fn find<S: crate::node::NodeState>(nodes: &RefCell<Vec<Rc<Node<S>>>>, layout_name: &str) -> Option<Rc<Node<S>>> {
    nodes
        .borrow()
        .iter()
        .find(|node| node.state().layout_name() == layout_name)
        .cloned()
}

fn remove<S: crate::node::NodeState>(nodes: &RefCell<Vec<Rc<Node<S>>>>, layout_name: &str) -> bool {
    let mut nodes = nodes.borrow_mut();
    let before = nodes.len();
    nodes.retain(|node| node.state().layout_name() != layout_name);
    nodes.len() != before
}

#[must_use = "the operation ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SceneBatch<'a> {
    scene: &'a Scene,
    kind: BatchKind,
}

impl Drop for SceneBatch<'_> {
    fn drop(&mut self) {
        self.scene.events.emit(SceneEvent::Ended(self.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::VolumeKind;
    use crate::observer::Priority;
    use crate::volume::VolumeBinding;

    #[test]
    fn test_nodes_are_unique_per_layout_name() {
        let scene = Scene::new(Config::default());
        let a = scene.add_slice_node("Red");
        let b = scene.add_slice_node("Red");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(scene.slice_nodes().len(), 1);
        assert!(scene.remove_slice_node("Red"));
        assert!(!scene.remove_slice_node("Red"));
    }

    #[test]
    fn test_remove_volume_invalidates_bindings() {
        let scene = Scene::new(Config::default());
        let binding = VolumeBinding::new(&scene.add_volume(Volume::new("ct", VolumeKind::Scalar)));
        assert!(binding.get().is_some());
        assert!(scene.remove_volume("ct"));
        assert!(binding.get().is_none());
        assert!(scene.volume("ct").is_none());
    }

    #[test]
    fn test_events_in_order() {
        let scene = Scene::new(Config::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let _sub = scene
            .events()
            .subscribe(Priority::Normal, move |event: &SceneEvent| sink.borrow_mut().push(event.clone()));
        {
            let _import = scene.begin(BatchKind::Import);
            scene.add_composite_node("Red");
        }
        assert_eq!(
            *log.borrow(),
            vec![
                SceneEvent::Started(BatchKind::Import),
                SceneEvent::NodeAdded(NodeRef::Composite("Red".into())),
                SceneEvent::Ended(BatchKind::Import),
            ]
        );
    }
}
