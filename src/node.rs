use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::observer::{Notifier, UpdateBatch};
use crate::timestamp::TimeStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Modified,
}

/// State stored inside a [`Node`].
pub trait NodeState: Clone + PartialEq + 'static {
    fn layout_name(&self) -> &str;

    fn view_group(&self) -> i32;

    /// Recompute derived fields after an edit.
    fn after_modify(&mut self) {}
}

/// A shared, observable piece of view state.
///
/// Edits go through [`Node::modify`], which recomputes derived fields and
/// emits [`NodeEvent::Modified`] only if the state actually changed. The
/// event is emitted after the internal borrow is released, so observers may
/// read or modify the node again.
#[derive(Debug)]
pub struct Node<S> {
    state: RefCell<S>,
    events: Notifier<NodeEvent>,
    mtime: Cell<TimeStamp>,
}

impl<S: NodeState> Node<S> {
    pub fn new(mut state: S) -> Rc<Self> {
        state.after_modify();
        Rc::new(Self {
            state: RefCell::new(state),
            events: Notifier::new(),
            mtime: Cell::new(TimeStamp::now()),
        })
    }

    pub fn state(&self) -> Ref<'_, S> {
        self.state.borrow()
    }

    pub fn snapshot(&self) -> S {
        self.state.borrow().clone()
    }

    pub fn layout_name(&self) -> String {
        self.state.borrow().layout_name().to_owned()
    }

    pub fn view_group(&self) -> i32 {
        self.state.borrow().view_group()
    }

    pub fn events(&self) -> &Notifier<NodeEvent> {
        &self.events
    }

    pub fn mtime(&self) -> TimeStamp {
        self.mtime.get()
    }

    /// Apply `edit` and notify observers if anything changed.
    pub fn modify<R>(&self, edit: impl FnOnce(&mut S) -> R) -> R {
        let (result, changed) = {
            let mut state = self.state.borrow_mut();
            let before = state.clone();
            let result = edit(&mut state);
            state.after_modify();
            (result, *state != before)
        };
        if changed {
            self.touch();
        }
        result
    }

    /// Apply `edit` without notifying. Used for interaction bookkeeping
    /// that observers must not react to.
    pub fn modify_silently<R>(&self, edit: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.state.borrow_mut();
        let result = edit(&mut state);
        state.after_modify();
        result
    }

    /// Bump the modification stamp and notify even though nothing changed.
    pub fn touch(&self) {
        self.mtime.set(TimeStamp::now());
        trace!(node = %self.layout_name(), "node modified");
        self.events.emit(NodeEvent::Modified);
    }

    /// Coalesce the notifications of several edits into one.
    pub fn begin_update(&self) -> UpdateBatch<NodeEvent> {
        self.events.begin_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Priority;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        name: String,
        value: i32,
        doubled: i32,
    }

    impl NodeState for Counter {
        fn layout_name(&self) -> &str {
            &self.name
        }

        fn view_group(&self) -> i32 {
            0
        }

        fn after_modify(&mut self) {
            self.doubled = self.value * 2;
        }
    }

    fn counter() -> Rc<Node<Counter>> {
        Node::new(Counter {
            name: "c".into(),
            value: 1,
            doubled: 0,
        })
    }

    #[test]
    fn test_modify_recomputes_and_notifies() {
        let node = counter();
        assert_eq!(node.state().doubled, 2);
        let fired = Rc::new(Cell::new(0));
        let count = Rc::clone(&fired);
        let _sub = node.events().subscribe(Priority::Normal, move |_| count.set(count.get() + 1));

        let before = node.mtime();
        node.modify(|s| s.value = 5);
        assert_eq!(node.state().doubled, 10);
        assert_eq!(fired.get(), 1);
        assert!(node.mtime() > before);

        node.modify(|s| s.value = 5);
        assert_eq!(fired.get(), 1);

        node.modify_silently(|s| s.value = 6);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_observer_may_reenter() {
        let node = counter();
        let weak = Rc::downgrade(&node);
        let _sub = node.events().subscribe(Priority::Normal, move |_| {
            if let Some(node) = weak.upgrade() {
                node.modify(|s| s.value = s.value.min(10));
            }
        });
        node.modify(|s| s.value = 50);
        assert_eq!(node.state().value, 10);
    }

    #[test]
    fn test_batch_emits_once() {
        let node = counter();
        let fired = Rc::new(Cell::new(0));
        let count = Rc::clone(&fired);
        let _sub = node.events().subscribe(Priority::Normal, move |_| count.set(count.get() + 1));
        {
            let _batch = node.begin_update();
            node.modify(|s| s.value = 2);
            node.modify(|s| s.value = 3);
        }
        assert_eq!(fired.get(), 1);
    }
}
