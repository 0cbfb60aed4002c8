//! Typed change notification.
//!
//! A producer owns a [`Notifier`]; consumers register closures with
//! [`Notifier::subscribe`] and keep the returned [`Subscription`] alive for as
//! long as they want to be called. Dropping the subscription unregisters the
//! closure. Everything is single-threaded: callbacks run inline on the thread
//! that emitted the event.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Dispatch order of callbacks registered for the same event.
///
/// All `Normal` callbacks run before any `Low` callback, which lets
/// "end of batch" observers see the effects of per-item observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

type Callback<E> = Rc<dyn Fn(&E)>;

struct Slot<E> {
    id: u64,
    priority: Priority,
    callback: Callback<E>,
}

struct Registry<E> {
    next_id: Cell<u64>,
    slots: RefCell<Vec<Slot<E>>>,
    batch_depth: Cell<u32>,
    pending: RefCell<Vec<E>>,
}

impl<E: PartialEq> Registry<E> {
    fn dispatch(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe while running.
        let callbacks: Vec<Callback<E>> = self
            .slots
            .borrow()
            .iter()
            .map(|slot| Rc::clone(&slot.callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

pub struct Notifier<E> {
    registry: Rc<Registry<E>>,
}

impl<E: PartialEq + 'static> Notifier<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(Registry {
                next_id: Cell::new(0),
                slots: RefCell::new(Vec::new()),
                batch_depth: Cell::new(0),
                pending: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, priority: Priority, callback: impl Fn(&E) + 'static) -> Subscription {
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);

        let mut slots = self.registry.slots.borrow_mut();
        let position = slots
            .iter()
            .position(|slot| slot.priority > priority)
            .unwrap_or(slots.len());
        slots.insert(
            position,
            Slot {
                id,
                priority,
                callback: Rc::new(callback),
            },
        );

        let registry: Weak<Registry<E>> = Rc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.slots.borrow_mut().retain(|slot| slot.id != id);
                }
            })),
        }
    }

    /// Deliver `event` now, or queue it if a batch is open.
    ///
    /// Queued events are coalesced: an event equal to one already pending is
    /// dropped.
    pub fn emit(&self, event: E) {
        if self.registry.batch_depth.get() > 0 {
            let mut pending = self.registry.pending.borrow_mut();
            if !pending.contains(&event) {
                pending.push(event);
            }
            return;
        }
        self.registry.dispatch(&event);
    }

    /// Defer notifications until the returned guard (and every enclosing
    /// guard) is dropped.
    pub fn begin_update(&self) -> UpdateBatch<E> {
        let depth = self.registry.batch_depth.get();
        self.registry.batch_depth.set(depth + 1);
        UpdateBatch {
            registry: Rc::clone(&self.registry),
        }
    }

    pub fn is_batching(&self) -> bool {
        self.registry.batch_depth.get() > 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.slots.borrow().len()
    }
}

impl<E: PartialEq + 'static> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.registry.slots.borrow().len())
            .field("batch_depth", &self.registry.batch_depth.get())
            .finish()
    }
}

/// Open batch of deferred notifications. Flushes on drop.
#[must_use = "dropping the batch immediately flushes it"]
pub struct UpdateBatch<E: PartialEq> {
    registry: Rc<Registry<E>>,
}

impl<E: PartialEq> Drop for UpdateBatch<E> {
    fn drop(&mut self) {
        let depth = self.registry.batch_depth.get().saturating_sub(1);
        self.registry.batch_depth.set(depth);
        if depth > 0 {
            return;
        }
        let pending = std::mem::take(&mut *self.registry.pending.borrow_mut());
        for event in &pending {
            self.registry.dispatch(event);
        }
    }
}

/// Keeps a callback registered. Dropping it unsubscribes.
#[must_use = "the callback is unregistered as soon as the subscription is dropped"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce()>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
