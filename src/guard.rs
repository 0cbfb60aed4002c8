use std::cell::Cell;
use std::rc::Rc;

/// Depth counter used to short-circuit nested invocations.
///
/// The counter is shared through an `Rc`, so a guard can outlive the borrow
/// of the object that owns the counter.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyCounter {
    depth: Rc<Cell<u32>>,
}

impl ReentrancyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Increment the counter until the returned guard is dropped.
    pub fn enter(&self) -> ReentrancyGuard {
        self.depth.set(self.depth.get() + 1);
        ReentrancyGuard {
            depth: Rc::clone(&self.depth),
        }
    }

    /// Enter only if the counter is idle.
    pub fn try_enter(&self) -> Option<ReentrancyGuard> {
        if self.is_active() {
            None
        } else {
            Some(self.enter())
        }
    }

    pub(crate) fn increment(&self) {
        self.depth.set(self.depth.get() + 1);
    }

    pub(crate) fn decrement(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

#[must_use = "the counter is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReentrancyGuard {
    depth: Rc<Cell<u32>>,
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}
