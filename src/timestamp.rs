use std::sync::atomic::{AtomicU64, Ordering};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Monotonic modification stamp.
///
/// Stamps are drawn from one process-wide clock, so stamps of different
/// objects can be compared: an output is stale when any input stamp is newer
/// than the stamp recorded when the output was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// A fresh stamp, newer than every stamp handed out before.
    pub fn now() -> Self {
        TimeStamp(CLOCK.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn modified(&mut self) {
        *self = TimeStamp::now();
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}
