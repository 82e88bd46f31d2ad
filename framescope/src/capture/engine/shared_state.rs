use crate::capture::clock::Clock;
use std::sync::atomic::{AtomicBool, Ordering};

/// State read lock-free by every recording site.
pub(crate) struct SharedState {
    pub(crate) enabled: AtomicBool,
    /// Whether the running session samples stacks; applied to storages
    /// registered mid-session.
    pub(crate) sampling: AtomicBool,
    pub(crate) clock: Clock,
}

impl SharedState {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sampling: AtomicBool::new(false),
            clock,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn timestamp_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }
}
