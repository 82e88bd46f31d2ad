use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Ticks per second of every timestamp the engine produces.
pub const CLOCK_FREQUENCY: u64 = 1_000_000_000;

/// Timestamp source for recorded events, in nanoseconds.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Nanoseconds elapsed since the given instant.
    Monotonic(Instant),
    Manual(ManualClock),
}

impl Clock {
    pub fn monotonic() -> Self {
        Self::Monotonic(Instant::now())
    }

    pub fn now_nanos(&self) -> u64 {
        match self {
            Self::Monotonic(origin) => origin.elapsed().as_nanos() as u64,
            Self::Manual(manual) => manual.now_nanos(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_nanos)))
    }

    pub fn set(&self, nanos: u64) {
        self.0.store(nanos, Ordering::Release);
    }

    pub fn advance(&self, nanos: u64) {
        self.0.fetch_add(nanos, Ordering::AcqRel);
    }

    pub fn now_nanos(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl From<ManualClock> for Clock {
    fn from(manual: ManualClock) -> Self {
        Self::Manual(manual)
    }
}
