//! Per-context event storage and the thread-local pointer to it.
//!
//! Every registered thread and fiber owns one [`EventStorage`]. Only the owning
//! context records into it, and an event is stored once it is closed. The
//! storage keeps two sets of buffers: recorders append to the front set while
//! readers on the controller thread swap the sets and move the back one out.
//! A recorder never waits for a reader and never loses a record to one; a
//! reader only waits for the single append in flight on the set it takes.

use crate::capture::buffer::ChunkedBuffer;
use crate::capture::description::EventDescription;
use crate::capture::engine::SharedState;
use crate::capture::events::{EventData, EventKind, EventTime, FiberSyncData, SyncData};
use std::cell::{RefCell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type EventBuffer = ChunkedBuffer<EventData, 1024>;
/// Allocation sequence numbers of events whose description carries a color.
pub type CategoryBuffer = ChunkedBuffer<u64, 32>;
pub type SynchronizationBuffer = ChunkedBuffer<SyncData, 1024>;
pub type FiberSyncBuffer = ChunkedBuffer<FiberSyncData, 1024>;

#[derive(Default)]
pub struct StorageBuffers {
    pub events: EventBuffer,
    pub categories: CategoryBuffer,
    pub synchronization: SynchronizationBuffer,
    pub fiber_sync: FiberSyncBuffer,
}

impl StorageBuffers {
    pub fn clear(&mut self, preserve_content: bool) {
        self.events.clear(preserve_content);
        self.categories.clear(preserve_content);
        self.synchronization.clear(preserve_content);
        self.fiber_sync.clear(preserve_content);
    }

    /// Copy everything in `other` to the end of these buffers.
    fn append(&mut self, other: &StorageBuffers) {
        for &event in other.events.iter() {
            self.events.add(event);
        }
        for &sequence in other.categories.iter() {
            self.categories.add(sequence);
        }
        for &sync in other.synchronization.iter() {
            self.synchronization.add(sync);
        }
        for &sync in other.fiber_sync.iter() {
            self.fiber_sync.add(sync);
        }
    }

    /// Events ordered by allocation. Closing order differs from it for
    /// nested scopes.
    pub fn events_in_order(&self) -> Vec<EventData> {
        let mut events = self.events.to_vec();
        events.sort_by_key(|e| e.sequence);
        events
    }
}

/// An event allocated by [`EventStorage::next_event`] that has not been
/// closed yet. It reaches the storage when passed to
/// [`EventStorage::close_event`].
#[derive(Debug)]
pub struct EventSlot {
    sequence: u64,
    start: u64,
    description: &'static EventDescription,
    kind: EventKind,
    category: bool,
}

impl EventSlot {
    /// Position of the event in the allocation order of its storage.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn is_category(&self) -> bool {
        self.category
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Thread,
    Fiber,
}

pub struct EventStorage {
    shared: Arc<SharedState>,
    halves: [UnsafeCell<StorageBuffers>; 2],
    /// Set while a recorder appends to the half with the same index.
    writing: [AtomicBool; 2],
    /// Index of the half recorders append to.
    front: AtomicUsize,
    /// Records moved out of the back half and not yet dumped.
    taken: Mutex<StorageBuffers>,
    next_sequence: AtomicU64,
    retired: AtomicBool,
    is_sampling: AtomicBool,
    kind: StorageKind,
}

// SAFETY: a half is only reached through `FrontGuard`, which holds its
// `writing` flag, or by a reader holding `taken` after it moved the half out
// of the front and saw its `writing` flag clear.
unsafe impl Sync for EventStorage {}

struct FrontGuard<'a> {
    storage: &'a EventStorage,
    half: usize,
}

impl Deref for FrontGuard<'_> {
    type Target = StorageBuffers;

    fn deref(&self) -> &StorageBuffers {
        // SAFETY: the guard holds the half's `writing` flag.
        unsafe { &*self.storage.halves[self.half].get() }
    }
}

impl DerefMut for FrontGuard<'_> {
    fn deref_mut(&mut self) -> &mut StorageBuffers {
        // SAFETY: the guard holds the half's `writing` flag.
        unsafe { &mut *self.storage.halves[self.half].get() }
    }
}

impl Drop for FrontGuard<'_> {
    fn drop(&mut self) {
        self.storage.writing[self.half].store(false, Ordering::Release);
    }
}

fn backoff() {
    for _ in 0..64 {
        std::hint::spin_loop();
    }
    std::thread::yield_now();
}

impl EventStorage {
    pub(crate) fn new(shared: Arc<SharedState>, kind: StorageKind) -> Self {
        Self {
            shared,
            halves: [
                UnsafeCell::new(StorageBuffers::default()),
                UnsafeCell::new(StorageBuffers::default()),
            ],
            writing: [AtomicBool::new(false), AtomicBool::new(false)],
            front: AtomicUsize::new(0),
            taken: Mutex::new(StorageBuffers::default()),
            next_sequence: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            is_sampling: AtomicBool::new(false),
            kind,
        }
    }

    /// Claim the front half for one append.
    ///
    /// The `writing` flag is published before `front` is read again, and a
    /// reader swaps `front` before it reads `writing`, so either the reader
    /// waits for this append or the append sees the swap and moves on to the
    /// new front.
    fn enter_front(&self) -> FrontGuard<'_> {
        loop {
            let half = self.front.load(Ordering::SeqCst);
            if self.writing[half]
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // Another recorder shares this storage.
                backoff();
                continue;
            }
            if self.front.load(Ordering::SeqCst) == half {
                return FrontGuard {
                    storage: self,
                    half,
                };
            }
            self.writing[half].store(false, Ordering::Release);
        }
    }

    fn lock_taken(&self) -> MutexGuard<'_, StorageBuffers> {
        self.taken.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap the halves and move everything recorded into the old front into
    /// `taken`.
    fn collect(&self, taken: &mut StorageBuffers) {
        let old = self.front.load(Ordering::SeqCst);
        self.front.store(old ^ 1, Ordering::SeqCst);
        while self.writing[old].load(Ordering::SeqCst) {
            backoff();
        }
        // SAFETY: recorders that start from here on see the new front, and the
        // last one on `old` has released it. Holding `taken` excludes other
        // readers.
        let half = unsafe { &mut *self.halves[old].get() };
        taken.append(half);
        half.clear(true);
    }

    pub(crate) fn accepts_events(&self) -> bool {
        self.shared.is_enabled() && !self.retired.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Current capture timestamp in nanoseconds.
    pub fn now(&self) -> u64 {
        self.shared.timestamp_nanos()
    }

    /// Allocate an open event starting at `start`.
    ///
    /// Returns `None` when capture is off or the storage was retired.
    pub fn next_event(
        &self,
        description: &'static EventDescription,
        start: u64,
        kind: EventKind,
    ) -> Option<EventSlot> {
        if !self.accepts_events() {
            return None;
        }
        Some(EventSlot {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            start,
            description,
            kind,
            category: false,
        })
    }

    /// Record an event that has already finished.
    pub fn record_event(
        &self,
        description: &'static EventDescription,
        time: EventTime,
        kind: EventKind,
    ) -> Option<u64> {
        let slot = self.next_event(description, time.start, kind)?;
        let sequence = slot.sequence;
        self.close_event(slot, time.finish);
        Some(sequence)
    }

    /// Close `slot` at `finish` and store it. An event allocated while capture
    /// was on is kept even if it closes after a dump or a stop.
    pub fn close_event(&self, slot: EventSlot, finish: u64) {
        let mut buffers = self.enter_front();
        buffers.events.add(EventData {
            time: EventTime::new(slot.start, finish),
            description: slot.description,
            kind: slot.kind,
            sequence: slot.sequence,
        });
        if slot.category {
            buffers.categories.add(slot.sequence);
        }
    }

    /// Mark the event in `slot` as a category event. Only events with a colored
    /// description qualify.
    pub fn register_category(&self, slot: &mut EventSlot) -> bool {
        if slot.description.color().is_null() {
            return false;
        }
        slot.category = true;
        true
    }

    pub fn push_sync(&self, data: SyncData) -> bool {
        if !self.accepts_events() {
            return false;
        }
        self.enter_front().synchronization.add(data);
        true
    }

    pub fn push_fiber_sync(&self, data: FiberSyncData) -> bool {
        if !self.accepts_events() {
            return false;
        }
        self.enter_front().fiber_sync.add(data);
        true
    }

    pub fn is_sampling(&self) -> bool {
        self.is_sampling.load(Ordering::Relaxed)
    }

    pub fn set_sampling(&self, sampling: bool) {
        self.is_sampling.store(sampling, Ordering::Relaxed);
    }

    /// Stop accepting new events. Already recorded events stay until drained.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Relaxed)
    }

    /// Run `f` over everything recorded and not yet cleared. Recording goes on
    /// into the other half meanwhile.
    pub(crate) fn drain<R>(&self, f: impl FnOnce(&mut StorageBuffers) -> R) -> R {
        let mut taken = self.lock_taken();
        self.collect(&mut taken);
        f(&mut *taken)
    }

    pub fn clear(&self, preserve_content: bool) {
        self.drain(|buffers| buffers.clear(preserve_content));
    }

    /// Number of closed events recorded since the last clear.
    pub fn event_count(&self) -> usize {
        self.drain(|buffers| buffers.events.len())
    }

    /// Copy of the closed events recorded since the last clear, in allocation
    /// order.
    pub fn events(&self) -> Vec<EventData> {
        self.drain(|buffers| buffers.events_in_order())
    }
}

thread_local! {
    static ACTIVE_STORAGE: RefCell<Option<Arc<EventStorage>>> = const { RefCell::new(None) };
}

/// Replace the calling thread's active storage, returning the previous one.
pub(crate) fn install_active_storage(
    storage: Option<Arc<EventStorage>>,
) -> Option<Arc<EventStorage>> {
    ACTIVE_STORAGE
        .try_with(|cell| cell.replace(storage))
        .ok()
        .flatten()
}

/// Clear the calling thread's active storage if it is `storage`.
pub(crate) fn release_active_storage(storage: &Arc<EventStorage>) {
    let _ = ACTIVE_STORAGE.try_with(|cell| {
        let mut active = cell.borrow_mut();
        if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, storage)) {
            *active = None;
        }
    });
}

/// Storage events on the calling thread are currently recorded into.
pub fn active_storage() -> Option<Arc<EventStorage>> {
    ACTIVE_STORAGE
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Open a scope on the calling context's storage; it closes when the guard is
/// dropped. A no-op when the context is not registered or capture is off.
pub fn scope(description: &'static EventDescription) -> ScopeGuard {
    ScopeGuard::begin(description, EventKind::Scope, None)
}

/// Like [`scope`], but the span is also kept as a synchronization wait with
/// the given `reason`.
pub fn sync_scope(description: &'static EventDescription, reason: u8) -> ScopeGuard {
    ScopeGuard::begin(description, EventKind::Sync, Some(reason))
}

#[must_use = "the scope closes when the guard is dropped"]
pub struct ScopeGuard {
    active: Option<ActiveScope>,
}

struct ActiveScope {
    storage: Arc<EventStorage>,
    slot: EventSlot,
    sync_reason: Option<u8>,
}

impl ScopeGuard {
    fn begin(
        description: &'static EventDescription,
        kind: EventKind,
        sync_reason: Option<u8>,
    ) -> Self {
        let active = ACTIVE_STORAGE
            .try_with(|cell| {
                let active = cell.borrow();
                let storage = active.as_ref()?;
                if !storage.accepts_events() {
                    return None;
                }
                let start = storage.now();
                let mut slot = storage.next_event(description, start, kind)?;
                storage.register_category(&mut slot);
                Some(ActiveScope {
                    storage: storage.clone(),
                    slot,
                    sync_reason,
                })
            })
            .ok()
            .flatten();
        Self { active }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let finish = active.storage.now();
        if let Some(reason) = active.sync_reason {
            active.storage.enter_front().synchronization.add(SyncData {
                start: active.slot.start,
                finish,
                core: current_cpu(),
                reason,
                new_thread_id: 0,
            });
        }
        active.storage.close_event(active.slot, finish);
    }
}

fn current_cpu() -> u8 {
    // SAFETY: sched_getcpu has no preconditions; it returns -1 on failure.
    let cpu = unsafe { libc::sched_getcpu() };
    u8::try_from(cpu).unwrap_or(u8::MAX)
}
