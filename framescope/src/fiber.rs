//! Fibers: cooperative execution contexts with their own event storage.
//!
//! While a fiber is entered on a thread, scopes opened on that thread land in
//! the fiber's storage. The thread's own storage gets one `FiberSwitch` event
//! covering the time the fiber ran, and the fiber keeps a record of which
//! thread hosted it.

use crate::capture::description::EventDescription;
use crate::capture::events::{Color, EventKind, FiberSyncData, current_tid};
use crate::capture::registry::FiberEntry;
use crate::capture::storage::{self, EventSlot, EventStorage};
use pin_project_lite::pin_project;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

fn fiber_switch_description() -> &'static EventDescription {
    static DESCRIPTION: OnceLock<&'static EventDescription> = OnceLock::new();
    DESCRIPTION
        .get_or_init(|| EventDescription::create("Fiber Switch", file!(), line!(), Color::NULL))
}

/// Handle to a registered fiber. Obtained via `CaptureEngine::register_fiber`.
#[derive(Clone)]
pub struct FiberHandle {
    entry: Arc<FiberEntry>,
}

impl FiberHandle {
    pub(crate) fn new(entry: Arc<FiberEntry>) -> Self {
        Self { entry }
    }

    pub fn id(&self) -> u64 {
        self.entry.description().id
    }

    pub fn storage(&self) -> &Arc<EventStorage> {
        self.entry.storage()
    }

    pub fn is_alive(&self) -> bool {
        self.entry.is_alive()
    }

    /// Make this fiber the recording target of the calling thread until the
    /// guard is dropped.
    pub fn enter(&self) -> FiberGuard {
        let fiber = self.entry.storage().clone();
        let start = fiber.now();
        let previous = storage::install_active_storage(Some(fiber.clone()));
        let switch_slot = previous.as_ref().and_then(|thread| {
            thread.next_event(fiber_switch_description(), start, EventKind::FiberSwitch)
        });
        FiberGuard {
            fiber,
            previous,
            switch_slot,
            start,
            thread_id: current_tid(),
            _not_send: PhantomData,
        }
    }

    /// Mark the fiber as finished. It is removed from the registry between
    /// capture sessions.
    pub fn finish(&self) {
        self.entry.mark_dead();
    }
}

/// Restores the thread's previous recording target on drop.
#[must_use = "the fiber is left when the guard is dropped"]
pub struct FiberGuard {
    fiber: Arc<EventStorage>,
    previous: Option<Arc<EventStorage>>,
    switch_slot: Option<EventSlot>,
    start: u64,
    thread_id: u64,
    // Must be dropped on the thread that entered the fiber.
    _not_send: PhantomData<*const ()>,
}

impl Drop for FiberGuard {
    fn drop(&mut self) {
        let finish = self.fiber.now();
        self.fiber.push_fiber_sync(FiberSyncData {
            start: self.start,
            finish,
            thread_id: self.thread_id,
        });
        if let (Some(thread), Some(slot)) = (&self.previous, self.switch_slot.take()) {
            thread.close_event(slot, finish);
        }
        storage::install_active_storage(self.previous.take());
    }
}

pin_project! {
    /// Future wrapper that runs every poll of the inner future inside a fiber.
    /// The fiber is finished when the wrapper is dropped.
    pub struct FiberScoped<F> {
        #[pin]
        inner: F,
        fiber: FiberHandle,
    }

    impl<F> PinnedDrop for FiberScoped<F> {
        fn drop(this: Pin<&mut Self>) {
            this.project().fiber.finish();
        }
    }
}

impl<F> FiberScoped<F> {
    pub fn new(inner: F, fiber: FiberHandle) -> Self {
        Self { inner, fiber }
    }

    pub fn fiber(&self) -> &FiberHandle {
        &self.fiber
    }
}

impl<F: Future> Future for FiberScoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.fiber.enter();
        this.inner.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureEngine, CaptureStatus, FiberDescription, NullWriter, scope};

    fn engine() -> CaptureEngine {
        CaptureEngine::builder().build(Box::new(NullWriter)).unwrap()
    }

    #[test]
    fn test_enter_redirects_scopes_to_fiber() {
        let engine = engine();
        let thread = engine.register_current_thread().unwrap();
        let fiber = engine.register_fiber(FiberDescription { id: 42 }).unwrap();
        assert_eq!(engine.start_capture(), CaptureStatus::Ok);

        let work = EventDescription::here("fiber::work", Color::NULL);
        {
            let _inside = fiber.enter();
            let _scope = scope(work);
        }
        drop(scope(work));

        let fiber_events = fiber.storage().events();
        assert_eq!(fiber_events.len(), 1);
        assert!(fiber_events[0].is_closed());

        let thread_events = thread.storage().events();
        assert_eq!(thread_events.len(), 2);
        assert_eq!(thread_events[0].kind, EventKind::FiberSwitch);
        assert!(thread_events[0].is_closed());

        engine.unregister_current_thread();
    }

    #[test]
    fn test_scoped_future_runs_inside_fiber() {
        let engine = engine();
        engine.register_current_thread().unwrap();
        assert_eq!(engine.start_capture(), CaptureStatus::Ok);

        let work = EventDescription::here("fiber::async_work", Color::NULL);
        let future = engine
            .fiber_scoped(async move {
                let _scope = scope(work);
                tokio::task::yield_now().await;
            })
            .unwrap();
        let fiber = future.fiber().clone();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(future);

        assert!(!fiber.is_alive());
        assert_eq!(fiber.storage().events().len(), 1);
        fiber.storage().drain(|buffers| {
            assert_eq!(buffers.fiber_sync.len(), 2, "one span per poll");
        });
        engine.unregister_current_thread();
    }
}
