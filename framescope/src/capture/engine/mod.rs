//! The capture engine: registry, capture state machine and dump driver.

mod dump;
mod event_writer;
mod flush_state;
mod outbound;
mod shared_state;

pub(crate) use shared_state::SharedState;

use crate::capture::backend::{BackendRequest, NullBackend, TraceBackend};
use crate::capture::clock::Clock;
use crate::capture::collector::{CallstackCollector, SwitchContextCollector, SysCallCollector};
use crate::capture::events::{CallstackDesc, EventTime, SwitchContextDesc, SysCallDesc};
use crate::capture::message::Message;
use crate::capture::registry::{
    FiberDescription, FiberEntry, Registry, ThreadDescription, ThreadEntry,
};
use crate::capture::status::{
    CaptureCommand, CaptureError, CaptureStatus, RegistrationError, SwitchContextResult,
};
use crate::capture::storage;
use crate::capture::writer::TraceWriter;
use crate::fiber::{FiberHandle, FiberScoped};
use dump::DumpInput;
use outbound::OutboundSender;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Limits and collection switches of a capture engine.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub max_threads: usize,
    pub max_fibers: usize,
    /// Minimum time between two progress reports.
    pub progress_interval: Duration,
    /// Ask the backend for stack sampling and accept stack walks.
    pub sampling: bool,
    pub switch_contexts: bool,
    pub syscalls: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_threads: 256,
            max_fibers: 4096,
            progress_interval: Duration::from_millis(200),
            sampling: false,
            switch_contexts: false,
            syscalls: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Inactive,
    Active,
    /// Capture is off and the final dump is being assembled.
    Dumping,
}

struct ControlState {
    state: CaptureState,
    /// Frame boundaries since the last dump. The last one is open while active.
    frames: Vec<EventTime>,
    /// Frames started in the current session.
    frame_count: u64,
    next_board: u32,
    last_progress: u64,
    backend: Box<dyn TraceBackend>,
}

pub struct CaptureEngineBuilder {
    config: CaptureConfig,
    backend: Box<dyn TraceBackend>,
    clock: Clock,
}

impl CaptureEngineBuilder {
    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backend(mut self, backend: impl TraceBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn with_clock(mut self, clock: impl Into<Clock>) -> Self {
        self.clock = clock.into();
        self
    }

    /// Build the engine. Starts the thread that owns `writer`.
    pub fn build(self, writer: Box<dyn TraceWriter>) -> std::io::Result<CaptureEngine> {
        let outbound = OutboundSender::spawn(writer)?;
        Ok(CaptureEngine {
            shared: Arc::new(SharedState::new(self.clock)),
            registry: Mutex::new(Registry::new(
                self.config.max_threads,
                self.config.max_fibers,
            )),
            control: Mutex::new(ControlState {
                state: CaptureState::Inactive,
                frames: Vec::new(),
                frame_count: 0,
                next_board: 0,
                last_progress: 0,
                backend: self.backend,
            }),
            switch_contexts: SwitchContextCollector::new(),
            syscalls: SysCallCollector::new(),
            callstacks: CallstackCollector::new(),
            next_fiber_id: AtomicU64::new(1),
            outbound,
            config: self.config,
        })
    }
}

/// Lock ordering: `control` before `registry`.
pub struct CaptureEngine {
    shared: Arc<SharedState>,
    registry: Mutex<Registry>,
    control: Mutex<ControlState>,
    switch_contexts: SwitchContextCollector,
    syscalls: SysCallCollector,
    callstacks: CallstackCollector,
    next_fiber_id: AtomicU64,
    outbound: OutboundSender,
    config: CaptureConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CaptureEngine {
    pub fn builder() -> CaptureEngineBuilder {
        CaptureEngineBuilder {
            config: CaptureConfig::default(),
            backend: Box::new(NullBackend),
            clock: Clock::monotonic(),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Current capture timestamp in nanoseconds.
    pub fn now(&self) -> u64 {
        self.shared.timestamp_nanos()
    }

    pub fn state(&self) -> CaptureState {
        lock(&self.control).state
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_enabled()
    }

    // --- Registry ---

    pub fn register_thread(
        &self,
        description: ThreadDescription,
    ) -> Result<Arc<ThreadEntry>, RegistrationError> {
        let entry = lock(&self.registry).add_thread(description, &self.shared);
        match &entry {
            Ok(entry) => {
                entry
                    .storage()
                    .set_sampling(self.shared.sampling.load(Ordering::Relaxed));
                debug!(
                    thread_id = entry.description().thread_id,
                    name = %entry.description().name,
                    "registered thread"
                );
            }
            Err(error) => warn!(%error, "thread registration failed"),
        }
        entry
    }

    /// Register the calling thread and make its storage the target of
    /// [`scope`](crate::capture::scope()) on this thread.
    pub fn register_current_thread(&self) -> Result<Arc<ThreadEntry>, RegistrationError> {
        let entry = self.register_thread(ThreadDescription::current())?;
        storage::install_active_storage(Some(entry.storage().clone()));
        Ok(entry)
    }

    /// Mark the thread dead. Its recorded events are still part of the next
    /// dump; the entry itself is removed between capture sessions.
    pub fn unregister_thread(&self, thread_id: u64) -> bool {
        let Some(entry) = lock(&self.registry).unregister_thread(thread_id) else {
            return false;
        };
        storage::release_active_storage(entry.storage());
        debug!(thread_id, "unregistered thread");
        true
    }

    pub fn unregister_current_thread(&self) -> bool {
        self.unregister_thread(crate::capture::events::current_tid())
    }

    pub fn is_registered_thread(&self, thread_id: u64) -> bool {
        lock(&self.registry).is_registered_thread(thread_id)
    }

    /// Thread entries in registration order, including dead entries that
    /// have not been cleaned up yet.
    pub fn threads(&self) -> Vec<Arc<ThreadEntry>> {
        lock(&self.registry).threads().to_vec()
    }

    pub fn register_fiber(
        &self,
        description: FiberDescription,
    ) -> Result<FiberHandle, RegistrationError> {
        let entry = lock(&self.registry).add_fiber(description, &self.shared);
        match entry {
            Ok(entry) => {
                debug!(fiber_id = description.id, "registered fiber");
                Ok(FiberHandle::new(entry))
            }
            Err(error) => {
                warn!(%error, "fiber registration failed");
                Err(error)
            }
        }
    }

    pub fn unregister_fiber(&self, id: u64) -> bool {
        lock(&self.registry).unregister_fiber(id).is_some()
    }

    pub fn fibers(&self) -> Vec<Arc<FiberEntry>> {
        lock(&self.registry).fibers().to_vec()
    }

    /// Run `future` as a fiber with a freshly allocated id. The fiber is
    /// unregistered when the wrapper is dropped.
    pub fn fiber_scoped<F: Future>(
        &self,
        future: F,
    ) -> Result<FiberScoped<F>, RegistrationError> {
        let id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        let fiber = self.register_fiber(FiberDescription { id })?;
        Ok(FiberScoped::new(future, fiber))
    }

    // --- Capture state machine ---

    /// Start (`true`) or stop (`false`) capturing.
    pub fn activate(&self, enable: bool) -> CaptureStatus {
        if enable {
            self.start_capture()
        } else {
            self.stop_capture()
        }
    }

    pub fn start_capture(&self) -> CaptureStatus {
        let mut control = lock(&self.control);
        if control.state != CaptureState::Inactive {
            return self.handshake(CaptureStatus::TracerAlreadyExists);
        }

        let entries = self.threads();
        let request = BackendRequest {
            sampling: self.config.sampling,
            switch_contexts: self.config.switch_contexts,
            syscalls: self.config.syscalls,
            threads: entries.iter().map(|t| t.description().clone()).collect(),
        };
        let status = control.backend.start(&request);
        if !status.is_ok() {
            warn!(?status, "trace backend refused to start");
            return self.handshake(status);
        }

        // Leftovers from recorders that raced the previous stop.
        for entry in &entries {
            entry.storage().clear(true);
            entry.storage().set_sampling(self.config.sampling);
        }
        for fiber in self.fibers() {
            fiber.storage().clear(true);
        }
        self.switch_contexts.clear(true);
        self.syscalls.clear(true);
        self.callstacks.take();

        let now = self.now();
        control.frames.clear();
        control.frames.push(EventTime::open(now));
        control.frame_count = 1;
        control.last_progress = now;
        self.shared
            .sampling
            .store(self.config.sampling, Ordering::Relaxed);
        self.shared.enabled.store(true, Ordering::Release);
        control.state = CaptureState::Active;
        info!(threads = entries.len(), "capture started");
        self.handshake(CaptureStatus::Ok)
    }

    /// Stop capturing, dump everything recorded since the last dump and wait
    /// until it has been written out.
    pub fn stop_capture(&self) -> CaptureStatus {
        let mut control = lock(&self.control);
        if control.state != CaptureState::Active {
            debug!("stop requested while not capturing");
            return CaptureStatus::Ok;
        }
        control.state = CaptureState::Dumping;
        self.shared.enabled.store(false, Ordering::SeqCst);
        control.backend.stop();

        let now = self.now();
        if let Some(frame) = control.frames.last_mut() {
            frame.finish = now;
        }
        let mut messages = self.assemble_board(&mut control, false);
        messages.extend(self.sampling_messages());

        self.shared.sampling.store(false, Ordering::Relaxed);
        let reaped = {
            let mut registry = lock(&self.registry);
            for entry in registry.threads() {
                entry.storage().set_sampling(false);
            }
            registry.reap_dead()
        };
        control.frames.clear();
        control.state = CaptureState::Inactive;
        drop(control);

        info!(reaped, "capture stopped");
        let result = self
            .outbound
            .send(messages)
            .and_then(|()| self.outbound.flush());
        match result {
            Ok(()) => CaptureStatus::Ok,
            Err(error) => {
                warn!(%error, "failed to flush capture output");
                CaptureStatus::Failed
            }
        }
    }

    /// Close the current frame and open the next one. While inactive this
    /// removes entries of contexts that were unregistered.
    pub fn next_frame(&self) {
        let mut control = lock(&self.control);
        match control.state {
            CaptureState::Active => {
                let now = self.now();
                if let Some(frame) = control.frames.last_mut() {
                    frame.finish = now;
                }
                if self.take_progress_slot(&mut control, now) {
                    let text = format!("Capturing Frame {}...", control.frame_count);
                    self.send(vec![Message::Progress { text }]);
                }
                control.frames.push(EventTime::open(now));
                control.frame_count += 1;
            }
            CaptureState::Inactive => {
                let reaped = lock(&self.registry).reap_dead();
                if reaped > 0 {
                    debug!(reaped, "removed unregistered contexts");
                }
            }
            CaptureState::Dumping => {}
        }
    }

    /// Dump the frames accumulated so far without ending the session.
    pub fn dump_frames(&self) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        if control.state != CaptureState::Active {
            return Ok(());
        }
        let now = self.now();
        if let Some(frame) = control.frames.last_mut() {
            frame.finish = now;
        }
        let messages = self.assemble_board(&mut control, true);
        control.frames.clear();
        control.frames.push(EventTime::open(now));
        drop(control);
        self.outbound.send(messages)
    }

    /// Emit and clear the collected stack samples.
    pub fn dump_sampling_data(&self) -> Result<(), CaptureError> {
        let messages = self.sampling_messages();
        self.outbound.send(messages)
    }

    pub fn dump_progress(&self, text: impl Into<String>) {
        self.send(vec![Message::Progress { text: text.into() }]);
    }

    /// True at most once per progress interval.
    pub fn is_time_to_report_progress(&self) -> bool {
        let mut control = lock(&self.control);
        let now = self.now();
        self.take_progress_slot(&mut control, now)
    }

    /// Entry point for a remote controller.
    pub fn handle_command(&self, command: CaptureCommand) -> CaptureStatus {
        debug!(?command, "capture command");
        match command {
            CaptureCommand::Start => self.start_capture(),
            CaptureCommand::Stop => self.stop_capture(),
            CaptureCommand::RequestProgress => {
                let (state, frame_count) = {
                    let control = lock(&self.control);
                    (control.state, control.frame_count)
                };
                self.dump_progress(format!("{state:?}: {frame_count} frames"));
                CaptureStatus::Ok
            }
        }
    }

    /// Wait until everything queued for output has been written and flushed.
    pub fn flush_output(&self) -> Result<(), CaptureError> {
        self.outbound.flush()
    }

    // --- Auxiliary ingestion ---

    pub fn report_switch_context(&self, desc: SwitchContextDesc) -> SwitchContextResult {
        let result = {
            let registry = lock(&self.registry);
            SwitchContextResult::classify(
                registry.is_registered_thread(desc.old_thread_id),
                registry.is_registered_thread(desc.new_thread_id),
            )
        };
        if self.shared.is_enabled() && result != SwitchContextResult::OtherProcess {
            self.switch_contexts.add(desc);
        }
        result
    }

    pub fn report_sys_call(&self, desc: SysCallDesc) {
        if self.shared.is_enabled() {
            self.syscalls.add(desc);
        }
    }

    /// Accept a stack walk for a registered, sampling thread. Anything else is
    /// dropped and reported as `false`.
    pub fn report_stack_walk(&self, desc: &CallstackDesc<'_>) -> bool {
        if !self.shared.is_enabled() || desc.callstack.is_empty() {
            return false;
        }
        let sampling = lock(&self.registry)
            .find_thread(desc.thread_id)
            .is_some_and(|entry| entry.storage().is_sampling());
        if sampling {
            self.callstacks.add(desc);
        }
        sampling
    }

    // --- Internals ---

    fn send(&self, messages: Vec<Message>) {
        if let Err(error) = self.outbound.send(messages) {
            warn!(%error, "dropping capture output");
        }
    }

    fn handshake(&self, status: CaptureStatus) -> CaptureStatus {
        self.send(vec![Message::Handshake { status }]);
        status
    }

    fn take_progress_slot(&self, control: &mut ControlState, now: u64) -> bool {
        let interval = self.config.progress_interval.as_nanos() as u64;
        if now.saturating_sub(control.last_progress) < interval {
            return false;
        }
        control.last_progress = now;
        true
    }

    fn assemble_board(&self, control: &mut ControlState, preserve_content: bool) -> Vec<Message> {
        let (threads, fibers) = {
            let registry = lock(&self.registry);
            (registry.threads().to_vec(), registry.fibers().to_vec())
        };
        let slice = match (control.frames.first(), control.frames.last()) {
            (Some(first), Some(last)) => EventTime::new(first.start, last.finish),
            _ => EventTime::new(0, self.now()),
        };
        let board_number = control.next_board;
        control.next_board += 1;

        let messages = dump::assemble_board(&DumpInput {
            board_number,
            slice,
            frames: &control.frames,
            threads: &threads,
            fibers: &fibers,
            switches: &self.switch_contexts,
            syscalls: &self.syscalls,
            preserve_content,
        });
        self.switch_contexts.discard_through(slice.finish);
        self.syscalls.discard_through(slice.finish);
        debug!(board_number, records = messages.len(), "assembled frame board");
        messages
    }

    fn sampling_messages(&self) -> Vec<Message> {
        let callstacks = self.callstacks.take();
        if callstacks.is_empty() {
            return Vec::new();
        }
        vec![Message::SamplingData { callstacks }]
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if self.state() == CaptureState::Active {
            self.stop_capture();
        }
    }
}
