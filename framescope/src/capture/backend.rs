//! Boundary to the platform services that feed the engine from outside the
//! application threads: the scheduler trace (context switches, syscalls) and
//! the stack sampler.

use crate::capture::registry::ThreadDescription;
use crate::capture::status::CaptureStatus;

/// What a capture session asks the backend to collect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendRequest {
    pub sampling: bool,
    pub switch_contexts: bool,
    pub syscalls: bool,
    /// Threads registered when the session starts.
    pub threads: Vec<ThreadDescription>,
}

pub trait TraceBackend: Send {
    /// Begin collecting. Anything other than [`CaptureStatus::Ok`] aborts the
    /// session start.
    fn start(&mut self, request: &BackendRequest) -> CaptureStatus;
    fn stop(&mut self);
}

/// Backend for processes without a scheduler trace or sampler.
#[derive(Debug, Default)]
pub struct NullBackend;

impl TraceBackend for NullBackend {
    fn start(&mut self, _request: &BackendRequest) -> CaptureStatus {
        CaptureStatus::Ok
    }

    fn stop(&mut self) {}
}
