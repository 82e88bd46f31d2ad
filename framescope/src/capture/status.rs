use serde::Serialize;
use thiserror::Error;

/// Answer to a capture start request, sent to the controller as a handshake.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureStatus {
    Ok = 0,
    TracerAlreadyExists = 1,
    TracerAccessDenied = 2,
    Failed = 3,
}

impl CaptureStatus {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::TracerAlreadyExists),
            2 => Some(Self::TracerAccessDenied),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// How a reported context switch relates to the registered threads.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchContextResult {
    /// Neither side belongs to this process.
    OtherProcess = 0,
    /// A registered thread was switched in.
    ThreadEnabled = 1,
    /// A registered thread was switched out in favor of a foreign one.
    ThreadDisabled = 2,
    /// Both sides are registered threads.
    InsideProcess = 3,
}

impl SwitchContextResult {
    pub fn classify(old_registered: bool, new_registered: bool) -> Self {
        match (old_registered, new_registered) {
            (true, true) => Self::InsideProcess,
            (false, true) => Self::ThreadEnabled,
            (true, false) => Self::ThreadDisabled,
            (false, false) => Self::OtherProcess,
        }
    }
}

/// Commands a remote controller can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    Start,
    Stop,
    RequestProgress,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("registry is full ({limit} entries)")]
    RegistryFull { limit: usize },
    #[error("thread {0} is already registered")]
    ThreadAlreadyRegistered(u64),
    #[error("fiber {0} is already registered")]
    FiberAlreadyRegistered(u64),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("capture output is closed")]
    OutputClosed,
}
