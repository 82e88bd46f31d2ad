pub mod backend;
pub mod buffer;
pub mod clock;
pub mod collector;
pub mod description;
pub mod engine;
pub mod events;
pub mod format;
pub mod global;
pub mod message;
pub mod reader;
pub mod registry;
pub mod scope_data;
pub mod status;
pub mod storage;
pub mod writer;

pub use backend::{BackendRequest, NullBackend, TraceBackend};
pub use clock::{Clock, ManualClock};
pub use description::EventDescription;
pub use engine::{CaptureConfig, CaptureEngine, CaptureEngineBuilder, CaptureState};
pub use events::{
    Callstack, CallstackDesc, Color, EventKind, EventRecord, EventTime, SwitchContextDesc,
    SysCallDesc,
};
pub use message::{FrameBoard, Message};
pub use reader::TraceReader;
pub use registry::{FiberDescription, ThreadDescription};
pub use scope_data::{ScopeData, ScopeHeader};
pub use status::{
    CaptureCommand, CaptureError, CaptureStatus, RegistrationError, SwitchContextResult,
};
pub use storage::{ScopeGuard, active_storage, scope, sync_scope};
pub use writer::{NullWriter, RotatingWriter, SimpleBinaryWriter, TraceWriter};
