use crate::capture::description::EventDescription;
use serde::Serialize;
use std::cell::Cell;

/// Finish timestamp of an event that has not been closed yet.
pub const EVENT_OPEN: u64 = u64::MAX;

/// ARGB color attached to an event description. Any non-null color marks
/// events of that kind as categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Color(pub u32);

impl Color {
    pub const NULL: Color = Color(0);
    pub const RED: Color = Color(0xFFFF_0000);
    pub const GREEN: Color = Color(0xFF00_8000);
    pub const BLUE: Color = Color(0xFF00_00FF);
    pub const ORANGE: Color = Color(0xFFFF_A500);
    pub const PURPLE: Color = Color(0xFF80_0080);
    pub const GRAY: Color = Color(0xFF80_8080);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// A `[start, finish]` span in nanoseconds since capture clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventTime {
    pub start: u64,
    pub finish: u64,
}

impl EventTime {
    pub fn new(start: u64, finish: u64) -> Self {
        Self { start, finish }
    }

    pub fn open(start: u64) -> Self {
        Self {
            start,
            finish: EVENT_OPEN,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.finish != EVENT_OPEN
    }

    /// True if `other` lies entirely inside this span.
    pub fn contains(&self, other: &EventTime) -> bool {
        self.start <= other.start && other.finish <= self.finish
    }

    pub fn contains_timestamp(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp <= self.finish
    }

    pub fn duration_nanos(&self) -> u64 {
        self.finish.saturating_sub(self.start)
    }
}

/// Payload variant of a recorded event, written on the wire as a one-byte tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Scope = 0,
    /// A wait on a synchronization primitive.
    Sync = 1,
    /// Time a fiber spent running on the recording thread.
    FiberSwitch = 2,
}

impl EventKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Scope),
            1 => Some(Self::Sync),
            2 => Some(Self::FiberSwitch),
            _ => None,
        }
    }
}

/// In-memory event as held by an event storage.
#[derive(Debug, Clone, Copy)]
pub struct EventData {
    pub time: EventTime,
    pub description: &'static EventDescription,
    pub kind: EventKind,
    /// Position in the allocation order of the owning storage.
    pub sequence: u64,
}

impl EventData {
    pub fn is_closed(&self) -> bool {
        self.time.is_closed()
    }

    pub fn is_category(&self) -> bool {
        !self.description.color().is_null()
    }

    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            start: self.time.start,
            finish: self.time.finish,
            description_id: self.description.id(),
            kind: self.kind,
        }
    }
}

/// Wire form of an event: the description is referenced by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    #[serde(rename = "start_ns")]
    pub start: u64,
    #[serde(rename = "finish_ns")]
    pub finish: u64,
    #[serde(rename = "desc")]
    pub description_id: u32,
    pub kind: EventKind,
}

impl EventRecord {
    pub fn time(&self) -> EventTime {
        EventTime::new(self.start, self.finish)
    }
}

/// A span during which a thread was on a core, or was waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncData {
    #[serde(rename = "start_ns")]
    pub start: u64,
    #[serde(rename = "finish_ns")]
    pub finish: u64,
    pub core: u8,
    pub reason: u8,
    /// Thread that took over the core when this span ended, 0 if unknown.
    pub new_thread_id: u64,
}

/// A span during which a fiber ran on `thread_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FiberSyncData {
    #[serde(rename = "start_ns")]
    pub start: u64,
    #[serde(rename = "finish_ns")]
    pub finish: u64,
    pub thread_id: u64,
}

/// A context switch as reported by the scheduler trace backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchContextDesc {
    #[serde(rename = "timestamp_ns")]
    pub timestamp: u64,
    pub old_thread_id: u64,
    pub new_thread_id: u64,
    pub cpu_id: u8,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SysCallDesc {
    #[serde(rename = "timestamp_ns")]
    pub timestamp: u64,
    pub id: u64,
    pub thread_id: u64,
}

/// A stack walk handed over by the sampler. The addresses are borrowed; the
/// collector copies them.
#[derive(Debug, Clone, Copy)]
pub struct CallstackDesc<'a> {
    pub thread_id: u64,
    pub timestamp: u64,
    pub callstack: &'a [u64],
}

/// An owned stack sample as emitted in sampling data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Callstack {
    pub thread_id: u64,
    #[serde(rename = "timestamp_ns")]
    pub timestamp: u64,
    pub frames: Vec<u64>,
}

/// OS thread id of the calling thread, cached per thread.
pub fn current_tid() -> u64 {
    thread_local! {
        static TID: Cell<u64> = const { Cell::new(0) };
    }
    TID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        // SAFETY: SYS_gettid takes no arguments and always succeeds.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        cell.set(tid);
        tid
    })
}
