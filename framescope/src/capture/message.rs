//! Records the engine sends to its output sink.

use crate::capture::events::{Callstack, Color, EventTime, FiberSyncData, SyncData, SysCallDesc};
use crate::capture::registry::ThreadDescription;
use crate::capture::scope_data::ScopeData;
use crate::capture::status::CaptureStatus;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "message")]
pub enum Message {
    /// Answer to a capture start request.
    Handshake { status: CaptureStatus },
    Progress { text: String },
    /// Maps a description id used by later records to its name and origin.
    /// Emitted once per output file before the first record that uses it.
    DescriptionDef {
        id: u32,
        name: String,
        file: String,
        line: u32,
        color: Color,
    },
    FrameBoard(FrameBoard),
    Scope(ScopeData),
    Synchronization {
        board_number: u32,
        thread_number: i32,
        records: Vec<SyncData>,
    },
    FiberSynchronization {
        board_number: u32,
        fiber_number: i32,
        records: Vec<FiberSyncData>,
    },
    SysCalls {
        board_number: u32,
        records: Vec<SysCallDesc>,
    },
    SamplingData { callstacks: Vec<Callstack> },
    /// Closes the records of a frame board.
    FramesEnd { board_number: u32 },
}

/// Everything the viewer needs to lay out one dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameBoard {
    pub board_number: u32,
    /// Time slice covered by the dump.
    pub time: EventTime,
    /// Timestamp ticks per second.
    pub frequency: u64,
    pub frames: Vec<EventTime>,
    pub threads: Vec<ThreadDescription>,
    pub fibers: Vec<u64>,
}

impl Message {
    /// Description ids referenced by this message.
    pub fn description_ids(&self) -> impl Iterator<Item = u32> + '_ {
        let scope = match self {
            Message::Scope(scope) => Some(scope),
            _ => None,
        };
        scope.into_iter().flat_map(|scope| {
            scope
                .events
                .iter()
                .chain(scope.categories.iter())
                .map(|e| e.description_id)
        })
    }
}
