//! Binary capture format (v1).
//!
//! ## File layout
//! ```text
//! Header:  MAGIC (8 bytes) + VERSION (u32 LE) = 12 bytes
//!
//! Wire codes:
//!   0: Handshake            → code(u8) + status(u8)                                                         = 2 bytes
//!   1: Progress             → code(u8) + string                                                             = 3 + N bytes
//!   2: DescriptionDef       → code(u8) + id(u32) + color(u32) + line(u32) + name(string) + file(string)     = 17 + N + M bytes
//!   3: FrameBoard           → code(u8) + board(u32) + time(span) + frequency(u64)
//!                             + frame_count(u32) + frames(span * N)
//!                             + thread_count(u32) + threads((tid(u64) + foreign(u8) + name(string)) * N)
//!                             + fiber_count(u32) + fibers(u64 * N)
//!   4: Scope                → code(u8) + root(span) + board(u32) + thread(i32) + fiber(i32)
//!                             + category_count(u32) + categories(event * N)
//!                             + event_count(u32) + events(event * N)                                      = 37 + 21(N + M) bytes
//!   5: Synchronization      → code(u8) + board(u32) + thread(i32) + count(u32) + records(sync * N)         = 13 + 26N bytes
//!   6: FiberSynchronization → code(u8) + board(u32) + fiber(i32) + count(u32) + records(fiber_sync * N)    = 13 + 24N bytes
//!   7: SysCalls             → code(u8) + board(u32) + count(u32) + records(syscall * N)                     = 9 + 24N bytes
//!   8: SamplingData         → code(u8) + count(u32) + stacks((tid(u64) + ts(u64) + n(u16) + frames(u64 * n)) * N)
//!   9: FramesEnd            → code(u8) + board(u32)                                                         = 5 bytes
//!
//!   span       = start(u64) + finish(u64)                                            = 16 bytes
//!   event      = start(u64) + finish(u64) + description_id(u32) + kind(u8)           = 21 bytes
//!   sync       = start(u64) + finish(u64) + core(u8) + reason(u8) + new_tid(u64)     = 26 bytes
//!   fiber_sync = start(u64) + finish(u64) + tid(u64)                                 = 24 bytes
//!   syscall    = timestamp(u64) + id(u64) + tid(u64)                                 = 24 bytes
//!   string     = len(u16) + utf8 bytes, truncated to 65535 bytes
//! ```
//!
//! All integers are little-endian. Timestamps are nanoseconds on the capture
//! clock; the FrameBoard carries the clock frequency.

use crate::capture::events::{
    Callstack, Color, EventKind, EventRecord, EventTime, FiberSyncData, SyncData, SysCallDesc,
};
use crate::capture::message::{FrameBoard, Message};
use crate::capture::registry::ThreadDescription;
use crate::capture::scope_data::{ScopeData, ScopeHeader};
use crate::capture::status::CaptureStatus;
use std::io::{Error, ErrorKind, Read, Result, Write};

pub const MAGIC: &[u8; 8] = b"FRMSCOPE";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 12; // 8 magic + 4 version

const WIRE_HANDSHAKE: u8 = 0;
const WIRE_PROGRESS: u8 = 1;
const WIRE_DESCRIPTION_DEF: u8 = 2;
const WIRE_FRAME_BOARD: u8 = 3;
const WIRE_SCOPE: u8 = 4;
const WIRE_SYNCHRONIZATION: u8 = 5;
const WIRE_FIBER_SYNCHRONIZATION: u8 = 6;
const WIRE_SYSCALLS: u8 = 7;
const WIRE_SAMPLING_DATA: u8 = 8;
const WIRE_FRAMES_END: u8 = 9;

const SPAN_SIZE: usize = 16;
const EVENT_SIZE: usize = 21;
const SYNC_SIZE: usize = 26;
const FIBER_SYNC_SIZE: usize = 24;
const SYSCALL_SIZE: usize = 24;

/// Longest prefix of `s` that fits a u16 length, cut on a char boundary.
fn truncated(s: &str) -> &str {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn wire_string_size(s: &str) -> usize {
    2 + truncated(s).len()
}

/// Returns the wire size of a message.
pub fn wire_message_size(message: &Message) -> usize {
    match message {
        Message::Handshake { .. } => 2,
        Message::Progress { text } => 1 + wire_string_size(text),
        Message::DescriptionDef { name, file, .. } => {
            1 + 12 + wire_string_size(name) + wire_string_size(file)
        }
        Message::FrameBoard(board) => {
            1 + 4
                + SPAN_SIZE
                + 8
                + 4
                + SPAN_SIZE * board.frames.len()
                + 4
                + board
                    .threads
                    .iter()
                    .map(|t| 9 + wire_string_size(&t.name))
                    .sum::<usize>()
                + 4
                + 8 * board.fibers.len()
        }
        Message::Scope(scope) => {
            1 + SPAN_SIZE + 12 + 4 + 4 + EVENT_SIZE * (scope.categories.len() + scope.events.len())
        }
        Message::Synchronization { records, .. } => 13 + SYNC_SIZE * records.len(),
        Message::FiberSynchronization { records, .. } => 13 + FIBER_SYNC_SIZE * records.len(),
        Message::SysCalls { records, .. } => 9 + SYSCALL_SIZE * records.len(),
        Message::SamplingData { callstacks } => {
            1 + 4
                + callstacks
                    .iter()
                    .map(|c| 18 + 8 * c.frames.len().min(u16::MAX as usize))
                    .sum::<usize>()
        }
        Message::FramesEnd { .. } => 5,
    }
}

pub fn write_header(w: &mut impl Write) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())
}

pub fn read_header(r: &mut impl Read) -> Result<(String, u32)> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    let version = read_u32(r)?;
    Ok((String::from_utf8_lossy(&magic).to_string(), version))
}

/// Write one message to the wire.
pub fn write_message(w: &mut impl Write, message: &Message) -> Result<()> {
    match message {
        Message::Handshake { status } => {
            w.write_all(&[WIRE_HANDSHAKE, *status as u8])?;
        }
        Message::Progress { text } => {
            w.write_all(&[WIRE_PROGRESS])?;
            write_string(w, text)?;
        }
        Message::DescriptionDef {
            id,
            name,
            file,
            line,
            color,
        } => {
            w.write_all(&[WIRE_DESCRIPTION_DEF])?;
            w.write_all(&id.to_le_bytes())?;
            w.write_all(&color.0.to_le_bytes())?;
            w.write_all(&line.to_le_bytes())?;
            write_string(w, name)?;
            write_string(w, file)?;
        }
        Message::FrameBoard(board) => {
            w.write_all(&[WIRE_FRAME_BOARD])?;
            w.write_all(&board.board_number.to_le_bytes())?;
            write_span(w, &board.time)?;
            w.write_all(&board.frequency.to_le_bytes())?;
            write_len(w, board.frames.len())?;
            for frame in &board.frames {
                write_span(w, frame)?;
            }
            write_len(w, board.threads.len())?;
            for thread in &board.threads {
                w.write_all(&thread.thread_id.to_le_bytes())?;
                w.write_all(&[thread.from_other_process as u8])?;
                write_string(w, &thread.name)?;
            }
            write_len(w, board.fibers.len())?;
            for fiber in &board.fibers {
                w.write_all(&fiber.to_le_bytes())?;
            }
        }
        Message::Scope(scope) => {
            w.write_all(&[WIRE_SCOPE])?;
            write_span(w, &scope.header.event)?;
            w.write_all(&scope.header.board_number.to_le_bytes())?;
            w.write_all(&scope.header.thread_number.to_le_bytes())?;
            w.write_all(&scope.header.fiber_number.to_le_bytes())?;
            write_len(w, scope.categories.len())?;
            for event in &scope.categories {
                write_event(w, event)?;
            }
            write_len(w, scope.events.len())?;
            for event in &scope.events {
                write_event(w, event)?;
            }
        }
        Message::Synchronization {
            board_number,
            thread_number,
            records,
        } => {
            w.write_all(&[WIRE_SYNCHRONIZATION])?;
            w.write_all(&board_number.to_le_bytes())?;
            w.write_all(&thread_number.to_le_bytes())?;
            write_len(w, records.len())?;
            for record in records {
                w.write_all(&record.start.to_le_bytes())?;
                w.write_all(&record.finish.to_le_bytes())?;
                w.write_all(&[record.core, record.reason])?;
                w.write_all(&record.new_thread_id.to_le_bytes())?;
            }
        }
        Message::FiberSynchronization {
            board_number,
            fiber_number,
            records,
        } => {
            w.write_all(&[WIRE_FIBER_SYNCHRONIZATION])?;
            w.write_all(&board_number.to_le_bytes())?;
            w.write_all(&fiber_number.to_le_bytes())?;
            write_len(w, records.len())?;
            for record in records {
                w.write_all(&record.start.to_le_bytes())?;
                w.write_all(&record.finish.to_le_bytes())?;
                w.write_all(&record.thread_id.to_le_bytes())?;
            }
        }
        Message::SysCalls {
            board_number,
            records,
        } => {
            w.write_all(&[WIRE_SYSCALLS])?;
            w.write_all(&board_number.to_le_bytes())?;
            write_len(w, records.len())?;
            for record in records {
                w.write_all(&record.timestamp.to_le_bytes())?;
                w.write_all(&record.id.to_le_bytes())?;
                w.write_all(&record.thread_id.to_le_bytes())?;
            }
        }
        Message::SamplingData { callstacks } => {
            w.write_all(&[WIRE_SAMPLING_DATA])?;
            write_len(w, callstacks.len())?;
            for stack in callstacks {
                let frames = &stack.frames[..stack.frames.len().min(u16::MAX as usize)];
                w.write_all(&stack.thread_id.to_le_bytes())?;
                w.write_all(&stack.timestamp.to_le_bytes())?;
                w.write_all(&(frames.len() as u16).to_le_bytes())?;
                for address in frames {
                    w.write_all(&address.to_le_bytes())?;
                }
            }
        }
        Message::FramesEnd { board_number } => {
            w.write_all(&[WIRE_FRAMES_END])?;
            w.write_all(&board_number.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Read one message from the wire. Returns `Ok(None)` at EOF.
pub fn read_message(r: &mut impl Read) -> Result<Option<Message>> {
    let mut code = [0u8; 1];
    if r.read(&mut code)? == 0 {
        return Ok(None);
    }
    let message = match code[0] {
        WIRE_HANDSHAKE => {
            let raw = read_u8(r)?;
            let status = CaptureStatus::from_u8(raw)
                .ok_or_else(|| invalid(format!("unknown capture status {raw}")))?;
            Message::Handshake { status }
        }
        WIRE_PROGRESS => Message::Progress {
            text: read_string(r)?,
        },
        WIRE_DESCRIPTION_DEF => {
            let id = read_u32(r)?;
            let color = Color(read_u32(r)?);
            let line = read_u32(r)?;
            let name = read_string(r)?;
            let file = read_string(r)?;
            Message::DescriptionDef {
                id,
                name,
                file,
                line,
                color,
            }
        }
        WIRE_FRAME_BOARD => {
            let board_number = read_u32(r)?;
            let time = read_span(r)?;
            let frequency = read_u64(r)?;
            let frame_count = read_u32(r)?;
            let frames = (0..frame_count)
                .map(|_| read_span(r))
                .collect::<Result<Vec<_>>>()?;
            let thread_count = read_u32(r)?;
            let mut threads = Vec::new();
            for _ in 0..thread_count {
                let thread_id = read_u64(r)?;
                let from_other_process = read_u8(r)? != 0;
                let name = read_string(r)?;
                threads.push(ThreadDescription {
                    name,
                    thread_id,
                    from_other_process,
                });
            }
            let fiber_count = read_u32(r)?;
            let fibers = (0..fiber_count)
                .map(|_| read_u64(r))
                .collect::<Result<Vec<_>>>()?;
            Message::FrameBoard(FrameBoard {
                board_number,
                time,
                frequency,
                frames,
                threads,
                fibers,
            })
        }
        WIRE_SCOPE => {
            let event = read_span(r)?;
            let header = ScopeHeader {
                event,
                board_number: read_u32(r)?,
                thread_number: read_i32(r)?,
                fiber_number: read_i32(r)?,
            };
            let category_count = read_u32(r)?;
            let categories = (0..category_count)
                .map(|_| read_event(r))
                .collect::<Result<Vec<_>>>()?;
            let event_count = read_u32(r)?;
            let events = (0..event_count)
                .map(|_| read_event(r))
                .collect::<Result<Vec<_>>>()?;
            Message::Scope(ScopeData {
                header,
                categories,
                events,
            })
        }
        WIRE_SYNCHRONIZATION => {
            let board_number = read_u32(r)?;
            let thread_number = read_i32(r)?;
            let count = read_u32(r)?;
            let mut records = Vec::new();
            for _ in 0..count {
                records.push(SyncData {
                    start: read_u64(r)?,
                    finish: read_u64(r)?,
                    core: read_u8(r)?,
                    reason: read_u8(r)?,
                    new_thread_id: read_u64(r)?,
                });
            }
            Message::Synchronization {
                board_number,
                thread_number,
                records,
            }
        }
        WIRE_FIBER_SYNCHRONIZATION => {
            let board_number = read_u32(r)?;
            let fiber_number = read_i32(r)?;
            let count = read_u32(r)?;
            let mut records = Vec::new();
            for _ in 0..count {
                records.push(FiberSyncData {
                    start: read_u64(r)?,
                    finish: read_u64(r)?,
                    thread_id: read_u64(r)?,
                });
            }
            Message::FiberSynchronization {
                board_number,
                fiber_number,
                records,
            }
        }
        WIRE_SYSCALLS => {
            let board_number = read_u32(r)?;
            let count = read_u32(r)?;
            let mut records = Vec::new();
            for _ in 0..count {
                records.push(SysCallDesc {
                    timestamp: read_u64(r)?,
                    id: read_u64(r)?,
                    thread_id: read_u64(r)?,
                });
            }
            Message::SysCalls {
                board_number,
                records,
            }
        }
        WIRE_SAMPLING_DATA => {
            let count = read_u32(r)?;
            let mut callstacks = Vec::new();
            for _ in 0..count {
                let thread_id = read_u64(r)?;
                let timestamp = read_u64(r)?;
                let len = read_u16(r)?;
                let frames = (0..len)
                    .map(|_| read_u64(r))
                    .collect::<Result<Vec<_>>>()?;
                callstacks.push(Callstack {
                    thread_id,
                    timestamp,
                    frames,
                });
            }
            Message::SamplingData { callstacks }
        }
        WIRE_FRAMES_END => Message::FramesEnd {
            board_number: read_u32(r)?,
        },
        other => return Err(invalid(format!("unknown wire code {other}"))),
    };
    Ok(Some(message))
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidData, message)
}

fn write_len(w: &mut impl Write, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| invalid(format!("sequence too long: {len}")))?;
    w.write_all(&len.to_le_bytes())
}

fn write_string(w: &mut impl Write, s: &str) -> Result<()> {
    let bytes = truncated(s).as_bytes();
    w.write_all(&(bytes.len() as u16).to_le_bytes())?;
    w.write_all(bytes)
}

fn write_span(w: &mut impl Write, span: &EventTime) -> Result<()> {
    w.write_all(&span.start.to_le_bytes())?;
    w.write_all(&span.finish.to_le_bytes())
}

fn write_event(w: &mut impl Write, event: &EventRecord) -> Result<()> {
    w.write_all(&event.start.to_le_bytes())?;
    w.write_all(&event.finish.to_le_bytes())?;
    w.write_all(&event.description_id.to_le_bytes())?;
    w.write_all(&[event.kind as u8])
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> Result<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| invalid("Invalid UTF-8".to_string()))
}

fn read_span(r: &mut impl Read) -> Result<EventTime> {
    Ok(EventTime::new(read_u64(r)?, read_u64(r)?))
}

fn read_event(r: &mut impl Read) -> Result<EventRecord> {
    let start = read_u64(r)?;
    let finish = read_u64(r)?;
    let description_id = read_u32(r)?;
    let tag = read_u8(r)?;
    let kind = EventKind::from_u8(tag).ok_or_else(|| invalid(format!("unknown event kind {tag}")))?;
    Ok(EventRecord {
        start,
        finish,
        description_id,
        kind,
    })
}
