//! Assembly of a frame board from the drained per-context storages.

use crate::capture::clock::CLOCK_FREQUENCY;
use crate::capture::collector::{SwitchContextCollector, SysCallCollector};
use crate::capture::events::{EventTime, SwitchContextDesc, SyncData, SysCallDesc};
use crate::capture::message::{FrameBoard, Message};
use crate::capture::registry::{FiberEntry, ThreadEntry};
use crate::capture::scope_data::{ScopeData, ScopeHeader};
use crate::capture::storage::StorageBuffers;
use std::sync::Arc;

pub(super) struct DumpInput<'a> {
    pub(super) board_number: u32,
    /// Time covered by the dump: first frame start to last frame finish.
    pub(super) slice: EventTime,
    pub(super) frames: &'a [EventTime],
    pub(super) threads: &'a [Arc<ThreadEntry>],
    pub(super) fibers: &'a [Arc<FiberEntry>],
    pub(super) switches: &'a SwitchContextCollector,
    pub(super) syscalls: &'a SysCallCollector,
    /// Keep buffer chunks for reuse after draining.
    pub(super) preserve_content: bool,
}

/// Drain every registered context into the messages of one frame board.
///
/// Layout: `FrameBoard`, progress, then per thread its scopes and
/// synchronization, then per fiber, then syscalls, then `FramesEnd`.
///
/// Everything a context closed since the previous dump is part of the board,
/// including events that started before `slice`. Switch and syscall records
/// are picked by thread and slice.
pub(super) fn assemble_board(input: &DumpInput<'_>) -> Vec<Message> {
    let mut messages = vec![Message::FrameBoard(FrameBoard {
        board_number: input.board_number,
        time: input.slice,
        frequency: CLOCK_FREQUENCY,
        frames: input.frames.to_vec(),
        threads: input
            .threads
            .iter()
            .map(|t| t.description().clone())
            .collect(),
        fibers: input.fibers.iter().map(|f| f.description().id).collect(),
    })];
    messages.push(Message::Progress {
        text: format!(
            "Serializing {} threads and {} fibers...",
            input.threads.len(),
            input.fibers.len()
        ),
    });

    let mut syscalls: Vec<SysCallDesc> = Vec::new();
    for (number, thread) in input.threads.iter().enumerate() {
        let header = ScopeHeader::for_thread(input.board_number, number as i32);
        let thread_id = thread.description().thread_id;
        let (scopes, mut sync) = thread.storage().drain(|buffers| {
            let scopes = dump_events(buffers, header);
            let sync = buffers.synchronization.to_vec();
            buffers.clear(input.preserve_content);
            (scopes, sync)
        });
        messages.extend(scopes.into_iter().map(Message::Scope));

        let switches = input.switches.in_range(thread_id, input.slice);
        sync.extend(switch_intervals(thread_id, &switches, input.slice));
        if !sync.is_empty() {
            sync.sort_by_key(|s| s.start);
            messages.push(Message::Synchronization {
                board_number: input.board_number,
                thread_number: number as i32,
                records: sync,
            });
        }
        syscalls.extend(input.syscalls.in_range(thread_id, input.slice));
    }

    for (number, fiber) in input.fibers.iter().enumerate() {
        let header = ScopeHeader::for_fiber(input.board_number, number as i32);
        let (scopes, fiber_sync) = fiber.storage().drain(|buffers| {
            let scopes = dump_events(buffers, header);
            let fiber_sync = buffers.fiber_sync.to_vec();
            buffers.clear(input.preserve_content);
            (scopes, fiber_sync)
        });
        messages.extend(scopes.into_iter().map(Message::Scope));
        if !fiber_sync.is_empty() {
            messages.push(Message::FiberSynchronization {
                board_number: input.board_number,
                fiber_number: number as i32,
                records: fiber_sync,
            });
        }
    }

    if !syscalls.is_empty() {
        syscalls.sort_by_key(|s| s.timestamp);
        messages.push(Message::SysCalls {
            board_number: input.board_number,
            records: syscalls,
        });
    }

    messages.push(Message::FramesEnd {
        board_number: input.board_number,
    });
    messages
}

/// Split the closed events in `buffers` into one scope per root event.
///
/// Events are visited in allocation order, so a parent always precedes the
/// events nested in it. An event that does not fit inside the current root
/// starts a new root.
pub(crate) fn dump_events(buffers: &StorageBuffers, header: ScopeHeader) -> Vec<ScopeData> {
    let mut categories = buffers.categories.to_vec();
    categories.sort_unstable();
    let mut categories = categories.into_iter().peekable();
    let mut scopes = Vec::new();
    let mut current: Option<ScopeData> = None;

    for event in buffers.events_in_order() {
        while categories.next_if(|&c| c < event.sequence).is_some() {}
        let is_category = categories.next_if_eq(&event.sequence).is_some();

        if !event.is_closed() {
            continue;
        }
        let record = event.to_record();
        let starts_root = current
            .as_ref()
            .is_none_or(|scope| !scope.header.event.contains(&event.time));
        if starts_root {
            scopes.extend(current.take());
            let mut scope = ScopeData::new(header);
            scope.init_root_event(record);
            current = Some(scope);
        } else if let Some(scope) = current.as_mut() {
            scope.add_event(record);
        }
        if is_category && let Some(scope) = current.as_mut() {
            scope.add_category(record);
        }
    }
    scopes.extend(current);
    scopes
}

/// Turn the context switches of `thread_id` into on-CPU spans within `slice`.
///
/// `switches` are the records involving the thread inside `slice`, ordered by
/// timestamp. A span opens when the thread is switched in and closes when it
/// is switched out. A switch-out with no preceding switch-in starts at the
/// slice start; a span still open at the end closes at the slice finish.
pub(crate) fn switch_intervals(
    thread_id: u64,
    switches: &[SwitchContextDesc],
    slice: EventTime,
) -> Vec<SyncData> {
    let mut spans = Vec::new();
    let mut open: Option<SyncData> = None;
    for switch in switches {
        if switch.old_thread_id == thread_id {
            let mut span = open.take().unwrap_or(SyncData {
                start: slice.start,
                finish: slice.start,
                core: switch.cpu_id,
                reason: switch.reason,
                new_thread_id: 0,
            });
            span.finish = switch.timestamp;
            span.reason = switch.reason;
            span.new_thread_id = switch.new_thread_id;
            spans.push(span);
        }
        if switch.new_thread_id == thread_id {
            open = Some(SyncData {
                start: switch.timestamp,
                finish: switch.timestamp,
                core: switch.cpu_id,
                reason: switch.reason,
                new_thread_id: 0,
            });
        }
    }
    if let Some(mut span) = open {
        span.finish = slice.finish;
        spans.push(span);
    }
    spans
}
