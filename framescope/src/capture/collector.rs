//! Collectors for records that arrive from outside the recording contexts:
//! context switches and syscalls from the scheduler trace backend, and stack
//! walks from the sampler.

use crate::capture::buffer::ChunkedBuffer;
use crate::capture::events::{Callstack, CallstackDesc, EventTime, SwitchContextDesc, SysCallDesc};
use std::sync::{Mutex, MutexGuard};

/// A record that can be attributed to threads and placed on the timeline.
pub trait TimedRecord: Copy {
    fn timestamp(&self) -> u64;
    fn involves(&self, thread_id: u64) -> bool;
}

impl TimedRecord for SwitchContextDesc {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn involves(&self, thread_id: u64) -> bool {
        self.old_thread_id == thread_id || self.new_thread_id == thread_id
    }
}

impl TimedRecord for SysCallDesc {
    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn involves(&self, thread_id: u64) -> bool {
        self.thread_id == thread_id
    }
}

pub struct RecordCollector<T> {
    records: Mutex<ChunkedBuffer<T, 1024>>,
}

pub type SwitchContextCollector = RecordCollector<SwitchContextDesc>;
pub type SysCallCollector = RecordCollector<SysCallDesc>;

impl<T: TimedRecord> Default for RecordCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimedRecord> RecordCollector<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(ChunkedBuffer::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, ChunkedBuffer<T, 1024>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, record: T) {
        self.records().add(record);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records involving `thread_id` within `range`, ordered by timestamp.
    pub fn in_range(&self, thread_id: u64, range: EventTime) -> Vec<T> {
        let mut found: Vec<T> = self
            .records()
            .iter()
            .filter(|r| r.involves(thread_id) && range.contains_timestamp(r.timestamp()))
            .copied()
            .collect();
        found.sort_by_key(|r| r.timestamp());
        found
    }

    /// Drop the records up to and including `timestamp`. Later ones stay for
    /// the next dump.
    pub fn discard_through(&self, timestamp: u64) {
        let mut records = self.records();
        let kept: Vec<T> = records
            .iter()
            .filter(|r| r.timestamp() > timestamp)
            .copied()
            .collect();
        records.clear(true);
        for record in kept {
            records.add(record);
        }
    }

    pub fn clear(&self, preserve_content: bool) {
        self.records().clear(preserve_content);
    }
}

/// Stack walks packed into one flat buffer as
/// `thread_id, timestamp, frame_count, frames...`.
#[derive(Default)]
pub struct CallstackCollector {
    packed: Mutex<PackedStacks>,
}

#[derive(Default)]
struct PackedStacks {
    words: ChunkedBuffer<u64, 4096>,
    count: usize,
}

impl CallstackCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn packed(&self) -> MutexGuard<'_, PackedStacks> {
        self.packed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, desc: &CallstackDesc<'_>) {
        let mut packed = self.packed();
        packed.words.add(desc.thread_id);
        packed.words.add(desc.timestamp);
        packed.words.add(desc.callstack.len() as u64);
        for &address in desc.callstack {
            packed.words.add(address);
        }
        packed.count += 1;
    }

    pub fn len(&self) -> usize {
        self.packed().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unpack and remove every collected stack walk.
    pub fn take(&self) -> Vec<Callstack> {
        let mut packed = self.packed();
        let mut stacks = Vec::with_capacity(packed.count);
        {
            let mut words = packed.words.iter().copied();
            while let (Some(thread_id), Some(timestamp), Some(len)) =
                (words.next(), words.next(), words.next())
            {
                let frames: Vec<u64> = words.by_ref().take(len as usize).collect();
                stacks.push(Callstack {
                    thread_id,
                    timestamp,
                    frames,
                });
            }
        }
        packed.words.clear(true);
        packed.count = 0;
        stacks
    }
}
