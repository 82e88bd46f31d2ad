use crate::capture::events::{EventRecord, EventTime};
use serde::Serialize;

/// Identifies which context and board a serialized scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopeHeader {
    /// Span of the root event of the scope.
    pub event: EventTime,
    pub board_number: u32,
    /// Index of the thread in the frame board, or -1.
    pub thread_number: i32,
    /// Index of the fiber in the frame board, or -1.
    pub fiber_number: i32,
}

impl ScopeHeader {
    pub fn for_thread(board_number: u32, thread_number: i32) -> Self {
        Self {
            event: EventTime::new(0, 0),
            board_number,
            thread_number,
            fiber_number: -1,
        }
    }

    pub fn for_fiber(board_number: u32, fiber_number: i32) -> Self {
        Self {
            event: EventTime::new(0, 0),
            board_number,
            thread_number: -1,
            fiber_number,
        }
    }
}

/// One root event and everything nested in it, as sent to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeData {
    pub header: ScopeHeader,
    pub categories: Vec<EventRecord>,
    pub events: Vec<EventRecord>,
}

impl ScopeData {
    pub fn new(header: ScopeHeader) -> Self {
        Self {
            header,
            categories: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Seed the header span from `root` and add it as the first event.
    pub fn init_root_event(&mut self, root: EventRecord) {
        self.header.event = root.time();
        self.add_event(root);
    }

    pub fn add_event(&mut self, event: EventRecord) {
        self.events.push(event);
    }

    pub fn add_category(&mut self, event: EventRecord) {
        self.categories.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.categories.clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::events::EventKind;

    fn record(start: u64, finish: u64) -> EventRecord {
        EventRecord {
            start,
            finish,
            description_id: 0,
            kind: EventKind::Scope,
        }
    }

    #[test]
    fn test_root_event_sets_header_span() {
        let mut scope = ScopeData::new(ScopeHeader::for_thread(3, 1));
        scope.init_root_event(record(4, 20));
        scope.add_event(record(5, 6));
        assert_eq!(scope.header.event, EventTime::new(4, 20));
        assert_eq!(scope.header.fiber_number, -1);
        assert_eq!(scope.events.len(), 2);
        assert!(scope.categories.is_empty());
    }

    #[test]
    fn test_fiber_header() {
        let header = ScopeHeader::for_fiber(0, 2);
        assert_eq!((header.thread_number, header.fiber_number), (-1, 2));
    }
}
