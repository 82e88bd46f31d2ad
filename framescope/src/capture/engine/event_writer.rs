use super::flush_state::FlushState;
use crate::capture::message::Message;
use crate::capture::writer::{TraceWriter, WriteAtomicResult};
use tracing::warn;

/// Intermediate layer between the engine and the raw `TraceWriter`.
///
/// Owns the writer and the description interning state. Each message is
/// written together with the definitions it needs, in one atomic batch, so a
/// rotation never separates a record from its definitions.
pub(crate) struct EventWriter {
    writer: Box<dyn TraceWriter>,
    flush_state: FlushState,
}

impl EventWriter {
    pub(crate) fn new(writer: Box<dyn TraceWriter>) -> Self {
        Self {
            writer,
            flush_state: FlushState::new(),
        }
    }

    pub(crate) fn write_message(&mut self, message: &Message) -> std::io::Result<WriteAtomicResult> {
        if self.writer.take_rotated() {
            self.flush_state.on_rotate();
        }
        let batch = self.flush_state.resolve(message);
        let result = match self.writer.write_atomic(&batch)? {
            WriteAtomicResult::Rotated => {
                let rotated = self.writer.take_rotated();
                debug_assert!(
                    rotated,
                    "write_atomic returned Rotated but take_rotated is false"
                );
                self.flush_state.on_rotate();
                let batch = self.flush_state.resolve(message);
                let result = self.writer.write_atomic(&batch)?;
                if result == WriteAtomicResult::Rotated {
                    warn!("batch rotated twice in a row, dropping it");
                }
                result
            }
            result => result,
        };
        if result == WriteAtomicResult::Written {
            self.flush_state.commit(message);
        }
        Ok(result)
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::description::EventDescription;
    use crate::capture::events::{Color, EventKind, EventRecord};
    use crate::capture::reader::TraceReader;
    use crate::capture::scope_data::{ScopeData, ScopeHeader};
    use crate::capture::format;
    use crate::capture::writer::RotatingWriter;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_rotation_repeats_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("capture");
        let description = EventDescription::here("event_writer::rotation", Color::NULL);
        let mut scope = ScopeData::new(ScopeHeader::for_thread(0, 0));
        scope.init_root_event(EventRecord {
            start: 1,
            finish: 2,
            description_id: description.id(),
            kind: EventKind::Scope,
        });
        let message = Message::Scope(scope);

        let batch_size: usize = FlushState::new()
            .resolve(&message)
            .iter()
            .map(format::wire_message_size)
            .sum();
        let writer = RotatingWriter::new(
            &base,
            (format::HEADER_SIZE + batch_size + 8) as u64,
            1_000_000,
        )
        .unwrap();
        let mut event_writer = EventWriter::new(Box::new(writer));

        for _ in 0..3 {
            assert_eq!(
                event_writer.write_message(&message).unwrap(),
                WriteAtomicResult::Written
            );
        }
        event_writer.flush().unwrap();

        for i in 0..3 {
            let mut reader =
                TraceReader::open(dir.path().join(format!("capture.{i}.bin"))).unwrap();
            reader.read_header().unwrap();
            let messages = reader.read_all_raw().unwrap();
            assert_eq!(messages.len(), 2, "file {i} holds def + scope");
            assert!(matches!(messages[0], Message::DescriptionDef { .. }));
        }
    }

    /// Refuses any batch longer than `limit` messages.
    struct LimitedWriter {
        limit: usize,
        batches: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    impl TraceWriter for LimitedWriter {
        fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
            self.batches.lock().unwrap().push(vec![message.clone()]);
            Ok(())
        }
        fn write_batch(&mut self, messages: &[Message]) -> std::io::Result<()> {
            self.batches.lock().unwrap().push(messages.to_vec());
            Ok(())
        }
        fn write_atomic(&mut self, messages: &[Message]) -> std::io::Result<WriteAtomicResult> {
            if messages.len() > self.limit {
                return Ok(WriteAtomicResult::OversizedBatch);
            }
            self.write_batch(messages)?;
            Ok(WriteAtomicResult::Written)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn scope_of(descriptions: &[&EventDescription]) -> Message {
        let mut scope = ScopeData::new(ScopeHeader::for_thread(0, 0));
        for (i, description) in descriptions.iter().enumerate() {
            let record = EventRecord {
                start: 0,
                finish: 10 - i as u64,
                description_id: description.id(),
                kind: EventKind::Scope,
            };
            if i == 0 {
                scope.init_root_event(record);
            } else {
                scope.add_event(record);
            }
        }
        Message::Scope(scope)
    }

    #[test]
    fn test_dropped_batch_does_not_mark_definitions_written() {
        let shared = EventDescription::here("event_writer::shared", Color::NULL);
        let extra = EventDescription::here("event_writer::extra", Color::NULL);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut event_writer = EventWriter::new(Box::new(LimitedWriter {
            limit: 2,
            batches: batches.clone(),
        }));

        assert_eq!(
            event_writer.write_message(&scope_of(&[shared, extra])).unwrap(),
            WriteAtomicResult::OversizedBatch
        );
        assert_eq!(
            event_writer.write_message(&scope_of(&[shared])).unwrap(),
            WriteAtomicResult::Written
        );
        assert_eq!(
            event_writer.write_message(&scope_of(&[shared])).unwrap(),
            WriteAtomicResult::Written
        );

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(matches!(&batches[0][0], Message::DescriptionDef { id, .. } if *id == shared.id()));
        assert_eq!(batches[1].len(), 1, "definition already in the file");
    }
}
