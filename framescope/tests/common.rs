use framescope::capture::{Message, ScopeData, TraceWriter};
use std::sync::{Arc, Mutex};

/// A [`TraceWriter`] that accumulates all messages into a shared `Vec`.
///
/// ```rust,ignore
/// let (writer, messages) = CapturingWriter::new();
/// // ... build engine with Box::new(writer) ...
/// let captured = messages.lock().unwrap();
/// ```
pub struct CapturingWriter(Arc<Mutex<Vec<Message>>>);

impl CapturingWriter {
    /// Create a new writer and return a handle to the shared message buffer.
    pub fn new() -> (Self, Arc<Mutex<Vec<Message>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        (Self(messages.clone()), messages)
    }
}

impl TraceWriter for CapturingWriter {
    fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
        self.0.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn write_batch(&mut self, messages: &[Message]) -> std::io::Result<()> {
        self.0.lock().unwrap().extend_from_slice(messages);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Scope records of one thread, in output order.
#[allow(dead_code)]
pub fn thread_scopes(messages: &[Message], thread_number: i32) -> Vec<ScopeData> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Scope(scope) if scope.header.thread_number == thread_number => {
                Some(scope.clone())
            }
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn total_events(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| match m {
            Message::Scope(scope) => scope.events.len(),
            _ => 0,
        })
        .sum()
}

#[allow(dead_code)]
pub fn handshakes(messages: &[Message]) -> Vec<framescope::capture::CaptureStatus> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Handshake { status } => Some(*status),
            _ => None,
        })
        .collect()
}
