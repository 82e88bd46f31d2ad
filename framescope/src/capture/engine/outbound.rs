//! Hand-off from the engine to the thread that owns the output sink.
//!
//! Dumps push whole message batches into an unbounded channel and return; the
//! `capture-writer` thread does the encoding and I/O. Recording contexts never
//! touch this path.

use super::event_writer::EventWriter;
use crate::capture::message::Message;
use crate::capture::status::CaptureError;
use crate::capture::writer::{TraceWriter, WriteAtomicResult};
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, warn};

enum Outbound {
    Messages(Vec<Message>),
    Flush(Sender<std::io::Result<()>>),
}

pub(crate) struct OutboundSender {
    tx: Option<Sender<Outbound>>,
    thread: Option<JoinHandle<()>>,
}

impl OutboundSender {
    pub(crate) fn spawn(writer: Box<dyn TraceWriter>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("capture-writer".into())
            .spawn(move || run_writer(EventWriter::new(writer), rx))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn send(&self, messages: Vec<Message>) -> Result<(), CaptureError> {
        if messages.is_empty() {
            return Ok(());
        }
        let tx = self.tx.as_ref().ok_or(CaptureError::OutputClosed)?;
        tx.send(Outbound::Messages(messages))
            .map_err(|_| CaptureError::OutputClosed)
    }

    /// Block until everything sent so far has been written and flushed.
    pub(crate) fn flush(&self) -> Result<(), CaptureError> {
        let tx = self.tx.as_ref().ok_or(CaptureError::OutputClosed)?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        tx.send(Outbound::Flush(reply_tx))
            .map_err(|_| CaptureError::OutputClosed)?;
        reply_rx.recv().map_err(|_| CaptureError::OutputClosed)??;
        Ok(())
    }
}

impl Drop for OutboundSender {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_writer(mut writer: EventWriter, rx: Receiver<Outbound>) {
    for item in rx {
        match item {
            Outbound::Messages(batch) => {
                for message in &batch {
                    match writer.write_message(message) {
                        Ok(WriteAtomicResult::Written) => {}
                        Ok(WriteAtomicResult::OversizedBatch) => {
                            warn!("capture record larger than an output file, dropped");
                        }
                        Ok(WriteAtomicResult::Rotated) => {}
                        Err(error) => warn!(error = ?error, "failed to write capture record"),
                    }
                }
            }
            Outbound::Flush(reply) => {
                let _ = reply.send(writer.flush());
            }
        }
    }
    if let Err(error) = writer.flush() {
        warn!(error = ?error, "final capture flush failed");
    }
    debug!("capture writer stopped");
}
