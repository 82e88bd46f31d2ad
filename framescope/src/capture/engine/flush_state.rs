use crate::capture::description::EventDescription;
use crate::capture::message::Message;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Writer-thread state tracking which descriptions the current output file
/// already defines.
pub(super) struct FlushState {
    /// Description ids emitted as DescriptionDef in the current file.
    pub(super) emitted_this_file: HashSet<u32>,
}

impl FlushState {
    pub(super) fn new() -> Self {
        Self {
            emitted_this_file: HashSet::new(),
        }
    }

    /// Resolve a message into the batch to write: defs for ids the current
    /// file lacks, then the message itself. Nothing is marked as emitted until
    /// [`commit`](Self::commit) is called for the written message.
    pub(super) fn resolve(&self, message: &Message) -> SmallVec<[Message; 4]> {
        let mut batch = SmallVec::new();
        let mut pending: SmallVec<[u32; 8]> = SmallVec::new();
        for id in message.description_ids() {
            if self.emitted_this_file.contains(&id) || pending.contains(&id) {
                continue;
            }
            pending.push(id);
            if let Some(description) = EventDescription::get(id) {
                batch.push(Message::DescriptionDef {
                    id,
                    name: description.name().to_owned(),
                    file: description.file().to_owned(),
                    line: description.line(),
                    color: description.color(),
                });
            }
        }
        batch.push(message.clone());
        batch
    }

    /// Record that the batch resolved for `message` reached the current file.
    pub(super) fn commit(&mut self, message: &Message) {
        self.emitted_this_file.extend(message.description_ids());
    }

    /// Called on file rotation: the next reference to any id re-emits its def.
    pub(super) fn on_rotate(&mut self) {
        self.emitted_this_file.clear();
    }
}
