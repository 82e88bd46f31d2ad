use crate::capture::events::Color;
use crate::capture::format;
use crate::capture::message::Message;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Result};
use std::path::Path;

/// A description definition as read back from a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionInfo {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub color: Color,
}

pub struct TraceReader<R: Read = BufReader<File>> {
    reader: R,
    /// Description definitions accumulated during reading.
    pub descriptions: HashMap<u32, DescriptionInfo>,
}

impl TraceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            descriptions: HashMap::new(),
        }
    }

    pub fn read_header(&mut self) -> Result<(String, u32)> {
        format::read_header(&mut self.reader)
    }

    fn remember(&mut self, message: &Message) {
        if let Message::DescriptionDef {
            id,
            name,
            file,
            line,
            color,
        } = message
        {
            self.descriptions.insert(
                *id,
                DescriptionInfo {
                    name: name.clone(),
                    file: file.clone(),
                    line: *line,
                    color: *color,
                },
            );
        }
    }

    /// Read the next message, including description definitions.
    pub fn read_raw_message(&mut self) -> Result<Option<Message>> {
        let message = format::read_message(&mut self.reader)?;
        if let Some(message) = &message {
            self.remember(message);
        }
        Ok(message)
    }

    /// Read the next message, folding description definitions into
    /// [`descriptions`](Self::descriptions) instead of returning them.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.read_raw_message()? {
                Some(Message::DescriptionDef { .. }) => continue,
                other => return Ok(other),
            }
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.read_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn read_all_raw(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.read_raw_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Name of a description seen so far.
    pub fn description_name(&self, id: u32) -> Option<&str> {
        self.descriptions.get(&id).map(|d| d.name.as_str())
    }
}
