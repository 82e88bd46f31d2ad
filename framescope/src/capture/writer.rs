use crate::capture::format;
use crate::capture::message::Message;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Outcome of [`TraceWriter::write_atomic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAtomicResult {
    Written,
    /// The batch can never fit in one file and was dropped.
    OversizedBatch,
    /// The writer moved to a new file and wrote nothing. The caller should
    /// rebuild the batch for the new file and write it again.
    Rotated,
}

pub trait TraceWriter: Send {
    fn write_message(&mut self, message: &Message) -> std::io::Result<()>;
    fn write_batch(&mut self, messages: &[Message]) -> std::io::Result<()>;
    /// Write `messages` so that they all end up in the same file.
    fn write_atomic(&mut self, messages: &[Message]) -> std::io::Result<WriteAtomicResult> {
        self.write_batch(messages)?;
        Ok(WriteAtomicResult::Written)
    }
    fn flush(&mut self) -> std::io::Result<()>;
    /// Returns true if the writer rotated to a new file since the last call to this method.
    /// Used by the output path to know when to re-emit DescriptionDefs.
    fn take_rotated(&mut self) -> bool {
        false
    }
}

/// Writes the whole capture into a single stream.
pub struct SimpleBinaryWriter<W: Write + Send = BufWriter<File>> {
    writer: W,
}

impl SimpleBinaryWriter {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Self::from_writer(BufWriter::new(file))
    }
}

impl<W: Write + Send> SimpleBinaryWriter<W> {
    /// Wrap any byte sink. The format header is written immediately.
    pub fn from_writer(mut writer: W) -> std::io::Result<Self> {
        format::write_header(&mut writer)?;
        Ok(Self { writer })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TraceWriter for SimpleBinaryWriter<W> {
    fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
        format::write_message(&mut self.writer, message)
    }

    fn write_batch(&mut self, messages: &[Message]) -> std::io::Result<()> {
        for message in messages {
            format::write_message(&mut self.writer, message)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A writer that discards everything. Useful for measuring recording overhead
/// without I/O costs.
pub struct NullWriter;

impl TraceWriter for NullWriter {
    fn write_message(&mut self, _message: &Message) -> std::io::Result<()> {
        Ok(())
    }
    fn write_batch(&mut self, _messages: &[Message]) -> std::io::Result<()> {
        Ok(())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A writer that rotates capture files to bound disk usage.
///
/// - `max_file_size`: rotate to a new file when the current file would exceed this size
/// - `max_total_size`: delete oldest files when total size across all files exceeds this
///
/// Files are named `{base_path}.0.bin`, `{base_path}.1.bin`, etc.
/// Each file is self-contained: it has its own header, and description
/// definitions are repeated in every file that uses them.
pub struct RotatingWriter {
    base_path: PathBuf,
    max_file_size: u64,
    max_total_size: u64,
    /// (path, size) of every segment still on disk, oldest first.
    segments: VecDeque<(PathBuf, u64)>,
    total_size: u64,
    segment: BufWriter<File>,
    segment_size: u64,
    next_segment: u32,
    /// The total size cap was hit; everything after is discarded.
    exhausted: bool,
    /// Cleared by `take_rotated`.
    rotated: bool,
}

impl RotatingWriter {
    pub fn new(
        base_path: impl Into<PathBuf>,
        max_file_size: u64,
        max_total_size: u64,
    ) -> std::io::Result<Self> {
        let base_path = base_path.into();
        if let Some(parent) = base_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (first_path, segment) = Self::open_segment(&base_path, 0)?;
        let header_size = format::HEADER_SIZE as u64;

        Ok(Self {
            base_path,
            max_file_size,
            max_total_size,
            segments: VecDeque::from([(first_path, header_size)]),
            total_size: header_size,
            segment,
            segment_size: header_size,
            next_segment: 1,
            exhausted: false,
            rotated: false,
        })
    }

    /// Create segment `index` next to `base` and write its header.
    fn open_segment(base: &Path, index: u32) -> std::io::Result<(PathBuf, BufWriter<File>)> {
        let stem = base.file_stem().unwrap_or_default().to_string_lossy();
        let path = base
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{stem}.{index}.bin"));
        let mut segment = BufWriter::new(File::create(&path)?);
        format::write_header(&mut segment)?;
        Ok((path, segment))
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.segment.flush()?;
        if let Some(last) = self.segments.back_mut() {
            last.1 = self.segment_size;
        }

        let (new_path, segment) = Self::open_segment(&self.base_path, self.next_segment)?;
        self.next_segment += 1;
        self.segment = segment;
        let header_size = format::HEADER_SIZE as u64;
        self.segment_size = header_size;
        self.total_size += header_size;
        self.segments.push_back((new_path, header_size));
        self.rotated = true;

        self.evict_old_segments();
        Ok(())
    }

    fn evict_old_segments(&mut self) {
        // Never the segment being written.
        while self.total_size > self.max_total_size && self.segments.len() > 1 {
            if let Some((path, size)) = self.segments.pop_front() {
                self.total_size -= size;
                let _ = fs::remove_file(&path);
            }
        }
        if self.total_size > self.max_total_size {
            self.exhausted = true;
        }
    }

    fn append(&mut self, message: &Message, size: u64) -> std::io::Result<()> {
        format::write_message(&mut self.segment, message)?;
        self.segment_size += size;
        self.total_size += size;
        if let Some(last) = self.segments.back_mut() {
            last.1 = self.segment_size;
        }
        Ok(())
    }

    fn enforce_budget(&mut self) -> std::io::Result<()> {
        if self.total_size > self.max_total_size {
            self.segment.flush()?;
            self.exhausted = true;
        }
        Ok(())
    }

    fn append_rolling(&mut self, message: &Message) -> std::io::Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let size = format::wire_message_size(message) as u64;
        if self.segment_size + size > self.max_file_size {
            self.rotate()?;
            if self.exhausted {
                return Ok(());
            }
        }
        self.append(message, size)?;
        self.enforce_budget()
    }
}

impl TraceWriter for RotatingWriter {
    fn write_message(&mut self, message: &Message) -> std::io::Result<()> {
        self.append_rolling(message)
    }

    fn write_batch(&mut self, messages: &[Message]) -> std::io::Result<()> {
        for message in messages {
            self.append_rolling(message)?;
        }
        Ok(())
    }

    fn write_atomic(&mut self, messages: &[Message]) -> std::io::Result<WriteAtomicResult> {
        if self.exhausted {
            return Ok(WriteAtomicResult::Written);
        }
        let sizes: Vec<u64> = messages
            .iter()
            .map(|m| format::wire_message_size(m) as u64)
            .collect();
        let batch_size: u64 = sizes.iter().sum();
        if format::HEADER_SIZE as u64 + batch_size > self.max_file_size {
            return Ok(WriteAtomicResult::OversizedBatch);
        }
        if self.segment_size + batch_size > self.max_file_size {
            self.rotate()?;
            if self.exhausted {
                return Ok(WriteAtomicResult::Written);
            }
            return Ok(WriteAtomicResult::Rotated);
        }
        for (message, size) in messages.iter().zip(sizes) {
            self.append(message, size)?;
        }
        self.enforce_budget()?;
        Ok(WriteAtomicResult::Written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.exhausted {
            self.segment.flush()?;
        }
        Ok(())
    }

    fn take_rotated(&mut self) -> bool {
        std::mem::replace(&mut self.rotated, false)
    }
}
