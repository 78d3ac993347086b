use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Default per-poll read cap.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024 * 1024; // 1MiB

/// Longest unterminated fragment carried between reads before it is dropped.
pub const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024 * 1024; // 16MiB

/// Splits a byte stream into newline-terminated lines, carrying an
/// unterminated trailing fragment over to the next push.
///
/// A fragment growing past `max_line_len` is dropped, and the rest of that
/// line is skipped up to its newline.
#[derive(Debug)]
pub struct LineBuffer {
    fragment: Vec<u8>,
    max_line_len: usize,
    discarding: bool,
    dropped: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            fragment: Vec::new(),
            max_line_len: max_line_len.max(1),
            discarding: false,
            dropped: 0,
        }
    }

    /// Appends `bytes` and returns every line completed by them.
    ///
    /// Returned lines exclude the `\n` (and a preceding `\r`). Blank lines
    /// are dropped. Bytes after the last `\n` stay buffered.
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Vec<u8>> {
        if self.discarding {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    bytes = &bytes[pos + 1..];
                }
                None => return Vec::new(),
            }
        }

        self.fragment.extend_from_slice(bytes);

        let lines = match self.fragment.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => {
                let complete: Vec<u8> = self.fragment.drain(..=last_newline).collect();
                complete
                    .split(|&b| b == b'\n')
                    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                    .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
                    .map(<[u8]>::to_vec)
                    .collect()
            }
            None => Vec::new(),
        };

        if self.fragment.len() > self.max_line_len {
            self.fragment = Vec::new();
            self.discarding = true;
            self.dropped += 1;
        }

        lines
    }

    /// Bytes held back because no terminator has arrived yet.
    pub fn pending(&self) -> &[u8] {
        &self.fragment
    }

    /// Overlong lines dropped since the previous call.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

/// Incremental reader over a growing, append-only file.
///
/// The file may not exist yet; that is a normal state and yields no data.
/// The read position is an explicit byte offset; it only moves forward.
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    chunk_size: usize,
    lines: LineBuffer,
}

impl Tailer {
    /// Creates a tailer reading at most `chunk_size` bytes per increment.
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            file: None,
            offset: 0,
            chunk_size: chunk_size.max(1),
            lines: LineBuffer::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed from the source so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Caps the unterminated fragment carried between reads.
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.lines = LineBuffer::with_max_line_len(max_line_len);
        self
    }

    /// Overlong lines dropped since the previous call.
    pub fn take_dropped_lines(&mut self) -> u64 {
        self.lines.take_dropped()
    }

    /// Unterminated trailing fragment awaiting its newline.
    pub fn pending_fragment(&self) -> &[u8] {
        self.lines.pending()
    }

    /// Returns bytes appended since the previous call, capped at the chunk size.
    ///
    /// Empty when the source does not exist yet or has nothing new.
    pub fn read_increment(&mut self) -> Result<Vec<u8>> {
        let offset = self.offset;
        let chunk_size = self.chunk_size as u64;
        let path = self.path.clone();

        let Some(file) = self.open()? else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seeking {} to {offset}", path.display()))?;

        let mut buf = Vec::new();
        file.take(chunk_size)
            .read_to_end(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;

        self.offset += buf.len() as u64;

        Ok(buf)
    }

    /// Reads one increment and returns the complete lines it finished.
    pub fn read_lines(&mut self) -> Result<Vec<Vec<u8>>> {
        let increment = self.read_increment()?;
        if increment.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.lines.push(&increment))
    }

    /// Releases the file handle. A later read reopens the source at the
    /// same offset.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), offset = self.offset, "closed source");
        }
    }

    fn open(&mut self) -> Result<Option<&mut File>> {
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => {
                    debug!(path = %self.path.display(), "opened source");
                    self.file = Some(file);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "source does not exist yet");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("opening {}", self.path.display()));
                }
            }
        }

        Ok(self.file.as_mut())
    }
}
