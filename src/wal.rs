use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
/// Serialization happens before anything is written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean or torn end of log.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only reservation log.
///
/// A crash can leave a torn final frame; replay stops at the first frame whose
/// length, CRC or payload does not check out and keeps everything before it.
/// [`Wal::recover`] cuts that tail off so later appends stay reachable.
///
/// Appends are staged in memory and reach the file only in `flush_sync`. A
/// failed flush truncates the file back to its last committed length, so a
/// batch is either entirely in the log or not at all.
pub struct Wal {
    file: File,
    path: PathBuf,
    staged: Vec<u8>,
    staged_count: u64,
    /// Length of the file up to the last fully committed frame.
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            staged: Vec::new(),
            staged_count: 0,
            committed_len,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event without writing it. The group-commit writer calls
    /// `flush_sync` once per batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mut frame = Vec::new();
        encode_event(&mut frame, event)?;
        self.staged.extend_from_slice(&frame);
        self.staged_count += 1;
        Ok(())
    }

    /// Drop every staged event; nothing of them reaches the file.
    pub fn discard_staged(&mut self) {
        self.staged.clear();
        self.staged_count = 0;
    }

    /// Write and fsync the staged batch. On failure the file is cut back to
    /// the last committed frame and the batch is dropped.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let result = self
            .file
            .write_all(&self.staged)
            .and_then(|()| self.file.sync_all());
        match result {
            Ok(()) => {
                self.committed_len += self.staged.len() as u64;
                self.appends_since_compact += self.staged_count;
                self.discard_staged();
                Ok(())
            }
            Err(e) => {
                self.discard_staged();
                if let Err(trunc) = self.file.set_len(self.committed_len) {
                    tracing::error!("WAL rollback to {} bytes failed: {trunc}", self.committed_len);
                }
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Events in the log, plus the byte length of the prefix they came from.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            valid_len += 8 + payload.len() as u64;
        }
        Ok((events, valid_len))
    }

    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Replay, then truncate anything after the last good frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > valid_len {
            tracing::warn!(
                "WAL {}: dropping {} trailing bytes after the last good frame",
                path.display(),
                len - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}
