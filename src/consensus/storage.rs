//! Durable consensus state
//!
//! [`LogStorage`] persists the hard state (term, vote) and the log. Two
//! implementations: [`MemoryLogStorage`] for tests and simulations (clones
//! share state, so a "restarted" node can reopen it), and [`FileLogStorage`],
//! an append-only record file.
//!
//! Record format: `[MAGIC][KIND][LEN][PAYLOAD][CRC32]`
//! - MAGIC: `RLG1`
//! - KIND: 1 = log entry, 2 = truncate-from marker, 3 = hard state
//! - LEN: payload length, u32 little endian
//! - PAYLOAD: bincode
//! - CRC32: over KIND, LEN and PAYLOAD

use super::message::LogEntry;
use crate::common::utils::lock;
use crate::common::{crc32, Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LOG_MAGIC: [u8; 4] = *b"RLG1";
const KIND_ENTRY: u8 = 1;
const KIND_TRUNCATE: u8 = 2;
const KIND_HARD_STATE: u8 = 3;
/// magic + kind + len + crc
const RECORD_OVERHEAD: u64 = 4 + 1 + 4 + 4;
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Term and vote, persisted before any response that depends on them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Everything a node reloads on restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
}

impl PersistedState {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.check_contiguous(entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// `entries` must continue the log without gaps
    fn check_contiguous(&self, entries: &[LogEntry]) -> Result<()> {
        let mut expected = self.entries.len() as u64 + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(Error::Wal(format!(
                    "append out of order: index {} expected {}",
                    entry.index, expected
                )));
            }
            expected += 1;
        }
        Ok(())
    }

    /// Replay an entry record; a later record for an index replaces the
    /// earlier one and everything after it
    fn replay_entry(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index >= 1 && entry.index <= self.entries.len() as u64 {
            self.truncate(entry.index);
        }
        self.append(std::slice::from_ref(&entry))
    }

    fn truncate(&mut self, from: u64) {
        self.entries.truncate(from.saturating_sub(1) as usize);
    }

    fn read(&self, range: Range<u64>) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| range.contains(&e.index))
            .cloned()
            .collect()
    }
}

pub trait LogStorage: Send + std::fmt::Debug {
    fn append_log(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Entries whose index lies in `range`
    fn read_log(&self, range: Range<u64>) -> Result<Vec<LogEntry>>;

    /// Drop every entry with index >= `from`
    fn truncate_log(&mut self, from: u64) -> Result<()>;

    fn persist_term(&mut self, term: u64, voted_for: Option<&str>) -> Result<()>;

    fn load(&mut self) -> Result<PersistedState>;
}

/// Volatile storage; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStorage {
    state: Arc<Mutex<PersistedState>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append_log(&mut self, entries: &[LogEntry]) -> Result<()> {
        lock(&self.state).append(entries)
    }

    fn read_log(&self, range: Range<u64>) -> Result<Vec<LogEntry>> {
        Ok(lock(&self.state).read(range))
    }

    fn truncate_log(&mut self, from: u64) -> Result<()> {
        lock(&self.state).truncate(from);
        Ok(())
    }

    fn persist_term(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        lock(&self.state).hard_state = HardState {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        Ok(())
    }

    fn load(&mut self) -> Result<PersistedState> {
        Ok(lock(&self.state).clone())
    }
}

/// Append-only on-disk storage with an in-memory mirror for reads
pub struct FileLogStorage {
    path: PathBuf,
    writer: BufWriter<File>,
    mirror: PersistedState,
    /// fsync after every write
    sync: bool,
}

impl std::fmt::Debug for FileLogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogStorage")
            .field("path", &self.path)
            .field("entries", &self.mirror.entries.len())
            .field("hard_state", &self.mirror.hard_state)
            .finish()
    }
}

impl FileLogStorage {
    /// Open or create the record file, replaying what it holds
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (mirror, valid_len) = Self::replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        // drop a torn tail so new records are not written after garbage
        if file.metadata()?.len() > valid_len {
            tracing::warn!("Truncating consensus log {:?} to {} bytes", path, valid_len);
            file.set_len(valid_len)?;
        }

        tracing::debug!(
            "Opened consensus log {:?}: {} entries, term {}",
            path,
            mirror.entries.len(),
            mirror.hard_state.term
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            mirror,
            sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the state, returning it with the length of the valid prefix
    fn replay(path: &Path) -> Result<(PersistedState, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((PersistedState::default(), 0))
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut state = PersistedState::default();
        let mut valid_len = 0u64;
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((kind, payload))) => {
                    if let Err(e) = Self::apply_record(&mut state, kind, &payload) {
                        tracing::warn!("Consensus log replay stopped at bad record: {}", e);
                        break;
                    }
                    valid_len += RECORD_OVERHEAD + payload.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Consensus log replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }
        Ok((state, valid_len))
    }

    fn apply_record(state: &mut PersistedState, kind: u8, payload: &[u8]) -> Result<()> {
        match kind {
            KIND_ENTRY => {
                let entry: LogEntry = bincode::deserialize(payload)?;
                state.replay_entry(entry)
            }
            KIND_TRUNCATE => {
                let from: u64 = bincode::deserialize(payload)?;
                state.truncate(from);
                Ok(())
            }
            KIND_HARD_STATE => {
                state.hard_state = bincode::deserialize(payload)?;
                Ok(())
            }
            other => Err(Error::Wal(format!("unknown record kind {}", other))),
        }
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Wal("invalid record magic".into()));
        }

        let mut kind = [0u8; 1];
        reader.read_exact(&mut kind)?;
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(Error::Wal(format!("record length {} too large", len)));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != record_checksum(kind[0], &len_bytes, &payload) {
            return Err(Error::Wal("checksum mismatch".into()));
        }

        Ok(Some((kind[0], payload)))
    }

    fn write_record(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let len_bytes = (payload.len() as u32).to_le_bytes();
        self.writer.write_all(&LOG_MAGIC)?;
        self.writer.write_all(&[kind])?;
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(payload)?;
        self.writer
            .write_all(&record_checksum(kind, &len_bytes, payload).to_le_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn record_checksum(kind: u8, len_bytes: &[u8; 4], payload: &[u8]) -> u32 {
    let mut data = Vec::with_capacity(5 + payload.len());
    data.push(kind);
    data.extend_from_slice(len_bytes);
    data.extend_from_slice(payload);
    crc32(&data)
}

impl LogStorage for FileLogStorage {
    fn append_log(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // validate against the mirror before touching the file
        self.mirror.check_contiguous(entries)?;
        for entry in entries {
            let payload = bincode::serialize(entry)?;
            self.write_record(KIND_ENTRY, &payload)?;
        }
        self.flush()?;
        self.mirror.entries.extend_from_slice(entries);
        Ok(())
    }

    fn read_log(&self, range: Range<u64>) -> Result<Vec<LogEntry>> {
        Ok(self.mirror.read(range))
    }

    fn truncate_log(&mut self, from: u64) -> Result<()> {
        let payload = bincode::serialize(&from)?;
        self.write_record(KIND_TRUNCATE, &payload)?;
        self.flush()?;
        self.mirror.truncate(from);
        Ok(())
    }

    fn persist_term(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let hard_state = HardState {
            term,
            voted_for: voted_for.map(str::to_string),
        };
        let payload = bincode::serialize(&hard_state)?;
        self.write_record(KIND_HARD_STATE, &payload)?;
        self.flush()?;
        self.mirror.hard_state = hard_state;
        Ok(())
    }

    fn load(&mut self) -> Result<PersistedState> {
        Ok(self.mirror.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(terms: &[u64]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, &t)| LogEntry::command(t, i as u64 + 1, format!("cmd{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_memory_storage_shared_between_clones() {
        let mut a = MemoryLogStorage::new();
        let mut b = a.clone();
        a.append_log(&entries(&[1, 1])).unwrap();
        a.persist_term(3, Some("n2")).unwrap();

        let loaded = b.load().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.hard_state.voted_for.as_deref(), Some("n2"));
        assert_eq!(b.read_log(2..3).unwrap().len(), 1);
    }

    #[test]
    fn test_file_storage_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");

        {
            let mut storage = FileLogStorage::open(&path, true).unwrap();
            storage.persist_term(1, Some("n1")).unwrap();
            storage.append_log(&entries(&[1, 1, 1])).unwrap();
            storage.truncate_log(2).unwrap();
            storage
                .append_log(&[LogEntry::command(2, 2, b"new".to_vec())])
                .unwrap();
            storage.persist_term(2, None).unwrap();
        }

        let mut storage = FileLogStorage::open(&path, true).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.hard_state, HardState { term: 2, voted_for: None });
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries[1].term, 2);
        assert_eq!(state.entries[1].data, b"new");
    }

    #[test]
    fn test_replay_stops_at_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut storage = FileLogStorage::open(&path, false).unwrap();
            storage.append_log(&entries(&[1, 1])).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        {
            // torn write after two good records
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"RLG1\x01garbage").unwrap();
        }
        assert!(std::fs::metadata(&path).unwrap().len() > len);

        let mut storage = FileLogStorage::open(&path, false).unwrap();
        assert_eq!(storage.load().unwrap().entries.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

        storage
            .append_log(&[LogEntry::command(1, 3, b"after".to_vec())])
            .unwrap();
        drop(storage);
        let mut reopened = FileLogStorage::open(&path, false).unwrap();
        assert_eq!(reopened.load().unwrap().entries.len(), 3);
    }

    #[test]
    fn test_rewritten_entry_replaces_earlier_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut storage = FileLogStorage::open(&path, false).unwrap();
            storage.append_log(&entries(&[1, 1])).unwrap();
            // a retried write after a failed flush lands the same index again
            let payload = bincode::serialize(&LogEntry::command(2, 2, b"retry".to_vec())).unwrap();
            storage.write_record(KIND_ENTRY, &payload).unwrap();
            storage.flush().unwrap();
        }

        let mut storage = FileLogStorage::open(&path, false).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries[1].term, 2);
        assert_eq!(state.entries[1].data, b"retry");
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = tempdir().unwrap();
        let mut storage = FileLogStorage::open(dir.path().join("raft.log"), false).unwrap();
        let result = storage.append_log(&[LogEntry::command(1, 5, vec![])]);
        assert!(matches!(result, Err(Error::Wal(_))));
        assert!(storage.load().unwrap().entries.is_empty());
    }
}
