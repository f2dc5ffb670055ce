use std::fs::{File, OpenOptions};
use std::io::{Read, Write, Seek, SeekFrom};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use crate::storage::layout::StorageLayout;
use crate::core::error::{Result, Error, ErrorKind};

const FRAME_HEADER: usize = 8; // len u32 + crc32 u32
const MAX_FRAME: usize = 1 << 30;
const BATCH_SYNC_BYTES: u64 = 1024 * 1024;

/// Write-ahead log of atomic KV batches. One frame per batch.
pub struct WAL {
    pub file: File,
    pub position: u64,
    pub sync_mode: SyncMode,
    pub sequence: u64,      // Ordinal of this log file
    unsynced: u64,
    poisoned: bool,         // A partial frame could not be cut off
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Immediate,  // fsync after every batch
    Batch,      // fsync roughly every megabyte
    None,       // Let OS handle it
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Merge { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Operation {
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Merge { key, .. } | Operation::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WALEntry {
    pub version: u64,
    pub operations: Vec<Operation>,
    pub timestamp: DateTime<Utc>,
}

// Serializes identically to `WALEntry`; lets `append` borrow the operations.
#[derive(Serialize)]
struct WALEntryRef<'a> {
    version: u64,
    operations: &'a [Operation],
    timestamp: DateTime<Utc>,
}

/// Entries recovered from one log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<WALEntry>,
    pub torn_tail: bool,
}

impl WAL {
    pub fn open(storage: &StorageLayout, sequence: u64, sync_mode: SyncMode) -> Result<Self> {
        let path = storage.wal_path(sequence);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let position = file.metadata()?.len();

        Ok(WAL {
            file,
            position,
            sync_mode,
            sequence,
            unsynced: 0,
            poisoned: false,
        })
    }

    /// Appends one batch as a single checksummed frame.
    pub fn append(&mut self, version: u64, operations: &[Operation]) -> Result<u64> {
        if self.poisoned {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("WAL {} holds a partial frame and refuses appends until rotated", self.sequence),
            ));
        }

        let entry = WALEntryRef {
            version,
            operations,
            timestamp: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        if data.len() > MAX_FRAME {
            return Err(Error::new(ErrorKind::InvalidArgument, "batch too large for one WAL frame"));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
        frame.extend_from_slice(&data);
        if let Err(e) = self.file.write_all(&frame) {
            // Replay stops at the first bad frame, so nothing may follow a partial one
            if let Err(truncate) = self.file.set_len(self.position) {
                error!(wal = self.sequence, error = %truncate, "could not drop partial WAL frame");
                self.poisoned = true;
            }
            return Err(e.into());
        }

        let written = frame.len() as u64;
        self.position += written;
        self.unsynced += written;

        match self.sync_mode {
            SyncMode::Immediate => self.sync()?,
            SyncMode::Batch if self.unsynced >= BATCH_SYNC_BYTES => self.sync()?,
            _ => {}
        }

        Ok(written)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Whether appends are refused after a failed write could not be undone.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Starts a fresh log file numbered `sequence`.
    pub fn rotate(&mut self, storage: &StorageLayout, sequence: u64) -> Result<()> {
        self.sync()?;
        *self = WAL::open(storage, sequence, self.sync_mode)?;
        Ok(())
    }

    /// Read all intact entries. A short or corrupt final frame ends the replay.
    pub fn read_entries(&mut self) -> Result<Replay> {
        let mut replay = Replay::default();
        let mut intact = 0u64;
        self.file.seek(SeekFrom::Start(0))?;

        loop {
            let mut header = [0u8; FRAME_HEADER];
            match read_full(&mut self.file, &mut header)? {
                0 => break,
                n if n < FRAME_HEADER => {
                    replay.torn_tail = true;
                    break;
                }
                _ => {}
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len > MAX_FRAME {
                replay.torn_tail = true;
                break;
            }

            let mut data = vec![0u8; len];
            if read_full(&mut self.file, &mut data)? < len || crc32fast::hash(&data) != crc {
                replay.torn_tail = true;
                break;
            }

            match bincode::deserialize::<WALEntry>(&data) {
                Ok(entry) => {
                    replay.entries.push(entry);
                    intact += (FRAME_HEADER + len) as u64;
                }
                Err(e) => {
                    warn!(error = %e, "undecodable WAL frame with valid checksum");
                    replay.torn_tail = true;
                    break;
                }
            }
        }

        // Later appends must not land behind garbage
        if replay.torn_tail {
            self.file.set_len(intact)?;
            self.file.sync_all()?;
        }

        self.position = self.file.seek(SeekFrom::End(0))?;
        Ok(replay)
    }

    /// Find all WAL files for recovery
    pub fn find_wal_files(storage: &StorageLayout) -> Result<Vec<u64>> {
        StorageLayout::numbered_files(storage.wal_dir(), "wal_", "log")
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Operation {
        Operation::Put { key: key.as_bytes().to_vec(), value: value.as_bytes().to_vec() }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let mut wal = WAL::open(&layout, 1, SyncMode::Immediate).unwrap();
        wal.append(1, &[put("a", "1")]).unwrap();
        wal.append(2, &[put("b", "2"), Operation::Delete { key: b"a".to_vec() }]).unwrap();
        drop(wal);

        let mut wal = WAL::open(&layout, 1, SyncMode::Immediate).unwrap();
        let replay = wal.read_entries().unwrap();
        assert!(!replay.torn_tail);
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].version, 2);
        assert_eq!(replay.entries[1].operations[1].key(), b"a");
    }

    #[test]
    fn poisoned_log_refuses_appends_until_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let mut wal = WAL::open(&layout, 1, SyncMode::None).unwrap();
        wal.append(1, &[put("a", "1")]).unwrap();
        wal.poisoned = true;

        let err = wal.append(2, &[put("b", "2")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(wal.position, wal.file.metadata().unwrap().len());

        wal.rotate(&layout, 2).unwrap();
        assert!(!wal.is_poisoned());
        wal.append(2, &[put("b", "2")]).unwrap();
        assert_eq!(WAL::find_wal_files(&layout).unwrap(), vec![1, 2]);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let mut wal = WAL::open(&layout, 1, SyncMode::None).unwrap();
        wal.append(1, &[put("a", "1")]).unwrap();
        wal.file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(wal);

        let mut wal = WAL::open(&layout, 1, SyncMode::None).unwrap();
        let replay = wal.read_entries().unwrap();
        assert!(replay.torn_tail);
        assert_eq!(replay.entries.len(), 1);

        wal.append(2, &[put("b", "2")]).unwrap();
        drop(wal);

        let mut wal = WAL::open(&layout, 1, SyncMode::None).unwrap();
        let replay = wal.read_entries().unwrap();
        assert!(!replay.torn_tail);
        assert_eq!(replay.entries.len(), 2);
    }
}
