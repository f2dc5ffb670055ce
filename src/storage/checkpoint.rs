use std::fs::{self, File};
use std::io::Write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::storage::layout::StorageLayout;
use crate::core::error::Result;

/// Durable recovery point.
///
/// `tables` hold every operation up to `flushed`; WAL replay starts at file
/// `wal_sequence` and skips anything at or below `flushed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u64,       // Latest published version when the checkpoint was taken
    pub flushed: u64,
    pub tables: Vec<u64>,   // Oldest first
    pub wal_sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Load checkpoint from disk
    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(path)?;
        let checkpoint = bincode::deserialize(&data)?;
        Ok(Some(checkpoint))
    }

    /// Save checkpoint to disk, replacing the previous one atomically.
    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let data = bincode::serialize(self)?;
        let path = storage.checkpoint_path();
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        assert!(Checkpoint::load(&layout).unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let first = Checkpoint { version: 3, flushed: 3, tables: vec![1], wal_sequence: 2, timestamp: Utc::now() };
        first.save(&layout).unwrap();
        let second = Checkpoint { version: 8, flushed: 6, tables: vec![1, 2], wal_sequence: 3, timestamp: Utc::now() };
        second.save(&layout).unwrap();

        assert_eq!(Checkpoint::load(&layout).unwrap(), Some(second));
    }
}
