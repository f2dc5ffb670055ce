use std::path::{Path, PathBuf};
use std::fs;
use crate::core::error::Result;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory
    pub tables_dir: PathBuf,    // Resolved key/value tables (.tbl files)
    pub wal_dir: PathBuf,       // Write-ahead log location
    pub meta_dir: PathBuf,      // Checkpoint location
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let tables_dir = base_dir.join("tables");
        let wal_dir = base_dir.join("wal");
        let meta_dir = base_dir.join("meta");

        fs::create_dir_all(&tables_dir)?;
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&meta_dir)?;

        Ok(StorageLayout {
            base_dir,
            tables_dir,
            wal_dir,
            meta_dir,
        })
    }

    pub fn table_path(&self, version: u64) -> PathBuf {
        self.tables_dir.join(format!("table_{:020}.tbl", version))
    }

    pub fn wal_path(&self, sequence: u64) -> PathBuf {
        self.wal_dir.join(format!("wal_{:020}.log", sequence))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.meta_dir.join("checkpoint.bin")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Numbers embedded in `<prefix>NNN.<ext>` file names, sorted ascending.
    pub fn numbered_files(dir: &Path, prefix: &str, ext: &str) -> Result<Vec<u64>> {
        let mut numbers = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ext) {
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(prefix))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(number) = number {
                numbers.push(number);
            }
        }

        numbers.sort_unstable();
        Ok(numbers)
    }
}
