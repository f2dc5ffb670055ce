use std::path::PathBuf;
use std::time::Duration;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::wal::SyncMode;

/// Rows per shard unless configured otherwise.
pub const DEFAULT_SHARD_WIDTH: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: PathBuf,

    // Shard partitioning: shard = seq / shard_width
    pub shard_width: u64,

    // KV durability
    pub sync_mode: SyncMode,
    pub wal_checkpoint_bytes: u64,   // Auto-checkpoint once the WAL grows past this

    // Ingestion front door
    pub ingest_buffer: usize,        // Channel capacity before producers block
    pub flush_interval: Duration,    // Periodic flush of the live shard
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            shard_width: DEFAULT_SHARD_WIDTH,
            sync_mode: SyncMode::Immediate,
            wal_checkpoint_bytes: 64 * 1024 * 1024,
            ingest_buffer: 4096,
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: storage_path.into(),
            ..Config::default()
        }
    }

    pub fn with_shard_width(mut self, shard_width: u64) -> Self {
        self.shard_width = shard_width;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_ingest_buffer(mut self, ingest_buffer: usize) -> Self {
        self.ingest_buffer = ingest_buffer;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_wal_checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.wal_checkpoint_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_width == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "shard_width must be positive"));
        }
        if self.ingest_buffer == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "ingest_buffer must be positive"));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::new(ErrorKind::InvalidArgument, "flush_interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shard_width, 1_048_576);
        assert_eq!(config.flush_interval, Duration::from_secs(60));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = Config::new("/tmp/x").with_shard_width(0).validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        assert!(Config::default().with_ingest_buffer(0).validate().is_err());
        assert!(Config::default().with_flush_interval(Duration::ZERO).validate().is_err());
    }
}
