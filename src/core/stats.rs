use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use serde::{Serialize, Deserialize};

/// Key/value engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStats {
    pub version: u64,          // Latest published version
    pub keys: usize,           // Keys with operations still in memory
    pub operations: usize,     // Operations not yet flushed to a table
    pub tables: usize,
    pub table_bytes: u64,
    pub wal_bytes: u64,        // Size of the active WAL file
    pub active_readers: usize, // Pinned snapshots
}

/// Store statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub kv: KvStats,
    pub next_seq: u64,
    pub shard_width: u64,
    pub shards: usize,
}

/// Live counters of the ingestion front door.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
    last_flush_unix_ms: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        IngestStats::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        let last_flush = self.last_flush_unix_ms.load(Ordering::Relaxed);
        IngestSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            last_flush_unix_ms: (last_flush > 0).then_some(last_flush),
        }
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSnapshot {
    pub accepted: u64,   // Taken off the caller's hands
    pub dropped: u64,    // Rejected by `try_append` on a full channel
    pub written: u64,    // Made it into the shard writer
    pub failed: u64,     // Write or flush errors, logged and skipped
    pub flushes: u64,
    pub last_flush_unix_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = IngestStats::new();
        assert_eq!(stats.snapshot().last_flush_unix_ms, None);

        stats.record_accepted();
        stats.record_accepted();
        stats.record_written();
        stats.record_dropped();
        stats.record_flush();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.written, 1);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.flushes, 1);
        assert!(snap.last_flush_unix_ms.is_some());
    }
}
