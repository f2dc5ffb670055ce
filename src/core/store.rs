use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::sequence::Sequence;
use crate::core::stats::StoreStats;
use crate::merge::KeyPrefixMerger;
use crate::reader::view::View;
use crate::schema::Record;
use crate::storage::keys;
use crate::storage::kv::{Kv, KvOptions};
use crate::writer::batch::{ShardWriter, WriterGuard};

/// Owns the KV handle, the sequence counter and the single-writer slot.
#[derive(Clone)]
pub struct Store {
    kv: Kv,
    config: Config,
    sequence: Arc<Sequence>,
    writer_active: Arc<AtomicBool>,
}

impl Store {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let options = KvOptions {
            sync_mode: config.sync_mode,
            checkpoint_bytes: config.wal_checkpoint_bytes,
            ..KvOptions::default()
        };
        let kv = Kv::open(config.storage_path.clone(), options, Arc::new(KeyPrefixMerger))?;
        let sequence = Arc::new(Sequence::load(&kv)?);

        info!(
            path = %config.storage_path.display(),
            shard_width = config.shard_width,
            next_seq = sequence.peek(),
            "store opened"
        );

        Ok(Store {
            kv,
            config,
            sequence,
            writer_active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Seq the next written row will receive.
    pub fn next_seq(&self) -> u64 {
        self.sequence.peek()
    }

    /// Mints the store's shard writer. Only one may be live at a time.
    pub fn batch<T: Record>(&self) -> Result<ShardWriter<T>> {
        let guard = WriterGuard::acquire(&self.writer_active)?;
        ShardWriter::new(self.kv.clone(), self.sequence.clone(), self.config.shard_width, guard)
    }

    /// Shards holding committed columnar data, ascending.
    pub fn shards(&self) -> Result<Vec<u64>> {
        let (start, end) = keys::tag_range(keys::COLUMN);
        let shards: BTreeSet<u64> = self
            .kv
            .snapshot()
            .keys_in_range(&start, Some(&end))?
            .iter()
            .filter_map(|key| keys::decode_shard(key))
            .collect();
        Ok(shards.into_iter().collect())
    }

    /// Shards whose persisted time range overlaps `[start, end]`, ascending.
    pub fn shards_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>> {
        if start > end {
            return Ok(Vec::new());
        }

        let snapshot = self.kv.snapshot();
        let (tag_start, tag_end) = keys::tag_range(keys::TIME_RANGE);

        // Markers at or before `end` give each shard's minimum
        let upper = match end.checked_add(1) {
            Some(next) => keys::time_range_key(next, 0),
            None => tag_end.clone(),
        };
        let mut starts_before_end = BTreeSet::new();
        for key in snapshot.keys_in_range(&tag_start, Some(&upper))? {
            if let Some((_, shard)) = keys::decode_time_range_key(&key) {
                starts_before_end.insert(shard);
            }
        }

        // Markers at or after `start` give each shard's maximum
        let lower = keys::time_range_key(start, 0);
        let mut ends_after_start = BTreeSet::new();
        for key in snapshot.keys_in_range(&lower, Some(&tag_end))? {
            if let Some((_, shard)) = keys::decode_time_range_key(&key) {
                ends_after_start.insert(shard);
            }
        }

        Ok(starts_before_end.intersection(&ends_after_start).copied().collect())
    }

    /// Persisted `(min, max)` timestamps per shard.
    pub fn time_ranges(&self) -> Result<BTreeMap<u64, (u64, u64)>> {
        let (start, end) = keys::tag_range(keys::TIME_RANGE);
        let mut ranges: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
        for key in self.kv.snapshot().keys_in_range(&start, Some(&end))? {
            if let Some((ts, shard)) = keys::decode_time_range_key(&key) {
                ranges
                    .entry(shard)
                    .and_modify(|(min, max)| {
                        *min = (*min).min(ts);
                        *max = (*max).max(ts);
                    })
                    .or_insert((ts, ts));
            }
        }
        Ok(ranges)
    }

    /// Read view of one shard at the latest committed state.
    pub fn view(&self, shard: u64) -> View {
        View::new(Arc::new(self.kv.snapshot()), shard)
    }

    /// Views of several shards sharing one snapshot.
    pub fn views(&self, shards: &[u64]) -> Vec<View> {
        let snapshot = Arc::new(self.kv.snapshot());
        shards.iter().map(|shard| View::new(snapshot.clone(), *shard)).collect()
    }

    /// Manual compaction over the row-data key range.
    pub fn compact(&self) -> Result<()> {
        let (start, end) = keys::row_data_range();
        self.kv.compact_range(&start, Some(&end))
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.kv.checkpoint()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            kv: self.kv.stats(),
            next_seq: self.sequence.peek(),
            shard_width: self.config.shard_width,
            shards: self.shards()?.len(),
        })
    }

    /// Persists the sequence and checkpoints. Other clones keep the files locked until dropped.
    pub fn close(self) -> Result<()> {
        self.sequence.persist(&self.kv)?;
        self.kv.checkpoint()?;
        info!(next_seq = self.sequence.peek(), "store closed");
        Ok(())
    }
}
