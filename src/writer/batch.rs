use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use arrow::record_batch::RecordBatch;
use tracing::{debug, error, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::sequence::Sequence;
use crate::core::types::{shard_of, Seq, TimeRange};
use crate::index::bsi::Bsi;
use crate::index::dictionary::ShardDictionary;
use crate::merge::{decode_field, encode_column};
use crate::schema::{Record, Schema};
use crate::storage::keys;
use crate::storage::kv::{Kv, WriteBatch};

/// Index callback handed to the caller during [`ShardWriter::write`].
///
/// Entries are keyed at the seq of the row being written. They are staged and
/// only reach the shard's indexes once the whole row has been accepted.
pub struct Index<'a> {
    seq: Seq,
    staged: &'a mut Staging,
}

#[derive(Debug)]
enum IndexValue {
    Int(i64),
    Str(String),
}

#[derive(Debug, Default)]
struct Staging {
    entries: Vec<(String, IndexValue)>,
    rejected: Option<String>,
}

impl<'a> Index<'a> {
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Records `value` for `field` at this row.
    pub fn int64(&mut self, field: &str, value: i64) {
        if self.accepts(field) {
            self.staged.entries.push((field.to_string(), IndexValue::Int(value)));
        }
    }

    /// Records the content hash of `value` and registers it in the shard dictionary.
    pub fn string(&mut self, field: &str, value: &str) {
        if self.accepts(field) {
            self.staged.entries.push((field.to_string(), IndexValue::Str(value.to_string())));
        }
    }

    // Dictionary keys join field and value with '='
    fn accepts(&mut self, field: &str) -> bool {
        if field.contains('=') {
            self.staged.rejected.get_or_insert_with(|| field.to_string());
            return false;
        }
        true
    }
}

/// Releases the store's single-writer slot on drop.
pub(crate) struct WriterGuard {
    active: Arc<AtomicBool>,
}

impl WriterGuard {
    pub(crate) fn acquire(active: &Arc<AtomicBool>) -> Result<Self> {
        active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::new(ErrorKind::InvalidState, "a shard writer is already live for this store"))?;
        Ok(WriterGuard { active: active.clone() })
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Accumulates rows of one shard and commits them as a single atomic batch.
///
/// A failed emit loses the buffered rows: buffers are taken before anything is
/// serialized, and ingestion is at-most-once anyway.
pub struct ShardWriter<T: Record> {
    kv: Kv,
    sequence: Arc<Sequence>,
    shard_width: u64,
    schema: Schema<T>,
    shard: Option<u64>,
    indexes: BTreeMap<String, Bsi>,
    dictionary: ShardDictionary,
    range: Option<TimeRange>,   // Running bounds of the current shard, kept across flushes
    verified: Option<u64>,      // Shard whose committed columns match this writer's schema
    _guard: WriterGuard,
}

impl<T: Record> ShardWriter<T> {
    pub(crate) fn new(kv: Kv, sequence: Arc<Sequence>, shard_width: u64, guard: WriterGuard) -> Result<Self> {
        Ok(ShardWriter {
            kv,
            sequence,
            shard_width,
            schema: Schema::new()?,
            shard: None,
            indexes: BTreeMap::new(),
            dictionary: ShardDictionary::new(),
            range: None,
            verified: None,
            _guard: guard,
        })
    }

    /// Shard the writer is filling, if any row has been written.
    pub fn shard(&self) -> Option<u64> {
        self.shard
    }

    /// Rows buffered since the last emit.
    pub fn pending_rows(&self) -> usize {
        self.schema.rows()
    }

    pub fn next_seq(&self) -> Seq {
        self.sequence.peek()
    }

    /// Appends `record` under the next seq and lets `index` register index entries for it.
    ///
    /// Crossing into a new shard emits the previous one first. A record the
    /// schema rejects, or an index field name holding '=', consumes no seq and
    /// leaves nothing behind.
    pub fn write<F>(&mut self, record: &T, timestamp: u64, index: F) -> Result<Seq>
    where
        F: FnOnce(&mut Index<'_>),
    {
        let seq = self.sequence.peek();
        let shard = shard_of(seq, self.shard_width);

        if self.shard != Some(shard) {
            if self.schema.rows() > 0 {
                self.emit()?;
            }
            self.shard = Some(shard);
            self.dictionary.reset();
            self.range = None;
        }

        let mut staged = Staging::default();
        index(&mut Index { seq, staged: &mut staged });
        if let Some(field) = staged.rejected {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("index field name {:?} contains '='", field),
            ));
        }

        self.schema.append(record)?;
        let seq = self.sequence.advance();

        for (field, value) in staged.entries {
            let value = match value {
                IndexValue::Int(value) => value,
                IndexValue::Str(value) => self.dictionary.intern(&field, &value) as i64,
            };
            self.indexes.entry(field).or_default().set_value(seq, value);
        }

        match self.range.as_mut() {
            Some(range) => range.widen(timestamp),
            None => self.range = Some(TimeRange::new(timestamp)),
        }
        Ok(seq)
    }

    /// Commits buffered rows without moving to a new shard.
    pub fn flush(&mut self) -> Result<()> {
        self.emit()
    }

    /// Final flush, then persists the sequence and syncs the log.
    pub fn release(mut self) -> Result<()> {
        self.emit()?;
        self.sequence.persist(&self.kv)?;
        self.kv.sync()?;
        debug!(next_seq = self.sequence.peek(), "shard writer released");
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        let Some(shard) = self.shard else {
            return Ok(());
        };
        let rows = self.schema.rows();
        if rows == 0 {
            return Ok(());
        }

        let record = self.schema.new_record();
        let indexes = mem::take(&mut self.indexes);
        let mut batch = WriteBatch::new();
        let strings = self.dictionary.drain_into(shard, &mut batch);

        let result = self.build_and_apply(shard, record, &indexes, batch);
        if let Err(e) = &result {
            // Entries drained above may not have landed; write them again next time
            self.dictionary.reset();
            error!(shard, rows, error = %e, "shard emit failed, buffered rows dropped");
        } else {
            self.verified = Some(shard);
            debug!(shard, rows, indexes = indexes.len(), strings, "shard emitted");
        }
        result
    }

    fn build_and_apply(
        &self,
        shard: u64,
        record: Result<RecordBatch>,
        indexes: &BTreeMap<String, Bsi>,
        mut batch: WriteBatch,
    ) -> Result<()> {
        let record = record?;
        if self.verified != Some(shard) {
            self.verify_shard(shard, &record)?;
        }
        for (field, column) in record.schema().fields().iter().zip(record.columns()) {
            let value = encode_column(field, column.clone())?;
            batch.merge(keys::column_key(shard, field.name()), value);
        }

        for (field, bsi) in indexes {
            batch.merge(keys::index_key(shard, field), bsi.serialize()?);
        }

        // Both bounds on every emit; time pruning relies on it
        if let Some(range) = self.range {
            batch.put(keys::time_range_key(range.min, shard), Vec::new());
            batch.put(keys::time_range_key(range.max, shard), Vec::new());
        }

        self.sequence.persist_into(&mut batch);
        self.kv.apply(batch)?;
        Ok(())
    }

    /// Refuses a record whose columns differ from those already committed to `shard`.
    ///
    /// Merging a column of another type would fail on every later read of the shard.
    fn verify_shard(&self, shard: u64, record: &RecordBatch) -> Result<()> {
        let snapshot = self.kv.snapshot();
        let prefix = keys::column_prefix(shard);
        let committed = snapshot.keys_in_range(&prefix, keys::prefix_end(&prefix).as_deref())?;
        if committed.is_empty() {
            return Ok(());
        }

        let schema = record.schema();
        let names: BTreeSet<&[u8]> = committed.iter().map(|key| &key[prefix.len()..]).collect();
        let fields: BTreeSet<&[u8]> = schema.fields().iter().map(|field| field.name().as_bytes()).collect();
        if names != fields {
            return Err(Error::new(
                ErrorKind::UnsupportedSchema,
                format!("shard {} already holds a different set of columns", shard),
            ));
        }

        for field in schema.fields() {
            let Some(operand) = snapshot.latest_operand(&keys::column_key(shard, field.name()))? else {
                continue;
            };
            let existing = decode_field(&operand)?;
            if existing.data_type() != field.data_type() {
                return Err(Error::new(
                    ErrorKind::UnsupportedSchema,
                    format!(
                        "column {:?} of shard {} holds {}, record has {}",
                        field.name(),
                        shard,
                        existing.data_type(),
                        field.data_type()
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl<T: Record> Drop for ShardWriter<T> {
    fn drop(&mut self) {
        let rows = self.schema.rows();
        if rows > 0 {
            warn!(shard = ?self.shard, rows, "shard writer dropped with unflushed rows");
        }
    }
}
