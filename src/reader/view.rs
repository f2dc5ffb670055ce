use std::collections::HashMap;
use std::sync::Arc;
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use crate::core::error::{Error, Result};
use crate::index::bsi::Bsi;
use crate::merge::decode_column;
use crate::storage::keys;
use crate::storage::kv::Snapshot;

/// Read access to one shard through a pinned snapshot.
///
/// Decoded indexes are cached for the life of the view, so a filter and the
/// aggregate that follows it decode each index once.
pub struct View {
    snapshot: Arc<Snapshot>,
    shard: u64,
    indexes: RwLock<HashMap<String, Option<Arc<Bsi>>>>,
}

impl View {
    pub fn new(snapshot: Arc<Snapshot>, shard: u64) -> Self {
        View {
            snapshot,
            shard,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> u64 {
        self.shard
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    /// The field's index, or `None` when nothing was indexed under it in this shard.
    pub fn index(&self, field: &str) -> Result<Option<Arc<Bsi>>> {
        if let Some(cached) = self.indexes.read().get(field) {
            return Ok(cached.clone());
        }

        let loaded = match self.snapshot.get(&keys::index_key(self.shard, field))? {
            Some(bytes) => Some(Arc::new(Bsi::deserialize(&bytes)?)),
            None => None,
        };
        self.indexes.write().insert(field.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn require_index(&self, field: &str) -> Result<Arc<Bsi>> {
        self.index(field)?
            .ok_or_else(|| Error::not_found(format!("no index for {} in shard {}", field, self.shard)))
    }

    /// Rows that hold a value for `field`; empty when the field is not indexed.
    pub fn existence(&self, field: &str) -> Result<RoaringTreemap> {
        Ok(self
            .index(field)?
            .map(|bsi| bsi.existence().clone())
            .unwrap_or_default())
    }

    pub fn column(&self, field: &str) -> Result<Option<ArrayRef>> {
        match self.snapshot.get(&keys::column_key(self.shard, field))? {
            Some(bytes) => Ok(Some(decode_column(&bytes)?.array)),
            None => Ok(None),
        }
    }

    /// Every column of the shard, ordered by field name.
    pub fn columns(&self) -> Result<Vec<(Field, ArrayRef)>> {
        let mut columns = Vec::new();
        for (key, value) in self.snapshot.scan_prefix(&keys::column_prefix(self.shard))? {
            let decoded = decode_column(&value)?;
            let name = keys::decode_field(&key)
                .ok_or_else(|| Error::corruption("columnar key without a field name"))?;
            if name != decoded.field.name().as_str() {
                return Err(Error::corruption(format!(
                    "column key {} holds field {}",
                    name,
                    decoded.field.name()
                )));
            }
            columns.push((decoded.field, decoded.array));
        }
        Ok(columns)
    }

    /// The shard's rows as one batch, columns ordered by field name.
    pub fn record(&self) -> Result<RecordBatch> {
        let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = self.columns()?.into_iter().unzip();
        if fields.is_empty() {
            return Err(Error::not_found(format!("shard {} has no columns", self.shard)));
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    /// Values indexed as strings under `field`, in byte order.
    pub fn dictionary(&self, field: &str) -> Result<Vec<String>> {
        let prefix = keys::dict_forward_prefix(self.shard, field);
        let mut values = Vec::new();
        for key in self.snapshot.keys_in_range(&prefix, keys::prefix_end(&prefix).as_deref())? {
            let value = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::corruption(format!("dictionary value is not UTF-8: {}", e)))?;
            values.push(value.to_string());
        }
        Ok(values)
    }

    /// Original string behind a content hash.
    pub fn translate(&self, hash: u64) -> Result<Option<String>> {
        match self.snapshot.get(&keys::dict_reverse_key(self.shard, hash))? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::corruption(format!("dictionary value is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }
}
