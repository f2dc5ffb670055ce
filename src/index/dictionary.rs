use std::collections::{BTreeMap, HashSet};
use xxhash_rust::xxh3::xxh3_64;
use crate::storage::keys;
use crate::storage::kv::WriteBatch;

/// 64-bit content hash of `"<field>=<value>"`.
///
/// The field name takes part so equal strings in different fields never share a hash.
pub fn content_hash(field: &str, value: &str) -> u64 {
    let mut buf = Vec::with_capacity(field.len() + 1 + value.len());
    buf.extend_from_slice(field.as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    xxh3_64(&buf)
}

/// Hash as stored in a BSI payload.
pub fn content_hash_i64(field: &str, value: &str) -> i64 {
    content_hash(field, value) as i64
}

/// Dictionary entries of the shard being written, pending the next emit.
#[derive(Debug, Default)]
pub struct ShardDictionary {
    pending: BTreeMap<u64, (String, String)>,
    committed: HashSet<u64>,
}

impl ShardDictionary {
    pub fn new() -> Self {
        ShardDictionary::default()
    }

    /// Registers `value` under `field` and returns its content hash.
    pub fn intern(&mut self, field: &str, value: &str) -> u64 {
        let hash = content_hash(field, value);
        if !self.committed.contains(&hash) {
            self.pending
                .entry(hash)
                .or_insert_with(|| (field.to_string(), value.to_string()));
        }
        hash
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Moves pending entries into `batch` as forward and reverse keys.
    ///
    /// Entries count as committed from here on; a failed emit loses them with the rest of the buffer.
    pub fn drain_into(&mut self, shard: u64, batch: &mut WriteBatch) -> usize {
        let drained = self.pending.len();
        for (hash, (field, value)) in std::mem::take(&mut self.pending) {
            batch.put(keys::dict_forward_key(shard, &field, &value), Vec::new());
            batch.put(keys::dict_reverse_key(shard, hash), value.into_bytes());
            self.committed.insert(hash);
        }
        drained
    }

    /// Forget everything; called when the writer moves to a new shard.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.committed.clear();
    }
}
