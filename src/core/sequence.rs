use std::sync::atomic::{AtomicU64, Ordering};
use crate::core::error::{Error, Result};
use crate::core::types::Seq;
use crate::storage::keys;
use crate::storage::kv::{Kv, WriteBatch};

/// Global row counter. `peek` is the seq the next row will receive.
#[derive(Debug, Default)]
pub struct Sequence {
    next: AtomicU64,
}

impl Sequence {
    /// Reads the persisted counter; an empty store starts at 0.
    pub fn load(kv: &Kv) -> Result<Self> {
        let next = match kv.snapshot().get(&keys::SEQUENCE_KEY)? {
            Some(bytes) => keys::read_be64(&bytes)
                .ok_or_else(|| Error::corruption(format!("sequence value has {} bytes", bytes.len())))?,
            None => 0,
        };
        Ok(Sequence { next: AtomicU64::new(next) })
    }

    pub fn peek(&self) -> Seq {
        self.next.load(Ordering::Acquire)
    }

    /// Hands out the next seq.
    pub fn advance(&self) -> Seq {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Adds the current counter to `batch`, so it commits with the rows it covers.
    pub fn persist_into(&self, batch: &mut WriteBatch) {
        batch.put(keys::SEQUENCE_KEY.to_vec(), self.peek().to_be_bytes().to_vec());
    }

    pub fn persist(&self, kv: &Kv) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.persist_into(&mut batch);
        kv.apply(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::merge::KeyPrefixMerger;
    use crate::storage::kv::KvOptions;

    #[test]
    fn counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = Kv::open(dir.path(), KvOptions::default(), Arc::new(KeyPrefixMerger)).unwrap();
            let seq = Sequence::load(&kv).unwrap();
            assert_eq!(seq.advance(), 0);
            assert_eq!(seq.advance(), 1);
            seq.persist(&kv).unwrap();
        }

        let kv = Kv::open(dir.path(), KvOptions::default(), Arc::new(KeyPrefixMerger)).unwrap();
        let seq = Sequence::load(&kv).unwrap();
        assert_eq!(seq.peek(), 2);
        assert_eq!(seq.advance(), 2);
    }
}
