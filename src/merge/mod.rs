//! Merge operators: combine several writes to one key without read-modify-write.
//!
//! The KV engine may run a merge zero, one or many times, eagerly or lazily,
//! over any grouping of operands. Mergers therefore hold no outside state.

pub mod bsi;
pub mod columnar;

use crate::core::error::Result;
use crate::storage::keys;

pub use bsi::BsiMerger;
pub use columnar::{decode_column, decode_field, encode_column, ColumnMerger, DecodedColumn};

/// Accumulates operands around an initial value.
pub trait ValueMerger: Send {
    /// `value` was written after everything merged so far.
    fn merge_newer(&mut self, value: &[u8]) -> Result<()>;

    /// `value` was written before everything merged so far.
    fn merge_older(&mut self, value: &[u8]) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Hook registered with the KV engine.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &'static str;

    /// A merger seeded with `value`, or `None` when `key` does not take part in merging.
    fn start(&self, key: &[u8], value: &[u8]) -> Result<Option<Box<dyn ValueMerger>>>;
}

/// Dispatches on the key's tag byte: columnar keys concatenate, index keys union.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyPrefixMerger;

impl MergeOperator for KeyPrefixMerger {
    fn name(&self) -> &'static str {
        "tallyx.key-prefix"
    }

    fn start(&self, key: &[u8], value: &[u8]) -> Result<Option<Box<dyn ValueMerger>>> {
        match key.first() {
            Some(&keys::COLUMN) => Ok(Some(Box::new(ColumnMerger::new(value)?))),
            Some(&keys::INDEX) => Ok(Some(Box::new(BsiMerger::new(value)?))),
            _ => Ok(None),
        }
    }
}

/// Pure pairwise merge over serialized values. Passthrough keys keep the newer value.
pub fn combine(operator: &dyn MergeOperator, key: &[u8], older: &[u8], newer: &[u8]) -> Result<Vec<u8>> {
    match operator.start(key, older)? {
        Some(mut merger) => {
            merger.merge_newer(newer)?;
            merger.finish()
        }
        None => Ok(newer.to_vec()),
    }
}

/// Folds operands given oldest first, starting from the oldest.
pub fn fold_forward(operator: &dyn MergeOperator, key: &[u8], operands: &[&[u8]]) -> Result<Option<Vec<u8>>> {
    let Some((first, rest)) = operands.split_first() else {
        return Ok(None);
    };
    match operator.start(key, first)? {
        Some(mut merger) => {
            for operand in rest {
                merger.merge_newer(operand)?;
            }
            merger.finish().map(Some)
        }
        None => Ok(operands.last().map(|v| v.to_vec())),
    }
}

/// Folds operands given oldest first, starting from the newest.
pub fn fold_backward(operator: &dyn MergeOperator, key: &[u8], operands: &[&[u8]]) -> Result<Option<Vec<u8>>> {
    let Some((last, rest)) = operands.split_last() else {
        return Ok(None);
    };
    match operator.start(key, last)? {
        Some(mut merger) => {
            for operand in rest.iter().rev() {
                merger.merge_older(operand)?;
            }
            merger.finish().map(Some)
        }
        None => Ok(Some(last.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use arrow::array::{Array, UInt64Array};
    use arrow::datatypes::{DataType, Field};
    use crate::index::bsi::Bsi;

    fn column(values: &[u64]) -> Vec<u8> {
        let field = Field::new("n", DataType::UInt64, true);
        encode_column(&field, Arc::new(UInt64Array::from(values.to_vec()))).unwrap()
    }

    fn column_values(data: &[u8]) -> Vec<u64> {
        let decoded = decode_column(data).unwrap();
        decoded.array.as_any().downcast_ref::<UInt64Array>().unwrap().values().to_vec()
    }

    fn index(entries: &[(u64, i64)]) -> Vec<u8> {
        let mut bsi = Bsi::new();
        for (column, value) in entries {
            bsi.set_value(*column, *value);
        }
        bsi.serialize().unwrap()
    }

    #[test]
    fn passthrough_keys_keep_newer_value() {
        let merged = combine(&KeyPrefixMerger, &keys::SEQUENCE_KEY, b"old", b"new").unwrap();
        assert_eq!(merged, b"new");
    }

    #[test]
    fn columnar_merge_preserves_order_under_any_grouping() {
        let key = keys::column_key(0, "n");
        let (a, b, c) = (column(&[1, 2]), column(&[3]), column(&[4, 5, 6]));
        let expected = vec![1, 2, 3, 4, 5, 6];

        let forward = fold_forward(&KeyPrefixMerger, &key, &[&a, &b, &c]).unwrap().unwrap();
        let backward = fold_backward(&KeyPrefixMerger, &key, &[&a, &b, &c]).unwrap().unwrap();
        let left = combine(&KeyPrefixMerger, &key, &combine(&KeyPrefixMerger, &key, &a, &b).unwrap(), &c).unwrap();
        let right = combine(&KeyPrefixMerger, &key, &a, &combine(&KeyPrefixMerger, &key, &b, &c).unwrap()).unwrap();

        for merged in [forward, backward, left, right] {
            assert_eq!(column_values(&merged), expected);
        }
    }

    #[test]
    fn index_merge_is_commutative() {
        let key = keys::index_key(0, "uid");
        let a = index(&[(1, 10), (2, -4)]);
        let b = index(&[(3, 7)]);

        let ab = Bsi::deserialize(&combine(&KeyPrefixMerger, &key, &a, &b).unwrap()).unwrap();
        let ba = Bsi::deserialize(&combine(&KeyPrefixMerger, &key, &b, &a).unwrap()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.get_value(2), Some(-4));
        assert_eq!(ab.get_value(3), Some(7));
    }

    #[test]
    fn empty_operand_list_yields_nothing() {
        assert!(fold_forward(&KeyPrefixMerger, &[keys::COLUMN], &[]).unwrap().is_none());
    }
}
