use std::collections::BTreeMap;
use std::io::Cursor;
use rayon::prelude::*;
use roaring::RoaringTreemap;
use crate::core::error::{Error, ErrorKind, Result};

const MAGIC: &[u8; 4] = b"BSI1";
const MAX_SLICES: usize = 64;

/// Comparison against a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Bit-sliced index: column (row seq) -> i64, stored sign-magnitude.
///
/// `ebm` marks columns holding a value, `sign` marks negative values and
/// `slices[i]` holds the columns whose magnitude has bit `i` set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bsi {
    ebm: RoaringTreemap,
    sign: RoaringTreemap,
    slices: Vec<RoaringTreemap>,
}

struct Split {
    lt: RoaringTreemap,
    eq: RoaringTreemap,
    gt: RoaringTreemap,
}

impl Bsi {
    pub fn new() -> Self {
        Bsi::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ebm.is_empty()
    }

    /// Number of columns holding a value.
    pub fn len(&self) -> u64 {
        self.ebm.len()
    }

    pub fn bit_count(&self) -> usize {
        self.slices.len()
    }

    /// Existence bitmap.
    pub fn existence(&self) -> &RoaringTreemap {
        &self.ebm
    }

    pub fn set_value(&mut self, column: u64, value: i64) {
        if self.ebm.contains(column) {
            self.clear_bits(column);
        }

        let magnitude = value.unsigned_abs();
        let bits = (u64::BITS - magnitude.leading_zeros()) as usize;
        if self.slices.len() < bits {
            self.slices.resize_with(bits, RoaringTreemap::new);
        }

        for (i, slice) in self.slices.iter_mut().enumerate().take(bits) {
            if magnitude >> i & 1 == 1 {
                slice.insert(column);
            }
        }
        if value < 0 {
            self.sign.insert(column);
        }
        self.ebm.insert(column);
    }

    fn clear_bits(&mut self, column: u64) {
        self.sign.remove(column);
        for slice in &mut self.slices {
            slice.remove(column);
        }
    }

    pub fn get_value(&self, column: u64) -> Option<i64> {
        if !self.ebm.contains(column) {
            return None;
        }

        let magnitude = self
            .slices
            .iter()
            .enumerate()
            .filter(|(_, slice)| slice.contains(column))
            .fold(0u64, |acc, (i, _)| acc | 1 << i);

        if self.sign.contains(column) {
            Some((magnitude as i64).wrapping_neg())
        } else {
            Some(magnitude as i64)
        }
    }

    /// Candidate columns: `found ∩ ebm`, or every column when `found` is None.
    fn candidates(&self, found: Option<&RoaringTreemap>) -> RoaringTreemap {
        match found {
            Some(found) => found & &self.ebm,
            None => self.ebm.clone(),
        }
    }

    /// Partition `set` by magnitude against `magnitude`, walking slices from the top bit.
    fn split_magnitude(&self, set: RoaringTreemap, magnitude: u64) -> Split {
        let value_bits = (u64::BITS - magnitude.leading_zeros()) as usize;
        let bits = self.slices.len().max(value_bits);
        let empty = RoaringTreemap::new();

        let mut lt = RoaringTreemap::new();
        let mut gt = RoaringTreemap::new();
        let mut eq = set;

        for i in (0..bits).rev() {
            let slice = self.slices.get(i).unwrap_or(&empty);
            if magnitude >> i & 1 == 1 {
                lt |= &eq - slice;
                eq &= slice;
            } else {
                gt |= &eq & slice;
                eq -= slice;
            }
        }

        Split { lt, eq, gt }
    }

    fn split_signed(&self, value: i64, found: Option<&RoaringTreemap>) -> (RoaringTreemap, Split) {
        let base = self.candidates(found);
        let positive = &base - &self.sign;
        let negative = &base & &self.sign;
        let magnitude = value.unsigned_abs();

        let split = if value >= 0 {
            let Split { lt, eq, gt } = self.split_magnitude(positive, magnitude);
            Split { lt: lt | negative, eq, gt }
        } else {
            // Larger magnitude means smaller value on the negative side
            let Split { lt, eq, gt } = self.split_magnitude(negative, magnitude);
            Split { lt: gt, eq, gt: lt | positive }
        };

        (base, split)
    }

    /// Columns in `found` (or all columns) whose value satisfies `op value`.
    pub fn compare(&self, op: Operation, value: i64, found: Option<&RoaringTreemap>) -> RoaringTreemap {
        let (base, split) = self.split_signed(value, found);
        match op {
            Operation::Eq => split.eq,
            Operation::Neq => base - split.eq,
            Operation::Lt => split.lt,
            Operation::Le => split.lt | split.eq,
            Operation::Gt => split.gt,
            Operation::Ge => split.gt | split.eq,
        }
    }

    /// Columns whose value lies in `[start, end]`.
    pub fn compare_range(&self, start: i64, end: i64, found: Option<&RoaringTreemap>) -> RoaringTreemap {
        if start > end {
            return RoaringTreemap::new();
        }
        let at_least = self.compare(Operation::Ge, start, found);
        self.compare(Operation::Le, end, Some(&at_least))
    }

    /// Sum of values over `found` and the number of columns summed.
    pub fn sum(&self, found: Option<&RoaringTreemap>) -> Result<(i64, u64)> {
        let base = self.candidates(found);
        let positive = &base - &self.sign;
        let negative = &base & &self.sign;

        let mut total: i128 = 0;
        for (i, slice) in self.slices.iter().enumerate() {
            let weight = 1i128 << i;
            let pos = (slice & &positive).len() as i128;
            let neg = (slice & &negative).len() as i128;
            total += weight * (pos - neg);
        }

        let total = i64::try_from(total)
            .map_err(|_| Error::new(ErrorKind::InvalidState, "BSI sum overflows i64"))?;
        Ok((total, base.len()))
    }

    /// Distinct values over `found` with the number of columns holding each.
    pub fn transpose_with_counts(&self, found: Option<&RoaringTreemap>) -> BTreeMap<i64, u64> {
        let mut counts = BTreeMap::new();
        for column in self.candidates(found).iter() {
            if let Some(value) = self.get_value(column) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn distinct_count(&self, found: Option<&RoaringTreemap>) -> u64 {
        self.transpose_with_counts(found).len() as u64
    }

    /// Bitwise OR of every bitmap. Valid because each column's entry comes from one writer.
    pub fn union_with(&mut self, other: &Bsi) {
        self.ebm |= &other.ebm;
        self.sign |= &other.sign;
        if self.slices.len() < other.slices.len() {
            self.slices.resize_with(other.slices.len(), RoaringTreemap::new);
        }
        for (mine, theirs) in self.slices.iter_mut().zip(&other.slices) {
            *mine |= theirs;
        }
    }

    /// Union of many indexes, one rayon task per bitmap position.
    pub fn par_union(indexes: &[Bsi]) -> Bsi {
        let width = indexes.iter().map(|b| b.slices.len()).max().unwrap_or(0);

        let (ebm, sign) = rayon::join(
            || union_all(indexes.iter().map(|b| &b.ebm)),
            || union_all(indexes.iter().map(|b| &b.sign)),
        );
        let slices = (0..width)
            .into_par_iter()
            .map(|i| union_all(indexes.iter().filter_map(|b| b.slices.get(i))))
            .collect();

        Bsi { ebm, sign, slices }
    }

    // [ MAGIC "BSI1" ][ slice count u32 LE ]
    // [ len u64 LE | roaring ] x (2 + slice count): ebm, sign, slices...
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.slices.len() as u32).to_le_bytes());

        for bitmap in self.bitmaps() {
            out.extend_from_slice(&(bitmap.serialized_size() as u64).to_le_bytes());
            bitmap.serialize_into(&mut out)?;
        }
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Bsi> {
        if data.len() < 8 || &data[..4] != MAGIC {
            return Err(Error::corruption("not a bit-sliced index"));
        }
        let slice_count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if slice_count > MAX_SLICES {
            return Err(Error::corruption(format!("BSI has {} slices", slice_count)));
        }

        let mut pos = 8;
        let mut next = || -> Result<RoaringTreemap> {
            let header = data
                .get(pos..pos + 8)
                .ok_or_else(|| Error::corruption("BSI truncated"))?;
            let len = u64::from_le_bytes(header.try_into().map_err(|_| Error::corruption("BSI truncated"))?) as usize;
            pos += 8;
            let body = data
                .get(pos..pos + len)
                .ok_or_else(|| Error::corruption("BSI bitmap truncated"))?;
            pos += len;
            RoaringTreemap::deserialize_from(Cursor::new(body))
                .map_err(|e| Error::corruption(format!("BSI bitmap: {}", e)))
        };

        let ebm = next()?;
        let sign = next()?;
        let slices = (0..slice_count).map(|_| next()).collect::<Result<Vec<_>>>()?;
        Ok(Bsi { ebm, sign, slices })
    }

    fn bitmaps(&self) -> impl Iterator<Item = &RoaringTreemap> {
        [&self.ebm, &self.sign].into_iter().chain(self.slices.iter())
    }

    fn serialized_size(&self) -> usize {
        8 + self.bitmaps().map(|b| 8 + b.serialized_size()).sum::<usize>()
    }
}

fn union_all<'a>(bitmaps: impl Iterator<Item = &'a RoaringTreemap>) -> RoaringTreemap {
    bitmaps.fold(RoaringTreemap::new(), |mut acc, bitmap| {
        acc |= bitmap;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn bitmap(columns: &[u64]) -> RoaringTreemap {
        columns.iter().copied().collect()
    }

    fn sample() -> Bsi {
        let mut bsi = Bsi::new();
        for (column, value) in [(1, 5), (2, -3), (3, 0), (4, 5), (5, 12), (6, -20), (7, i64::MIN), (8, i64::MAX)] {
            bsi.set_value(column, value);
        }
        bsi
    }

    #[test]
    fn values_round_trip_through_slices() {
        let bsi = sample();
        assert_eq!(bsi.get_value(2), Some(-3));
        assert_eq!(bsi.get_value(3), Some(0));
        assert_eq!(bsi.get_value(7), Some(i64::MIN));
        assert_eq!(bsi.get_value(8), Some(i64::MAX));
        assert_eq!(bsi.get_value(99), None);
        assert_eq!(bsi.bit_count(), 64);
    }

    #[test]
    fn overwrite_replaces_old_bits() {
        let mut bsi = Bsi::new();
        bsi.set_value(1, -7);
        bsi.set_value(1, 2);
        assert_eq!(bsi.get_value(1), Some(2));
        assert_eq!(bsi.len(), 1);
    }

    #[test]
    fn compare_matches_scalar_semantics() {
        let bsi = sample();
        let values: Vec<(u64, i64)> = (1..=8).map(|c| (c, bsi.get_value(c).unwrap())).collect();

        for target in [-21, -20, -3, -1, 0, 5, 6, 12, 13] {
            for op in [Operation::Eq, Operation::Neq, Operation::Lt, Operation::Le, Operation::Gt, Operation::Ge] {
                let expected: RoaringTreemap = values
                    .iter()
                    .filter(|(_, v)| match op {
                        Operation::Eq => *v == target,
                        Operation::Neq => *v != target,
                        Operation::Lt => *v < target,
                        Operation::Le => *v <= target,
                        Operation::Gt => *v > target,
                        Operation::Ge => *v >= target,
                    })
                    .map(|(c, _)| *c)
                    .collect();
                assert_eq!(bsi.compare(op, target, None), expected, "{:?} {}", op, target);
            }
        }
    }

    #[test]
    fn compare_respects_found_set() {
        let bsi = sample();
        let found = bitmap(&[1, 2, 3, 100]);
        assert_eq!(bsi.compare(Operation::Eq, 5, Some(&found)), bitmap(&[1]));
        assert_eq!(bsi.compare(Operation::Neq, 5, Some(&found)), bitmap(&[2, 3]));
        assert_eq!(bsi.compare_range(-3, 0, Some(&found)), bitmap(&[2, 3]));
        assert!(bsi.compare_range(5, 1, None).is_empty());
    }

    #[test]
    fn sum_counts_signed_values() {
        let mut bsi = Bsi::new();
        bsi.set_value(1, 1);
        bsi.set_value(2, -1);
        bsi.set_value(3, 1);
        assert_eq!(bsi.sum(None).unwrap(), (1, 3));
        assert_eq!(bsi.sum(Some(&bitmap(&[1, 3]))).unwrap(), (2, 2));
    }

    #[test]
    fn sum_overflow_is_an_error() {
        let mut bsi = Bsi::new();
        bsi.set_value(1, i64::MAX);
        bsi.set_value(2, i64::MAX);
        assert_eq!(bsi.sum(None).unwrap_err().kind, ErrorKind::InvalidState);
    }

    #[test]
    fn transpose_deduplicates_by_value() {
        let mut bsi = Bsi::new();
        bsi.set_value(1, 1);
        bsi.set_value(2, 1);
        bsi.set_value(3, 2);
        let counts = bsi.transpose_with_counts(None);
        assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![(1, 2), (2, 1)]);
        assert_eq!(bsi.distinct_count(Some(&bitmap(&[1, 2]))), 1);
    }

    #[test]
    fn serialization_preserves_every_bitmap() {
        let bsi = sample();
        let restored = Bsi::deserialize(&bsi.serialize().unwrap()).unwrap();
        assert_eq!(restored, bsi);
        assert!(Bsi::deserialize(b"nope").is_err());
        assert!(Bsi::deserialize(&bsi.serialize().unwrap()[..20]).is_err());
    }

    #[test]
    fn union_is_order_independent() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reference = Bsi::new();
        let mut entries = Vec::new();
        for column in 0..500u64 {
            let value = rng.gen_range(-1000..1000);
            reference.set_value(column, value);
            entries.push((column, value));
        }

        for k in [1usize, 2, 5, 13] {
            let mut parts = vec![Bsi::new(); k];
            for (column, value) in &entries {
                parts[rng.gen_range(0..k)].set_value(*column, *value);
            }
            parts.shuffle(&mut rng);

            let mut sequential = Bsi::new();
            for part in parts.iter().rev() {
                sequential.union_with(part);
            }
            let parallel = Bsi::par_union(&parts);

            for column in 0..500u64 {
                assert_eq!(sequential.get_value(column), reference.get_value(column));
                assert_eq!(parallel.get_value(column), reference.get_value(column));
            }
            assert_eq!(sequential.existence(), reference.existence());
        }
    }
}
