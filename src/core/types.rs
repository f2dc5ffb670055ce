use serde::{Serialize, Deserialize};

/// Global row sequence number. Never reused.
pub type Seq = u64;

/// Shard a sequence number falls into.
pub fn shard_of(seq: Seq, shard_width: u64) -> u64 {
    seq / shard_width
}

/// Running `[min, max]` of logical timestamps seen by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min: u64,
    pub max: u64,
}

impl TimeRange {
    pub fn new(ts: u64) -> Self {
        TimeRange { min: ts, max: ts }
    }

    pub fn widen(&mut self, ts: u64) {
        self.min = self.min.min(ts);
        self.max = self.max.max(ts);
    }

    /// Both bounds inclusive.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.min <= end && self.max >= start
    }
}
