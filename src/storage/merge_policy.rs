use std::ops::Range;

/// What a merge policy needs to know about one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub level: u32,
}

/// Policy for deciding when and which tables to merge.
///
/// Tables are passed oldest first. A selection must be a contiguous run so
/// that operands keep their relative order when folded.
pub trait MergePolicy: Send + Sync {
    fn select(&self, tables: &[TableInfo]) -> Option<Range<usize>>;
}

/// Merges the newest `tables_per_level` tables once they all sit on the same level.
///
/// Flushes land on level 0 and every merge lifts its output one level, so the
/// table list behaves like a counter in base `tables_per_level` and each entry
/// is rewritten about once per level.
#[derive(Debug, Clone, Copy)]
pub struct TieredMergePolicy {
    pub tables_per_level: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy { tables_per_level: 4 }
    }
}

impl MergePolicy for TieredMergePolicy {
    fn select(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        let width = self.tables_per_level.max(2);
        if tables.len() < width {
            return None;
        }

        let start = tables.len() - width;
        let level = tables[start].level;
        tables[start..]
            .iter()
            .all(|table| table.level == level)
            .then_some(start..tables.len())
    }
}
