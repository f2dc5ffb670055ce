use std::collections::BTreeMap;
use std::fs;
use std::iter::Peekable;
use std::ops::{Bound, Range};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use crate::core::error::Result;
#[cfg(test)]
use crate::core::error::{Error, ErrorKind};
use crate::core::stats::KvStats;
use crate::merge::{fold_backward, fold_forward, MergeOperator};
use crate::mvcc::controller::MVCCController;
use crate::storage::checkpoint::Checkpoint;
use crate::storage::file_lock::FileLock;
use crate::storage::keys;
use crate::storage::layout::StorageLayout;
use crate::storage::merge_policy::{MergePolicy, TableInfo, TieredMergePolicy};
use crate::storage::table::{self, Op, OpKind, TableIter, TableReader, TableWriter};
use crate::storage::wal::{Operation, SyncMode, WAL};

/// Resolved key/value pairs, sorted by key.
pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

/// Ordered set of operations applied atomically at a single version.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    operations: Vec<Operation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Put { key, value });
    }

    pub fn merge(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Merge { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.operations.push(Operation::Delete { key });
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KvOptions {
    pub sync_mode: SyncMode,
    /// WAL growth that triggers an automatic checkpoint.
    pub checkpoint_bytes: u64,
    /// Tables of one level merged together once this many have piled up.
    pub tables_per_level: usize,
}

impl Default for KvOptions {
    fn default() -> Self {
        KvOptions {
            sync_mode: SyncMode::Immediate,
            checkpoint_bytes: 64 * 1024 * 1024,
            tables_per_level: 4,
        }
    }
}

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    op: Op,
}

// Per key, operations in ascending version order
type MemTable = BTreeMap<Vec<u8>, Vec<Versioned>>;

type Tables = Arc<Vec<Arc<TableReader>>>;

/// Memtable and tables change together, so a reader never finds a key in neither.
struct Tree {
    memtable: MemTable,
    tables: Tables, // Oldest first
}

struct KvInner {
    layout: StorageLayout,
    options: KvOptions,
    tree: RwLock<Tree>,
    wal: Mutex<WAL>,
    mvcc: MVCCController,
    operator: Arc<dyn MergeOperator>,
    policy: Box<dyn MergePolicy>,
    next_table: AtomicU64,
    flushed: AtomicU64,      // Every operation at or below this version lives in a table
    carried: AtomicU64,      // WAL bytes copied forward by the last checkpoint
    #[cfg(test)]
    fail_next_apply: AtomicBool,
    _lock: FileLock,
}

/// Ordered, versioned key/value store with merge operands and a write-ahead log.
///
/// Recent writes live in a versioned memtable backed by the WAL. A checkpoint
/// moves every operation no reader can still tell apart into a new immutable
/// table and drops it from memory. Tables are merged in tiers and read through
/// a memory map.
#[derive(Clone)]
pub struct Kv {
    inner: Arc<KvInner>,
}

impl Kv {
    pub fn open(path: impl Into<PathBuf>, options: KvOptions, operator: Arc<dyn MergeOperator>) -> Result<Self> {
        let layout = StorageLayout::new(path.into())?;
        let lock = FileLock::acquire(&layout)?;

        let checkpoint = Checkpoint::load(&layout)?;
        let (base_version, flushed, wal_start, table_ids) = match &checkpoint {
            Some(cp) => (cp.version, cp.flushed, cp.wal_sequence, cp.tables.clone()),
            None => (0, 0, 1, Vec::new()),
        };

        let mut tables = Vec::with_capacity(table_ids.len());
        for id in table_ids {
            let table = TableReader::open(&layout, id)?;
            debug!(table = id, level = table.level(), entries = table.header.entry_count, "opened table");
            tables.push(Arc::new(table));
        }

        let wal_files: Vec<u64> = WAL::find_wal_files(&layout)?
            .into_iter()
            .filter(|seq| *seq >= wal_start)
            .collect();

        let mut memtable = MemTable::new();
        let mut last = flushed;
        let mut replayed = 0usize;
        for seq in &wal_files {
            let mut wal = WAL::open(&layout, *seq, options.sync_mode)?;
            let replay = wal.read_entries()?;
            if replay.torn_tail {
                warn!(wal = seq, intact = replay.entries.len(), "discarded torn WAL tail");
            }
            for entry in replay.entries {
                // A checkpoint cut short after copying batches forward leaves them twice
                if entry.version <= last {
                    continue;
                }
                last = entry.version;
                apply_operations(&mut memtable, entry.version, entry.operations);
                replayed += 1;
            }
        }
        let recovered = base_version.max(last);

        let active = wal_files.last().copied().unwrap_or(wal_start);
        let wal = WAL::open(&layout, active, options.sync_mode)?;
        let next_table = table::find_tables(&layout)?.last().map_or(1, |id| id + 1);

        let kv = Kv {
            inner: Arc::new(KvInner {
                layout,
                options,
                tree: RwLock::new(Tree { memtable, tables: Arc::new(tables) }),
                wal: Mutex::new(wal),
                mvcc: MVCCController::new(recovered),
                operator,
                policy: Box::new(TieredMergePolicy { tables_per_level: options.tables_per_level }),
                next_table: AtomicU64::new(next_table),
                flushed: AtomicU64::new(flushed),
                carried: AtomicU64::new(0),
                #[cfg(test)]
                fail_next_apply: AtomicBool::new(false),
                _lock: lock,
            }),
        };
        kv.remove_stale_files(checkpoint.as_ref())?;

        info!(
            path = %kv.inner.layout.base_dir.display(),
            version = recovered,
            tables = kv.inner.tree.read().tables.len(),
            replayed,
            merge_operator = kv.inner.operator.name(),
            "opened kv store"
        );
        Ok(kv)
    }

    /// Applies every operation of `batch` at one new version. Returns that version.
    pub fn apply(&self, batch: WriteBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(self.inner.mvcc.current_version());
        }
        #[cfg(test)]
        if self.inner.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Io, "injected apply failure"));
        }

        // Holding the WAL lock keeps versions published in order
        let mut wal = self.inner.wal.lock();
        let version = self.inner.mvcc.next_version();
        wal.append(version, &batch.operations)?;

        {
            let mut tree = self.inner.tree.write();
            apply_operations(&mut tree.memtable, version, batch.operations);
        }
        self.inner.mvcc.publish(version);

        let grown = wal.position.saturating_sub(self.inner.carried.load(Ordering::Relaxed));
        if grown >= self.inner.options.checkpoint_bytes {
            debug!(wal_bytes = wal.position, "WAL over threshold, checkpointing");
            // The batch is already durable; a failed checkpoint is retried on the next apply
            if let Err(e) = self.checkpoint_locked(&mut wal, None) {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }
        Ok(version)
    }

    /// Consistent read view at the latest published version.
    pub fn snapshot(&self) -> Snapshot {
        let version = self.inner.mvcc.pin();
        Snapshot { inner: self.inner.clone(), version }
    }

    /// Checkpoints, then merges every table holding keys in `[start, end)` into one,
    /// folding each key's operands newest to oldest.
    pub fn compact_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        let mut wal = self.inner.wal.lock();
        self.checkpoint_locked(&mut wal, Some((start, end)))
    }

    /// Moves settled history from memory into a new table and starts a fresh WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let mut wal = self.inner.wal.lock();
        self.checkpoint_locked(&mut wal, None)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.wal.lock().sync()
    }

    pub fn stats(&self) -> KvStats {
        let wal_bytes = self.inner.wal.lock().position;
        let tree = self.inner.tree.read();
        KvStats {
            version: self.inner.mvcc.current_version(),
            keys: tree.memtable.len(),
            operations: tree.memtable.values().map(|chain| chain.len()).sum(),
            tables: tree.tables.len(),
            table_bytes: tree.tables.iter().map(|table| table.size()).sum(),
            wal_bytes,
            active_readers: self.inner.mvcc.active_readers(),
        }
    }

    /// Makes the next non-empty `apply` fail before anything is logged.
    #[cfg(test)]
    pub(crate) fn fail_next_apply(&self) {
        self.inner.fail_next_apply.store(true, Ordering::SeqCst);
    }

    fn checkpoint_locked(&self, wal: &mut WAL, compact: Option<(&[u8], Option<&[u8]>)>) -> Result<()> {
        let horizon = self.inner.mvcc.oldest_pinned();
        let version = self.inner.mvcc.current_version();

        let flushed_keys = self.flush(horizon)?;
        let flushed = self.inner.flushed.fetch_max(horizon, Ordering::SeqCst).max(horizon);

        if let Some((start, end)) = compact {
            self.compact_tables(start, end)?;
        }
        loop {
            let levels: Vec<TableInfo> = self
                .inner
                .tree
                .read()
                .tables
                .iter()
                .map(|table| TableInfo { level: table.level() })
                .collect();
            let Some(run) = self.inner.policy.select(&levels) else {
                break;
            };
            self.merge_run(run)?;
        }

        let carried = self.carry_forward(wal)?;
        let checkpoint = Checkpoint {
            version,
            flushed,
            tables: self.inner.tree.read().tables.iter().map(|table| table.id()).collect(),
            wal_sequence: wal.sequence,
            timestamp: Utc::now(),
        };
        checkpoint.save(&self.inner.layout)?;
        self.inner.carried.store(carried, Ordering::Relaxed);
        self.remove_stale_files(Some(&checkpoint))?;

        info!(
            version,
            flushed,
            keys = flushed_keys,
            tables = checkpoint.tables.len(),
            carried_bytes = carried,
            "checkpoint written"
        );
        Ok(())
    }

    /// Writes operations at or below `horizon` to a level-0 table and drops them from the memtable.
    fn flush(&self, horizon: u64) -> Result<usize> {
        let (settled, bottom) = {
            let tree = self.inner.tree.read();
            let settled: Vec<(Vec<u8>, Vec<Op>)> = tree
                .memtable
                .iter()
                .filter_map(|(key, chain)| {
                    let ops: Vec<Op> = chain
                        .iter()
                        .take_while(|v| v.version <= horizon)
                        .map(|v| v.op.clone())
                        .collect();
                    (!ops.is_empty()).then(|| (key.clone(), ops))
                })
                .collect();
            (settled, tree.tables.is_empty())
        };
        if settled.is_empty() {
            return Ok(0);
        }

        let operator = self.inner.operator.as_ref();
        let id = self.inner.next_table.fetch_add(1, Ordering::SeqCst);
        let mut writer = TableWriter::create(&self.inner.layout, id, 0, horizon)?;
        for (key, ops) in &settled {
            if let Some(op) = squash(operator, key, ops, bottom)? {
                writer.add(key, &op)?;
            }
        }
        let table = self.finish_table(writer)?;

        let mut guard = self.inner.tree.write();
        let tree = &mut *guard;
        for (key, ops) in &settled {
            let emptied = match tree.memtable.get_mut(key) {
                Some(chain) => {
                    chain.drain(..ops.len());
                    chain.is_empty()
                }
                None => false,
            };
            if emptied {
                tree.memtable.remove(key);
            }
        }
        if let Some(table) = table {
            let mut tables = tree.tables.as_ref().clone();
            tables.push(table);
            tree.tables = Arc::new(tables);
        }

        debug!(horizon, keys = settled.len(), table = id, "flushed memtable");
        Ok(settled.len())
    }

    fn compact_tables(&self, start: &[u8], end: Option<&[u8]>) -> Result<()> {
        let tables = self.inner.tree.read().tables.clone();
        let first = tables.iter().position(|table| table.overlaps(start, end));
        let last = tables.iter().rposition(|table| table.overlaps(start, end));
        match (first, last) {
            (Some(first), Some(last)) if last > first => self.merge_run(first..last + 1),
            _ => Ok(()),
        }
    }

    /// Replaces the contiguous `run` of tables with one table holding a single operation per key.
    fn merge_run(&self, run: Range<usize>) -> Result<()> {
        let tables = self.inner.tree.read().tables.clone();
        let sources = &tables[run.clone()];
        let bottom = run.start == 0;
        let level = sources.iter().map(|table| table.level()).max().unwrap_or(0) + 1;
        let version = sources.iter().map(|table| table.header.version).max().unwrap_or(0);

        let operator = self.inner.operator.as_ref();
        let id = self.inner.next_table.fetch_add(1, Ordering::SeqCst);
        let mut writer = TableWriter::create(&self.inner.layout, id, level, version)?;
        let mut cursors: Vec<Peekable<TableIter<'_>>> = sources.iter().map(|table| table.iter().peekable()).collect();

        loop {
            let mut next: Option<Vec<u8>> = None;
            for cursor in cursors.iter_mut() {
                if matches!(cursor.peek(), Some(Err(_))) {
                    if let Some(Err(e)) = cursor.next() {
                        return Err(e);
                    }
                }
                if let Some(Ok((key, _))) = cursor.peek() {
                    if next.as_ref().is_none_or(|next| key < next) {
                        next = Some(key.clone());
                    }
                }
            }
            let Some(key) = next else {
                break;
            };

            // Cursors are oldest first, so ops come out in age order
            let mut ops = Vec::with_capacity(cursors.len());
            for cursor in cursors.iter_mut() {
                if matches!(cursor.peek(), Some(Ok((k, _))) if *k == key) {
                    if let Some(Ok((_, op))) = cursor.next() {
                        ops.push(op);
                    }
                }
            }
            if let Some(op) = squash(operator, &key, &ops, bottom)? {
                writer.add(&key, &op)?;
            }
        }
        let merged = self.finish_table(writer)?;

        let mut tree = self.inner.tree.write();
        let mut replaced = Vec::with_capacity(tree.tables.len() + 1 - run.len());
        replaced.extend_from_slice(&tree.tables[..run.start]);
        replaced.extend(merged);
        replaced.extend_from_slice(&tree.tables[run.end..]);
        tree.tables = Arc::new(replaced);

        debug!(sources = run.len(), level, table = id, "merged tables");
        Ok(())
    }

    fn finish_table(&self, writer: TableWriter) -> Result<Option<Arc<TableReader>>> {
        let empty = writer.entry_count() == 0;
        let header = writer.finish()?;
        if empty {
            fs::remove_file(self.inner.layout.table_path(header.id))?;
            return Ok(None);
        }
        Ok(Some(Arc::new(TableReader::open(&self.inner.layout, header.id)?)))
    }

    /// Starts a new WAL file holding whatever the memtable still retains. Returns its size.
    fn carry_forward(&self, wal: &mut WAL) -> Result<u64> {
        let retained: BTreeMap<u64, Vec<Operation>> = {
            let tree = self.inner.tree.read();
            let mut by_version: BTreeMap<u64, Vec<Operation>> = BTreeMap::new();
            for (key, chain) in &tree.memtable {
                for entry in chain {
                    by_version.entry(entry.version).or_default().push(to_operation(key, &entry.op));
                }
            }
            by_version
        };

        wal.rotate(&self.inner.layout, wal.sequence + 1)?;
        for (version, operations) in &retained {
            wal.append(*version, operations)?;
        }
        wal.sync()?;
        Ok(wal.position)
    }

    fn remove_stale_files(&self, checkpoint: Option<&Checkpoint>) -> Result<()> {
        let layout = &self.inner.layout;
        let (wal_sequence, tables) = match checkpoint {
            Some(cp) => (cp.wal_sequence, cp.tables.as_slice()),
            None => (1, &[][..]),
        };

        for seq in WAL::find_wal_files(layout)? {
            if seq < wal_sequence {
                fs::remove_file(layout.wal_path(seq))?;
            }
        }
        // Open readers keep their mappings of removed tables
        for id in table::find_tables(layout)? {
            if !tables.contains(&id) {
                fs::remove_file(layout.table_path(id))?;
            }
        }
        Ok(())
    }
}

fn apply_operations(memtable: &mut MemTable, version: u64, operations: Vec<Operation>) {
    for operation in operations {
        let (key, op) = match operation {
            Operation::Put { key, value } => (key, Op::Put(Bytes::from(value))),
            Operation::Merge { key, value } => (key, Op::Merge(Bytes::from(value))),
            Operation::Delete { key } => (key, Op::Delete),
        };
        memtable.entry(key).or_default().push(Versioned { version, op });
    }
}

fn to_operation(key: &[u8], op: &Op) -> Operation {
    let key = key.to_vec();
    match op {
        Op::Put(value) => Operation::Put { key, value: value.to_vec() },
        Op::Merge(value) => Operation::Merge { key, value: value.to_vec() },
        Op::Delete => Operation::Delete { key },
    }
}

/// Value of a key given its operations oldest first: the last put or delete, then every merge after it.
fn resolve(operator: &dyn MergeOperator, key: &[u8], ops: &[Op]) -> Result<Option<Vec<u8>>> {
    let mut operands: Vec<&[u8]> = Vec::new();
    for op in ops {
        match op {
            Op::Put(value) => {
                operands.clear();
                operands.push(value);
            }
            Op::Delete => operands.clear(),
            Op::Merge(value) => operands.push(value),
        }
    }

    match operands.len() {
        0 => Ok(None),
        1 => Ok(Some(operands[0].to_vec())),
        _ => fold_forward(operator, key, &operands),
    }
}

/// One operation with the same effect as `ops` (oldest first) on anything older.
///
/// On the bottom table nothing is older: a delete disappears and merges become a put.
fn squash(operator: &dyn MergeOperator, key: &[u8], ops: &[Op], bottom: bool) -> Result<Option<Op>> {
    let base = ops.iter().rposition(|op| op.kind() != OpKind::Merge);
    let (head, tail) = match base {
        Some(index) => (Some(&ops[index]), &ops[index + 1..]),
        None => (None, ops),
    };

    let mut operands: Vec<&Bytes> = Vec::with_capacity(tail.len() + 1);
    if let Some(Op::Put(value)) = head {
        operands.push(value);
    }
    operands.extend(tail.iter().filter_map(|op| op.value()));

    let folded = match operands.as_slice() {
        [] => None,
        [single] => Some((*single).clone()),
        _ => {
            let slices: Vec<&[u8]> = operands.iter().map(|value| value.as_ref()).collect();
            fold_backward(operator, key, &slices)?.map(Bytes::from)
        }
    };

    Ok(match (head, folded) {
        (_, Some(value)) if head.is_some() || bottom => Some(Op::Put(value)),
        (_, Some(value)) => Some(Op::Merge(value)),
        (Some(_), None) if !bottom => Some(Op::Delete),
        _ => None,
    })
}

/// Read view pinned at one version. The pin is released on drop.
///
/// Reads copy what they need out of the memtable under its lock and do all
/// table access and merging after releasing it.
pub struct Snapshot {
    inner: Arc<KvInner>,
    version: u64,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (tables, recent) = self.point_sources(key);

        let mut ops = Vec::new();
        if !recent.iter().any(|op| op.kind() != OpKind::Merge) {
            for table in tables.iter().rev() {
                if let Some(op) = table.get(key)? {
                    let base = op.kind() != OpKind::Merge;
                    ops.push(op);
                    if base {
                        break;
                    }
                }
            }
            ops.reverse();
        }
        ops.extend(recent);

        resolve(self.inner.operator.as_ref(), key, &ops)
    }

    /// Newest visible put or merge operand of `key`, unresolved. `None` when absent or deleted.
    pub fn latest_operand(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (tables, recent) = self.point_sources(key);
        let newest = match recent.last() {
            Some(op) => Some(op.clone()),
            None => {
                let mut found = None;
                for table in tables.iter().rev() {
                    if let Some(op) = table.get(key)? {
                        found = Some(op);
                        break;
                    }
                }
                found
            }
        };
        Ok(newest.and_then(|op| op.value().cloned()))
    }

    /// Resolved pairs with keys in `[start, end)`, in key order. `None` means unbounded.
    pub fn scan_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Entries> {
        let (tables, recent) = self.range_sources(start, end);

        let mut chains: BTreeMap<Vec<u8>, Vec<Op>> = BTreeMap::new();
        for table in tables.iter() {
            for (key, op) in table.scan(start, end)? {
                chains.entry(key).or_default().push(op);
            }
        }
        for (key, ops) in recent {
            chains.entry(key).or_default().extend(ops);
        }

        let operator = self.inner.operator.as_ref();
        let mut entries = Vec::with_capacity(chains.len());
        for (key, ops) in chains {
            if let Some(value) = resolve(operator, &key, &ops)? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Entries> {
        let end = keys::prefix_end(prefix);
        self.scan_range(prefix, end.as_deref())
    }

    /// Keys with a live value in `[start, end)`, without reading values or resolving merges.
    pub fn keys_in_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<Vec<u8>>> {
        let (tables, recent) = self.range_sources(start, end);

        let mut live: BTreeMap<Vec<u8>, bool> = BTreeMap::new();
        for table in tables.iter() {
            for (key, kind) in table.scan_kinds(start, end)? {
                live.insert(key, kind != OpKind::Delete);
            }
        }
        for (key, ops) in recent {
            if let Some(op) = ops.last() {
                live.insert(key, op.kind() != OpKind::Delete);
            }
        }
        Ok(live.into_iter().filter_map(|(key, live)| live.then_some(key)).collect())
    }

    fn point_sources(&self, key: &[u8]) -> (Tables, Vec<Op>) {
        let tree = self.inner.tree.read();
        let recent = tree
            .memtable
            .get(key)
            .map(|chain| visible(chain, self.version))
            .unwrap_or_default();
        (tree.tables.clone(), recent)
    }

    fn range_sources(&self, start: &[u8], end: Option<&[u8]>) -> (Tables, Vec<(Vec<u8>, Vec<Op>)>) {
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        let tree = self.inner.tree.read();
        let recent = tree
            .memtable
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(key, chain)| (key.clone(), visible(chain, self.version)))
            .filter(|(_, ops)| !ops.is_empty())
            .collect();
        (tree.tables.clone(), recent)
    }
}

fn visible(chain: &[Versioned], version: u64) -> Vec<Op> {
    chain
        .iter()
        .take_while(|v| v.version <= version)
        .map(|v| v.op.clone())
        .collect()
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.mvcc.release(self.version);
    }
}
