use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::layout::StorageLayout;
use crate::storage::mmap_file::MmapFile;

const BLOCK_BYTES: usize = 64 * 1024;
/// Values at least this long are stored beside their block, not inside it.
const EXTERNAL_VALUE_BYTES: usize = 4 * 1024;
const FOOTER_LEN: usize = 16; // index len u64 + index crc32 u32 + magic u32
const MAGIC: u32 = 0x5441_4c59;
const CACHED_BLOCKS: usize = 64;

/// One operation on a key, as held by the memtable and by tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(Bytes),
    Merge(Bytes),
    Delete,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Put(_) => OpKind::Put,
            Op::Merge(_) => OpKind::Merge,
            Op::Delete => OpKind::Delete,
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Op::Put(value) | Op::Merge(value) => Some(value),
            Op::Delete => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Merge,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Stored {
    Inline(Vec<u8>),
    /// An lz4 frame elsewhere in the file.
    External { offset: u64, len: u64, checksum: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockEntry {
    key: Vec<u8>,
    kind: OpKind,
    value: Stored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockHandle {
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    offset: u64,
    len: u64,
    checksum: u32,
}

/// Table file header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHeader {
    pub format: u32,       // Format version
    pub id: u64,
    pub level: u32,        // Merge tier; flushed memtables start at 0
    pub version: u64,      // Highest KV version folded into the table
    pub entry_count: u64,
}

impl TableHeader {
    pub const FORMAT: u32 = 2;
}

#[derive(Serialize, Deserialize)]
struct TableIndex {
    header: TableHeader,
    blocks: Vec<BlockHandle>,
}

// [ BLOCK | EXTERNAL VALUE ]*   lz4 frames, each covered by a crc32 in its handle
// [ INDEX (bincode) ]           header plus one handle per block
// [ INDEX LEN u64 ][ INDEX CRC u32 ][ MAGIC u32 ]
/// Streams key-ordered operations into a new table file.
pub struct TableWriter {
    path: PathBuf,
    tmp: PathBuf,
    out: BufWriter<File>,
    position: u64,
    header: TableHeader,
    block: Vec<BlockEntry>,
    block_bytes: usize,
    blocks: Vec<BlockHandle>,
    last_key: Option<Vec<u8>>,
}

impl TableWriter {
    pub fn create(storage: &StorageLayout, id: u64, level: u32, version: u64) -> Result<Self> {
        let path = storage.table_path(id);
        let tmp = path.with_extension("tmp");
        let out = BufWriter::new(File::create(&tmp)?);

        Ok(TableWriter {
            path,
            tmp,
            out,
            position: 0,
            header: TableHeader {
                format: TableHeader::FORMAT,
                id,
                level,
                version,
                entry_count: 0,
            },
            block: Vec::new(),
            block_bytes: 0,
            blocks: Vec::new(),
            last_key: None,
        })
    }

    /// Adds `op` under `key`. Keys must strictly ascend.
    pub fn add(&mut self, key: &[u8], op: &Op) -> Result<()> {
        if self.last_key.as_deref().is_some_and(|last| last >= key) {
            return Err(Error::new(ErrorKind::InvalidArgument, "table keys must be added in ascending order"));
        }

        let value = match op.value() {
            Some(value) if value.len() >= EXTERNAL_VALUE_BYTES => self.write_external(value)?,
            Some(value) => Stored::Inline(value.to_vec()),
            None => Stored::Inline(Vec::new()),
        };
        let inline_len = match &value {
            Stored::Inline(value) => value.len(),
            Stored::External { .. } => 0,
        };

        self.block_bytes += key.len() + inline_len + 24;
        self.block.push(BlockEntry { key: key.to_vec(), kind: op.kind(), value });
        self.last_key = Some(key.to_vec());
        self.header.entry_count += 1;

        if self.block_bytes >= BLOCK_BYTES {
            self.finish_block()?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    /// Writes the index and footer, syncs, and renames the file into place.
    pub fn finish(mut self) -> Result<TableHeader> {
        self.finish_block()?;

        let index = TableIndex {
            header: self.header.clone(),
            blocks: std::mem::take(&mut self.blocks),
        };
        let data = bincode::serialize(&index)?;
        let checksum = crc32fast::hash(&data);
        self.write(&data)?;

        let mut footer = [0u8; FOOTER_LEN];
        footer[..8].copy_from_slice(&(data.len() as u64).to_le_bytes());
        footer[8..12].copy_from_slice(&checksum.to_le_bytes());
        footer[12..].copy_from_slice(&MAGIC.to_le_bytes());
        self.write(&footer)?;

        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(&self.tmp, &self.path)?;
        Ok(index.header)
    }

    fn write_external(&mut self, value: &[u8]) -> Result<Stored> {
        let payload = lz4_flex::compress_prepend_size(value);
        let stored = Stored::External {
            offset: self.position,
            len: payload.len() as u64,
            checksum: crc32fast::hash(&payload),
        };
        self.write(&payload)?;
        Ok(stored)
    }

    fn finish_block(&mut self) -> Result<()> {
        let (Some(first), Some(last)) = (self.block.first(), self.block.last()) else {
            return Ok(());
        };
        let (first_key, last_key) = (first.key.clone(), last.key.clone());

        let raw = bincode::serialize(&self.block)?;
        let payload = lz4_flex::compress_prepend_size(&raw);
        let handle = BlockHandle {
            first_key,
            last_key,
            offset: self.position,
            len: payload.len() as u64,
            checksum: crc32fast::hash(&payload),
        };
        self.write(&payload)?;

        self.blocks.push(handle);
        self.block.clear();
        self.block_bytes = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }
}

/// Read side of one table file.
///
/// Only the block index is held in memory. Blocks and external values are read
/// from the memory map on demand, and recently used blocks stay in an LRU cache.
pub struct TableReader {
    pub header: TableHeader,
    blocks: Vec<BlockHandle>,
    file: MmapFile,
    cache: Mutex<LruCache<usize, Arc<Vec<BlockEntry>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl TableReader {
    pub fn open(storage: &StorageLayout, id: u64) -> Result<Self> {
        let file = MmapFile::open_read_only(storage.table_path(id))?;
        if file.len() < FOOTER_LEN {
            return Err(Error::corruption(format!("table {} truncated", id)));
        }

        let footer_start = (file.len() - FOOTER_LEN) as u64;
        let footer = file.slice(footer_start, FOOTER_LEN as u64)?;
        let index_len = read_u64(&footer[..8]);
        let checksum = read_u32(&footer[8..12]);
        if read_u32(&footer[12..]) != MAGIC {
            return Err(Error::corruption(format!("table {} has no valid footer", id)));
        }

        let index_start = footer_start
            .checked_sub(index_len)
            .ok_or_else(|| Error::corruption(format!("table {} index length out of range", id)))?;
        let data = file.slice(index_start, index_len)?;
        if crc32fast::hash(data) != checksum {
            return Err(Error::corruption(format!("table {} index checksum mismatch", id)));
        }

        let index: TableIndex = bincode::deserialize(data)?;
        if index.header.format != TableHeader::FORMAT {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("incompatible table format {}", index.header.format),
            ));
        }
        if index.header.id != id {
            return Err(Error::corruption(format!("table file {} claims id {}", id, index.header.id)));
        }

        Ok(TableReader {
            header: index.header,
            blocks: index.blocks,
            file,
            cache: Mutex::new(LruCache::new(NonZeroUsize::MIN.saturating_add(CACHED_BLOCKS - 1))),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn level(&self) -> u32 {
        self.header.level
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.file.len() as u64
    }

    /// `(hits, misses)` of the block cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache_hits.load(Ordering::Relaxed), self.cache_misses.load(Ordering::Relaxed))
    }

    /// Whether any key of this table can fall in `[start, end)`.
    pub fn overlaps(&self, start: &[u8], end: Option<&[u8]>) -> bool {
        match (self.blocks.first(), self.blocks.last()) {
            (Some(first), Some(last)) => {
                last.last_key.as_slice() >= start && end.is_none_or(|end| first.first_key.as_slice() < end)
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Op>> {
        let index = self.blocks.partition_point(|block| block.last_key.as_slice() < key);
        match self.blocks.get(index) {
            Some(handle) if handle.first_key.as_slice() <= key => {}
            _ => return Ok(None),
        }

        let block = self.cached_block(index)?;
        match block.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(pos) => self.load(&block[pos]).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Operations with keys in `[start, end)`, in key order. `None` means unbounded.
    pub fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Op)>> {
        let mut found = Vec::new();
        for block in self.blocks_in(start, end)? {
            for entry in block.iter().filter(|entry| in_range(&entry.key, start, end)) {
                found.push((entry.key.clone(), self.load(entry)?));
            }
        }
        Ok(found)
    }

    /// Like [`TableReader::scan`], but leaves values on disk.
    pub fn scan_kinds(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, OpKind)>> {
        let mut found = Vec::new();
        for block in self.blocks_in(start, end)? {
            for entry in block.iter().filter(|entry| in_range(&entry.key, start, end)) {
                found.push((entry.key.clone(), entry.kind));
            }
        }
        Ok(found)
    }

    /// Every operation in key order. Blocks are read past the cache.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            table: self,
            block: 0,
            entries: Vec::new().into_iter(),
        }
    }

    fn blocks_in(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<Arc<Vec<BlockEntry>>>> {
        let first = self.blocks.partition_point(|block| block.last_key.as_slice() < start);
        let mut blocks = Vec::new();
        for (index, handle) in self.blocks.iter().enumerate().skip(first) {
            if end.is_some_and(|end| handle.first_key.as_slice() >= end) {
                break;
            }
            blocks.push(self.cached_block(index)?);
        }
        Ok(blocks)
    }

    fn cached_block(&self, index: usize) -> Result<Arc<Vec<BlockEntry>>> {
        if let Some(block) = self.cache.lock().get(&index) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let block = Arc::new(self.read_block(index)?);
        self.cache.lock().put(index, block.clone());
        Ok(block)
    }

    fn read_block(&self, index: usize) -> Result<Vec<BlockEntry>> {
        let handle = self
            .blocks
            .get(index)
            .ok_or_else(|| Error::corruption(format!("table {} has no block {}", self.id(), index)))?;
        let payload = self.file.slice(handle.offset, handle.len)?;
        if crc32fast::hash(payload) != handle.checksum {
            return Err(Error::corruption(format!("table {} block {} checksum mismatch", self.id(), index)));
        }
        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::corruption(format!("table {} block {}: {}", self.id(), index, e)))?;
        Ok(bincode::deserialize(&raw)?)
    }

    fn load(&self, entry: &BlockEntry) -> Result<Op> {
        let value = match &entry.value {
            Stored::Inline(value) => Bytes::copy_from_slice(value),
            Stored::External { offset, len, checksum } => {
                let payload = self.file.slice(*offset, *len)?;
                if crc32fast::hash(payload) != *checksum {
                    return Err(Error::corruption(format!("table {} value checksum mismatch", self.id())));
                }
                let raw = lz4_flex::decompress_size_prepended(payload)
                    .map_err(|e| Error::corruption(format!("table {}: {}", self.id(), e)))?;
                Bytes::from(raw)
            }
        };

        Ok(match entry.kind {
            OpKind::Put => Op::Put(value),
            OpKind::Merge => Op::Merge(value),
            OpKind::Delete => Op::Delete,
        })
    }
}

/// Sequential reader used by table merges.
pub struct TableIter<'a> {
    table: &'a TableReader,
    block: usize,
    entries: std::vec::IntoIter<BlockEntry>,
}

impl Iterator for TableIter<'_> {
    type Item = Result<(Vec<u8>, Op)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some(self.table.load(&entry).map(|op| (entry.key, op)));
            }
            if self.block >= self.table.blocks.len() {
                return None;
            }
            match self.table.read_block(self.block) {
                Ok(entries) => {
                    self.block += 1;
                    self.entries = entries.into_iter();
                }
                Err(e) => {
                    self.block = self.table.blocks.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

pub fn find_tables(storage: &StorageLayout) -> Result<Vec<u64>> {
    StorageLayout::numbered_files(&storage.tables_dir, "table_", "tbl")
}

fn in_range(key: &[u8], start: &[u8], end: Option<&[u8]>) -> bool {
    key >= start && end.is_none_or(|end| key < end)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &std::path::Path) -> StorageLayout {
        StorageLayout::new(dir.to_path_buf()).unwrap()
    }

    fn put(value: &[u8]) -> Op {
        Op::Put(Bytes::copy_from_slice(value))
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:06}", i).into_bytes()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let large = vec![7u8; 10_000];

        let mut writer = TableWriter::create(&layout, 3, 0, 9).unwrap();
        writer.add(b"a", &put(b"1")).unwrap();
        writer.add(b"b", &Op::Merge(Bytes::from(large.clone()))).unwrap();
        writer.add(b"c", &Op::Delete).unwrap();
        let header = writer.finish().unwrap();
        assert_eq!(header.entry_count, 3);
        assert_eq!(find_tables(&layout).unwrap(), vec![3]);

        let table = TableReader::open(&layout, 3).unwrap();
        assert_eq!(table.header, header);
        assert_eq!(table.get(b"a").unwrap(), Some(put(b"1")));
        assert_eq!(table.get(b"b").unwrap(), Some(Op::Merge(Bytes::from(large))));
        assert_eq!(table.get(b"c").unwrap(), Some(Op::Delete));
        assert_eq!(table.get(b"0").unwrap(), None);
        assert_eq!(table.get(b"bb").unwrap(), None);
        assert_eq!(table.get(b"d").unwrap(), None);

        let kinds = table.scan_kinds(b"b", None).unwrap();
        assert_eq!(kinds, vec![(b"b".to_vec(), OpKind::Merge), (b"c".to_vec(), OpKind::Delete)]);
        assert_eq!(table.iter().count(), 3);
    }

    #[test]
    fn lookups_span_many_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());

        let mut writer = TableWriter::create(&layout, 1, 0, 1).unwrap();
        for i in 0..5_000 {
            writer.add(&key(i), &put(&[i as u8; 100])).unwrap();
        }
        writer.finish().unwrap();

        let table = TableReader::open(&layout, 1).unwrap();
        assert!(table.blocks.len() > 2);
        assert_eq!(table.get(&key(4_321)).unwrap(), Some(put(&[(4_321u32 as u8); 100])));

        let scanned = table.scan(&key(1_000), Some(&key(1_010))).unwrap();
        let keys: Vec<Vec<u8>> = scanned.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1_000..1_010).map(key).collect::<Vec<_>>());

        let all: Vec<Vec<u8>> = table.iter().map(|entry| entry.unwrap().0).collect();
        assert_eq!(all.len(), 5_000);
        assert!(all.windows(2).all(|pair| pair[0] < pair[1]));

        assert!(table.overlaps(&key(10), Some(&key(11))));
        assert!(!table.overlaps(b"zzz", None));
        assert!(!table.overlaps(b"a", Some(b"b")));
    }

    #[test]
    fn keys_must_ascend() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TableWriter::create(&layout(dir.path()), 1, 0, 1).unwrap();
        writer.add(b"b", &Op::Delete).unwrap();
        assert_eq!(writer.add(b"a", &Op::Delete).err().unwrap().kind, ErrorKind::InvalidArgument);
        assert_eq!(writer.add(b"b", &Op::Delete).err().unwrap().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn corrupted_block_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let mut writer = TableWriter::create(&layout, 1, 0, 1).unwrap();
        writer.add(b"k", &put(b"v")).unwrap();
        writer.finish().unwrap();

        // The only block starts the file
        let path = layout.table_path(1);
        let mut data = fs::read(&path).unwrap();
        data[6] ^= 0xff;
        fs::write(&path, data).unwrap();

        let table = TableReader::open(&layout, 1).unwrap();
        assert_eq!(table.get(b"k").err().unwrap().kind, ErrorKind::Corruption);
    }

    #[test]
    fn damaged_footer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let mut writer = TableWriter::create(&layout, 1, 0, 1).unwrap();
        writer.add(b"k", &put(b"v")).unwrap();
        writer.finish().unwrap();

        let path = layout.table_path(1);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert_eq!(TableReader::open(&layout, 1).err().unwrap().kind, ErrorKind::Corruption);
    }
}
