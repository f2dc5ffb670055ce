pub mod core;
pub mod storage;
pub mod schema;
pub mod index;
pub mod merge;
pub mod mvcc;
pub mod writer;
pub mod reader;
pub mod query;

pub use crate::core::config::Config;
pub use crate::core::database::{Db, Ingest};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::store::Store;
pub use crate::query::filter::{Filter, Predicate};
pub use crate::reader::view::View;
pub use crate::schema::{Record, Schema};
pub use crate::storage::wal::SyncMode;
pub use crate::writer::batch::{Index, ShardWriter};

/*
┌──────────────────────────────────────────────────────────────────────────────────┐
│                            TALLYX STRUCT ARCHITECTURE                            │
└──────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── INGEST LAYER ────────────────────────────────────┐
│                                                                                  │
│  ┌──────────────────────────────┐        ┌────────────────────────────────────┐  │
│  │ struct Db<T: Ingest>         │ chan   │ struct ShardWriter<T: Record>      │  │
│  │ • records: Sender<T>         │ ─────▶ │ • schema: Schema<T>  (builders)    │  │
│  │ • cancel: Sender<()>         │ select │ • indexes: field -> Bsi            │  │
│  │ • worker: JoinHandle         │ tick   │ • dictionary: ShardDictionary      │  │
│  │ • stats: IngestStats         │        │ • range: TimeRange (running)       │  │
│  └──────────────────────────────┘        │ • shard = seq / shard_width        │  │
│                                          └─────────────────┬──────────────────┘  │
│                                                            │ emit(): one batch   │
└────────────────────────────────────────────────────────────┼─────────────────────┘
                                                             ▼
┌──────────────────────────────── STORAGE LAYER ───────────────────────────────────┐
│                                                                                  │
│  ┌──────────────────────────────┐        ┌────────────────────────────────────┐  │
│  │ struct Store                 │        │ struct Kv                          │  │
│  │ • kv: Kv                     │ ─────▶ │ • memtable: key -> [versioned op]  │  │
│  │ • sequence: Sequence         │        │ • wal: WAL (crc framed batches)    │  │
│  │ • writer slot (one live)     │        │ • mvcc: MVCCController (pins)      │  │
│  └──────────────────────────────┘        │ • operator: KeyPrefixMerger        │  │
│                                          │ • tables: mmap'd blocks (lz4)      │  │
│                                          │ • tiered merges, level 0 flushes   │  │
│                                          └────────────────────────────────────┘  │
│                                                                                  │
│  Key layout (storage::keys)                                                      │
│   0x00                          -> BE64 next seq                                 │
│   0x01 ++ BE64 shard ++ field   -> Arrow IPC column   (merge: concat, ordered)   │
│   0x02 ++ BE64 shard ++ field   -> BSI               (merge: union, any order)   │
│   0x03 ++ BE64 shard ++ f=value -> ∅                                             │
│   0x04 ++ BE64 shard ++ BE64 h  -> value                                         │
│   0x05 ++ BE64 ts ++ BE64 shard -> ∅  (min and max on every emit)                │
└──────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── READ LAYER ──────────────────────────────────────┐
│                                                                                  │
│  Store::shards_in_range ──▶ Store::views ──▶ View (Arc<Snapshot>, shard)         │
│                                               │                                  │
│         Predicate::apply(view, found) ◀───────┤  Equal / NotEqual / Regex        │
│                                               │  NotRegex / Range / And / Or     │
│         aggregate::{visitors, visits, bounce, current_visitor}                   │
└──────────────────────────────────────────────────────────────────────────────────┘
*/
