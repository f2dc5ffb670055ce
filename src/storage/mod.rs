pub mod layout;
pub mod file_lock;
pub mod wal;
pub mod mmap_file;
pub mod table;
pub mod merge_policy;
pub mod checkpoint;
pub mod keys;
pub mod kv;
