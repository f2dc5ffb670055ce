//! Byte layout of every persisted key.
//!
//! | keyspace      | key                                          | value                  |
//! |---------------|----------------------------------------------|------------------------|
//! | sequence      | `SEQUENCE`                                   | BE64 next seq          |
//! | columnar      | `COLUMN ++ BE64(shard) ++ field`             | Arrow IPC (merge)      |
//! | index         | `INDEX ++ BE64(shard) ++ field`              | BSI bytes (merge)      |
//! | dict-forward  | `DICT_FORWARD ++ BE64(shard) ++ field=value` | empty                  |
//! | dict-reverse  | `DICT_REVERSE ++ BE64(shard) ++ BE64(hash)`  | original string        |
//! | time-range    | `TIME_RANGE ++ BE64(ts) ++ BE64(shard)`      | empty                  |

pub const SEQUENCE: u8 = 0x00;
pub const COLUMN: u8 = 0x01;
pub const INDEX: u8 = 0x02;
pub const DICT_FORWARD: u8 = 0x03;
pub const DICT_REVERSE: u8 = 0x04;
pub const TIME_RANGE: u8 = 0x05;

pub const SEQUENCE_KEY: [u8; 1] = [SEQUENCE];

fn shard_prefix(tag: u8, shard: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(tag);
    key.extend_from_slice(&shard.to_be_bytes());
    key
}

fn field_key(tag: u8, shard: u64, field: &str) -> Vec<u8> {
    let mut key = shard_prefix(tag, shard);
    key.extend_from_slice(field.as_bytes());
    key
}

pub fn column_key(shard: u64, field: &str) -> Vec<u8> {
    field_key(COLUMN, shard, field)
}

pub fn index_key(shard: u64, field: &str) -> Vec<u8> {
    field_key(INDEX, shard, field)
}

/// All columnar keys of one shard.
pub fn column_prefix(shard: u64) -> Vec<u8> {
    shard_prefix(COLUMN, shard)
}

pub fn dict_forward_key(shard: u64, field: &str, value: &str) -> Vec<u8> {
    let mut key = dict_forward_prefix(shard, field);
    key.extend_from_slice(value.as_bytes());
    key
}

/// Prefix shared by every forward dictionary key of `field` in `shard`.
pub fn dict_forward_prefix(shard: u64, field: &str) -> Vec<u8> {
    let mut key = field_key(DICT_FORWARD, shard, field);
    key.push(b'=');
    key
}

pub fn dict_reverse_key(shard: u64, hash: u64) -> Vec<u8> {
    let mut key = shard_prefix(DICT_REVERSE, shard);
    key.extend_from_slice(&hash.to_be_bytes());
    key
}

pub fn time_range_key(timestamp: u64, shard: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(TIME_RANGE);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key.extend_from_slice(&shard.to_be_bytes());
    key
}

/// `(timestamp, shard)` of a time-range marker.
pub fn decode_time_range_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 17 || key[0] != TIME_RANGE {
        return None;
    }
    Some((read_be64(&key[1..9])?, read_be64(&key[9..17])?))
}

/// Shard number of any shard-scoped key (columnar, index, dictionary).
pub fn decode_shard(key: &[u8]) -> Option<u64> {
    match key.first() {
        Some(&COLUMN) | Some(&INDEX) | Some(&DICT_FORWARD) | Some(&DICT_REVERSE) if key.len() >= 9 => {
            read_be64(&key[1..9])
        }
        _ => None,
    }
}

/// Field name of a columnar or index key.
pub fn decode_field(key: &[u8]) -> Option<&str> {
    match key.first() {
        Some(&COLUMN) | Some(&INDEX) if key.len() >= 9 => std::str::from_utf8(&key[9..]).ok(),
        _ => None,
    }
}

/// Half-open key range holding all row data (columns and indexes).
pub fn row_data_range() -> (Vec<u8>, Vec<u8>) {
    (vec![COLUMN], vec![INDEX + 1])
}

/// Half-open key range of one tag's keyspace.
pub fn tag_range(tag: u8) -> (Vec<u8>, Vec<u8>) {
    (vec![tag], vec![tag + 1])
}

/// Smallest key strictly greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

pub fn read_be64(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(array))
}
