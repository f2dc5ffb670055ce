use std::collections::BTreeMap;
use arrow::array::{Array, BooleanArray, MapArray, UInt64Array};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tallyx::index::bsi::Bsi;
use tallyx::index::dictionary::content_hash;
use tallyx::merge::{combine, KeyPrefixMerger};
use tallyx::query::aggregate::{bounce, visitors, visits, BOUNCE, SESSION, UID};
use tallyx::storage::keys;
use tallyx::{Config, Filter, Predicate, Store};

tallyx::record! {
    pub struct Event {
        pub uid: u64,
        pub bounce: Option<bool>,
        pub props: Option<BTreeMap<String, String>>,
    }
}

fn event(uid: u64) -> Event {
    Event { uid, bounce: None, props: None }
}

fn open(dir: &std::path::Path, width: u64) -> Store {
    Store::open(Config::new(dir).with_shard_width(width)).unwrap()
}

fn uids(store: &Store, shard: u64) -> Vec<u64> {
    let column = store.view(shard).column("uid").unwrap().unwrap();
    column.as_any().downcast_ref::<UInt64Array>().unwrap().values().to_vec()
}

#[test]
fn every_column_has_one_slot_per_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1024);
    let mut writer = store.batch::<Event>().unwrap();

    let n = 300u64;
    for uid in 0..n {
        let record = Event {
            uid,
            bounce: (uid % 3 == 0).then_some(uid % 2 == 0),
            props: (uid % 5 == 0).then(|| BTreeMap::from([("ref".to_string(), format!("r{}", uid))])),
        };
        writer.write(&record, uid, |_| {}).unwrap();
    }
    writer.release().unwrap();

    let batch = store.view(0).record().unwrap();
    assert_eq!(batch.num_rows(), n as usize);
    for column in batch.columns() {
        assert_eq!(column.len(), n as usize);
    }

    let bounce = batch.column_by_name("bounce").unwrap().as_any().downcast_ref::<BooleanArray>().unwrap();
    assert_eq!(bounce.null_count(), (n - n.div_ceil(3)) as usize);
    let props = batch.column_by_name("props").unwrap().as_any().downcast_ref::<MapArray>().unwrap();
    assert_eq!(props.null_count(), (n - n.div_ceil(5)) as usize);
}

#[test]
fn sequence_is_dense_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), 8);
        let mut writer = store.batch::<Event>().unwrap();
        for (expected, uid) in (0..20).enumerate() {
            assert_eq!(writer.write(&event(uid), uid, |_| {}).unwrap(), expected as u64);
        }
        writer.release().unwrap();
    }

    let store = open(dir.path(), 8);
    assert_eq!(store.next_seq(), 20);
    let mut writer = store.batch::<Event>().unwrap();
    assert_eq!(writer.write(&event(99), 99, |_| {}).unwrap(), 20);
    writer.release().unwrap();
}

#[test]
fn index_merge_matches_reference_under_any_partition() {
    let mut rng = StdRng::seed_from_u64(7);
    let key = keys::index_key(0, "uid");

    let mut reference = Bsi::new();
    for column in 0..500u64 {
        reference.set_value(column, rng.gen_range(-1_000_000..1_000_000));
    }

    for groups in [2usize, 3, 7] {
        let mut parts = vec![Bsi::new(); groups];
        for column in 0..500u64 {
            let value = reference.get_value(column).unwrap();
            parts[rng.gen_range(0..groups)].set_value(column, value);
        }
        let mut operands: Vec<Vec<u8>> = parts.iter().map(|p| p.serialize().unwrap()).collect();
        operands.shuffle(&mut rng);

        let merged = operands[1..]
            .iter()
            .fold(operands[0].clone(), |acc, next| combine(&KeyPrefixMerger, &key, &acc, next).unwrap());
        assert_eq!(Bsi::deserialize(&merged).unwrap(), reference);
    }
}

#[test]
fn successive_flushes_concatenate_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1024);
    let mut writer = store.batch::<Event>().unwrap();

    let flushes: [&[u64]; 3] = [&[10, 11], &[20], &[30, 31, 32]];
    for group in flushes {
        for &uid in group {
            writer.write(&event(uid), uid, |_| {}).unwrap();
        }
        writer.flush().unwrap();
    }
    assert_eq!(uids(&store, 0), vec![10, 11, 20, 30, 31, 32]);

    // Collapsing operand chains must not reorder them
    store.compact().unwrap();
    assert_eq!(uids(&store, 0), vec![10, 11, 20, 30, 31, 32]);
    writer.release().unwrap();
}

#[test]
fn equality_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1024);
    let mut writer = store.batch::<Event>().unwrap();
    let names = ["x", "y", "x", "z", "x"];
    for (uid, name) in names.iter().enumerate() {
        writer
            .write(&event(uid as u64), uid as u64, |index| {
                index.int64(UID, uid as i64);
                index.string("name", name);
            })
            .unwrap();
    }
    writer.release().unwrap();

    let view = store.view(0);
    let found = view.existence(UID).unwrap();
    let eq: Vec<u64> = Predicate::equal("name", "x").apply(&view, &found).unwrap().iter().collect();
    let neq: Vec<u64> = Predicate::not_equal("name", "x").apply(&view, &found).unwrap().iter().collect();
    assert_eq!(eq, vec![0, 2, 4]);
    assert_eq!(neq, vec![1, 3]);
}

#[test]
fn regex_selects_prefix_matches() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1024);
    let mut writer = store.batch::<Event>().unwrap();
    for (uid, value) in ["a1", "a2", "b1"].iter().enumerate() {
        writer
            .write(&event(uid as u64), 0, |index| index.string("f", value))
            .unwrap();
    }
    writer.release().unwrap();

    let view = store.view(0);
    let found = view.existence("f").unwrap();
    let rows: Vec<u64> = Predicate::regex("f", "^a").unwrap().apply(&view, &found).unwrap().iter().collect();
    assert_eq!(rows, vec![0, 1]);
}

#[test]
fn visitor_visit_bounce_example() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1024);
    let mut writer = store.batch::<Event>().unwrap();
    for (uid, session, bounced) in [(1u64, 1i64, 1i64), (1, 0, -1), (2, 1, 1)] {
        writer
            .write(&event(uid), 0, |index| {
                index.int64(UID, uid as i64);
                index.int64(SESSION, session);
                index.int64(BOUNCE, bounced);
            })
            .unwrap();
    }
    writer.release().unwrap();

    let view = store.view(0);
    let found = view.existence(UID).unwrap();
    assert_eq!(visitors(&view, &found).unwrap(), 2);
    assert_eq!(visits(&view, &found).unwrap(), 2);
    assert_eq!(bounce(&view, &found).unwrap(), 1);
}

#[test]
fn shard_is_committed_before_the_next_begins() {
    let dir = tempfile::tempdir().unwrap();
    let width = 64;
    let store = open(dir.path(), width);
    let mut writer = store.batch::<Event>().unwrap();

    for uid in 0..width {
        writer.write(&event(uid), uid, |_| {}).unwrap();
    }
    assert!(store.shards().unwrap().is_empty());

    // The first row of shard 1 forces shard 0 out whole
    writer.write(&event(width), width, |_| {}).unwrap();
    assert_eq!(store.shards().unwrap(), vec![0]);
    assert_eq!(uids(&store, 0).len(), width as usize);

    writer.release().unwrap();
    assert_eq!(store.shards().unwrap(), vec![0, 1]);
    assert_eq!(uids(&store, 1), vec![width]);
}

#[test]
fn end_to_end_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), 1024);
        let mut writer = store.batch::<Event>().unwrap();
        writer.write(&event(1), 100, |index| index.string("name", "A")).unwrap();
        writer.write(&event(2), 200, |index| index.string("name", "B")).unwrap();
        writer.flush().unwrap();
        drop(writer);
    }

    let store = open(dir.path(), 1024);
    let view = store.view(0);
    assert_eq!(view.translate(content_hash("name", "A")).unwrap().as_deref(), Some("A"));
    assert_eq!(store.shards_in_range(50, 150).unwrap(), vec![0]);
    assert!(store.shards_in_range(300, 400).unwrap().is_empty());
    assert_eq!(store.next_seq(), 2);
}

#[test]
fn checkpointed_store_reads_the_same_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path(), 4);
        let mut writer = store.batch::<Event>().unwrap();
        for uid in 0..10 {
            writer.write(&event(uid), uid, |index| index.int64(UID, uid as i64)).unwrap();
            if uid % 3 == 0 {
                writer.flush().unwrap();
            }
        }
        writer.release().unwrap();
        store.close().unwrap();
    }

    let store = open(dir.path(), 4);
    assert_eq!(store.shards().unwrap(), vec![0, 1, 2]);
    assert_eq!(uids(&store, 0), vec![0, 1, 2, 3]);
    assert_eq!(uids(&store, 2), vec![8, 9]);
    let view = store.view(1);
    assert_eq!(view.existence(UID).unwrap().iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
}
