use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{IngestSnapshot, IngestStats};
use crate::core::store::Store;
use crate::schema::Record;
use crate::writer::batch::{Index, ShardWriter};

/// A record the front door can ingest on its own.
pub trait Ingest: Record + Send + 'static {
    /// Logical timestamp used for shard time ranges.
    fn timestamp(&self) -> u64;

    /// Registers index entries for this record. Indexes nothing by default.
    fn index(&self, _index: &mut Index<'_>) {}
}

/// Ingestion front door: one background thread drains a bounded channel into
/// the store's shard writer and flushes it on a timer.
///
/// Write and flush errors are logged and counted, never retried. Dropping a
/// `Db` cancels the thread; queued records and rows not yet flushed are lost.
pub struct Db<T: Ingest> {
    records: Option<Sender<T>>,
    cancel: Option<Sender<()>>,
    worker: Option<JoinHandle<ShardWriter<T>>>,
    stats: Arc<IngestStats>,
}

impl<T: Ingest> Db<T> {
    pub fn start(store: &Store, config: &Config) -> Result<Self> {
        config.validate()?;
        let writer = store.batch::<T>()?;

        let (records_tx, records_rx) = bounded(config.ingest_buffer);
        let (cancel_tx, cancel_rx) = bounded(1);
        let stats = Arc::new(IngestStats::new());

        let worker_stats = stats.clone();
        let interval = config.flush_interval;
        let worker = thread::Builder::new()
            .name("tallyx-ingest".to_string())
            .spawn(move || ingest_loop(writer, records_rx, cancel_rx, interval, worker_stats))?;

        info!(buffer = config.ingest_buffer, flush_interval = ?interval, "ingestion started");
        Ok(Db {
            records: Some(records_tx),
            cancel: Some(cancel_tx),
            worker: Some(worker),
            stats,
        })
    }

    /// Queues `record`, blocking while the channel is full.
    pub fn append(&self, record: T) -> Result<()> {
        let sender = self.records.as_ref().ok_or_else(closed)?;
        sender.send(record).map_err(|_| closed())?;
        self.stats.record_accepted();
        Ok(())
    }

    /// Queues `record` unless the channel is full; hands it back otherwise.
    pub fn try_append(&self, record: T) -> std::result::Result<(), T> {
        let Some(sender) = self.records.as_ref() else {
            return Err(record);
        };
        match sender.try_send(record) {
            Ok(()) => {
                self.stats.record_accepted();
                Ok(())
            }
            Err(TrySendError::Full(record)) | Err(TrySendError::Disconnected(record)) => {
                self.stats.record_dropped();
                Err(record)
            }
        }
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting records, lets the thread write what is already queued,
    /// and returns the writer with whatever it still buffers.
    pub fn shutdown(mut self) -> Result<ShardWriter<T>> {
        self.records.take();
        let writer = self.join();
        self.cancel.take();
        writer
    }

    /// Shuts down and releases the writer: final flush plus sequence persist.
    pub fn close(self) -> Result<()> {
        self.shutdown()?.release()
    }

    fn join(&mut self) -> Result<ShardWriter<T>> {
        let worker = self.worker.take().ok_or_else(closed)?;
        worker
            .join()
            .map_err(|_| Error::new(ErrorKind::Internal, "ingestion thread panicked"))
    }
}

impl<T: Ingest> Drop for Db<T> {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        // Cancel without draining; a flush in progress still completes
        self.cancel.take();
        self.records.take();
        match self.join() {
            Ok(writer) => drop(writer),
            Err(e) => warn!(error = %e, "ingestion thread did not stop cleanly"),
        }
    }
}

fn closed() -> Error {
    Error::new(ErrorKind::Closed, "ingestion has stopped")
}

fn ingest_loop<T: Ingest>(
    mut writer: ShardWriter<T>,
    records: Receiver<T>,
    cancel: Receiver<()>,
    interval: Duration,
    stats: Arc<IngestStats>,
) -> ShardWriter<T> {
    let ticker = tick(interval);
    loop {
        select! {
            recv(records) -> msg => match msg {
                Ok(record) => {
                    let timestamp = record.timestamp();
                    match writer.write(&record, timestamp, |index| record.index(index)) {
                        Ok(_) => stats.record_written(),
                        Err(e) => {
                            stats.record_failed();
                            warn!(error = %e, "dropping record");
                        }
                    }
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                match writer.flush() {
                    Ok(()) => stats.record_flush(),
                    Err(e) => {
                        stats.record_failed();
                        error!(error = %e, "periodic flush failed");
                    }
                }
            },
            recv(cancel) -> _ => break,
        }
    }
    debug!(pending = writer.pending_rows(), "ingestion loop stopped");
    writer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use crate::query::aggregate::{visitors, UID};

    crate::record! {
        struct Click {
            uid: u64,
            ts: u64,
        }
    }

    impl Ingest for Click {
        fn timestamp(&self) -> u64 {
            self.ts
        }

        fn index(&self, index: &mut Index<'_>) {
            index.int64(UID, self.uid as i64);
        }
    }

    crate::record! {
        struct Tagged {
            uid: u64,
        }
    }

    impl Ingest for Tagged {
        fn timestamp(&self) -> u64 {
            self.uid
        }

        fn index(&self, index: &mut Index<'_>) {
            let field = if self.uid == 2 { "bad=field" } else { UID };
            index.int64(field, self.uid as i64);
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn close_commits_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Click>::start(&store, &config).unwrap();
        for uid in [1, 2, 2, 3] {
            db.append(Click { uid, ts: uid * 100 }).unwrap();
        }
        assert_eq!(db.stats().accepted, 4);
        db.close().unwrap();

        let view = store.view(0);
        let found = view.existence(UID).unwrap();
        assert_eq!(found.len(), 4);
        assert_eq!(visitors(&view, &found).unwrap(), 3);
        assert_eq!(store.next_seq(), 4);
    }

    #[test]
    fn timer_flushes_without_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).with_flush_interval(Duration::from_millis(20));
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Click>::start(&store, &config).unwrap();
        db.append(Click { uid: 9, ts: 1 }).unwrap();
        wait_for(|| db.stats().flushes > 0 && store.shards().unwrap() == vec![0]);

        let writer = db.shutdown().unwrap();
        assert_eq!(writer.pending_rows(), 0);
    }

    #[test]
    fn shutdown_returns_unflushed_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).with_flush_interval(Duration::from_secs(3600));
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Click>::start(&store, &config).unwrap();
        db.append(Click { uid: 1, ts: 1 }).unwrap();
        wait_for(|| db.stats().written == 1);

        let writer = db.shutdown().unwrap();
        assert_eq!(writer.pending_rows(), 1);
        assert!(store.shards().unwrap().is_empty());

        writer.release().unwrap();
        assert_eq!(store.shards().unwrap(), vec![0]);
    }

    #[test]
    fn only_one_front_door_per_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Click>::start(&store, &config).unwrap();
        assert_eq!(Db::<Click>::start(&store, &config).err().unwrap().kind, ErrorKind::InvalidState);
        drop(db);
        assert!(Db::<Click>::start(&store, &config).is_ok());
    }

    #[test]
    fn try_append_hands_back_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).with_ingest_buffer(1);
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Click>::start(&store, &config).unwrap();
        let mut rejected = 0;
        for uid in 0..1000 {
            if db.try_append(Click { uid, ts: uid }).is_err() {
                rejected += 1;
            }
        }
        let stats = db.stats();
        assert_eq!(stats.dropped, rejected);
        assert_eq!(stats.accepted + stats.dropped, 1000);
        db.close().unwrap();
    }

    #[test]
    fn failed_writes_are_counted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = Store::open(config.clone()).unwrap();

        let db = Db::<Tagged>::start(&store, &config).unwrap();
        for uid in 1..=4 {
            db.append(Tagged { uid }).unwrap();
        }
        wait_for(|| db.stats().written + db.stats().failed == 4);
        let stats = db.stats();
        assert_eq!((stats.written, stats.failed), (3, 1));
        db.close().unwrap();

        // The refused record took no seq, so the survivors stay dense
        assert_eq!(store.next_seq(), 3);
        let view = store.view(0);
        let uid = view.require_index(UID).unwrap();
        assert_eq!((0..3).map(|seq| uid.get_value(seq)).collect::<Vec<_>>(), vec![Some(1), Some(3), Some(4)]);
    }
}
