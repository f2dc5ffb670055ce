use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

/// Version bookkeeping for the KV engine.
///
/// Writers take `next_version`, apply, then `publish`. Readers `pin` the
/// published version and `release` it when done; compaction may only collapse
/// history at or below `oldest_pinned`.
#[derive(Debug, Default)]
pub struct MVCCController {
    visible: AtomicU64,
    assigned: AtomicU64,
    pinned: Mutex<BTreeMap<u64, usize>>,
}

impl MVCCController {
    pub fn new(recovered: u64) -> Self {
        MVCCController {
            visible: AtomicU64::new(recovered),
            assigned: AtomicU64::new(recovered),
            pinned: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn next_version(&self) -> u64 {
        self.assigned.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Makes everything up to `version` visible to new readers.
    pub fn publish(&self, version: u64) {
        self.visible.fetch_max(version, Ordering::Release);
    }

    pub fn current_version(&self) -> u64 {
        self.visible.load(Ordering::Acquire)
    }

    pub fn pin(&self) -> u64 {
        let mut pinned = self.pinned.lock();
        let version = self.current_version();
        *pinned.entry(version).or_insert(0) += 1;
        version
    }

    pub fn release(&self, version: u64) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&version);
            }
        }
    }

    /// Oldest version a live reader can still observe.
    pub fn oldest_pinned(&self) -> u64 {
        let pinned = self.pinned.lock();
        pinned
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current_version())
    }

    pub fn active_readers(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}
