use std::time::Duration;
use chrono::Utc;
use roaring::RoaringTreemap;
use tracing::debug;
use crate::core::error::Result;
use crate::core::store::Store;
use crate::query::filter::{Filter, Predicate};
use crate::reader::view::View;

pub const UID: &str = "uid";
pub const SESSION: &str = "session";
pub const BOUNCE: &str = "bounce";
pub const DOMAIN: &str = "domain";
pub const TIMESTAMP: &str = "timestamp";

/// Number of distinct values of `field` among `found`.
pub fn distinct(view: &View, field: &str, found: &RoaringTreemap) -> Result<u64> {
    Ok(view.require_index(field)?.distinct_count(Some(found)))
}

/// Signed sum of `field` over `found`.
pub fn sum(view: &View, field: &str, found: &RoaringTreemap) -> Result<i64> {
    let (total, _) = view.require_index(field)?.sum(Some(found))?;
    Ok(total)
}

pub fn visitors(view: &View, found: &RoaringTreemap) -> Result<u64> {
    distinct(view, UID, found)
}

pub fn visits(view: &View, found: &RoaringTreemap) -> Result<i64> {
    sum(view, SESSION, found)
}

/// Net bounces: bounce values are signed.
pub fn bounce(view: &View, found: &RoaringTreemap) -> Result<i64> {
    sum(view, BOUNCE, found)
}

/// String values of `field` among `found` with their row counts, most frequent first.
pub fn breakdown(view: &View, field: &str, found: &RoaringTreemap) -> Result<Vec<(String, u64)>> {
    let counts = view.require_index(field)?.transpose_with_counts(Some(found));
    let mut rows = Vec::with_capacity(counts.len());
    for (hash, count) in counts {
        if let Some(value) = view.translate(hash as u64)? {
            rows.push((value, count));
        }
    }
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(rows)
}

/// Visitors on `domain` over the last `duration`, timestamps in unix milliseconds.
pub fn current_visitor(store: &Store, domain: &str, duration: Duration) -> Result<u64> {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    current_visitor_at(store, domain, now, u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Sum of per-shard distinct visitors on `domain` within `[now - duration, now]`.
///
/// A visitor seen in two shards is counted twice.
pub fn current_visitor_at(store: &Store, domain: &str, now: u64, duration: u64) -> Result<u64> {
    let start = now.saturating_sub(duration);
    let shards = store.shards_in_range(start, now)?;
    let on_domain = Predicate::equal(DOMAIN, domain);
    let in_window = Predicate::range(
        TIMESTAMP,
        i64::try_from(start).unwrap_or(i64::MAX),
        i64::try_from(now).unwrap_or(i64::MAX),
    );

    let mut total = 0;
    for view in store.views(&shards) {
        let mut found = on_domain.apply(&view, &view.existence(DOMAIN)?)?;
        if view.index(TIMESTAMP)?.is_some() {
            found = in_window.apply(&view, &found)?;
        }
        if found.is_empty() {
            continue;
        }
        total += visitors(&view, &found)?;
    }

    debug!(domain, start, end = now, shards = shards.len(), visitors = total, "current visitors");
    Ok(total)
}
