//! Capped-collection eviction.
//!
//! When an insert pushes a capped collection over its byte or document
//! bound, the inserting writer evicts the oldest records inline. Only one
//! writer evicts at a time; the others either skip (someone close behind
//! is already cleaning up) or wait briefly on a timed lock, so a hot
//! capped collection doesn't serialize every insert behind the evictor.
//!
//! Eviction runs under a side transaction so that a conflict or abort in
//! the eviction path cannot roll back the caller's own insert.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::warn;

use super::{RecordId, StoreInner};
use crate::error::{Error, Result};
use crate::txn::Transaction;

/// Most records one eviction pass will remove.
const EVICTION_BATCH: i64 = 20_000;

/// How long a contended writer waits for the eviction lock.
const EVICTION_WAIT: Duration = Duration::from_millis(200);

/// Upper bound on the byte slack granted above the cap.
const MAX_SLACK: i64 = 16 * 1024 * 1024;

/// Contention-relief margin above the byte cap: writers within this much
/// of the cap may skip eviction when another writer holds the lock.
pub(crate) fn slack_for(capped_max_bytes: i64) -> i64 {
    (capped_max_bytes / 10).min(MAX_SLACK)
}

fn capped_and_need_delete(inner: &StoreInner) -> bool {
    if !inner.options.capped {
        return false;
    }
    if inner.tracker.data_size() >= inner.options.capped_max_bytes {
        return true;
    }
    inner.options.capped_max_docs != -1
        && inner.tracker.num_records() > inner.options.capped_max_docs
}

/// Evicts the oldest records if the collection is over a bound, without
/// ever touching `just_inserted` or anything after it. Returns how many
/// records were removed; zero also covers "another writer is handling
/// it" and soft failures.
pub(crate) fn delete_as_needed(inner: &StoreInner, just_inserted: RecordId) -> Result<i64> {
    debug_assert!(inner.stones.is_none());

    if !capped_and_need_delete(inner) {
        return Ok(0);
    }

    let _guard = if inner.options.capped_max_docs != -1 {
        // The document bound must be exact, so always take the lock.
        inner.capped_guard.lock()
    } else {
        match inner.capped_guard.try_lock() {
            Some(guard) => guard,
            None => {
                // Someone else is evicting. Skip unless we're far behind.
                let overshoot = inner.tracker.data_size() - inner.options.capped_max_bytes;
                if overshoot < inner.capped_slack {
                    return Ok(0);
                }

                // Wait only briefly: we're inside the caller's transaction
                // and must not stall it indefinitely.
                let start = Instant::now();
                let guard = inner.capped_guard.try_lock_for(EVICTION_WAIT);
                inner.capped_sleep.fetch_add(1, Ordering::SeqCst);
                inner
                    .capped_sleep_ms
                    .fetch_add(start.elapsed().as_millis() as i64, Ordering::SeqCst);
                let Some(guard) = guard else {
                    return Ok(0);
                };

                // We already waited once; leave the rest to the previous
                // holder unless the overshoot is still large.
                let overshoot = inner.tracker.data_size() - inner.options.capped_max_bytes;
                if overshoot < 2 * inner.capped_slack {
                    return Ok(0);
                }
                guard
            }
        }
    };

    let mut side = Transaction::new(inner.engine.begin());
    match evict(inner, &mut side, just_inserted) {
        Ok(0) => {
            side.abort();
            Ok(0)
        }
        Ok(removed) => match side.commit() {
            Ok(()) => Ok(removed),
            Err(Error::Conflict) => {
                warn!(uri = %inner.uri, "conflict truncating capped collection, ignoring");
                Ok(0)
            }
            Err(err) => Err(err),
        },
        Err(Error::Conflict) => {
            side.abort();
            warn!(uri = %inner.uri, "conflict truncating capped collection, ignoring");
            Ok(0)
        }
        Err(err) => {
            side.abort();
            Err(err)
        }
    }
}

fn evict(inner: &StoreInner, side: &mut Transaction, just_inserted: RecordId) -> Result<i64> {
    let options = &inner.options;
    let data_size = inner.tracker.data_size();
    let num_records = inner.tracker.num_records();

    let size_over_cap = (data_size - options.capped_max_bytes).max(0);
    let docs_over_cap = if options.capped_max_docs != -1 && num_records > options.capped_max_docs {
        num_records - options.capped_max_docs
    } else {
        0
    };

    let mut cursor = side.engine().cursor(&inner.uri)?;
    let mut docs_removed = 0i64;
    let mut size_saved = 0i64;
    let mut first: Option<i64> = None;
    let mut last: Option<i64> = None;

    while (size_saved < size_over_cap || docs_removed < docs_over_cap)
        && docs_removed < EVICTION_BATCH
    {
        if !cursor.next()? {
            break;
        }
        let key = cursor.key()?;
        let id = RecordId::new(key);
        // Never evict the record whose insert triggered us, or anything
        // after it.
        if id >= just_inserted {
            break;
        }
        if inner.shutting_down.load(Ordering::Relaxed) {
            break;
        }

        let data = cursor.value()?;
        docs_removed += 1;
        size_saved += data.len() as i64;
        first.get_or_insert(key);
        last = Some(key);

        if let Some(callback) = &inner.capped_callback {
            callback.about_to_delete(id, &data)?;
        }
    }
    if docs_removed == 0 {
        return Ok(0);
    }
    drop(cursor);

    match side.engine().truncate_range(&inner.uri, first, last) {
        Err(Error::InvalidData(reason)) => {
            // The range vanished under us; a later insert retries.
            warn!(
                uri = %inner.uri,
                reason,
                "soft failure truncating capped collection, will retry later"
            );
            return Ok(0);
        }
        result => result?,
    }

    inner.change_num_records(Some(side), -docs_removed);
    inner.increase_data_size(Some(side), -size_saved);
    Ok(docs_removed)
}
