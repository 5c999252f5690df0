//! The record store: an ordered sequence of variable-length records
//! addressed by monotonically assigned 64-bit ids, layered on an external
//! key/value engine.
//!
//! A store is either plain, capped (size- and/or count-bounded, evicting
//! the oldest records inline), or an oplog (capped and append-only, with
//! ids extracted from the records themselves and space reclaimed in bulk
//! through truncate stones). All writes go through a caller-supplied
//! `Transaction`; in-memory side effects that must follow the
//! transaction's fate are registered as commit/rollback hooks.

pub mod cursor;
pub mod size;
pub mod stones;
pub mod visibility;

mod capped;

use std::cmp::Ordering as CmpOrdering;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::CollectionOptions;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::oplog;
use crate::txn::{Change, Transaction};
use crate::{errdata, errinput};

use cursor::{Cursor, RandomCursor};
use size::{SizeStorer, SizeTracker};
use stones::OplogStones;
use visibility::UncommittedIds;

const MIN_FORMAT_VERSION: i32 = 1;
const CURRENT_FORMAT_VERSION: i32 = 1;
const MAX_FORMAT_VERSION: i32 = 1;

/// A record's identifier: a strictly positive 64-bit integer for normal
/// records, totally ordered, never reused.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct RecordId(i64);

impl RecordId {
    /// The null id: no record.
    pub const NULL: RecordId = RecordId(0);

    pub fn new(repr: i64) -> Self {
        Self(repr)
    }

    /// The raw integer representation, as stored in the engine.
    pub fn repr(&self) -> i64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Whether this id can address a stored record.
    pub fn is_normal(&self) -> bool {
        self.0 > 0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub data: Vec<u8>,
}

/// Called for each record about to be removed by capped eviction or
/// truncate-after; an error aborts the operation.
pub trait CappedDeleteCallback: Send + Sync {
    fn about_to_delete(&self, id: RecordId, data: &[u8]) -> Result<()>;
}

/// Point-in-time statistics for a store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreStats {
    pub capped: bool,
    pub capped_max_bytes: i64,
    pub capped_max_docs: i64,
    pub num_records: i64,
    pub data_size: i64,
    /// How often writers waited on the eviction lock, and for how long.
    pub capped_sleep: i64,
    pub capped_sleep_ms: i64,
}

/// Outcome of `validate`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidateResults {
    pub valid: bool,
    pub errors: Vec<String>,
    pub num_records: i64,
    pub data_size: i64,
}

/// Builds the engine table-creation config for a collection. Key order is
/// part of the contract: user configuration may override the tuning
/// prefix but never the suffix, and oplog tables force file-backed
/// storage regardless of what the user asked for.
pub fn generate_create_config(options: &CollectionOptions) -> Result<String> {
    let mut config = String::new();
    config.push_str("type=file,");
    // Larger in-memory pages hurt latency on append-heavy tables.
    config.push_str("memory_page_max=10m,");
    // Mostly-append usage wants a high split point, with room left for
    // updates that grow records.
    config.push_str("split_pct=90,");
    config.push_str("leaf_value_max=64MB,");
    config.push_str("checksum=on,");
    if options.prefix_compression {
        config.push_str("prefix_compression,");
    }
    config.push_str(&format!("block_compressor={},", options.block_compressor));
    if !options.extra_config.is_empty() {
        config.push_str(&options.extra_config);
        config.push(',');
    }
    for (key, value) in &options.storage_options {
        if key != "configString" {
            return errinput!("'{key}' is not a supported storage option");
        }
        config.push_str(value);
        config.push(',');
    }
    if options.oplog {
        // Forced for oplogs regardless of user configuration.
        config.push_str("type=file,memory_page_max=10m,");
    }
    // Nothing user-controlled may appear below this line.
    config.push_str("key_format=q,value_format=u");
    config.push_str(&format!(
        ",app_metadata=(formatVersion={CURRENT_FORMAT_VERSION}"
    ));
    if options.oplog {
        config.push_str(",oplogKeyExtractionVersion=1");
    }
    config.push(')');
    Ok(config)
}

pub(crate) struct StoreInner {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) name: String,
    pub(crate) uri: String,
    pub(crate) options: CollectionOptions,
    /// Set when the table's metadata declares oplog key extraction.
    pub(crate) use_oplog_extraction: bool,
    pub(crate) next_id: AtomicI64,
    pub(crate) tracker: Arc<SizeTracker>,
    pub(crate) uncommitted: Arc<UncommittedIds>,
    pub(crate) stones: Option<Arc<OplogStones>>,
    pub(crate) capped_callback: Option<Box<dyn CappedDeleteCallback>>,
    /// Single-writer eviction lock; also guards the shutdown handshake.
    pub(crate) capped_guard: Mutex<()>,
    pub(crate) capped_slack: i64,
    pub(crate) capped_sleep: AtomicI64,
    pub(crate) capped_sleep_ms: AtomicI64,
    pub(crate) shutting_down: AtomicBool,
}

impl StoreInner {
    pub(crate) fn change_num_records(&self, txn: Option<&mut Transaction>, diff: i64) {
        if let Some(txn) = txn {
            txn.register(Change::NumRecords {
                tracker: Arc::clone(&self.tracker),
                diff,
            });
        }
        self.tracker.apply_num_records(diff);
    }

    pub(crate) fn increase_data_size(&self, txn: Option<&mut Transaction>, amount: i64) {
        if let Some(txn) = txn {
            txn.register(Change::DataSize {
                tracker: Arc::clone(&self.tracker),
                amount,
            });
        }
        self.tracker.apply_data_size(amount);
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        {
            let _guard = self.capped_guard.lock();
            self.shutting_down.store(true, Ordering::Relaxed);
        }
        debug!(name = %self.name, uri = %self.uri, "closing record store");
        self.tracker.push_and_flush();
        if let Some(stones) = &self.stones {
            stones.kill();
        }
    }
}

/// An ordered record store over one engine table. Cheap to clone; clones
/// share state, so a background reclaimer can hold one safely.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Opens the store, creating the engine table if needed. Finds the
    /// highest id in use, recovers size counters from the size storer or
    /// by scanning, and initializes oplog stones for oplog collections.
    pub fn open(
        engine: Arc<dyn Engine>,
        name: impl Into<String>,
        uri: impl Into<String>,
        options: CollectionOptions,
        size_storer: Option<Arc<dyn SizeStorer>>,
        capped_callback: Option<Box<dyn CappedDeleteCallback>>,
    ) -> Result<RecordStore> {
        let name = name.into();
        let uri = uri.into();

        if options.capped {
            if options.capped_max_bytes <= 0 {
                return errinput!("capped collections require a positive byte limit");
            }
            if options.capped_max_docs != -1 && options.capped_max_docs <= 0 {
                return errinput!("capped document limit must be -1 or positive");
            }
        } else if options.capped_max_bytes != -1 || options.capped_max_docs != -1 {
            return errinput!("size limits require a capped collection");
        }

        let config = generate_create_config(&options)?;
        engine.create_table(&uri, &config)?;

        let metadata = engine.app_metadata(&uri)?;
        let version = metadata.get("formatVersion").copied().unwrap_or(0);
        if !(MIN_FORMAT_VERSION..=MAX_FORMAT_VERSION).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let use_oplog_extraction = metadata.get("oplogKeyExtractionVersion") == Some(&1);

        let tracker = Arc::new(SizeTracker::new(uri.clone(), size_storer));

        // Find the highest id in use; if the size storer doesn't know this
        // table, keep walking the same reverse cursor to recount.
        let txn = engine.begin();
        let mut highest = RecordId::NULL;
        {
            let mut cursor = txn.cursor(&uri)?;
            if cursor.prev()? {
                highest = RecordId::new(cursor.key()?);
                match tracker.storer().and_then(|storer| storer.load(&uri)) {
                    Some((num_records, data_size)) => tracker.set(num_records, data_size),
                    None => {
                        debug!(name = %name, "scanning collection to recover size and count");
                        let mut num_records = 1i64;
                        let mut data_size = cursor.value()?.len() as i64;
                        while cursor.prev()? {
                            num_records += 1;
                            data_size += cursor.value()?.len() as i64;
                        }
                        tracker.set(num_records, data_size);
                    }
                }
            }
        }

        let stones = if options.oplog {
            Some(Arc::new(OplogStones::open(
                txn.as_ref(),
                &uri,
                options.capped_max_bytes,
                &tracker,
            )?))
        } else {
            None
        };
        txn.commit()?;

        if let Some(stones) = &stones {
            stones.poke();
        }

        let capped_slack = capped::slack_for(options.capped_max_bytes.max(0));
        Ok(RecordStore {
            inner: Arc::new(StoreInner {
                engine,
                name,
                uri,
                use_oplog_extraction,
                next_id: AtomicI64::new(highest.repr() + 1),
                tracker,
                uncommitted: Arc::new(UncommittedIds::new(highest)),
                stones,
                capped_callback,
                capped_guard: Mutex::new(()),
                capped_slack,
                capped_sleep: AtomicI64::new(0),
                capped_sleep_ms: AtomicI64::new(0),
                shutting_down: AtomicBool::new(false),
                options,
            }),
        })
    }

    /// Begins a transaction against the store's engine.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.inner.engine.begin())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    pub fn num_records(&self) -> i64 {
        self.inner.tracker.num_records()
    }

    pub fn data_size(&self) -> i64 {
        self.inner.tracker.data_size()
    }

    /// The store's oplog stones, present on oplog collections.
    pub fn oplog_stones(&self) -> Option<&Arc<OplogStones>> {
        self.inner.stones.as_ref()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = &*self.inner;
        StoreStats {
            capped: inner.options.capped,
            capped_max_bytes: inner.options.capped_max_bytes,
            capped_max_docs: inner.options.capped_max_docs,
            num_records: inner.tracker.num_records(),
            data_size: inner.tracker.data_size(),
            capped_sleep: inner.capped_sleep.load(Ordering::SeqCst),
            capped_sleep_ms: inner.capped_sleep_ms.load(Ordering::SeqCst),
        }
    }

    /// Inserts a record, returning its id. Ids for plain and capped
    /// collections come from the monotonic allocator; oplog collections
    /// extract them from the record itself. Capped collections may evict
    /// older records inline before returning.
    pub fn insert(&self, txn: &mut Transaction, data: &[u8]) -> Result<RecordId> {
        let inner = &*self.inner;
        let options = &inner.options;

        if options.capped && data.len() as i64 > options.capped_max_bytes {
            return Err(Error::RecordTooLarge(format!(
                "record of {} bytes exceeds capped limit of {}",
                data.len(),
                options.capped_max_bytes
            )));
        }

        let id = if inner.use_oplog_extraction {
            let id = oplog::extract_id(data)?;
            inner.uncommitted.add_extracted(id);
            txn.register(Change::CappedInsert {
                ids: Arc::clone(&inner.uncommitted),
                id,
            });
            id
        } else if options.capped {
            let id = inner.uncommitted.add_next(&inner.next_id);
            txn.register(Change::CappedInsert {
                ids: Arc::clone(&inner.uncommitted),
                id,
            });
            id
        } else {
            let id = RecordId::new(inner.next_id.fetch_add(1, Ordering::SeqCst));
            debug_assert!(id.is_normal());
            id
        };

        txn.engine().cursor(&inner.uri)?.insert(id.repr(), data)?;
        inner.change_num_records(Some(txn), 1);
        inner.increase_data_size(Some(txn), data.len() as i64);

        if let Some(stones) = &inner.stones {
            txn.register(Change::StoneInsert {
                stones: Arc::clone(stones),
                bytes: data.len() as i64,
                id,
            });
        } else if options.capped {
            capped::delete_as_needed(inner, id)?;
        }

        Ok(id)
    }

    /// Overwrites a record in place. Oplog records must keep their size.
    pub fn update(&self, txn: &mut Transaction, id: RecordId, data: &[u8]) -> Result<()> {
        let inner = &*self.inner;

        let mut cursor = txn.engine().cursor(&inner.uri)?;
        if !cursor.search(id.repr())? {
            return errdata!("updated record {id} not found");
        }
        let old_len = cursor.value()?.len() as i64;

        if inner.stones.is_some() && data.len() as i64 != old_len {
            return Err(Error::IllegalOperation(
                "cannot change the size of an oplog record".to_string(),
            ));
        }

        cursor.insert(id.repr(), data)?;
        drop(cursor);

        inner.increase_data_size(Some(txn), data.len() as i64 - old_len);
        if inner.options.capped && inner.stones.is_none() {
            capped::delete_as_needed(inner, id)?;
        }
        Ok(())
    }

    /// Deletes a single record. Capped records only leave through bulk
    /// truncation.
    pub fn delete(&self, txn: &mut Transaction, id: RecordId) -> Result<()> {
        let inner = &*self.inner;
        if inner.options.capped {
            return Err(Error::IllegalOperation(
                "cannot delete from a capped collection".to_string(),
            ));
        }

        let mut cursor = txn.engine().cursor(&inner.uri)?;
        if !cursor.search(id.repr())? {
            return errdata!("deleted record {id} not found");
        }
        let old_len = cursor.value()?.len() as i64;
        cursor.remove(id.repr())?;
        drop(cursor);

        inner.change_num_records(Some(txn), -1);
        inner.increase_data_size(Some(txn), -old_len);
        Ok(())
    }

    /// Point lookup.
    pub fn find(&self, txn: &Transaction, id: RecordId) -> Result<Option<Vec<u8>>> {
        let mut cursor = txn.engine().cursor(&self.inner.uri)?;
        if !cursor.search(id.repr())? {
            return Ok(None);
        }
        Ok(Some(cursor.value()?))
    }

    /// Point lookup for a record that must exist.
    pub fn data_for(&self, txn: &Transaction, id: RecordId) -> Result<Vec<u8>> {
        self.find(txn, id)?
            .ok_or_else(|| Error::InvalidData(format!("record {id} not found")))
    }

    /// Opens an ordered cursor. A forward cursor on an oplog pins the
    /// transaction's read boundary first, so the scan never runs past
    /// in-flight inserts.
    pub fn cursor(&self, txn: &mut Transaction, forward: bool) -> Result<Cursor> {
        let inner = &*self.inner;
        if inner.options.oplog && forward && txn.oplog_read_till().is_none() {
            txn.set_oplog_read_till(inner.uncommitted.read_boundary());
        }
        Cursor::new(txn, inner, forward)
    }

    /// Opens a cursor over uniformly random records.
    pub fn random_cursor(&self, txn: &Transaction) -> Result<RandomCursor> {
        Ok(RandomCursor::new(
            txn.engine().random_cursor(&self.inner.uri)?,
        ))
    }

    /// Empties the collection.
    pub fn truncate(&self, txn: &mut Transaction) -> Result<()> {
        let inner = &*self.inner;
        {
            let mut cursor = txn.engine().cursor(&inner.uri)?;
            if !cursor.next()? {
                return Ok(()); // already empty
            }
        }
        txn.engine().truncate_range(&inner.uri, None, None)?;

        inner.change_num_records(Some(txn), -inner.tracker.num_records());
        inner.increase_data_size(Some(txn), -inner.tracker.data_size());

        if let Some(stones) = &inner.stones {
            txn.register(Change::ClearStones {
                stones: Arc::clone(stones),
            });
        }
        Ok(())
    }

    /// Removes every record after `end` (and `end` itself when
    /// `inclusive`), invoking the capped-delete callback per record and
    /// reconciling oplog stones.
    pub fn capped_truncate_after(
        &self,
        txn: &mut Transaction,
        end: RecordId,
        inclusive: bool,
    ) -> Result<()> {
        let inner = &*self.inner;

        let mut cursor = self.cursor(txn, true)?;
        let Some(mut record) = cursor.seek_exact(end)? else {
            return errdata!("failed to seek to record {end}");
        };

        let mut first_removed = end;
        if !inclusive {
            match cursor.next()? {
                Some(next) => {
                    first_removed = next.id;
                    record = next;
                }
                None => return Ok(()), // nothing past end
            }
        }

        // Count what we're about to remove, giving the callback its
        // chance to veto.
        let mut records_removed = 0i64;
        let mut bytes_removed = 0i64;
        loop {
            if let Some(callback) = &inner.capped_callback {
                callback.about_to_delete(record.id, &record.data)?;
            }
            records_removed += 1;
            bytes_removed += record.data.len() as i64;
            match cursor.next()? {
                Some(next) => record = next,
                None => break,
            }
        }
        drop(cursor);

        txn.engine()
            .truncate_range(&inner.uri, Some(first_removed.repr()), None)?;
        inner.change_num_records(Some(txn), -records_removed);
        inner.increase_data_size(Some(txn), -bytes_removed);

        if let Some(stones) = &inner.stones {
            stones.update_after_capped_truncate(records_removed, bytes_removed, first_removed);
        }
        Ok(())
    }

    /// Verifies the table and, when `full`, recounts it and reconciles the
    /// size counters with the scan.
    pub fn validate(&self, txn: &mut Transaction, full: bool) -> Result<ValidateResults> {
        let inner = &*self.inner;
        let mut results = ValidateResults {
            valid: true,
            errors: Vec::new(),
            num_records: inner.tracker.num_records(),
            data_size: inner.tracker.data_size(),
        };

        if let Err(err) = inner.engine.verify(&inner.uri) {
            let msg = format!("table verification failed: {err}");
            error!(uri = %inner.uri, "{msg}");
            results.errors.push(msg);
            results.valid = false;
            return Ok(results);
        }

        if !full {
            return Ok(results);
        }

        let mut cursor = self.cursor(txn, true)?;
        let mut num_records = 0i64;
        let mut data_size = 0i64;
        while let Some(record) = cursor.next()? {
            num_records += 1;
            data_size += record.data.len() as i64;
        }

        if num_records != inner.tracker.num_records() || data_size != inner.tracker.data_size() {
            warn!(
                uri = %inner.uri,
                tracked_records = inner.tracker.num_records(),
                tracked_size = inner.tracker.data_size(),
                num_records,
                data_size,
                "size and count counters are inconsistent with scan results, updating"
            );
        }
        inner.tracker.set(num_records, data_size);
        results.num_records = num_records;
        results.data_size = data_size;
        Ok(results)
    }

    /// Overwrites the size counters with recomputed truth.
    pub fn update_stats_after_repair(&self, num_records: i64, data_size: i64) {
        self.inner.tracker.set(num_records, data_size);
    }

    /// Compacts the underlying table.
    pub fn compact(&self) -> Result<()> {
        self.inner.engine.compact(&self.inner.uri)
    }

    /// The greatest id at or before `starting`, for positioning an oplog
    /// scan. `None` when the collection doesn't extract oplog ids; the
    /// null id when nothing qualifies.
    pub fn oplog_start_position(
        &self,
        txn: &mut Transaction,
        starting: RecordId,
    ) -> Result<Option<RecordId>> {
        let inner = &*self.inner;
        if !inner.use_oplog_extraction {
            return Ok(None);
        }

        txn.set_oplog_read_till(inner.uncommitted.read_boundary());

        let mut cursor = txn.engine().cursor(&inner.uri)?;
        let found = match cursor.search_near(starting.repr())? {
            None => false,
            // Landed past `starting`; the previous record is the answer.
            Some(CmpOrdering::Greater) => cursor.prev()?,
            Some(_) => true,
        };
        if !found {
            return Ok(Some(RecordId::NULL));
        }
        Ok(Some(RecordId::new(cursor.key()?)))
    }

    /// Blocks until the oplog has excess stones to reclaim, or the store
    /// is shutting down. Returns false on shutdown (and immediately on
    /// non-oplog stores).
    pub fn await_oplog_reclaim_request(&self) -> bool {
        match &self.inner.stones {
            Some(stones) => {
                stones.await_excess_or_dead();
                !stones.is_dead()
            }
            None => false,
        }
    }

    /// Truncates excess oplog stones, oldest first, each under its own
    /// transaction. Conflicts are retried.
    pub fn reclaim_oplog(&self) -> Result<()> {
        let inner = &*self.inner;
        let Some(stones) = &inner.stones else {
            return Ok(());
        };

        while let Some(stone) = stones.peek_oldest_if_excess() {
            debug_assert!(stone.last_record.is_normal());
            let first = stones.first_record();
            debug!(
                uri = %inner.uri,
                first = %first,
                last = %stone.last_record,
                records = stone.records,
                bytes = stone.bytes,
                "truncating oplog range"
            );

            let mut side = Transaction::new(inner.engine.begin());
            let start = if first.is_null() {
                None
            } else {
                Some(first.repr())
            };
            match side
                .engine()
                .truncate_range(&inner.uri, start, Some(stone.last_record.repr()))
            {
                Ok(()) => {}
                Err(Error::Conflict) => {
                    debug!(uri = %inner.uri, "conflict truncating oplog range, retrying");
                    side.abort();
                    continue;
                }
                Err(err) => {
                    side.abort();
                    return Err(err);
                }
            }
            inner.change_num_records(Some(&mut side), -stone.records);
            inner.increase_data_size(Some(&mut side), -stone.bytes);
            match side.commit() {
                Ok(()) => {}
                Err(Error::Conflict) => {
                    debug!(uri = %inner.uri, "conflict truncating oplog range, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }

            stones.pop_oldest();
            stones.set_first_record(stone.last_record);
        }

        debug!(
            uri = %inner.uri,
            num_records = inner.tracker.num_records(),
            data_size = inner.tracker.data_size(),
            "finished truncating the oplog"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::oplog::{id_for_time, make_record};

    fn open_store(options: CollectionOptions) -> Result<RecordStore> {
        let engine = Arc::new(MemoryEngine::new());
        RecordStore::open(
            engine,
            "test.collection",
            "table:test.collection",
            options,
            None,
            None,
        )
    }

    fn insert_one(store: &RecordStore, data: &[u8]) -> Result<RecordId> {
        let mut txn = store.begin();
        let id = store.insert(&mut txn, data)?;
        txn.commit()?;
        Ok(id)
    }

    fn scan_forward(store: &RecordStore) -> Result<Vec<Record>> {
        let mut txn = store.begin();
        let mut cursor = store.cursor(&mut txn, true)?;
        let mut records = Vec::new();
        while let Some(record) = cursor.next()? {
            records.push(record);
        }
        Ok(records)
    }

    #[test]
    fn test_basic_roundtrip() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;

        assert_eq!(insert_one(&store, b"abc")?, RecordId::new(1));
        assert_eq!(insert_one(&store, b"de")?, RecordId::new(2));
        assert_eq!(insert_one(&store, b"f")?, RecordId::new(3));

        let forward = scan_forward(&store)?;
        assert_eq!(
            forward,
            vec![
                Record { id: RecordId::new(1), data: b"abc".to_vec() },
                Record { id: RecordId::new(2), data: b"de".to_vec() },
                Record { id: RecordId::new(3), data: b"f".to_vec() },
            ]
        );

        let mut txn = store.begin();
        let mut cursor = store.cursor(&mut txn, false)?;
        let mut reverse = Vec::new();
        while let Some(record) = cursor.next()? {
            reverse.push(record.id.repr());
        }
        assert_eq!(reverse, vec![3, 2, 1]);

        assert_eq!(store.data_size(), 6);
        assert_eq!(store.num_records(), 3);

        assert_eq!(store.find(&txn, RecordId::new(2))?, Some(b"de".to_vec()));
        assert_eq!(store.find(&txn, RecordId::new(9))?, None);
        assert_eq!(store.data_for(&txn, RecordId::new(1))?, b"abc".to_vec());
        assert!(store.data_for(&txn, RecordId::new(9)).is_err());
        Ok(())
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;

        let a = insert_one(&store, b"a")?;

        // An aborted insert burns its id permanently.
        let mut txn = store.begin();
        let burned = store.insert(&mut txn, b"burned")?;
        txn.abort();

        let b = insert_one(&store, b"b")?;
        assert!(a < burned && burned < b);

        let ids: Vec<_> = scan_forward(&store)?.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);
        Ok(())
    }

    #[test]
    fn test_rollback_undoes_counters() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;
        insert_one(&store, b"keep")?;
        let (num, size) = (store.num_records(), store.data_size());

        let mut txn = store.begin();
        store.insert(&mut txn, b"gone")?;
        assert_eq!(store.num_records(), num + 1);
        txn.abort();
        assert_eq!((store.num_records(), store.data_size()), (num, size));

        // Same for deletes.
        let mut txn = store.begin();
        store.delete(&mut txn, RecordId::new(1))?;
        assert_eq!(store.num_records(), num - 1);
        txn.abort();
        assert_eq!((store.num_records(), store.data_size()), (num, size));
        Ok(())
    }

    #[test]
    fn test_update_adjusts_size() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;
        let id = insert_one(&store, b"short")?;

        let mut txn = store.begin();
        store.update(&mut txn, id, b"much longer value")?;
        txn.commit()?;

        assert_eq!(store.data_size(), 17);
        let txn = store.begin();
        assert_eq!(store.data_for(&txn, id)?, b"much longer value".to_vec());
        Ok(())
    }

    #[test]
    fn test_delete_forbidden_on_capped() -> Result<()> {
        let store = open_store(CollectionOptions::capped(1024))?;
        let id = insert_one(&store, b"record")?;

        let mut txn = store.begin();
        assert!(matches!(
            store.delete(&mut txn, id),
            Err(Error::IllegalOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_capped_insert_too_large() -> Result<()> {
        let store = open_store(CollectionOptions::capped(8))?;
        let mut txn = store.begin();
        assert!(matches!(
            store.insert(&mut txn, b"way too large to fit"),
            Err(Error::RecordTooLarge(_))
        ));
        Ok(())
    }

    #[test]
    fn test_capped_eviction_by_bytes() -> Result<()> {
        let store = open_store(CollectionOptions::capped(10))?;

        for _ in 0..10 {
            insert_one(&store, b"abc")?;
        }

        // Eviction keeps the store within the cap plus slack, and always
        // removes the lowest ids first.
        let records = scan_forward(&store)?;
        let total: usize = records.iter().map(|r| r.data.len()).sum();
        assert!(total as i64 <= 10 + 2 * capped::slack_for(10));
        assert_eq!(
            records.iter().map(|r| r.id.repr()).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        assert_eq!(store.num_records(), 3);
        assert_eq!(store.data_size(), 9);
        Ok(())
    }

    #[test]
    fn test_capped_eviction_by_docs() -> Result<()> {
        let store = open_store(CollectionOptions::capped(1024).capped_max_docs(3))?;

        for i in 0..5u8 {
            insert_one(&store, &[i; 4])?;
        }

        let records = scan_forward(&store)?;
        assert_eq!(
            records.iter().map(|r| r.id.repr()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(store.num_records(), 3);
        Ok(())
    }

    struct CollectingCallback {
        seen: Arc<Mutex<Vec<RecordId>>>,
    }

    impl CappedDeleteCallback for CollectingCallback {
        fn about_to_delete(&self, id: RecordId, _data: &[u8]) -> Result<()> {
            self.seen.lock().push(id);
            Ok(())
        }
    }

    #[test]
    fn test_eviction_invokes_callback() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = RecordStore::open(
            Arc::new(MemoryEngine::new()),
            "test.capped",
            "table:test.capped",
            CollectionOptions::capped(10),
            None,
            Some(Box::new(CollectingCallback {
                seen: Arc::clone(&seen),
            })),
        )?;

        for _ in 0..5 {
            insert_one(&store, b"abc")?;
        }
        let seen = seen.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|id| id.repr() < 5));
        Ok(())
    }

    #[test]
    fn test_uncommitted_insert_hidden_from_capped_readers() -> Result<()> {
        let store = open_store(CollectionOptions::capped(1024))?;
        insert_one(&store, b"one")?;

        let mut writer = store.begin();
        let two = store.insert(&mut writer, b"two")?;

        // A concurrent reader must not see past the uncommitted insert.
        let records = scan_forward(&store)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, RecordId::new(1));

        // Even the inserting transaction's own cursor stops short of it:
        // the id is hidden until the insert commits.
        let mut cursor = store.cursor(&mut writer, true)?;
        assert_eq!(cursor.next()?.map(|r| r.id), Some(RecordId::new(1)));
        assert_eq!(cursor.next()?, None);
        drop(cursor);

        writer.commit()?;
        assert!(store.find(&store.begin(), two)?.is_some());
        assert_eq!(scan_forward(&store)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_oplog_cursor_read_boundary() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let mut txn = store.begin();
        store.insert(&mut txn, &make_record(1, 0, b"first")?)?;
        txn.commit()?;

        // Pin a reader's boundary now, then commit a later record.
        let mut reader = store.begin();
        let mut cursor = store.cursor(&mut reader, true)?;

        let mut writer = store.begin();
        store.insert(&mut writer, &make_record(2, 0, b"second")?)?;
        writer.commit()?;

        // The reader sees only up to its pinned boundary.
        assert_eq!(cursor.next()?.map(|r| r.id), Some(id_for_time(1, 0)?));
        assert_eq!(cursor.next()?, None);

        // A fresh cursor sees both.
        let mut txn = store.begin();
        let mut cursor = store.cursor(&mut txn, true)?;
        assert_eq!(cursor.next()?.map(|r| r.id), Some(id_for_time(1, 0)?));
        assert_eq!(cursor.next()?.map(|r| r.id), Some(id_for_time(2, 0)?));
        Ok(())
    }

    #[test]
    fn test_capped_restore_detects_evicted_position() -> Result<()> {
        let store = open_store(CollectionOptions::capped(10))?;
        insert_one(&store, b"abc")?;
        insert_one(&store, b"def")?;

        let mut reader = store.begin();
        let mut cursor = store.cursor(&mut reader, true)?;
        assert_eq!(cursor.next()?.map(|r| r.id.repr()), Some(1));
        cursor.save();
        drop(reader);

        // Force record 1 out of the collection.
        while store.find(&store.begin(), RecordId::new(1))?.is_some() {
            insert_one(&store, b"xyz")?;
        }

        // Restoring on the evicted record must fail rather than skip.
        let reader = store.begin();
        assert!(!cursor.restore(&reader)?);
        Ok(())
    }

    #[test]
    fn test_plain_restore_skips_deleted_position() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;
        for data in [b"a", b"b", b"c"] {
            insert_one(&store, data)?;
        }

        let mut reader = store.begin();
        let mut cursor = store.cursor(&mut reader, true)?;
        assert_eq!(cursor.next()?.map(|r| r.id.repr()), Some(1));
        assert_eq!(cursor.next()?.map(|r| r.id.repr()), Some(2));
        cursor.save();
        drop(reader);

        let mut txn = store.begin();
        store.delete(&mut txn, RecordId::new(2))?;
        txn.commit()?;

        // Plain collections adjust silently and continue.
        let reader = store.begin();
        assert!(cursor.restore(&reader)?);
        assert_eq!(cursor.next()?.map(|r| r.id.repr()), Some(3));
        Ok(())
    }

    #[test]
    fn test_oplog_stones_and_reclaim() -> Result<()> {
        // 1 MiB cap: ten stones to keep, ~100 KiB per stone.
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let stones = Arc::clone(store.oplog_stones().expect("oplog has stones"));
        assert_eq!(stones.min_bytes_per_stone(), (1 << 20) / 10);

        // 250 records of exactly 1 KiB.
        for i in 0..250u32 {
            let record = make_record(1, i + 1, &[0u8; 1016])?;
            assert_eq!(record.len(), 1024);
            insert_one(&store, &record)?;
        }

        // floor(250 KiB / ~102 KiB per stone) stones, remainder accumulating.
        assert_eq!(stones.num_stones(), 2);
        let stone_records: i64 = stones.stones().iter().map(|s| s.records).sum();
        assert_eq!(stone_records + stones.current_records(), 250);
        assert_eq!(
            stones.stones().iter().map(|s| s.bytes).sum::<i64>() + stones.current_bytes(),
            store.data_size()
        );

        // Tighten the keep bound and reclaim: only one stone may survive.
        stones.set_num_stones_to_keep(1);
        store.reclaim_oplog()?;
        assert_eq!(stones.num_stones(), 1);

        // The remaining records are a contiguous tail.
        let records = scan_forward(&store)?;
        assert_eq!(records.len() as i64, store.num_records());
        let first_ordinal = 250 - records.len() as u32 + 1;
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id, id_for_time(1, first_ordinal + i as u32)?);
        }
        Ok(())
    }

    #[test]
    fn test_capped_truncate_after() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let stones = Arc::clone(store.oplog_stones().expect("oplog has stones"));
        // Cut a stone roughly every 10 records.
        stones.set_min_bytes_per_stone(10 * 1024);

        for i in 0..100u32 {
            insert_one(&store, &make_record(1, i + 1, &[0u8; 1016])?)?;
        }
        assert_eq!(store.num_records(), 100);
        let stones_before = stones.num_stones();
        assert!(stones_before > 0);

        let mut txn = store.begin();
        store.capped_truncate_after(&mut txn, id_for_time(1, 70)?, false)?;
        txn.commit()?;

        assert_eq!(store.num_records(), 70);
        let records = scan_forward(&store)?;
        assert_eq!(records.len(), 70);
        assert_eq!(records.last().map(|r| r.id), Some(id_for_time(1, 70)?));

        // Stones past the truncate point are gone, and the accounting
        // still covers exactly what's stored.
        assert!(stones.num_stones() < stones_before);
        assert!(stones
            .stones()
            .iter()
            .all(|s| s.last_record < id_for_time(1, 71).unwrap()));
        assert_eq!(
            stones.stones().iter().map(|s| s.records).sum::<i64>() + stones.current_records(),
            70
        );
        Ok(())
    }

    #[test]
    fn test_truncate_empties_store_and_stones() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let stones = Arc::clone(store.oplog_stones().expect("oplog has stones"));
        stones.set_min_bytes_per_stone(2 * 1024);

        for i in 0..10u32 {
            insert_one(&store, &make_record(1, i + 1, &[0u8; 1016])?)?;
        }
        assert!(stones.num_stones() > 0);

        let mut txn = store.begin();
        store.truncate(&mut txn)?;
        txn.commit()?;

        assert_eq!(store.num_records(), 0);
        assert_eq!(store.data_size(), 0);
        assert_eq!(stones.num_stones(), 0);
        assert_eq!(stones.current_records(), 0);
        assert!(scan_forward(&store)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_oplog_update_must_keep_size() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let record = make_record(1, 1, b"payload")?;
        let id = insert_one(&store, &record)?;

        let mut txn = store.begin();
        assert!(matches!(
            store.update(&mut txn, id, &make_record(1, 1, b"longer payload")?),
            Err(Error::IllegalOperation(_))
        ));

        // Same-size updates are fine.
        store.update(&mut txn, id, &make_record(1, 1, b"PAYLOAD")?)?;
        txn.commit()?;
        Ok(())
    }

    #[test]
    fn test_oplog_rejects_malformed_ids() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        let mut txn = store.begin();
        assert!(matches!(
            store.insert(&mut txn, b"short"),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_oplog_start_position() -> Result<()> {
        let store = open_store(CollectionOptions::oplog(1 << 20))?;
        for secs in [10u32, 20, 30] {
            insert_one(&store, &make_record(secs, 0, b"x")?)?;
        }

        let mut txn = store.begin();
        // Exact hit.
        assert_eq!(
            store.oplog_start_position(&mut txn, id_for_time(20, 0)?)?,
            Some(id_for_time(20, 0)?)
        );
        // Between records: greatest at or before.
        assert_eq!(
            store.oplog_start_position(&mut txn, id_for_time(25, 0)?)?,
            Some(id_for_time(20, 0)?)
        );
        // Before everything.
        assert_eq!(
            store.oplog_start_position(&mut txn, id_for_time(5, 0)?)?,
            Some(RecordId::NULL)
        );

        // Plain collections have no oplog positioning.
        let plain = open_store(CollectionOptions::new())?;
        let mut txn = plain.begin();
        assert_eq!(plain.oplog_start_position(&mut txn, RecordId::new(1))?, None);
        Ok(())
    }

    #[test]
    fn test_validate_repairs_counters() -> Result<()> {
        let store = open_store(CollectionOptions::new())?;
        for data in [b"abc".as_slice(), b"defg", b"h"] {
            insert_one(&store, data)?;
        }

        // Skew the counters, then let a full validation repair them.
        store.update_stats_after_repair(17, 1234);
        let mut txn = store.begin();
        let results = store.validate(&mut txn, true)?;
        assert!(results.valid);
        assert_eq!(results.num_records, 3);
        assert_eq!(results.data_size, 8);
        assert_eq!(store.num_records(), 3);
        assert_eq!(store.data_size(), 8);
        Ok(())
    }

    /// Engine wrapper whose verification always fails, as over a damaged
    /// table.
    struct CorruptEngine(MemoryEngine);

    impl Engine for CorruptEngine {
        fn create_table(&self, uri: &str, config: &str) -> Result<()> {
            self.0.create_table(uri, config)
        }
        fn begin(&self) -> Box<dyn crate::engine::EngineTransaction> {
            self.0.begin()
        }
        fn app_metadata(&self, uri: &str) -> Result<std::collections::BTreeMap<String, i32>> {
            self.0.app_metadata(uri)
        }
        fn verify(&self, uri: &str) -> Result<()> {
            Err(Error::Corrupt(format!("table {uri} failed verification")))
        }
        fn compact(&self, uri: &str) -> Result<()> {
            self.0.compact(uri)
        }
    }

    #[test]
    fn test_validate_reports_corruption_and_proceeds() -> Result<()> {
        let store = RecordStore::open(
            Arc::new(CorruptEngine(MemoryEngine::new())),
            "test.corrupt",
            "table:test.corrupt",
            CollectionOptions::new(),
            None,
            None,
        )?;
        insert_one(&store, b"abc")?;

        // Validation reports the damage and returns instead of erroring.
        let mut txn = store.begin();
        let results = store.validate(&mut txn, true)?;
        assert!(!results.valid);
        assert_eq!(results.errors.len(), 1);
        assert!(results.errors[0].contains("verification"));
        Ok(())
    }

    #[test]
    fn test_open_recovers_counters_and_next_id() -> Result<()> {
        let engine = Arc::new(MemoryEngine::new());
        {
            let store = RecordStore::open(
                Arc::clone(&engine) as Arc<dyn Engine>,
                "test.reopen",
                "table:test.reopen",
                CollectionOptions::new(),
                None,
                None,
            )?;
            for data in [b"aa".as_slice(), b"bbb"] {
                insert_one(&store, data)?;
            }
        }

        // Reopening scans the table: counters and the id allocator resume
        // where they left off.
        let store = RecordStore::open(
            Arc::clone(&engine) as Arc<dyn Engine>,
            "test.reopen",
            "table:test.reopen",
            CollectionOptions::new(),
            None,
            None,
        )?;
        assert_eq!(store.num_records(), 2);
        assert_eq!(store.data_size(), 5);
        assert_eq!(insert_one(&store, b"c")?, RecordId::new(3));
        Ok(())
    }

    #[test]
    fn test_unsupported_format_version() -> Result<()> {
        let engine = Arc::new(MemoryEngine::new());
        // A table created by some future version of the code.
        engine.create_table(
            "table:test.future",
            "key_format=q,value_format=u,app_metadata=(formatVersion=2)",
        )?;

        let result = RecordStore::open(
            engine,
            "test.future",
            "table:test.future",
            CollectionOptions::new(),
            None,
            None,
        );
        assert_eq!(result.err(), Some(Error::UnsupportedVersion(2)));
        Ok(())
    }

    #[test]
    fn test_create_config_shape() -> Result<()> {
        let config = generate_create_config(&CollectionOptions::new())?;
        assert_eq!(
            config,
            "type=file,memory_page_max=10m,split_pct=90,leaf_value_max=64MB,checksum=on,\
             block_compressor=snappy,key_format=q,value_format=u,app_metadata=(formatVersion=1)"
        );

        let config = generate_create_config(&CollectionOptions::oplog(1 << 20))?;
        assert!(config.contains("type=file,memory_page_max=10m,key_format=q"));
        assert!(config.ends_with("app_metadata=(formatVersion=1,oplogKeyExtractionVersion=1)"));

        let config = generate_create_config(
            &CollectionOptions::new().storage_option("configString", "cache_resident=true"),
        )?;
        assert!(config.contains("cache_resident=true,"));

        assert!(matches!(
            generate_create_config(&CollectionOptions::new().storage_option("bogus", "1")),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_capped_options() {
        assert!(open_store(CollectionOptions::capped(0)).is_err());
        assert!(open_store(CollectionOptions::capped(100).capped_max_docs(0)).is_err());
        assert!(open_store(CollectionOptions::new().capped_max_docs(5)).is_err());
    }

    #[test]
    fn test_random_cursor_and_stats() -> Result<()> {
        let store = open_store(CollectionOptions::capped(1024))?;
        for i in 0..5u8 {
            insert_one(&store, &[i; 8])?;
        }

        let txn = store.begin();
        let mut cursor = store.random_cursor(&txn)?;
        for _ in 0..10 {
            let record = cursor.next()?.expect("store is not empty");
            assert!((1..=5).contains(&record.id.repr()));
        }

        let stats = store.stats();
        assert!(stats.capped);
        assert_eq!(stats.capped_max_bytes, 1024);
        assert_eq!(stats.capped_max_docs, -1);
        assert_eq!(stats.num_records, 5);
        assert_eq!(stats.data_size, 40);
        Ok(())
    }

    #[test]
    fn test_size_storer_roundtrip_through_open() -> Result<()> {
        use crate::store::size::FileSizeStorer;
        use crate::tmpfs::TempDir;

        let dir = TempDir::new()?;
        let engine = Arc::new(MemoryEngine::new());
        let storer: Arc<dyn SizeStorer> = Arc::new(FileSizeStorer::open(dir.file("sizes"))?);

        {
            let store = RecordStore::open(
                Arc::clone(&engine) as Arc<dyn Engine>,
                "test.sized",
                "table:test.sized",
                CollectionOptions::new(),
                Some(Arc::clone(&storer)),
                None,
            )?;
            insert_one(&store, b"hello")?;
        } // drop pushes the counters into the storer

        let store = RecordStore::open(
            engine,
            "test.sized",
            "table:test.sized",
            CollectionOptions::new(),
            Some(storer),
            None,
        )?;
        assert_eq!(store.num_records(), 1);
        assert_eq!(store.data_size(), 5);
        Ok(())
    }
}
