//! In-memory ordered engine.
//!
//! Tables are lock-free skiplists keyed by the order-preserving key
//! encoding. Transactions buffer their writes in a private ordered map
//! and apply them under a global commit lock with first-committer-wins
//! validation: if any buffered key was overwritten or removed by a
//! transaction that committed after ours began, the commit fails with
//! `Error::Conflict` and the caller retries.
//!
//! Cursors merge the committed table with the owning transaction's write
//! buffer, so a transaction observes its own uncommitted writes while
//! everyone else sees only committed state.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use super::{Engine, EngineCursor, EngineTransaction};
use crate::encoding::keycode;
use crate::errdata;
use crate::error::{Error, Result};

/// An in-memory engine. Cheap to create, shared through an `Arc`.
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Monotonic sequence stamped onto every commit.
    commit_seq: AtomicU64,
    /// Serializes commit validation and apply.
    commit_lock: Mutex<()>,
}

struct Table {
    config: String,
    rows: SkipMap<Vec<u8>, Row>,
    /// Keys removed by committed transactions, with the removing sequence.
    /// Kept so later commits can detect that a key they wrote was deleted
    /// out from under them.
    tombstones: SkipMap<Vec<u8>, u64>,
}

#[derive(Clone)]
struct Row {
    value: Vec<u8>,
    seq: u64,
}

/// Per-transaction write buffer, shared with the cursors it spawns.
/// `None` values are tombstones.
struct TxnState {
    begin_seq: u64,
    writes: Mutex<HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tables: RwLock::new(HashMap::new()),
                commit_seq: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
            }),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInner {
    fn table(&self, uri: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(uri)
            .cloned()
            .ok_or(Error::InvalidData(format!("no table at {uri}")))
    }
}

impl Engine for MemoryEngine {
    fn create_table(&self, uri: &str, config: &str) -> Result<()> {
        let mut tables = self.inner.tables.write();
        tables.entry(uri.to_string()).or_insert_with(|| {
            Arc::new(Table {
                config: config.to_string(),
                rows: SkipMap::new(),
                tombstones: SkipMap::new(),
            })
        });
        Ok(())
    }

    fn begin(&self) -> Box<dyn EngineTransaction> {
        Box::new(MemoryTransaction {
            engine: Arc::clone(&self.inner),
            state: Arc::new(TxnState {
                begin_seq: self.inner.commit_seq.load(AtomicOrdering::SeqCst),
                writes: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn app_metadata(&self, uri: &str) -> Result<BTreeMap<String, i32>> {
        let table = self.inner.table(uri)?;
        let mut metadata = BTreeMap::new();
        let Some(start) = table.config.find("app_metadata=(") else {
            return Ok(metadata);
        };
        let body = &table.config[start + "app_metadata=(".len()..];
        let Some(end) = body.find(')') else {
            return errdata!("unterminated app_metadata in config for {uri}");
        };
        for pair in body[..end].split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return errdata!("malformed app_metadata entry {pair:?} for {uri}");
            };
            let value: i32 = value
                .parse()
                .map_err(|_| Error::InvalidData(format!("non-integer app_metadata value {pair:?}")))?;
            metadata.insert(key.to_string(), value);
        }
        Ok(metadata)
    }

    fn verify(&self, uri: &str) -> Result<()> {
        let table = self.inner.table(uri)?;
        for entry in table.rows.iter() {
            if entry.key().len() != keycode::KEY_SIZE {
                return Err(Error::Corrupt(format!(
                    "table {uri} holds a key of {} bytes, expected {}",
                    entry.key().len(),
                    keycode::KEY_SIZE
                )));
            }
        }
        Ok(())
    }

    fn compact(&self, uri: &str) -> Result<()> {
        self.inner.table(uri)?;
        Ok(())
    }
}

pub struct MemoryTransaction {
    engine: Arc<EngineInner>,
    state: Arc<TxnState>,
}

impl EngineTransaction for MemoryTransaction {
    fn cursor(&self, uri: &str) -> Result<Box<dyn EngineCursor>> {
        let table = self.engine.table(uri)?;
        Ok(Box::new(MemoryCursor {
            table,
            uri: uri.to_string(),
            txn: Arc::clone(&self.state),
            pos: None,
        }))
    }

    fn random_cursor(&self, uri: &str) -> Result<Box<dyn EngineCursor>> {
        let table = self.engine.table(uri)?;
        Ok(Box::new(RandomCursor { table, pos: None }))
    }

    fn truncate_range(&self, uri: &str, start: Option<i64>, end: Option<i64>) -> Result<()> {
        let mut cursor = self.cursor(uri)?;
        let positioned = match start {
            Some(s) => match cursor.search_near(s)? {
                None => false,
                // Landed before the range; step into it.
                Some(Ordering::Less) => cursor.next()?,
                Some(_) => true,
            },
            None => cursor.next()?,
        };

        let mut keys = Vec::new();
        if positioned {
            loop {
                let key = cursor.key()?;
                if let Some(e) = end {
                    if key > e {
                        break;
                    }
                }
                keys.push(key);
                if !cursor.next()? {
                    break;
                }
            }
        }
        if keys.is_empty() {
            return errdata!("truncate found no records between {start:?} and {end:?}");
        }

        let mut writes = self.state.writes.lock();
        let table_writes = writes.entry(uri.to_string()).or_default();
        for key in keys {
            table_writes.insert(keycode::encode_integer(key).to_vec(), None);
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let writes = std::mem::take(&mut *self.state.writes.lock());
        if writes.is_empty() {
            return Ok(());
        }

        let _commit = self.engine.commit_lock.lock();

        // First committer wins: any key we buffered that was committed to
        // after we began means we lost the race.
        for (uri, table_writes) in &writes {
            let table = self.engine.table(uri)?;
            for key in table_writes.keys() {
                if let Some(entry) = table.rows.get(key) {
                    if entry.value().seq > self.state.begin_seq {
                        return Err(Error::Conflict);
                    }
                }
                if let Some(entry) = table.tombstones.get(key) {
                    if *entry.value() > self.state.begin_seq {
                        return Err(Error::Conflict);
                    }
                }
            }
        }

        let seq = self.engine.commit_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        for (uri, table_writes) in writes {
            let table = self.engine.table(&uri)?;
            for (key, value) in table_writes {
                match value {
                    Some(value) => {
                        table.rows.insert(key, Row { value, seq });
                    }
                    None => {
                        table.rows.remove(&key);
                        table.tombstones.insert(key, seq);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.state.writes.lock().clear();
    }
}

/// Outcome of merging the committed table with the write buffer at one key.
enum Merged {
    /// Nearest key only exists in the committed table.
    Row(Vec<u8>),
    /// Nearest key has a buffered write (value or tombstone), which wins.
    Buffered(Vec<u8>, Option<Vec<u8>>),
}

struct MemoryCursor {
    table: Arc<Table>,
    uri: String,
    txn: Arc<TxnState>,
    pos: Option<Vec<u8>>,
}

impl MemoryCursor {
    /// Reads the value at `key` as this transaction sees it: the write
    /// buffer shadows the committed table, and a buffered tombstone hides
    /// the key entirely.
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        {
            let writes = self.txn.writes.lock();
            if let Some(buffered) = writes.get(&self.uri).and_then(|m| m.get(key)) {
                return buffered.clone();
            }
        }
        self.table.rows.get(key).map(|e| e.value().value.clone())
    }

    /// Finds the nearest visible record past `bound` in the given
    /// direction, skipping buffered tombstones.
    fn step(&self, mut bound: Bound<Vec<u8>>, forward: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            let row_key = if forward {
                self.table
                    .rows
                    .lower_bound(slice_bound(&bound))
                    .map(|e| e.key().clone())
            } else {
                self.table
                    .rows
                    .upper_bound(slice_bound(&bound))
                    .map(|e| e.key().clone())
            };

            let buffered = {
                let writes = self.txn.writes.lock();
                writes.get(&self.uri).and_then(|m| {
                    let mut range = if forward {
                        m.range::<[u8], _>((slice_bound(&bound), Bound::Unbounded))
                    } else {
                        m.range::<[u8], _>((Bound::Unbounded, slice_bound(&bound)))
                    };
                    let entry = if forward { range.next() } else { range.next_back() };
                    entry.map(|(k, v)| (k.clone(), v.clone()))
                })
            };

            let merged = match (row_key, buffered) {
                (None, None) => return None,
                (Some(rk), None) => Merged::Row(rk),
                (None, Some((bk, bv))) => Merged::Buffered(bk, bv),
                (Some(rk), Some((bk, bv))) => {
                    // On a tie the buffered write shadows the row.
                    let pick_buffered = if forward { bk <= rk } else { bk >= rk };
                    if pick_buffered {
                        Merged::Buffered(bk, bv)
                    } else {
                        Merged::Row(rk)
                    }
                }
            };

            match merged {
                Merged::Buffered(key, Some(value)) => return Some((key, value)),
                Merged::Buffered(key, None) => {
                    // Tombstone: skip this key in both sources.
                    bound = Bound::Excluded(key);
                    continue;
                }
                Merged::Row(key) => match self.table.rows.get(&key) {
                    Some(entry) => return Some((key, entry.value().value.clone())),
                    // Row vanished between peeks; move past it.
                    None => {
                        bound = Bound::Excluded(key);
                        continue;
                    }
                },
            }
        }
    }
}

fn slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl EngineCursor for MemoryCursor {
    fn search(&mut self, key: i64) -> Result<bool> {
        let encoded = keycode::encode_integer(key).to_vec();
        if self.lookup(&encoded).is_some() {
            self.pos = Some(encoded);
            Ok(true)
        } else {
            self.pos = None;
            Ok(false)
        }
    }

    fn search_near(&mut self, key: i64) -> Result<Option<Ordering>> {
        let encoded = keycode::encode_integer(key).to_vec();
        if self.lookup(&encoded).is_some() {
            self.pos = Some(encoded);
            return Ok(Some(Ordering::Equal));
        }
        if let Some((next, _)) = self.step(Bound::Excluded(encoded.clone()), true) {
            self.pos = Some(next);
            return Ok(Some(Ordering::Greater));
        }
        if let Some((prev, _)) = self.step(Bound::Excluded(encoded), false) {
            self.pos = Some(prev);
            return Ok(Some(Ordering::Less));
        }
        self.pos = None;
        Ok(None)
    }

    fn next(&mut self) -> Result<bool> {
        let bound = match self.pos.take() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        match self.step(bound, true) {
            Some((key, _)) => {
                self.pos = Some(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn prev(&mut self) -> Result<bool> {
        let bound = match self.pos.take() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        match self.step(bound, false) {
            Some((key, _)) => {
                self.pos = Some(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn key(&self) -> Result<i64> {
        match &self.pos {
            Some(key) => keycode::decode_integer(key),
            None => errdata!("cursor is not positioned"),
        }
    }

    fn value(&self) -> Result<Vec<u8>> {
        let Some(pos) = &self.pos else {
            return errdata!("cursor is not positioned");
        };
        match self.lookup(pos) {
            Some(value) => Ok(value),
            None => errdata!("cursor is no longer positioned on a record"),
        }
    }

    fn insert(&mut self, key: i64, value: &[u8]) -> Result<()> {
        let mut writes = self.txn.writes.lock();
        writes
            .entry(self.uri.clone())
            .or_default()
            .insert(keycode::encode_integer(key).to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn remove(&mut self, key: i64) -> Result<()> {
        let encoded = keycode::encode_integer(key).to_vec();
        if self.lookup(&encoded).is_none() {
            return errdata!("no record at key {key}");
        }
        let mut writes = self.txn.writes.lock();
        writes
            .entry(self.uri.clone())
            .or_default()
            .insert(encoded, None);
        Ok(())
    }

    fn reset(&mut self) {
        self.pos = None;
    }
}

/// Cursor returning uniformly random committed records. Only `next`,
/// `key`, and `value` are meaningful.
struct RandomCursor {
    table: Arc<Table>,
    pos: Option<Vec<u8>>,
}

impl EngineCursor for RandomCursor {
    fn search(&mut self, _key: i64) -> Result<bool> {
        errdata!("search is not supported on a random cursor")
    }

    fn search_near(&mut self, _key: i64) -> Result<Option<Ordering>> {
        errdata!("search_near is not supported on a random cursor")
    }

    fn next(&mut self) -> Result<bool> {
        let len = self.table.rows.len();
        if len == 0 {
            self.pos = None;
            return Ok(false);
        }
        let index = rand::thread_rng().gen_range(0..len);
        match self.table.rows.iter().nth(index) {
            Some(entry) => {
                self.pos = Some(entry.key().clone());
                Ok(true)
            }
            None => {
                self.pos = None;
                Ok(false)
            }
        }
    }

    fn prev(&mut self) -> Result<bool> {
        errdata!("prev is not supported on a random cursor")
    }

    fn key(&self) -> Result<i64> {
        match &self.pos {
            Some(key) => keycode::decode_integer(key),
            None => errdata!("cursor is not positioned"),
        }
    }

    fn value(&self) -> Result<Vec<u8>> {
        let Some(pos) = &self.pos else {
            return errdata!("cursor is not positioned");
        };
        match self.table.rows.get(pos) {
            Some(entry) => Ok(entry.value().value.clone()),
            None => errdata!("cursor is no longer positioned on a record"),
        }
    }

    fn insert(&mut self, _key: i64, _value: &[u8]) -> Result<()> {
        errdata!("insert is not supported on a random cursor")
    }

    fn remove(&mut self, _key: i64) -> Result<()> {
        errdata!("remove is not supported on a random cursor")
    }

    fn reset(&mut self) {
        self.pos = None;
    }
}
