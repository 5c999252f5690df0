//! Contract over the underlying ordered key/value engine.
//!
//! The record store only assumes an engine that can open tables keyed by
//! 64-bit integers, position cursors within them, and truncate key ranges
//! in bulk. Transactions are the engine's: `begin` hands back an isolated
//! write buffer that either commits atomically or reports a conflict for
//! the caller to retry.
//!
//! Cursor positioning follows the usual ordered-engine rules: a fresh or
//! reset cursor is unpositioned, `next` from unpositioned lands on the
//! first key and `prev` on the last. "Not found" is an ordinary outcome
//! (`Ok(false)` / `Ok(None)`), never an error; `Error::Conflict` is the
//! transient signal that the operation lost against a concurrent writer.

pub mod memory;

pub use memory::MemoryEngine;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::Result;

/// An ordered key/value engine hosting one table per URI.
pub trait Engine: Send + Sync {
    /// Creates the table for `uri` with the given creation config if it
    /// does not already exist. Opening an existing table keeps whatever
    /// config it was created with.
    fn create_table(&self, uri: &str, config: &str) -> Result<()>;

    /// Begins a new transaction.
    fn begin(&self) -> Box<dyn EngineTransaction>;

    /// Returns the application metadata stored in the table's creation
    /// config, as integer key/value pairs.
    fn app_metadata(&self, uri: &str) -> Result<BTreeMap<String, i32>>;

    /// Verifies the table's structural integrity, reporting damage as
    /// `Error::Corrupt`.
    fn verify(&self, uri: &str) -> Result<()>;

    /// Compacts the table's storage.
    fn compact(&self, uri: &str) -> Result<()>;
}

/// A single engine transaction. Writes are buffered until `commit`, which
/// either applies them atomically or fails with `Error::Conflict` when a
/// concurrent transaction got there first.
pub trait EngineTransaction: Send {
    /// Opens a positioned cursor over the table.
    fn cursor(&self, uri: &str) -> Result<Box<dyn EngineCursor>>;

    /// Opens a cursor whose `next` returns uniformly random records
    /// instead of advancing in key order.
    fn random_cursor(&self, uri: &str) -> Result<Box<dyn EngineCursor>>;

    /// Removes every record with `start <= key <= end`; `None` bounds are
    /// open-ended. Reports not-found data as `Error::InvalidData`.
    fn truncate_range(&self, uri: &str, start: Option<i64>, end: Option<i64>) -> Result<()>;

    /// Commits the transaction's buffered writes.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discards the transaction's buffered writes.
    fn rollback(self: Box<Self>);
}

/// A positioned cursor over one table, valid only within the transaction
/// that created it. Callers must not carry a cursor across a transaction
/// boundary; they re-open instead.
pub trait EngineCursor: Send {
    /// Positions on `key` exactly. Returns false (unpositioned) if absent.
    fn search(&mut self, key: i64) -> Result<bool>;

    /// Positions on the nearest key to `key`, preferring an exact match.
    /// The returned ordering compares the landed key against `key`
    /// (`Greater` means it landed past it). `None` if the table has no
    /// reachable key at all.
    fn search_near(&mut self, key: i64) -> Result<Option<Ordering>>;

    /// Advances to the next key; from unpositioned, lands on the first.
    /// Returns false at the end of the table.
    fn next(&mut self) -> Result<bool>;

    /// Steps to the previous key; from unpositioned, lands on the last.
    /// Returns false at the start of the table.
    fn prev(&mut self) -> Result<bool>;

    /// The key the cursor is positioned on.
    fn key(&self) -> Result<i64>;

    /// The value the cursor is positioned on.
    fn value(&self) -> Result<Vec<u8>>;

    /// Inserts or overwrites `key`. Does not reposition the cursor.
    fn insert(&mut self, key: i64, value: &[u8]) -> Result<()>;

    /// Removes `key`, which must exist in this transaction's view.
    fn remove(&mut self, key: i64) -> Result<()>;

    /// Clears the cursor's position.
    fn reset(&mut self);
}
