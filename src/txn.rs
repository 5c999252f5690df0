//! Transactions and their commit/rollback hooks.
//!
//! A `Transaction` pairs an engine transaction with a list of registered
//! `Change` hooks. The record store registers a hook whenever an
//! operation's in-memory side effects must follow the transaction's fate:
//! uncommitted ids leave the visibility registry on either outcome, size
//! counters are undone on rollback, and stone accounting only happens once
//! the insert is durable. Hooks hold `Arc` handles to the state they
//! touch, so they stay safe even if the record store is shut down before
//! the transaction resolves.

use std::sync::Arc;

use crate::engine::EngineTransaction;
use crate::error::Result;
use crate::store::size::SizeTracker;
use crate::store::stones::OplogStones;
use crate::store::visibility::UncommittedIds;
use crate::store::RecordId;

/// A registered commit/rollback hook. Dispatch is a flat match on the
/// transaction's outcome.
pub(crate) enum Change {
    /// A capped or oplog insert: the id leaves the visibility registry on
    /// either outcome.
    CappedInsert {
        ids: Arc<UncommittedIds>,
        id: RecordId,
    },
    /// A record count delta, undone on rollback.
    NumRecords {
        tracker: Arc<SizeTracker>,
        diff: i64,
    },
    /// A data size delta, undone on rollback.
    DataSize {
        tracker: Arc<SizeTracker>,
        amount: i64,
    },
    /// An oplog insert: feeds the stone accumulator once durable.
    StoneInsert {
        stones: Arc<OplogStones>,
        bytes: i64,
        id: RecordId,
    },
    /// A collection truncate: drops all stones once durable.
    ClearStones { stones: Arc<OplogStones> },
}

impl Change {
    fn commit(self) {
        match self {
            Change::CappedInsert { ids, id } => ids.remove(id),
            Change::NumRecords { .. } => {}
            Change::DataSize { .. } => {}
            Change::StoneInsert { stones, bytes, id } => stones.record_committed_insert(bytes, id),
            Change::ClearStones { stones } => stones.clear(),
        }
    }

    fn rollback(self) {
        match self {
            Change::CappedInsert { ids, id } => ids.remove(id),
            Change::NumRecords { tracker, diff } => tracker.apply_num_records(-diff),
            Change::DataSize { tracker, amount } => tracker.apply_data_size(-amount),
            Change::StoneInsert { .. } => {}
            Change::ClearStones { .. } => {}
        }
    }
}

/// A transaction over one engine, carrying the record store's registered
/// hooks. Dropping an unresolved transaction aborts it.
pub struct Transaction {
    engine_txn: Option<Box<dyn EngineTransaction>>,
    changes: Vec<Change>,
    oplog_read_till: Option<RecordId>,
}

impl Transaction {
    pub fn new(engine_txn: Box<dyn EngineTransaction>) -> Self {
        Self {
            engine_txn: Some(engine_txn),
            changes: Vec::new(),
            oplog_read_till: None,
        }
    }

    /// Commits the engine transaction, then runs commit hooks in
    /// registration order. If the engine reports a conflict, rollback
    /// hooks run instead and the error is returned.
    pub fn commit(mut self) -> Result<()> {
        let engine_txn = self.engine_txn.take().expect("transaction already resolved");
        match engine_txn.commit() {
            Ok(()) => {
                for change in self.changes.drain(..) {
                    change.commit();
                }
                Ok(())
            }
            Err(err) => {
                for change in self.changes.drain(..).rev() {
                    change.rollback();
                }
                Err(err)
            }
        }
    }

    /// Discards the engine transaction and runs rollback hooks in reverse
    /// registration order.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if let Some(engine_txn) = self.engine_txn.take() {
            engine_txn.rollback();
        }
        for change in self.changes.drain(..).rev() {
            change.rollback();
        }
    }

    pub(crate) fn engine(&self) -> &dyn EngineTransaction {
        self.engine_txn
            .as_deref()
            .expect("transaction already resolved")
    }

    pub(crate) fn register(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// The oplog read boundary pinned for this transaction, if any.
    pub(crate) fn oplog_read_till(&self) -> Option<RecordId> {
        self.oplog_read_till
    }

    pub(crate) fn set_oplog_read_till(&mut self, id: RecordId) {
        self.oplog_read_till = Some(id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}
