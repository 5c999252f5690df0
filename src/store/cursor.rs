//! Record cursors with save/restore and visibility filtering.
//!
//! A cursor owns an engine cursor tied to the transaction that created
//! it. Crossing a transaction boundary means `save` (drop the position's
//! engine state), then `restore` under the new transaction, which seeks
//! back to the last returned id. On capped collections a failed re-seek
//! is an error rather than a silent skip: the record was evicted, and
//! skipping ahead would hand the caller a hole it cannot detect.

use std::cmp::Ordering;
use std::sync::Arc;

use super::visibility::UncommittedIds;
use super::{Record, RecordId, StoreInner};
use crate::engine::EngineCursor;
use crate::errdata;
use crate::error::Result;
use crate::txn::Transaction;

pub struct Cursor {
    uri: String,
    cursor: Option<Box<dyn EngineCursor>>,
    forward: bool,
    capped: bool,
    oplog: bool,
    ids: Arc<UncommittedIds>,
    /// Oplog read boundary pinned by the owning transaction at creation.
    read_until: Option<RecordId>,
    /// If unset, the next advance seeks to the first/last record.
    last_returned: Option<RecordId>,
    eof: bool,
}

impl Cursor {
    pub(crate) fn new(txn: &Transaction, inner: &StoreInner, forward: bool) -> Result<Self> {
        Ok(Self {
            uri: inner.uri.clone(),
            cursor: Some(txn.engine().cursor(&inner.uri)?),
            forward,
            capped: inner.options.capped,
            oplog: inner.options.oplog,
            ids: Arc::clone(&inner.uncommitted),
            read_until: txn.oplog_read_till(),
            last_returned: None,
            eof: false,
        })
    }

    /// Advances to the next visible record in the cursor's direction.
    pub fn next(&mut self) -> Result<Option<Record>> {
        if self.eof {
            return Ok(None);
        }

        let mut must_advance = true;
        let initial_reverse_seek = self.last_returned.is_none() && !self.forward && self.capped;

        let Some(cursor) = self.cursor.as_mut() else {
            return errdata!("cursor is detached");
        };

        if initial_reverse_seek {
            // A reverse capped cursor has to start from the highest
            // *visible* record, which may sit below uncommitted inserts.
            let seek = match self.read_until.filter(|r| !r.is_null()) {
                Some(read_until) => Some(read_until),
                None => self.ids.lowest_hidden(),
            };
            if let Some(seek) = seek {
                let hidden = self.ids.is_hidden(seek);
                match cursor.search_near(seek.repr())? {
                    None => {
                        self.eof = true;
                        return Ok(None);
                    }
                    Some(cmp) => {
                        // If the seek point itself is hidden, landing on it
                        // is still too high; only a strictly lower landing
                        // needs no step.
                        must_advance = if hidden {
                            cmp != Ordering::Less
                        } else {
                            cmp == Ordering::Greater
                        };
                    }
                }
            }
        }

        if must_advance {
            let found = if self.forward {
                cursor.next()?
            } else {
                cursor.prev()?
            };
            if !found {
                self.eof = true;
                return Ok(None);
            }
        }

        let id = RecordId::new(cursor.key()?);
        if !is_visible(&self.ids, self.capped, self.oplog, self.read_until, id) {
            self.eof = true;
            return Ok(None);
        }

        let data = cursor.value()?;
        self.last_returned = Some(id);
        Ok(Some(Record { id, data }))
    }

    /// Positions on `id` exactly; not-found sets eof.
    pub fn seek_exact(&mut self, id: RecordId) -> Result<Option<Record>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return errdata!("cursor is detached");
        };
        if !cursor.search(id.repr())? {
            self.eof = true;
            return Ok(None);
        }
        let data = cursor.value()?;
        self.last_returned = Some(id);
        self.eof = false;
        Ok(Some(Record { id, data }))
    }

    /// Releases the engine position ahead of a transaction boundary. The
    /// logical position (`last_returned`) survives for `restore`.
    pub fn save(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.reset();
        }
    }

    /// Like `save`, but forgets the logical position too.
    pub fn save_unpositioned(&mut self) {
        self.save();
        self.last_returned = None;
    }

    /// Re-establishes the position under `txn`. Returns false if the
    /// last-returned record no longer exists on a capped collection, in
    /// which case the caller must abandon the scan; on other collections
    /// the position silently adjusts so `next` returns the next unseen
    /// record.
    pub fn restore(&mut self, txn: &Transaction) -> Result<bool> {
        if self.cursor.is_none() {
            self.cursor = Some(txn.engine().cursor(&self.uri)?);
        }

        // A finished cursor has nothing to re-establish.
        if self.eof {
            return Ok(true);
        }
        let Some(last) = self.last_returned else {
            return Ok(true);
        };

        let Some(cursor) = self.cursor.as_mut() else {
            return errdata!("cursor is detached");
        };
        match cursor.search_near(last.repr())? {
            None => {
                self.eof = true;
                Ok(!self.capped)
            }
            Some(Ordering::Equal) => Ok(true),
            Some(cmp) => {
                if self.capped {
                    // The record was evicted or truncated away. Erroring
                    // out here is what keeps capped scans hole-free.
                    self.eof = true;
                    return Ok(false);
                }
                if self.forward && cmp == Ordering::Greater {
                    // Landed past where we were; step back so next()
                    // returns the landing record.
                    let _ = cursor.prev()?;
                } else if !self.forward && cmp == Ordering::Less {
                    let _ = cursor.next()?;
                }
                Ok(true)
            }
        }
    }

    /// Drops the engine cursor entirely; `restore` re-creates it under
    /// whichever transaction comes next.
    pub fn detach(&mut self) {
        self.cursor = None;
    }
}

fn is_visible(
    ids: &UncommittedIds,
    capped: bool,
    oplog: bool,
    read_until: Option<RecordId>,
    id: RecordId,
) -> bool {
    if !capped {
        return true;
    }
    let read_until = match read_until {
        Some(read_until) if oplog && !read_until.is_null() => read_until,
        // The normal capped case: hidden means some uncommitted id at or
        // below this record exists.
        _ => return !ids.is_hidden(id),
    };
    if id == read_until {
        // The boundary itself is fine if its insert has committed.
        return !ids.is_hidden(id);
    }
    id < read_until
}

/// A cursor over uniformly random records. Not stable across transaction
/// boundaries; re-open instead of save/restore.
pub struct RandomCursor {
    cursor: Box<dyn EngineCursor>,
}

impl RandomCursor {
    pub(crate) fn new(cursor: Box<dyn EngineCursor>) -> Self {
        Self { cursor }
    }

    pub fn next(&mut self) -> Result<Option<Record>> {
        if !self.cursor.next()? {
            return Ok(None);
        }
        Ok(Some(Record {
            id: RecordId::new(self.cursor.key()?),
            data: self.cursor.value()?,
        }))
    }
}
