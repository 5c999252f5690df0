//! Uncommitted-id registry for capped and oplog collections.
//!
//! Every in-flight insert into a capped collection parks its id here until
//! the owning transaction resolves. Cursors use the front of the registry
//! as the visibility floor: a record is hidden if any uncommitted id at or
//! below it exists, which preserves no-holes scanning: readers never see
//! record N+1 before record N's insert has committed.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use super::RecordId;

#[derive(Debug, Default)]
struct State {
    /// In-flight ids in increasing order. Inserts append at the back;
    /// removals usually hit the front (commit order roughly follows
    /// insert order) but may land anywhere.
    ids: Vec<RecordId>,
    /// The highest id ever handed out or extracted for this collection.
    highest_seen: RecordId,
}

#[derive(Debug)]
pub struct UncommittedIds {
    state: Mutex<State>,
}

impl UncommittedIds {
    pub(crate) fn new(highest_seen: RecordId) -> Self {
        Self {
            state: Mutex::new(State {
                ids: Vec::new(),
                highest_seen,
            }),
        }
    }

    /// Allocates the next id from `counter` and registers it, in one
    /// critical section so registry order matches id order.
    pub(crate) fn add_next(&self, counter: &AtomicI64) -> RecordId {
        let mut state = self.state.lock();
        let id = RecordId::new(counter.fetch_add(1, Ordering::SeqCst));
        debug_assert!(id.is_normal());
        debug_assert!(state.ids.last().map_or(true, |last| *last < id));
        state.ids.push(id);
        state.highest_seen = id;
        id
    }

    /// Registers an id extracted from an oplog record. Extracted ids are
    /// strictly increasing per collection, so appending keeps order.
    pub(crate) fn add_extracted(&self, id: RecordId) {
        let mut state = self.state.lock();
        debug_assert!(state.ids.last().map_or(true, |last| *last < id));
        state.ids.push(id);
        if id > state.highest_seen {
            state.highest_seen = id;
        }
    }

    /// Removes an id once its transaction commits or rolls back.
    pub(crate) fn remove(&self, id: RecordId) {
        let mut state = self.state.lock();
        if let Some(index) = state.ids.iter().position(|&candidate| candidate == id) {
            state.ids.remove(index);
        } else {
            debug_assert!(false, "removed id {id} was not registered");
        }
    }

    /// Whether `id` is hidden from cursors: some uncommitted id at or
    /// below it exists.
    pub(crate) fn is_hidden(&self, id: RecordId) -> bool {
        let state = self.state.lock();
        match state.ids.first() {
            Some(&front) => front <= id,
            None => false,
        }
    }

    /// The lowest hidden id, if any insert is in flight.
    pub(crate) fn lowest_hidden(&self) -> Option<RecordId> {
        self.state.lock().ids.first().copied()
    }

    /// The boundary up to which an oplog reader may see records: the
    /// earliest in-flight id, or the highest seen when nothing is in
    /// flight.
    pub(crate) fn read_boundary(&self) -> RecordId {
        let state = self.state.lock();
        state.ids.first().copied().unwrap_or(state.highest_seen)
    }

    pub(crate) fn highest_seen(&self) -> RecordId {
        self.state.lock().highest_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_in_order() {
        let counter = AtomicI64::new(1);
        let ids = UncommittedIds::new(RecordId::NULL);

        let a = ids.add_next(&counter);
        let b = ids.add_next(&counter);
        let c = ids.add_next(&counter);
        assert!(a < b && b < c);
        assert_eq!(ids.lowest_hidden(), Some(a));

        ids.remove(a);
        assert_eq!(ids.lowest_hidden(), Some(b));
        ids.remove(b);
        ids.remove(c);
        assert_eq!(ids.lowest_hidden(), None);
    }

    #[test]
    fn test_out_of_order_removal() {
        let counter = AtomicI64::new(1);
        let ids = UncommittedIds::new(RecordId::NULL);

        let a = ids.add_next(&counter);
        let b = ids.add_next(&counter);

        // A later insert may commit first; the floor stays at the earliest
        // still-uncommitted id.
        ids.remove(b);
        assert_eq!(ids.lowest_hidden(), Some(a));
        assert!(ids.is_hidden(a));
        assert!(ids.is_hidden(b));
        ids.remove(a);
        assert!(!ids.is_hidden(a));
    }

    #[test]
    fn test_hidden_floor_covers_later_ids() {
        let counter = AtomicI64::new(5);
        let ids = UncommittedIds::new(RecordId::new(4));

        let five = ids.add_next(&counter);
        assert!(!ids.is_hidden(RecordId::new(4)));
        assert!(ids.is_hidden(five));
        assert!(ids.is_hidden(RecordId::new(100)));
    }

    #[test]
    fn test_read_boundary() {
        let ids = UncommittedIds::new(RecordId::new(7));
        assert_eq!(ids.read_boundary(), RecordId::new(7));

        ids.add_extracted(RecordId::new(9));
        assert_eq!(ids.read_boundary(), RecordId::new(9));
        assert_eq!(ids.highest_seen(), RecordId::new(9));

        ids.remove(RecordId::new(9));
        assert_eq!(ids.read_boundary(), RecordId::new(9));
    }
}
