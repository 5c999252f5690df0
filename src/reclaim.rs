//! Dedicated background thread for oplog reclamation.
//!
//! The thread blocks on the stones' condition variable, truncates excess
//! stone ranges when woken, and exits when the stones are killed. It owns
//! a clone of the store, so the store's shared state outlives it; call
//! `ReclaimHandle::shutdown` (or drop the handle) for an orderly stop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::Result;
use crate::store::stones::OplogStones;
use crate::store::RecordStore;

/// Spawns the reclaim thread for an oplog store. Returns `None` for
/// stores without stones.
pub fn spawn(store: RecordStore) -> Result<Option<ReclaimHandle>> {
    let Some(stones) = store.oplog_stones() else {
        return Ok(None);
    };
    let stones = Arc::clone(stones);

    let name = format!("oplog-reclaim:{}", store.name());
    let handle = thread::Builder::new().name(name).spawn(move || {
        debug!(store = %store.name(), "oplog reclaim thread started");
        loop {
            if !store.await_oplog_reclaim_request() {
                debug!(store = %store.name(), "oplog reclaim thread shutting down");
                break;
            }
            if let Err(err) = store.reclaim_oplog() {
                error!(store = %store.name(), error = %err, "oplog reclaim failed");
            }
        }
    })?;

    Ok(Some(ReclaimHandle {
        stones,
        handle: Some(handle),
    }))
}

/// Handle to a running reclaim thread.
pub struct ReclaimHandle {
    stones: Arc<OplogStones>,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimHandle {
    /// Stops the thread and waits for it to exit. Idempotent.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        self.stones.kill();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReclaimHandle {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}
