//! Oplog truncate stones.
//!
//! Instead of evicting per insert, an oplog accumulates inserted bytes
//! until they reach `min_bytes_per_stone`, then drops a stone marking the
//! id range's right edge. A background reclaimer waits for excess stones
//! and truncates whole stone ranges in bulk, so steady-state insert cost
//! stays flat no matter how large the oplog is.
//!
//! At open the existing table is carved into stones either by a full
//! forward scan (small tables) or by random sampling (large ones), since
//! scanning a many-gigabyte oplog just to place markers would dominate
//! startup time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::size::SizeTracker;
use super::RecordId;
use crate::engine::EngineTransaction;
use crate::errinput;
use crate::error::Result;

/// Largest record the document layer will produce. A full oplog holds at
/// least this many bytes per stone, which bounds the stone count.
const MAX_RECORD_SIZE: i64 = 16 * 1024 * 1024 + 16 * 1024;

/// Random samples drawn per estimated stone during initialization.
const SAMPLES_PER_STONE: i64 = 10;

/// Bounds on how many stones a collection keeps before reclaim kicks in.
const MIN_STONES_TO_KEEP: i64 = 10;
const MAX_STONES_TO_KEEP: i64 = 100;

/// Sampling is only worthwhile when the samples would cover under 5% of
/// the records; below this ratio the table is scanned instead.
const MIN_SAMPLE_RATIO: i64 = 20;

/// A contiguous oplog range: approximately `records` records totaling
/// `bytes`, ending at `last_record`.
#[derive(Clone, Debug, PartialEq)]
pub struct Stone {
    pub records: i64,
    pub bytes: i64,
    pub last_record: RecordId,
}

pub struct OplogStones {
    /// Stones in increasing `last_record` order.
    stones: Mutex<VecDeque<Stone>>,
    /// Records and bytes accumulating toward the next stone.
    current_records: AtomicI64,
    current_bytes: AtomicI64,
    min_bytes_per_stone: AtomicI64,
    num_stones_to_keep: AtomicI64,
    /// The id just past the last reclaimed range; reclaim truncates from
    /// here to the oldest stone's `last_record`.
    first_record: AtomicI64,
    dead: Mutex<bool>,
    reclaim_cv: Condvar,
}

impl OplogStones {
    pub(crate) fn open(
        txn: &dyn EngineTransaction,
        uri: &str,
        capped_max_bytes: i64,
        tracker: &SizeTracker,
    ) -> Result<Self> {
        debug_assert!(capped_max_bytes > 0);
        let num_stones_to_keep =
            (capped_max_bytes / MAX_RECORD_SIZE).clamp(MIN_STONES_TO_KEEP, MAX_STONES_TO_KEEP);
        let min_bytes_per_stone = capped_max_bytes / num_stones_to_keep;
        if min_bytes_per_stone == 0 {
            return errinput!("oplog byte limit {capped_max_bytes} is too small to hold stones");
        }

        let stones = Self {
            stones: Mutex::new(VecDeque::new()),
            current_records: AtomicI64::new(0),
            current_bytes: AtomicI64::new(0),
            min_bytes_per_stone: AtomicI64::new(min_bytes_per_stone),
            num_stones_to_keep: AtomicI64::new(num_stones_to_keep),
            first_record: AtomicI64::new(RecordId::NULL.repr()),
            dead: Mutex::new(false),
            reclaim_cv: Condvar::new(),
        };
        stones.populate(txn, uri, tracker)?;
        Ok(stones)
    }

    fn populate(&self, txn: &dyn EngineTransaction, uri: &str, tracker: &SizeTracker) -> Result<()> {
        let num_records = tracker.num_records();
        let data_size = tracker.data_size();

        // Sampling beats scanning only when the table dwarfs the sample
        // count; small or unknown-size tables are scanned outright.
        let sample_threshold =
            MIN_SAMPLE_RATIO * SAMPLES_PER_STONE * self.num_stones_to_keep.load(Ordering::SeqCst);
        if num_records <= 0 || data_size <= 0 || num_records < sample_threshold {
            return self.populate_by_scanning(txn, uri, tracker);
        }

        let avg_record_size = data_size as f64 / num_records as f64;
        let est_records_per_stone =
            (self.min_bytes_per_stone.load(Ordering::SeqCst) as f64 / avg_record_size).ceil();
        let est_bytes_per_stone = est_records_per_stone * avg_record_size;
        self.populate_by_sampling(
            txn,
            uri,
            tracker,
            est_records_per_stone as i64,
            est_bytes_per_stone as i64,
        )
    }

    fn populate_by_scanning(
        &self,
        txn: &dyn EngineTransaction,
        uri: &str,
        tracker: &SizeTracker,
    ) -> Result<()> {
        info!(uri, "scanning the oplog to place truncate stones");

        let min_bytes_per_stone = self.min_bytes_per_stone.load(Ordering::SeqCst);
        let mut cursor = txn.cursor(uri)?;
        let mut num_records = 0i64;
        let mut data_size = 0i64;

        let mut stones = self.stones.lock();
        while cursor.next()? {
            let id = RecordId::new(cursor.key()?);
            let bytes = cursor.value()?.len() as i64;

            self.current_records.fetch_add(1, Ordering::SeqCst);
            let new_bytes = self.current_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
            if new_bytes >= min_bytes_per_stone {
                debug!(last_record = %id, "placing an oplog truncate stone");
                stones.push_back(Stone {
                    records: self.current_records.swap(0, Ordering::SeqCst),
                    bytes: self.current_bytes.swap(0, Ordering::SeqCst),
                    last_record: id,
                });
            }

            num_records += 1;
            data_size += bytes;
        }
        drop(stones);

        tracker.set(num_records, data_size);
        Ok(())
    }

    fn populate_by_sampling(
        &self,
        txn: &dyn EngineTransaction,
        uri: &str,
        tracker: &SizeTracker,
        est_records_per_stone: i64,
        est_bytes_per_stone: i64,
    ) -> Result<()> {
        info!(uri, "sampling the oplog to place truncate stones");

        let num_records = tracker.num_records();
        let data_size = tracker.data_size();
        let whole_stones = num_records / est_records_per_stone;
        let num_samples = SAMPLES_PER_STONE * num_records / est_records_per_stone;
        debug!(
            num_samples,
            est_records_per_stone, est_bytes_per_stone, "drawing oplog samples"
        );

        // Oversample, sort by id, and take the sample expected to sit at
        // the right edge of each estimated stone-sized section.
        let mut cursor = txn.random_cursor(uri)?;
        let mut samples = Vec::with_capacity(num_samples as usize);
        for _ in 0..num_samples {
            if !cursor.next()? {
                warn!(uri, "failed to draw enough oplog samples, falling back to scanning");
                return self.populate_by_scanning(txn, uri, tracker);
            }
            samples.push(RecordId::new(cursor.key()?));
        }
        samples.sort_unstable();

        let mut stones = self.stones.lock();
        for i in 1..=whole_stones {
            let index = (SAMPLES_PER_STONE * i - 1) as usize;
            let last_record = samples[index];
            debug!(last_record = %last_record, "placing an oplog truncate stone");
            stones.push_back(Stone {
                records: est_records_per_stone,
                bytes: est_bytes_per_stone,
                last_record,
            });
        }
        drop(stones);

        // Whatever the whole stones don't account for seeds the current
        // accumulator.
        self.current_records
            .store(num_records - est_records_per_stone * whole_stones, Ordering::SeqCst);
        self.current_bytes
            .store(data_size - est_bytes_per_stone * whole_stones, Ordering::SeqCst);
        Ok(())
    }

    /// Credits a committed insert to the current accumulator, cutting a
    /// new stone when it fills up.
    pub(crate) fn record_committed_insert(&self, bytes: i64, just_inserted: RecordId) {
        debug_assert!(bytes >= 0);
        debug_assert!(just_inserted.is_normal());

        self.current_records.fetch_add(1, Ordering::SeqCst);
        let new_bytes = self.current_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if new_bytes >= self.min_bytes_per_stone.load(Ordering::SeqCst) {
            self.create_stone_if_needed(just_inserted);
        }
    }

    fn create_stone_if_needed(&self, last_record: RecordId) {
        // If another thread is already cutting a stone or popping the
        // oldest one, let the next insert trigger the creation instead.
        let Some(mut stones) = self.stones.try_lock() else {
            return;
        };
        if self.current_bytes.load(Ordering::SeqCst) < self.min_bytes_per_stone.load(Ordering::SeqCst)
        {
            // Raced with another insert that already cut the stone.
            return;
        }

        stones.push_back(Stone {
            records: self.current_records.swap(0, Ordering::SeqCst),
            bytes: self.current_bytes.swap(0, Ordering::SeqCst),
            last_record,
        });

        if stones.len() as i64 > self.num_stones_to_keep.load(Ordering::SeqCst) {
            self.reclaim_cv.notify_one();
        }
    }

    /// Drops all stones and zeroes the accumulator. Runs when a truncate
    /// of the whole collection commits.
    pub(crate) fn clear(&self) {
        self.current_records.store(0, Ordering::SeqCst);
        self.current_bytes.store(0, Ordering::SeqCst);
        self.stones.lock().clear();
    }

    /// Reconciles stones with a truncate-after: stones whose range was
    /// (even partially) removed are popped and their counters credited
    /// back to the accumulator, then the actually-removed counts are
    /// subtracted. Partial stones thus keep the totals consistent.
    pub(crate) fn update_after_capped_truncate(
        &self,
        records_removed: i64,
        bytes_removed: i64,
        first_removed: RecordId,
    ) {
        let mut stones = self.stones.lock();
        let mut records_in_removed = 0i64;
        let mut bytes_in_removed = 0i64;
        while stones
            .back()
            .map_or(false, |stone| stone.last_record >= first_removed)
        {
            if let Some(stone) = stones.pop_back() {
                records_in_removed += stone.records;
                bytes_in_removed += stone.bytes;
            }
        }
        drop(stones);

        self.current_records
            .fetch_add(records_in_removed - records_removed, Ordering::SeqCst);
        self.current_bytes
            .fetch_add(bytes_in_removed - bytes_removed, Ordering::SeqCst);
    }

    /// The oldest stone, but only when there are more stones than this
    /// collection keeps.
    pub(crate) fn peek_oldest_if_excess(&self) -> Option<Stone> {
        let stones = self.stones.lock();
        if stones.len() as i64 > self.num_stones_to_keep.load(Ordering::SeqCst) {
            stones.front().cloned()
        } else {
            None
        }
    }

    pub(crate) fn pop_oldest(&self) {
        self.stones.lock().pop_front();
    }

    pub(crate) fn first_record(&self) -> RecordId {
        RecordId::new(self.first_record.load(Ordering::SeqCst))
    }

    pub(crate) fn set_first_record(&self, id: RecordId) {
        self.first_record.store(id.repr(), Ordering::SeqCst);
    }

    fn has_excess(&self) -> bool {
        self.stones.lock().len() as i64 > self.num_stones_to_keep.load(Ordering::SeqCst)
    }

    /// Wakes the reclaimer if there is work for it.
    pub(crate) fn poke(&self) {
        if self.has_excess() {
            self.reclaim_cv.notify_one();
        }
    }

    /// Blocks until there are excess stones to reclaim or `kill` is
    /// called.
    pub fn await_excess_or_dead(&self) {
        let mut dead = self.dead.lock();
        while !*dead && !self.has_excess() {
            self.reclaim_cv.wait(&mut dead);
        }
    }

    /// Permanently wakes the reclaimer. Idempotent.
    pub fn kill(&self) {
        *self.dead.lock() = true;
        self.reclaim_cv.notify_one();
    }

    pub fn is_dead(&self) -> bool {
        *self.dead.lock()
    }

    pub fn num_stones(&self) -> usize {
        self.stones.lock().len()
    }

    /// Records accumulated toward the next stone.
    pub fn current_records(&self) -> i64 {
        self.current_records.load(Ordering::SeqCst)
    }

    /// Bytes accumulated toward the next stone.
    pub fn current_bytes(&self) -> i64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn min_bytes_per_stone(&self) -> i64 {
        self.min_bytes_per_stone.load(Ordering::SeqCst)
    }

    /// Overrides the stone size. Only legal before any data is tracked.
    pub fn set_min_bytes_per_stone(&self, bytes: i64) {
        debug_assert!(bytes > 0);
        debug_assert!(self.stones.lock().is_empty() && self.current_records() == 0);
        self.min_bytes_per_stone.store(bytes, Ordering::SeqCst);
    }

    /// Overrides how many stones to keep. Takes effect for subsequent
    /// reclaim decisions.
    pub fn set_num_stones_to_keep(&self, num: i64) {
        debug_assert!(num > 0);
        self.num_stones_to_keep.store(num, Ordering::SeqCst);
        self.poke();
    }

    /// A snapshot of the stones, oldest first.
    pub fn stones(&self) -> Vec<Stone> {
        self.stones.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MemoryEngine};

    const URI: &str = "table:oplog";

    fn empty_stones(min_bytes: i64, num_to_keep: i64) -> Result<OplogStones> {
        let engine = MemoryEngine::new();
        engine.create_table(URI, "key_format=q,value_format=u")?;
        let tracker = SizeTracker::new(URI, None);
        let txn = engine.begin();
        let stones = OplogStones::open(txn.as_ref(), URI, 100 * MAX_RECORD_SIZE, &tracker)?;
        stones.set_min_bytes_per_stone(min_bytes);
        stones.set_num_stones_to_keep(num_to_keep);
        Ok(stones)
    }

    #[test]
    fn test_inserts_cut_stones() -> Result<()> {
        let stones = empty_stones(100, 10)?;

        stones.record_committed_insert(60, RecordId::new(1));
        assert_eq!(stones.num_stones(), 0);
        assert_eq!(stones.current_records(), 1);

        stones.record_committed_insert(60, RecordId::new(2));
        assert_eq!(stones.num_stones(), 1);
        assert_eq!(stones.current_records(), 0);
        assert_eq!(stones.current_bytes(), 0);

        let cut = &stones.stones()[0];
        assert_eq!(cut.records, 2);
        assert_eq!(cut.bytes, 120);
        assert_eq!(cut.last_record, RecordId::new(2));
        Ok(())
    }

    #[test]
    fn test_truncate_after_credits_partial_stones() -> Result<()> {
        let stones = empty_stones(100, 10)?;

        // Two full stones: ids 1..=2 and 3..=4, 120 bytes each.
        for id in 1..=4 {
            stones.record_committed_insert(60, RecordId::new(id));
        }
        assert_eq!(stones.num_stones(), 2);

        // Remove ids 4.. only: one record of 60 bytes. The second stone
        // covered two records, so one record and 60 bytes flow back into
        // the accumulator.
        stones.update_after_capped_truncate(1, 60, RecordId::new(4));
        assert_eq!(stones.num_stones(), 1);
        assert_eq!(stones.current_records(), 1);
        assert_eq!(stones.current_bytes(), 60);
        Ok(())
    }

    #[test]
    fn test_clear_drops_everything() -> Result<()> {
        let stones = empty_stones(100, 10)?;
        for id in 1..=4 {
            stones.record_committed_insert(60, RecordId::new(id));
        }
        stones.record_committed_insert(10, RecordId::new(5));
        stones.clear();
        assert_eq!(stones.num_stones(), 0);
        assert_eq!(stones.current_records(), 0);
        assert_eq!(stones.current_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_peek_requires_excess() -> Result<()> {
        let stones = empty_stones(100, 1)?;
        for id in 1..=2 {
            stones.record_committed_insert(60, RecordId::new(id));
        }
        assert_eq!(stones.num_stones(), 1);
        assert_eq!(stones.peek_oldest_if_excess(), None);

        for id in 3..=4 {
            stones.record_committed_insert(60, RecordId::new(id));
        }
        let oldest = stones.peek_oldest_if_excess().expect("excess stone");
        assert_eq!(oldest.last_record, RecordId::new(2));

        stones.pop_oldest();
        assert_eq!(stones.peek_oldest_if_excess(), None);
        Ok(())
    }

    #[test]
    fn test_kill_wakes_waiter() -> Result<()> {
        let stones = std::sync::Arc::new(empty_stones(100, 10)?);
        let waiter = {
            let stones = std::sync::Arc::clone(&stones);
            std::thread::spawn(move || {
                stones.await_excess_or_dead();
                stones.is_dead()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        stones.kill();
        assert!(waiter.join().expect("waiter panicked"));
        // kill is idempotent
        stones.kill();
        Ok(())
    }

    #[test]
    fn test_scan_population() -> Result<()> {
        let engine = MemoryEngine::new();
        engine.create_table(URI, "key_format=q,value_format=u")?;

        // 5 records of 60 bytes each, committed directly into the engine.
        let txn = engine.begin();
        {
            let mut cursor = txn.cursor(URI)?;
            for id in 1..=5i64 {
                cursor.insert(id, &[7u8; 60])?;
            }
        }
        txn.commit()?;

        let tracker = SizeTracker::new(URI, None);
        let txn = engine.begin();
        let stones = OplogStones::open(txn.as_ref(), URI, 100 * MAX_RECORD_SIZE, &tracker)?;
        // 300 bytes / (capped bytes / 10 stones) leaves everything in the
        // accumulator at this scale, but the scan must have repaired the
        // tracker.
        assert_eq!(tracker.num_records(), 5);
        assert_eq!(tracker.data_size(), 300);
        assert_eq!(
            stones.current_records() + stones.stones().iter().map(|s| s.records).sum::<i64>(),
            5
        );
        Ok(())
    }
}
