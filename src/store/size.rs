//! Record and byte counters, with periodic persistence.
//!
//! Counters are plain atomics updated inline on every write; rollback
//! correction happens through transaction hooks. Deltas are pushed to an
//! external size storer every `FLUSH_STRIDE` data-size changes and on
//! store shutdown, so a crash loses at most a bounded amount of counter
//! drift, which `validate` can repair later.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::encoding::bincode;
use crate::error::{Error, Result};

/// How many data-size deltas between pushes to the size storer.
const FLUSH_STRIDE: i64 = 1000;

/// External persistence for per-collection counters, keyed by table URI.
pub trait SizeStorer: Send + Sync {
    /// Returns the stored `(num_records, data_size)` for a table, if any.
    fn load(&self, uri: &str) -> Option<(i64, i64)>;

    /// Caches new counters for a table.
    fn store(&self, uri: &str, num_records: i64, data_size: i64);

    /// Persists the cache.
    fn flush(&self) -> Result<()>;
}

/// In-memory counters for one collection.
pub struct SizeTracker {
    uri: String,
    num_records: AtomicI64,
    data_size: AtomicI64,
    storer: Option<Arc<dyn SizeStorer>>,
    deltas: AtomicI64,
}

impl SizeTracker {
    pub(crate) fn new(uri: impl Into<String>, storer: Option<Arc<dyn SizeStorer>>) -> Self {
        Self {
            uri: uri.into(),
            num_records: AtomicI64::new(0),
            data_size: AtomicI64::new(0),
            storer,
            deltas: AtomicI64::new(0),
        }
    }

    pub fn num_records(&self) -> i64 {
        self.num_records.load(Ordering::SeqCst)
    }

    pub fn data_size(&self) -> i64 {
        self.data_size.load(Ordering::SeqCst)
    }

    /// Overwrites both counters with recomputed truth and pushes them to
    /// the storer.
    pub(crate) fn set(&self, num_records: i64, data_size: i64) {
        self.num_records.store(num_records, Ordering::SeqCst);
        self.data_size.store(data_size, Ordering::SeqCst);
        if let Some(storer) = &self.storer {
            storer.store(&self.uri, num_records, data_size);
        }
    }

    /// Applies a record count delta, flooring at zero.
    pub(crate) fn apply_num_records(&self, diff: i64) {
        let old = self.num_records.fetch_add(diff, Ordering::SeqCst);
        if old + diff < 0 {
            warn!(
                uri = %self.uri,
                old, diff,
                "record count underflow, clamping to zero"
            );
            self.num_records.store(0, Ordering::SeqCst);
        }
    }

    /// Applies a data size delta, flooring at zero, and pushes to the
    /// storer every `FLUSH_STRIDE` deltas.
    pub(crate) fn apply_data_size(&self, amount: i64) {
        let old = self.data_size.fetch_add(amount, Ordering::SeqCst);
        if old + amount < 0 {
            warn!(
                uri = %self.uri,
                old, amount,
                "data size underflow, clamping to zero"
            );
            self.data_size.store(0, Ordering::SeqCst);
        }

        if let Some(storer) = &self.storer {
            if self.deltas.fetch_add(1, Ordering::SeqCst) % FLUSH_STRIDE == 0 {
                storer.store(&self.uri, self.num_records(), self.data_size());
            }
        }
    }

    /// Pushes current counters to the storer and persists it. Called on
    /// store shutdown.
    pub(crate) fn push_and_flush(&self) {
        if let Some(storer) = &self.storer {
            storer.store(&self.uri, self.num_records(), self.data_size());
            if let Err(err) = storer.flush() {
                warn!(uri = %self.uri, error = %err, "failed to flush size storer");
            }
        }
    }

    pub(crate) fn storer(&self) -> Option<&Arc<dyn SizeStorer>> {
        self.storer.as_ref()
    }
}

const MAGIC: u32 = 0x43_53_5A; // ASCII "CSZ"
const VERSION: u16 = 1;

/// A size storer backed by a single file: a small header followed by a
/// bincode map of `uri -> (num_records, data_size)`.
pub struct FileSizeStorer {
    path: PathBuf,
    cache: Mutex<HashMap<String, (i64, i64)>>,
}

impl FileSizeStorer {
    /// Opens the storer, loading any previously flushed counters.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = match fs::read(&path) {
            Ok(bytes) => Self::decode(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn decode(bytes: &[u8]) -> Result<HashMap<String, (i64, i64)>> {
        let mut reader = bytes;
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::InvalidData(format!(
                "bad size storer magic {magic:#x}"
            )));
        }
        let version = reader.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported size storer version {version}"
            )));
        }
        bincode::deserialize_from(reader)
    }

    fn encode(cache: &HashMap<String, (i64, i64)>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAGIC)?;
        buf.write_u16::<BigEndian>(VERSION)?;
        bincode::serialize_into(&mut buf, cache)?;
        Ok(buf)
    }
}

impl SizeStorer for FileSizeStorer {
    fn load(&self, uri: &str) -> Option<(i64, i64)> {
        self.cache.lock().get(uri).copied()
    }

    fn store(&self, uri: &str, num_records: i64, data_size: i64) {
        self.cache
            .lock()
            .insert(uri.to_string(), (num_records, data_size));
    }

    fn flush(&self) -> Result<()> {
        let encoded = Self::encode(&self.cache.lock())?;
        // Write-and-rename so a crash mid-flush keeps the old file intact.
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Drop for FileSizeStorer {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "failed to flush size storer on drop");
        }
    }
}
