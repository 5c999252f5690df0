use std::collections::BTreeMap;

/// Options describing a single collection (record store).
///
/// A capped collection is bounded by `capped_max_bytes` and optionally
/// `capped_max_docs`; once a bound is exceeded, the oldest records are
/// evicted. An oplog is a capped, append-only collection whose record ids
/// encode timestamps and which is truncated coarsely through stones
/// instead of per-insert eviction.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Whether the collection is capped (default: false)
    pub capped: bool,

    /// Maximum total record bytes for a capped collection; -1 when not
    /// capped (default: -1)
    pub capped_max_bytes: i64,

    /// Maximum record count for a capped collection; -1 for unbounded
    /// (default: -1)
    pub capped_max_docs: i64,

    /// Whether the collection is an oplog (default: false)
    pub oplog: bool,

    /// Block compressor passed to the engine (default: "snappy")
    pub block_compressor: String,

    /// Enable engine prefix compression (default: false)
    pub prefix_compression: bool,

    /// Extra engine configuration appended verbatim (default: empty)
    pub extra_config: String,

    /// User-supplied storage customization. Only the `configString` key is
    /// recognized; anything else is rejected at open.
    pub storage_options: BTreeMap<String, String>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            capped: false,
            capped_max_bytes: -1,
            capped_max_docs: -1,
            oplog: false,
            block_compressor: "snappy".to_string(),
            prefix_compression: false,
            extra_config: String::new(),
            storage_options: BTreeMap::new(),
        }
    }
}

impl CollectionOptions {
    /// Create options for a plain (uncapped) collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options for a capped collection with the given byte bound
    pub fn capped(max_bytes: i64) -> Self {
        Self {
            capped: true,
            capped_max_bytes: max_bytes,
            ..Self::default()
        }
    }

    /// Create options for an oplog with the given byte bound
    pub fn oplog(max_bytes: i64) -> Self {
        Self {
            capped: true,
            capped_max_bytes: max_bytes,
            oplog: true,
            ..Self::default()
        }
    }

    /// Set the maximum record count for a capped collection
    pub fn capped_max_docs(mut self, max_docs: i64) -> Self {
        self.capped_max_docs = max_docs;
        self
    }

    /// Set the engine block compressor
    pub fn block_compressor(mut self, compressor: impl Into<String>) -> Self {
        self.block_compressor = compressor.into();
        self
    }

    /// Enable engine prefix compression
    pub fn prefix_compression(mut self, enabled: bool) -> Self {
        self.prefix_compression = enabled;
        self
    }

    /// Append extra engine configuration
    pub fn extra_config(mut self, extra: impl Into<String>) -> Self {
        self.extra_config = extra.into();
        self
    }

    /// Add a user storage option
    pub fn storage_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.storage_options.insert(key.into(), value.into());
        self
    }
}
