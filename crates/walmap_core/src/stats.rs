//! Store statistics.

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of live keys: orphan-table entries plus the entries of
    /// every registered map.
    pub active_keys: u64,
    /// Number of records currently in the log file. Initialized by
    /// replay, incremented per append, reset by shrink.
    pub wal_records: u64,
}

impl StoreStats {
    /// Records per live key, or `None` when there are no live keys.
    ///
    /// This is the quantity the auto-shrink monitor compares against its
    /// configured ratio.
    #[must_use]
    pub fn record_ratio(&self) -> Option<f64> {
        (self.active_keys > 0).then(|| self.wal_records as f64 / self.active_keys as f64)
    }
}
