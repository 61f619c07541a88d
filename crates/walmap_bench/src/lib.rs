//! Benchmark utilities.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tempfile::TempDir;
use walmap_core::{PersistMap, Store};

/// A record shaped like a typical session payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Owning user.
    pub user: String,
    /// Monotonic hit counter.
    pub hits: u64,
    /// Free-form tags.
    pub tags: Vec<String>,
}

/// Generates a deterministic session payload for key index `i`.
#[must_use]
pub fn session(i: usize) -> Session {
    Session {
        user: format!("user-{i}"),
        hits: (i as u64).wrapping_mul(2654435761) % 10_000,
        tags: vec!["bench".to_string(), format!("bucket-{}", i % 16)],
    }
}

/// An open store over a temp-dir-backed log file.
///
/// The [`TempDir`] must stay alive as long as the store is in use.
pub struct BenchStore {
    /// Keeps the backing directory alive.
    pub dir: TempDir,
    /// Path of the log file.
    pub path: PathBuf,
    /// The open store.
    pub store: Store,
}

/// Opens a fresh store in a temporary directory.
#[must_use]
pub fn bench_store() -> BenchStore {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("bench.wal");
    let store = Store::new();
    store.open(&path).expect("open store");
    BenchStore { dir, path, store }
}

/// Opens a fresh store with a registered map and `prefill` existing keys.
#[must_use]
pub fn bench_map(prefill: usize) -> (BenchStore, PersistMap<Session>) {
    let bench = bench_store();
    let map: PersistMap<Session> =
        PersistMap::new(&bench.store, "sessions").expect("register map");
    for i in 0..prefill {
        map.set(&format!("key-{i}"), session(i));
    }
    (bench, map)
}
