//! The store: log ownership, recovery, and the orphan table.
//!
//! A [`Store`] owns exactly one log file. It is created unloaded, opened
//! against a path (creating the file or replaying an existing one), and
//! closed once; after close it is terminal and every operation fails with
//! [`StoreError::NotLoaded`].
//!
//! Typed maps ([`crate::PersistMap`]) register themselves in the store
//! under a namespace. Records replayed for an unregistered namespace land
//! in the orphan table, from which a later-registered map claims them, or
//! from which the store serves its own typed `get`/`set` surface for keys
//! no map owns.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::background::BackgroundTask;
use crate::error::{CoreResult, StoreError};
use crate::key::validate_key;
use crate::map::{MapHandle, PersistMap};
use crate::record::{encode_record, Op, RecordReader, WAL_HEADER};
use crate::stats::StoreStats;

/// Default interval between background sync passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Default cadence of the auto-shrink monitor started by
/// [`open_single_map`].
pub const DEFAULT_SHRINK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default record-to-live-key ratio that triggers an automatic shrink.
pub const DEFAULT_SHRINK_RATIO: f64 = 10.0;

/// Handler invoked for failures on paths that cannot return an error to
/// a caller: the background sync loop, the auto-shrink monitor, and the
/// fire-and-forget map mutators.
type ErrorHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// The default handler logs the failure and terminates the process, on
/// the grounds that losing writes silently is worse than dying loudly.
/// Replace it with [`Store::set_error_handler`] to keep the process up.
fn default_error_handler(err: &StoreError) {
    tracing::error!(error = %err, "walmap: unrecoverable background error");
    std::process::exit(1);
}

/// The open log file plus the state that must change atomically with it.
///
/// `shrinking` and `pending` live under the same mutex as the file so that
/// every append observes a consistent shrink phase: while a shrink is in
/// progress, each appended record image is mirrored into `pending`.
pub(crate) struct LogFile {
    pub(crate) file: File,
    pub(crate) shrinking: bool,
    pub(crate) pending: Vec<Vec<u8>>,
}

/// An entry of the orphan table.
pub(crate) enum Orphan {
    /// Encoded bytes exactly as loaded from the log; decode is deferred
    /// until the first typed read.
    Raw(Vec<u8>),
    /// A decoded value cached by a typed store-level call, together with
    /// its encoded form so compaction never needs to re-encode it.
    Decoded {
        value: Arc<dyn Any + Send + Sync>,
        encoded: Vec<u8>,
    },
}

pub(crate) struct Shared {
    pub(crate) log: Mutex<Option<LogFile>>,
    pub(crate) path: RwLock<Option<PathBuf>>,
    loading: AtomicBool,
    pub(crate) loaded: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) orphans: DashMap<String, Orphan>,
    pub(crate) maps: DashMap<String, Arc<dyn MapHandle>>,
    pub(crate) closed_maps: DashMap<String, ()>,
    pub(crate) wal_records: AtomicU64,
    sync_interval_ms: AtomicU64,
    error_handler: RwLock<ErrorHandler>,
    sync_task: Mutex<Option<BackgroundTask>>,
    pub(crate) auto_shrink_task: Mutex<Option<BackgroundTask>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(mut task) = self.sync_task.get_mut().take() {
            task.stop();
        }
        if let Some(mut task) = self.auto_shrink_task.get_mut().take() {
            task.stop();
        }
    }
}

/// A persistent key-value store backed by a textual append-only log.
///
/// `Store` is a cheap handle (`Clone` shares the same store). The write
/// path appends a record per mutation; the load path replays the log and
/// dispatches records to registered maps by namespace prefix, keeping the
/// rest as orphans.
///
/// # Example
///
/// ```no_run
/// use walmap_core::Store;
///
/// let store = Store::new();
/// store.open("data.wal")?;
/// store.set("greeting", "hello".to_string())?;
/// let value: String = store.get("greeting")?;
/// store.close()?;
/// # Ok::<(), walmap_core::StoreError>(())
/// ```
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Arc<Shared>,
}

impl Store {
    /// Creates a new, unloaded store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(None),
                path: RwLock::new(None),
                loading: AtomicBool::new(false),
                loaded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                orphans: DashMap::new(),
                maps: DashMap::new(),
                closed_maps: DashMap::new(),
                wal_records: AtomicU64::new(0),
                sync_interval_ms: AtomicU64::new(DEFAULT_SYNC_INTERVAL.as_millis() as u64),
                error_handler: RwLock::new(Arc::new(default_error_handler) as ErrorHandler),
                sync_task: Mutex::new(None),
                auto_shrink_task: Mutex::new(None),
            }),
        }
    }

    /// Opens or creates the log file at `path` and replays it.
    ///
    /// A fresh file gets the version header written and fsynced. An
    /// existing file must start with the exact header line; its records
    /// are then replayed, dispatching each to the map registered for its
    /// namespace and buffering the rest as orphans. On success the
    /// background sync loop is started.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyLoaded`] if the store is already open.
    /// - [`StoreError::NotLoaded`] if the store was closed (closing is
    ///   terminal).
    /// - [`StoreError::InvalidHeader`] if the header line does not match.
    /// - [`StoreError::MalformedRecord`] for a corrupt record mid-file; in
    ///   that case nothing is loaded and the store stays unloaded.
    /// - [`StoreError::Codec`] if a record for a registered map fails to
    ///   decode.
    pub fn open(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::NotLoaded);
        }
        if self
            .shared
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::AlreadyLoaded);
        }

        match self.open_inner(path) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.rollback_load();
                self.shared.loading.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn open_inner(&self, path: &Path) -> CoreResult<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(format!("{WAL_HEADER}\n").as_bytes())?;
            file.sync_all()?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(&file);
            let mut line = String::new();
            reader.read_line(&mut line)?;
            if line.trim() != WAL_HEADER {
                return Err(StoreError::InvalidHeader {
                    found: line.trim().to_string(),
                });
            }
            drop(reader);
            file.seek(SeekFrom::End(0))?;
        }

        let replayed = self.replay(path)?;

        *self.shared.path.write() = Some(path.to_path_buf());
        *self.shared.log.lock() = Some(LogFile {
            file,
            shrinking: false,
            pending: Vec::new(),
        });
        self.shared.wal_records.store(replayed, Ordering::Release);
        self.shared.loaded.store(true, Ordering::Release);

        self.spawn_sync_loop();
        Ok(())
    }

    /// Replays all records from the file at `path` through a dedicated
    /// read handle. Returns the number of complete records seen.
    fn replay(&self, path: &Path) -> CoreResult<u64> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = String::new();
        let header_len = reader.read_line(&mut header)?;

        let mut records = RecordReader::new(reader, header_len as u64);
        let mut replayed = 0u64;

        while let Some(record) = records.next_record()? {
            replayed += 1;

            let Some(op) = Op::from_byte(record.op) else {
                tracing::warn!(
                    op = record.op,
                    key = %record.key,
                    "unknown operation in WAL, skipping record"
                );
                continue;
            };

            if let Some((namespace, user_key)) = split_namespace(&record.key) {
                if let Some(handle) = self.shared.maps.get(namespace) {
                    handle.apply_record(op, user_key, &record.value)?;
                    continue;
                }
            }

            match op {
                Op::Set => {
                    self.shared
                        .orphans
                        .insert(record.key, Orphan::Raw(record.value));
                }
                Op::Delete => {
                    self.shared.orphans.remove(&record.key);
                }
            }
        }

        Ok(replayed)
    }

    /// Discards all partially-loaded state after a failed replay, so that
    /// a failed open leaves no key observable.
    fn rollback_load(&self) {
        for entry in self.shared.maps.iter() {
            entry.value().clear();
        }
        self.shared.orphans.clear();
    }

    /// Flushes every map's dirty keys to the log, fsyncs, stops the
    /// background tasks, and closes the file.
    ///
    /// Closing is terminal: the store cannot be reopened, and subsequent
    /// operations fail with [`StoreError::NotLoaded`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotLoaded`] if the store is not open, or the
    /// first I/O error of the final sync.
    pub fn close(&self) -> CoreResult<()> {
        self.ensure_loaded()?;

        let sync_task = self.shared.sync_task.lock().take();
        if let Some(mut task) = sync_task {
            task.stop();
        }
        let shrink_task = self.shared.auto_shrink_task.lock().take();
        if let Some(mut task) = shrink_task {
            task.stop();
        }

        self.fsync_all()?;

        self.shared.loaded.store(false, Ordering::Release);
        self.shared.closed.store(true, Ordering::Release);
        *self.shared.log.lock() = None;
        Ok(())
    }

    /// Persists a value under `key` at the store level.
    ///
    /// The key is not namespaced; use a [`PersistMap`] for map keys. The
    /// decoded value is cached in the orphan table for later typed reads.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`], [`StoreError::Codec`],
    /// [`StoreError::NotLoaded`], or [`StoreError::Io`].
    pub fn set<T>(&self, key: &str, value: T) -> CoreResult<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        // Key validation precedes encoding; a call that is wrong on
        // both counts reports the key error.
        validate_key(key)?;
        let encoded = walmap_codec::to_line_json(&value)?;
        self.append_set(key, &encoded)?;
        self.shared.orphans.insert(
            key.to_string(),
            Orphan::Decoded {
                value: Arc::new(value),
                encoded,
            },
        );
        Ok(())
    }

    /// Retrieves the store-level value under `key`.
    ///
    /// The first typed read of a key loaded from the log decodes it and
    /// memoizes the decoded value; later reads are lookups.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if the key is absent,
    /// [`StoreError::TypeMismatch`] if the cached value was stored under a
    /// different type, [`StoreError::Codec`] if the raw bytes fail to
    /// decode, or [`StoreError::NotLoaded`].
    pub fn get<T>(&self, key: &str) -> CoreResult<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_loaded()?;

        let mut entry = match self.shared.orphans.get_mut(key) {
            Some(entry) => entry,
            None => return Err(StoreError::KeyNotFound),
        };

        let promoted = match entry.value_mut() {
            Orphan::Decoded { value, .. } => {
                return match Arc::clone(value).downcast::<T>() {
                    Ok(value) => Ok(value.as_ref().clone()),
                    Err(_) => Err(StoreError::TypeMismatch {
                        key: key.to_string(),
                    }),
                };
            }
            Orphan::Raw(bytes) => {
                let decoded: T = walmap_codec::from_line_json(bytes)?;
                let encoded = std::mem::take(bytes);
                (
                    Orphan::Decoded {
                        value: Arc::new(decoded.clone()),
                        encoded,
                    },
                    decoded,
                )
            }
        };

        *entry.value_mut() = promoted.0;
        Ok(promoted.1)
    }

    /// Deletes the store-level value under `key`.
    ///
    /// A delete record is appended whether or not the key exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotLoaded`], [`StoreError::InvalidKey`], or
    /// [`StoreError::Io`].
    pub fn delete(&self, key: &str) -> CoreResult<()> {
        self.append_delete(key)?;
        self.shared.orphans.remove(key);
        Ok(())
    }

    /// Ensures complete durability: drains every registered map's dirty
    /// keys to the log, then fsyncs the file.
    ///
    /// This runs automatically on the configured sync interval; call it
    /// directly when immediate durability is required.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotLoaded`] or the fsync failure. Per-key
    /// flush failures are routed to the error handler and the keys stay
    /// dirty.
    pub fn fsync_all(&self) -> CoreResult<()> {
        self.ensure_loaded()?;
        for entry in self.shared.maps.iter() {
            entry.value().sync_dirty(self);
        }
        self.fsync_file()
    }

    /// Returns the current live-key and record counts.
    ///
    /// `active_keys` sums the orphan table and every registered map;
    /// `wal_records` counts the records in the log file (replayed at open,
    /// incremented per append, reset by shrink).
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let mut active_keys = self.shared.orphans.len() as u64;
        for entry in self.shared.maps.iter() {
            active_keys += entry.value().len() as u64;
        }
        StoreStats {
            active_keys,
            wal_records: self.shared.wal_records.load(Ordering::Acquire),
        }
    }

    /// Returns the current background sync interval.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.shared.sync_interval_ms.load(Ordering::Relaxed))
    }

    /// Sets the background sync interval.
    ///
    /// Takes effect when the loop next re-arms its timer.
    pub fn set_sync_interval(&self, interval: Duration) {
        self.shared
            .sync_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Replaces the handler invoked for background and fire-and-forget
    /// failures.
    ///
    /// The default handler logs the error and terminates the process.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&StoreError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Arc::new(handler);
    }

    pub(crate) fn report(&self, err: StoreError) {
        let handler = Arc::clone(&self.shared.error_handler.read());
        handler(&err);
    }

    pub(crate) fn ensure_loaded(&self) -> CoreResult<()> {
        if self.shared.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotLoaded)
        }
    }

    pub(crate) fn append_set(&self, full_key: &str, encoded: &[u8]) -> CoreResult<()> {
        self.append_record(Op::Set, full_key, encoded)
    }

    pub(crate) fn append_delete(&self, full_key: &str) -> CoreResult<()> {
        self.append_record(Op::Delete, full_key, b"")
    }

    /// Appends one record image under the file mutex. While a shrink is
    /// in progress the image is also mirrored into the pending buffer, so
    /// the compacted file cannot miss it.
    fn append_record(&self, op: Op, full_key: &str, value: &[u8]) -> CoreResult<()> {
        validate_key(full_key)?;
        let image = encode_record(op, full_key, value);

        let mut guard = self.shared.log.lock();
        let log = guard.as_mut().ok_or(StoreError::NotLoaded)?;
        log.file.write_all(&image)?;
        self.shared.wal_records.fetch_add(1, Ordering::Release);
        if log.shrinking {
            log.pending.push(image);
        }
        Ok(())
    }

    pub(crate) fn fsync_file(&self) -> CoreResult<()> {
        let mut guard = self.shared.log.lock();
        let log = guard.as_mut().ok_or(StoreError::NotLoaded)?;
        log.file.sync_all()?;
        Ok(())
    }

    fn spawn_sync_loop(&self) {
        let weak = Arc::downgrade(&self.shared);
        let task = BackgroundTask::spawn("walmap-sync", self.sync_interval(), move || {
            let shared = weak.upgrade()?;
            let store = Store { shared };
            match store.fsync_all() {
                Ok(()) => {}
                // The store was closed between ticks; wind down quietly.
                Err(StoreError::NotLoaded) => return None,
                Err(err) => store.report(err),
            }
            Some(store.sync_interval())
        });
        *self.shared.sync_task.lock() = Some(task);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &*self.shared.path.read())
            .field("loaded", &self.shared.loaded.load(Ordering::Relaxed))
            .field("maps", &self.shared.maps.len())
            .finish_non_exhaustive()
    }
}

/// Splits a full log key at its first `:` into namespace and user key.
///
/// A key without `:` belongs to no map (even the empty-named map uses the
/// prefix `":"`), so it returns `None` and stays an orphan.
pub(crate) fn split_namespace(full_key: &str) -> Option<(&str, &str)> {
    full_key
        .find(':')
        .map(|i| (&full_key[..i], &full_key[i + 1..]))
}

/// Opens a store at `path` with a single map over the empty namespace.
///
/// The map is registered before open so its records are claimed directly
/// during replay, and an auto-shrink monitor is started with the default
/// cadence and ratio. The returned map keeps the store alive; reach it
/// through [`PersistMap::store`] to close or inspect it.
///
/// # Errors
///
/// Propagates any error from [`Store::open`].
pub fn open_single_map<T>(path: impl AsRef<Path>) -> CoreResult<PersistMap<T>>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let store = Store::new();
    let map = PersistMap::new(&store, "")?;
    store.open(path)?;
    store.start_auto_shrink(DEFAULT_SHRINK_CHECK_INTERVAL, DEFAULT_SHRINK_RATIO);
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(path: &Path) -> Store {
        let store = Store::new();
        store.open(path).unwrap();
        store
    }

    #[test]
    fn fresh_file_gets_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        store.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("go-persist 1\n"));
    }

    #[test]
    fn invalid_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, "some other format 9\n").unwrap();

        let store = Store::new();
        let err = store.open(&path).unwrap_err();
        assert!(matches!(err, StoreError::InvalidHeader { .. }));

        // A failed open leaves the store unloaded but reusable.
        assert!(matches!(
            store.get::<i32>("k"),
            Err(StoreError::NotLoaded)
        ));
    }

    #[test]
    fn double_open_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        assert!(matches!(
            store.open(&path),
            Err(StoreError::AlreadyLoaded)
        ));
        store.close().unwrap();
    }

    #[test]
    fn close_is_terminal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        store.close().unwrap();

        assert!(matches!(store.close(), Err(StoreError::NotLoaded)));
        assert!(matches!(store.open(&path), Err(StoreError::NotLoaded)));
        assert!(matches!(
            store.set("k", 1i32),
            Err(StoreError::NotLoaded)
        ));
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        store.set("answer", 42i64).unwrap();
        assert_eq!(store.get::<i64>("answer").unwrap(), 42);

        store.delete("answer").unwrap();
        assert!(matches!(
            store.get::<i64>("answer"),
            Err(StoreError::KeyNotFound)
        ));
        store.close().unwrap();
    }

    #[test]
    fn raw_orphan_is_promoted_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let store = open_store(&path);
            store.set("config", vec![1u32, 2, 3]).unwrap();
            store.close().unwrap();
        }

        let store = open_store(&path);
        // First read decodes the raw bytes; second read hits the cache.
        assert_eq!(store.get::<Vec<u32>>("config").unwrap(), vec![1, 2, 3]);
        assert_eq!(store.get::<Vec<u32>>("config").unwrap(), vec![1, 2, 3]);
        store.close().unwrap();
    }

    #[test]
    fn promoted_orphan_with_wrong_type_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        store.set("n", 7i64).unwrap();
        let err = store.get::<String>("n").unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        store.close().unwrap();
    }

    #[test]
    fn invalid_key_rejected_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);
        assert!(matches!(
            store.set("bad\nkey", 1i32),
            Err(StoreError::InvalidKey { .. })
        ));
        store.close().unwrap();
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(serde::ser::Error::custom("not encodable"))
        }
    }

    #[test]
    fn invalid_key_reported_before_codec_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let store = open_store(&path);

        // A write that is wrong on both counts fails on the key.
        assert!(matches!(
            store.set("bad\nkey", Unencodable),
            Err(StoreError::InvalidKey { .. })
        ));

        // With a valid key, the codec error surfaces.
        assert!(matches!(
            store.set("ok", Unencodable),
            Err(StoreError::Codec(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn record_counter_tracks_appends_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let store = open_store(&path);
            store.set("a", 1i32).unwrap();
            store.set("b", 2i32).unwrap();
            store.delete("a").unwrap();
            assert_eq!(store.stats().wal_records, 3);
            assert_eq!(store.stats().active_keys, 1);
            store.close().unwrap();
        }

        let store = open_store(&path);
        assert_eq!(store.stats().wal_records, 3);
        assert_eq!(store.stats().active_keys, 1);
        store.close().unwrap();
    }

    #[test]
    fn split_namespace_rules() {
        assert_eq!(split_namespace("users:alice"), Some(("users", "alice")));
        assert_eq!(split_namespace(":k"), Some(("", "k")));
        assert_eq!(split_namespace("a:b:c"), Some(("a", "b:c")));
        assert_eq!(split_namespace("plain"), None);
        assert_eq!(split_namespace(""), None);
    }
}
