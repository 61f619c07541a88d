//! Typed, namespaced persistent maps.
//!
//! A [`PersistMap`] is a concurrent in-memory map of decoded values,
//! namespaced inside a [`Store`]'s log: every key `k` of map `m` is
//! recorded as `m:k`. Reads never touch the log. Writes come in three
//! durability tiers:
//!
//! - **Deferred** (`set_async`, `delete_async`, `update_async`): update
//!   memory, mark the key dirty, return. The record is written by the next
//!   sync pass.
//! - **Immediate** (`set`, `delete`, `update`): update memory and append
//!   the record in one step under the key's bucket lock. The record is in
//!   the OS page cache when the call returns.
//! - **Synced** (`set_fsync`, `delete_fsync`, `update_fsync`): the
//!   immediate sequence plus an fsync. The record is on disk.
//!
//! Deferred and immediate writes to the same key may interleave at the log
//! level: a still-dirty deferred value supersedes an interleaved immediate
//! record at the next sync, because sync writes the current in-memory
//! value. This is documented behavior.
//!
//! Mutators do not return I/O errors; append, encode, and fsync failures
//! are routed to the store's error handler (see
//! [`Store::set_error_handler`]).

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreResult, StoreError};
use crate::key::validate_key;
use crate::record::{encode_record, Op};
use crate::store::{Orphan, Store};

/// What the update closure decided to do with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateAction {
    Set,
    Delete,
    Cancel,
}

/// Mutable view of one entry, passed to update closures.
///
/// The closure may mutate [`value`](Self::value) in place (the default
/// action is "set"), call [`set`](Self::set), request
/// [`delete`](Self::delete), or [`cancel`](Self::cancel) to leave the
/// entry untouched. Cancellation writes no record even in the immediate
/// and synced tiers.
#[derive(Debug)]
pub struct Update<T> {
    /// Current value of the entry, or the default value when absent.
    pub value: T,
    /// Whether the key was present when the closure was invoked.
    pub exists: bool,
    action: UpdateAction,
}

impl<T> Update<T> {
    fn existing(value: T) -> Self {
        Self {
            value,
            exists: true,
            action: UpdateAction::Set,
        }
    }

    fn absent() -> Self
    where
        T: Default,
    {
        Self {
            value: T::default(),
            exists: false,
            action: UpdateAction::Set,
        }
    }

    /// Replaces the value. Mutating [`value`](Self::value) directly has
    /// the same effect.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.action = UpdateAction::Set;
    }

    /// Requests deletion of the entry.
    pub fn delete(&mut self) {
        self.action = UpdateAction::Delete;
    }

    /// Leaves the entry untouched and writes no record.
    pub fn cancel(&mut self) {
        self.action = UpdateAction::Cancel;
    }
}

/// Type-erased view of a registered map, used by the store for record
/// dispatch during replay, the shrink snapshot, the background sync pass,
/// and failed-load cleanup.
pub(crate) trait MapHandle: Send + Sync {
    /// Applies one replayed record to the in-memory map. `key` has the
    /// namespace prefix already stripped.
    fn apply_record(&self, op: Op, key: &str, value: &[u8]) -> CoreResult<()>;

    /// Writes one set record per live entry to `out`, returning the
    /// record count.
    fn write_live_records(&self, out: &mut dyn Write) -> CoreResult<u64>;

    /// Drains the dirty set, appending one record per dirty key. Failed
    /// keys keep their dirty flag.
    fn sync_dirty(&self, store: &Store);

    /// Discards all in-memory state.
    fn clear(&self);

    /// Live entry count.
    fn len(&self) -> usize;
}

struct MapInner<T> {
    name: String,
    prefix: String,
    data: DashMap<String, T>,
    dirty: DashMap<String, ()>,
}

impl<T> MapHandle for MapInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn apply_record(&self, op: Op, key: &str, value: &[u8]) -> CoreResult<()> {
        match op {
            Op::Set => {
                let decoded: T = walmap_codec::from_line_json(value)?;
                self.data.insert(key.to_string(), decoded);
            }
            Op::Delete => {
                self.data.remove(key);
            }
        }
        Ok(())
    }

    fn write_live_records(&self, out: &mut dyn Write) -> CoreResult<u64> {
        let mut written = 0u64;
        for entry in self.data.iter() {
            let encoded = walmap_codec::to_line_json(entry.value())?;
            let full_key = format!("{}{}", self.prefix, entry.key());
            out.write_all(&encode_record(Op::Set, &full_key, &encoded))?;
            written += 1;
        }
        Ok(written)
    }

    fn sync_dirty(&self, store: &Store) {
        let keys: Vec<String> = self.dirty.iter().map(|entry| entry.key().clone()).collect();

        for key in keys {
            let full_key = format!("{}{}", self.prefix, key);
            let mut store_gone = false;

            // The dirty flag is removed under its bucket lock only after
            // the record is appended, so a concurrent mutator that re-adds
            // the flag is never lost.
            self.dirty.remove_if(&key, |_, _| {
                let current = self.data.get(&key).map(|entry| entry.value().clone());
                let result = match current {
                    Some(value) => walmap_codec::to_line_json(&value)
                        .map_err(StoreError::from)
                        .and_then(|encoded| store.append_set(&full_key, &encoded)),
                    None => store.append_delete(&full_key),
                };
                match result {
                    Ok(()) => true,
                    Err(StoreError::NotLoaded) => {
                        store_gone = true;
                        false
                    }
                    Err(err) => {
                        tracing::warn!(
                            key = %full_key,
                            error = %err,
                            "dirty key flush failed, keeping dirty flag"
                        );
                        store.report(err);
                        false
                    }
                }
            });

            if store_gone {
                break;
            }
        }
    }

    fn clear(&self) {
        self.data.clear();
        self.dirty.clear();
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// A thread-safe persistent map with typed values.
///
/// Created with [`PersistMap::new`] against a [`Store`]. Registering
/// before [`Store::open`] claims the namespace's records during replay;
/// registering afterwards claims them from the orphan table. The handle
/// is cheap to clone and keeps its store alive.
///
/// # Example
///
/// ```no_run
/// use walmap_core::{PersistMap, Store};
///
/// let store = Store::new();
/// let users: PersistMap<String> = PersistMap::new(&store, "users")?;
/// store.open("data.wal")?;
///
/// users.set("alice", "admin".to_string());
/// assert_eq!(users.get("alice"), Some("admin".to_string()));
/// store.close()?;
/// # Ok::<(), walmap_core::StoreError>(())
/// ```
pub struct PersistMap<T> {
    store: Store,
    inner: Arc<MapInner<T>>,
}

impl<T> Clone for PersistMap<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PersistMap<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Registers a typed map under `name` in the store.
    ///
    /// Full log keys for this map are `name` + `:` + user key. The name
    /// must pass the key validator; it should not itself contain `:`,
    /// since the first `:` of a full key is the namespace split.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidKey`] for a name with control characters.
    /// - [`StoreError::MapAlreadyExists`] if the namespace is taken.
    /// - [`StoreError::MapClosed`] if the namespace was closed earlier.
    /// - [`StoreError::NotLoaded`] if the store is already closed.
    /// - [`StoreError::Codec`] if a claimed orphan fails to decode.
    pub fn new(store: &Store, name: &str) -> CoreResult<Self> {
        validate_key(name)?;

        let shared = &store.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::NotLoaded);
        }
        if shared.closed_maps.contains_key(name) {
            return Err(StoreError::MapClosed {
                name: name.to_string(),
            });
        }

        let inner = Arc::new(MapInner {
            name: name.to_string(),
            prefix: format!("{name}:"),
            data: DashMap::new(),
            dirty: DashMap::new(),
        });

        match shared.maps.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(StoreError::MapAlreadyExists {
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&inner) as Arc<dyn MapHandle>);
            }
        }

        let map = Self {
            store: store.clone(),
            inner,
        };

        if shared.loaded.load(Ordering::Acquire) {
            if let Err(err) = map.claim_orphans() {
                shared.maps.remove(name);
                return Err(err);
            }
        }

        Ok(map)
    }

    /// Moves every orphan entry with this map's prefix into the map.
    fn claim_orphans(&self) -> CoreResult<()> {
        let prefix = self.inner.prefix.as_str();
        let matching: Vec<String> = self
            .store
            .shared
            .orphans
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for full_key in matching {
            if let Some((_, orphan)) = self.store.shared.orphans.remove(&full_key) {
                let bytes = match &orphan {
                    Orphan::Raw(bytes) => bytes.as_slice(),
                    Orphan::Decoded { encoded, .. } => encoded.as_slice(),
                };
                self.inner
                    .apply_record(Op::Set, &full_key[prefix.len()..], bytes)?;
            }
        }
        Ok(())
    }

    /// Returns the map's namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the store this map is registered in.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Retrieves the value for `key` from memory.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.data.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns `true` if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Visits each entry, stopping early when the callback returns
    /// `false`.
    ///
    /// Iteration is weakly consistent: each key is visited at most once,
    /// concurrent mutations may or may not be observed, and ordering is
    /// unspecified.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &T) -> bool,
    {
        for entry in self.inner.data.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    // --- Deferred tier ---------------------------------------------------

    /// Sets `key` in memory and marks it dirty for the next sync pass.
    pub fn set_async(&self, key: &str, value: T) {
        self.inner.data.insert(key.to_string(), value);
        self.inner.dirty.insert(key.to_string(), ());
    }

    /// Removes `key` from memory and marks it dirty for the next sync
    /// pass. Returns whether the key existed.
    pub fn delete_async(&self, key: &str) -> bool {
        let existed = self.inner.data.remove(key).is_some();
        self.inner.dirty.insert(key.to_string(), ());
        existed
    }

    /// Applies `updater` to the entry under its bucket lock and marks the
    /// key dirty unless the closure cancelled.
    ///
    /// Returns the value after the update and whether the key exists
    /// afterwards.
    pub fn update_async<F>(&self, key: &str, updater: F) -> (T, bool)
    where
        F: FnOnce(&mut Update<T>),
        T: Default,
    {
        let (value, exists, changed) = self.apply_in_memory(key, updater);
        if changed {
            self.inner.dirty.insert(key.to_string(), ());
        }
        (value, exists)
    }

    // --- Immediate tier --------------------------------------------------

    /// Sets `key` and appends the record in one step under the key's
    /// bucket lock.
    pub fn set(&self, key: &str, value: T) {
        let full_key = self.full_key(key);
        let encoded = match walmap_codec::to_line_json(&value) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.store.report(StoreError::from(err));
                return;
            }
        };

        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(value);
                self.persist_set(&full_key, &encoded);
            }
            Entry::Vacant(entry) => {
                let _guard = entry.insert(value);
                self.persist_set(&full_key, &encoded);
            }
        }
    }

    /// Removes `key` and appends a delete record under the key's bucket
    /// lock. Returns whether the key existed; the record is written
    /// either way.
    pub fn delete(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.persist_delete(&full_key);
                entry.remove();
                true
            }
            Entry::Vacant(_guard) => {
                self.persist_delete(&full_key);
                false
            }
        }
    }

    /// Applies `updater` to the entry and appends the resulting record,
    /// all under the key's bucket lock.
    ///
    /// Returns the value after the update and whether the key exists
    /// afterwards. A cancelled update writes no record.
    pub fn update<F>(&self, key: &str, updater: F) -> (T, bool)
    where
        F: FnOnce(&mut Update<T>),
        T: Default,
    {
        let full_key = self.full_key(key);
        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let mut update = Update::existing(entry.get().clone());
                updater(&mut update);
                match update.action {
                    UpdateAction::Set => match walmap_codec::to_line_json(&update.value) {
                        Ok(encoded) => {
                            entry.insert(update.value.clone());
                            self.persist_set(&full_key, &encoded);
                            (update.value, true)
                        }
                        Err(err) => {
                            self.store.report(StoreError::from(err));
                            (entry.get().clone(), true)
                        }
                    },
                    UpdateAction::Delete => {
                        self.persist_delete(&full_key);
                        entry.remove();
                        (T::default(), false)
                    }
                    UpdateAction::Cancel => (entry.get().clone(), true),
                }
            }
            Entry::Vacant(entry) => {
                let mut update = Update::absent();
                updater(&mut update);
                match update.action {
                    UpdateAction::Set => match walmap_codec::to_line_json(&update.value) {
                        Ok(encoded) => {
                            let _guard = entry.insert(update.value.clone());
                            self.persist_set(&full_key, &encoded);
                            (update.value, true)
                        }
                        Err(err) => {
                            self.store.report(StoreError::from(err));
                            (T::default(), false)
                        }
                    },
                    UpdateAction::Delete => {
                        self.persist_delete(&full_key);
                        (T::default(), false)
                    }
                    UpdateAction::Cancel => (T::default(), false),
                }
            }
        }
    }

    // --- Synced tier -----------------------------------------------------

    /// [`set`](Self::set), then fsync.
    pub fn set_fsync(&self, key: &str, value: T) {
        self.set(key, value);
        self.fsync();
    }

    /// [`delete`](Self::delete), then fsync.
    pub fn delete_fsync(&self, key: &str) -> bool {
        let existed = self.delete(key);
        self.fsync();
        existed
    }

    /// [`update`](Self::update), then fsync.
    pub fn update_fsync<F>(&self, key: &str, updater: F) -> (T, bool)
    where
        F: FnOnce(&mut Update<T>),
        T: Default,
    {
        let result = self.update(key, updater);
        self.fsync();
        result
    }

    // --- In-memory only --------------------------------------------------

    /// Sets `key` in memory without marking it dirty. The change is not
    /// persisted until some other write to the key is.
    pub fn set_in_memory(&self, key: &str, value: T) {
        self.inner.data.insert(key.to_string(), value);
    }

    /// Applies `updater` under the key's bucket lock without marking the
    /// key dirty.
    pub fn update_in_memory<F>(&self, key: &str, updater: F) -> (T, bool)
    where
        F: FnOnce(&mut Update<T>),
        T: Default,
    {
        let (value, exists, _) = self.apply_in_memory(key, updater);
        (value, exists)
    }

    /// Appends a record for every dirty key, clearing the flags that
    /// persist successfully.
    pub fn sync(&self) {
        self.inner.sync_dirty(&self.store);
    }

    /// Syncs the map's dirty keys and removes it from the store.
    ///
    /// The namespace joins the closed set and cannot be registered again
    /// on this store.
    pub fn close(&self) {
        self.inner.sync_dirty(&self.store);
        self.store.shared.maps.remove(&self.inner.name);
        self.store
            .shared
            .closed_maps
            .insert(self.inner.name.clone(), ());
    }

    /// In-memory update shared by the deferred and in-memory tiers.
    /// Returns (value, exists, changed).
    fn apply_in_memory<F>(&self, key: &str, updater: F) -> (T, bool, bool)
    where
        F: FnOnce(&mut Update<T>),
        T: Default,
    {
        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let mut update = Update::existing(entry.get().clone());
                updater(&mut update);
                match update.action {
                    UpdateAction::Set => {
                        entry.insert(update.value.clone());
                        (update.value, true, true)
                    }
                    UpdateAction::Delete => {
                        entry.remove();
                        (T::default(), false, true)
                    }
                    UpdateAction::Cancel => (entry.get().clone(), true, false),
                }
            }
            Entry::Vacant(entry) => {
                let mut update = Update::absent();
                updater(&mut update);
                match update.action {
                    UpdateAction::Set => {
                        let _guard = entry.insert(update.value.clone());
                        (update.value, true, true)
                    }
                    UpdateAction::Delete => (T::default(), false, true),
                    UpdateAction::Cancel => (T::default(), false, false),
                }
            }
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.prefix, key)
    }

    fn persist_set(&self, full_key: &str, encoded: &[u8]) {
        if let Err(err) = self.store.append_set(full_key, encoded) {
            self.store.report(err);
        }
    }

    fn persist_delete(&self, full_key: &str) {
        if let Err(err) = self.store.append_delete(full_key) {
            self.store.report(err);
        }
    }

    fn fsync(&self) {
        if let Err(err) = self.store.fsync_file() {
            self.store.report(err);
        }
    }
}

impl<T> std::fmt::Debug for PersistMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistMap")
            .field("name", &self.inner.name)
            .field("len", &self.inner.data.len())
            .field("dirty", &self.inner.dirty.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(path: &std::path::Path) -> Store {
        let store = Store::new();
        store.open(path).unwrap();
        store
    }

    #[test]
    fn set_get_delete() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));
        let map: PersistMap<String> = PersistMap::new(&store, "users").unwrap();

        map.set("alice", "admin".to_string());
        assert_eq!(map.get("alice"), Some("admin".to_string()));

        assert!(map.delete("alice"));
        assert_eq!(map.get("alice"), None);
        assert!(!map.delete("alice"));

        store.close().unwrap();
    }

    #[test]
    fn async_tier_persists_via_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.wal");
        {
            // Park the background loop so the record counts below are
            // driven only by the explicit fsync_all call.
            let store = Store::new();
            store.set_sync_interval(std::time::Duration::from_secs(3600));
            store.open(&path).unwrap();
            let map: PersistMap<i64> = PersistMap::new(&store, "counts").unwrap();

            map.set_async("hits", 5);
            // Nothing appended yet: the only record activity is deferred.
            assert_eq!(store.stats().wal_records, 0);

            store.fsync_all().unwrap();
            assert_eq!(store.stats().wal_records, 1);
            store.close().unwrap();
        }

        let store = open_store(&path);
        let map: PersistMap<i64> = PersistMap::new(&store, "counts").unwrap();
        assert_eq!(map.get("hits"), Some(5));
        store.close().unwrap();
    }

    #[test]
    fn delete_async_reports_existence() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));
        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();

        map.set_async("k", 1);
        assert!(map.delete_async("k"));
        assert!(!map.delete_async("k"));
        store.close().unwrap();
    }

    #[test]
    fn update_existing_and_absent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));
        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();

        let (value, exists) = map.update("n", |update| {
            assert!(!update.exists);
            update.value = 10;
        });
        assert_eq!((value, exists), (10, true));

        let (value, exists) = map.update("n", |update| {
            assert!(update.exists);
            update.value += 5;
        });
        assert_eq!((value, exists), (15, true));

        let (_, exists) = map.update("n", |update| update.delete());
        assert!(!exists);
        assert_eq!(map.get("n"), None);

        store.close().unwrap();
    }

    #[test]
    fn cancelled_update_writes_no_record() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));
        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();

        map.set("n", 1);
        let records_before = store.stats().wal_records;

        let (value, exists) = map.update("n", |update| {
            update.value = 999;
            update.cancel();
        });
        assert_eq!((value, exists), (1, true));
        assert_eq!(map.get("n"), Some(1));
        assert_eq!(store.stats().wal_records, records_before);

        store.close().unwrap();
    }

    #[test]
    fn in_memory_mutations_do_not_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.wal");
        {
            let store = open_store(&path);
            let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();

            map.set_in_memory("ghost", 1);
            map.update_in_memory("ghost", |update| update.value += 1);
            assert_eq!(map.get("ghost"), Some(2));

            store.close().unwrap();
        }

        let store = open_store(&path);
        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();
        assert_eq!(map.get("ghost"), None);
        store.close().unwrap();
    }

    #[test]
    fn duplicate_registration_fails() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));

        let _map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();
        let err = PersistMap::<i64>::new(&store, "m").unwrap_err();
        assert!(matches!(err, StoreError::MapAlreadyExists { .. }));
        store.close().unwrap();
    }

    #[test]
    fn closed_namespace_cannot_be_reused() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));

        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();
        map.close();

        let err = PersistMap::<i64>::new(&store, "m").unwrap_err();
        assert!(matches!(err, StoreError::MapClosed { .. }));
        store.close().unwrap();
    }

    #[test]
    fn invalid_map_name_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));

        let err = PersistMap::<i64>::new(&store, "bad\u{0}name").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        store.close().unwrap();
    }

    #[test]
    fn range_stops_on_false() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("m.wal"));
        let map: PersistMap<i64> = PersistMap::new(&store, "m").unwrap();

        for i in 0..10 {
            map.set_async(&format!("k{i}"), i);
        }

        let mut visited = 0;
        map.range(|_, _| {
            visited += 1;
            visited < 4
        });
        assert_eq!(visited, 4);
        assert_eq!(map.len(), 10);

        store.close().unwrap();
    }

    #[test]
    fn map_registered_after_open_claims_orphans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.wal");
        {
            let store = open_store(&path);
            let map: PersistMap<i64> = PersistMap::new(&store, "late").unwrap();
            map.set("k", 41);
            map.set("k", 42);
            store.close().unwrap();
        }

        // Open with no map registered: both records land in the orphan
        // table; registration afterwards claims the surviving entry.
        let store = open_store(&path);
        assert_eq!(store.stats().active_keys, 1);

        let map: PersistMap<i64> = PersistMap::new(&store, "late").unwrap();
        assert_eq!(map.get("k"), Some(42));
        assert_eq!(store.stats().active_keys, 1);
        assert_eq!(store.shared.orphans.len(), 0);

        store.close().unwrap();
    }

    #[test]
    fn empty_namespace_and_empty_user_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.wal");
        {
            let store = open_store(&path);
            let map: PersistMap<String> = PersistMap::new(&store, "").unwrap();
            map.set("", "empty-on-empty".to_string());
            map.set("k", "plain".to_string());
            store.close().unwrap();
        }

        let store = Store::new();
        let map: PersistMap<String> = PersistMap::new(&store, "").unwrap();
        store.open(&path).unwrap();
        assert_eq!(map.get(""), Some("empty-on-empty".to_string()));
        assert_eq!(map.get("k"), Some("plain".to_string()));
        store.close().unwrap();
    }
}
