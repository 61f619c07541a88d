//! # walmap Core
//!
//! An embedded, type-safe, persistent key-value store: concurrent
//! in-memory maps whose contents survive process restarts through a
//! textual append-only write-ahead log.
//!
//! # Architecture
//!
//! - **Read path**: served from RAM. [`PersistMap::get`] is a concurrent
//!   hash-map lookup; no log I/O.
//! - **Write path**: three durability tiers per mutation: deferred
//!   (memory + dirty flag), immediate (record appended under the key's
//!   bucket lock), and synced (immediate plus fsync).
//! - **Recovery**: [`Store::open`] replays the log, dispatching records
//!   to registered maps by namespace prefix and buffering the rest as
//!   orphans for maps registered later.
//! - **Compaction**: [`Store::shrink`] rebuilds the log online down to
//!   one set record per live key; concurrent appends are captured in a
//!   pending buffer and replayed before the atomic rename-over.
//! - **Background**: a sync loop drains dirty keys and fsyncs on an
//!   adjustable interval; an optional monitor triggers shrinks by
//!   record-to-key ratio.
//!
//! # Log format
//!
//! ```text
//! go-persist 1\n            version header
//! S <key>\n<value>\n        set record
//! D <key>\n\n               delete record
//! ```
//!
//! Values are single-line JSON (see `walmap_codec`). Later records
//! override earlier ones for the same key; an incomplete trailing record
//! is ignored on load.
//!
//! # Example
//!
//! ```no_run
//! use walmap_core::{PersistMap, Store};
//!
//! let store = Store::new();
//! let sessions: PersistMap<u64> = PersistMap::new(&store, "sessions")?;
//! store.open("app.wal")?;
//!
//! sessions.set("alice", 1);            // durable in the OS page cache
//! sessions.set_async("bob", 2);        // durable at the next sync pass
//! sessions.set_fsync("carol", 3);      // durable on disk, now
//!
//! sessions.update("alice", |entry| entry.value += 10);
//!
//! store.close()?;
//! # Ok::<(), walmap_core::StoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod background;
mod error;
mod key;
mod map;
mod record;
mod shrink;
mod stats;
mod store;

pub use error::{CoreResult, StoreError};
pub use key::validate_key;
pub use map::{PersistMap, Update};
pub use record::{encode_record, Op, RawRecord, RecordReader, WAL_HEADER};
pub use stats::StoreStats;
pub use store::{
    open_single_map, Store, DEFAULT_SHRINK_CHECK_INTERVAL, DEFAULT_SHRINK_RATIO,
    DEFAULT_SYNC_INTERVAL,
};
