//! Online log compaction.
//!
//! A shrink rebuilds the log so it contains exactly one set record per
//! live key, discarding delete records and superseded sets, while writers
//! keep appending. Correctness rests on the pending buffer: from the
//! moment the shrink flag is set, every appended record image is mirrored
//! into the buffer (see the append path in `store.rs`), and the buffer is
//! drained into the new file before the swap.
//!
//! ## Protocol
//!
//! 1. Under the file mutex: refuse if a shrink is already running, set
//!    the flag, clear the pending buffer.
//! 2. Create the sibling temp file `<path>.tmp`, write the header.
//! 3. Snapshot, with no lock held: one set record per orphan entry and
//!    per live entry of every registered map.
//! 4. fsync the temp file.
//! 5. Up to three rounds: swap the pending buffer out under the mutex,
//!    append it to the temp file, fsync. Stop early when a round begins
//!    with an empty buffer.
//! 6. Sealing, under the file mutex held to the end: append the remaining
//!    pending records, clear the flag, fsync, rename the temp file over
//!    the live path, reopen in append mode, swap the handle, and reset
//!    the record counter to the compacted count.
//!
//! Appenders are blocked only during step 6, and the temp file was
//! already fsynced by then, so the blocked window is the time to write
//! one last generation of pending records plus one fsync.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::background::BackgroundTask;
use crate::error::{CoreResult, StoreError};
use crate::record::{encode_record, Op, WAL_HEADER};
use crate::store::{Orphan, Store};

impl Store {
    /// Compacts the log file in place while writers continue.
    ///
    /// On return, `stats().wal_records` equals the number of records in
    /// the rebuilt file (which, with no concurrent writers, equals the
    /// live key count).
    ///
    /// # Errors
    ///
    /// - [`StoreError::ShrinkInProgress`] if a shrink is already running.
    /// - [`StoreError::NotLoaded`] if the store is not open.
    /// - [`StoreError::Codec`] if a live value fails to encode.
    /// - [`StoreError::Io`] for filesystem failures; the temp file is
    ///   removed and the live log is left untouched.
    pub fn shrink(&self) -> CoreResult<()> {
        let path = self
            .shared
            .path
            .read()
            .clone()
            .ok_or(StoreError::NotLoaded)?;

        {
            let mut guard = self.shared.log.lock();
            let log = guard.as_mut().ok_or(StoreError::NotLoaded)?;
            if log.shrinking {
                return Err(StoreError::ShrinkInProgress);
            }
            log.shrinking = true;
            log.pending.clear();
        }

        let tmp_path = tmp_path_for(&path);
        match self.build_compacted(&path, &tmp_path) {
            Ok(written) => {
                tracing::debug!(records = written, path = %path.display(), "shrink complete");
                Ok(())
            }
            Err(err) => {
                let mut guard = self.shared.log.lock();
                if let Some(log) = guard.as_mut() {
                    log.shrinking = false;
                    log.pending.clear();
                }
                drop(guard);
                let _ = fs::remove_file(&tmp_path);
                Err(err)
            }
        }
    }

    /// Steps 2–6 of the protocol. Returns the number of records written
    /// to the compacted file.
    fn build_compacted(&self, path: &Path, tmp_path: &Path) -> CoreResult<u64> {
        let mut tmp = File::create(tmp_path)?;
        tmp.write_all(format!("{WAL_HEADER}\n").as_bytes())?;
        let mut written = 0u64;

        // Snapshot phase. Weakly consistent iteration is fine here: any
        // entry that changes mid-snapshot also has its record in the
        // pending buffer, and later records win on replay.
        for entry in self.shared.orphans.iter() {
            let image = match entry.value() {
                Orphan::Raw(bytes) => encode_record(Op::Set, entry.key(), bytes),
                Orphan::Decoded { encoded, .. } => encode_record(Op::Set, entry.key(), encoded),
            };
            tmp.write_all(&image)?;
            written += 1;
        }
        for entry in self.shared.maps.iter() {
            written += entry.value().write_live_records(&mut tmp)?;
        }

        tmp.sync_all()?;

        // Drain loop: chase the writers for a bounded number of rounds.
        for _ in 0..3 {
            let pending = {
                let mut guard = self.shared.log.lock();
                let log = guard.as_mut().ok_or(StoreError::NotLoaded)?;
                std::mem::take(&mut log.pending)
            };
            if pending.is_empty() {
                break;
            }
            for image in &pending {
                tmp.write_all(image)?;
            }
            written += pending.len() as u64;
            tmp.sync_all()?;
        }

        // Sealing: the mutex stays held through the swap, so no appender
        // can observe the stale handle.
        let mut guard = self.shared.log.lock();
        let log = guard.as_mut().ok_or(StoreError::NotLoaded)?;
        for image in &log.pending {
            tmp.write_all(image)?;
        }
        written += log.pending.len() as u64;
        log.pending.clear();
        log.shrinking = false;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(tmp_path, path)?;
        log.file = OpenOptions::new().read(true).append(true).open(path)?;
        self.shared.wal_records.store(written, Ordering::Release);
        Ok(written)
    }

    /// Starts the auto-shrink monitor, replacing any previous one.
    ///
    /// Every `check_interval` the monitor compares the record count
    /// against the live key count and triggers a shrink when
    /// `records / live_keys >= ratio`, or when records remain with no
    /// live keys at all. A shrink already in flight is skipped without
    /// error.
    pub fn start_auto_shrink(&self, check_interval: Duration, ratio: f64) {
        let weak = Arc::downgrade(&self.shared);
        let task = BackgroundTask::spawn("walmap-autoshrink", check_interval, move || {
            let shared = weak.upgrade()?;
            let store = Store { shared };
            store.auto_shrink_tick(ratio);
            Some(check_interval)
        });

        let mut slot = self.shared.auto_shrink_task.lock();
        if let Some(mut previous) = slot.take() {
            previous.stop();
        }
        *slot = Some(task);
    }

    fn auto_shrink_tick(&self, ratio: f64) {
        let stats = self.stats();
        let due = match stats.record_ratio() {
            Some(current) => current >= ratio,
            None => stats.wal_records > 0,
        };
        if !due {
            return;
        }

        tracing::debug!(
            active_keys = stats.active_keys,
            wal_records = stats.wal_records,
            "auto-shrink triggered"
        );
        match self.shrink() {
            Ok(()) => {}
            Err(StoreError::ShrinkInProgress | StoreError::NotLoaded) => {}
            Err(err) => self.report(err),
        }
    }
}

/// Sibling temp path for the compacted file: `<path>.tmp`.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}
