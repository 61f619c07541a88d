//! Background worker threads.
//!
//! Both long-lived tasks of a store (the sync loop and the auto-shrink
//! monitor) share this shape: a named thread that sleeps, runs a body,
//! and re-arms. Shutdown is a flag plus a condvar notification, so
//! `stop()` interrupts a sleeping worker immediately instead of waiting
//! out the interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct TaskState {
    shutdown: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// A periodic worker thread with prompt shutdown.
pub(crate) struct BackgroundTask {
    state: Arc<TaskState>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawns a worker that sleeps `initial_delay`, runs `body`, and
    /// re-arms with the delay `body` returns. The worker exits when
    /// `body` returns `None` or the task is stopped.
    pub(crate) fn spawn<F>(name: &str, initial_delay: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let state = Arc::new(TaskState {
            shutdown: AtomicBool::new(false),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    {
                        let mut guard = worker_state.lock.lock();
                        if worker_state.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        worker_state.wakeup.wait_for(&mut guard, delay);
                        if worker_state.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                    }
                    match body() {
                        Some(next) => delay = next,
                        None => return,
                    }
                }
            })
            .expect("failed to spawn background thread");

        Self {
            state,
            handle: Some(handle),
        }
    }

    /// Signals shutdown and joins the worker.
    ///
    /// Safe to call from the worker thread itself (drop-through paths);
    /// the join is skipped in that case.
    pub(crate) fn stop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.state.lock.lock();
            self.state.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
