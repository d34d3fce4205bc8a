//! Deadline-driven timer service.
//!
//! One named thread sleeps until the earliest armed deadline and runs fire
//! callbacks inline. [`Timer`] is the single-shot, re-armable handle bound to
//! the service; cancelling a timer removes its pending entry (dropping the
//! entry releases whatever the fire callback captured) and waits out any fire
//! already in flight, so after `cancel` returns the callback is guaranteed to
//! be neither pending nor running.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type FireCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    timer_id: u64,
    callback: FireCallback,
}

type EntryKey = (Instant, u64);

struct TimerState {
    entries: BTreeMap<EntryKey, TimerEntry>,
    firing: Option<u64>,
    shutdown: bool,
    seq: u64,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
    next_timer_id: AtomicU64,
    thread_id: Mutex<Option<ThreadId>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerInner>,
}

impl TimerService {
    pub fn start() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                firing: None,
                shutdown: false,
                seq: 0,
            }),
            cond: Condvar::new(),
            next_timer_id: AtomicU64::new(1),
            thread_id: Mutex::new(None),
            thread: Mutex::new(None),
        });

        let run_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("strand-timer".into())
            .spawn(move || run(run_inner))
            .expect("failed to spawn timer thread");
        *inner.thread_id.lock() = Some(handle.thread().id());
        *inner.thread.lock() = Some(handle);

        Self { inner }
    }

    /// Process-wide service, started on first use and never shut down.
    pub fn global() -> &'static TimerService {
        static GLOBAL: OnceLock<TimerService> = OnceLock::new();
        GLOBAL.get_or_init(TimerService::start)
    }

    pub fn timer(&self) -> Timer {
        Timer {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed),
            armed: Mutex::new(None),
        }
    }

    /// Stops the service thread. Entries still pending are dropped unfired.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cond.notify_all();
            std::mem::take(&mut state.entries)
        };
        drop(dropped);

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(inner: Arc<TimerInner>) {
    loop {
        let mut state = inner.state.lock();
        if state.shutdown {
            break;
        }
        let next = state.entries.keys().next().copied();
        match next {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(key @ (deadline, _)) => {
                let now = Instant::now();
                if deadline > now {
                    inner.cond.wait_until(&mut state, deadline);
                    continue;
                }
                if let Some(entry) = state.entries.remove(&key) {
                    state.firing = Some(entry.timer_id);
                    drop(state);
                    (entry.callback)();
                    let mut state = inner.state.lock();
                    state.firing = None;
                    inner.cond.notify_all();
                }
            }
        }
    }
}

/// Single-shot timer handle. Re-arming after a fire is allowed; arming while
/// already armed replaces the pending entry.
pub struct Timer {
    inner: Arc<TimerInner>,
    id: u64,
    armed: Mutex<Option<EntryKey>>,
}

impl Timer {
    pub fn arm(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        state.seq += 1;
        let key = (Instant::now() + delay, state.seq);
        let replaced = {
            let mut armed = self.armed.lock();
            let prior = armed.take().and_then(|k| state.entries.remove(&k));
            *armed = Some(key);
            prior
        };
        state.entries.insert(
            key,
            TimerEntry {
                timer_id: self.id,
                callback: Box::new(callback),
            },
        );
        self.inner.cond.notify_all();
        drop(state);
        drop(replaced);
    }

    /// Disarms the timer and waits for any in-flight fire to finish.
    ///
    /// When called from inside this timer's own fire callback the in-flight
    /// wait is skipped; waiting there would deadlock the service thread.
    pub fn cancel(&self) {
        let pending = self.armed.lock().take();
        let mut state = self.inner.state.lock();
        let removed = pending.and_then(|key| state.entries.remove(&key));
        if !self.on_timer_thread() {
            while state.firing == Some(self.id) {
                self.inner.cond.wait(&mut state);
            }
        }
        drop(state);
        // Dropping the entry outside the lock releases whatever the fire
        // callback captured without re-entering the service.
        drop(removed);
    }

    fn on_timer_thread(&self) -> bool {
        self.inner
            .thread_id
            .lock()
            .map_or(false, |id| id == thread::current().id())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
