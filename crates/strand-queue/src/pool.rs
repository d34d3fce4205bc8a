//! Owned worker-thread pool with a single pool-wide callback.
//!
//! A pool does not carry work items; `submit` only bumps a counter and wakes
//! a worker, which then invokes the one callback the pool was created with.
//! Whoever owns the pool decides what a submission means (for
//! [`crate::AsyncQueue`] it means "drain one record from my channel").
//!
//! Each invocation is handed an [`ActionComplete`]. A callback may invoke it
//! at the point where it has finished touching pool-owner state but still
//! wants to run more code on the same stack; `terminate`'s drain only waits
//! up to that point. This is what lets a callback drop the last handle to the
//! queue that owns this pool without deadlocking the teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

pub type PoolCallback = Box<dyn Fn(&ActionComplete) + Send + Sync>;

struct WakeState {
    calls: usize,
    terminate: bool,
}

struct PoolInner {
    wake: Mutex<WakeState>,
    wake_cond: Condvar,
    active: Mutex<usize>,
    active_cond: Condvar,
    callback: PoolCallback,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Early-completion hook handed to every pool callback invocation.
///
/// Invoking [`complete`](Self::complete) is optional; the worker invokes it
/// itself once the callback returns. Idempotent.
pub struct ActionComplete {
    inner: Arc<PoolInner>,
    invoked: AtomicBool,
}

impl ActionComplete {
    pub fn complete(&self) {
        if self.invoked.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut active = self.inner.active.lock();
        *active -= 1;
        self.inner.active_cond.notify_all();
    }

    fn invoked(&self) -> bool {
        self.invoked.load(Ordering::Acquire)
    }
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Spawns one worker per hardware thread (minimum one).
    pub fn new(callback: PoolCallback) -> Self {
        Self::with_threads(num_cpus::get().max(1), callback)
    }

    pub fn with_threads(threads: usize, callback: PoolCallback) -> Self {
        let inner = Arc::new(PoolInner {
            wake: Mutex::new(WakeState {
                calls: 0,
                terminate: false,
            }),
            wake_cond: Condvar::new(),
            active: Mutex::new(0),
            active_cond: Condvar::new(),
            callback,
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = inner.workers.lock();
        for _ in 0..threads.max(1) {
            let worker_inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name("strand-pool".into())
                .spawn(move || worker_loop(worker_inner))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
        drop(workers);

        Self { inner }
    }

    /// Queues one invocation of the pool callback.
    pub fn submit(&self) {
        {
            let mut active = self.inner.active.lock();
            *active += 1;
        }
        let mut wake = self.inner.wake.lock();
        wake.calls += 1;
        self.inner.wake_cond.notify_one();
    }

    /// Drains outstanding invocations and joins the workers.
    ///
    /// Safe to call from one of the pool's own workers: the calling worker's
    /// thread is detached instead of joined. Idempotent.
    pub fn terminate(&self) {
        {
            let mut wake = self.inner.wake.lock();
            wake.terminate = true;
            self.inner.wake_cond.notify_all();
        }
        {
            let mut active = self.inner.active.lock();
            while *active != 0 {
                self.inner.active_cond.wait(&mut active);
            }
        }

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        let self_id = thread::current().id();
        for handle in workers {
            if handle.thread().id() == self_id {
                // A worker terminating its own pool cannot join itself.
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
        debug!("thread pool terminated");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    let mut wake = inner.wake.lock();
    loop {
        if wake.calls == 0 {
            if wake.terminate {
                break;
            }
            inner.wake_cond.wait(&mut wake);
            continue;
        }
        wake.calls -= 1;
        drop(wake);

        let action = ActionComplete {
            inner: Arc::clone(&inner),
            invoked: AtomicBool::new(false),
        };
        (inner.callback)(&action);
        if !action.invoked() {
            action.complete();
        }

        wake = inner.wake.lock();
    }
}
