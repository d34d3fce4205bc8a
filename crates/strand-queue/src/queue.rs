//! Two-channel callback dispatcher.
//!
//! A queue is a pair of channels (`Work`, `Completion`), each an ordered FIFO
//! of one-shot callback records plus a dispatch mode that decides where those
//! records run. Records carry a caller-chosen `tag` so an owner can later
//! remove everything it submitted without invoking it.
//!
//! Queue handles are reference counted; the channels themselves are shared
//! `Arc`s, which is what makes composite queues cheap: a composite queue is
//! just a new pair of handles onto channels that already exist.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::lockless::LocklessList;
use crate::pool::{ActionComplete, ThreadPool};

/// Where submitted callbacks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Submission enqueues and schedules a drain on the channel's thread pool.
    ThreadPool,
    /// Submission only enqueues; someone must call [`AsyncQueue::dispatch`].
    Manual,
    /// Submission enqueues and wakes the dispatching thread named at queue
    /// creation, which is expected to be draining via
    /// [`AsyncQueue::dispatch`].
    FixedThread,
    /// The submitting thread drains synchronously before returning.
    Immediate,
}

/// Selects one of the queue's two channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackType {
    Work,
    Completion,
}

pub type AsyncQueueHandle = Arc<AsyncQueue>;

type SubmitHook = Box<dyn Fn(CallbackType) + Send + Sync>;

struct QueueEntry {
    tag: usize,
    func: Box<dyn FnOnce() + Send>,
}

struct Channel {
    mode: DispatchMode,
    fifo: LocklessList<QueueEntry>,
    dispatch_lock: Mutex<()>,
    dispatch_cond: Condvar,
    pool: Option<ThreadPool>,
}

impl Channel {
    fn new(mode: DispatchMode) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Channel>| {
            let pool = (mode == DispatchMode::ThreadPool).then(|| {
                let weak = weak.clone();
                ThreadPool::new(Box::new(move |action| Channel::pool_drain(&weak, action)))
            });
            Channel {
                mode,
                fifo: LocklessList::new(),
                dispatch_lock: Mutex::new(()),
                dispatch_cond: Condvar::new(),
                pool,
            }
        })
    }

    // One pool submission drains one record. The action is completed before
    // the channel reference drops and before the record runs: either of those
    // may release the last queue handle and terminate this pool from the
    // worker's own stack, and terminate's drain must not wait on the very
    // invocation doing the terminating.
    fn pool_drain(weak: &Weak<Channel>, action: &ActionComplete) {
        let entry = match weak.upgrade() {
            Some(channel) => {
                let entry = channel.fifo.pop_front();
                action.complete();
                entry
            }
            None => {
                action.complete();
                None
            }
        };
        if let Some(entry) = entry {
            (entry.func)();
        }
    }

    fn submit(&self, entry: QueueEntry) {
        self.fifo.push_back(entry);
        {
            // Taking the lock orders this notify against a dispatcher that
            // just found the FIFO empty and is about to wait.
            let _guard = self.dispatch_lock.lock();
            self.dispatch_cond.notify_all();
        }
        match self.mode {
            DispatchMode::ThreadPool => {
                if let Some(pool) = &self.pool {
                    pool.submit();
                }
            }
            DispatchMode::Immediate => {
                self.drain_one();
            }
            DispatchMode::Manual | DispatchMode::FixedThread => {}
        }
    }

    fn drain_one(&self) -> bool {
        match self.fifo.pop_front() {
            Some(entry) => {
                (entry.func)();
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, timeout: Duration) -> bool {
        if self.drain_one() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut guard = self.dispatch_lock.lock();
                while self.fifo.is_empty() {
                    if self
                        .dispatch_cond
                        .wait_until(&mut guard, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
            if self.drain_one() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }
}

/// Two-channel dispatcher. Create via [`AsyncQueue::new`],
/// [`AsyncQueue::new_shared`] or [`AsyncQueue::new_composite`]; share by
/// cloning the `Arc` handle.
pub struct AsyncQueue {
    work: Arc<Channel>,
    completion: Arc<Channel>,
    submit_hooks: Mutex<Vec<(u64, SubmitHook)>>,
    next_hook_id: AtomicU64,
}

impl AsyncQueue {
    pub fn new(work_mode: DispatchMode, completion_mode: DispatchMode) -> AsyncQueueHandle {
        Arc::new(AsyncQueue {
            work: Channel::new(work_mode),
            completion: Channel::new(completion_mode),
            submit_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        })
    }

    /// Returns the process-wide shared queue for `(id, work_mode,
    /// completion_mode)`, creating it on first use. Subsequent calls with the
    /// same key return the same queue for as long as any handle to it lives.
    pub fn new_shared(
        id: u64,
        work_mode: DispatchMode,
        completion_mode: DispatchMode,
    ) -> AsyncQueueHandle {
        let mut registry = shared_registry().lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        let key = (id, work_mode, completion_mode);
        if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let queue = Self::new(work_mode, completion_mode);
        registry.insert(key, Arc::downgrade(&queue));
        trace!(id, "created shared queue");
        queue
    }

    /// Builds a queue whose `Work` channel aliases `work_from`'s and whose
    /// `Completion` channel aliases `completion_from`'s. Submissions through
    /// the composite land in (and dispatch from) the source channels.
    pub fn new_composite(
        work_from: &AsyncQueueHandle,
        completion_from: &AsyncQueueHandle,
    ) -> AsyncQueueHandle {
        Arc::new(AsyncQueue {
            work: Arc::clone(&work_from.work),
            completion: Arc::clone(&completion_from.completion),
            submit_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        })
    }

    fn channel(&self, kind: CallbackType) -> &Channel {
        match kind {
            CallbackType::Work => &self.work,
            CallbackType::Completion => &self.completion,
        }
    }

    /// Submits a one-shot callback on the given channel. `tag` identifies the
    /// submitter for later [`remove_callbacks`](Self::remove_callbacks).
    pub fn submit(&self, kind: CallbackType, tag: usize, func: impl FnOnce() + Send + 'static) {
        {
            let hooks = self.submit_hooks.lock();
            for (_, hook) in hooks.iter() {
                hook(kind);
            }
        }
        self.channel(kind).submit(QueueEntry {
            tag,
            func: Box::new(func),
        });
    }

    /// Drains at most one callback from the channel, waiting up to `timeout`
    /// for one to arrive. Returns whether a callback ran.
    pub fn dispatch(&self, kind: CallbackType, timeout: Duration) -> bool {
        self.channel(kind).dispatch(timeout)
    }

    /// Removes every queued callback on the channel whose tag satisfies
    /// `pred`, without invoking it. Returns how many were removed.
    pub fn remove_callbacks(&self, kind: CallbackType, mut pred: impl FnMut(usize) -> bool) -> usize {
        let removed = self.channel(kind).fifo.remove_where(|entry| pred(entry.tag));
        removed.len()
    }

    pub fn is_empty(&self, kind: CallbackType) -> bool {
        self.channel(kind).fifo.is_empty()
    }

    /// Registers a hook invoked on every submission (before the callback is
    /// enqueued). Returns a token for [`unregister_submit_hook`](Self::unregister_submit_hook).
    pub fn register_submit_hook(&self, hook: impl Fn(CallbackType) + Send + Sync + 'static) -> u64 {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.submit_hooks.lock().push((id, Box::new(hook)));
        id
    }

    pub fn unregister_submit_hook(&self, token: u64) {
        self.submit_hooks.lock().retain(|(id, _)| *id != token);
    }
}

type SharedKey = (u64, DispatchMode, DispatchMode);

fn shared_registry() -> &'static Mutex<HashMap<SharedKey, Weak<AsyncQueue>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<SharedKey, Weak<AsyncQueue>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Stable per-thread key for shared-queue creation, usable where a portable
/// numeric thread id is needed.
pub fn current_thread_key() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static KEY: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    KEY.with(|key| *key)
}
