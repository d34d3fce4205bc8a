use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Manual-reset wait primitive signaled when a call reaches its terminal
/// status and the completion path has run. Cloning shares the primitive.
#[derive(Clone)]
pub struct WaitEvent {
    inner: Arc<WaitInner>,
}

struct WaitInner {
    satisfied: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitInner {
                satisfied: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn signal(&self) {
        let mut satisfied = self.inner.satisfied.lock();
        *satisfied = true;
        self.inner.cond.notify_all();
    }

    /// Blocks until signaled. Spurious wakeups are absorbed.
    pub fn wait(&self) {
        let mut satisfied = self.inner.satisfied.lock();
        while !*satisfied {
            self.inner.cond.wait(&mut satisfied);
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.satisfied.lock()
    }

    /// Rearms the event for reuse across calls.
    pub fn reset(&self) {
        *self.inner.satisfied.lock() = false;
    }
}

impl Default for WaitEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_signal() {
        let event = WaitEvent::new();
        let signaler = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signaler.signal();
        });
        event.wait();
        assert!(event.is_signaled());
        handle.join().unwrap();
    }

    #[test]
    fn reset_rearms() {
        let event = WaitEvent::new();
        event.signal();
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }
}
