//! Per-call state record shared between the owning block and every scheduled
//! callback that was handed a reference.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use strand_queue::{AsyncQueueHandle, Timer};

use crate::block::BlockShared;
use crate::provider::AsyncProvider;
use crate::wait::WaitEvent;

pub(crate) const STATE_SIGNATURE: u32 = 0x5354_4E44;

static LIVE_STATES: AtomicUsize = AtomicUsize::new(0);

/// Number of per-call state records currently alive in the process.
///
/// Every `begin` creates one and every teardown path must release it; tests
/// use this counter to prove no path leaks.
pub fn live_state_count() -> usize {
    LIVE_STATES.load(Ordering::SeqCst)
}

pub(crate) struct AsyncState {
    pub(crate) signature: u32,
    pub(crate) canceled: AtomicBool,
    pub(crate) work_scheduled: AtomicBool,
    pub(crate) timer_scheduled: AtomicBool,
    pub(crate) provider: Arc<dyn AsyncProvider>,
    pub(crate) queue: AsyncQueueHandle,
    // Non-owning back-pointer; the caller may drop the block while callbacks
    // are still in flight, at which point the call is simply abandoned.
    pub(crate) block: Weak<BlockShared>,
    pub(crate) wait: WaitEvent,
    pub(crate) timer: Mutex<Option<Timer>>,
    pub(crate) token: usize,
    pub(crate) function: &'static str,
    pub(crate) result_size: AtomicUsize,
}

impl AsyncState {
    pub(crate) fn new(
        provider: Arc<dyn AsyncProvider>,
        queue: AsyncQueueHandle,
        block: Weak<BlockShared>,
        wait: WaitEvent,
        token: usize,
        function: &'static str,
    ) -> Arc<Self> {
        LIVE_STATES.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            signature: STATE_SIGNATURE,
            canceled: AtomicBool::new(false),
            work_scheduled: AtomicBool::new(false),
            timer_scheduled: AtomicBool::new(false),
            provider,
            queue,
            block,
            wait,
            timer: Mutex::new(None),
            token,
            function,
            result_size: AtomicUsize::new(0),
        })
    }

    /// Identity used to tag queue records belonging to this call.
    pub(crate) fn tag(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl Drop for AsyncState {
    fn drop(&mut self) {
        // The timer and queue handles release through their own drops.
        LIVE_STATES.fetch_sub(1, Ordering::SeqCst);
    }
}
