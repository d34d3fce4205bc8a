//! The public async call protocol.
//!
//! An [`AsyncBlock`] binds one in-flight asynchronous call to the per-call
//! state driving it. The lifecycle is: `begin` associates a provider,
//! `schedule` queues the first `do_work` (optionally after a delay), the
//! provider finishes by returning a terminal status or calling `complete`,
//! the completion path invokes the block's callback and signals its wait
//! primitive, and `result`/`cancel` finally extract and tear the state down.
//!
//! The terminal status is write-once: the first writer wins and every later
//! reader observes the same value. The internal field lock is held only for
//! O(1) reads and writes, never across a callback.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use strand_queue::{
    current_thread_key, AsyncQueue, AsyncQueueHandle, CallbackType, DispatchMode, TimerService,
};

use crate::error::{AsyncError, AsyncResult};
use crate::provider::AsyncProvider;
use crate::state::{AsyncState, STATE_SIGNATURE};
use crate::wait::WaitEvent;

/// Token recorded by [`AsyncBlock::run_async`] for its internal provider.
pub const RUN_ASYNC_TOKEN: usize = 0x5255_4E41;

pub type CompletionCallback = Box<dyn Fn(&AsyncBlock) + Send + Sync>;

pub(crate) struct BlockInternal {
    state: Option<Arc<AsyncState>>,
    status: AsyncResult,
}

impl BlockInternal {
    /// First non-`Pending` write wins; later writers observe defeat.
    fn try_set_terminal(&mut self, status: AsyncResult) -> bool {
        if self.status != Err(AsyncError::Pending) {
            return false;
        }
        // Pending is never a terminal value.
        self.status = if status == Err(AsyncError::Pending) {
            Err(AsyncError::Unexpected)
        } else {
            status
        };
        true
    }
}

pub(crate) struct BlockShared {
    queue: Option<AsyncQueueHandle>,
    callback: Option<CompletionCallback>,
    wait_event: Option<WaitEvent>,
    internal: Mutex<BlockInternal>,
}

impl Drop for BlockShared {
    fn drop(&mut self) {
        // A call whose result was never claimed still owes the provider its
        // cleanup; reap it when the last block handle goes away.
        if let Some(state) = self.internal.get_mut().state.take() {
            cleanup_state(state);
        }
    }
}

/// Handle to one asynchronous call. Cheap to clone; clones address the same
/// call. A block is single-use: once terminal and reaped it must be
/// [`reset`](AsyncBlock::reset) (or replaced) before the next `begin`.
#[derive(Clone)]
pub struct AsyncBlock {
    shared: Arc<BlockShared>,
}

#[derive(Default)]
pub struct AsyncBlockBuilder {
    queue: Option<AsyncQueueHandle>,
    callback: Option<CompletionCallback>,
    wait_event: Option<WaitEvent>,
}

impl AsyncBlockBuilder {
    /// Queue the call's work and completion callbacks dispatch on. Without
    /// one, `begin` binds the calling thread's shared default queue.
    pub fn queue(mut self, queue: AsyncQueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Completion callback invoked once when the call terminates.
    pub fn callback(mut self, callback: impl Fn(&AsyncBlock) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Externally owned wait primitive to signal on termination, in place of
    /// a per-call internal one.
    pub fn wait_event(mut self, event: WaitEvent) -> Self {
        self.wait_event = Some(event);
        self
    }

    pub fn build(self) -> AsyncBlock {
        AsyncBlock {
            shared: Arc::new(BlockShared {
                queue: self.queue,
                callback: self.callback,
                wait_event: self.wait_event,
                internal: Mutex::new(BlockInternal {
                    state: None,
                    status: Err(AsyncError::Pending),
                }),
            }),
        }
    }
}

impl AsyncBlock {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> AsyncBlockBuilder {
        AsyncBlockBuilder::default()
    }

    /// Associates a provider with this block, making the other operations
    /// meaningful. Fails with `InvalidArg` if the block already carries a
    /// call (in flight, or terminal and not yet reset).
    ///
    /// `token` and `function` identify the initiating API so a later
    /// [`result`](Self::result) can detect call/result mismatches.
    pub fn begin(
        &self,
        provider: Arc<dyn AsyncProvider>,
        token: usize,
        function: &'static str,
    ) -> AsyncResult {
        // Resolve the queue before taking the field lock; shared-queue
        // creation takes its own registry lock.
        let queue = match &self.shared.queue {
            Some(queue) => Arc::clone(queue),
            None => AsyncQueue::new_shared(
                current_thread_key(),
                DispatchMode::ThreadPool,
                DispatchMode::FixedThread,
            ),
        };
        let wait = self.shared.wait_event.clone().unwrap_or_default();

        let mut internal = self.shared.internal.lock();
        if internal.state.is_some() || internal.status != Err(AsyncError::Pending) {
            return Err(AsyncError::InvalidArg);
        }
        internal.state = Some(AsyncState::new(
            provider,
            queue,
            Arc::downgrade(&self.shared),
            wait,
            token,
            function,
        ));
        Ok(())
    }

    /// Queues the provider's `do_work`, after `delay` if non-zero.
    ///
    /// Calling this is optional: work driven entirely by an external
    /// completion source (overlapped I/O and the like) can skip scheduling
    /// and go straight to [`complete`](Self::complete). Double-scheduling
    /// fails with `Unexpected`.
    pub fn schedule(&self, delay: Duration) -> AsyncResult {
        let state = self.shared.internal.lock().state.clone();
        let Some(state) = state else {
            return Err(AsyncError::InvalidArg);
        };

        if !delay.is_zero() {
            let mut timer = state.timer.lock();
            if timer.is_none() {
                *timer = Some(TimerService::global().timer());
            }
        }

        if state.work_scheduled.swap(true, Ordering::AcqRel) {
            return Err(AsyncError::Unexpected);
        }

        if delay.is_zero() {
            submit_work(&state);
        } else {
            state.timer_scheduled.store(true, Ordering::Release);
            let fire_state = Arc::clone(&state);
            let timer = state.timer.lock();
            if let Some(timer) = timer.as_ref() {
                timer.arm(delay, move || timer_fire(fire_state));
            }
        }
        Ok(())
    }

    /// Reports the call finished with `status` and a result payload of
    /// `required_buffer_size` bytes (zero for payload-less calls).
    ///
    /// `Pending` is ignored. Only the first terminal writer triggers the
    /// completion path; a completion racing a cancellation loses silently.
    /// Payload-less completions release the call state immediately, so the
    /// block needs no `result` call afterwards.
    pub fn complete(&self, status: AsyncResult, required_buffer_size: usize) {
        if status == Err(AsyncError::Pending) {
            return;
        }

        let completed_now;
        let do_cleanup;
        let state;
        {
            let mut internal = self.shared.internal.lock();
            let prior = internal.status;
            completed_now = internal.try_set_terminal(status);
            if completed_now {
                // Published under the lock so anyone who observed the
                // terminal status also observes the payload size.
                if let Some(state) = internal.state.as_ref() {
                    state.result_size.store(required_buffer_size, Ordering::Release);
                }
            }
            // No payload, or the caller already canceled: nothing left for
            // `result` to do, so the block's state reference comes out now.
            if required_buffer_size == 0 || prior == Err(AsyncError::Aborted) {
                do_cleanup = true;
                state = internal.state.take();
            } else {
                do_cleanup = false;
                state = internal.state.clone();
            }
        }

        if completed_now {
            if let Some(state) = &state {
                signal_completion(state);
            }
        }

        if do_cleanup {
            if let Some(state) = state {
                cleanup_state(state);
            }
        }
    }

    /// Returns the call's status, optionally blocking until the completion
    /// path has run. The wait outlives the terminal write itself: it is
    /// released only after the completion callback (if any) finished.
    pub fn status(&self, wait: bool) -> AsyncResult {
        let (status, state) = {
            let internal = self.shared.internal.lock();
            (internal.status, internal.state.clone())
        };
        if !wait {
            return status;
        }
        match state {
            None => {
                if status == Err(AsyncError::Pending) {
                    // Nothing will ever signal an unbegun block.
                    return Err(AsyncError::InvalidArg);
                }
                status
            }
            Some(state) => {
                state.wait.wait();
                self.shared.internal.lock().status
            }
        }
    }

    /// Required buffer size for [`result`](Self::result). Zero for calls
    /// without a payload.
    pub fn result_size(&self) -> AsyncResult<usize> {
        let (status, state) = {
            let internal = self.shared.internal.lock();
            (internal.status, internal.state.clone())
        };
        status?;
        Ok(state
            .map(|state| state.result_size.load(Ordering::Acquire))
            .unwrap_or(0))
    }

    /// Copies the result payload into `buffer` and returns the bytes used.
    /// On success the call's state is torn down and the block can be reset.
    ///
    /// `token` must match the one recorded by `begin`. Mismatch, a too-small
    /// buffer, or a provider-reported `NotSufficientBuffer` leave the state
    /// attached so a corrected retry can still succeed.
    pub fn result(&self, token: usize, buffer: &mut [u8]) -> AsyncResult<usize> {
        let (status, state) = {
            let mut internal = self.shared.internal.lock();
            if internal.status == Err(AsyncError::Pending) {
                return Err(AsyncError::Pending);
            }
            (internal.status, internal.state.take())
        };

        if let Err(err) = status {
            if let Some(state) = state {
                cleanup_state(state);
            }
            return Err(err);
        }

        let Some(state) = state else {
            // Payload-less calls released their state at completion.
            return Err(AsyncError::NotSupported);
        };
        debug_assert_eq!(state.signature, STATE_SIGNATURE);

        if token != state.token {
            warn!(
                function = state.function,
                "call/result mismatch: this block was initiated by '{}'", state.function
            );
            self.reattach(state);
            return Err(AsyncError::InvalidArg);
        }

        let size = state.result_size.load(Ordering::Acquire);
        if size == 0 {
            cleanup_state(state);
            return Err(AsyncError::NotSupported);
        }
        if buffer.len() < size {
            self.reattach(state);
            return Err(AsyncError::NotSufficientBuffer);
        }

        match state.provider.get_result(buffer) {
            Ok(used) => {
                cleanup_state(state);
                Ok(used)
            }
            // The payload grew after completion; the state stays live until
            // a copy succeeds or the call is canceled.
            Err(err @ (AsyncError::Pending | AsyncError::NotSufficientBuffer)) => {
                self.reattach(state);
                Err(err)
            }
            Err(err) => {
                cleanup_state(state);
                Err(err)
            }
        }
    }

    /// Cancels the call. The status becomes `Aborted`, the completion
    /// callback is invoked and the wait primitive signaled; already-terminal
    /// calls are left untouched.
    pub fn cancel(&self) {
        let state = {
            let mut internal = self.shared.internal.lock();
            if !internal.try_set_terminal(Err(AsyncError::Aborted)) {
                return;
            }
            let state = internal.state.take();
            if let Some(state) = &state {
                state.canceled.store(true, Ordering::Release);
            }
            state
        };
        let Some(state) = state else {
            return;
        };

        // Disarm the delay timer. A still-pending entry drops here, releasing
        // the reference it held; an in-flight fire is waited out so `do_work`
        // cannot be submitted after this point.
        {
            let timer = state.timer.lock();
            if let Some(timer) = timer.as_ref() {
                timer.cancel();
            }
        }
        state.timer_scheduled.store(false, Ordering::Release);

        state.provider.cancel();
        signal_completion(&state);
        cleanup_state(state);
    }

    /// Runs `work` asynchronously on the block's queue and completes with the
    /// status it returns. Convenience over `begin` + `schedule(0)`.
    pub fn run_async<F>(&self, work: F) -> AsyncResult
    where
        F: FnOnce(&AsyncBlock) -> AsyncResult + Send + 'static,
    {
        struct WorkProvider<F> {
            work: Mutex<Option<F>>,
        }

        impl<F> AsyncProvider for WorkProvider<F>
        where
            F: FnOnce(&AsyncBlock) -> AsyncResult + Send + 'static,
        {
            fn do_work(&self, block: &AsyncBlock) -> AsyncResult {
                if let Some(work) = self.work.lock().take() {
                    let status = work(block);
                    block.complete(status, 0);
                }
                Ok(())
            }

            fn get_result(&self, _buffer: &mut [u8]) -> AsyncResult<usize> {
                Err(AsyncError::NotSupported)
            }
        }

        self.begin(
            Arc::new(WorkProvider {
                work: Mutex::new(Some(work)),
            }),
            RUN_ASYNC_TOKEN,
            "run_async",
        )?;
        self.schedule(Duration::ZERO)
    }

    /// Rearms a terminal, reaped block for a new `begin`. Fails with
    /// `InvalidArg` while call state is still attached (in flight, or a
    /// payload not yet claimed).
    pub fn reset(&self) -> AsyncResult {
        let mut internal = self.shared.internal.lock();
        if internal.state.is_some() {
            return Err(AsyncError::InvalidArg);
        }
        internal.status = Err(AsyncError::Pending);
        Ok(())
    }

    fn reattach(&self, state: Arc<AsyncState>) {
        self.shared.internal.lock().state = Some(state);
    }
}

impl Default for AsyncBlock {
    fn default() -> Self {
        Self::new()
    }
}

fn upgrade_block(state: &AsyncState) -> Option<AsyncBlock> {
    state.block.upgrade().map(|shared| AsyncBlock { shared })
}

fn submit_work(state: &Arc<AsyncState>) {
    let run_state = Arc::clone(state);
    state.queue.submit(CallbackType::Work, state.tag(), move || {
        worker_callback(run_state)
    });
}

fn worker_callback(state: Arc<AsyncState>) {
    state.work_scheduled.store(false, Ordering::Release);
    if state.canceled.load(Ordering::Acquire) {
        return;
    }
    let Some(block) = upgrade_block(&state) else {
        // Every block handle is gone; the call is abandoned.
        return;
    };

    let result = state.provider.do_work(&block);

    // Pending means the provider will complete later. Anything else must
    // either be a failure or have gone through `complete` already; a bare
    // success here is a contract violation.
    if result != Err(AsyncError::Pending)
        && !state.canceled.load(Ordering::Acquire)
    {
        let status = match result {
            Ok(()) => Err(AsyncError::Unexpected),
            Err(err) => Err(err),
        };
        let completed_now = block.shared.internal.lock().try_set_terminal(status);
        if completed_now {
            signal_completion(&state);
        }
    }
}

fn timer_fire(state: Arc<AsyncState>) {
    state.timer_scheduled.store(false, Ordering::Release);
    if state.canceled.load(Ordering::Acquire) {
        return;
    }
    submit_work(&state);
}

fn signal_completion(state: &Arc<AsyncState>) {
    let has_callback = upgrade_block(state).map_or(false, |block| block.shared.callback.is_some());
    if has_callback {
        let run_state = Arc::clone(state);
        state.queue.submit(CallbackType::Completion, state.tag(), move || {
            completion_callback(run_state)
        });
    } else {
        state.wait.signal();
    }
}

fn completion_callback(state: Arc<AsyncState>) {
    if let Some(block) = upgrade_block(&state) {
        if let Some(callback) = &block.shared.callback {
            callback(&block);
        }
    }
    state.wait.signal();
}

fn cleanup_state(state: Arc<AsyncState>) {
    state.provider.cleanup();
    let tag = state.tag();
    let removed = state
        .queue
        .remove_callbacks(CallbackType::Work, |entry_tag| entry_tag == tag);
    if removed > 0 {
        debug!(removed, "dropped still-queued work during call teardown");
    }
    drop(state);
}
