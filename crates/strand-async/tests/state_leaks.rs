//! Every teardown path must return the process-wide live-state count to its
//! starting value. Kept in its own binary so unrelated tests cannot perturb
//! the counter mid-assertion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_async::queue::{AsyncQueue, AsyncQueueHandle, CallbackType, DispatchMode};
use strand_async::{live_state_count, AsyncBlock, AsyncError, AsyncProvider, AsyncResult};

const TOKEN: usize = 0x51;

struct CountingProvider {
    do_work_calls: AtomicUsize,
    cleanups: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            do_work_calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }
}

impl AsyncProvider for CountingProvider {
    fn do_work(&self, block: &AsyncBlock) -> AsyncResult {
        self.do_work_calls.fetch_add(1, Ordering::SeqCst);
        block.complete(Ok(()), 4);
        Ok(())
    }

    fn get_result(&self, buffer: &mut [u8]) -> AsyncResult<usize> {
        buffer[..4].copy_from_slice(&[1, 2, 3, 4]);
        Ok(4)
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn inline_queue() -> AsyncQueueHandle {
    AsyncQueue::new(DispatchMode::Immediate, DispatchMode::Immediate)
}

#[test]
fn every_teardown_path_releases_the_state() {
    let baseline = live_state_count();

    // Full round trip: the result call reaps the state.
    {
        let provider = CountingProvider::new();
        let block = AsyncBlock::builder().queue(inline_queue()).build();
        block
            .begin(Arc::clone(&provider) as Arc<dyn AsyncProvider>, TOKEN, "round_trip")
            .unwrap();
        block.schedule(Duration::ZERO).unwrap();
        assert_eq!(block.status(true), Ok(()));
        let mut buffer = [0u8; 4];
        assert_eq!(block.result(TOKEN, &mut buffer), Ok(4));
        assert_eq!(provider.cleanups.load(Ordering::SeqCst), 1);
    }
    assert_eq!(live_state_count(), baseline, "round trip leaked state");

    // Cancel of a scheduled-but-unfired timer: the entry's reference is
    // released without ever running the work.
    {
        let provider = CountingProvider::new();
        let block = AsyncBlock::builder().queue(inline_queue()).build();
        block
            .begin(Arc::clone(&provider) as Arc<dyn AsyncProvider>, TOKEN, "timer_cancel")
            .unwrap();
        block.schedule(Duration::from_secs(30)).unwrap();
        block.cancel();
        assert_eq!(block.status(true), Err(AsyncError::Aborted));
        assert_eq!(provider.do_work_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.cleanups.load(Ordering::SeqCst), 1);
    }
    assert_eq!(live_state_count(), baseline, "timer cancel leaked state");

    // Cancel with the work record still parked in a manual channel: teardown
    // removes the record and releases the reference it carried.
    {
        let provider = CountingProvider::new();
        let queue = AsyncQueue::new(DispatchMode::Manual, DispatchMode::Manual);
        let block = AsyncBlock::builder().queue(Arc::clone(&queue)).build();
        block
            .begin(Arc::clone(&provider) as Arc<dyn AsyncProvider>, TOKEN, "queued_cancel")
            .unwrap();
        block.schedule(Duration::ZERO).unwrap();
        block.cancel();
        assert_eq!(provider.do_work_calls.load(Ordering::SeqCst), 0);
        assert!(!queue.dispatch(CallbackType::Work, Duration::ZERO));
    }
    assert_eq!(live_state_count(), baseline, "queued-work cancel leaked state");

    // Dropping every block handle with an unclaimed payload reaps the state.
    {
        let provider = CountingProvider::new();
        let block = AsyncBlock::builder().queue(inline_queue()).build();
        block
            .begin(Arc::clone(&provider) as Arc<dyn AsyncProvider>, TOKEN, "abandoned")
            .unwrap();
        block.schedule(Duration::ZERO).unwrap();
        assert_eq!(block.status(true), Ok(()));
        drop(block);
        assert_eq!(provider.cleanups.load(Ordering::SeqCst), 1);
    }
    assert_eq!(live_state_count(), baseline, "abandoned block leaked state");
}
