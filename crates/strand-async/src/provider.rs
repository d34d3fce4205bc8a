use crate::block::AsyncBlock;
use crate::error::AsyncResult;

/// The extension surface transports implement to drive an asynchronous call.
///
/// The runtime invokes the four operations in a fixed pattern: `do_work` when
/// the scheduled work comes up on a queue, `get_result` once the caller asks
/// for the payload of a successfully completed call, `cancel` when the caller
/// aborts, and `cleanup` exactly once when the call's state is torn down.
pub trait AsyncProvider: Send + Sync + 'static {
    /// Performs or continues the asynchronous work.
    ///
    /// Return `Err(AsyncError::Pending)` to keep the call alive; the provider
    /// must then eventually call [`AsyncBlock::complete`] (typically from an
    /// I/O callback). Returning `Ok(())` means the provider already completed
    /// the call through [`AsyncBlock::complete`]; a bare `Ok(())` without a
    /// prior completion is treated as a contract violation and surfaces as
    /// `Unexpected`. Any other error terminates the call with that status.
    fn do_work(&self, block: &AsyncBlock) -> AsyncResult;

    /// Copies the result payload into `buffer` and returns the bytes used.
    ///
    /// Only invoked after the call completed successfully with a non-zero
    /// declared payload size, with a buffer at least that large. Returning
    /// `Err(AsyncError::NotSufficientBuffer)` (the payload grew after
    /// completion) leaves the call's state live so the caller can retry.
    fn get_result(&self, buffer: &mut [u8]) -> AsyncResult<usize>;

    /// Best-effort stop of in-flight work. A provider that cannot stop
    /// synchronously should arrange to call [`AsyncBlock::complete`]
    /// eventually; a completion racing a cancellation loses harmlessly.
    fn cancel(&self) {}

    /// Final teardown of provider resources attached to the call.
    fn cleanup(&self) {}
}
