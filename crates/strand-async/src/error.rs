use thiserror::Error;

/// Terminal and in-flight status codes for asynchronous calls.
///
/// `Pending` is the only non-terminal value: it reports an operation still in
/// flight and is never stored as a final status. Everything else is written
/// once into the owning block and observed identically by every reader
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AsyncError {
    #[error("the operation has not completed")]
    Pending,
    #[error("the operation was aborted")]
    Aborted,
    #[error("invalid argument")]
    InvalidArg,
    #[error("allocation failed")]
    OutOfMemory,
    #[error("the call carries no result payload")]
    NotSupported,
    #[error("the buffer is too small for the result payload")]
    NotSufficientBuffer,
    #[error("unexpected provider behavior")]
    Unexpected,
}

pub type AsyncResult<T = ()> = Result<T, AsyncError>;
