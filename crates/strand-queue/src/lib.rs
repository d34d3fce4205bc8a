//! Dispatch substrate for the strand async runtime.
//!
//! The crate provides the pieces callbacks travel through on their way to a
//! thread: a lock-free FIFO list ([`LocklessList`]), an owned worker pool
//! ([`ThreadPool`]) with the [`ActionComplete`] early-completion hook, a
//! deadline-driven [`TimerService`], and the two-channel [`AsyncQueue`]
//! dispatcher that ties them together. Higher layers decide *what* runs;
//! this crate only decides *where* and *when*.

pub mod lockless;
pub mod pool;
pub mod queue;
pub mod timer;

pub use lockless::LocklessList;
pub use pool::{ActionComplete, ThreadPool};
pub use queue::{
    current_thread_key, AsyncQueue, AsyncQueueHandle, CallbackType, DispatchMode,
};
pub use timer::{Timer, TimerService};
