//! Provider-driven asynchronous call protocol.
//!
//! A caller binds an [`AsyncBlock`] to a provider with [`AsyncBlock::begin`],
//! schedules work, and later collects the status and payload; the provider
//! implements the four-op [`AsyncProvider`] contract and drives completion
//! through [`AsyncBlock::complete`]. Dispatch (thread pools, queues, delay
//! timers) lives in [`strand_queue`], re-exported here as [`queue`].

pub mod block;
pub mod error;
pub mod provider;
pub mod state;
pub mod wait;

pub use block::{AsyncBlock, AsyncBlockBuilder, CompletionCallback, RUN_ASYNC_TOKEN};
pub use error::{AsyncError, AsyncResult};
pub use provider::AsyncProvider;
pub use state::live_state_count;
pub use wait::WaitEvent;

pub use strand_queue as queue;
