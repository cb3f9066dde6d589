//! Concurrency primitives around a non-blocking, unbounded, MPMC queue
//!
//! The centerpiece is [`Sluice`], a queue whose producers never block and whose consumers can
//! receive values one at a time through an optional worker-fed delivery channel, or drain them
//! in batches. It composes on two broadcast latches that are useful on their own: [`Latch`], a
//! one-shot event any number of peers can await, and [`CyclicLatch`], its rearmable variant.
//!
//! Everything waitable in the crate is exposed as a future that also carries blocking and
//! non-blocking methods, so the same queue serves threaded and async consumers at once.

#[macro_use]
extern crate tracing;

mod latch;
mod polling;
mod queue;
mod util;

pub use crate::latch::{CyclicLatch, Latch, Listener};
pub use crate::queue::api::{Drain, QueueState, Sluice, WorkerMode, WorkerStatus};

/// Error types
pub mod error {
    pub use crate::queue::error::{TaskPanicked, WouldBlock};
}

/// Future types
pub mod future {
    pub use crate::queue::api::future::RecvFut;
}
