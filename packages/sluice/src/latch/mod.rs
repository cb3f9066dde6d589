// one-shot and rearmable broadcast latches.
//
// the architecture is as such:
//
//      awaitable: `Latch`, a single-use broadcast event. handles wrap an Arc around shared state
//          |      consisting of two atomics (tripped / trip-completed) and a mutex guarding the
//          |      waker registry. `Listener` futures resolve once the latch trips, and double as
//          |      blocking waits through the polling module.
//          |
//      cyclic: `CyclicLatch`, a latch that can be re-armed. it holds the current `Latch` handle
//              behind a mutex; `open` swaps in a fresh latch once the current one has tripped.
//              listeners obtained before the swap stay attached to the old cycle.
//
// the queue composes on both: close completion and drain observation are plain latches, the
// data-available event is a cyclic latch that re-arms whenever the queue becomes empty.

mod awaitable;
mod cyclic;

pub use awaitable::{Latch, Listener};
pub use cyclic::CyclicLatch;
