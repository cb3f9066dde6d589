// implementation of the non-blocking queue.
//
// the basic architecture is as such:
//
// queue handles wrap around Arc<Core<T>>
//                                |
//          /---------------------/
//          v
//        Core
//          |
//          |------ two buffer locks: producers append to the input buffer (a Vec), consumers pop
//          |       the front of the output buffer (a VecDeque). when the output runs dry its
//          |       holder swaps the whole input buffer in, so producers and consumers contend
//          |       only once per batch. lock order is output before input, never the reverse.
//          |
//          |------ an atomic unsent count: input length + output length + one for a value the
//          |       worker is carrying. this is what `count`, the data-wait latch, and the close
//          |       paths are driven by.
//          |
//          |------ the delivery slot (delivery module): a rendezvous through which the worker
//          |       offers one value at a time. either a `recv` future or a batch-path collect
//          |       consumes the offer, never both.
//          |
//          |------ the thread control block (worker module): worker status, the alert slot that
//          |       producers hand values through when the worker is parked, and a per-launch
//          |       exit latch.
//          |
//          \------ latches: close completion, drained (empty-and-closed), close-now completion,
//                  and the cyclic data-wait latch that re-arms whenever the queue drains.
//
// the organization of these modules is as such:
//
//      delivery<-------------core: owns all shared state and the close/drain bookkeeping that
//                   |        ^     every path (producer, consumer, worker, closer) funnels
//                   |        |     through.
//      worker<------/        |
//                            |
//      error<----------------api: the public Sluice<T> surface, a convenience-and-defensiveness
//                                 wrapper around core. the crate re-exports this API publically.

pub(crate) mod api;
pub(crate) mod error;

mod core;
mod delivery;
mod worker;
