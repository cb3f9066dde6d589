// the rearmable latch.

use super::{Latch, Listener};
use std::sync::Mutex;


/// Rearmable broadcast latch
///
/// A `CyclicLatch` behaves like a [`Latch`] whose tripped state can be re-armed: [`open`]
/// replaces a tripped cycle with a fresh one. Listeners stay attached to the cycle they were
/// obtained from, so a listener that witnessed cycle `n` tripping is unaffected by cycle `n + 1`
/// being armed.
///
/// [`open`]: Self::open
pub struct CyclicLatch {
    // handle to the current cycle. replaced, not mutated, on rearm, so listeners of earlier
    // cycles keep their latch alive through the handle's Arc.
    current: Mutex<Latch>,
}

impl CyclicLatch {
    /// Construct with an un-tripped first cycle
    pub fn new() -> Self {
        CyclicLatch {
            current: Mutex::new(Latch::new()),
        }
    }

    /// Obtain a listener for the current cycle
    pub fn listen(&self) -> Listener {
        self.current.lock().unwrap().listen()
    }

    /// Whether the current cycle has tripped and the trip has completed
    pub fn is_closed(&self) -> bool {
        self.current.lock().unwrap().is_closed()
    }

    /// Trip the current cycle
    ///
    /// Returns true for exactly one caller per cycle.
    pub fn close(&self) -> bool {
        let latch = self.current.lock().unwrap().clone();
        latch.close_eventually_consistent()
    }

    /// Re-arm: if the current cycle has tripped, replace it with a fresh one
    ///
    /// Returns whether a replacement occurred, and a listener for the resulting current cycle.
    /// In either case the cycle behind the returned listener was observed un-tripped at an
    /// instant during this call.
    pub fn open(&self) -> (bool, Listener) {
        let mut lock = self.current.lock().unwrap();
        if lock.is_tripped() {
            *lock = Latch::new();
            (true, lock.listen())
        } else {
            (false, lock.listen())
        }
    }
}

impl Default for CyclicLatch {
    fn default() -> Self {
        CyclicLatch::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rearms_only_after_trip() {
        let cyclic = CyclicLatch::new();

        let (did_open, mut listener) = cyclic.open();
        assert!(!did_open);
        assert!(!listener.ready());

        assert!(cyclic.close());
        assert!(cyclic.is_closed());
        assert!(!cyclic.close());

        let (did_open, mut listener) = cyclic.open();
        assert!(did_open);
        assert!(!cyclic.is_closed());
        assert!(!listener.ready());

        assert!(cyclic.close());
        assert!(listener.ready());
    }

    #[test]
    fn cycles_are_independent() {
        let cyclic = CyclicLatch::new();
        cyclic.close();

        // listener of the tripped first cycle
        let mut old = cyclic.listen();
        assert!(old.ready());

        let (did_open, mut fresh) = cyclic.open();
        assert!(did_open);

        // old cycle stays tripped, fresh cycle is open
        assert!(cyclic.listen().ready() == false);
        assert!(!fresh.ready());
        let mut old_again = old;
        assert!(old_again.ready());
    }

    #[test]
    fn close_trips_exactly_one_cycle() {
        let cyclic = CyclicLatch::new();
        let mut first = cyclic.listen();
        cyclic.close();
        cyclic.open();
        let mut second = cyclic.listen();

        // first cycle's listener resolved, second cycle's has not
        assert!(first.ready());
        assert!(!second.ready());
    }
}
