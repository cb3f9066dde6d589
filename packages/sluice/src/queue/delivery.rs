// the delivery slot.
//
// this is the rendezvous between the worker and single-value consumers. the worker places one
// value at a time into the slot and blocks on a condvar until it is consumed; consumers are
// either `recv` futures (woken through the waker registry) or batch drainers collecting the
// worker's in-flight value on their way into the buffers. the slot's mutex makes consumption
// exactly-once: whichever side takes the offer flips it back to idle, and the other side finds
// the slot empty and moves on.
//
// closing the slot is terminal. cancellation (close-now) additionally rejects the in-flight
// offer, handing it back to whoever cancelled so it can be discarded and accounted for.

use crate::util::WakerSet;
use std::{
    sync::{Condvar, Mutex},
    task::Waker,
};


// the slot's offer state.
enum Offer<T> {
    // no value in flight.
    Idle,
    // the worker has a value out and is blocked until it is consumed.
    Offered(T),
}

// result of the worker placing an offer.
pub(crate) enum OfferOutcome<T> {
    // a consumer took the value.
    Consumed,
    // the slot was cancelled; the value comes back to be discarded.
    Rejected(T),
}

// result of a recv future polling the slot.
pub(crate) enum TakeResult<T> {
    // took the in-flight value.
    Taken(T),
    // the slot is closed and will never carry a value again.
    Closed,
    // nothing in flight; the waker is registered.
    Pending,
}

pub(crate) struct Delivery<T> {
    lockable: Mutex<Lockable<T>>,
    // notified whenever the offer is consumed or the slot is cancelled; the worker waits on this
    // while its offer is out.
    offer_taken: Condvar,
}

struct Lockable<T> {
    offer: Offer<T>,
    // terminal: no further offers, recv resolves to none once the offer is gone.
    closed: bool,
    // set by close-now: in-flight and future offers are rejected back to the worker.
    cancelled: bool,
    // wakers of recv futures waiting for an offer (or for close).
    wakers: WakerSet,
}

impl<T> Delivery<T> {
    pub(crate) fn new() -> Self {
        Delivery {
            lockable: Mutex::new(Lockable {
                offer: Offer::Idle,
                closed: false,
                cancelled: false,
                wakers: WakerSet::new(),
            }),
            offer_taken: Condvar::new(),
        }
    }

    // worker side: place a value and block until it is consumed or the slot is cancelled.
    pub(crate) fn offer(&self, value: T) -> OfferOutcome<T> {
        let mut lock = self.lockable.lock().unwrap();
        if lock.cancelled {
            return OfferOutcome::Rejected(value);
        }
        debug_assert!(matches!(lock.offer, Offer::Idle), "offer placed over an in-flight offer");
        lock.offer = Offer::Offered(value);
        let wakers = lock.wakers.take_all();
        // wake outside the lock so woken futures can take the offer immediately
        drop(lock);
        for (_, waker) in wakers {
            waker.wake();
        }
        let mut lock = self.lockable.lock().unwrap();
        loop {
            if lock.cancelled {
                return match std::mem::replace(&mut lock.offer, Offer::Idle) {
                    Offer::Offered(value) => OfferOutcome::Rejected(value),
                    Offer::Idle => OfferOutcome::Consumed,
                };
            }
            if matches!(lock.offer, Offer::Idle) {
                return OfferOutcome::Consumed;
            }
            lock = self.offer_taken.wait(lock).unwrap();
        }
    }

    // recv future side: take the in-flight value if there is one, otherwise register the waker.
    pub(crate) fn poll_take(&self, key: u64, waker: &Waker) -> TakeResult<T> {
        let mut lock = self.lockable.lock().unwrap();
        if let Offer::Offered(_) = lock.offer {
            let Offer::Offered(value) = std::mem::replace(&mut lock.offer, Offer::Idle) else {
                unreachable!()
            };
            lock.wakers.remove(key);
            drop(lock);
            self.offer_taken.notify_all();
            return TakeResult::Taken(value);
        }
        if lock.closed {
            lock.wakers.remove(key);
            return TakeResult::Closed;
        }
        lock.wakers.register(key, waker);
        TakeResult::Pending
    }

    // batch drainer side: take the in-flight value if there is one.
    pub(crate) fn collect(&self) -> Option<T> {
        let mut lock = self.lockable.lock().unwrap();
        match std::mem::replace(&mut lock.offer, Offer::Idle) {
            Offer::Offered(value) => {
                drop(lock);
                self.offer_taken.notify_all();
                Some(value)
            }
            Offer::Idle => None,
        }
    }

    // terminal close. wakes pending recv futures so they observe the closed slot.
    pub(crate) fn close(&self) {
        let mut lock = self.lockable.lock().unwrap();
        lock.closed = true;
        let wakers = lock.wakers.take_all();
        drop(lock);
        self.offer_taken.notify_all();
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    // close-now: cancel and close, rejecting any in-flight offer back to the caller.
    pub(crate) fn cancel(&self) -> Option<T> {
        let mut lock = self.lockable.lock().unwrap();
        lock.cancelled = true;
        lock.closed = true;
        let rejected = match std::mem::replace(&mut lock.offer, Offer::Idle) {
            Offer::Offered(value) => Some(value),
            Offer::Idle => None,
        };
        let wakers = lock.wakers.take_all();
        drop(lock);
        self.offer_taken.notify_all();
        for (_, waker) in wakers {
            waker.wake();
        }
        rejected
    }

    pub(crate) fn remove_waker(&self, key: u64) {
        self.lockable.lock().unwrap().wakers.remove(key);
    }

    // whether a value is currently in flight.
    #[cfg(test)]
    pub(crate) fn has_offer(&self) -> bool {
        matches!(self.lockable.lock().unwrap().offer, Offer::Offered(_))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn offer_is_collected_exactly_once() {
        let delivery = Arc::new(Delivery::new());
        let offered = Arc::clone(&delivery);
        let worker = thread::spawn(move || match offered.offer(7) {
            OfferOutcome::Consumed => (),
            OfferOutcome::Rejected(_) => panic!("offer rejected without cancel"),
        });

        // spin until the offer is visible, then collect it
        let mut taken = None;
        while taken.is_none() {
            taken = delivery.collect();
            thread::yield_now();
        }
        assert_eq!(taken, Some(7));
        worker.join().unwrap();

        // nothing left in flight
        assert!(delivery.collect().is_none());
        assert!(!delivery.has_offer());
    }

    #[test]
    fn cancel_rejects_in_flight_offer() {
        let delivery = Arc::new(Delivery::new());
        let offered = Arc::clone(&delivery);
        let worker = thread::spawn(move || offered.offer(7));

        while !delivery.has_offer() {
            thread::yield_now();
        }
        let rejected = delivery.cancel();
        // either the canceller got the value back, or the worker did; never both, never neither
        let outcome = worker.join().unwrap();
        match (rejected, outcome) {
            (Some(7), OfferOutcome::Consumed) => (),
            (None, OfferOutcome::Rejected(7)) => (),
            other => panic!("value neither rejected nor returned exactly once: {:?}", {
                let (rejected, _) = other;
                rejected
            }),
        }
    }

    #[test]
    fn offer_after_cancel_is_rejected() {
        let delivery = Delivery::<u32>::new();
        delivery.cancel();
        assert!(matches!(delivery.offer(3), OfferOutcome::Rejected(3)));
    }

    #[test]
    fn collect_races_do_not_duplicate() {
        use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

        for _ in 0..50 {
            let delivery = Arc::new(Delivery::new());
            let done = Arc::new(AtomicBool::new(false));
            let offered = Arc::clone(&delivery);
            let worker = thread::spawn(move || offered.offer(1u32));

            let collectors = (0..3)
                .map(|_| {
                    let delivery = Arc::clone(&delivery);
                    let done = Arc::clone(&done);
                    thread::spawn(move || loop {
                        if let Some(value) = delivery.collect() {
                            done.store(true, SeqCst);
                            return Some(value);
                        }
                        if done.load(SeqCst) {
                            return None;
                        }
                        thread::yield_now();
                    })
                })
                .collect::<Vec<_>>();

            let taken = collectors
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(taken, vec![1]);
            worker.join().unwrap();
        }
    }
}
