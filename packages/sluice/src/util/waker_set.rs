// keyed registry of wakers.
//
// every blocking-capable future in this crate registers its waker here under a key unique to that
// future. the state change the future is waiting for takes the whole registry and wakes it. this
// is the broadcast counterpart of a waiter queue: all registered futures are woken, re-poll, and
// re-register if the state change turns out not to be for them.

use smallvec::SmallVec;
use std::{
    sync::atomic::{AtomicU64, Ordering::Relaxed},
    task::Waker,
};


// process-wide key source. keys are never reused, so a future can always re-register under its
// own key without colliding with a future created later.
static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

// allocate a fresh registration key.
pub(crate) fn next_key() -> u64 {
    NEXT_KEY.fetch_add(1, Relaxed)
}

// set of registered wakers, keyed by the owning future's key.
//
// entries stay inline for the common few-waiters case.
#[derive(Default)]
pub(crate) struct WakerSet {
    entries: SmallVec<[(u64, Waker); 4]>,
}

impl WakerSet {
    pub(crate) fn new() -> Self {
        WakerSet::default()
    }

    // register or refresh the waker for the given key.
    pub(crate) fn register(&mut self, key: u64, waker: &Waker) {
        for (entry_key, entry_waker) in &mut self.entries {
            if *entry_key == key {
                entry_waker.clone_from(waker);
                return;
            }
        }
        self.entries.push((key, waker.clone()));
    }

    // drop the registration for the given key, if present.
    pub(crate) fn remove(&mut self, key: u64) {
        self.entries.retain(|&mut (entry_key, _)| entry_key != key);
    }

    // take every registered waker, leaving the set empty.
    //
    // callers wake the returned wakers after releasing whatever lock guards this set, so a woken
    // future can immediately re-poll without lock contention.
    pub(crate) fn take_all(&mut self) -> SmallVec<[(u64, Waker); 4]> {
        std::mem::take(&mut self.entries)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        task::Wake,
    };

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    fn wake_out(set: &mut WakerSet) -> usize {
        let taken = set.take_all();
        let n = taken.len();
        for (_, waker) in taken {
            waker.wake();
        }
        n
    }

    #[test]
    fn register_is_keyed() {
        let counter = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        let mut set = WakerSet::new();
        let key = next_key();
        set.register(key, &waker);
        set.register(key, &waker);
        set.register(next_key(), &waker);
        assert_eq!(wake_out(&mut set), 2);
        assert_eq!(counter.0.load(SeqCst), 2);

        // set is drained by take_all
        assert_eq!(wake_out(&mut set), 0);
        assert_eq!(counter.0.load(SeqCst), 2);
    }

    #[test]
    fn remove_unregisters() {
        let counter = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        let mut set = WakerSet::new();
        let key = next_key();
        set.register(key, &waker);
        set.remove(key);
        assert_eq!(wake_out(&mut set), 0);
        assert_eq!(counter.0.load(SeqCst), 0);
    }
}
