// the one-shot broadcast latch.

use crate::{
    polling::{self, Timeout},
    util::{next_key, WakerSet},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Condvar, Mutex,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};


/// One-shot broadcast latch
///
/// A `Latch` starts un-tripped and can be tripped exactly once by [`close`](Self::close). Any
/// number of peers can observe the trip, either by polling [`is_closed`](Self::is_closed) or by
/// waiting on a [`Listener`] obtained from [`listen`](Self::listen). Once tripped, a latch never
/// re-opens; see [`CyclicLatch`](crate::CyclicLatch) for the rearmable variant.
///
/// Cloning a `Latch` clones the handle, not the latch: all clones trip together.
///
/// Observing a tripped latch costs one atomic load. Nothing beyond the handle itself is allocated
/// until the first listener actually registers a waker, and a latch that trips before anyone
/// listens never touches its registry at all.
pub struct Latch {
    shared: Arc<Shared>,
}

// latch shared state.
struct Shared {
    // set by the close winner before it starts waking listeners. listeners resolve against this.
    tripped: AtomicBool,
    // set once the winner has finished waking every registered listener.
    done: AtomicBool,
    // mutex around lockable state.
    lockable: Mutex<Lockable>,
    // notified (with lockable held) once wake-out completes; strict losing closers wait on this.
    completion: Condvar,
}

// latch lockable state.
struct Lockable {
    // wakers of registered listeners. taken wholesale by the close winner.
    wakers: WakerSet,
    // whether the close winner has finished waking.
    wake_out_done: bool,
}

impl Latch {
    /// Construct un-tripped
    pub fn new() -> Self {
        Latch {
            shared: Arc::new(Shared {
                tripped: AtomicBool::new(false),
                done: AtomicBool::new(false),
                lockable: Mutex::new(Lockable {
                    wakers: WakerSet::new(),
                    wake_out_done: false,
                }),
                completion: Condvar::new(),
            }),
        }
    }

    /// Obtain a listener for this latch
    ///
    /// The listener is a future that resolves once the latch trips; if the latch has already
    /// tripped it resolves immediately. Listeners can be obtained at any time, including after
    /// the trip, and also provide blocking and non-blocking waits.
    pub fn listen(&self) -> Listener {
        Listener {
            shared: Arc::clone(&self.shared),
            key: next_key(),
            registered: false,
            resolved: false,
        }
    }

    /// Whether the latch has tripped and the trip has completed
    ///
    /// "Completed" means the tripping caller has finished waking every listener that was
    /// registered at the time of the trip.
    pub fn is_closed(&self) -> bool {
        self.shared.done.load(SeqCst)
    }

    // whether the trip has been invoked, completed or not. listeners resolve against this.
    pub(crate) fn is_tripped(&self) -> bool {
        self.shared.tripped.load(SeqCst)
    }

    /// Trip the latch
    ///
    /// Returns true for exactly one caller over the lifetime of the latch. Losing callers block
    /// until the winner has finished waking all registered listeners, so that once any `close`
    /// call returns, the trip is observable everywhere.
    pub fn close(&self) -> bool {
        self.close_inner(false)
    }

    /// Trip the latch without waiting for the winner
    ///
    /// As [`close`](Self::close), but losing callers return immediately; they may return before
    /// the winner has finished waking registered listeners.
    pub fn close_eventually_consistent(&self) -> bool {
        self.close_inner(true)
    }

    fn close_inner(&self, eventually_consistent: bool) -> bool {
        if !self.shared.tripped.swap(true, SeqCst) {
            // winner: take the registry, wake it outside the lock, then publish completion
            let wakers = {
                let mut lock = self.shared.lockable.lock().unwrap();
                lock.wakers.take_all()
            };
            for (_, waker) in wakers {
                waker.wake();
            }
            let mut lock = self.shared.lockable.lock().unwrap();
            lock.wake_out_done = true;
            self.shared.done.store(true, SeqCst);
            self.shared.completion.notify_all();
            drop(lock);
            true
        } else {
            if !eventually_consistent {
                let mut lock = self.shared.lockable.lock().unwrap();
                while !lock.wake_out_done {
                    lock = self.shared.completion.wait(lock).unwrap();
                }
            }
            false
        }
    }
}

impl Clone for Latch {
    fn clone(&self) -> Self {
        Latch {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}


/// Future that resolves once its [`Latch`] trips
///
/// Obtained from [`Latch::listen`]. Beyond `await`, a listener offers [`wait`](Self::wait),
/// [`wait_timeout`](Self::wait_timeout), and [`ready`](Self::ready) for blocking and
/// non-blocking use. Dropping a listener before the trip deregisters it.
pub struct Listener {
    shared: Arc<Shared>,
    key: u64,
    registered: bool,
    resolved: bool,
}

impl Listener {
    /// Block until the latch trips
    pub fn wait(mut self) {
        let _ = polling::poll(&mut self, Timeout::Never);
    }

    /// Block until the latch trips or the timeout elapses
    ///
    /// Returns whether the latch tripped within the timeout.
    pub fn wait_timeout(mut self, timeout: Duration) -> bool {
        polling::poll(&mut self, Timeout::At(Instant::now() + timeout)).is_ok()
    }

    /// Whether the latch has tripped, without blocking
    ///
    /// Counts as polling this future.
    pub fn ready(&mut self) -> bool {
        polling::poll(self, Timeout::NonBlocking).is_ok()
    }
}

impl Future for Listener {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        if this.resolved {
            return Poll::Ready(());
        }
        if this.shared.tripped.load(SeqCst) {
            this.resolved = true;
            this.registered = false;
            return Poll::Ready(());
        }
        let mut lock = this.shared.lockable.lock().unwrap();
        // re-check under the lock: a close that won between our load and the lock acquisition has
        // already taken the registry, and a waker registered now would never be woken.
        if this.shared.tripped.load(SeqCst) {
            drop(lock);
            this.resolved = true;
            this.registered = false;
            return Poll::Ready(());
        }
        lock.wakers.register(this.key, cx.waker());
        this.registered = true;
        Poll::Pending
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for Listener {
    fn is_terminated(&self) -> bool {
        self.resolved
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.registered && !self.resolved {
            let mut lock = self.shared.lockable.lock().unwrap();
            lock.wakers.remove(self.key);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::AtomicUsize,
        thread,
    };

    #[test]
    fn trip_is_observable() {
        let latch = Latch::new();
        assert!(!latch.is_closed());
        assert!(!latch.listen().ready());

        assert!(latch.close());
        assert!(latch.is_closed());
        assert!(latch.listen().ready());
        // listeners obtained before the trip also resolve
        latch.listen().wait();
    }

    #[test]
    fn close_wins_exactly_once() {
        let latch = Latch::new();
        assert!(latch.close());
        assert!(!latch.close());
        assert!(!latch.close_eventually_consistent());
    }

    #[test]
    fn close_wins_exactly_once_racing() {
        for _ in 0..100 {
            let latch = Latch::new();
            let wins = Arc::new(AtomicUsize::new(0));
            let threads = (0..4)
                .map(|_| {
                    let latch = latch.clone();
                    let wins = Arc::clone(&wins);
                    thread::spawn(move || {
                        if latch.close() {
                            wins.fetch_add(1, SeqCst);
                        }
                        // strict close: by the time any close returns, the trip is complete
                        assert!(latch.is_closed());
                    })
                })
                .collect::<Vec<_>>();
            for handle in threads {
                handle.join().unwrap();
            }
            assert_eq!(wins.load(SeqCst), 1);
        }
    }

    #[test]
    fn listener_wakes_across_threads() {
        let latch = Latch::new();
        let listener = latch.listen();
        let waiter = thread::spawn(move || listener.wait());
        thread::sleep(Duration::from_millis(10));
        latch.close();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_trip() {
        let latch = Latch::new();
        assert!(!latch.listen().wait_timeout(Duration::from_millis(10)));
        latch.close();
        assert!(latch.listen().wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn dropped_listener_deregisters() {
        let latch = Latch::new();
        let mut listener = latch.listen();
        assert!(!listener.ready());
        drop(listener);
        // the registry no longer holds the dropped listener's waker; closing must not panic or
        // hang on it
        latch.close();
        assert!(latch.is_closed());
    }

    #[tokio::test]
    async fn listener_is_a_future() {
        let latch = Latch::new();
        let listener = latch.listen();
        let task = tokio::spawn(async move {
            listener.await;
        });
        tokio::task::yield_now().await;
        latch.close();
        task.await.unwrap();
    }
}
