// internal future polling system.
//
// design based on pollster crate, but with extensive modifications. this is what backs every
// blocking method in the crate (`Listener::wait`, `RecvFut::block`, and friends): the calling
// thread polls the future directly and parks on a mutex + condvar signal between polls.
//
// unlike a raw-vtable pollster, the signal lives in an `Arc` and the waker is built through
// `std::task::Wake`, so a waker that outlives the call (because the future left it registered in
// some shared registry) stays valid. the futures in this crate all remove their registration on
// drop, but nothing here depends on that for soundness.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// timeout for blocking on a future.
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// poll the future until it resolves or the timeout is reached, in which case return err.
pub(crate) fn poll<F>(fut: &mut F, timeout: Timeout) -> Result<F::Output, ()>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return Ok(output);
        }

        // otherwise, block until notification or timeout
        let mut lock = signal.state.lock().unwrap();

        // if a notification is already present, skip to the next loop iteration so as to release
        // the lock and try polling again without blocking.
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        // otherwise, actually block until notification or timeout
        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match &timeout {
            // block on mutex + condvar indefinitely
            Timeout::Never => {
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                }
            }

            // block on mutex + condvar until deadline, at which point return err
            &Timeout::At(deadline) => {
                while let State::Waiting = *lock {
                    let Some(duration) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(());
                    };
                    let (lock2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return Err(());
                    }
                }
            }

            // dont block on mutex + condvar, return err instead
            Timeout::NonBlocking => return Err(()),
        }
        *lock = State::Empty;
    }
}

// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // notify signal
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}
