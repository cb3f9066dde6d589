// shared state of a queue.
//
// every handle, future, and the worker thread operate on one `Core<T>` behind an Arc. the core
// owns the buffers, the counters, the latches, and the thread control block, and it centralizes
// the bookkeeping that keeps them consistent: re-arming the data-wait latch when the queue
// drains, and completing a deferred close once the queue is drained for good.
//
// lock order, for the whole queue: output buffer, then input buffer. the thread control block,
// the delivery slot, the pending-operation counters, and the latches are leaf locks; holders of
// a buffer lock may take them, the reverse never happens.

use super::{
    api::{WorkerMode, WorkerStatus},
    delivery::Delivery,
    error::ErrorStore,
    worker,
};
use crate::latch::{CyclicLatch, Latch};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool, AtomicU8, AtomicUsize,
            Ordering::SeqCst,
        },
        Arc, Condvar, Mutex,
    },
    thread,
};


// default first allocation of the input and output buffers, in elements.
pub(crate) const DEFAULT_ALLOCATION: usize = 10;

// buffer producers append to. its only other reader is the output-lock holder swapping it out.
pub(crate) struct InputBuffer<T> {
    pub(crate) elems: Vec<T>,
    // largest capacity this buffer has reached.
    pub(crate) watermark: usize,
}

// buffer consumers pop from the front of. refilled by swapping the input buffer in whole.
pub(crate) struct OutputBuffer<T> {
    pub(crate) elems: VecDeque<T>,
    pub(crate) watermark: usize,
}

// worker thread control block.
pub(crate) struct ThreadControl<T> {
    pub(crate) status: WorkerStatus,
    // whether a worker thread is currently alive. launch and exit decisions happen under this
    // block's lock, which is what makes send-relaunch and worker-exit race-free.
    pub(crate) launched: bool,
    // producer-to-parked-worker hand-off. Some(Some(v)): a value, already counted in unsent.
    // Some(None): wake with nothing, used by the close paths.
    pub(crate) alert: Option<Option<T>>,
    // trips when the current worker retires. replaced at every launch.
    pub(crate) exit: Latch,
}

// counters of producer/consumer calls currently inside the queue. the worker yields to pending
// get callers, close completion waits out in-flight sends, and close-now waits out both.
pub(crate) struct Pending {
    counts: Mutex<Counts>,
    zero: Condvar,
}

#[derive(Clone, Copy)]
struct Counts {
    sends: usize,
    gets: usize,
}

impl Pending {
    fn new() -> Self {
        Pending {
            counts: Mutex::new(Counts { sends: 0, gets: 0 }),
            zero: Condvar::new(),
        }
    }

    pub(crate) fn enter_send(&self) {
        self.counts.lock().unwrap().sends += 1;
    }

    pub(crate) fn exit_send(&self) {
        let mut lock = self.counts.lock().unwrap();
        lock.sends -= 1;
        if lock.sends == 0 {
            self.zero.notify_all();
        }
    }

    pub(crate) fn enter_get(&self) {
        self.counts.lock().unwrap().gets += 1;
    }

    pub(crate) fn exit_get(&self) {
        let mut lock = self.counts.lock().unwrap();
        lock.gets -= 1;
        if lock.gets == 0 {
            self.zero.notify_all();
        }
    }

    pub(crate) fn gets_outstanding(&self) -> bool {
        self.counts.lock().unwrap().gets > 0
    }

    pub(crate) fn wait_gets_zero(&self) {
        let mut lock = self.counts.lock().unwrap();
        while lock.gets > 0 {
            lock = self.zero.wait(lock).unwrap();
        }
    }

    pub(crate) fn wait_sends_zero(&self) {
        let mut lock = self.counts.lock().unwrap();
        while lock.sends > 0 {
            lock = self.zero.wait(lock).unwrap();
        }
    }

    pub(crate) fn wait_all_zero(&self) {
        let mut lock = self.counts.lock().unwrap();
        while lock.sends > 0 || lock.gets > 0 {
            lock = self.zero.wait(lock).unwrap();
        }
    }

    pub(crate) fn snapshot(&self) -> (usize, usize) {
        let lock = self.counts.lock().unwrap();
        (lock.sends, lock.gets)
    }
}

// queue shared state.
pub(crate) struct Core<T> {
    pub(crate) input: Mutex<InputBuffer<T>>,
    pub(crate) output: Mutex<OutputBuffer<T>>,

    // input length + output length + one for a value the worker is carrying. this is the number
    // of values a consumer may still observe.
    pub(crate) unsent: AtomicUsize,

    // configuration. read at launch/hand-off decisions; effectively fixed once the queue is used.
    pub(crate) mode: AtomicU8,
    pub(crate) alloc_hint: AtomicUsize,

    // once set, sends are no-ops. set by both close flavors.
    pub(crate) close_invoked: AtomicBool,
    // the stronger flavor: buffered values are discarded rather than drained.
    pub(crate) close_now_invoked: AtomicBool,

    // trips once the close winner has finished arming the deferred close.
    pub(crate) close_armed: Latch,
    // trips once the delivery channel is observably closed. this is the close latch.
    pub(crate) closed_latch: Latch,
    // trips at empty-and-closed.
    pub(crate) drained_latch: Latch,
    // trips once close-now teardown is complete; losing close-now callers wait on it.
    pub(crate) close_now_latch: Latch,

    // tripped while data is available, re-armed when the queue drains. tripped permanently once
    // the queue closes so that no waiter hangs.
    pub(crate) data_wait: CyclicLatch,

    pub(crate) delivery: Delivery<T>,

    pub(crate) thread: Mutex<ThreadControl<T>>,
    // notified when the alert slot is filled or a close path wants a parked worker to wake.
    pub(crate) alert_cond: Condvar,

    pub(crate) pending: Pending,
    pub(crate) errors: ErrorStore,
}

impl<T> Core<T> {
    pub(crate) fn new(mode: WorkerMode) -> Self {
        Core {
            input: Mutex::new(InputBuffer {
                elems: Vec::new(),
                watermark: 0,
            }),
            output: Mutex::new(OutputBuffer {
                elems: VecDeque::new(),
                watermark: 0,
            }),
            unsent: AtomicUsize::new(0),
            mode: AtomicU8::new(mode as u8),
            alloc_hint: AtomicUsize::new(DEFAULT_ALLOCATION),
            close_invoked: AtomicBool::new(false),
            close_now_invoked: AtomicBool::new(false),
            close_armed: Latch::new(),
            closed_latch: Latch::new(),
            drained_latch: Latch::new(),
            close_now_latch: Latch::new(),
            data_wait: CyclicLatch::new(),
            delivery: Delivery::new(),
            thread: Mutex::new(ThreadControl {
                status: WorkerStatus::NoLaunch,
                launched: false,
                alert: None,
                exit: Latch::new(),
            }),
            alert_cond: Condvar::new(),
            pending: Pending::new(),
            errors: ErrorStore::new(),
        }
    }

    pub(crate) fn worker_mode(&self) -> WorkerMode {
        WorkerMode::from_u8(self.mode.load(SeqCst))
    }

    // append to the input buffer, applying the allocation hint on the buffer's first growth.
    pub(crate) fn push_input(&self, input: &mut InputBuffer<T>, value: T) {
        if input.elems.capacity() == 0 {
            input.elems.reserve(self.alloc_hint.load(SeqCst).max(1));
        }
        input.elems.push(value);
        if input.elems.capacity() > input.watermark {
            input.watermark = input.elems.capacity();
        }
    }

    // swap the input buffer into an empty output buffer. caller holds the output lock.
    pub(crate) fn refill_output(&self, out: &mut OutputBuffer<T>) {
        debug_assert!(out.elems.is_empty());
        let mut input = self.input.lock().unwrap();
        if input.elems.is_empty() {
            return;
        }
        out.elems = VecDeque::from(std::mem::take(&mut input.elems));
        if out.elems.capacity() > out.watermark {
            out.watermark = out.elems.capacity();
        }
    }

    // re-arm the data-wait latch because the queue was observed empty.
    //
    // the rearm races against a concurrent send's trip; the recheck closes the current cycle
    // again if a value (or a close) arrived in the window, so the latch is tripped whenever data
    // is available, within a bounded number of steps.
    pub(crate) fn rearm_data_wait(&self) {
        if self.close_invoked.load(SeqCst) {
            return;
        }
        self.data_wait.open();
        if self.unsent.load(SeqCst) > 0 || self.close_invoked.load(SeqCst) {
            self.data_wait.close();
        }
    }

    // account for a value leaving through the delivery channel.
    pub(crate) fn note_value_consumed(&self) {
        let before = self.unsent.fetch_sub(1, SeqCst);
        debug_assert!(before >= 1, "unsent count underflow");
        if before == 1 {
            self.rearm_data_wait();
        }
    }

    // bookkeeping after a batch drain released the output lock: re-arm the data-wait latch, and
    // complete a pending deferred close if this drainer emptied the queue and no worker is around
    // to do it.
    pub(crate) fn note_drained(&self) {
        if self.unsent.load(SeqCst) > 0 {
            return;
        }
        if self.close_invoked.load(SeqCst) {
            if !self.close_now_invoked.load(SeqCst) && !self.thread.lock().unwrap().launched {
                self.try_complete_close();
            }
        } else {
            self.rearm_data_wait();
        }
    }

    // finish the close: close the delivery channel and trip the terminal latches. idempotent.
    //
    // bails if values are still observable (a send that was in flight when close was invoked may
    // have landed one); whichever path drains those values calls back in here.
    pub(crate) fn try_complete_close(&self) {
        debug_assert!(self.close_invoked.load(SeqCst));
        self.pending.wait_sends_zero();
        if self.unsent.load(SeqCst) > 0 && !self.close_now_invoked.load(SeqCst) {
            return;
        }
        self.delivery.close();
        self.drained_latch.close_eventually_consistent();
        self.data_wait.close();
        if self.closed_latch.close_eventually_consistent() {
            debug!("queue close complete");
        }
    }

    pub(crate) fn set_status(&self, status: WorkerStatus) {
        self.thread.lock().unwrap().status = status;
    }

    pub(crate) fn thread_status(&self) -> WorkerStatus {
        self.thread.lock().unwrap().status
    }
}

impl<T: Send + 'static> Core<T> {
    // launch the worker thread. caller holds the thread control lock and has checked that no
    // worker is alive.
    pub(crate) fn launch_worker(self: &Arc<Self>, control: &mut ThreadControl<T>) {
        debug_assert!(!control.launched);
        control.launched = true;
        control.status = WorkerStatus::Running;
        control.alert = None;
        control.exit = Latch::new();
        let core = Arc::clone(self);
        thread::Builder::new()
            .name("sluice-worker".to_owned())
            .spawn(move || worker::run(core))
            .expect("failed to spawn queue worker thread");
    }
}
