// the worker thread.
//
// at most one worker is alive per queue. it pumps values from the buffers into the delivery
// slot, one at a time, and is the party that completes a deferred close once the queue drains.
// the loop walks a small state machine, with the current state published in the thread control
// block:
//
//      Running ------> SendBlocked: a value is in hand, offered on the delivery slot until a
//         ^  |                      consumer takes it or close-now rejects it.
//         |  |
//         |  \-------> InGetsHold: get callers are pending; the worker stays off the output
//         |                        lock until they are through.
//         |
//         |----------> AwaitingAlert (Always mode only): queue empty, parked until a producer
//         |                          hands a value over or a close path wakes it.
//         |
//         \----------> InSendsHold: close invoked and queue drained; waiting out in-flight
//                                   sends before retiring and completing the close.
//
// exit (to Exited) happens only with the thread control lock held and the unsent count
// re-checked under it: a send that raced past the worker's empty observation either lands
// before the re-check (the worker keeps running) or finds `launched` already false and
// relaunches. nothing is stranded.

use super::{
    api::{WorkerMode, WorkerStatus},
    core::{Core, ThreadControl},
    delivery::OfferOutcome,
    error::{panic_message, TaskPanicked},
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering::SeqCst, Arc, MutexGuard},
};


// worker thread entry point.
pub(crate) fn run<T: Send + 'static>(core: Arc<Core<T>>) {
    trace!("queue worker launched");
    match catch_unwind(AssertUnwindSafe(|| work_loop(&core))) {
        Ok(()) => trace!("queue worker exited"),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("unrecoverable panic in queue worker task: {message}");
            core.errors.push(TaskPanicked { message });
            // the loop retires on every normal path; the panic path retires here so no peer
            // waits on the exit latch forever
            retire(&core);
        }
    }
    // a deferred close whose last value this worker delivered is completed after retiring, so
    // `launched` is already false for anyone re-checking. close-now teardown is owned by the
    // close-now caller.
    if core.close_invoked.load(SeqCst)
        && !core.close_now_invoked.load(SeqCst)
        && core.unsent.load(SeqCst) == 0
    {
        core.try_complete_close();
    }
}

fn work_loop<T: Send + 'static>(core: &Core<T>) {
    let mode = core.worker_mode();
    let mut in_hand: Option<T> = None;

    loop {
        // ---- a value in hand: offer it on the delivery slot ----
        if let Some(value) = in_hand.take() {
            core.set_status(WorkerStatus::SendBlocked);
            match core.delivery.offer(value) {
                OfferOutcome::Consumed => {}
                OfferOutcome::Rejected(value) => {
                    // close-now raced in while the offer was out; the teardown zeroes the count
                    trace!("dropping in-flight value, queue torn down");
                    drop(value);
                    retire(core);
                    return;
                }
            }
        }

        // ---- yield to pending get callers ----
        while core.pending.gets_outstanding() {
            core.set_status(WorkerStatus::InGetsHold);
            core.pending.wait_gets_zero();
        }
        core.set_status(WorkerStatus::Running);

        // ---- obtain the next value ----
        {
            let mut out = core.output.lock().unwrap();
            if core.close_now_invoked.load(SeqCst) {
                drop(out);
                retire(core);
                return;
            }
            if out.elems.is_empty() {
                core.refill_output(&mut out);
            }
            in_hand = out.elems.pop_front();
            if in_hand.is_none() {
                core.rearm_data_wait();
            }
        }
        if in_hand.is_some() {
            continue;
        }

        // ---- both buffers empty: exit, finish a deferred close, or park ----
        {
            let control = core.thread.lock().unwrap();
            if core.unsent.load(SeqCst) > 0 {
                // a send landed between the empty observation and this lock
                continue;
            }
            if core.close_now_invoked.load(SeqCst) {
                retire_locked(control);
                return;
            }
            if core.close_invoked.load(SeqCst) {
                drop(control);
                core.set_status(WorkerStatus::InSendsHold);
                core.pending.wait_sends_zero();
                if core.unsent.load(SeqCst) > 0 {
                    // an in-flight send from before the close landed a value; drain it too
                    continue;
                }
                retire(core);
                return;
            }
            match mode {
                WorkerMode::OnDemand | WorkerMode::None => {
                    retire_locked(control);
                    return;
                }
                WorkerMode::Always => {}
            }
        }

        // ---- Always mode: park until a producer or a close path has something for us ----
        in_hand = park_for_alert(core);
    }
}

// park in AwaitingAlert until handed a value, or woken for any other reason (values buffered
// without a hand-off, or a close path). the main loop re-evaluates on a none return.
fn park_for_alert<T>(core: &Core<T>) -> Option<T> {
    let mut control = core.thread.lock().unwrap();
    control.status = WorkerStatus::AwaitingAlert;
    loop {
        if let Some(alert) = control.alert.take() {
            control.status = WorkerStatus::Running;
            return alert;
        }
        if core.close_invoked.load(SeqCst)
            || core.close_now_invoked.load(SeqCst)
            || core.unsent.load(SeqCst) > 0
        {
            control.status = WorkerStatus::Running;
            return None;
        }
        control = core.alert_cond.wait(control).unwrap();
    }
}

// retire the worker: clear the running flag, publish Exited, trip the exit latch.
fn retire<T>(core: &Core<T>) {
    let control = core.thread.lock().unwrap();
    retire_locked(control);
}

fn retire_locked<T>(mut control: MutexGuard<'_, ThreadControl<T>>) {
    control.launched = false;
    control.status = WorkerStatus::Exited;
    let exit = control.exit.clone();
    drop(control);
    exit.close_eventually_consistent();
}
