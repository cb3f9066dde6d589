// queue error types.

use std::sync::Mutex;
use thiserror::Error;


/// Error reporting that a queue worker task panicked
///
/// The queue's data path never fails, so this is the only error the queue produces. The panic is
/// caught on the worker thread, recorded in the queue's error store, and surfaced through
/// [`errors`](crate::Sluice::errors) and [`wait_for_close`](crate::Sluice::wait_for_close). The
/// queue itself stays usable for batch draining after a worker panic.
#[derive(Debug, Clone, Error)]
#[error("queue worker task panicked: {message}")]
pub struct TaskPanicked {
    /// The panic payload, stringified
    pub message: String,
}

/// Error for attempting an operation with no or limited blocking, and the operation not
/// completing immediately or by the specified deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation could not complete without blocking")]
pub struct WouldBlock;


// store of errors captured on behalf of a queue.
#[derive(Default)]
pub(crate) struct ErrorStore {
    errors: Mutex<Vec<TaskPanicked>>,
}

impl ErrorStore {
    pub(crate) fn new() -> Self {
        ErrorStore::default()
    }

    pub(crate) fn push(&self, error: TaskPanicked) {
        self.errors.lock().unwrap().push(error);
    }

    pub(crate) fn first(&self) -> Option<TaskPanicked> {
        self.errors.lock().unwrap().first().cloned()
    }

    pub(crate) fn all(&self) -> Vec<TaskPanicked> {
        self.errors.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

// stringify a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_stringify() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn store_keeps_order() {
        let store = ErrorStore::new();
        assert!(store.first().is_none());
        store.push(TaskPanicked { message: "a".into() });
        store.push(TaskPanicked { message: "b".into() });
        assert_eq!(store.first().unwrap().message, "a");
        assert_eq!(store.len(), 2);
        assert_eq!(store.all().len(), 2);
    }
}
