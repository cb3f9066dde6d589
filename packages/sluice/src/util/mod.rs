// small shared utilities.

mod waker_set;

pub(crate) use waker_set::{next_key, WakerSet};
