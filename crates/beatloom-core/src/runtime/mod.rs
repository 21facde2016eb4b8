//! beatloom runtime - drives the sequencer from a dedicated thread.
//!
//! The runtime manages:
//! - The scheduling thread and its wake-ups
//! - The shared sequencer state
//! - Report delivery to callers

pub mod thread;

pub use thread::{Runtime, RuntimeHandle};
