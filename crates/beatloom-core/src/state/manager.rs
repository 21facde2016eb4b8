//! State manager for thread-safe sequencer access.
//!
//! The [`StateManager`] wraps the [`Sequencer`] in an `Arc<Mutex>`. The
//! scheduling thread and every command caller go through the same lock,
//! so a dispatch pass and a stop request never interleave.

use crate::sequencer::Sequencer;
use std::sync::{Arc, Mutex, PoisonError};

/// Thread-safe handle to the shared sequencer.
#[derive(Clone)]
pub struct StateManager {
    sequencer: Arc<Mutex<Sequencer>>,
}

impl StateManager {
    /// Wrap a sequencer for shared access.
    pub fn new(sequencer: Sequencer) -> Self {
        Self {
            sequencer: Arc::new(Mutex::new(sequencer)),
        }
    }

    /// Run a closure with exclusive access to the sequencer.
    ///
    /// A panic in an earlier holder does not make the state unreachable:
    /// the poisoned guard is recovered and used as is.
    pub fn with_sequencer<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Sequencer) -> R,
    {
        let mut sequencer = self
            .sequencer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut sequencer)
    }

    /// Get the current tempo.
    pub fn tempo(&self) -> f64 {
        self.with_sequencer(|s| s.current_tempo())
    }

    /// Check whether the transport is running.
    pub fn is_transport_running(&self) -> bool {
        self.with_sequencer(|s| s.is_running())
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with_sequencer(|s| {
            f.debug_struct("StateManager")
                .field("tempo", &s.current_tempo())
                .field("running", &s.is_running())
                .field("active_sequences", &s.active_sequences().len())
                .finish()
        })
    }
}
