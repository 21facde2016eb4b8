//! Shared sequencer state and the command vocabulary.
//!
//! - [`StateManager`] - Thread-safe access to the [`Sequencer`](crate::sequencer::Sequencer)
//! - [`Command`] - Every operation an external producer can request
//! - [`CommandOutcome`] - The structured reply to a [`Command`]

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{Command, CommandOutcome, NoteSpec};
pub(crate) use messages::build_sequence;

// Query rows are part of the state surface
pub use crate::scheduler::SequenceInfo;
