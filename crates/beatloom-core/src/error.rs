//! Error types for the scheduling core.

use crate::sequence::SequenceId;
use thiserror::Error;

/// Result type alias for beatloom operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the scheduling core.
#[derive(Debug, Error)]
pub enum Error {
    /// Tempo was zero, negative or not a finite number.
    #[error("Invalid tempo: {bpm} BPM (must be > 0)")]
    InvalidTempo { bpm: f64 },

    /// Pitch, velocity or channel out of range, or a non-positive duration.
    #[error("Invalid note: {0}")]
    InvalidNote(String),

    /// No registered sequence has this id.
    #[error("Sequence {0} not found")]
    NotFound(SequenceId),

    /// The registry already holds the configured maximum of sequences.
    #[error("Sequence limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    /// The note output rejected an event.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// Beat/time conversion requested while the transport is stopped.
    #[error("Transport is not running")]
    NotRunning,

    /// The beat lies beyond any representable instant at the current tempo.
    #[error("Beat {beat} is out of the representable time range")]
    TimeOutOfRange { beat: f64 },

    /// The scheduling thread has shut down.
    #[error("Runtime has shut down")]
    Shutdown,

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Failure reported by a [`NoteOutput`](crate::output::NoteOutput).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutputError {
    /// The underlying port refused the message.
    #[error("failed to send {message}: {reason}")]
    Send { message: String, reason: String },

    /// The output is not connected to any port.
    #[error("output '{0}' is disconnected")]
    Disconnected(String),
}
