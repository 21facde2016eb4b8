//! beatloom core - precise MIDI note scheduling.
//!
//! This crate provides the building blocks of the beatloom sequencer:
//!
//! - **Notes & Sequences** - Validated note values and immutable, optionally looping sequences
//! - **Timing** - Transport clock with beat/wall-clock conversion and jitter statistics
//! - **Scheduler** - Lookahead event scheduling with per-sequence watermarks
//! - **Sequencer** - Dispatch, sounding-note tracking and stop paths
//! - **Output** - The note output capability and its backends
//! - **State & Runtime** - Shared state, the command vocabulary and the scheduling thread
//! - **Config** - TOML configuration
//!
//! # Architecture
//!
//! The [`Sequencer`] is deterministic: every time-dependent call takes the
//! current instant. The [`Runtime`] wraps it in a [`StateManager`] and drives
//! it from a dedicated thread, while [`RuntimeHandle`] exposes the command
//! surface to any number of callers.
//!
//! # Feature Flags
//!
//! - `native` - MIDI port output through midir (needs ALSA on Linux)

pub mod config;
pub mod error;
pub mod note;
pub mod output;
pub mod runtime;
pub mod scheduler;
pub mod sequence;
pub mod sequencer;
pub mod state;
pub mod timing;

// Re-export main types for convenience
pub use config::{Config, MidiSettings, NoteDefaults, SchedulerSettings};
pub use error::{Error, OutputError, Result};
pub use note::{note_name, parse_note_name, Note};
pub use output::{LogOutput, MidiMessage, NoteOutput, RecordingOutput};
pub use runtime::{Runtime, RuntimeHandle};
pub use scheduler::{EventKind, EventScheduler, SequenceInfo};
pub use sequence::{Sequence, SequenceBuilder, SequenceId};
pub use sequencer::{SchedulerReport, Sequencer};
pub use state::{Command, CommandOutcome, NoteSpec, StateManager};
pub use timing::{BeatTime, JitterStats, TransportClock};

#[cfg(feature = "native")]
pub use output::{list_output_ports, MidirOutput};
