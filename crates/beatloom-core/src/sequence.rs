//! Sequences: ordered, immutable lists of timed notes plus loop metadata.
//!
//! A [`Sequence`] is built once (usually through [`SequenceBuilder`]) and
//! handed to the sequencer, which owns it until it is stopped or finishes.
//! Callers keep only the [`SequenceId`].
//!
//! # Example
//!
//! ```
//! use beatloom_core::{Note, Sequence};
//!
//! let seq = Sequence::builder()
//!     .note(Note::new(60, 100, 0, 0.0, 1.0).unwrap())
//!     .note(Note::new(64, 100, 0, 1.0, 1.0).unwrap())
//!     .looping(true)
//!     .build();
//! assert_eq!(seq.length_beats(), 2.0);
//! ```

use crate::error::Result;
use crate::note::Note;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a sequence. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    fn next() -> Self {
        Self(NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id, e.g. one received from a command.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One schedulable musical line.
#[derive(Clone, Debug)]
pub struct Sequence {
    id: SequenceId,
    name: Option<String>,
    notes: Arc<[Note]>,
    looping: bool,
    length_beats: f64,
}

impl Sequence {
    /// Create a sequence from notes in any order.
    ///
    /// Notes are sorted by start offset; ties keep their given order.
    pub fn new(notes: Vec<Note>, looping: bool) -> Self {
        Self::builder().notes(notes).looping(looping).build()
    }

    /// Start building a sequence.
    pub fn builder() -> SequenceBuilder {
        SequenceBuilder::default()
    }

    /// Build a sequence where each `(pitch, velocity, channel, duration)`
    /// entry starts when the previous one ends.
    pub fn from_durations(entries: &[(u8, u8, u8, f64)], looping: bool) -> Result<Self> {
        let mut builder = Self::builder().looping(looping);
        for &(pitch, velocity, channel, duration) in entries {
            builder = builder.push_after(pitch, velocity, channel, duration)?;
        }
        Ok(builder.build())
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Notes ordered by start offset.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Length of one iteration in beats; the restart distance for loops.
    pub fn length_beats(&self) -> f64 {
        self.length_beats
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Human label used in logs.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", self.id, name),
            None => self.id.to_string(),
        }
    }
}

/// Builder for [`Sequence`].
#[derive(Clone, Debug, Default)]
pub struct SequenceBuilder {
    name: Option<String>,
    notes: Vec<Note>,
    looping: bool,
    loop_length: Option<f64>,
}

impl SequenceBuilder {
    /// Set a human-readable name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a note.
    pub fn note(mut self, note: Note) -> Self {
        self.notes.push(note);
        self
    }

    /// Add several notes.
    pub fn notes(mut self, notes: impl IntoIterator<Item = Note>) -> Self {
        self.notes.extend(notes);
        self
    }

    /// Append a note starting where the latest-ending note so far ends.
    pub fn push_after(mut self, pitch: u8, velocity: u8, channel: u8, duration: f64) -> Result<Self> {
        let start = self.content_end();
        self.notes.push(Note::new(pitch, velocity, channel, start, duration)?);
        Ok(self)
    }

    /// Enable or disable looping.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Declare the loop length in beats.
    ///
    /// Only takes effect when longer than the notes themselves.
    pub fn loop_length(mut self, beats: f64) -> Self {
        self.loop_length = Some(beats);
        self
    }

    fn content_end(&self) -> f64 {
        self.notes
            .iter()
            .map(Note::end_offset)
            .fold(0.0, f64::max)
    }

    /// Finish the sequence and assign it a fresh id.
    pub fn build(mut self) -> Sequence {
        // sort_by is stable, so equal offsets keep insertion order
        self.notes
            .sort_by(|a, b| a.start_offset().total_cmp(&b.start_offset()));

        let declared = self
            .loop_length
            .filter(|beats| beats.is_finite() && *beats > 0.0)
            .unwrap_or(0.0);
        let length_beats = self.content_end().max(declared);

        Sequence {
            id: SequenceId::next(),
            name: self.name,
            notes: self.notes.into(),
            looping: self.looping,
            length_beats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, start: f64, duration: f64) -> Note {
        Note::new(pitch, 100, 0, start, duration).unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Sequence::new(vec![], false);
        let b = Sequence::new(vec![], false);
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_notes_sorted_stably() {
        let seq = Sequence::new(
            vec![note(67, 2.0, 1.0), note(60, 0.0, 1.0), note(64, 0.0, 0.5)],
            false,
        );
        let pitches: Vec<u8> = seq.notes().iter().map(|n| n.pitch()).collect();
        assert_eq!(pitches, vec![60, 64, 67]);
    }

    #[test]
    fn test_length_from_notes() {
        let seq = Sequence::new(vec![note(60, 0.0, 1.0), note(64, 1.0, 2.5)], true);
        assert!((seq.length_beats() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_declared_loop_length() {
        let longer = Sequence::builder()
            .note(note(60, 0.0, 1.0))
            .loop_length(4.0)
            .build();
        assert!((longer.length_beats() - 4.0).abs() < 1e-9);

        // A declared length shorter than the content never truncates it
        let shorter = Sequence::builder()
            .note(note(60, 0.0, 3.0))
            .loop_length(2.0)
            .build();
        assert!((shorter.length_beats() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_durations_back_to_back() {
        let seq = Sequence::from_durations(&[(60, 100, 0, 1.0), (62, 100, 0, 0.5), (64, 100, 0, 2.0)], false)
            .unwrap();
        let starts: Vec<f64> = seq.notes().iter().map(|n| n.start_offset()).collect();
        assert_eq!(starts, vec![0.0, 1.0, 1.5]);
        assert!((seq.length_beats() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_from_durations_rejects_bad_note() {
        assert!(Sequence::from_durations(&[(60, 100, 0, 1.0), (200, 100, 0, 1.0)], false).is_err());
    }

    #[test]
    fn test_empty_sequence() {
        let seq = Sequence::builder().name("silence").build();
        assert!(seq.is_empty());
        assert_eq!(seq.length_beats(), 0.0);
        assert_eq!(seq.name(), Some("silence"));
    }
}
