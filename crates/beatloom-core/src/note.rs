//! The immutable note value scheduled by sequences.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest valid MIDI pitch and velocity.
pub const MAX_DATA_BYTE: u8 = 127;

/// Highest valid MIDI channel (zero-based).
pub const MAX_CHANNEL: u8 = 15;

/// MIDI pitch of middle C ("C4").
pub const MIDDLE_C: u8 = 60;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A fully specified note inside a sequence.
///
/// Offsets and durations are in beats, relative to the start of the
/// sequence iteration the note belongs to. Construct through
/// [`Note::new`] so the value is always in range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Note {
    pitch: u8,
    velocity: u8,
    channel: u8,
    start_offset: f64,
    duration: f64,
}

impl Note {
    /// Create a validated note.
    pub fn new(pitch: u8, velocity: u8, channel: u8, start_offset: f64, duration: f64) -> Result<Self> {
        if pitch > MAX_DATA_BYTE {
            return Err(Error::InvalidNote(format!("pitch must be 0-127, got {pitch}")));
        }
        if velocity > MAX_DATA_BYTE {
            return Err(Error::InvalidNote(format!(
                "velocity must be 0-127, got {velocity}"
            )));
        }
        if channel > MAX_CHANNEL {
            return Err(Error::InvalidNote(format!("channel must be 0-15, got {channel}")));
        }
        if !start_offset.is_finite() || start_offset < 0.0 {
            return Err(Error::InvalidNote(format!(
                "start offset must be >= 0, got {start_offset}"
            )));
        }
        if !duration.is_finite() || duration <= 0.0 {
            return Err(Error::InvalidNote(format!(
                "duration must be positive, got {duration}"
            )));
        }
        Ok(Self {
            pitch,
            velocity,
            channel,
            start_offset,
            duration,
        })
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Offset of the note-on from the start of the iteration, in beats.
    pub fn start_offset(&self) -> f64 {
        self.start_offset
    }

    /// Length of the note in beats.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Offset of the note-off from the start of the iteration, in beats.
    pub fn end_offset(&self) -> f64 {
        self.start_offset + self.duration
    }

    /// Copy of this note moved to another offset.
    pub fn at_offset(&self, start_offset: f64) -> Result<Self> {
        Self::new(self.pitch, self.velocity, self.channel, start_offset, self.duration)
    }
}

impl<'de> Deserialize<'de> for Note {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            pitch: u8,
            velocity: u8,
            channel: u8,
            start_offset: f64,
            duration: f64,
        }

        let raw = Raw::deserialize(deserializer)?;
        Note::new(raw.pitch, raw.velocity, raw.channel, raw.start_offset, raw.duration)
            .map_err(serde::de::Error::custom)
    }
}

/// Human-readable name for a MIDI pitch, e.g. 60 -> "C4".
pub fn note_name(pitch: u8) -> String {
    let octave = (pitch / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(pitch % 12) as usize], octave)
}

/// Parse a note name such as "C4", "f#3" or "Bb-1" into a MIDI pitch.
///
/// A bare number is accepted as a pitch as well.
pub fn parse_note_name(name: &str) -> Result<u8> {
    let name = name.trim();
    if let Ok(pitch) = name.parse::<u8>() {
        if pitch <= MAX_DATA_BYTE {
            return Ok(pitch);
        }
        return Err(Error::InvalidNote(format!("pitch must be 0-127, got {pitch}")));
    }

    let mut chars = name.chars();
    let letter = chars
        .next()
        .ok_or_else(|| Error::InvalidNote("empty note name".to_string()))?;
    let base: i32 = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return Err(Error::InvalidNote(format!("unknown note name '{name}'"))),
    };

    let rest = chars.as_str();
    let (accidental, octave_str) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest),
    };

    let octave: i32 = octave_str
        .parse()
        .map_err(|_| Error::InvalidNote(format!("missing octave in '{name}'")))?;

    let pitch = (octave + 1) * 12 + base + accidental;
    if !(0..=MAX_DATA_BYTE as i32).contains(&pitch) {
        return Err(Error::InvalidNote(format!("'{name}' is outside the MIDI range")));
    }
    Ok(pitch as u8)
}
