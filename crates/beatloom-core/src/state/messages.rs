//! Commands accepted by the runtime.
//!
//! All externally requested operations are represented as [`Command`]
//! variants. Commands are plain data and (de)serialise as JSON objects
//! with a `type` tag, for example:
//!
//! ```json
//! {"type": "play_note", "pitch": 60, "duration": 1.0}
//! {"type": "play_sequence", "loop": true, "notes": [{"pitch": 60}, {"pitch": 64}]}
//! {"type": "set_tempo", "bpm": 96}
//! ```

use crate::config::NoteDefaults;
use crate::error::Result;
use crate::note::Note;
use crate::sequence::{Sequence, SequenceId};
use serde::{Deserialize, Serialize};

/// Operations an external producer can request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Play a single note now.
    PlayNote {
        pitch: u8,
        velocity: Option<u8>,
        channel: Option<u8>,
        /// Length in beats.
        duration: Option<f64>,
    },

    /// Play a list of notes, optionally looping.
    PlaySequence {
        notes: Vec<NoteSpec>,
        #[serde(default, alias = "loop")]
        looping: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_length: Option<f64>,
    },

    /// Stop one sequence by id.
    StopSequence { sequence_id: SequenceId },

    /// Stop every active sequence.
    StopAll,

    /// Change the tempo.
    SetTempo { bpm: f64 },

    /// Start the transport.
    StartTransport,

    /// Stop the transport, silencing sounding notes.
    StopTransport,

    /// Stop and rewind the transport to beat 0.
    ResetTransport,

    /// Send note-off on every pitch and channel.
    AllNotesOff,

    /// Report tempo, transport state and active sequences.
    Status,
}

impl Command {
    /// The `type` tag of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::PlayNote { .. } => "play_note",
            Command::PlaySequence { .. } => "play_sequence",
            Command::StopSequence { .. } => "stop_sequence",
            Command::StopAll => "stop_all",
            Command::SetTempo { .. } => "set_tempo",
            Command::StartTransport => "start_transport",
            Command::StopTransport => "stop_transport",
            Command::ResetTransport => "reset_transport",
            Command::AllNotesOff => "all_notes_off",
            Command::Status => "status",
        }
    }
}

/// A note inside a `play_sequence` command. Missing fields fall back to
/// the configured defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteSpec {
    pub pitch: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    /// Length in beats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Offset in beats; when absent the note follows the previous one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
}

impl NoteSpec {
    pub fn new(pitch: u8) -> Self {
        Self {
            pitch,
            velocity: None,
            channel: None,
            duration: None,
            start: None,
        }
    }

    /// Resolve into a validated note, starting at `fallback_start` unless
    /// an explicit start is given.
    pub fn to_note(&self, defaults: &NoteDefaults, fallback_start: f64) -> Result<Note> {
        Note::new(
            self.pitch,
            self.velocity.unwrap_or(defaults.velocity),
            self.channel.unwrap_or(defaults.channel),
            self.start.unwrap_or(fallback_start),
            self.duration.unwrap_or(defaults.duration),
        )
    }
}

/// Build a sequence from note specs, placing notes without a start right
/// after the note before them.
pub(crate) fn build_sequence(
    notes: &[NoteSpec],
    looping: bool,
    name: Option<&str>,
    loop_length: Option<f64>,
    defaults: &NoteDefaults,
) -> Result<Sequence> {
    let mut builder = Sequence::builder().looping(looping);
    if let Some(name) = name {
        builder = builder.name(name);
    }
    if let Some(beats) = loop_length {
        builder = builder.loop_length(beats);
    }

    let mut cursor = 0.0;
    for spec in notes {
        let note = spec.to_note(defaults, cursor)?;
        cursor = note.end_offset();
        builder = builder.note(note);
    }
    Ok(builder.build())
}

/// Structured reply to a [`Command`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a JSON payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_commands() {
        let cmd: Command =
            serde_json::from_str(r#"{"type":"play_note","pitch":60,"duration":1.0}"#).unwrap();
        assert_eq!(
            cmd,
            Command::PlayNote {
                pitch: 60,
                velocity: None,
                channel: None,
                duration: Some(1.0),
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"type":"stop_all"}"#).unwrap();
        assert_eq!(cmd, Command::StopAll);

        let cmd: Command =
            serde_json::from_str(r#"{"type":"stop_sequence","sequence_id":7}"#).unwrap();
        assert_eq!(
            cmd,
            Command::StopSequence {
                sequence_id: SequenceId::from_raw(7)
            }
        );
        assert_eq!(cmd.name(), "stop_sequence");
    }

    #[test]
    fn test_loop_alias() {
        let cmd: Command = serde_json::from_str(
            r#"{"type":"play_sequence","loop":true,"notes":[{"pitch":60},{"pitch":64,"start":2.0}]}"#,
        )
        .unwrap();
        match cmd {
            Command::PlaySequence { notes, looping, .. } => {
                assert!(looping);
                assert_eq!(notes.len(), 2);
                assert_eq!(notes[1].start, Some(2.0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn test_build_sequence_places_notes_consecutively() {
        let defaults = NoteDefaults::default();
        let mut explicit = NoteSpec::new(67);
        explicit.start = Some(4.0);
        let mut long = NoteSpec::new(64);
        long.duration = Some(2.0);

        let seq = build_sequence(
            &[NoteSpec::new(60), long, explicit],
            false,
            Some("arp"),
            None,
            &defaults,
        )
        .unwrap();

        let starts: Vec<f64> = seq.notes().iter().map(|n| n.start_offset()).collect();
        assert_eq!(starts, vec![0.0, 0.5, 4.0]);
        assert_eq!(seq.notes()[0].velocity(), 100);
        assert_eq!(seq.name(), Some("arp"));
        assert!((seq.length_beats() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_build_sequence_rejects_invalid_note() {
        let mut bad = NoteSpec::new(60);
        bad.channel = Some(20);
        assert!(build_sequence(&[bad], false, None, None, &NoteDefaults::default()).is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = CommandOutcome::ok("Tempo set").with_data(json!({"bpm": 96.0}));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value, json!({"success": true, "message": "Tempo set", "data": {"bpm": 96.0}}));

        let failure = serde_json::to_value(CommandOutcome::failure("nope")).unwrap();
        assert_eq!(failure, json!({"success": false, "message": "nope"}));
    }
}
