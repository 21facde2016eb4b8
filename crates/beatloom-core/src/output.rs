//! Note output backends.
//!
//! The sequencer emits through the [`NoteOutput`] capability. Backends:
//!
//! - [`LogOutput`] - writes events to the log only
//! - [`RecordingOutput`] - keeps every event in memory (tests, dry runs)
//! - [`MidirOutput`] - hardware/virtual MIDI port via midir (`native` feature)

use crate::error::OutputError;
use crate::note::note_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// MIDI message types emitted by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on: channel, note, velocity
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off: channel, note
    NoteOff { channel: u8, note: u8 },
}

impl MidiMessage {
    /// Convert to raw MIDI bytes
    pub fn to_bytes(&self) -> [u8; 3] {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                [0x90 | (channel & 0x0F), *note & 0x7F, *velocity & 0x7F]
            }
            MidiMessage::NoteOff { channel, note } => [0x80 | (channel & 0x0F), *note & 0x7F, 0],
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    pub fn note(&self) -> u8 {
        match self {
            MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => *note,
        }
    }

    pub fn channel(&self) -> u8 {
        match self {
            MidiMessage::NoteOn { channel, .. } | MidiMessage::NoteOff { channel, .. } => *channel,
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "note_on {} ch={} vel={}", note_name(*note), channel, velocity)
            }
            MidiMessage::NoteOff { channel, note } => {
                write!(f, "note_off {} ch={}", note_name(*note), channel)
            }
        }
    }
}

/// Sink that performs the actual emission of note events.
///
/// Implementations must send events in the order they are called and
/// must not block for long: the scheduling loop calls them inline.
pub trait NoteOutput: Send {
    /// Send a note on message
    fn send_note_on(&mut self, channel: u8, pitch: u8, velocity: u8) -> Result<(), OutputError>;

    /// Send a note off message
    fn send_note_off(&mut self, channel: u8, pitch: u8) -> Result<(), OutputError>;

    /// Get the port name
    fn port_name(&self) -> &str;

    /// Check if connected
    fn is_connected(&self) -> bool {
        true
    }
}

/// Output that only logs (useful when no MIDI port is available).
#[derive(Debug, Default)]
pub struct LogOutput;

impl NoteOutput for LogOutput {
    fn send_note_on(&mut self, channel: u8, pitch: u8, velocity: u8) -> Result<(), OutputError> {
        log::debug!("MIDI Note On: ch={} note={} vel={}", channel, pitch, velocity);
        Ok(())
    }

    fn send_note_off(&mut self, channel: u8, pitch: u8) -> Result<(), OutputError> {
        log::debug!("MIDI Note Off: ch={} note={}", channel, pitch);
        Ok(())
    }

    fn port_name(&self) -> &str {
        "log"
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Output that records every message it accepts.
///
/// Clones share the same buffer, so a test can hand one clone to the
/// sequencer and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutput {
    messages: Arc<Mutex<Vec<MidiMessage>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail (and not be recorded) until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// All recorded messages so far.
    pub fn messages(&self) -> Vec<MidiMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the recorded messages.
    pub fn take(&self) -> Vec<MidiMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, message: MidiMessage) -> Result<(), OutputError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(OutputError::Send {
                message: message.to_string(),
                reason: "recording output set to fail".to_string(),
            });
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}

impl NoteOutput for RecordingOutput {
    fn send_note_on(&mut self, channel: u8, pitch: u8, velocity: u8) -> Result<(), OutputError> {
        self.record(MidiMessage::NoteOn {
            channel,
            note: pitch,
            velocity,
        })
    }

    fn send_note_off(&mut self, channel: u8, pitch: u8) -> Result<(), OutputError> {
        self.record(MidiMessage::NoteOff { channel, note: pitch })
    }

    fn port_name(&self) -> &str {
        "recording"
    }
}

#[cfg(feature = "native")]
pub use native::{list_output_ports, MidirOutput};

#[cfg(feature = "native")]
mod native {
    use super::{MidiMessage, NoteOutput};
    use crate::config::MidiSettings;
    use crate::error::{Error, OutputError, Result};
    use midir::{MidiOutput, MidiOutputConnection};

    /// MIDI output through midir (ALSA / CoreMIDI / WinMM).
    pub struct MidirOutput {
        connection: MidiOutputConnection,
        port_name: String,
    }

    impl MidirOutput {
        /// Open the first output port whose name contains `name` (case-insensitive).
        pub fn open_by_name(client_name: &str, name: &str) -> Result<Self> {
            let midi_out = MidiOutput::new(client_name)
                .map_err(|e| Error::Config(format!("Failed to create MIDI output: {}", e)))?;

            let name_lower = name.to_lowercase();
            let port = midi_out
                .ports()
                .into_iter()
                .find(|p| {
                    midi_out
                        .port_name(p)
                        .map(|n| n.to_lowercase().contains(&name_lower))
                        .unwrap_or(false)
                })
                .ok_or_else(|| Error::Config(format!("No MIDI output port matching '{}'", name)))?;

            let port_name = midi_out
                .port_name(&port)
                .unwrap_or_else(|_| name.to_string());
            let connection = midi_out
                .connect(&port, "beatloom-out")
                .map_err(|e| Error::Config(format!("Failed to connect to MIDI port: {}", e)))?;

            log::info!("Connected to MIDI output: {}", port_name);
            Ok(Self {
                connection,
                port_name,
            })
        }

        /// Create a virtual output port other applications can connect to.
        #[cfg(unix)]
        pub fn create_virtual(client_name: &str, port_name: &str) -> Result<Self> {
            use midir::os::unix::VirtualOutput;

            let midi_out = MidiOutput::new(client_name)
                .map_err(|e| Error::Config(format!("Failed to create MIDI output: {}", e)))?;
            let connection = midi_out
                .create_virtual(port_name)
                .map_err(|e| Error::Config(format!("Failed to create virtual port: {}", e)))?;

            let full_name = format!("{}:{}", client_name, port_name);
            log::info!("Created virtual MIDI port {}", full_name);
            Ok(Self {
                connection,
                port_name: full_name,
            })
        }

        /// Open the port described by the `[midi]` config section.
        pub fn from_settings(settings: &MidiSettings) -> Result<Self> {
            #[cfg(unix)]
            if settings.virtual_port {
                return Self::create_virtual(&settings.client_name, &settings.port_name);
            }
            Self::open_by_name(&settings.client_name, &settings.port_name)
        }

        fn write(&mut self, message: MidiMessage) -> std::result::Result<(), OutputError> {
            self.connection
                .send(&message.to_bytes())
                .map_err(|e| OutputError::Send {
                    message: message.to_string(),
                    reason: e.to_string(),
                })
        }
    }

    impl NoteOutput for MidirOutput {
        fn send_note_on(&mut self, channel: u8, pitch: u8, velocity: u8) -> std::result::Result<(), OutputError> {
            self.write(MidiMessage::NoteOn {
                channel,
                note: pitch,
                velocity,
            })
        }

        fn send_note_off(&mut self, channel: u8, pitch: u8) -> std::result::Result<(), OutputError> {
            self.write(MidiMessage::NoteOff { channel, note: pitch })
        }

        fn port_name(&self) -> &str {
            &self.port_name
        }
    }

    /// List available MIDI output ports.
    pub fn list_output_ports() -> Result<Vec<String>> {
        let midi_out = MidiOutput::new("beatloom-ports")
            .map_err(|e| Error::Config(format!("Failed to create MIDI output: {}", e)))?;
        Ok(midi_out
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Unknown Device {}", index))
            })
            .collect())
    }
}
