//! Configuration file support for beatloom
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/beatloom/config.toml`
//! - macOS: `~/Library/Application Support/beatloom/config.toml`
//! - Windows: `%APPDATA%\beatloom\config.toml`
//!
//! Durations are written in human-readable form (`"1ms"`, `"100ms"`).

use crate::error::{Error, Result};
use crate::note::{MAX_CHANNEL, MAX_DATA_BYTE};
use crate::timing::{validate_bpm, DEFAULT_BPM};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BPM: &str = "BEATLOOM_BPM";
pub const ENV_TICK: &str = "BEATLOOM_TICK";
pub const ENV_LOOKAHEAD: &str = "BEATLOOM_LOOKAHEAD";
pub const ENV_MAX_SEQUENCES: &str = "BEATLOOM_MAX_SEQUENCES";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling loop configuration
    pub scheduler: SchedulerSettings,
    /// Values used when a command leaves them out
    pub defaults: NoteDefaults,
    /// MIDI port configuration
    pub midi: MidiSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::config_path() {
            Ok(path) => Self::load_or_default_from(&path),
            Err(e) => {
                log::debug!("No config location available: {}", e);
                Self::default()
            }
        }
    }

    fn load_or_default_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring invalid config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "beatloom") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config_file(&path)?;
        Ok(path)
    }

    /// Write the commented default config to `path`
    pub fn write_default_config_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# beatloom configuration file

[scheduler]
# Interval between scheduling passes
tick = "1ms"

# How far ahead events are placed into the pending queue
lookahead = "100ms"

# Tempo of the transport at startup
initial_bpm = 120.0

# Maximum number of simultaneously active sequences (optional)
# max_sequences = 64

[defaults]
# Used by play_note / play_sequence when a note leaves them out
velocity = 100
channel = 0
duration = 0.5

[midi]
# Client name shown to other MIDI applications
client_name = "beatloom"

# Output port to open (case-insensitive substring match)
port_name = "beatloom"

# Create a virtual output port instead of connecting to an existing one (unix only)
virtual_port = true
"#;

        fs::write(path, content)?;
        Ok(())
    }

    /// Check the configured values for consistency
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.tick.is_zero() {
            return Err(Error::Config("scheduler.tick must be greater than zero".to_string()));
        }
        if scheduler.lookahead <= scheduler.tick {
            return Err(Error::Config(format!(
                "scheduler.lookahead ({}) must be longer than scheduler.tick ({})",
                humantime::format_duration(scheduler.lookahead),
                humantime::format_duration(scheduler.tick)
            )));
        }
        if validate_bpm(scheduler.initial_bpm).is_err() {
            return Err(Error::Config(format!(
                "scheduler.initial_bpm must be positive, got {}",
                scheduler.initial_bpm
            )));
        }
        if scheduler.max_sequences == Some(0) {
            return Err(Error::Config("scheduler.max_sequences must be at least 1".to_string()));
        }

        let defaults = &self.defaults;
        if defaults.velocity > MAX_DATA_BYTE {
            return Err(Error::Config(format!(
                "defaults.velocity must be 0-127, got {}",
                defaults.velocity
            )));
        }
        if defaults.channel > MAX_CHANNEL {
            return Err(Error::Config(format!(
                "defaults.channel must be 0-15, got {}",
                defaults.channel
            )));
        }
        if !defaults.duration.is_finite() || defaults.duration <= 0.0 {
            return Err(Error::Config(format!(
                "defaults.duration must be positive, got {}",
                defaults.duration
            )));
        }
        Ok(())
    }

    /// Apply `BEATLOOM_*` environment overrides and re-validate
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BPM) {
            self.scheduler.initial_bpm = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_BPM}: invalid number '{value}'")))?;
        }
        if let Some(value) = lookup(ENV_TICK) {
            self.scheduler.tick = parse_env_duration(ENV_TICK, &value)?;
        }
        if let Some(value) = lookup(ENV_LOOKAHEAD) {
            self.scheduler.lookahead = parse_env_duration(ENV_LOOKAHEAD, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_SEQUENCES) {
            let limit = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_MAX_SEQUENCES}: invalid count '{value}'")))?;
            self.scheduler.max_sequences = Some(limit);
        }
        self.validate()
    }
}

fn parse_env_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("{key}: invalid duration '{value}': {e}")))
}

/// Scheduling loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Interval between scheduling passes
    #[serde(with = "humantime_duration")]
    pub tick: Duration,
    /// Lookahead window
    #[serde(with = "humantime_duration")]
    pub lookahead: Duration,
    /// Optional cap on simultaneously active sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sequences: Option<usize>,
    /// Transport tempo at startup
    pub initial_bpm: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1),
            lookahead: Duration::from_millis(100),
            max_sequences: None,
            initial_bpm: DEFAULT_BPM,
        }
    }
}

/// Defaults applied to notes that leave fields out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteDefaults {
    /// Velocity (0-127)
    pub velocity: u8,
    /// MIDI channel (0-15)
    pub channel: u8,
    /// Duration in beats
    pub duration: f64,
}

impl Default for NoteDefaults {
    fn default() -> Self {
        Self {
            velocity: 100,
            channel: 0,
            duration: 0.5,
        }
    }
}

/// MIDI output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    /// Client name
    pub client_name: String,
    /// Output port name (substring match)
    pub port_name: String,
    /// Create a virtual port instead of connecting (unix only)
    pub virtual_port: bool,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            client_name: "beatloom".to_string(),
            port_name: "beatloom".to_string(),
            virtual_port: true,
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.tick, Duration::from_millis(1));
        assert_eq!(config.scheduler.lookahead, Duration::from_millis(100));
        assert_eq!(config.scheduler.initial_bpm, 120.0);
        assert_eq!(config.scheduler.max_sequences, None);
        assert_eq!(config.defaults.velocity, 100);
        assert_eq!(config.defaults.channel, 0);
        assert_eq!(config.defaults.duration, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            tick = "2ms"
            lookahead = "250ms"
            max_sequences = 8

            [defaults]
            channel = 9
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.tick, Duration::from_millis(2));
        assert_eq!(config.scheduler.lookahead, Duration::from_millis(250));
        assert_eq!(config.scheduler.max_sequences, Some(8));
        assert_eq!(config.defaults.channel, 9);
        assert_eq!(config.defaults.velocity, 100);
        assert_eq!(config.midi.client_name, "beatloom");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.scheduler.lookahead = Duration::from_micros(500);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.scheduler.initial_bpm = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.defaults.channel = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.defaults.duration = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BPM, "90"),
            (ENV_LOOKAHEAD, "50ms"),
            (ENV_MAX_SEQUENCES, "4"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.scheduler.initial_bpm, 90.0);
        assert_eq!(config.scheduler.lookahead, Duration::from_millis(50));
        assert_eq!(config.scheduler.max_sequences, Some(4));
        assert_eq!(config.scheduler.tick, Duration::from_millis(1));

        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == ENV_TICK).then(|| "soon".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.scheduler.initial_bpm = 96.0;
        config.midi.port_name = "Synth".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(Config::load_or_default_from(&path), Config::default());

        fs::write(&path, "[scheduler]\ninitial_bpm = -1.0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
        assert_eq!(Config::load_or_default_from(&path), Config::default());

        fs::write(&path, "[scheduler]\ninitial_bpm = 90.0\n").unwrap();
        assert_eq!(Config::load_or_default_from(&path).scheduler.initial_bpm, 90.0);
    }

    #[test]
    fn test_default_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::write_default_config_file(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }
}
