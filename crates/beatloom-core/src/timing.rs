//! Timing primitives for transport and scheduling.
//!
//! This module provides the fundamental timing types used by the sequencer:
//!
//! - [`BeatTime`] - Fixed-point beat representation for ordering and dedup
//! - [`TransportClock`] - Running/stopped transport with beat/time conversion
//! - [`JitterStats`] - Lateness of dispatched events versus their due instant

use crate::error::{Error, Result};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Default tempo of a fresh transport.
pub const DEFAULT_BPM: f64 = 120.0;

/// Fixed-point beat representation with 16 fractional bits.
///
/// This provides sub-beat precision while maintaining deterministic arithmetic.
/// Using fixed-point keeps pending-event keys exact so equal beats compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BeatTime {
    beats: i64,
}

impl BeatTime {
    const SCALE: i64 = 65_536;

    /// Zero beat time constant.
    pub const ZERO: BeatTime = BeatTime { beats: 0 };

    /// Smallest representable step, 1/65536 of a beat.
    pub const RESOLUTION: BeatTime = BeatTime { beats: 1 };

    /// Create a BeatTime from a floating-point beat value.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            beats: (value * Self::SCALE as f64).round() as i64,
        }
    }

    /// Convert to a floating-point beat value.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.beats as f64 / Self::SCALE as f64
    }
}

impl std::ops::Add for BeatTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_add(rhs.beats),
        }
    }
}

impl std::ops::Sub for BeatTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_sub(rhs.beats),
        }
    }
}

impl From<f64> for BeatTime {
    fn from(value: f64) -> Self {
        BeatTime::from_float(value)
    }
}

impl From<BeatTime> for f64 {
    fn from(value: BeatTime) -> Self {
        value.to_float()
    }
}

/// Check that a tempo is usable.
pub fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidTempo { bpm })
    }
}

/// Transport-aware clock for converting between wall-clock time and beats.
///
/// The clock keeps one anchor: the beat position (`anchor_beat`) that was
/// current at `anchor_instant`. Every tempo change, start and stop moves
/// both together, so the mapping is continuous across the change and
/// nothing before the change point is affected.
#[derive(Clone, Debug)]
pub struct TransportClock {
    bpm: f64,
    running: bool,
    anchor_instant: Instant,
    anchor_beat: f64,
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportClock {
    /// Create a new transport clock at 120 BPM, stopped at beat 0.
    pub fn new() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            running: false,
            anchor_instant: Instant::now(),
            anchor_beat: 0.0,
        }
    }

    /// Create a stopped clock at the given tempo.
    pub fn with_bpm(bpm: f64) -> Result<Self> {
        validate_bpm(bpm)?;
        Ok(Self {
            bpm,
            ..Self::new()
        })
    }

    /// Get the current BPM.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Check if the transport is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Wall-clock instant of the current anchor.
    pub fn beat_origin(&self) -> Instant {
        self.anchor_instant
    }

    /// Beat position at the current anchor.
    pub fn beat_at_origin(&self) -> f64 {
        self.anchor_beat
    }

    /// Length of one beat at the current tempo.
    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }

    /// Set the BPM, preserving the current beat position.
    ///
    /// Fails with [`Error::InvalidTempo`] and leaves the clock untouched
    /// when `bpm` is not a positive number.
    pub fn set_bpm(&mut self, bpm: f64, now: Instant) -> Result<()> {
        validate_bpm(bpm)?;
        let beat = self.beat_at(now);
        self.anchor_beat = beat;
        self.anchor_instant = now;
        self.bpm = bpm;
        Ok(())
    }

    /// Start the transport at the given instant, resuming from the
    /// position where it was stopped.
    ///
    /// Returns false if it was already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.anchor_instant = now;
        self.running = true;
        true
    }

    /// Stop the transport, preserving the current beat position.
    ///
    /// Returns false if it was already stopped.
    pub fn stop(&mut self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        self.anchor_beat = self.beat_at(now);
        self.anchor_instant = now;
        self.running = false;
        true
    }

    /// Stop and rewind to beat 0.
    pub fn reset(&mut self, now: Instant) {
        self.stop(now);
        self.anchor_beat = 0.0;
        self.anchor_instant = now;
    }

    /// Calculate the beat position at a given instant.
    ///
    /// While stopped this is the frozen position.
    pub fn beat_at(&self, time: Instant) -> f64 {
        if !self.running {
            return self.anchor_beat;
        }

        let beats_per_second = self.bpm / 60.0;
        if time >= self.anchor_instant {
            let elapsed = time.duration_since(self.anchor_instant).as_secs_f64();
            self.anchor_beat + elapsed * beats_per_second
        } else {
            let before = self.anchor_instant.duration_since(time).as_secs_f64();
            self.anchor_beat - before * beats_per_second
        }
    }

    /// Convert a wall-clock instant into a beat position.
    pub fn wallclock_to_beat(&self, time: Instant) -> Result<f64> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        Ok(self.beat_at(time))
    }

    /// Convert a beat position into the wall-clock instant it falls on.
    ///
    /// Beats do not advance while stopped, so a stopped transport has no
    /// answer and returns [`Error::NotRunning`]. A beat too far ahead for
    /// an [`Instant`] at the current tempo returns [`Error::TimeOutOfRange`].
    pub fn beat_to_wallclock(&self, beat: f64) -> Result<Instant> {
        if !self.running {
            return Err(Error::NotRunning);
        }

        let seconds = (beat - self.anchor_beat) * self.seconds_per_beat();
        let out_of_range = || Error::TimeOutOfRange { beat };
        let offset = Duration::try_from_secs_f64(seconds.abs()).map_err(|_| out_of_range())?;
        if seconds >= 0.0 {
            self.anchor_instant.checked_add(offset).ok_or_else(out_of_range)
        } else {
            Ok(self
                .anchor_instant
                .checked_sub(offset)
                .unwrap_or(self.anchor_instant))
        }
    }

    /// Calculate how many beats fit in the given lookahead window.
    pub fn lookahead_beats(&self, lookahead: Duration) -> f64 {
        lookahead.as_secs_f64() * (self.bpm / 60.0)
    }
}

/// Lateness above which a dispatch is logged at debug level.
pub const GOOD_JITTER: Duration = Duration::from_micros(500);
/// Lateness above which a dispatch is logged as a warning.
pub const WARNING_JITTER: Duration = Duration::from_millis(2);
/// Lateness above which a dispatch is logged as an error.
pub const CRITICAL_JITTER: Duration = Duration::from_millis(5);

/// Running statistics over how late events were dispatched.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JitterStats {
    pub count: u64,
    #[serde(with = "duration_micros")]
    pub total: Duration,
    #[serde(with = "duration_micros")]
    pub max: Duration,
}

impl JitterStats {
    /// Record one dispatch that happened `lateness` after its due instant.
    pub fn record(&mut self, lateness: Duration) {
        self.count += 1;
        self.total += lateness;
        if lateness > self.max {
            self.max = lateness;
        }
    }

    /// Mean lateness, zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total.div_f64(self.count as f64)
    }

    /// Log level matching the severity of a lateness value.
    pub fn severity(lateness: Duration) -> log::Level {
        if lateness > CRITICAL_JITTER {
            log::Level::Error
        } else if lateness > WARNING_JITTER {
            log::Level::Warn
        } else if lateness > GOOD_JITTER {
            log::Level::Debug
        } else {
            log::Level::Trace
        }
    }
}

mod duration_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(value.as_micros())
    }
}
