//! The sequencer: transport, scheduler, sounding notes and output in one place.
//!
//! [`Sequencer`] is single-threaded and deterministic. Every operation that
//! depends on time takes the current instant as an argument, so tests can
//! drive it with synthetic instants and the runtime thread can drive it with
//! `Instant::now()`.

use crate::config::SchedulerSettings;
use crate::error::{Error, OutputError, Result};
use crate::note::{note_name, MAX_CHANNEL, MAX_DATA_BYTE};
use crate::output::NoteOutput;
use crate::scheduler::{EventKind, EventScheduler, PendingEvent, SequenceInfo};
use crate::sequence::{Sequence, SequenceId};
use crate::timing::{JitterStats, TransportClock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Notification published by the sequencer as playback progresses.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerReport {
    /// A sequence left the registry on its own or by being stopped.
    SequenceFinished { id: SequenceId },
    /// A looping sequence began another pass.
    IterationStarted { id: SequenceId, iteration: u64 },
    /// The output rejected an event; playback carries on.
    OutputFailed {
        id: Option<SequenceId>,
        error: String,
    },
}

/// Identity of a note instance that may currently be sounding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SoundingKey {
    sequence: SequenceId,
    iteration: u64,
    slot: usize,
}

#[derive(Clone, Copy, Debug)]
struct SoundingNote {
    channel: u8,
    pitch: u8,
}

/// Owns the transport, the scheduler and the note output.
pub struct Sequencer {
    transport: TransportClock,
    scheduler: EventScheduler,
    output: Box<dyn NoteOutput>,
    sounding: BTreeMap<SoundingKey, SoundingNote>,
    tick_interval: Duration,
    lookahead: Duration,
    jitter: JitterStats,
    output_failures: u64,
    reports: Vec<SchedulerReport>,
}

impl Sequencer {
    /// Create a stopped sequencer with the given settings.
    pub fn new(settings: &SchedulerSettings, output: Box<dyn NoteOutput>) -> Result<Self> {
        Ok(Self {
            transport: TransportClock::with_bpm(settings.initial_bpm)?,
            scheduler: EventScheduler::with_capacity_limit(settings.max_sequences),
            output,
            sounding: BTreeMap::new(),
            tick_interval: settings.tick,
            lookahead: settings.lookahead,
            jitter: JitterStats::default(),
            output_failures: 0,
            reports: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    /// Register a sequence so that its first iteration starts at the
    /// current beat.
    ///
    /// A sequence without notes is accepted and finishes immediately.
    pub fn add_sequence(&mut self, sequence: Sequence, now: Instant) -> Result<SequenceId> {
        let id = sequence.id();
        if sequence.is_empty() {
            log::info!("[SEQUENCE] {} has no notes, finished immediately", sequence.label());
            self.reports.push(SchedulerReport::SequenceFinished { id });
            return Ok(id);
        }

        let start_beat = self.transport.beat_at(now);
        let label = sequence.label();
        let note_count = sequence.notes().len();
        let looping = sequence.looping();
        self.scheduler.insert(sequence, start_beat)?;
        log::info!(
            "[SEQUENCE] Added {} ({} notes, looping={}) at beat {:.3}",
            label,
            note_count,
            looping,
            start_beat
        );
        Ok(id)
    }

    /// Stop a sequence: drop its pending events and silence its sounding notes.
    pub fn stop_sequence(&mut self, id: SequenceId) -> Result<()> {
        let removed = self.scheduler.remove(id).ok_or(Error::NotFound(id))?;
        let silenced = self.silence(|key| key.sequence == id);
        log::info!(
            "[SEQUENCE] Stopped {} ({} notes silenced)",
            removed.sequence().label(),
            silenced
        );
        self.reports.push(SchedulerReport::SequenceFinished { id });
        Ok(())
    }

    /// Stop every active sequence. Returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for id in self.scheduler.ids() {
            // A sequence may finish between listing and stopping
            match self.stop_sequence(id) {
                Ok(()) => stopped += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => log::warn!("[SEQUENCE] Failed to stop {}: {}", id, e),
            }
        }
        if stopped > 0 {
            log::info!("[SEQUENCE] Stopped all ({} sequences)", stopped);
        }
        stopped
    }

    /// Send note-off for every pitch on every channel and forget all
    /// sounding notes.
    pub fn all_notes_off(&mut self) {
        self.sounding.clear();
        let mut failed = false;
        for channel in 0..=MAX_CHANNEL {
            for pitch in 0..=MAX_DATA_BYTE {
                if let Err(e) = self.output.send_note_off(channel, pitch) {
                    // One report per sweep, but every failure is counted
                    if failed {
                        self.output_failures += 1;
                    } else {
                        failed = true;
                        self.record_output_failure(None, e);
                    }
                }
            }
        }
        log::info!("[DISPATCH] All notes off");
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Change the tempo at `now`.
    ///
    /// Pending events are keyed by beat, so events not yet fired move to
    /// the new tempo while those already fired are unaffected.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<()> {
        let old = self.transport.bpm();
        self.transport.set_bpm(bpm, now)?;
        log::info!("[TRANSPORT] Tempo {:.2} -> {:.2} BPM", old, bpm);
        Ok(())
    }

    /// Start the transport. Returns false if it was already running.
    pub fn start(&mut self, now: Instant) -> bool {
        let started = self.transport.start(now);
        if started {
            log::info!(
                "[TRANSPORT] Started at beat {:.3} ({:.2} BPM)",
                self.transport.beat_at(now),
                self.transport.bpm()
            );
        }
        started
    }

    /// Stop the transport and silence sounding notes.
    ///
    /// Queued note-ons stay queued and fire once the transport is started
    /// again. The natural note-offs of silenced notes are suppressed.
    pub fn stop(&mut self, now: Instant) -> bool {
        let stopped = self.transport.stop(now);
        if stopped {
            let silenced = self.silence(|_| true);
            log::info!(
                "[TRANSPORT] Stopped at beat {:.3} ({} notes silenced)",
                self.transport.beat_at(now),
                silenced
            );
        }
        stopped
    }

    /// Stop, silence and rewind to beat 0. Sequences stay registered and
    /// start over from their first note.
    pub fn reset_transport(&mut self, now: Instant) {
        self.stop(now);
        self.transport.reset(now);
        self.scheduler.rewind_all(0.0);
        log::info!("[TRANSPORT] Reset to beat 0");
    }

    // ------------------------------------------------------------------
    // Scheduling pass
    // ------------------------------------------------------------------

    /// Run one scheduling pass at `now` and return how long the caller
    /// may wait before the next one.
    pub fn tick(&mut self, now: Instant) -> Duration {
        if !self.transport.is_running() {
            return self.tick_interval;
        }

        let current_beat = self.transport.beat_at(now);
        let window_end = current_beat + self.transport.lookahead_beats(self.lookahead);
        self.scheduler.collect_due_events(window_end);

        while let Some(event) = self.scheduler.pop_due(current_beat) {
            let id = event.key.sequence;
            self.dispatch(event, now);
            if let Some(finished) = self.scheduler.complete_if_finished(id) {
                log::info!("[SEQUENCE] {} finished", finished.sequence().label());
                self.reports.push(SchedulerReport::SequenceFinished { id });
            }
        }

        self.next_wait(now)
    }

    /// Time until the next pending event, capped at the tick interval.
    pub fn next_wait(&self, now: Instant) -> Duration {
        let next_due = self
            .scheduler
            .next_due_beat()
            .and_then(|beat| self.transport.beat_to_wallclock(beat).ok());
        match next_due {
            Some(due) => due.saturating_duration_since(now).min(self.tick_interval),
            None => self.tick_interval,
        }
    }

    fn dispatch(&mut self, event: PendingEvent, now: Instant) {
        let key = event.key;

        if let Ok(due) = self.transport.beat_to_wallclock(event.beat()) {
            let lateness = now.saturating_duration_since(due);
            self.jitter.record(lateness);
            log::log!(
                JitterStats::severity(lateness),
                "[DISPATCH] {:?} {} at beat {:.4} late by {:?}",
                key.kind,
                key.sequence,
                event.beat(),
                lateness
            );
        }

        let sounding_key = SoundingKey {
            sequence: key.sequence,
            iteration: key.iteration,
            slot: key.slot,
        };

        match (key.kind, event.note) {
            (EventKind::NoteOn, Some(note)) => {
                self.sounding.insert(
                    sounding_key,
                    SoundingNote {
                        channel: note.channel(),
                        pitch: note.pitch(),
                    },
                );
                log::debug!(
                    "[DISPATCH] note_on {} ch={} vel={} ({})",
                    note_name(note.pitch()),
                    note.channel(),
                    note.velocity(),
                    key.sequence
                );
                if let Err(e) = self
                    .output
                    .send_note_on(note.channel(), note.pitch(), note.velocity())
                {
                    self.record_output_failure(Some(key.sequence), e);
                }
            }
            (EventKind::NoteOff, Some(note)) => {
                if self.sounding.remove(&sounding_key).is_none() {
                    log::trace!(
                        "[DISPATCH] Skipping note_off {} ({}): already silenced",
                        note_name(note.pitch()),
                        key.sequence
                    );
                    return;
                }
                log::debug!(
                    "[DISPATCH] note_off {} ch={} ({})",
                    note_name(note.pitch()),
                    note.channel(),
                    key.sequence
                );
                if let Err(e) = self.output.send_note_off(note.channel(), note.pitch()) {
                    self.record_output_failure(Some(key.sequence), e);
                }
            }
            (EventKind::Restart, _) => {
                log::debug!(
                    "[SEQUENCE] {} iteration {} started",
                    key.sequence,
                    key.iteration
                );
                self.reports.push(SchedulerReport::IterationStarted {
                    id: key.sequence,
                    iteration: key.iteration,
                });
            }
            (kind, None) => {
                log::warn!("[DISPATCH] {:?} event without a note for {}", kind, key.sequence);
            }
        }
    }

    /// Send note-off for every sounding note matching `filter`.
    fn silence<F>(&mut self, filter: F) -> usize
    where
        F: Fn(&SoundingKey) -> bool,
    {
        let keys: Vec<SoundingKey> = self.sounding.keys().copied().filter(|k| filter(k)).collect();
        for key in &keys {
            if let Some(note) = self.sounding.remove(key) {
                if let Err(e) = self.output.send_note_off(note.channel, note.pitch) {
                    self.record_output_failure(Some(key.sequence), e);
                }
            }
        }
        keys.len()
    }

    fn record_output_failure(&mut self, id: Option<SequenceId>, error: OutputError) {
        self.output_failures += 1;
        log::warn!("[DISPATCH] Output '{}' failed: {}", self.output.port_name(), error);
        self.reports.push(SchedulerReport::OutputFailed {
            id,
            error: error.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Active sequences in ascending id order.
    pub fn active_sequences(&self) -> Vec<SequenceInfo> {
        self.scheduler.snapshots()
    }

    pub fn is_active(&self, id: SequenceId) -> bool {
        self.scheduler.contains(id)
    }

    pub fn current_tempo(&self) -> f64 {
        self.transport.bpm()
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    pub fn current_beat(&self, now: Instant) -> f64 {
        self.transport.beat_at(now)
    }

    pub fn transport(&self) -> &TransportClock {
        &self.transport
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.clone()
    }

    /// Number of notes currently sounding.
    pub fn sounding_count(&self) -> usize {
        self.sounding.len()
    }

    pub fn output_failures(&self) -> u64 {
        self.output_failures
    }

    pub fn output_name(&self) -> &str {
        self.output.port_name()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Take the reports produced since the last call.
    pub fn drain_reports(&mut self) -> Vec<SchedulerReport> {
        std::mem::take(&mut self.reports)
    }
}
