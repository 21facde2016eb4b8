//! Runtime thread for beatloom.
//!
//! The runtime thread is the heart of playback. It:
//! - Runs a scheduling pass of the shared sequencer every tick
//! - Sleeps until the next tick or the next due event, whichever is sooner
//! - Forwards sequencer reports to the handle's report channel

use crate::config::{Config, NoteDefaults};
use crate::error::{Error, Result};
use crate::note::note_name;
use crate::output::NoteOutput;
use crate::scheduler::SequenceInfo;
use crate::sequence::{Sequence, SequenceId};
use crate::sequencer::{SchedulerReport, Sequencer};
use crate::state::{build_sequence, Command, CommandOutcome, NoteSpec, StateManager};
use crate::timing::JitterStats;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reports kept for consumers before new ones are dropped.
const REPORT_CAPACITY: usize = 1024;

/// Below this remaining wait the thread spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Handle to the running beatloom runtime.
///
/// This is the command surface of the scheduling core. It is cheap to
/// clone and can be used from any thread.
#[derive(Clone)]
pub struct RuntimeHandle {
    /// Shared sequencer.
    state: StateManager,
    /// Values for fields a command leaves out.
    defaults: NoteDefaults,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
    /// Wakes the runtime thread after a mutation.
    wake_tx: Sender<()>,
    /// Reports published by the runtime thread.
    report_rx: Receiver<SchedulerReport>,
}

impl RuntimeHandle {
    /// Get the state manager.
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Run a mutation against the sequencer and wake the runtime thread.
    fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Sequencer, Instant) -> Result<R>,
    {
        if self.is_shutdown_requested() {
            return Err(Error::Shutdown);
        }
        let result = self.state.with_sequencer(|s| f(s, Instant::now()));
        // A full channel already holds a pending wake-up
        let _ = self.wake_tx.try_send(());
        result
    }

    // === Playback ===

    /// Play a single note now. Omitted fields use the configured defaults.
    pub fn play_note(
        &self,
        pitch: u8,
        velocity: Option<u8>,
        channel: Option<u8>,
        duration: Option<f64>,
    ) -> Result<SequenceId> {
        let spec = NoteSpec {
            pitch,
            velocity,
            channel,
            duration,
            start: Some(0.0),
        };
        let sequence = build_sequence(&[spec], false, None, None, &self.defaults)?;
        self.add_sequence(sequence)
    }

    /// Play a list of notes; notes without a start follow the previous one.
    pub fn play_sequence(&self, notes: &[NoteSpec], looping: bool) -> Result<SequenceId> {
        let sequence = build_sequence(notes, looping, None, None, &self.defaults)?;
        self.add_sequence(sequence)
    }

    /// Register a prepared sequence, starting at the current beat.
    pub fn add_sequence(&self, sequence: Sequence) -> Result<SequenceId> {
        self.mutate(|s, now| s.add_sequence(sequence, now))
    }

    /// Stop a sequence and silence its sounding notes.
    pub fn stop_sequence(&self, id: SequenceId) -> Result<()> {
        self.mutate(|s, _| s.stop_sequence(id))
    }

    /// Stop every active sequence. Returns how many were stopped.
    pub fn stop_all(&self) -> Result<usize> {
        self.mutate(|s, _| Ok(s.stop_all()))
    }

    /// Send note-off on every pitch and channel.
    pub fn all_notes_off(&self) -> Result<()> {
        self.mutate(|s, _| {
            s.all_notes_off();
            Ok(())
        })
    }

    // === Transport ===

    /// Change the tempo; events not yet fired follow the new tempo.
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        self.mutate(|s, now| s.set_tempo(bpm, now))
    }

    /// Start the transport. Returns false if it was already running.
    pub fn start_transport(&self) -> Result<bool> {
        self.mutate(|s, now| Ok(s.start(now)))
    }

    /// Stop the transport. Returns false if it was already stopped.
    pub fn stop_transport(&self) -> Result<bool> {
        self.mutate(|s, now| Ok(s.stop(now)))
    }

    /// Stop, silence and rewind the transport to beat 0.
    pub fn reset_transport(&self) -> Result<()> {
        self.mutate(|s, now| {
            s.reset_transport(now);
            Ok(())
        })
    }

    // === Queries ===

    /// Active sequences in ascending id order.
    pub fn active_sequences(&self) -> Vec<SequenceInfo> {
        self.state.with_sequencer(|s| s.active_sequences())
    }

    pub fn is_active(&self, id: SequenceId) -> bool {
        self.state.with_sequencer(|s| s.is_active(id))
    }

    pub fn current_tempo(&self) -> f64 {
        self.state.tempo()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_transport_running()
    }

    pub fn current_beat(&self) -> f64 {
        self.state.with_sequencer(|s| s.current_beat(Instant::now()))
    }

    /// Lateness of dispatched events so far.
    pub fn jitter_stats(&self) -> JitterStats {
        self.state.with_sequencer(|s| s.jitter_stats())
    }

    pub fn sounding_count(&self) -> usize {
        self.state.with_sequencer(|s| s.sounding_count())
    }

    // === Reports ===

    /// Receive a report without blocking.
    pub fn try_recv_report(&self) -> Option<SchedulerReport> {
        self.report_rx.try_recv().ok()
    }

    /// Wait until a sequence is no longer active.
    ///
    /// Returns true once it finished or was stopped, false on timeout.
    /// Polls the registry, so reports stay queued for [`try_recv_report`](Self::try_recv_report).
    pub fn wait_for_sequence(&self, id: SequenceId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = Duration::from_millis(10);

        loop {
            if !self.is_active(id) {
                return true;
            }

            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d - now).min(poll)
                }
                None => poll,
            };

            thread::sleep(wait);
        }
    }

    // === Commands ===

    /// Execute a command and describe the result.
    ///
    /// Failures are reported in the outcome, never as an error.
    pub fn execute(&self, command: Command) -> CommandOutcome {
        let name = command.name();
        match self.execute_command(command) {
            Ok(outcome) => {
                log::debug!("[COMMAND] {}: {}", name, outcome.message);
                outcome
            }
            Err(e) => {
                log::warn!("[COMMAND] {} failed: {}", name, e);
                CommandOutcome::failure(e.to_string())
            }
        }
    }

    fn execute_command(&self, command: Command) -> Result<CommandOutcome> {
        let outcome = match command {
            Command::PlayNote {
                pitch,
                velocity,
                channel,
                duration,
            } => {
                let beats = duration.unwrap_or(self.defaults.duration);
                let id = self.play_note(pitch, velocity, channel, duration)?;
                CommandOutcome::ok(format!("Playing {} for {} beats", note_name(pitch), beats))
                    .with_data(json!({ "sequence_id": id }))
            }
            Command::PlaySequence {
                notes,
                looping,
                name,
                loop_length,
            } => {
                let sequence = build_sequence(
                    &notes,
                    looping,
                    name.as_deref(),
                    loop_length,
                    &self.defaults,
                )?;
                let length = sequence.length_beats();
                let id = self.add_sequence(sequence)?;
                let mode = if looping { "looping" } else { "once" };
                CommandOutcome::ok(format!(
                    "Started sequence {} ({} notes, {} beats, {})",
                    id,
                    notes.len(),
                    length,
                    mode
                ))
                .with_data(json!({ "sequence_id": id }))
            }
            Command::StopSequence { sequence_id } => {
                self.stop_sequence(sequence_id)?;
                CommandOutcome::ok(format!("Stopped sequence {}", sequence_id))
            }
            Command::StopAll => {
                let stopped = self.stop_all()?;
                CommandOutcome::ok(format!("Stopped {} sequences", stopped))
                    .with_data(json!({ "stopped": stopped }))
            }
            Command::SetTempo { bpm } => {
                self.set_tempo(bpm)?;
                CommandOutcome::ok(format!("Tempo set to {} BPM", bpm)).with_data(json!({ "bpm": bpm }))
            }
            Command::StartTransport => {
                if self.start_transport()? {
                    CommandOutcome::ok("Transport started")
                } else {
                    CommandOutcome::ok("Transport already running")
                }
            }
            Command::StopTransport => {
                if self.stop_transport()? {
                    CommandOutcome::ok("Transport stopped")
                } else {
                    CommandOutcome::ok("Transport already stopped")
                }
            }
            Command::ResetTransport => {
                self.reset_transport()?;
                CommandOutcome::ok("Transport reset to beat 0")
            }
            Command::AllNotesOff => {
                self.all_notes_off()?;
                CommandOutcome::ok("All notes off")
            }
            Command::Status => {
                let (bpm, running, beat, sequences, jitter) = self.state.with_sequencer(|s| {
                    (
                        s.current_tempo(),
                        s.is_running(),
                        s.current_beat(Instant::now()),
                        s.active_sequences(),
                        s.jitter_stats(),
                    )
                });
                CommandOutcome::ok(format!(
                    "{} active sequences at {} BPM ({})",
                    sequences.len(),
                    bpm,
                    if running { "running" } else { "stopped" }
                ))
                .with_data(json!({
                    "bpm": bpm,
                    "running": running,
                    "beat": beat,
                    "sequences": sequences,
                    "jitter": jitter,
                }))
            }
        };
        Ok(outcome)
    }

    // === Lifecycle ===

    /// Signal the runtime to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// The beatloom runtime: a scheduling thread plus its handle.
pub struct Runtime {
    handle: RuntimeHandle,
    thread_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Start the runtime with the given configuration and output.
    ///
    /// The transport is started right away at the configured tempo.
    pub fn start(config: &Config, output: Box<dyn NoteOutput>) -> Result<Self> {
        config.validate()?;

        log::info!(
            "[SCHEDULER] Starting runtime (tick {:?}, lookahead {:?}, output '{}')",
            config.scheduler.tick,
            config.scheduler.lookahead,
            output.port_name()
        );

        let mut sequencer = Sequencer::new(&config.scheduler, output)?;
        sequencer.start(Instant::now());
        let tick_interval = sequencer.tick_interval();

        let state = StateManager::new(sequencer);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded(1);
        let (report_tx, report_rx) = bounded(REPORT_CAPACITY);

        let handle = RuntimeHandle {
            state: state.clone(),
            defaults: config.defaults.clone(),
            shutdown: shutdown.clone(),
            wake_tx,
            report_rx,
        };

        let rt = RuntimeThread {
            state,
            wake_rx,
            report_tx,
            tick_interval,
        };
        let thread_handle = thread::Builder::new()
            .name("beatloom-scheduler".to_string())
            .spawn(move || rt.run(shutdown))?;

        Ok(Self {
            handle,
            thread_handle: Some(thread_handle),
        })
    }

    /// Get a handle to interact with the runtime.
    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Shut down the runtime gracefully.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.handle.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("[SCHEDULER] Runtime thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// The thread that drives the sequencer.
struct RuntimeThread {
    state: StateManager,
    wake_rx: Receiver<()>,
    report_tx: Sender<SchedulerReport>,
    tick_interval: Duration,
}

impl RuntimeThread {
    fn run(&self, shutdown: Arc<AtomicBool>) {
        log::debug!("[SCHEDULER] Runtime thread started");

        while !shutdown.load(Ordering::Relaxed) {
            // Publish under the lock so reports land before the registry change is visible
            let wait = self.state.with_sequencer(|s| {
                let wait = s.tick(Instant::now());
                self.publish(s.drain_reports());
                wait
            });

            if !self.wait(wait) {
                break;
            }
        }

        // Leave nothing hanging on the output
        self.state.with_sequencer(|s| {
            s.stop(Instant::now());
            self.publish(s.drain_reports());
        });
        log::debug!("[SCHEDULER] Runtime thread stopped");
    }

    /// Wait up to `wait`, returning early when woken. Returns false once
    /// every handle is gone.
    fn wait(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;

        if wait > SPIN_THRESHOLD {
            match self.wake_rx.recv_timeout(wait - SPIN_THRESHOLD) {
                Ok(()) => return true,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }

        // Spin the last stretch only when an event is due before the next tick
        if wait < self.tick_interval {
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
        }
        true
    }

    fn publish(&self, reports: Vec<SchedulerReport>) {
        for report in reports {
            match self.report_tx.try_send(report) {
                Ok(()) => {}
                Err(TrySendError::Full(report)) => {
                    log::trace!("[SCHEDULER] Report queue full, dropping {:?}", report);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}
