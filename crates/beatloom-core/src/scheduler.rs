//! Beat-based event scheduler.
//!
//! The scheduler owns the registry of active sequences and a queue of
//! pending events keyed by beat. Each pass of the scheduling loop asks it
//! to enqueue everything due within the lookahead window, then takes the
//! events whose beat has been reached.
//!
//! Every sequence keeps its own watermark: a cursor into its per-iteration
//! timeline plus the iteration the cursor belongs to. Events behind the
//! watermark are never enqueued again, so each note of each iteration is
//! dispatched at most once regardless of how often the window is scanned.

use crate::error::{Error, Result};
use crate::note::Note;
use crate::sequence::{Sequence, SequenceId};
use crate::timing::BeatTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on events enqueued for one sequence in a single pass.
const MAX_EVENTS_PER_PASS: usize = 4096;

/// Slack when comparing a pending beat against the current beat.
const BEAT_EPSILON: f64 = 1e-9;

/// Kind of a scheduled event.
///
/// The declaration order is the tie-break for events on the same beat:
/// note-offs go out before loop restarts, and both before note-ons, so a
/// note ending exactly where another begins is released first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    NoteOff,
    Restart,
    NoteOn,
}

/// Ordering key of a pending event.
///
/// Field order matters: the derived `Ord` sorts by beat, then kind, then
/// sequence id, then iteration and note slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub beat: BeatTime,
    pub kind: EventKind,
    pub sequence: SequenceId,
    pub iteration: u64,
    pub slot: usize,
}

/// An event waiting in the pending queue.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    pub key: PendingKey,
    /// The note for note-on/note-off events, `None` for restarts.
    pub note: Option<Note>,
}

impl PendingEvent {
    /// Absolute beat at which the event is due.
    pub fn beat(&self) -> f64 {
        self.key.beat.to_float()
    }
}

/// One entry of a sequence's per-iteration timeline.
#[derive(Clone, Copy, Debug)]
struct TimelineEvent {
    offset: f64,
    kind: EventKind,
    slot: usize,
}

fn build_timeline(sequence: &Sequence) -> Arc<[TimelineEvent]> {
    let mut events: Vec<TimelineEvent> = Vec::with_capacity(sequence.notes().len() * 2 + 1);
    for (slot, note) in sequence.notes().iter().enumerate() {
        events.push(TimelineEvent {
            offset: note.start_offset(),
            kind: EventKind::NoteOn,
            slot,
        });
        events.push(TimelineEvent {
            offset: note.end_offset(),
            kind: EventKind::NoteOff,
            slot,
        });
    }
    if sequence.looping() {
        events.push(TimelineEvent {
            offset: sequence.length_beats(),
            kind: EventKind::Restart,
            slot: 0,
        });
    }
    let sort_key = |event: &TimelineEvent| {
        let beat = match event.kind {
            EventKind::NoteOff => note_off_beat(
                BeatTime::from_float(sequence.notes()[event.slot].start_offset()),
                event.offset,
            ),
            _ => BeatTime::from_float(event.offset),
        };
        (beat, event.kind, event.slot)
    };
    events.sort_by_key(sort_key);
    events.into()
}

/// Quantized note-off beat, kept strictly after its note-on.
///
/// Durations shorter than the beat resolution would otherwise round onto
/// the note-on, and the note-off would sort first and leave the note on.
fn note_off_beat(note_on: BeatTime, end: f64) -> BeatTime {
    BeatTime::from_float(end).max(note_on + BeatTime::RESOLUTION)
}

/// Public view of an active sequence.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SequenceInfo {
    pub id: SequenceId,
    pub name: Option<String>,
    pub note_count: usize,
    pub looping: bool,
    /// Number of completed restarts: 0 during the first pass.
    pub iteration_count: u64,
    pub length_beats: f64,
}

/// Scheduling state of one registered sequence.
#[derive(Clone, Debug)]
pub struct ScheduledSequence {
    sequence: Sequence,
    timeline: Arc<[TimelineEvent]>,
    /// Absolute beat at which iteration 0 starts.
    start_beat: f64,
    /// Restarts dispatched so far.
    iteration_count: u64,
    /// Iteration the watermark is in.
    cursor_iteration: u64,
    /// Next timeline index to enqueue.
    cursor: usize,
    /// A non-looping sequence whose every event has been enqueued.
    fully_scheduled: bool,
    /// Enqueued events not yet taken.
    in_flight: usize,
}

impl ScheduledSequence {
    fn new(sequence: Sequence, start_beat: f64) -> Self {
        let timeline = build_timeline(&sequence);
        Self {
            sequence,
            timeline,
            start_beat,
            iteration_count: 0,
            cursor_iteration: 0,
            cursor: 0,
            fully_scheduled: false,
            in_flight: 0,
        }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn start_beat(&self) -> f64 {
        self.start_beat
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    fn is_finished(&self) -> bool {
        !self.sequence.looping() && self.fully_scheduled && self.in_flight == 0
    }

    fn rewind(&mut self, start_beat: f64) {
        self.start_beat = start_beat;
        self.iteration_count = 0;
        self.cursor_iteration = 0;
        self.cursor = 0;
        self.fully_scheduled = false;
        self.in_flight = 0;
    }

    fn info(&self) -> SequenceInfo {
        SequenceInfo {
            id: self.sequence.id(),
            name: self.sequence.name().map(str::to_string),
            note_count: self.sequence.notes().len(),
            looping: self.sequence.looping(),
            iteration_count: self.iteration_count,
            length_beats: self.sequence.length_beats(),
        }
    }
}

/// Registry of active sequences plus the pending event queue.
#[derive(Debug, Default)]
pub struct EventScheduler {
    sequences: BTreeMap<SequenceId, ScheduledSequence>,
    pending: BTreeMap<PendingKey, PendingEvent>,
    max_sequences: Option<usize>,
}

impl EventScheduler {
    /// Create an empty scheduler without a sequence limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty scheduler holding at most `max_sequences` sequences.
    pub fn with_capacity_limit(max_sequences: Option<usize>) -> Self {
        Self {
            max_sequences,
            ..Self::default()
        }
    }

    /// Register a sequence whose first iteration starts at `start_beat`.
    pub fn insert(&mut self, sequence: Sequence, start_beat: f64) -> Result<SequenceId> {
        if let Some(limit) = self.max_sequences {
            if self.sequences.len() >= limit {
                return Err(Error::CapacityExceeded { limit });
            }
        }
        let id = sequence.id();
        self.sequences
            .insert(id, ScheduledSequence::new(sequence, start_beat));
        Ok(id)
    }

    /// Unregister a sequence and drop every pending event it owns.
    pub fn remove(&mut self, id: SequenceId) -> Option<ScheduledSequence> {
        let removed = self.sequences.remove(&id)?;
        self.pending.retain(|key, _| key.sequence != id);
        Some(removed)
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        self.sequences.contains_key(&id)
    }

    pub fn get(&self, id: SequenceId) -> Option<&ScheduledSequence> {
        self.sequences.get(&id)
    }

    /// Ids of all registered sequences in ascending order.
    pub fn ids(&self) -> Vec<SequenceId> {
        self.sequences.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshots of all registered sequences, ascending by id.
    pub fn snapshots(&self) -> Vec<SequenceInfo> {
        self.sequences.values().map(ScheduledSequence::info).collect()
    }

    /// Drop all pending events and restart every sequence at `beat`.
    pub fn rewind_all(&mut self, beat: f64) {
        self.pending.clear();
        for entry in self.sequences.values_mut() {
            entry.rewind(beat);
        }
    }

    /// Enqueue every not-yet-enqueued event whose beat is before `window_end`.
    ///
    /// Returns the number of events added to the pending queue.
    pub fn collect_due_events(&mut self, window_end: f64) -> usize {
        let mut added = 0;

        for (id, entry) in self.sequences.iter_mut() {
            let length = entry.sequence.length_beats();
            let mut enqueued = 0;

            while !entry.fully_scheduled {
                if entry.cursor == entry.timeline.len() {
                    if entry.sequence.looping() && length > 0.0 {
                        entry.cursor_iteration += 1;
                        entry.cursor = 0;
                        continue;
                    }
                    entry.fully_scheduled = true;
                    log::trace!("[SCHEDULER] {} fully scheduled", entry.sequence.label());
                    break;
                }

                if enqueued >= MAX_EVENTS_PER_PASS {
                    log::warn!(
                        "[SCHEDULER] {} hit the per-pass event limit ({})",
                        entry.sequence.label(),
                        MAX_EVENTS_PER_PASS
                    );
                    break;
                }

                let event = entry.timeline[entry.cursor];
                let beat = entry.start_beat + entry.cursor_iteration as f64 * length + event.offset;
                if beat >= window_end {
                    break;
                }

                let (iteration, note) = match event.kind {
                    // The restart at the end of iteration k begins iteration k+1
                    EventKind::Restart => (entry.cursor_iteration + 1, None),
                    _ => (
                        entry.cursor_iteration,
                        entry.sequence.notes().get(event.slot).copied(),
                    ),
                };
                let key_beat = match (event.kind, note) {
                    (EventKind::NoteOff, Some(note)) => {
                        let note_on = entry.start_beat
                            + entry.cursor_iteration as f64 * length
                            + note.start_offset();
                        note_off_beat(BeatTime::from_float(note_on), beat)
                    }
                    _ => BeatTime::from_float(beat),
                };
                let key = PendingKey {
                    beat: key_beat,
                    kind: event.kind,
                    sequence: *id,
                    iteration,
                    slot: event.slot,
                };
                if self.pending.insert(key, PendingEvent { key, note }).is_none() {
                    entry.in_flight += 1;
                    enqueued += 1;
                }
                entry.cursor += 1;
            }

            added += enqueued;
        }

        if added > 0 {
            log::trace!(
                "[SCHEDULER] Enqueued {} events up to beat {:.4} ({} pending)",
                added,
                window_end,
                self.pending.len()
            );
        }
        added
    }

    /// Beat of the earliest pending event.
    pub fn next_due_beat(&self) -> Option<f64> {
        self.pending.keys().next().map(|key| key.beat.to_float())
    }

    /// Take the earliest pending event if it is due at `current_beat`.
    ///
    /// A restart taken here advances the owning sequence's iteration count.
    pub fn pop_due(&mut self, current_beat: f64) -> Option<PendingEvent> {
        let key = *self.pending.keys().next()?;
        if key.beat.to_float() > current_beat + BEAT_EPSILON {
            return None;
        }
        let event = self.pending.remove(&key)?;
        if let Some(entry) = self.sequences.get_mut(&key.sequence) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if key.kind == EventKind::Restart {
                entry.iteration_count = key.iteration;
            }
        }
        Some(event)
    }

    /// Remove a non-looping sequence once everything it scheduled has been taken.
    pub fn complete_if_finished(&mut self, id: SequenceId) -> Option<ScheduledSequence> {
        if self.sequences.get(&id)?.is_finished() {
            self.sequences.remove(&id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, start: f64, duration: f64) -> Note {
        Note::new(pitch, 100, 0, start, duration).unwrap()
    }

    fn drain(scheduler: &mut EventScheduler, beat: f64) -> Vec<PendingEvent> {
        let mut events = Vec::new();
        while let Some(event) = scheduler.pop_due(beat) {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_window_is_respected() {
        let mut scheduler = EventScheduler::new();
        let seq = Sequence::new(vec![note(60, 0.0, 1.0), note(64, 1.0, 1.0)], false);
        scheduler.insert(seq, 0.0).unwrap();

        assert_eq!(scheduler.collect_due_events(0.5), 1);
        assert_eq!(scheduler.next_due_beat(), Some(0.0));
        // Scanning the same window again adds nothing
        assert_eq!(scheduler.collect_due_events(0.5), 0);
        assert_eq!(scheduler.collect_due_events(1.5), 2);
    }

    #[test]
    fn test_same_beat_order() {
        let mut scheduler = EventScheduler::new();
        let seq = Sequence::new(vec![note(60, 0.0, 1.0), note(64, 1.0, 1.0)], false);
        let id = scheduler.insert(seq, 0.0).unwrap();
        scheduler.collect_due_events(1.5);

        let first = drain(&mut scheduler, 0.0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key.kind, EventKind::NoteOn);

        let at_one = drain(&mut scheduler, 1.0);
        let kinds: Vec<(EventKind, u8)> = at_one
            .iter()
            .map(|e| (e.key.kind, e.note.unwrap().pitch()))
            .collect();
        assert_eq!(kinds, vec![(EventKind::NoteOff, 60), (EventKind::NoteOn, 64)]);
        assert!(scheduler.complete_if_finished(id).is_none());
    }

    #[test]
    fn test_note_off_stays_after_note_on() {
        let mut scheduler = EventScheduler::new();
        let seq = Sequence::new(vec![note(60, 0.5, 1e-6), note(62, 1.0, 1.0)], true);
        scheduler.insert(seq, 0.25).unwrap();
        scheduler.collect_due_events(3.0);

        let events = drain(&mut scheduler, 3.0);
        for (i, event) in events.iter().enumerate() {
            if event.key.kind != EventKind::NoteOff {
                continue;
            }
            let on = events[..i].iter().position(|e| {
                e.key.kind == EventKind::NoteOn
                    && e.key.slot == event.key.slot
                    && e.key.iteration == event.key.iteration
            });
            let on = on.expect("note-off without an earlier note-on");
            assert!(events[on].key.beat < event.key.beat);
        }
        let tiny_offs = events
            .iter()
            .filter(|e| e.key.kind == EventKind::NoteOff && e.key.slot == 0)
            .count();
        assert!(tiny_offs >= 2);
    }

    #[test]
    fn test_non_looping_finishes() {
        let mut scheduler = EventScheduler::new();
        let seq = Sequence::new(vec![note(60, 0.0, 1.0)], false);
        let id = scheduler.insert(seq, 0.0).unwrap();

        scheduler.collect_due_events(2.0);
        assert!(scheduler.complete_if_finished(id).is_none());
        assert_eq!(drain(&mut scheduler, 2.0).len(), 2);
        assert!(scheduler.complete_if_finished(id).is_some());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_loop_restart_advances_iteration() {
        let mut scheduler = EventScheduler::new();
        let seq = Sequence::new(vec![note(60, 0.0, 1.0), note(62, 1.0, 1.0)], true);
        let id = scheduler.insert(seq, 0.0).unwrap();

        scheduler.collect_due_events(4.5);
        let events = drain(&mut scheduler, 4.0);
        let restarts: Vec<u64> = events
            .iter()
            .filter(|e| e.key.kind == EventKind::Restart)
            .map(|e| e.key.iteration)
            .collect();
        assert_eq!(restarts, vec![1, 2]);
        assert_eq!(scheduler.get(id).unwrap().iteration_count(), 2);

        // Restart at beat 2 sorts after the note-off and before the note-on
        let at_two: Vec<EventKind> = events
            .iter()
            .filter(|e| (e.beat() - 2.0).abs() < 1e-9)
            .map(|e| e.key.kind)
            .collect();
        assert_eq!(at_two, vec![EventKind::NoteOff, EventKind::Restart, EventKind::NoteOn]);
        assert!(scheduler.complete_if_finished(id).is_none());
    }

    #[test]
    fn test_remove_purges_pending() {
        let mut scheduler = EventScheduler::new();
        let a = scheduler
            .insert(Sequence::new(vec![note(60, 0.0, 1.0)], true), 0.0)
            .unwrap();
        let b = scheduler
            .insert(Sequence::new(vec![note(72, 0.0, 1.0)], false), 0.0)
            .unwrap();
        scheduler.collect_due_events(3.0);

        assert!(scheduler.remove(a).is_some());
        assert!(scheduler.remove(a).is_none());
        let remaining = drain(&mut scheduler, 3.0);
        assert!(remaining.iter().all(|e| e.key.sequence == b));
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_capacity_limit() {
        let mut scheduler = EventScheduler::with_capacity_limit(Some(1));
        scheduler
            .insert(Sequence::new(vec![note(60, 0.0, 1.0)], false), 0.0)
            .unwrap();
        let err = scheduler
            .insert(Sequence::new(vec![note(62, 0.0, 1.0)], false), 0.0)
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 1 }));
    }

    #[test]
    fn test_rewind_all() {
        let mut scheduler = EventScheduler::new();
        let id = scheduler
            .insert(Sequence::new(vec![note(60, 0.0, 1.0)], true), 0.0)
            .unwrap();
        scheduler.collect_due_events(5.0);
        drain(&mut scheduler, 5.0);
        assert!(scheduler.get(id).unwrap().iteration_count() > 0);

        scheduler.rewind_all(0.0);
        assert_eq!(scheduler.pending_len(), 0);
        assert_eq!(scheduler.get(id).unwrap().iteration_count(), 0);
        scheduler.collect_due_events(0.5);
        assert_eq!(scheduler.next_due_beat(), Some(0.0));
    }

    #[test]
    fn test_snapshots_sorted_by_id() {
        let mut scheduler = EventScheduler::new();
        let first = Sequence::builder().name("bass").note(note(40, 0.0, 1.0)).build();
        let second = Sequence::new(vec![note(60, 0.0, 1.0), note(64, 0.0, 1.0)], true);
        let (a, b) = (first.id(), second.id());
        scheduler.insert(second, 0.0).unwrap();
        scheduler.insert(first, 0.0).unwrap();

        let infos = scheduler.snapshots();
        assert_eq!(infos.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(infos[0].name.as_deref(), Some("bass"));
        assert_eq!(infos[1].note_count, 2);
        assert!(infos[1].looping);
    }
}
