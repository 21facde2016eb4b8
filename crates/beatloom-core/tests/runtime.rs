//! End-to-end tests of the threaded runtime with real time.
//!
//! Timing assertions use generous tolerances; the exact scheduling
//! arithmetic is covered by the deterministic sequencer tests.

use beatloom_core::{
    Command, Config, Error, MidiMessage, Note, NoteSpec, RecordingOutput, Runtime, SchedulerReport,
    Sequence, SequenceId,
};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_runtime(config: Config) -> (Runtime, RecordingOutput) {
    init_logging();
    let recorder = RecordingOutput::new();
    let runtime = Runtime::start(&config, Box::new(recorder.clone())).unwrap();
    (runtime, recorder)
}

fn note(pitch: u8, start: f64, duration: f64) -> Note {
    Note::new(pitch, 100, 0, start, duration).unwrap()
}

#[test]
fn test_two_note_sequence_plays_in_order() {
    let (runtime, recorder) = start_runtime(Config::default());
    let handle = runtime.handle();

    // 600 BPM: one beat every 100ms
    handle.set_tempo(600.0).unwrap();
    let id = handle
        .add_sequence(Sequence::new(vec![note(60, 0.0, 1.0), note(64, 1.0, 1.0)], false))
        .unwrap();

    assert!(handle.wait_for_sequence(id, Some(Duration::from_secs(2))));
    assert_eq!(
        recorder.messages(),
        vec![
            MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 },
            MidiMessage::NoteOff { channel: 0, note: 60 },
            MidiMessage::NoteOn { channel: 0, note: 64, velocity: 100 },
            MidiMessage::NoteOff { channel: 0, note: 64 },
        ]
    );
    assert!(handle.active_sequences().is_empty());

    let jitter = handle.jitter_stats();
    assert_eq!(jitter.count, 4);
    assert!(jitter.max < Duration::from_millis(20), "max lateness {:?}", jitter.max);

    runtime.shutdown();
}

#[test]
fn test_sequence_duration_follows_tempo() {
    let (runtime, _recorder) = start_runtime(Config::default());
    let handle = runtime.handle();
    handle.set_tempo(240.0).unwrap();

    // Two beats at 240 BPM = 500ms
    let started = Instant::now();
    let id = handle
        .add_sequence(Sequence::new(vec![note(60, 0.0, 2.0)], false))
        .unwrap();
    assert!(handle.wait_for_sequence(id, Some(Duration::from_secs(2))));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(480) && elapsed < Duration::from_millis(700),
        "finished after {:?}",
        elapsed
    );
}

#[test]
fn test_looping_sequence_until_stopped() {
    let (runtime, recorder) = start_runtime(Config::default());
    let handle = runtime.handle();
    handle.set_tempo(600.0).unwrap();

    let id = handle
        .add_sequence(Sequence::new(vec![note(60, 0.0, 0.5)], true))
        .unwrap();
    thread::sleep(Duration::from_millis(350));

    let info = handle.active_sequences();
    assert_eq!(info.len(), 1);
    assert!(info[0].iteration_count >= 2, "iterations {}", info[0].iteration_count);

    handle.stop_sequence(id).unwrap();
    assert_eq!(handle.sounding_count(), 0);
    let count = recorder.messages().len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorder.messages().len(), count);

    // Every note-on got exactly one note-off
    let messages = recorder.messages();
    let ons = messages.iter().filter(|m| m.is_note_on()).count();
    assert_eq!(ons, messages.len() - ons);

    assert!(matches!(handle.stop_sequence(id), Err(Error::NotFound(_))));
}

#[test]
fn test_reports_are_published() {
    let (runtime, _recorder) = start_runtime(Config::default());
    let handle = runtime.handle();
    handle.set_tempo(600.0).unwrap();

    let looping = handle
        .add_sequence(Sequence::new(vec![note(48, 0.0, 1.0)], true))
        .unwrap();
    thread::sleep(Duration::from_millis(250));
    handle.stop_sequence(looping).unwrap();
    thread::sleep(Duration::from_millis(20));

    let mut reports = Vec::new();
    while let Some(report) = handle.try_recv_report() {
        reports.push(report);
    }
    assert!(reports.contains(&SchedulerReport::IterationStarted { id: looping, iteration: 1 }));
    assert!(reports.contains(&SchedulerReport::SequenceFinished { id: looping }));
}

#[test]
fn test_waiting_leaves_reports_queued() {
    let (runtime, _recorder) = start_runtime(Config::default());
    let handle = runtime.handle();
    handle.set_tempo(600.0).unwrap();

    let looping = handle
        .add_sequence(Sequence::new(vec![note(48, 0.0, 0.5)], true))
        .unwrap();
    let once = handle
        .add_sequence(Sequence::new(vec![note(60, 0.0, 2.0)], false))
        .unwrap();
    assert!(handle.wait_for_sequence(once, Some(Duration::from_secs(2))));
    handle.stop_sequence(looping).unwrap();

    let mut reports = Vec::new();
    while let Some(report) = handle.try_recv_report() {
        reports.push(report);
    }
    assert!(reports.contains(&SchedulerReport::IterationStarted { id: looping, iteration: 1 }));
    assert!(reports.contains(&SchedulerReport::SequenceFinished { id: once }));
}

#[test]
fn test_execute_commands() {
    let (runtime, recorder) = start_runtime(Config::default());
    let handle = runtime.handle();

    let outcome = handle.execute(Command::SetTempo { bpm: 600.0 });
    assert!(outcome.success, "{}", outcome.message);

    let outcome = handle.execute(Command::PlaySequence {
        notes: vec![NoteSpec::new(60), NoteSpec::new(62), NoteSpec::new(64)],
        looping: false,
        name: Some("scale".to_string()),
        loop_length: None,
    });
    assert!(outcome.success, "{}", outcome.message);
    let id = outcome
        .data
        .as_ref()
        .and_then(|d| d["sequence_id"].as_u64())
        .map(SequenceId::from_raw)
        .unwrap();

    let status = handle.execute(Command::Status);
    assert!(status.success);
    assert_eq!(status.data.as_ref().unwrap()["bpm"], 600.0);

    assert!(handle.wait_for_sequence(id, Some(Duration::from_secs(2))));
    let pitches: Vec<u8> = recorder
        .messages()
        .iter()
        .filter(|m| m.is_note_on())
        .map(|m| m.note())
        .collect();
    assert_eq!(pitches, vec![60, 62, 64]);

    let bad_tempo = handle.execute(Command::SetTempo { bpm: -1.0 });
    assert!(!bad_tempo.success);
    assert_eq!(handle.current_tempo(), 600.0);

    let missing = handle.execute(Command::StopSequence { sequence_id: SequenceId::from_raw(u64::MAX) });
    assert!(!missing.success);

    let bad_note = handle.execute(Command::PlayNote {
        pitch: 200,
        velocity: None,
        channel: None,
        duration: None,
    });
    assert!(!bad_note.success);
}

#[test]
fn test_stop_all_and_capacity() {
    let mut config = Config::default();
    config.scheduler.max_sequences = Some(2);
    let (runtime, _recorder) = start_runtime(config);
    let handle = runtime.handle();

    handle.play_sequence(&[NoteSpec::new(60)], true).unwrap();
    handle.play_sequence(&[NoteSpec::new(64)], true).unwrap();
    assert!(matches!(
        handle.play_note(67, None, None, None),
        Err(Error::CapacityExceeded { limit: 2 })
    ));

    assert_eq!(handle.stop_all().unwrap(), 2);
    assert!(handle.active_sequences().is_empty());
    assert!(handle.play_note(67, None, None, None).is_ok());
}

#[test]
fn test_transport_stop_silences() {
    let (runtime, recorder) = start_runtime(Config::default());
    let handle = runtime.handle();

    handle
        .add_sequence(Sequence::new(vec![note(60, 0.0, 8.0)], false))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.sounding_count(), 1);

    assert!(handle.stop_transport().unwrap());
    assert_eq!(handle.sounding_count(), 0);
    assert_eq!(
        recorder.messages().last(),
        Some(&MidiMessage::NoteOff { channel: 0, note: 60 })
    );
    assert!(!handle.is_running());
    assert_eq!(handle.active_sequences().len(), 1);
}

#[test]
fn test_shutdown_rejects_commands() {
    let (runtime, _recorder) = start_runtime(Config::default());
    let handle = runtime.handle().clone();
    runtime.shutdown();

    assert!(handle.is_shutdown_requested());
    assert!(matches!(handle.set_tempo(100.0), Err(Error::Shutdown)));
    let outcome = handle.execute(Command::StopAll);
    assert!(!outcome.success);
}
