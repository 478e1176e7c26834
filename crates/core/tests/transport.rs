use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use daw_core::{Clock, EditError, NullBackend, Session, SessionConfig, TransportState};
use parking_lot::Mutex;

fn config(dir: &tempfile::TempDir) -> SessionConfig {
    SessionConfig {
        sample_rate: 8_000,
        buffer_frames: 256,
        record_dir: dir.path().join("takes"),
        ..SessionConfig::default()
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

fn write_tone(path: &std::path::Path, frames: usize) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for _ in 0..frames {
        writer.write_sample(0.5f32).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn transport_needs_an_open_device() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(&dir), Box::new(NullBackend::new(Clock::Fast))).unwrap();
    assert!(matches!(session.play(), Err(EditError::Transport(_))));
    assert!(matches!(session.record(), Err(EditError::Transport(_))));
    assert_eq!(session.transport_state(), TransportState::Stopped);
}

#[test]
fn play_stop_and_seek() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(&dir), Box::new(NullBackend::new(Clock::Fast))).unwrap();
    let format = session.start_device().unwrap();
    assert_eq!(format.sample_rate, 8_000);
    assert!(session.is_device_open());

    session.play().unwrap();
    session.play().unwrap();
    assert!(session.is_playing());
    assert!(wait_until(Duration::from_secs(5), || session.playhead() > 2.0));
    assert!(session.poll().playhead.is_some());

    session.stop().unwrap();
    assert!(!session.is_playing());
    // Let any buffer in flight finish before sampling the playhead.
    std::thread::sleep(Duration::from_millis(20));
    let stopped_at = session.playhead();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(session.playhead(), stopped_at);
    assert!(stopped_at > 2.0);

    session.rewind();
    assert!(wait_until(Duration::from_secs(5), || session.playhead() == 0.0));

    session.stop_device().unwrap();
    assert!(!session.is_device_open());
}

#[test]
fn recording_lands_on_armed_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NullBackend::new(Clock::Realtime).with_input_level(0.25);
    let session = Session::new(config(&dir), Box::new(backend)).unwrap();
    let armed = session.add_track("vocal");
    let other = session.add_track("drums");
    session.set_track_armed(armed, true).unwrap();
    session.start_device().unwrap();

    session.play().unwrap();
    session.record().unwrap();
    session.record().unwrap();
    assert!(session.is_recording());
    std::thread::sleep(Duration::from_millis(300));

    let take = session.stop().unwrap().expect("a take");
    assert_eq!(session.transport_state(), TransportState::Stopped);
    assert!(take.frames > 0);
    assert!(take.path.exists());

    let reader = hound::WavReader::open(&take.path).unwrap();
    assert_eq!(reader.len() as u64, take.frames);
    assert!(reader.into_samples::<f32>().all(|s| s.unwrap() == 0.25));

    let vocal = session.track(armed).unwrap();
    assert_eq!(vocal.clip_count(), 1);
    assert_eq!(vocal.clip(0).unwrap().min_time, take.start_beat);
    assert_eq!(session.track(other).unwrap().clip_count(), 0);

    // The imported take is a single undoable edit.
    session.undo();
    assert_eq!(session.track(armed).unwrap().clip_count(), 0);
    session.stop_device().unwrap();
}

#[test]
fn punch_in_take_ends_at_the_playhead() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NullBackend::new(Clock::Realtime).with_input_level(0.25);
    let session = Session::new(config(&dir), Box::new(backend)).unwrap();
    let track = session.add_track("vocal");
    session.set_track_armed(track, true).unwrap();
    session.start_device().unwrap();

    session.play().unwrap();
    assert!(wait_until(Duration::from_secs(5), || session.playhead() > 0.25));
    session.record().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    let take = session.stop().unwrap().expect("a take");
    assert_eq!(session.poll().dropped_record_frames, 0);

    // Every recorded buffer advanced the playhead by its own length, so the
    // take must end exactly where the transport stopped.
    let beats = take.frames as f64 / 8_000.0 / 0.5;
    assert!(take.start_beat > 0.25);
    assert!(
        (take.start_beat + beats - session.playhead()).abs() < 1e-9,
        "take {}..{} but stopped at {}",
        take.start_beat,
        take.start_beat + beats,
        session.playhead()
    );
    assert_eq!(session.track(track).unwrap().clip(0).unwrap().min_time, take.start_beat);
    session.stop_device().unwrap();
}

#[test]
fn device_failure_stops_transport_and_keeps_the_take() {
    let dir = tempfile::tempdir().unwrap();
    let failure = Arc::new(AtomicBool::new(false));
    let backend = NullBackend::new(Clock::Realtime)
        .with_input_level(0.25)
        .with_failure(failure.clone());
    let session = Session::new(config(&dir), Box::new(backend)).unwrap();
    let track = session.add_track("vocal");
    session.set_track_armed(track, true).unwrap();
    session.start_device().unwrap();

    session.record().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert!(!session.poll().device_failed);

    failure.store(true, Ordering::Release);
    let events = session.poll();
    assert!(events.device_failed);
    assert_eq!(session.transport_state(), TransportState::Stopped);
    assert!(!session.is_device_open());
    assert_eq!(session.track(track).unwrap().clip_count(), 1);

    assert!(matches!(session.play(), Err(EditError::Transport(_))));
    assert!(!session.poll().device_failed);

    // Reopening clears the failure.
    session.start_device().unwrap();
    session.play().unwrap();
    assert!(!session.poll().device_failed);
    session.stop_device().unwrap();
}

#[test]
fn deferred_load_applies_when_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(&dir), Box::new(NullBackend::new(Clock::Fast))).unwrap();
    let track = session.add_track("t");
    let path = dir.path().join("tone.wav");
    write_tone(&path, 8_000);

    let (tx, rx) = mpsc::channel();
    let job = session.add_clip_from_file_deferred(track, path, 2.0, move |result| {
        let _ = tx.send(result.map_err(|e| e.to_string()));
    });
    assert!(session.wait_for_job(job, Duration::from_secs(5)));
    assert_eq!(rx.recv().unwrap(), Ok(0));

    let clip = session.track(track).unwrap().clip(0).cloned().unwrap();
    assert_eq!((clip.min_time, clip.max_time), (2.0, 4.0));

    let missing = dir.path().join("missing.wav");
    let (tx, rx) = mpsc::channel();
    session.add_clip_from_file_deferred(track, missing, 0.0, move |result| {
        let _ = tx.send(result.is_err());
    });
    session.wait_for_jobs();
    assert!(rx.recv().unwrap());
}

#[test]
fn captured_output_follows_mixer() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new(Clock::Fast).with_capture(capture.clone());
    let session = Session::new(config(&dir), Box::new(backend)).unwrap();

    let track = session.add_track("t");
    let path = dir.path().join("tone.wav");
    write_tone(&path, 80_000);
    session.add_clip_from_file(track, &path, 0.0).unwrap();
    session.set_track_volume(track, 0.5).unwrap();
    session.set_track_pan(track, -1.0).unwrap();

    session.start_device().unwrap();
    session.play().unwrap();
    let audible = || capture.lock().chunks(2).filter(|f| f[0] != 0.0).count();
    assert!(wait_until(Duration::from_secs(5), || audible() > 2_000));
    session.stop_device().unwrap();

    // Output before play() is silent; check the frames after the clip starts.
    let samples = capture.lock();
    let first = samples.chunks(2).position(|f| f[0] != 0.0).unwrap();
    let frames: Vec<_> = samples.chunks(2).skip(first).take(1_000).collect();
    assert_eq!(frames.len(), 1_000);
    assert!(frames.iter().all(|f| (f[0] - 0.25).abs() < 1e-6 && f[1] == 0.0));
}

#[test]
fn bounce_writes_the_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(&dir), Box::new(NullBackend::new(Clock::Fast))).unwrap();
    let track = session.add_track("t");
    let path = dir.path().join("tone.wav");
    write_tone(&path, 8_000);
    session.add_clip_from_file(track, &path, 1.0).unwrap();

    let out = dir.path().join("bounce.wav");
    session.bounce(&out).unwrap();
    let reader = hound::WavReader::open(&out).unwrap();
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.spec().sample_rate, 8_000);
    // Three beats at 120 bpm, plus a short release tail.
    assert!(reader.duration() >= 12_000);
}
