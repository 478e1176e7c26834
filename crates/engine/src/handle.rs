use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use basedrop::{Collector, Handle, Shared};
use daw_transport::Track;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::processor::{PlaybackEngine, ProcessorConfig};
use crate::record::{RecordedTake, Recorder};
use crate::state::{EngineShared, TransportState};

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 999.0;

/// Seconds of capture the record ring holds before frames are dropped.
const RECORD_RING_SECS: usize = 4;
const BOUNDARY_TIMEOUT: Duration = Duration::from_millis(500);
const RECORDER_TIMEOUT: Duration = Duration::from_secs(5);

pub type BpmListener = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("audio device is not open")]
    DeviceNotOpen,
    #[error("no input device to record from")]
    NoInput,
    #[error("cannot reconfigure the engine while recording")]
    Busy,
    #[error("recording failed: {source}")]
    Record { source: anyhow::Error },
    #[error("recorder did not finish writing the take within {0:?}")]
    RecorderTimeout(Duration),
}

/// Control-thread side of the engine: transport, tempo and the track
/// snapshot published to the audio thread.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    collector: Collector,
    handle: Handle,
    recorder: Recorder,
    listeners: Vec<BpmListener>,
}

impl EngineHandle {
    /// Nothing is spawned or written under `record_dir` until the first
    /// [`record`](Self::record), so offline users pay nothing for it.
    pub fn new(bpm: f64, record_dir: impl Into<PathBuf>) -> Self {
        let collector = Collector::new();
        let handle = collector.handle();
        let shared = Arc::new(EngineShared::new(&handle, clamp_bpm(bpm)));
        Self {
            shared,
            collector,
            handle,
            recorder: Recorder::new(record_dir.into()),
            listeners: Vec::new(),
        }
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Where takes are written.
    pub fn record_dir(&self) -> &Path {
        self.recorder.dir()
    }

    /// Swap in a new track list. The old snapshot is freed by [`collect`]
    /// once the audio thread has let go of it.
    ///
    /// [`collect`]: EngineHandle::collect
    pub fn publish_tracks(&self, tracks: Vec<Track>) {
        self.shared.tracks.set(Shared::new(&self.handle, tracks));
    }

    /// Free snapshots the audio thread no longer references.
    pub fn collect(&mut self) {
        self.collector.collect();
    }

    /// Build the real-time processor for a stream with this geometry. The
    /// record ring is recreated to match the input channel count.
    pub fn create_processor(&mut self, config: ProcessorConfig) -> Result<PlaybackEngine, TransportError> {
        if self.recorder.is_active() {
            return Err(TransportError::Busy);
        }
        let capacity = (config.sample_rate as usize * config.input_channels * RECORD_RING_SECS).max(1);
        let (tx, rx) = rtrb::RingBuffer::new(capacity);
        self.recorder
            .install(rx, config.sample_rate, config.input_channels as u16);
        debug!(?config, "processor created");
        Ok(PlaybackEngine::new(self.shared.clone(), config, tx))
    }

    pub fn bpm(&self) -> f64 {
        self.shared.bpm()
    }

    /// Change tempo. Out-of-range values are clamped; non-finite ones ignored.
    pub fn set_bpm(&self, bpm: f64) {
        if !bpm.is_finite() {
            warn!(bpm, "ignoring invalid tempo");
            return;
        }
        let bpm = clamp_bpm(bpm);
        self.shared.set_beat_duration(daw_transport::beat_duration(bpm));
        for listener in &self.listeners {
            listener(bpm);
        }
    }

    pub fn on_bpm_change(&mut self, listener: impl Fn(f64) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn play(&mut self) -> Result<(), TransportError> {
        if !self.shared.is_device_open() {
            return Err(TransportError::DeviceNotOpen);
        }
        if self.shared.state().is_rolling() {
            return Ok(());
        }
        self.shared.set_state(TransportState::Playing);
        info!(at = self.shared.playhead_pos(), "playback started");
        Ok(())
    }

    /// Stop the transport, finishing any recording. Returns the take that
    /// was being recorded, if any.
    pub fn stop(&mut self) -> Result<Option<RecordedTake>, TransportError> {
        match self.shared.state() {
            TransportState::Stopped => Ok(None),
            TransportState::Playing => {
                self.shared.set_state(TransportState::Stopped);
                info!(at = self.shared.playhead_pos(), "playback stopped");
                Ok(None)
            }
            TransportState::Recording => self.stop_record(),
        }
    }

    /// Start recording. From `Playing` this punches in at the first buffer
    /// the audio thread renders in the recording state.
    pub fn record(&mut self) -> Result<(), TransportError> {
        if !self.shared.is_device_open() {
            return Err(TransportError::DeviceNotOpen);
        }
        if self.shared.state() == TransportState::Recording {
            return Ok(());
        }
        if !self.recorder.has_input() {
            return Err(TransportError::NoInput);
        }
        self.recorder
            .start(self.shared.playhead_pos())
            .map_err(|source| TransportError::Record { source })?;
        self.shared.reset_record_start();
        self.shared.set_state(TransportState::Recording);
        Ok(())
    }

    /// Stop recording and wait for the take to be flushed to disk.
    pub fn stop_record(&mut self) -> Result<Option<RecordedTake>, TransportError> {
        if self.shared.state() != TransportState::Recording {
            return Ok(None);
        }
        self.shared.set_state(TransportState::Stopped);
        if !self.shared.wait_for_buffer_boundary(BOUNDARY_TIMEOUT) {
            warn!("audio thread did not finish a buffer before the recorder stopped");
        }

        let dropped = self.shared.take_dropped_record_frames();
        if dropped > 0 {
            warn!(dropped, "record ring overflowed, frames were lost");
        }

        match self.recorder.finish(RECORDER_TIMEOUT) {
            Some(Ok(mut take)) => {
                if let Some(start) = self.shared.record_start() {
                    take.start_beat = start;
                }
                info!(path = %take.path.display(), frames = take.frames, "recording stopped");
                Ok(Some(take))
            }
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Move the playhead. Applied by the audio thread at its next buffer, or
    /// picked up by the next processor when no stream is running.
    pub fn seek(&self, beats: f64) {
        let beats = if beats.is_finite() { beats.max(0.0) } else { 0.0 };
        self.shared.request_seek(beats);
    }
}

fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() { bpm.clamp(MIN_BPM, MAX_BPM) } else { 120.0 }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn handle() -> (tempfile::TempDir, EngineHandle) {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineHandle::new(120.0, dir.path());
        (dir, engine)
    }

    #[test]
    fn play_requires_an_open_device() {
        let (_dir, mut engine) = handle();
        assert!(matches!(engine.play(), Err(TransportError::DeviceNotOpen)));
        assert!(matches!(engine.record(), Err(TransportError::DeviceNotOpen)));
        assert_eq!(engine.state(), TransportState::Stopped);
    }

    #[test]
    fn play_is_idempotent_and_stop_keeps_playhead() {
        let (_dir, mut engine) = handle();
        engine.shared().set_device_open(true);
        engine.seek(3.0);
        engine.play().unwrap();
        engine.play().unwrap();
        assert_eq!(engine.state(), TransportState::Playing);
        assert!(engine.stop().unwrap().is_none());
        assert_eq!(engine.state(), TransportState::Stopped);
        assert_eq!(engine.shared().playhead_pos(), 3.0);
    }

    #[test]
    fn record_without_input_is_rejected() {
        let (_dir, mut engine) = handle();
        engine.shared().set_device_open(true);
        let config = ProcessorConfig {
            sample_rate: 48_000,
            max_frames: 256,
            input_channels: 0,
            output_channels: 2,
        };
        let _processor = engine.create_processor(config).unwrap();
        assert!(matches!(engine.record(), Err(TransportError::NoInput)));
    }

    #[test]
    fn bpm_changes_notify_listeners() {
        let (_dir, mut engine) = handle();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        engine.on_bpm_change(move |bpm| sink.store(bpm.to_bits(), Ordering::Relaxed));

        engine.set_bpm(150.0);
        assert_eq!(f64::from_bits(seen.load(Ordering::Relaxed)), 150.0);
        assert_eq!(engine.shared().beat_duration(), 0.4);

        engine.set_bpm(5000.0);
        assert!((engine.bpm() - MAX_BPM).abs() < 1e-9);
        engine.set_bpm(f64::NAN);
        assert!((engine.bpm() - MAX_BPM).abs() < 1e-9);
    }

    #[test]
    fn punch_in_record_and_stop_yields_take() {
        let (_dir, mut engine) = handle();
        let config = ProcessorConfig {
            sample_rate: 48_000,
            max_frames: 128,
            input_channels: 1,
            output_channels: 2,
        };
        let mut processor = engine.create_processor(config).unwrap();
        engine.shared().set_device_open(true);

        engine.play().unwrap();
        processor.process(128, 48_000);
        engine.record().unwrap();
        assert!(matches!(engine.create_processor(config), Err(TransportError::Busy)));

        processor.inputs_mut()[0][..128].fill(0.5);
        processor.process(128, 48_000);
        processor.process(128, 48_000);

        // No stream is running, so don't wait on buffer boundaries.
        engine.shared().set_device_open(false);
        let take = engine.stop().unwrap().unwrap();
        assert_eq!(take.frames, 256);
        // 128 frames at 48k and 120 bpm
        assert!((take.start_beat - 128.0 / 24_000.0).abs() < 1e-12);
        assert_eq!(engine.state(), TransportState::Stopped);
    }

    #[test]
    fn take_starts_where_the_audio_thread_began_recording() {
        let (_dir, mut engine) = handle();
        let config = ProcessorConfig {
            sample_rate: 48_000,
            max_frames: 128,
            input_channels: 1,
            output_channels: 2,
        };
        let mut processor = engine.create_processor(config).unwrap();
        engine.shared().set_device_open(true);

        engine.play().unwrap();
        processor.process(128, 48_000);
        engine.record().unwrap();
        // Lands before the first recorded buffer, after the playhead was read.
        engine.seek(2.0);
        processor.process(128, 48_000);

        engine.shared().set_device_open(false);
        let take = engine.stop().unwrap().unwrap();
        assert_eq!(take.frames, 128);
        assert_eq!(take.start_beat, 2.0);
    }

    #[test]
    fn engine_without_takes_creates_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let record_dir = dir.path().join("takes");
        let mut engine = EngineHandle::new(120.0, &record_dir);
        let config = ProcessorConfig {
            sample_rate: 48_000,
            max_frames: 128,
            input_channels: 0,
            output_channels: 2,
        };
        let mut processor = engine.create_processor(config).unwrap();
        engine.shared().set_device_open(true);
        engine.play().unwrap();
        processor.process(128, 48_000);
        engine.stop().unwrap();
        assert!(!record_dir.exists());
    }
}
