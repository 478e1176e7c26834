use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use basedrop::{Handle, Shared, SharedCell};
use daw_transport::Track;

use crate::atomic::{AtomicF32, AtomicF64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Playing = 1,
    Recording = 2,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Playing,
            2 => TransportState::Recording,
            _ => TransportState::Stopped,
        }
    }

    pub fn is_rolling(&self) -> bool {
        !matches!(self, TransportState::Stopped)
    }
}

/// State published between the control thread and the audio thread.
///
/// Scalars are single-writer atomics; the track list is a copy-on-write
/// snapshot the audio thread picks up without blocking.
pub struct EngineShared {
    state: AtomicU8,
    playhead: AtomicF64,
    beat_duration: AtomicF64,
    master_gain: AtomicF32,
    seek_target: AtomicF64,
    seek_pending: AtomicBool,
    playhead_updated: AtomicBool,
    has_deleted_clips: AtomicBool,
    device_open: AtomicBool,
    buffers_processed: AtomicU64,
    dropped_record_frames: AtomicU64,
    record_start: AtomicF64,
    record_start_latched: AtomicBool,
    pub(crate) tracks: SharedCell<Vec<Track>>,
}

impl EngineShared {
    pub(crate) fn new(handle: &Handle, bpm: f64) -> Self {
        Self {
            state: AtomicU8::new(TransportState::Stopped as u8),
            playhead: AtomicF64::new(0.0),
            beat_duration: AtomicF64::new(daw_transport::beat_duration(bpm)),
            master_gain: AtomicF32::new(1.0),
            seek_target: AtomicF64::new(0.0),
            seek_pending: AtomicBool::new(false),
            playhead_updated: AtomicBool::new(false),
            has_deleted_clips: AtomicBool::new(false),
            device_open: AtomicBool::new(false),
            buffers_processed: AtomicU64::new(0),
            dropped_record_frames: AtomicU64::new(0),
            record_start: AtomicF64::new(0.0),
            record_start_latched: AtomicBool::new(false),
            tracks: SharedCell::new(Shared::new(handle, Vec::new())),
        }
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Playhead in beats as last published by the audio thread.
    #[inline]
    pub fn playhead_pos(&self) -> f64 {
        self.playhead.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_playhead(&self, beats: f64) {
        self.playhead.store(beats, Ordering::Relaxed);
        self.playhead_updated.store(true, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.state().is_rolling()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == TransportState::Recording
    }

    /// Seconds per beat.
    #[inline]
    pub fn beat_duration(&self) -> f64 {
        self.beat_duration.load(Ordering::Acquire)
    }

    pub(crate) fn set_beat_duration(&self, seconds: f64) {
        self.beat_duration.store(seconds, Ordering::Release);
    }

    pub fn bpm(&self) -> f64 {
        60.0 / self.beat_duration()
    }

    #[inline]
    pub fn master_gain(&self) -> f32 {
        self.master_gain.load(Ordering::Relaxed)
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master_gain.store(gain.max(0.0), Ordering::Relaxed);
    }

    pub(crate) fn request_seek(&self, beats: f64) {
        self.seek_target.store(beats, Ordering::Relaxed);
        self.seek_pending.store(true, Ordering::Release);
        self.publish_playhead(beats);
    }

    pub(crate) fn take_seek(&self) -> Option<f64> {
        self.seek_pending
            .swap(false, Ordering::AcqRel)
            .then(|| self.seek_target.load(Ordering::Relaxed))
    }

    /// Consume the "playhead moved" flag.
    pub fn take_playhead_updated(&self) -> bool {
        self.playhead_updated.swap(false, Ordering::AcqRel)
    }

    pub fn mark_clips_deleted(&self) {
        self.has_deleted_clips.store(true, Ordering::Release);
    }

    /// Consume the "clips were destroyed" flag.
    pub fn take_deleted_clips(&self) -> bool {
        self.has_deleted_clips.swap(false, Ordering::AcqRel)
    }

    pub fn is_device_open(&self) -> bool {
        self.device_open.load(Ordering::Acquire)
    }

    /// Set by audio backends when their stream starts or stops.
    pub fn set_device_open(&self, open: bool) {
        self.device_open.store(open, Ordering::Release);
    }

    pub fn buffers_processed(&self) -> u64 {
        self.buffers_processed.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_done(&self) {
        self.buffers_processed.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn add_dropped_record_frames(&self, frames: u64) {
        self.dropped_record_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn take_dropped_record_frames(&self) -> u64 {
        self.dropped_record_frames.swap(0, Ordering::Relaxed)
    }

    /// Forget the previous take's start. The next block the audio thread
    /// pushes into the record ring sets it again.
    pub(crate) fn reset_record_start(&self) {
        self.record_start_latched.store(false, Ordering::Release);
    }

    /// Called by the audio thread for every block it records; only the
    /// first one after a reset is kept.
    pub(crate) fn latch_record_start(&self, beats: f64) {
        if !self.record_start_latched.load(Ordering::Relaxed) {
            self.record_start.store(beats, Ordering::Relaxed);
            self.record_start_latched.store(true, Ordering::Release);
        }
    }

    /// Beat of the first recorded frame of the current take, once known.
    pub fn record_start(&self) -> Option<f64> {
        self.record_start_latched
            .load(Ordering::Acquire)
            .then(|| self.record_start.load(Ordering::Relaxed))
    }

    /// Current track snapshot as seen by the audio thread.
    pub fn tracks(&self) -> Shared<Vec<Track>> {
        self.tracks.get()
    }

    /// Wait until every buffer that might have started before this call has
    /// finished. Returns `false` on timeout.
    pub(crate) fn wait_for_buffer_boundary(&self, timeout: Duration) -> bool {
        if !self.is_device_open() {
            return true;
        }
        // The buffer in flight may complete once; the next one started after us.
        let target = self.buffers_processed() + 2;
        let deadline = Instant::now() + timeout;
        while self.buffers_processed() < target {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}
