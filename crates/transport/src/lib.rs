mod clip;
mod pool;
mod track;

pub use clip::{AudioClip, Clip, ClipContent, MidiClip};
pub use pool::{ClipKey, ClipPool};
pub use track::{Track, TrackId};

/// Pulses Per Quarter Note - display resolution for musical positions
pub const PPQN: u64 = 960;

/// Seconds per beat for a tempo in beats per minute.
#[inline]
pub fn beat_duration(bpm: f64) -> f64 {
    60.0 / bpm
}

#[inline]
pub fn beats_to_seconds(beats: f64, beat_duration: f64) -> f64 {
    beats * beat_duration
}

#[inline]
pub fn seconds_to_beats(seconds: f64, beat_duration: f64) -> f64 {
    seconds / beat_duration
}

/// Frames at `sample_rate` covered by `beats`.
#[inline]
pub fn beats_to_frames(beats: f64, beat_duration: f64, sample_rate: u32) -> f64 {
    beats * beat_duration * sample_rate as f64
}

#[inline]
pub fn frames_to_beats(frames: f64, beat_duration: f64, sample_rate: u32) -> f64 {
    frames / (beat_duration * sample_rate as f64)
}
