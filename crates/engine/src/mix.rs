//! Per-clip rendering for the mixing loop. Nothing here allocates.

use std::f64::consts::TAU;

use daw_transport::{AudioClip, Clip, ClipContent, MidiClip};

const NOTE_ATTACK_SECS: f64 = 0.005;
const NOTE_RELEASE_SECS: f64 = 0.03;
const NOTE_AMPLITUDE: f64 = 0.2;

/// Timing of the buffer being rendered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    /// Beat at frame 0.
    pub start: f64,
    pub frames: usize,
    pub beats_per_frame: f64,
    pub beat_duration: f64,
}

impl Window {
    #[inline]
    pub fn end(&self) -> f64 {
        self.start + self.frames as f64 * self.beats_per_frame
    }

    #[inline]
    fn beat_at(&self, frame: usize) -> f64 {
        self.start + frame as f64 * self.beats_per_frame
    }

    /// Frames whose beat falls inside `[from, to)`.
    fn frame_range(&self, from: f64, to: f64) -> std::ops::Range<usize> {
        let first = ((from - self.start) / self.beats_per_frame).ceil().max(0.0);
        let last = ((to - self.start) / self.beats_per_frame).ceil().max(0.0);
        let first = (first as usize).min(self.frames);
        let last = (last as usize).min(self.frames);
        first..last.max(first)
    }
}

/// Accumulate one clip into `out`. Missing or empty content contributes silence.
pub(crate) fn render_clip(clip: &Clip, out: &mut [Vec<f32>], window: &Window) {
    match &clip.content {
        ClipContent::Audio(audio) => render_audio(clip, audio, out, window),
        ClipContent::Midi(midi) => render_midi(clip, midi, out, window),
    }
}

fn render_audio(clip: &Clip, audio: &AudioClip, out: &mut [Vec<f32>], window: &Window) {
    let Some(asset) = &audio.asset else {
        return;
    };
    let source_channels = asset.channels();
    if source_channels == 0 || asset.frames() == 0 {
        return;
    }

    let source_per_beat = window.beat_duration * asset.sample_rate() as f64;
    let length = clip.length();

    for frame in window.frame_range(clip.min_time, clip.max_time) {
        let beat = window.beat_at(frame);
        if beat < clip.min_time || beat >= clip.max_time {
            continue;
        }
        let local = beat - clip.min_time;
        let position = clip.start_offset + local * source_per_beat;
        let gain = audio.gain * fade_gain(local, length, audio.fade_in, audio.fade_out);
        if gain == 0.0 {
            continue;
        }

        for (channel, buffer) in out.iter_mut().enumerate() {
            let plane = asset.plane(channel % source_channels);
            if let Some(slot) = buffer.get_mut(frame) {
                *slot += sample_at(plane, position) * gain;
            }
        }
    }
}

fn render_midi(clip: &Clip, midi: &MidiClip, out: &mut [Vec<f32>], window: &Window) {
    let release_beats = NOTE_RELEASE_SECS / window.beat_duration;
    let visible_start = window.start.max(clip.min_time);
    let visible_end = window.end().min(clip.max_time);
    if visible_start >= visible_end {
        return;
    }

    // Timeline beat of content position 0.
    let origin = clip.min_time - clip.start_offset;

    for note in midi.notes.notes() {
        let note_on = origin + note.start;
        if note_on >= visible_end {
            break;
        }
        let note_off = note_on + note.length;
        if note_off + release_beats <= visible_start || note.length <= 0.0 {
            continue;
        }

        let frequency = 440.0 * 2f64.powf((note.pitch as f64 - 69.0) / 12.0);
        let amplitude = NOTE_AMPLITUDE * note.velocity as f64 / 127.0;
        let from = note_on.max(visible_start);
        let to = (note_off + release_beats).min(visible_end);

        for frame in window.frame_range(from, to) {
            let beat = window.beat_at(frame);
            if beat < note_on {
                continue;
            }
            let elapsed = (beat - note_on) * window.beat_duration;
            let mut envelope = (elapsed / NOTE_ATTACK_SECS).min(1.0);
            if beat >= note_off {
                envelope *= 1.0 - (beat - note_off) * window.beat_duration / NOTE_RELEASE_SECS;
            }
            if envelope <= 0.0 {
                continue;
            }
            let sample = ((TAU * frequency * elapsed).sin() * amplitude * envelope) as f32;
            for buffer in out.iter_mut() {
                if let Some(slot) = buffer.get_mut(frame) {
                    *slot += sample;
                }
            }
        }
    }
}

/// Linear fade envelope for a point `local` beats into a clip of `length` beats.
pub(crate) fn fade_gain(local: f64, length: f64, fade_in: f64, fade_out: f64) -> f32 {
    let mut gain = 1.0;
    if fade_in > 0.0 && local < fade_in {
        gain *= local / fade_in;
    }
    let remaining = length - local;
    if fade_out > 0.0 && remaining < fade_out {
        gain *= remaining / fade_out;
    }
    gain.clamp(0.0, 1.0) as f32
}

/// Linearly interpolated read; anything outside the buffer is silence.
#[inline]
pub(crate) fn sample_at(plane: &[f32], position: f64) -> f32 {
    if !(position >= 0.0) {
        return 0.0;
    }
    let index = position.floor() as usize;
    let Some(&current) = plane.get(index) else {
        return 0.0;
    };
    let next = plane.get(index + 1).copied().unwrap_or(0.0);
    let frac = (position - index as f64) as f32;
    current + (next - current) * frac
}

/// Balance law: centre is unity on both sides, the far side fades out.
#[inline]
pub(crate) fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}
