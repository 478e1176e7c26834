use std::sync::Arc;

use daw_transport::Track;

use crate::mix::{self, Window};
use crate::state::{EngineShared, TransportState};

/// Buffer geometry agreed with the audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub sample_rate: u32,
    /// Largest block a single `process` call may render.
    pub max_frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

/// Real-time side of the engine. Owned by the audio thread; everything it
/// needs is preallocated when it is created.
pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
    config: ProcessorConfig,
    playhead: f64,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
    track_mix: Vec<Vec<f32>>,
    record_tx: rtrb::Producer<f32>,
}

impl PlaybackEngine {
    pub(crate) fn new(shared: Arc<EngineShared>, config: ProcessorConfig, record_tx: rtrb::Producer<f32>) -> Self {
        let planes = |channels: usize| vec![vec![0.0f32; config.max_frames]; channels];
        Self {
            playhead: shared.playhead_pos(),
            shared,
            config,
            inputs: planes(config.input_channels),
            outputs: planes(config.output_channels),
            track_mix: planes(config.output_channels),
            record_tx,
        }
    }

    pub fn config(&self) -> ProcessorConfig {
        self.config
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Playhead as seen by the audio thread, in beats.
    pub fn playhead(&self) -> f64 {
        self.playhead
    }

    /// Planar capture buffers; the backend fills these before `process`.
    pub fn inputs_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.inputs
    }

    /// Planar output of the last `process` call.
    pub fn outputs(&self) -> &[Vec<f32>] {
        &self.outputs
    }

    /// Render one block of `frames` (at most `max_frames`) into the planar
    /// output buffers. Never allocates, blocks or fails: anything malformed
    /// renders as silence.
    pub fn process(&mut self, frames: usize, sample_rate: u32) {
        let frames = frames.min(self.config.max_frames);
        for out in &mut self.outputs {
            out[..frames].fill(0.0);
        }

        if let Some(target) = self.shared.take_seek() {
            self.playhead = target.max(0.0);
        }

        let state = self.shared.state();
        let beat_duration = self.shared.beat_duration();
        let timing_valid = sample_rate > 0 && beat_duration.is_finite() && beat_duration > 0.0;
        let rolling = state.is_rolling() && timing_valid;

        let window = Window {
            start: self.playhead,
            frames,
            beats_per_frame: if timing_valid {
                1.0 / (sample_rate as f64 * beat_duration)
            } else {
                0.0
            },
            beat_duration,
        };

        let tracks = self.shared.tracks.get();
        let any_solo = tracks.iter().any(|t| t.solo);
        for track in tracks.iter() {
            let audible = !track.muted && (!any_solo || track.solo);
            let monitoring = track.armed && track.monitor && !self.inputs.is_empty();
            if !audible || (!rolling && !monitoring) {
                continue;
            }
            self.render_track(track, &window, rolling, monitoring);
        }

        let master = self.shared.master_gain();
        if master != 1.0 {
            for out in &mut self.outputs {
                out[..frames].iter_mut().for_each(|s| *s *= master);
            }
        }

        if state == TransportState::Recording {
            self.push_record_input(frames, window.start);
        }

        if rolling {
            self.playhead = window.end();
            self.shared.publish_playhead(self.playhead);
        }
        self.shared.buffer_done();
    }

    fn render_track(&mut self, track: &Track, window: &Window, rolling: bool, monitoring: bool) {
        let frames = window.frames;
        for plane in &mut self.track_mix {
            plane[..frames].fill(0.0);
        }

        if rolling {
            for clip in track.clips_in_range(window.start, window.end()) {
                if clip.is_active() {
                    mix::render_clip(clip, &mut self.track_mix, window);
                }
            }
        }

        if monitoring {
            let inputs = self.inputs.len();
            for (channel, plane) in self.track_mix.iter_mut().enumerate() {
                let input = &self.inputs[channel % inputs];
                for (out, sample) in plane[..frames].iter_mut().zip(&input[..frames]) {
                    *out += *sample;
                }
            }
        }

        let (left, right) = mix::pan_gains(track.pan);
        let stereo = self.outputs.len() == 2;
        for (channel, (out, plane)) in self.outputs.iter_mut().zip(&self.track_mix).enumerate() {
            let pan = match (stereo, channel) {
                (true, 0) => left,
                (true, _) => right,
                (false, _) => 1.0,
            };
            let gain = track.volume * pan;
            for (dst, src) in out[..frames].iter_mut().zip(&plane[..frames]) {
                *dst += *src * gain;
            }
        }
    }

    /// Interleave capture into the record ring. Whole blocks only: a block
    /// that does not fit is dropped and counted. `start` is the beat of the
    /// block's first frame.
    fn push_record_input(&mut self, frames: usize, start: f64) {
        let channels = self.inputs.len();
        if channels == 0 || frames == 0 {
            return;
        }
        if self.record_tx.slots() < frames * channels {
            self.shared.add_dropped_record_frames(frames as u64);
            return;
        }
        for frame in 0..frames {
            for plane in &self.inputs {
                let _ = self.record_tx.push(plane[frame]);
            }
        }
        self.shared.latch_record_start(start);
    }

    /// Convenience for interleaved devices: deinterleave `input`, render
    /// `output.len() / output_channels` frames in `max_frames` chunks and
    /// interleave the result into `output`.
    pub fn process_interleaved(&mut self, input: &[f32], output: &mut [f32], sample_rate: u32) {
        let out_channels = self.config.output_channels.max(1);
        let in_channels = self.config.input_channels;
        let total = output.len() / out_channels;
        let chunk = self.config.max_frames.max(1);

        let mut done = 0;
        while done < total {
            let frames = chunk.min(total - done);
            for (channel, plane) in self.inputs.iter_mut().enumerate() {
                for (frame, slot) in plane[..frames].iter_mut().enumerate() {
                    *slot = input
                        .get((done + frame) * in_channels + channel)
                        .copied()
                        .unwrap_or(0.0);
                }
            }

            self.process(frames, sample_rate);

            let block = &mut output[done * out_channels..(done + frames) * out_channels];
            for (frame, samples) in block.chunks_mut(out_channels).enumerate() {
                for (channel, sample) in samples.iter_mut().enumerate() {
                    *sample = self.outputs.get(channel).map_or(0.0, |p| p[frame]);
                }
            }
            done += frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use basedrop::{Collector, Shared};
    use daw_decode::{AssetCache, DecodedAudio};
    use daw_transport::{Clip, Track, TrackId};

    use super::*;

    const RATE: u32 = 48_000;

    fn setup(input_channels: usize) -> (Collector, Arc<EngineShared>, PlaybackEngine, rtrb::Consumer<f32>) {
        setup_with_ring(input_channels, RATE as usize)
    }

    fn setup_with_ring(
        input_channels: usize,
        ring: usize,
    ) -> (Collector, Arc<EngineShared>, PlaybackEngine, rtrb::Consumer<f32>) {
        let collector = Collector::new();
        let shared = Arc::new(EngineShared::new(&collector.handle(), 120.0));
        let (tx, rx) = rtrb::RingBuffer::new(ring);
        let config = ProcessorConfig {
            sample_rate: RATE,
            max_frames: 512,
            input_channels,
            output_channels: 2,
        };
        let engine = PlaybackEngine::new(shared.clone(), config, tx);
        (collector, shared, engine, rx)
    }

    fn publish(collector: &Collector, shared: &EngineShared, tracks: Vec<Track>) {
        shared.tracks.set(Shared::new(&collector.handle(), tracks));
    }

    fn constant_asset(cache: &AssetCache, value: f32, frames: usize) -> daw_decode::SampleAsset {
        let audio = DecodedAudio {
            codec: "pcm".into(),
            bits_per_sample: Some(32),
            sample_rate: RATE,
            channels: 1,
            planes: vec![vec![value; frames]],
        };
        cache
            .insert(std::path::Path::new("/virtual/constant.wav"), audio)
            .unwrap()
    }

    #[test]
    fn stopped_engine_is_silent_and_still() {
        let (_collector, shared, mut engine, _rx) = setup(0);
        engine.process(256, RATE);
        assert!(engine.outputs()[0][..256].iter().all(|&s| s == 0.0));
        assert_eq!(engine.playhead(), 0.0);
        assert_eq!(shared.buffers_processed(), 1);
    }

    #[test]
    fn playhead_advances_in_beats() {
        let (_collector, shared, mut engine, _rx) = setup(0);
        shared.set_state(TransportState::Playing);
        engine.process(480, RATE);
        // 480 frames at 48k = 10ms = 0.02 beats at 120 bpm
        assert!((engine.playhead() - 0.02).abs() < 1e-12);
        assert_eq!(shared.playhead_pos(), engine.playhead());
        assert!(shared.take_playhead_updated());
    }

    #[test]
    fn seek_is_applied_at_buffer_start() {
        let (_collector, shared, mut engine, _rx) = setup(0);
        shared.request_seek(8.0);
        engine.process(64, RATE);
        assert_eq!(engine.playhead(), 8.0);
    }

    #[test]
    fn renders_clip_with_gain_volume_and_pan() {
        let (collector, shared, mut engine, _rx) = setup(0);
        let cache = AssetCache::new();
        let asset = constant_asset(&cache, 0.5, RATE as usize);

        let mut track = Track::new(TrackId(1), "t");
        let mut clip = Clip::audio("c", asset, 0.0, 0.5);
        if let daw_transport::ClipContent::Audio(audio) = &mut clip.content {
            audio.gain = 0.5;
        }
        track.insert_clip(clip, 0.5);
        track.volume = 0.8;
        track.pan = 0.5;
        publish(&collector, &shared, vec![track]);

        shared.set_state(TransportState::Playing);
        engine.process(128, RATE);
        let left = engine.outputs()[0][10];
        let right = engine.outputs()[1][10];
        assert!((left - 0.5 * 0.5 * 0.8 * 0.5).abs() < 1e-6);
        assert!((right - 0.5 * 0.5 * 0.8).abs() < 1e-6);
    }

    #[test]
    fn inactive_muted_and_unsoloed_tracks_are_silent() {
        let (collector, shared, mut engine, _rx) = setup(0);
        let cache = AssetCache::new();
        let asset = constant_asset(&cache, 1.0, RATE as usize);

        let mut a = Track::new(TrackId(1), "a");
        a.insert_clip(Clip::audio("a", asset.clone(), 0.0, 0.5), 0.5);
        let mut b = Track::new(TrackId(2), "b");
        b.insert_clip(Clip::audio("b", asset, 0.0, 0.5), 0.5);
        b.solo = true;
        b.clip(0).unwrap().set_active(false);
        publish(&collector, &shared, vec![a, b]);

        shared.set_state(TransportState::Playing);
        engine.process(64, RATE);
        assert!(engine.outputs()[0][..64].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn missing_asset_renders_silence() {
        let (collector, shared, mut engine, _rx) = setup(0);
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(Clip::unavailable("gone", "/nope.wav".into(), 0.0, 4.0), 0.5);
        publish(&collector, &shared, vec![track]);

        shared.set_state(TransportState::Playing);
        engine.process(512, RATE);
        assert!(engine.outputs()[1][..512].iter().all(|&s| s == 0.0));
        assert!(engine.playhead() > 0.0);
    }

    #[test]
    fn monitoring_passes_input_while_stopped() {
        let (collector, shared, mut engine, _rx) = setup(1);
        let mut track = Track::new(TrackId(1), "mic");
        track.armed = true;
        track.monitor = true;
        publish(&collector, &shared, vec![track]);

        engine.inputs_mut()[0][..32].fill(0.25);
        engine.process(32, RATE);
        assert_eq!(engine.outputs()[0][0], 0.25);
        assert_eq!(engine.outputs()[1][31], 0.25);
    }

    #[test]
    fn recording_pushes_interleaved_input() {
        let (_collector, shared, mut engine, mut rx) = setup(2);
        shared.set_state(TransportState::Recording);
        engine.inputs_mut()[0][..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        engine.inputs_mut()[1][..4].copy_from_slice(&[-1.0, -2.0, -3.0, -4.0]);
        engine.process(4, RATE);

        let mut captured = Vec::new();
        while let Ok(sample) = rx.pop() {
            captured.push(sample);
        }
        assert_eq!(captured, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0]);
    }

    #[test]
    fn full_record_ring_drops_whole_blocks() {
        let (_collector, shared, mut engine, mut rx) = setup_with_ring(2, 100);
        shared.set_state(TransportState::Recording);
        engine.inputs_mut()[0][..64].fill(0.5);
        engine.inputs_mut()[1][..64].fill(-0.5);

        // 64 stereo frames need 128 slots
        engine.process(64, RATE);
        assert_eq!(rx.slots(), 0);
        assert_eq!(shared.take_dropped_record_frames(), 64);
        assert_eq!(shared.take_dropped_record_frames(), 0);
        assert_eq!(shared.record_start(), None);

        engine.process(32, RATE);
        assert_eq!(rx.slots(), 64);
        assert_eq!(shared.take_dropped_record_frames(), 0);

        // the ring stays full until someone drains it
        engine.process(32, RATE);
        assert_eq!(shared.take_dropped_record_frames(), 32);
        while rx.pop().is_ok() {}
        engine.process(32, RATE);
        assert_eq!(rx.slots(), 64);
        assert_eq!(shared.take_dropped_record_frames(), 0);
    }

    #[test]
    fn record_start_is_the_first_recorded_block() {
        let (_collector, shared, mut engine, _rx) = setup(1);
        shared.set_state(TransportState::Playing);
        engine.process(480, RATE);
        let first = engine.playhead();

        shared.reset_record_start();
        shared.set_state(TransportState::Recording);
        engine.process(480, RATE);
        engine.process(480, RATE);
        assert_eq!(shared.record_start(), Some(first));

        shared.reset_record_start();
        assert_eq!(shared.record_start(), None);
        engine.process(480, RATE);
        assert!((shared.record_start().unwrap() - 0.06).abs() < 1e-12);
    }

    #[test]
    fn interleaved_processing_spans_several_chunks() {
        let (collector, shared, mut engine, _rx) = setup(0);
        let cache = AssetCache::new();
        let asset = constant_asset(&cache, 0.25, RATE as usize);
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(Clip::audio("c", asset, 0.0, 0.5), 0.5);
        publish(&collector, &shared, vec![track]);
        shared.set_state(TransportState::Playing);

        let mut output = vec![0.0f32; 1200 * 2];
        engine.process_interleaved(&[], &mut output, RATE);
        assert!(output.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert_eq!(shared.buffers_processed(), 3);
    }

    #[test]
    fn concurrent_tempo_changes_never_tear() {
        let (_collector, shared, mut engine, _rx) = setup(0);
        shared.set_state(TransportState::Playing);

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let shared = shared.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    shared.set_beat_duration(daw_transport::beat_duration(120.0));
                    shared.set_beat_duration(daw_transport::beat_duration(150.0));
                }
            })
        };

        let frames = 480;
        for _ in 0..2000 {
            let before = engine.playhead();
            engine.process(frames, RATE);
            let beats = engine.playhead() - before;
            let seconds = frames as f64 / RATE as f64;
            let observed = seconds / beats;
            assert!(
                (observed - 0.5).abs() < 1e-9 || (observed - 0.4).abs() < 1e-9,
                "torn beat duration {observed}"
            );
        }

        done.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
