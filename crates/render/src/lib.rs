//! Offline bounce: the same `process()` the audio thread runs, driven in a
//! loop and collected into memory.

use std::path::Path;

use anyhow::Context;
use daw_engine::{EngineHandle, ProcessorConfig};
use daw_transport::Track;
use tracing::debug;

const BLOCK_FRAMES: usize = 1024;
/// Rendered past the last clip so note releases are not cut off.
const TAIL_SECS: f64 = 0.05;

/// Interleaved audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

fn end_beat(tracks: &[Track]) -> f64 {
    let any_solo = tracks.iter().any(|t| t.solo);
    tracks
        .iter()
        .filter(|t| !t.muted && (!any_solo || t.solo))
        .map(Track::end_time)
        .fold(0.0, f64::max)
}

/// Render the whole timeline, from beat 0 to the end of the last audible clip.
pub fn render_timeline(tracks: &[Track], bpm: f64, sample_rate: u32, channels: u16) -> anyhow::Result<AudioBuffer> {
    render_range(tracks, bpm, sample_rate, channels, 0.0, end_beat(tracks))
}

/// Render `[start, end)` in beats.
pub fn render_range(
    tracks: &[Track],
    bpm: f64,
    sample_rate: u32,
    channels: u16,
    start: f64,
    end: f64,
) -> anyhow::Result<AudioBuffer> {
    anyhow::ensure!(sample_rate > 0 && channels > 0, "invalid output format");
    let span = (end - start).max(0.0);
    if span == 0.0 {
        return Ok(AudioBuffer {
            samples: Vec::new(),
            sample_rate,
            channels,
        });
    }

    let mut engine = EngineHandle::new(bpm, std::env::temp_dir());
    engine.publish_tracks(tracks.to_vec());
    let mut processor = engine
        .create_processor(ProcessorConfig {
            sample_rate,
            max_frames: BLOCK_FRAMES,
            input_channels: 0,
            output_channels: channels as usize,
        })
        .context("creating offline processor")?;

    let beat_duration = engine.shared().beat_duration();
    let total_frames = ((span * beat_duration + TAIL_SECS) * sample_rate as f64).ceil() as usize;

    engine.seek(start);
    engine.shared().set_device_open(true);
    engine.play()?;

    let out_channels = channels as usize;
    let mut samples = vec![0.0f32; total_frames * out_channels];
    for chunk in samples.chunks_mut(BLOCK_FRAMES * out_channels) {
        processor.process_interleaved(&[], chunk, sample_rate);
    }

    engine.stop()?;
    engine.shared().set_device_open(false);
    drop(processor);
    engine.collect();

    debug!(frames = total_frames, start, end, "timeline rendered");
    Ok(AudioBuffer {
        samples,
        sample_rate,
        channels,
    })
}

pub fn write_wav(buffer: &AudioBuffer, path: &Path) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for &sample in &buffer.samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
