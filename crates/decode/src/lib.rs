mod cache;
mod resample;

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

pub use cache::{AssetCache, AssetError, MidiAsset, MidiNote, SampleAsset};
pub use resample::resample_planes;

const SAMPLES_ROOT: &str = "samples";

/// Decoded, planar audio as handed to the asset cache.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Short codec name reported by the container probe (e.g. `pcm_s16le`, `flac`).
    pub codec: String,
    pub bits_per_sample: Option<u32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// One buffer per channel, all the same length.
    pub planes: Vec<Vec<f32>>,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }
}

/// Resolve a sample path to an existing file.
/// Accepts paths relative to the samples root (e.g., `cr78/hihat.wav`)
/// or paths that already point at a file.
pub fn resolve_sample_path(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }

    let with_root = Path::new(SAMPLES_ROOT).join(path);
    if with_root.exists() {
        return Some(with_root);
    }

    None
}

pub fn decode_file(path: &Path) -> anyhow::Result<DecodedAudio> {
    let resolved = resolve_sample_path(path)
        .ok_or_else(|| anyhow::anyhow!("sample not found: {}", path.display()))?;
    decode_file_direct(&resolved)
}

pub fn decode_file_direct(path: &Path) -> anyhow::Result<DecodedAudio> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track"))?;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0) as u16;
    let bits_per_sample = track.codec_params.bits_per_sample;
    let codec = symphonia::default::get_codecs()
        .get_codec(track.codec_params.codec)
        .map(|d| d.short_name.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut interleaved = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!(path = %path.display(), "skipping corrupt packet: {msg}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(sample_buf.samples());
    }

    if channels == 0 {
        anyhow::bail!("stream reports no channels");
    }

    let planes = deinterleave(&interleaved, channels as usize);
    debug!(
        path = %path.display(),
        codec,
        sample_rate,
        channels,
        frames = planes[0].len(),
        "decoded"
    );

    Ok(DecodedAudio {
        codec,
        bits_per_sample,
        sample_rate,
        channels,
        planes,
    })
}

/// Split `[L, R, L, R, ...]` into one buffer per channel. A trailing partial
/// frame is dropped.
pub fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (plane, &sample) in planes.iter_mut().zip(frame) {
            plane.push(sample);
        }
    }
    planes
}
