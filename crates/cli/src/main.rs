//! Command-line front end for the engine.
//!
//!   daw devices                    list audio devices
//!   daw play a.wav b.flac          play files, one track each
//!   daw bounce a.wav -o mix.wav    render offline
//!   daw record --seconds 5         record onto an armed track

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use daw_core::{Session, SessionConfig, StreamMode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daw", about = "Multitrack audio engine")]
struct Cli {
    /// Config file; defaults to the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    bpm: Option<f64>,

    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    #[arg(long, global = true)]
    buffer: Option<u32>,

    #[arg(long, global = true)]
    output_device: Option<String>,

    #[arg(long, global = true)]
    input_device: Option<String>,

    /// Request exclusive device access
    #[arg(long, global = true)]
    exclusive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List input and output devices
    Devices,
    /// Play audio files, each on its own track
    Play {
        files: Vec<PathBuf>,
        /// Start position in beats
        #[arg(long, default_value_t = 0.0)]
        from: f64,
    },
    /// Render audio files to a WAV file without a device
    Bounce {
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Record from the input device onto a new armed track
    Record {
        #[arg(short, long, default_value_t = 5.0)]
        seconds: f64,
        /// Hear the input while recording
        #[arg(long)]
        monitor: bool,
        /// Copy the take here once recording stops
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from(path)?,
            None => SessionConfig::load(),
        };
        if let Some(bpm) = self.bpm {
            config.bpm = bpm;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(frames) = self.buffer {
            config.buffer_frames = frames;
        }
        if self.output_device.is_some() {
            config.output_device = self.output_device.clone();
        }
        if self.input_device.is_some() {
            config.input_device = self.input_device.clone();
        }
        if self.exclusive {
            config.share_mode = StreamMode::Exclusive;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = cli.session_config()?;
    match cli.command {
        Commands::Devices => list_devices(config),
        Commands::Play { files, from } => play(config, &files, from),
        Commands::Bounce { files, output } => bounce(config, &files, &output),
        Commands::Record { seconds, monitor, output } => record(config, seconds, monitor, output.as_deref()),
    }
}

fn list_devices(config: SessionConfig) -> Result<()> {
    let session = Session::with_default_device(config)?;
    for device in session.devices()? {
        println!(
            "{:<6} {}{}  ({} ch, {} Hz)",
            if device.is_input { "input" } else { "output" },
            device.name,
            if device.is_default { " [default]" } else { "" },
            device.channels,
            device.default_sample_rate,
        );
    }
    Ok(())
}

/// One track per file, every clip starting at beat zero. Returns the timeline end in beats.
fn load_files(session: &Session, files: &[PathBuf]) -> Result<f64> {
    if files.is_empty() {
        bail!("no input files");
    }
    for path in files {
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let track = session.add_track(&name);
        session
            .add_clip_from_file(track, path, 0.0)
            .with_context(|| format!("loading {}", path.display()))?;
    }
    Ok(session.with_tracks(|tracks| tracks.iter().map(|t| t.end_time()).fold(0.0, f64::max)))
}

fn play(config: SessionConfig, files: &[PathBuf], from: f64) -> Result<()> {
    let session = Session::with_default_device(config)?;
    let end = load_files(&session, files)?;

    let format = session.start_device()?;
    info!(sample_rate = format.sample_rate, buffer = format.buffer_frames, "device started");

    session.seek(from.max(0.0));
    session.play()?;
    let mut last_bar = u32::MAX;
    while session.is_playing() && session.playhead() < end {
        let events = session.poll();
        if let Some(pos) = events.playhead {
            let position = session.format_position(pos);
            if position.bar != last_bar {
                last_bar = position.bar;
                println!("{position}");
            }
        }
        if events.dropped_record_frames > 0 {
            warn!(frames = events.dropped_record_frames, "input overrun");
        }
        if events.device_failed {
            bail!("audio device failed during playback");
        }
        thread::sleep(Duration::from_millis(20));
    }
    session.stop_device()?;
    Ok(())
}

fn bounce(config: SessionConfig, files: &[PathBuf], output: &Path) -> Result<()> {
    let session = Session::headless(config)?;
    load_files(&session, files)?;
    session.bounce(output)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn record(config: SessionConfig, seconds: f64, monitor: bool, output: Option<&Path>) -> Result<()> {
    let session = Session::with_default_device(config)?;
    let track = session.add_track("Take");
    session.set_track_armed(track, true)?;
    session.set_track_monitor(track, monitor)?;

    let format = session.start_device()?;
    if format.input_channels == 0 {
        bail!("no input device available");
    }
    info!(channels = format.input_channels, sample_rate = format.sample_rate, "recording");

    session.record()?;
    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while Instant::now() < deadline {
        let events = session.poll();
        if events.dropped_record_frames > 0 {
            warn!(frames = events.dropped_record_frames, "input overrun, take has gaps");
        }
        if events.device_failed {
            bail!("audio device failed while recording");
        }
        thread::sleep(Duration::from_millis(20));
    }

    let take = session.stop_device()?.context("recording produced no take")?;
    println!(
        "{}: {:.2} s at {} Hz",
        take.path.display(),
        take.frames as f64 / take.sample_rate as f64,
        take.sample_rate
    );
    if let Some(dest) = output {
        std::fs::copy(&take.path, dest).with_context(|| format!("copying take to {}", dest.display()))?;
        println!("copied to {}", dest.display());
    }
    Ok(())
}
