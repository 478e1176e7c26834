//! Background writer for captured input.
//!
//! The audio thread pushes interleaved frames into an SPSC ring; a job on the
//! recorder's own queue drains it every few milliseconds and appends to a
//! 32-bit float WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use daw_jobs::{DeferredJobQueue, JobContext, JobHandle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::handle::TransportError;

const DRAIN_INTERVAL: Duration = Duration::from_millis(5);

type WavFile = hound::WavWriter<BufWriter<File>>;
type TakeResult = Arc<Mutex<Option<anyhow::Result<RecordedTake>>>>;

/// A finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTake {
    pub path: PathBuf,
    /// Beat of the first recorded frame.
    pub start_beat: f64,
    pub frames: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

struct ActiveTake {
    job: JobHandle,
    result: TakeResult,
}

/// Owns the writer thread, which is only spawned by the first take.
pub(crate) struct Recorder {
    jobs: Option<DeferredJobQueue>,
    dir: PathBuf,
    consumer: Arc<Mutex<Option<rtrb::Consumer<f32>>>>,
    sample_rate: u32,
    channels: u16,
    active: Option<ActiveTake>,
    takes: u32,
}

impl Recorder {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            jobs: None,
            dir,
            consumer: Arc::new(Mutex::new(None)),
            sample_rate: 0,
            channels: 0,
            active: None,
            takes: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Attach the read side of a freshly created processor's record ring.
    pub fn install(&mut self, consumer: rtrb::Consumer<f32>, sample_rate: u32, channels: u16) {
        *self.consumer.lock() = Some(consumer);
        self.sample_rate = sample_rate;
        self.channels = channels;
    }

    /// Whether there is an input stream to record from.
    pub fn has_input(&self) -> bool {
        self.channels > 0 && self.sample_rate > 0 && self.consumer.lock().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn spawn_writer(&mut self) -> std::io::Result<()> {
        if self.jobs.is_none() {
            self.jobs = Some(DeferredJobQueue::with_name("daw-recorder", 4)?);
        }
        Ok(())
    }

    /// Create the take file and start draining into it.
    pub fn start(&mut self, start_beat: f64) -> anyhow::Result<()> {
        if self.active.is_some() {
            bail!("a take is already being recorded");
        }
        if !self.has_input() {
            bail!("no input stream to record from");
        }
        self.spawn_writer().context("spawning recorder thread")?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating record directory {}", self.dir.display()))?;

        let Some(mut consumer) = self.consumer.lock().take() else {
            bail!("no input stream to record from");
        };

        self.takes += 1;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let path = self.dir.join(format!("take-{stamp}-{:03}.wav", self.takes));

        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = match hound::WavWriter::create(&path, spec) {
            Ok(writer) => writer,
            Err(err) => {
                *self.consumer.lock() = Some(consumer);
                return Err(err).with_context(|| format!("creating take file {}", path.display()));
            }
        };

        // Anything left over from a previous pass is stale.
        consumer.read_chunk(consumer.slots()).map(|c| c.commit_all()).ok();

        let result: TakeResult = Arc::new(Mutex::new(None));
        let job_result = result.clone();
        let slot = self.consumer.clone();
        let mut take = RecordedTake {
            path: path.clone(),
            start_beat,
            frames: 0,
            sample_rate: self.sample_rate,
            channels: self.channels,
        };

        let Some(jobs) = &self.jobs else {
            bail!("recorder thread is not running");
        };
        let job = jobs.enqueue(move |ctx: &JobContext<'_>| {
            let outcome = write_take(ctx, &mut consumer, writer, take.channels).map(|frames| {
                take.frames = frames;
                take
            });
            let mut returned = slot.lock();
            if returned.is_none() {
                *returned = Some(consumer);
            }
            drop(returned);
            *job_result.lock() = Some(outcome);
        });

        info!(path = %path.display(), start_beat, "recording started");
        self.active = Some(ActiveTake { job, result });
        Ok(())
    }

    /// Signal the writer to finish and wait up to `timeout` for the file to
    /// be closed. `None` when nothing was being recorded.
    ///
    /// A writer that misses the deadline keeps running and hands the ring
    /// back when it is done; until then [`has_input`](Self::has_input) is false.
    pub fn finish(&mut self, timeout: Duration) -> Option<Result<RecordedTake, TransportError>> {
        let active = self.active.take()?;
        let Some(jobs) = &self.jobs else {
            return Some(Err(TransportError::Record {
                source: anyhow!("recorder thread is not running"),
            }));
        };
        jobs.stop(active.job);
        if !jobs.wait(active.job, timeout) {
            warn!(?timeout, "recorder did not flush in time, abandoning take");
            return Some(Err(TransportError::RecorderTimeout(timeout)));
        }
        let outcome = active.result.lock().take();
        Some(
            outcome
                .unwrap_or_else(|| Err(anyhow!("recorder job produced no result")))
                .map_err(|source| TransportError::Record { source }),
        )
    }
}

/// Drain until cancelled, then once more, then finalize. Returns frames written.
fn write_take(
    ctx: &JobContext<'_>,
    consumer: &mut rtrb::Consumer<f32>,
    mut writer: WavFile,
    channels: u16,
) -> anyhow::Result<u64> {
    let mut samples = 0u64;
    loop {
        let cancelled = ctx.is_cancelled();
        samples += drain(consumer, &mut writer)?;
        if cancelled {
            break;
        }
        std::thread::sleep(DRAIN_INTERVAL);
    }
    writer.finalize().context("finalizing take")?;
    let frames = samples / channels.max(1) as u64;
    debug!(frames, "take written");
    Ok(frames)
}

fn drain(consumer: &mut rtrb::Consumer<f32>, writer: &mut WavFile) -> anyhow::Result<u64> {
    let available = consumer.slots();
    if available == 0 {
        return Ok(0);
    }
    let chunk = consumer.read_chunk(available)?;
    let (first, second) = chunk.as_slices();
    for &sample in first.iter().chain(second) {
        writer.write_sample(sample)?;
    }
    chunk.commit_all();
    Ok(available as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;

    fn takes_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map_or(0, |entries| entries.count())
    }

    #[test]
    fn drains_ring_into_wav() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path().to_path_buf());
        let (mut tx, rx) = rtrb::RingBuffer::new(4096);
        recorder.install(rx, 48_000, 2);
        assert!(recorder.has_input());

        recorder.start(4.0).unwrap();
        assert!(!recorder.has_input());
        for i in 0..1000 {
            tx.push(i as f32 / 1000.0).unwrap();
        }

        let take = recorder.finish(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(take.frames, 500);
        assert_eq!(take.start_beat, 4.0);
        assert!(recorder.has_input());

        let reader = hound::WavReader::open(&take.path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.into_samples::<f32>().map(Result::unwrap).collect();
        assert_eq!(samples.len(), 1000);
        assert_eq!(samples[999], 0.999);
    }

    #[test]
    fn start_without_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let takes = dir.path().join("takes");
        let mut recorder = Recorder::new(takes.clone());
        assert!(recorder.start(0.0).is_err());
        assert!(recorder.finish(Duration::from_millis(10)).is_none());
        assert!(!takes.exists());
    }

    #[test]
    fn writer_thread_is_spawned_by_the_first_take() {
        let dir = tempfile::tempdir().unwrap();
        let takes = dir.path().join("takes");
        let mut recorder = Recorder::new(takes.clone());
        let (_tx, rx) = rtrb::RingBuffer::new(64);
        recorder.install(rx, 48_000, 1);
        assert!(recorder.jobs.is_none());
        assert!(!takes.exists());

        recorder.start(0.0).unwrap();
        assert!(recorder.jobs.is_some());
        recorder.finish(Duration::from_secs(5)).unwrap().unwrap();
    }

    #[test]
    fn second_start_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path().to_path_buf());
        let (_tx, rx) = rtrb::RingBuffer::new(64);
        recorder.install(rx, 48_000, 1);

        recorder.start(0.0).unwrap();
        assert_eq!(takes_in(dir.path()), 1);
        assert!(recorder.start(1.0).is_err());
        assert_eq!(takes_in(dir.path()), 1);

        recorder.finish(Duration::from_secs(5)).unwrap().unwrap();
        recorder.start(3.0).unwrap();
        assert_eq!(takes_in(dir.path()), 2);
        recorder.finish(Duration::from_secs(5)).unwrap().unwrap();
    }

    #[test]
    fn finish_gives_up_on_a_stuck_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path().to_path_buf());
        let (_tx, rx) = rtrb::RingBuffer::new(64);
        recorder.install(rx, 48_000, 1);
        recorder.spawn_writer().unwrap();

        // Occupy the writer thread so the take job cannot run.
        let gate = Arc::new(AtomicBool::new(false));
        let blocker = {
            let gate = gate.clone();
            recorder.jobs.as_ref().unwrap().enqueue(move |_: &JobContext<'_>| {
                while !gate.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        recorder.start(0.0).unwrap();

        let started = Instant::now();
        let outcome = recorder.finish(Duration::from_millis(50)).unwrap();
        assert!(matches!(outcome, Err(TransportError::RecorderTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!recorder.is_active());
        assert!(!recorder.has_input());

        gate.store(true, Ordering::Release);
        let jobs = recorder.jobs.as_ref().unwrap();
        assert!(jobs.wait(blocker, Duration::from_secs(5)));
        jobs.wait_all();
        assert!(recorder.has_input());
    }
}
