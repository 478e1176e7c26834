use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::bridge::{AudioBackend, BridgeError, DeviceInfo, StreamFormat, StreamRequest};
use crate::processor::PlaybackEngine;

/// How the headless audio thread paces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// One buffer per buffer period, like a real device.
    Realtime,
    /// As fast as possible.
    Fast,
}

const DEVICE_NAME: &str = "null";

/// Backend with no hardware behind it. Renders on its own thread and can
/// feed a constant input level and capture everything it renders.
pub struct NullBackend {
    clock: Clock,
    input_level: f32,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
    failure: Arc<AtomicBool>,
    opened: bool,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NullBackend {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            input_level: 0.0,
            capture: None,
            failure: Arc::new(AtomicBool::new(false)),
            opened: false,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Every input sample reads as `level`.
    pub fn with_input_level(mut self, level: f32) -> Self {
        self.input_level = level;
        self
    }

    /// Append interleaved output to `sink`.
    pub fn with_capture(mut self, sink: Arc<Mutex<Vec<f32>>>) -> Self {
        self.capture = Some(sink);
        self
    }

    /// Setting `flag` makes the device go away: the thread stops rendering
    /// and [`AudioBackend::has_failed`] reports it until the next start.
    pub fn with_failure(mut self, flag: Arc<AtomicBool>) -> Self {
        self.failure = flag;
        self
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BridgeError> {
        let device = |is_input| DeviceInfo {
            name: DEVICE_NAME.to_string(),
            is_input,
            is_default: true,
            channels: 2,
            default_sample_rate: 48_000,
        };
        Ok(vec![device(true), device(false)])
    }

    fn open(&mut self, input: Option<&str>, output: Option<&str>) -> Result<(), BridgeError> {
        for name in [input, output].into_iter().flatten() {
            if name != DEVICE_NAME {
                return Err(BridgeError::DeviceNotFound(name.to_string()));
            }
        }
        self.opened = true;
        Ok(())
    }

    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamFormat, BridgeError> {
        if !self.opened {
            return Err(BridgeError::NotOpen);
        }
        if request.sample_rate == 0 || request.output_channels == 0 {
            return Err(BridgeError::Format(format!(
                "{} Hz with {} output channels",
                request.sample_rate, request.output_channels
            )));
        }
        // Exclusive and shared mode behave the same without hardware.
        Ok(StreamFormat {
            sample_rate: request.sample_rate,
            buffer_frames: request.buffer_frames.clamp(16, 8192),
            output_channels: request.output_channels,
            input_channels: request.input_channels,
        })
    }

    fn start(&mut self, format: &StreamFormat, mut engine: PlaybackEngine) -> Result<(), BridgeError> {
        if self.running.load(Ordering::Acquire) {
            return Err(BridgeError::Running);
        }
        self.failure.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let running = self.running.clone();
        let failure = self.failure.clone();
        let clock = self.clock;
        let level = self.input_level;
        let capture = self.capture.clone();
        let format = *format;

        let thread = std::thread::Builder::new()
            .name("daw-audio-null".into())
            .spawn(move || {
                let frames = format.buffer_frames as usize;
                let channels = format.output_channels as usize;
                let period = Duration::from_secs_f64(frames as f64 / format.sample_rate as f64);
                let mut output = vec![0.0f32; frames * channels];
                let mut next = Instant::now();

                while running.load(Ordering::Acquire) {
                    if failure.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    for plane in engine.inputs_mut() {
                        plane[..frames].fill(level);
                    }
                    engine.process(frames, format.sample_rate);

                    if let Some(sink) = &capture {
                        let outputs = engine.outputs();
                        for (frame, samples) in output.chunks_mut(channels).enumerate() {
                            for (channel, sample) in samples.iter_mut().enumerate() {
                                *sample = outputs[channel][frame];
                            }
                        }
                        sink.lock().extend_from_slice(&output);
                    }

                    if clock == Clock::Realtime {
                        next += period;
                        if let Some(wait) = next.checked_duration_since(Instant::now()) {
                            std::thread::sleep(wait);
                        }
                    } else {
                        std::thread::yield_now();
                    }
                }
                debug!("null audio thread exiting");
            })
            .map_err(|err| {
                self.running.store(false, Ordering::Release);
                BridgeError::backend(err)
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("null audio thread panicked");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn has_failed(&self) -> bool {
        self.failure.load(Ordering::Acquire)
    }
}
