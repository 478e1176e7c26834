use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedBufferSize};
use crossbeam_channel::Sender;
use tracing::{debug, error, warn};

use crate::bridge::{AudioBackend, BridgeError, DeviceInfo, ShareMode, StreamFormat, StreamRequest};
use crate::processor::PlaybackEngine;

/// Device buffers of input held between the input and output callbacks.
const INPUT_RING_BUFFERS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    output: SampleFormat,
    input: Option<SampleFormat>,
}

struct Running {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Hardware backend on the platform's default cpal host.
///
/// cpal streams are not `Send`, so they are built, played and dropped on a
/// dedicated I/O thread; only device names live here.
pub struct CpalBackend {
    input: Option<String>,
    output: Option<String>,
    opened: bool,
    negotiated: Option<Negotiated>,
    failed: Arc<AtomicBool>,
    running: Option<Running>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            input: None,
            output: None,
            opened: false,
            negotiated: None,
            failed: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }
}

fn find_output(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, BridgeError> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| BridgeError::DeviceNotFound("default output".into())),
        Some(name) => host
            .output_devices()
            .map_err(BridgeError::backend)?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| BridgeError::DeviceNotFound(name.to_string())),
    }
}

fn find_input(host: &cpal::Host, name: Option<&str>) -> Result<Option<cpal::Device>, BridgeError> {
    match name {
        None => Ok(host.default_input_device()),
        Some(name) => host
            .input_devices()
            .map_err(BridgeError::backend)?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .map(Some)
            .ok_or_else(|| BridgeError::DeviceNotFound(name.to_string())),
    }
}

fn check_format(format: SampleFormat) -> Result<SampleFormat, BridgeError> {
    match format {
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 => Ok(format),
        other => Err(BridgeError::Format(format!("sample format '{other}'"))),
    }
}

fn supports_rate(ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>, channels: u16, rate: u32) -> bool {
    ranges
        .filter(|r| r.channels() >= channels)
        .any(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BridgeError> {
        let host = cpal::default_host();
        let default_out = host.default_output_device().and_then(|d| d.name().ok());
        let default_in = host.default_input_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        for device in host.output_devices().map_err(BridgeError::backend)? {
            let (Ok(name), Ok(config)) = (device.name(), device.default_output_config()) else {
                continue;
            };
            devices.push(DeviceInfo {
                is_default: default_out.as_deref() == Some(name.as_str()),
                name,
                is_input: false,
                channels: config.channels(),
                default_sample_rate: config.sample_rate().0,
            });
        }
        for device in host.input_devices().map_err(BridgeError::backend)? {
            let (Ok(name), Ok(config)) = (device.name(), device.default_input_config()) else {
                continue;
            };
            devices.push(DeviceInfo {
                is_default: default_in.as_deref() == Some(name.as_str()),
                name,
                is_input: true,
                channels: config.channels(),
                default_sample_rate: config.sample_rate().0,
            });
        }
        Ok(devices)
    }

    fn open(&mut self, input: Option<&str>, output: Option<&str>) -> Result<(), BridgeError> {
        let host = cpal::default_host();
        find_output(&host, output)?;
        find_input(&host, input)?;
        self.input = input.map(str::to_string);
        self.output = output.map(str::to_string);
        self.negotiated = None;
        self.opened = true;
        Ok(())
    }

    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamFormat, BridgeError> {
        if !self.opened {
            return Err(BridgeError::NotOpen);
        }
        if request.mode == ShareMode::Exclusive {
            return Err(BridgeError::ModeUnsupported(request.mode));
        }

        let host = cpal::default_host();
        let output = find_output(&host, self.output.as_deref())?;
        let default = output.default_output_config().map_err(BridgeError::backend)?;
        let output_format = check_format(default.sample_format())?;

        let ranges = output.supported_output_configs().map_err(BridgeError::backend)?;
        let (sample_rate, output_channels) = if supports_rate(ranges, request.output_channels, request.sample_rate) {
            (request.sample_rate, request.output_channels)
        } else {
            warn!(
                requested = request.sample_rate,
                using = default.sample_rate().0,
                "falling back to the device's default format"
            );
            (default.sample_rate().0, default.channels())
        };

        let buffer_frames = match default.buffer_size() {
            SupportedBufferSize::Range { min, max } => request.buffer_frames.clamp(*min, (*max).max(*min)),
            SupportedBufferSize::Unknown => request.buffer_frames,
        };

        let mut input_channels = 0;
        let mut input_format = None;
        if request.input_channels > 0 {
            match find_input(&host, self.input.as_deref())? {
                Some(device) => {
                    let config = device.default_input_config().map_err(BridgeError::backend)?;
                    let channels = request.input_channels.min(config.channels());
                    let rate_ok = device
                        .supported_input_configs()
                        .is_ok_and(|ranges| supports_rate(ranges, channels, sample_rate));
                    if rate_ok {
                        input_format = Some(check_format(config.sample_format())?);
                        input_channels = channels;
                    } else {
                        warn!(sample_rate, "input device cannot run at the output rate, recording disabled");
                    }
                }
                None => warn!("no input device, recording disabled"),
            }
        }

        self.negotiated = Some(Negotiated {
            output: output_format,
            input: input_format,
        });
        Ok(StreamFormat {
            sample_rate,
            buffer_frames,
            output_channels,
            input_channels,
        })
    }

    fn start(&mut self, format: &StreamFormat, engine: PlaybackEngine) -> Result<(), BridgeError> {
        if self.running.is_some() {
            return Err(BridgeError::Running);
        }
        let negotiated = self.negotiated.ok_or(BridgeError::NotOpen)?;
        let input = self.input.clone();
        let output = self.output.clone();
        let format = *format;
        let failed = self.failed.clone();
        failed.store(false, Ordering::Relaxed);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("daw-audio-io".into())
            .spawn(move || {
                let streams = open_streams(input.as_deref(), output.as_deref(), &format, negotiated, engine, failed);
                match streams {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        // Returns on stop() or when the sender is dropped.
                        let _ = stop_rx.recv();
                        drop(streams);
                        debug!("audio io thread exiting");
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .map_err(BridgeError::backend)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.running = Some(Running { stop: stop_tx, thread });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BridgeError::backend(anyhow::anyhow!("audio io thread exited during startup")))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
            if running.thread.join().is_err() {
                error!("audio io thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Set by the stream error callbacks.
    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Build and start the streams. Input (if any) starts first so the output
/// callback finds data waiting.
fn open_streams(
    input: Option<&str>,
    output: Option<&str>,
    format: &StreamFormat,
    negotiated: Negotiated,
    engine: PlaybackEngine,
    failed: Arc<AtomicBool>,
) -> Result<Vec<cpal::Stream>, BridgeError> {
    let host = cpal::default_host();
    let mut streams = Vec::with_capacity(2);

    let mut input_rx = None;
    if let Some(sample_format) = negotiated.input
        && format.input_channels > 0
        && let Some(device) = find_input(&host, input)?
    {
        let config = cpal::StreamConfig {
            channels: format.input_channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(format.buffer_frames),
        };
        let capacity = format.buffer_frames as usize * format.input_channels as usize * INPUT_RING_BUFFERS;
        let (tx, rx) = rtrb::RingBuffer::new(capacity);
        let stream = match sample_format {
            SampleFormat::I16 => build_input::<i16>(&device, &config, tx, failed.clone())?,
            SampleFormat::U16 => build_input::<u16>(&device, &config, tx, failed.clone())?,
            _ => build_input::<f32>(&device, &config, tx, failed.clone())?,
        };
        stream.play().map_err(BridgeError::backend)?;
        streams.push(stream);
        input_rx = Some(rx);
    }

    let device = find_output(&host, output)?;
    let config = cpal::StreamConfig {
        channels: format.output_channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(format.buffer_frames),
    };
    let stream = match negotiated.output {
        SampleFormat::I16 => build_output::<i16>(&device, &config, engine, input_rx, failed)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, engine, input_rx, failed)?,
        _ => build_output::<f32>(&device, &config, engine, input_rx, failed)?,
    };
    stream.play().map_err(BridgeError::backend)?;
    streams.push(stream);
    Ok(streams)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut tx: rtrb::Producer<f32>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, BridgeError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    if tx.push(f32::from_sample(sample)).is_err() {
                        break;
                    }
                }
            },
            move |err| {
                error!(%err, "input stream error");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(BridgeError::backend)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: PlaybackEngine,
    mut input_rx: Option<rtrb::Consumer<f32>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, BridgeError>
where
    T: SizedSample + FromSample<f32>,
{
    let out_channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;
    let processor = engine.config();
    let mut captured = vec![0.0f32; processor.max_frames * processor.input_channels];
    let mut rendered = vec![0.0f32; processor.max_frames.max(1) * out_channels];
    let mut primed = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if !primed {
                    data.iter_mut().for_each(|s| *s = T::from_sample(0.0f32));
                    primed = true;
                    return;
                }
                for block in data.chunks_mut(rendered.len()) {
                    let frames = block.len() / out_channels;
                    let input = &mut captured[..frames * processor.input_channels];
                    match input_rx.as_mut() {
                        Some(rx) => input.iter_mut().for_each(|s| *s = rx.pop().unwrap_or(0.0)),
                        None => input.fill(0.0),
                    }
                    let output = &mut rendered[..frames * out_channels];
                    engine.process_interleaved(input, output, sample_rate);
                    for (dst, &src) in block.iter_mut().zip(output.iter()) {
                        *dst = T::from_sample(src);
                    }
                }
            },
            move |err| {
                error!(%err, "output stream error");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(BridgeError::backend)
}
