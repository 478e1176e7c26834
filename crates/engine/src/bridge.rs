//! Device side of the engine: a backend owns the audio thread and calls
//! [`PlaybackEngine::process`] once per device buffer.

use thiserror::Error;
use tracing::info;

use crate::handle::{EngineHandle, TransportError};
use crate::processor::{PlaybackEngine, ProcessorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareMode {
    #[default]
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub channels: u16,
    pub default_sample_rate: u32,
}

/// What the caller would like; backends adjust it to what the device can do.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub output_channels: u16,
    /// `0` for playback only.
    pub input_channels: u16,
    pub mode: ShareMode,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_frames: 512,
            output_channels: 2,
            input_channels: 1,
            mode: ShareMode::Shared,
        }
    }
}

/// The negotiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub output_channels: u16,
    pub input_channels: u16,
}

impl StreamFormat {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            sample_rate: self.sample_rate,
            max_frames: self.buffer_frames as usize,
            input_channels: self.input_channels as usize,
            output_channels: self.output_channels as usize,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("no audio device is open")]
    NotOpen,
    #[error("stream must be stopped before it can be reconfigured")]
    Running,
    #[error("{0:?} mode is not supported by this backend")]
    ModeUnsupported(ShareMode),
    #[error("unsupported stream format: {0}")]
    Format(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("audio backend error: {source}")]
    Backend { source: anyhow::Error },
}

impl BridgeError {
    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        BridgeError::Backend { source: source.into() }
    }
}

/// A native audio API. Implementations own the real-time thread.
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    fn devices(&self) -> Result<Vec<DeviceInfo>, BridgeError>;

    /// Select devices by name; `None` picks the system default.
    fn open(&mut self, input: Option<&str>, output: Option<&str>) -> Result<(), BridgeError>;

    /// Settle on a format the opened devices support.
    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamFormat, BridgeError>;

    /// Spawn the audio thread, prime the device with silence and start
    /// calling `engine.process` once per buffer.
    fn start(&mut self, format: &StreamFormat, engine: PlaybackEngine) -> Result<(), BridgeError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// The running stream hit an unrecoverable error, e.g. the device was
    /// unplugged. Cleared by the next `start`.
    fn has_failed(&self) -> bool;
}

/// Owns a backend and the requested stream settings, and connects it to an
/// engine. Format changes need a full stop/configure/start cycle.
pub struct AudioBridge {
    backend: Box<dyn AudioBackend>,
    request: StreamRequest,
    format: Option<StreamFormat>,
}

impl AudioBridge {
    pub fn new(backend: Box<dyn AudioBackend>, request: StreamRequest) -> Self {
        Self {
            backend,
            request,
            format: None,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>, BridgeError> {
        self.backend.devices()
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Format of the running stream.
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }

    /// Whether the running stream died underneath us. The caller is expected
    /// to [`stop`](Self::stop) the bridge, which clears this.
    pub fn has_failed(&self) -> bool {
        self.backend.is_running() && self.backend.has_failed()
    }

    pub fn configure(&mut self, request: StreamRequest) -> Result<(), BridgeError> {
        if self.backend.is_running() {
            return Err(BridgeError::Running);
        }
        self.request = request;
        Ok(())
    }

    pub fn open(&mut self, input: Option<&str>, output: Option<&str>) -> Result<(), BridgeError> {
        if self.backend.is_running() {
            return Err(BridgeError::Running);
        }
        self.backend.open(input, output)
    }

    /// Negotiate, build a processor for the agreed format and start streaming.
    pub fn start(&mut self, engine: &mut EngineHandle) -> Result<StreamFormat, BridgeError> {
        if self.backend.is_running() {
            return Err(BridgeError::Running);
        }
        let format = self.backend.negotiate(&self.request)?;
        let processor = engine.create_processor(format.processor_config())?;
        self.backend.start(&format, processor)?;
        engine.shared().set_device_open(true);
        info!(backend = self.backend.name(), ?format, "audio stream started");
        self.format = Some(format);
        Ok(format)
    }

    pub fn stop(&mut self, engine: &EngineHandle) {
        if self.backend.is_running() {
            self.backend.stop();
            info!(backend = self.backend.name(), "audio stream stopped");
        }
        engine.shared().set_device_open(false);
        self.format = None;
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.backend.stop();
    }
}
