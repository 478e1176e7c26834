//! Real-time playback, recording and device I/O.
//!
//! [`EngineHandle`] lives on the control thread. It publishes track snapshots
//! and transport changes through [`EngineShared`], which the
//! [`PlaybackEngine`] reads from the audio thread without locking. An
//! [`AudioBridge`] owns the device and drives the processor.

mod atomic;
mod bridge;
mod cpal_backend;
mod handle;
mod mix;
mod null_backend;
mod processor;
mod record;
mod state;

pub use bridge::{AudioBackend, AudioBridge, BridgeError, DeviceInfo, ShareMode, StreamFormat, StreamRequest};
pub use cpal_backend::CpalBackend;
pub use handle::{BpmListener, EngineHandle, MAX_BPM, MIN_BPM, TransportError};
pub use null_backend::{Clock, NullBackend};
pub use processor::{PlaybackEngine, ProcessorConfig};
pub use record::RecordedTake;
pub use state::{EngineShared, TransportState};
