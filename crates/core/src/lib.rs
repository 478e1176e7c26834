pub mod config;
pub mod history;
pub mod session;
pub mod time;

pub use config::{SessionConfig, StreamMode};
pub use history::{Change, Command, CommandHistory, CommandKind};
pub use session::{ClipRef, EditError, Session, SessionEvents};
pub use time::{MusicalPosition, TimeContext, TimeSignature};

pub use daw_decode::{AssetCache, AssetError, MidiNote, SampleAsset};
pub use daw_engine::{
    AudioBackend, Clock, CpalBackend, DeviceInfo, NullBackend, RecordedTake, ShareMode, StreamFormat, TransportState,
};
pub use daw_render::{AudioBuffer, render_timeline, write_wav};
pub use daw_transport::{Clip, ClipContent, PPQN, Track, TrackId};
