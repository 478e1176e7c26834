use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use daw_engine::{ShareMode, StreamRequest};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Shared,
    Exclusive,
}

impl From<StreamMode> for ShareMode {
    fn from(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Shared => ShareMode::Shared,
            StreamMode::Exclusive => ShareMode::Exclusive,
        }
    }
}

/// Engine settings, read from `engine.toml`. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub bpm: f64,
    pub sample_rate: u32,
    pub buffer_frames: u32,
    /// Device names; `None` uses the system default.
    pub output_device: Option<String>,
    pub input_device: Option<String>,
    pub input_channels: u16,
    pub share_mode: StreamMode,
    pub job_queue_capacity: usize,
    pub history_capacity: usize,
    pub record_dir: PathBuf,
    /// Shortest length, in beats, a resize may leave a clip with.
    pub min_clip_length: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            sample_rate: 48_000,
            buffer_frames: 512,
            output_device: None,
            input_device: None,
            input_channels: 1,
            share_mode: StreamMode::Shared,
            job_queue_capacity: daw_jobs::DEFAULT_CAPACITY,
            history_capacity: 128,
            record_dir: std::env::temp_dir().join("daw-takes"),
            min_clip_length: 0.25,
        }
    }
}

impl SessionConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("daw").join("engine.toml"))
    }

    /// Load from the default location. A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load_from(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), "ignoring config: {err:#}");
            Self::default()
        })
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            sample_rate: self.sample_rate,
            buffer_frames: self.buffer_frames,
            output_channels: 2,
            input_channels: self.input_channels,
            mode: self.share_mode.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "bpm = 90.0\nshare_mode = \"exclusive\"\n").unwrap();

        let config = SessionConfig::load_from(&path).unwrap();
        assert_eq!(config.bpm, 90.0);
        assert_eq!(config.share_mode, StreamMode::Exclusive);
        assert_eq!(config.buffer_frames, 512);
        assert_eq!(config.history_capacity, 128);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");
        let config = SessionConfig {
            output_device: Some("Speakers".into()),
            min_clip_length: 0.5,
            ..SessionConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(SessionConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "bpm = \"fast\"").unwrap();
        assert!(SessionConfig::load_from(&path).is_err());
    }
}
