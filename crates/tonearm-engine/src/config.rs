//! Engine configuration loaded from TOML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tonearm_types::{ComponentName, DEFAULT_BUFFER_FRAMES, PCM_PACKET_PERIOD};

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directories scanned for plugin libraries.
    pub plugin_dirs: Vec<PathBuf>,
    /// Parent of per-module resource directories.
    pub data_dir: PathBuf,
    /// Root of the persisted settings store. In-memory settings when absent.
    pub settings_dir: Option<PathBuf>,
    /// PCM buffer capacity in frames.
    pub buffer_frames: u64,
    /// Stream input used for playback (`module/component`).
    pub input: Option<ComponentName>,
    /// Stream output used for playback (`module/component`).
    pub output: Option<ComponentName>,
    /// Sound processors applied in order.
    pub dsp: Vec<ComponentName>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: vec![PathBuf::from("plugins")],
            data_dir: PathBuf::from("data"),
            settings_dir: None,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            input: None,
            output: None,
            dsp: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml_str(&text).with_context(|| format!("parse config {:?}", path))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        Ok(config.normalized())
    }

    /// Smallest buffer that still holds two packet periods.
    pub fn min_buffer_frames() -> u64 {
        PCM_PACKET_PERIOD * 2
    }

    fn normalized(mut self) -> Self {
        let min = Self::min_buffer_frames();
        if self.buffer_frames < min {
            tracing::warn!(
                configured = self.buffer_frames,
                min,
                "buffer_frames too small; using minimum"
            );
            self.buffer_frames = min;
        }
        self
    }
}
