use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(io::Error),
    #[error(transparent)]
    Toml(toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeviceConfig {
    /// Enables layout, dynamic offset and subresource state checks.
    ///
    /// Defaults to `true` in debug builds.
    pub validation: bool,
    pub encoder_model: EncoderModel,
    pub completion: CompletionMode,
    /// Maximum number of bytes of native memory. `None` is unbounded.
    pub memory_budget: Option<u64>,
    pub staging: StagingConfig,
    pub descriptors: DescriptorConfig,
}

impl DeviceConfig {
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path).map_err(ConfigError::Io)?;

        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(ConfigError::Io)?;

        Self::from_toml(&buf)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Toml)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            encoder_model: EncoderModel::default(),
            completion: CompletionMode::default(),
            memory_budget: None,
            staging: StagingConfig::default(),
            descriptors: DescriptorConfig::default(),
        }
    }
}

/// How native work is grouped into passes and encoders.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderModel {
    /// One command buffer with explicit render passes and layout barriers.
    #[default]
    Unified,
    /// Separate render, blit and compute encoders. Bindings do not survive
    /// an encoder switch.
    Split,
}

/// How completed submissions are observed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Fences are checked on submit and on every wait.
    #[default]
    Polling,
    /// The native queue runs the completion handler on its worker thread.
    Callback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StagingConfig {
    /// Minimum size in bytes of a newly created staging buffer.
    pub min_buffer_size: u64,
    /// Minimum width and height of a newly created staging texture.
    pub min_texture_dimension: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 64,
            min_texture_dimension: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DescriptorConfig {
    /// Number of resource sets per descriptor block.
    pub max_sets: u32,
    /// Number of descriptors of every kind per descriptor block.
    pub per_kind: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            max_sets: 1000,
            per_kind: 100,
        }
    }
}
