//! Runtime configuration. Settings are read from an optional TOML file and
//! then overridden by `RPS__<SECTION>__<KEY>` environment variables

use crate::decoder::PixelScale;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;

/// Default configuration file, used when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "rps.toml";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "RPS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub decoder: DecoderSettings,
    pub log: LogSettings,
    pub train: TrainSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Largest accepted JSON body, in bytes
    pub max_payload_bytes: usize,

    /// Serve this file at `/` instead of the built-in capture page
    pub static_page: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5001,
            max_payload_bytes: 8 * 1024 * 1024,
            static_page: None,
        }
    }
}

/// Which tch backend runs the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A serialized TorchScript module
    TorchScript,

    /// `RpsNet` weights written by the trainer
    Native,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub backend: Backend,

    /// Permute NHWC input to NCHW before calling a TorchScript module
    pub channels_first: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: "rps_model.pt".into(),
            backend: Backend::TorchScript,
            channels_first: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    pub pixel_scale: PixelScale,

    /// Source images wider or taller than this are rejected
    pub max_dimension: u32,

    /// Upper bound on the bytes a codec may allocate for one frame. The
    /// effective budget is the smaller of this and `max_dimension² × 4`
    pub max_alloc_bytes: u64,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            pixel_scale: PixelScale::Raw,
            max_dimension: 4096,
            max_alloc_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// An `EnvFilter` directive
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    pub dataset_dir: PathBuf,
    pub output: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,

    /// Fraction of each class held out for validation
    pub validation_split: f64,

    /// Write per-epoch metrics here as JSON
    pub history: Option<PathBuf>,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            dataset_dir: "./dataset".into(),
            output: "rps_model.ot".into(),
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            validation_split: 0.2,
            history: None,
        }
    }
}

impl Settings {
    /// Load settings from `path` (which may not exist) and the environment
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        Self::build(builder)
    }

    /// Load settings from an in-memory TOML document, ignoring the environment
    pub fn from_toml(doc: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(doc, FileFormat::Toml)))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "must be non-zero"));
        }
        if self.decoder.max_dimension == 0 {
            return Err(invalid("decoder.max_dimension", "must be non-zero"));
        }
        if self.decoder.max_alloc_bytes == 0 {
            return Err(invalid("decoder.max_alloc_bytes", "must be non-zero"));
        }
        if self.train.epochs == 0 {
            return Err(invalid("train.epochs", "must be non-zero"));
        }
        if self.train.batch_size == 0 {
            return Err(invalid("train.batch_size", "must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.train.validation_split) {
            return Err(invalid(
                "train.validation_split",
                format!("{} is outside [0, 1)", self.train.validation_split),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
