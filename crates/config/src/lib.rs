//! Configuration for the callbridge server.
//!
//! Settings are layered: `config/default.yaml`, then `config/{env}.yaml`,
//! then `CALLBRIDGE_`-prefixed environment variables. Tunables that the
//! pipeline depends on at compile time live in [`constants`].

pub mod constants;
mod settings;

pub use settings::{
    EmbeddingConfig, IngestionConfig, LivekitConfig, LlmSettings, ObservabilityConfig,
    PersistenceConfig, RagConfig, RuntimeEnvironment, ServerConfig, Settings, SttSettings,
    TelephonyConfig, TtsSettings, load_settings,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
