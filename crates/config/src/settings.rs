//! Main settings module.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{endpoints, ingestion, rag, telephony};
use crate::ConfigError;

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub livekit: LivekitConfig,

    #[serde(default)]
    pub telephony: TelephonyConfig,

    #[serde(default)]
    pub stt: SttSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Dashboard origins allowed by CORS. Empty means permissive (dev).
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origins: Vec::new(),
            cors_enabled: true,
        }
    }
}

/// LiveKit control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivekitConfig {
    #[serde(default = "default_livekit_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// SIP trunk used for outbound participants.
    #[serde(default)]
    pub sip_trunk_id: String,
}

fn default_livekit_url() -> String {
    endpoints::LIVEKIT_DEFAULT.to_string()
}

impl Default for LivekitConfig {
    fn default() -> Self {
        Self {
            url: default_livekit_url(),
            api_key: String::new(),
            api_secret: String::new(),
            sip_trunk_id: String::new(),
        }
    }
}

/// Call admission and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,
    #[serde(default = "default_max_call_duration")]
    pub max_call_duration_secs: u64,
}

fn default_max_concurrent() -> usize {
    telephony::MAX_CONCURRENT_CALLS
}

fn default_ring_timeout() -> u64 {
    telephony::RING_TIMEOUT_SECS
}

fn default_max_call_duration() -> u64 {
    telephony::MAX_CALL_DURATION_SECS
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent(),
            ring_timeout_secs: default_ring_timeout(),
            max_call_duration_secs: default_max_call_duration(),
        }
    }
}

/// STT vendor stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    /// Warm connections kept per endpoint.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_stt_endpoint() -> String {
    endpoints::STT_DEFAULT.to_string()
}

fn default_stt_model() -> String {
    "general-streaming".to_string()
}

fn default_pool_size() -> usize {
    4
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            endpoint: default_stt_endpoint(),
            api_key: String::new(),
            model: default_stt_model(),
            pool_size: default_pool_size(),
        }
    }
}

/// TTS vendor stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Phrase cache capacity (synthesized short phrases).
    #[serde(default = "default_phrase_cache")]
    pub phrase_cache_capacity: usize,
}

fn default_tts_endpoint() -> String {
    endpoints::TTS_DEFAULT.to_string()
}

fn default_tts_sample_rate() -> u32 {
    24000
}

fn default_phrase_cache() -> usize {
    128
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            api_key: String::new(),
            sample_rate: default_tts_sample_rate(),
            pool_size: default_pool_size(),
            phrase_cache_capacity: default_phrase_cache(),
        }
    }
}

/// LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_endpoint() -> String {
    endpoints::LLM_DEFAULT.to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> usize {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_llm_timeout() -> u64 {
    30
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
}

fn default_embedding_endpoint() -> String {
    endpoints::EMBEDDING_DEFAULT.to_string()
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_vector_dim() -> usize {
    384
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            vector_dim: default_vector_dim(),
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_qdrant_endpoint")]
    pub qdrant_endpoint: String,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub query_expansion_enabled: bool,
}

fn default_qdrant_endpoint() -> String {
    endpoints::QDRANT_DEFAULT.to_string()
}

fn default_collection() -> String {
    "knowledge".to_string()
}

fn default_top_k() -> usize {
    rag::DEFAULT_TOP_K
}

fn default_min_score() -> f32 {
    rag::BASE_MIN_SCORE
}

fn default_cache_ttl() -> u64 {
    rag::CACHE_TTL_SECS
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            qdrant_endpoint: default_qdrant_endpoint(),
            qdrant_api_key: None,
            collection: default_collection(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            cache_ttl_secs: default_cache_ttl(),
            query_expansion_enabled: true,
        }
    }
}

/// Ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_parse_endpoint")]
    pub parse_endpoint: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub preview_enabled: bool,
}

fn default_parse_endpoint() -> String {
    endpoints::PARSE_SERVICE_DEFAULT.to_string()
}

fn default_max_file_bytes() -> u64 {
    ingestion::MAX_FILE_BYTES
}

fn default_session_ttl() -> u64 {
    ingestion::SESSION_TTL_SECS
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            parse_endpoint: default_parse_endpoint(),
            max_file_bytes: default_max_file_bytes(),
            session_ttl_secs: default_session_ttl(),
            preview_enabled: true,
        }
    }
}

/// ScyllaDB persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_scylla_hosts")]
    pub scylla_hosts: Vec<String>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication")]
    pub replication_factor: u8,
}

fn default_scylla_hosts() -> Vec<String> {
    vec![endpoints::SCYLLA_DEFAULT.to_string()]
}

fn default_keyspace() -> String {
    "callbridge".to_string()
}

fn default_replication() -> u8 {
    1
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            scylla_hosts: default_scylla_hosts(),
            keyspace: default_keyspace(),
            replication_factor: default_replication(),
        }
    }
}

/// Logging and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub tracing_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            otlp_endpoint: None,
            tracing_enabled: false,
        }
    }
}

impl Settings {
    /// Validate settings, strictly in staging/production.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.telephony.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "telephony.max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.rag.min_score < 0.0 || self.rag.min_score > 1.0 {
            return Err(ConfigError::Invalid(
                "rag.min_score must be within [0, 1]".into(),
            ));
        }
        if self.embedding.vector_dim == 0 {
            return Err(ConfigError::Invalid(
                "embedding.vector_dim must be non-zero".into(),
            ));
        }
        if self.environment.is_strict() {
            if self.livekit.api_key.is_empty() || self.livekit.api_secret.is_empty() {
                return Err(ConfigError::Invalid(
                    "livekit credentials are required outside development".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load settings from layered sources.
///
/// Priority: env vars (`CALLBRIDGE_SERVER__PORT=...`) over
/// `config/{env}.yaml` over `config/default.yaml` over built-in defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = Path::new("config/default.yaml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    if let Some(env) = env {
        let env_path = format!("config/{env}.yaml");
        if Path::new(&env_path).exists() {
            builder = builder.add_source(File::with_name(&env_path));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("CALLBRIDGE")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.ingestion.max_file_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn strict_env_requires_credentials() {
        let settings = Settings {
            environment: RuntimeEnvironment::Production,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn invalid_score_rejected() {
        let mut settings = Settings::default();
        settings.rag.min_score = 1.5;
        assert!(settings.validate().is_err());
    }
}
