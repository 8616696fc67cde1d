//! memproxy configuration management
//!
//! One typed configuration value is loaded from TOML (or defaults), validated
//! once at startup with [`ProxyConfig::validate`], and then cloned into each
//! component. Nothing re-reads or re-derives configuration at request time.

use crate::error::{Error, Result};
use crate::memory::similarity::{RecencyDecay, SimilarityMetric};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main memproxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Inbound HTTP server
    pub gateway: GatewayConfig,

    /// Upstream LLM endpoint
    pub upstream: UpstreamConfig,

    /// Embedding collaborator
    pub embedding: EmbeddingConfig,

    /// Fact-extraction collaborator
    pub extraction: ExtractionConfig,

    /// Retrieval, eviction and versioning knobs
    pub memory: MemoryConfig,

    /// Background ingestion workers
    pub ingestion: IngestionConfig,

    /// Durable storage
    pub storage: StorageConfig,
}

impl ProxyConfig {
    /// Load a configuration file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid thresholds, weights and capacities.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;

        if self.embedding.dimension == 0 {
            return Err(Error::Config("embedding.dimension must be >= 1".into()));
        }
        for (name, url) in [
            ("upstream.base_url", &self.upstream.base_url),
            ("embedding.base_url", &self.embedding.base_url),
            ("extraction.base_url", &self.extraction.base_url),
        ] {
            if url.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }
        for (name, ms) in [
            ("upstream.timeout_ms", self.upstream.timeout_ms),
            ("embedding.timeout_ms", self.embedding.timeout_ms),
            ("extraction.timeout_ms", self.extraction.timeout_ms),
        ] {
            if ms == 0 {
                return Err(Error::Config(format!("{} must be > 0", name)));
            }
        }
        if self.ingestion.workers == 0 {
            return Err(Error::Config("ingestion.workers must be >= 1".into()));
        }
        if self.ingestion.queue_capacity == 0 || self.ingestion.access_queue_capacity == 0 {
            return Err(Error::Config(
                "ingestion queue capacities must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,

    /// Append an SSE comment with memory metadata after the upstream stream ends
    pub trailing_metadata: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18800,
            cors_origins: Vec::new(),
            trailing_metadata: false,
        }
    }
}

/// Upstream LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of an OpenAI-compatible API (without `/v1/...`)
    pub base_url: String,

    /// Environment variable holding the API key, if any
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds (connect + headers)
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 120_000,
        }
    }
}

/// Embedding collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings API
    pub base_url: String,

    /// Embedding model name
    pub model: String,

    /// Fixed dimension shared by every stored embedding
    pub dimension: usize,

    /// Environment variable holding the API key, if any
    pub api_key_env: Option<String>,

    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 5_000,
        }
    }
}

/// Fact-extraction collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Base URL of an OpenAI-compatible chat API
    pub base_url: String,

    /// Model used to extract facts and roll summaries
    pub model: String,

    /// Environment variable holding the API key, if any
    pub api_key_env: Option<String>,

    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,

    /// Upper bound on facts accepted from a single exchange
    pub max_facts: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_ms: 20_000,
            max_facts: 8,
        }
    }
}

/// Memory engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of memories returned per query
    pub top_k: usize,

    /// Maximum entries kept per conversation
    pub max_entries: usize,

    /// MMR trade-off: 1.0 = pure relevance, 0.0 = pure diversity
    pub mmr_lambda: f32,

    /// Weight of recency in the combined score
    pub recency_weight: f32,

    /// Minimum combined score for a memory to be returned
    pub score_threshold: f32,

    /// Candidates more similar than this to a stored entry are discarded
    pub dedup_threshold: f32,

    /// Maintain a rolling per-conversation summary
    pub summarization: bool,

    /// Record every mutation in the revision chain
    pub versioning: bool,

    /// Similarity measure for query relevance and MMR diversity
    pub similarity: SimilarityMetric,

    /// Recency decay applied to entry age
    pub recency_decay: RecencyDecay,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_entries: 200,
            mmr_lambda: 0.7,
            recency_weight: 0.2,
            score_threshold: 0.3,
            dedup_threshold: 0.92,
            summarization: false,
            versioning: true,
            similarity: SimilarityMetric::Cosine,
            recency_decay: RecencyDecay::default(),
        }
    }
}

impl MemoryConfig {
    /// Validate the memory knobs
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config("memory.top_k must be >= 1".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::Config("memory.max_entries must be >= 1".into()));
        }
        for (name, value) in [
            ("memory.mmr_lambda", self.mmr_lambda),
            ("memory.recency_weight", self.recency_weight),
            ("memory.score_threshold", self.score_threshold),
            ("memory.dedup_threshold", self.dedup_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        self.recency_decay.validate()
    }
}

/// Ingestion worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Number of worker tasks draining the ingestion queue
    pub workers: usize,

    /// Pending exchanges held before new submissions are rejected
    pub queue_capacity: usize,

    /// Pending access-stat updates held before new ones are dropped
    pub access_queue_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            access_queue_capacity: 1024,
        }
    }
}

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// JSON files under `base_dir` (default)
    #[default]
    File,

    /// Process memory only; lost on restart
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type
    pub backend: StorageBackend,

    /// Base directory for entries and revision logs
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            base_dir: dirs_next::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("memproxy"),
        }
    }
}

/// Read an API key from the environment variable named in config.
pub fn resolve_api_key(env_var: Option<&str>) -> Option<String> {
    let name = env_var?;
    std::env::var(name)
        .or_else(|_| std::env::var(name.to_uppercase()))
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 18800);
        assert!(config.memory.versioning);
        assert!(!config.memory.summarization);
    }

    #[test]
    fn test_rejects_out_of_range_lambda() {
        let mut config = ProxyConfig::default();
        config.memory.mmr_lambda = 1.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("mmr_lambda"));
    }

    #[test]
    fn test_rejects_nan_threshold() {
        let mut config = ProxyConfig::default();
        config.memory.score_threshold = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut config = ProxyConfig::default();
        config.memory.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.memory.top_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = ProxyConfig::default();
        config.ingestion.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [memory]
            top_k = 3
            max_entries = 10
            recency_decay = { kind = "linear", horizon_secs = 3600 }

            [storage]
            backend = "memory"
        "#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.memory.top_k, 3);
        assert_eq!(config.memory.max_entries, 10);
        assert_eq!(config.memory.mmr_lambda, 0.7);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(matches!(
            config.memory.recency_decay,
            RecencyDecay::Linear { horizon_secs: 3600 }
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memproxy.toml");
        std::fs::write(&path, "[memory]\nmmr_lambda = 2.0\n").unwrap();
        assert!(matches!(ProxyConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[gateway]\nport = 9000\n").unwrap();
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.gateway.port, 9000);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = ProxyConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ProxyConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.memory.top_k, config.memory.top_k);
        assert_eq!(parsed.embedding.dimension, config.embedding.dimension);
    }

    #[test]
    fn test_resolve_api_key_missing() {
        assert!(resolve_api_key(None).is_none());
        assert!(resolve_api_key(Some("MEMPROXY_TEST_SURELY_UNSET_VAR")).is_none());
    }
}
