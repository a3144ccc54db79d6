//! C1 — layered configuration resolver.
//!
//! Loads in order: (a) code defaults, (b) process environment, (c) one
//! profile file keyed by `TEST_TARGET`, later wins. Grounded in the
//! teacher's `config/settings.rs` (the same `config` + `dotenvy` builder
//! shape), generalized to the three-layer resolution this spec requires
//! and the explicit `KEY = value` profile format from SPEC_FULL.md §6.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::profile::{self, PROFILE_KEY_MAP};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),
    #[error("config layer build failed: {0}")]
    Build(#[from] config::ConfigError),
    #[error(transparent)]
    Profile(#[from] profile::ProfileError),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    pub retriever_module: String,
    pub embedding_model: String,
    pub search_type: String,
    pub k: usize,
    pub score_threshold: f32,
    pub citation_limit: usize,
    pub large_retrieval_size_per_corpus: usize,
    pub large_retrieval_size_all_corpus: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub pooling: String,
    pub index_name: String,
    pub request_timeout_secs: u64,
    pub connection_timeout_secs: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            retriever_module: String::new(),
            embedding_model: String::new(),
            search_type: "hybrid".to_string(),
            k: 8,
            score_threshold: 0.0,
            citation_limit: 10,
            large_retrieval_size_per_corpus: 100,
            large_retrieval_size_all_corpus: 300,
            chunk_size: 1000,
            chunk_overlap: 200,
            pooling: "mean".to_string(),
            index_name: "default".to_string(),
            request_timeout_secs: 30,
            connection_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub llm_max_concurrent: usize,
    pub llm_max_response_chars: usize,
    pub llm_max_response_tokens: usize,
    pub rate_limit_per_minute: u32,
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            llm_max_concurrent: 10,
            llm_max_response_chars: 20_000,
            llm_max_response_tokens: 4_000,
            rate_limit_per_minute: 240,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub persist_directory: String,
    pub collection_name: String,
    pub handle_idle_ttl_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            persist_directory: "./data/index".to_string(),
            collection_name: "default".to_string(),
            handle_idle_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub cache_system_prompt: bool,
    pub cache_context: bool,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            cache_system_prompt: true,
            cache_context: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub retriever_config: RetrieverConfig,
    pub llm_provider: String,
    pub llm_model: String,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub prompt_cache: PromptCacheConfig,
    #[serde(default)]
    pub span_registry_path: String,
}

impl Settings {
    /// Resolves the three config layers and validates required keys.
    /// Fails fast with a descriptive error — no silent defaults for
    /// required values, per SPEC_FULL.md §4.1.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("environment", "development")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("retriever_config.search_type", "hybrid")?
            .set_default("retriever_config.k", 8)?
            .set_default("retriever_config.score_threshold", 0.0)?
            .set_default("retriever_config.citation_limit", 10)?
            .set_default("retriever_config.large_retrieval_size_per_corpus", 100)?
            .set_default("retriever_config.large_retrieval_size_all_corpus", 300)?
            .set_default("retriever_config.chunk_size", 1000)?
            .set_default("retriever_config.chunk_overlap", 200)?
            .set_default("retriever_config.pooling", "mean")?
            .set_default("retriever_config.index_name", "default")?
            .set_default("retriever_config.request_timeout_secs", 30)?
            .set_default("retriever_config.connection_timeout_secs", 10)?
            .set_default("llm_provider", "local-runtime")?
            .set_default("llm_model", "")?
            .set_default("limits.llm_max_concurrent", 10)?
            .set_default("limits.llm_max_response_chars", 20_000)?
            .set_default("limits.llm_max_response_tokens", 4_000)?
            .set_default("limits.rate_limit_per_minute", 240)?
            .set_default("limits.max_body_bytes", 10 * 1024 * 1024)?
            .set_default("vector_store.persist_directory", "./data/index")?
            .set_default("vector_store.collection_name", "default")?
            .set_default("vector_store.handle_idle_ttl_secs", 600)?
            .set_default("prompt_cache.enabled", true)?
            .set_default("prompt_cache.ttl_secs", 300)?
            .set_default("prompt_cache.cache_system_prompt", true)?
            .set_default("prompt_cache.cache_context", true)?
            .set_default("span_registry_path", "./data/spans.kv")?
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;

        let mut settings: Settings = builder.try_deserialize()?;

        if let Ok(target) = std::env::var("TEST_TARGET") {
            if !target.is_empty() {
                let path = profile_path(&target);
                if path.exists() {
                    let map = profile::parse_profile(&path)?;
                    apply_profile(&mut settings, &map)?;
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_empty() {
            return Err(ConfigError::MissingRequired("ENVIRONMENT"));
        }
        if self.retriever_config.embedding_model.is_empty() {
            return Err(ConfigError::MissingRequired("EMBEDDING_MODEL"));
        }
        if self.retriever_config.retriever_module.is_empty() {
            return Err(ConfigError::MissingRequired("RETRIEVER_MODULE"));
        }
        if self.environment != "development" && self.redis.is_none() {
            return Err(ConfigError::MissingRequired("REDIS_URL"));
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        PathBuf::from("config/settings")
    }
}

fn profile_path(target: &str) -> PathBuf {
    PathBuf::from("config/targets").join(format!("{target}.profile"))
}

/// Applies the fixed profile key mapping, with typed conversion, onto an
/// already-resolved `Settings` value. Unknown keys in the profile file are
/// ignored; keys in `PROFILE_KEY_MAP` with unparsable values are an error.
fn apply_profile(
    settings: &mut Settings,
    map: &std::collections::HashMap<String, String>,
) -> Result<(), ConfigError> {
    for (profile_key, dotted_path) in PROFILE_KEY_MAP {
        let Some(raw) = map.get(*profile_key) else {
            continue;
        };
        set_by_path(settings, dotted_path, raw)?;
    }
    Ok(())
}

fn set_by_path(settings: &mut Settings, path: &str, raw: &str) -> Result<(), ConfigError> {
    macro_rules! parse {
        ($ty:ty) => {
            raw.parse::<$ty>().map_err(|_| ConfigError::InvalidValue {
                key: path.to_string(),
                value: raw.to_string(),
            })?
        };
    }
    match path {
        "retriever_config.k" => settings.retriever_config.k = parse!(usize),
        "retriever_config.citation_limit" => settings.retriever_config.citation_limit = parse!(usize),
        "retriever_config.score_threshold" => {
            settings.retriever_config.score_threshold = parse!(f32)
        }
        "retriever_config.chunk_size" => settings.retriever_config.chunk_size = parse!(usize),
        "retriever_config.chunk_overlap" => settings.retriever_config.chunk_overlap = parse!(usize),
        "retriever_config.large_retrieval_size_per_corpus" => {
            settings.retriever_config.large_retrieval_size_per_corpus = parse!(usize)
        }
        "retriever_config.large_retrieval_size_all_corpus" => {
            settings.retriever_config.large_retrieval_size_all_corpus = parse!(usize)
        }
        "llm_provider" => settings.llm_provider = raw.to_string(),
        "llm_model" => settings.llm_model = raw.to_string(),
        "retriever_config.search_type" => settings.retriever_config.search_type = raw.to_string(),
        "retriever_config.pooling" => settings.retriever_config.pooling = raw.to_string(),
        "retriever_config.index_name" => settings.retriever_config.index_name = raw.to_string(),
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_overrides_apply_typed_values() {
        let mut settings = Settings {
            environment: "development".to_string(),
            retriever_config: RetrieverConfig {
                embedding_model: "all-MiniLM-L6-v2".to_string(),
                retriever_module: "darwin".to_string(),
                ..Default::default()
            },
            llm_provider: "local-runtime".to_string(),
            llm_model: "base".to_string(),
            ..Default::default()
        };
        let mut map = std::collections::HashMap::new();
        map.insert("SEARCH_K".to_string(), "16".to_string());
        map.insert("LLM_MODEL".to_string(), "gpt-4o-mini".to_string());
        apply_profile(&mut settings, &map).unwrap();
        assert_eq!(settings.retriever_config.k, 16);
        assert_eq!(settings.llm_model, "gpt-4o-mini");
    }

    #[test]
    fn validate_requires_embedding_model() {
        let settings = Settings {
            environment: "development".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
