pub mod profile;
pub mod settings;

pub use settings::{
    ConfigError, LimitsConfig, PromptCacheConfig, RedisConfig, RetrieverConfig, ServerConfig,
    Settings, VectorStoreConfig,
};
