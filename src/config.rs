//! Application configuration.
//!
//! One immutable [`AppConfig`] is built at startup and passed down
//! explicitly; nothing reads the environment after this point. Layering,
//! lowest priority first: built-in defaults, optional TOML file,
//! `TASTEVIN_*` environment variables, CLI flags.

use crate::error::{FabricError, Result};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Default closed set of entity types.
pub const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "restaurant",
    "cuisine",
    "price",
    "ambiance",
    "location",
    "speciality",
    "schedule",
    "contact",
    "user",
    "user_preference",
    "user_attribute",
    "activity",
    "positive_point",
    "negative_point",
    "recommendation",
    "event",
    "memo",
    "query",
    "ActivityCategory",
];

/// Configuration-relevant CLI flags, flattened into the binary's parser.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Storage backend: memory | surreal
    #[arg(long, env = "STORAGE_BACKEND")]
    pub storage_backend: Option<String>,

    /// Disable the LLM response cache
    #[arg(long, env = "LLM_CACHE_DISABLED")]
    pub llm_cache_disabled: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub extraction: ExtractionConfig,
    pub query: QueryConfig,
    pub reco: RecoConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    /// Concurrent chunk extractions per document.
    pub max_async: usize,
    pub max_token_size: usize,
    pub enable_cache: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// "fastembed" (local) or "remote" (OpenAI-compatible endpoint).
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub dim: usize,
    pub batch_num: usize,
    pub max_async: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_token_size: usize,
    pub overlap_token_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    pub max_gleaning: usize,
    pub summary_max_tokens: usize,
    pub entity_types: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    pub top_k: usize,
    pub max_token_for_text_unit: usize,
    pub max_token_for_local_context: usize,
    pub max_token_for_global_context: usize,
    pub response_type: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoConfig {
    pub ann_top_k: usize,
    pub distance_threshold: f32,
    pub top_k_cosine: usize,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// "memory" or "surreal".
    pub backend: String,
    pub surreal_url: String,
    pub surreal_namespace: String,
    pub surreal_database: String,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        builder = builder
            .set_default("llm.base_url", "http://localhost:8000")
            .and_then(|b| b.set_default("llm.model", "gpt-4o-mini"))
            .and_then(|b| b.set_default("llm.max_async", 16))
            .and_then(|b| b.set_default("llm.max_token_size", 32768))
            .and_then(|b| b.set_default("llm.enable_cache", true))
            .and_then(|b| b.set_default("embedding.provider", "fastembed"))
            .and_then(|b| b.set_default("embedding.model", "BAAI/bge-small-en-v1.5"))
            .and_then(|b| b.set_default("embedding.dim", 384))
            .and_then(|b| b.set_default("embedding.batch_num", 32))
            .and_then(|b| b.set_default("embedding.max_async", 16))
            .and_then(|b| b.set_default("chunking.max_token_size", 1024))
            .and_then(|b| b.set_default("chunking.overlap_token_size", 100))
            .and_then(|b| b.set_default("extraction.max_gleaning", 1))
            .and_then(|b| b.set_default("extraction.summary_max_tokens", 500))
            .and_then(|b| {
                b.set_default(
                    "extraction.entity_types",
                    DEFAULT_ENTITY_TYPES.iter().map(|s| (*s).to_string()).collect::<Vec<_>>(),
                )
            })
            .and_then(|b| b.set_default("query.top_k", 60))
            .and_then(|b| b.set_default("query.max_token_for_text_unit", 4000))
            .and_then(|b| b.set_default("query.max_token_for_local_context", 4000))
            .and_then(|b| b.set_default("query.max_token_for_global_context", 4000))
            .and_then(|b| b.set_default("query.response_type", "Multiple Paragraphs"))
            .and_then(|b| b.set_default("reco.ann_top_k", 1000))
            .and_then(|b| b.set_default("reco.distance_threshold", 0.8))
            .and_then(|b| b.set_default("reco.top_k_cosine", 5))
            .and_then(|b| b.set_default("reco.workers", 8))
            .and_then(|b| b.set_default("storage.backend", "memory"))
            .and_then(|b| b.set_default("storage.surreal_url", "ws://localhost:8001"))
            .and_then(|b| b.set_default("storage.surreal_namespace", "tastevin"))
            .and_then(|b| b.set_default("storage.surreal_database", "fabric"))
            .map_err(|e| FabricError::Configuration(e.to_string()))?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASTEVIN").separator("__").try_parsing(true),
        );

        if let Some(backend) = &cli.storage_backend {
            builder = builder
                .set_override("storage.backend", backend.clone())
                .map_err(|e| FabricError::Configuration(e.to_string()))?;
        }
        if let Some(disabled) = cli.llm_cache_disabled {
            builder = builder
                .set_override("llm.enable_cache", !disabled)
                .map_err(|e| FabricError::Configuration(e.to_string()))?;
        }

        let config: AppConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| FabricError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults only; the in-memory path used by tests.
    pub fn for_tests() -> Self {
        Self {
            llm: LlmConfig {
                base_url: "http://localhost:8000".into(),
                api_key: None,
                model: "test-model".into(),
                max_async: 4,
                max_token_size: 32768,
                enable_cache: true,
            },
            embedding: EmbeddingConfig {
                provider: "fastembed".into(),
                base_url: None,
                api_key: None,
                model: "BAAI/bge-small-en-v1.5".into(),
                dim: 8,
                batch_num: 32,
                max_async: 4,
            },
            chunking: ChunkingConfig { max_token_size: 1024, overlap_token_size: 100 },
            extraction: ExtractionConfig {
                max_gleaning: 1,
                summary_max_tokens: 500,
                entity_types: DEFAULT_ENTITY_TYPES.iter().map(|s| (*s).to_string()).collect(),
            },
            query: QueryConfig {
                top_k: 60,
                max_token_for_text_unit: 4000,
                max_token_for_local_context: 4000,
                max_token_for_global_context: 4000,
                response_type: "Multiple Paragraphs".into(),
            },
            reco: RecoConfig {
                ann_top_k: 1000,
                distance_threshold: 0.8,
                top_k_cosine: 5,
                workers: 2,
            },
            storage: StorageConfig {
                backend: "memory".into(),
                surreal_url: String::new(),
                surreal_namespace: "tastevin".into(),
                surreal_database: "fabric".into(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dim == 0 {
            return Err(FabricError::Configuration("embedding.dim must be positive".into()));
        }
        if !matches!(self.embedding.provider.as_str(), "fastembed" | "remote") {
            return Err(FabricError::Configuration(format!(
                "unknown embedding provider: {}",
                self.embedding.provider
            )));
        }
        if self.embedding.provider == "remote"
            && self.embedding.base_url.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(FabricError::Configuration(
                "embedding.base_url is required for the remote provider".into(),
            ));
        }
        if self.chunking.overlap_token_size >= self.chunking.max_token_size {
            return Err(FabricError::Configuration(
                "chunking.overlap_token_size must be smaller than chunking.max_token_size".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.reco.distance_threshold) {
            return Err(FabricError::Configuration(
                "reco.distance_threshold must be a cosine distance in [0, 2]".into(),
            ));
        }
        if !matches!(self.storage.backend.as_str(), "memory" | "surreal") {
            return Err(FabricError::Configuration(format!(
                "unknown storage backend: {}",
                self.storage.backend
            )));
        }
        if self.storage.backend == "surreal" && self.storage.surreal_url.trim().is_empty() {
            return Err(FabricError::Configuration(
                "storage.surreal_url is required for the surreal backend".into(),
            ));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(FabricError::Configuration("llm.base_url must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn bad_distance_threshold_is_rejected() {
        let mut config = AppConfig::for_tests();
        config.reco.distance_threshold = 3.0;
        assert!(matches!(config.validate(), Err(FabricError::Configuration(_))));
    }

    #[test]
    fn overlap_must_stay_under_window() {
        let mut config = AppConfig::for_tests();
        config.chunking.overlap_token_size = config.chunking.max_token_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn surreal_backend_requires_url() {
        let mut config = AppConfig::for_tests();
        config.storage.backend = "surreal".into();
        config.storage.surreal_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = AppConfig::for_tests();
        config.storage.backend = "cassette".into();
        assert!(config.validate().is_err());
    }
}
