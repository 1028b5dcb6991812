//! Tastevin: a restaurant-recommendation knowledge fabric.
//!
//! Ingests free-text descriptions of restaurants, users, events, memos, and
//! past queries; extracts a typed entity-relationship graph with an LLM;
//! embeds chunks and entities into vector collections; and answers
//! questions by fusing graph traversal with vector similarity. On top of
//! the graph, the recommendation engine correlates user preferences with
//! activity positive points and materialises validated `RECO` edges.
//!
//! # Modules
//!
//! - [`storage`]: key-value, vector, and graph adapters (memory, SurrealDB)
//! - [`chunking`]: token-window chunker
//! - [`embedding`]: embedding clients with batched bounded concurrency
//! - [`llm`]: completion clients, retry/circuit-breaker, response cache
//! - [`extract`]: tuple-record extraction with gleaning and merge
//! - [`ingest`]: the end-to-end ingestion orchestrator
//! - [`query`]: naive/local/global/hybrid retrieval and answering
//! - [`reco`]: preference-to-feature correlation and `RECO` edges

pub mod chunking;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ids;
pub mod ingest;
pub mod llm;
pub mod prompts;
pub mod query;
pub mod reco;
pub mod storage;
pub mod telemetry;

use crate::chunking::{Chunker, Tokenizer};
use crate::config::AppConfig;
use crate::error::Result;
use crate::extract::{EntityExtractor, ExtractorConfig};
use crate::ingest::IngestService;
use crate::llm::LlmClient;
use crate::llm::cache::CachedLlm;
use crate::prompts::PromptRegistry;
use crate::query::{QueryEngine, QueryEngineConfig};
use crate::reco::{RecoEngine, RecoEngineConfig};
use crate::storage::{GraphStore, KvStore, VectorStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The assembled fabric: three stores plus the ingestion, query, and
/// recommendation engines sharing one configuration and one cancellation
/// signal.
pub struct Fabric {
    pub kv: Arc<dyn KvStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub ingest: IngestService,
    pub query: QueryEngine,
    pub reco: RecoEngine,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric").finish()
    }
}

impl Fabric {
    /// Wire the engines over already-constructed stores and model clients.
    /// The raw LLM client is wrapped with the KV-backed response cache when
    /// enabled.
    pub fn assemble(
        config: &AppConfig,
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        prompts: PromptRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let tokenizer = Tokenizer::new()?;
        let prompts = Arc::new(prompts);
        let llm: Arc<dyn LlmClient> = Arc::new(CachedLlm::new(
            llm,
            Arc::clone(&kv),
            config.llm.enable_cache,
        ));

        let extractor = Arc::new(EntityExtractor::new(
            Arc::clone(&llm),
            Arc::clone(&prompts),
            tokenizer.clone(),
            ExtractorConfig {
                entity_types: config.extraction.entity_types.clone(),
                max_gleaning: config.extraction.max_gleaning,
                summary_max_tokens: config.extraction.summary_max_tokens,
            },
        ));

        let chunker = Chunker::new(
            tokenizer.clone(),
            config.chunking.max_token_size,
            config.chunking.overlap_token_size,
        )?;

        let ingest = IngestService::new(
            Arc::clone(&kv),
            Arc::clone(&vectors),
            Arc::clone(&graph),
            extractor,
            chunker,
            config.llm.max_async,
            cancel.clone(),
        );

        let query = QueryEngine::new(
            Arc::clone(&kv),
            Arc::clone(&vectors),
            Arc::clone(&graph),
            Arc::clone(&llm),
            Arc::clone(&prompts),
            tokenizer,
            QueryEngineConfig {
                top_k: config.query.top_k,
                max_token_for_text_unit: config.query.max_token_for_text_unit,
                max_token_for_local_context: config.query.max_token_for_local_context,
                max_token_for_global_context: config.query.max_token_for_global_context,
                response_type: config.query.response_type.clone(),
            },
        );

        // A zero worker count means auto-detect from the machine.
        let reco_workers = if config.reco.workers == 0 {
            num_cpus::get()
        } else {
            config.reco.workers
        };
        let reco = RecoEngine::new(
            Arc::clone(&vectors),
            Arc::clone(&graph),
            llm,
            prompts,
            RecoEngineConfig {
                ann_top_k: config.reco.ann_top_k,
                distance_threshold: config.reco.distance_threshold,
                top_k_cosine: config.reco.top_k_cosine,
                workers: reco_workers,
            },
            cancel.clone(),
        );

        Ok(Self { kv, vectors, graph, ingest, query, reco, cancel })
    }

    /// The shared cancellation signal; cancelling aborts pending pipeline
    /// work at the next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
