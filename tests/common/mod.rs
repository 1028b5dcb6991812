//! Shared fixtures: a deterministic stub embedder, a routing LLM double,
//! and an in-memory fabric wired like production.

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tastevin::Fabric;
use tastevin::config::AppConfig;
use tastevin::embedding::{BatchedEmbedder, EmbeddingClient};
use tastevin::error::Result;
use tastevin::llm::{CompletionRequest, LlmClient};
use tastevin::prompts::PromptRegistry;
use tastevin::storage::memory::{MemoryGraphStore, MemoryKvStore, MemoryVectorStore};
use tastevin::storage::{EdgeTypeTable, GraphStore, KvStore, VectorStore};

pub const DIM: usize = 8;

/// Deterministic embedder: texts matching an anchor substring share the
/// anchor's vector; everything else gets a hash-derived vector.
#[derive(Debug, Default)]
pub struct StubEmbedder {
    anchors: Vec<(String, Vec<f32>)>,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anchor(mut self, needle: &str, vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), DIM);
        self.anchors.push((needle.to_string(), vector));
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        for (needle, vector) in &self.anchors {
            if text.contains(needle) {
                return vector.clone();
            }
        }
        let digest = Sha256::digest(text.as_bytes());
        digest[..DIM]
            .iter()
            .map(|b| (f32::from(*b) - 127.5) / 127.5)
            .collect()
    }
}

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    fn embedding_dim(&self) -> usize {
        DIM
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Routes completions by prompt substring, first match wins; unmatched
/// prompts get an empty extraction so pipelines always terminate.
#[derive(Debug)]
pub struct RouterLlm {
    routes: Vec<(String, String)>,
    calls: Mutex<Vec<String>>,
}

impl RouterLlm {
    pub fn new(routes: Vec<(&str, &str)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(needle, response)| (needle.to_string(), response.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt this double has served, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for RouterLlm {
    fn model_id(&self) -> &str {
        "router-test-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.calls.lock().unwrap().push(request.prompt.clone());
        for (needle, response) in &self.routes {
            if request.prompt.contains(needle) {
                return Ok(response.clone());
            }
        }
        Ok("<|COMPLETE|>".to_string())
    }
}

/// Everything the integration suites need to inspect.
pub struct TestFabric {
    pub fabric: Fabric,
    pub llm: Arc<RouterLlm>,
    pub kv: Arc<dyn KvStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
}

/// In-memory fabric over the stub embedder and a routed LLM.
pub fn fabric_with(embedder: StubEmbedder, routes: Vec<(&str, &str)>) -> TestFabric {
    let config = AppConfig::for_tests();
    let llm = Arc::new(RouterLlm::new(routes));
    let batched = Arc::new(BatchedEmbedder::new(Arc::new(embedder), 32, 4));

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new(batched));
    let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new(EdgeTypeTable::default()));

    let fabric = Fabric::assemble(
        &config,
        Arc::clone(&kv),
        Arc::clone(&vectors),
        Arc::clone(&graph),
        Arc::clone(&llm) as Arc<dyn LlmClient>,
        PromptRegistry::new(),
    )
    .expect("fabric assembles over memory stores");

    TestFabric { fabric, llm, kv, vectors, graph }
}

// =============================================================================
// Canned extraction scripts
// =============================================================================

/// Extraction output for the Le Coquemar resume.
pub const RESTAURANT_EXTRACTION: &str = concat!(
    "(\"entity\"<|>\"Le Coquemar\"<|>\"restaurant\"<|>\"Restaurant français de cuisine lyonnaise.\")##",
    "(\"entity\"<|>\"Lyon\"<|>\"location\"<|>\"Ville où se trouve le restaurant.\")##",
    "(\"entity\"<|>\"Pizza authentique\"<|>\"positive_point\"<|>\"PIZZA napolitaine authentique au feu de bois.\")##",
    "(\"relationship\"<|>\"Le Coquemar\"<|>\"Lyon\"<|>\"Le restaurant est situé à Lyon.\"<|>\"localisation\"<|>9)##",
    "(\"relationship\"<|>\"Le Coquemar\"<|>\"Pizza authentique\"<|>\"Le restaurant sert des pizzas authentiques.\"<|>\"spécialité\"<|>8)##",
    "(\"content_keywords\"<|>\"restaurant, lyon, pizza\")<|COMPLETE|>"
);

/// Extraction output for the Lea profile.
pub const USER_EXTRACTION: &str = concat!(
    "(\"entity\"<|>\"Lea\"<|>\"user\"<|>\"Utilisatrice qui adore les pizzas napolitaines.\")##",
    "(\"entity\"<|>\"Pizzas napolitaines\"<|>\"user_preference\"<|>\"PIZZA napolitaine, préférence forte.\")##",
    "(\"relationship\"<|>\"Lea\"<|>\"Pizzas napolitaines\"<|>\"Lea adore les pizzas napolitaines.\"<|>\"préférence\"<|>8)<|COMPLETE|>"
);

pub const KEYWORDS_JSON: &str = r#"{"high_level_keywords": ["restaurant", "recommandation"], "low_level_keywords": ["pizza", "lea"]}"#;

/// Routes shared by most suites; extraction matchers keyed on fragments of
/// the ingested texts. Order matters: answer prompts embed entity text, so
/// they are matched before the extraction fallbacks.
pub fn default_routes() -> Vec<(&'static str, &'static str)> {
    vec![
        ("comprehensive summary", "Résumé synthétique."),
        ("MANY entities were missed", "<|COMPLETE|>"),
        ("Answer YES | NO", "NO"),
        ("high-level and low-level keywords", KEYWORDS_JSON),
        (
            "-Data tables-",
            "Le Coquemar devrait plaire: pizzas napolitaines authentiques à Lyon.",
        ),
        ("-Documents-", "Le Coquemar est mentionné dans les documents."),
        (
            "judge deciding whether a user preference",
            r#"{"is_valid": true, "compatibility_score": 0.9, "justification": "même spécialité", "recommendation_description": "Des pizzas napolitaines authentiques pour une amatrice de pizzas."}"#,
        ),
        ("Le Coquemar est un restaurant", RESTAURANT_EXTRACTION),
        ("adore les pizzas napolitaines", USER_EXTRACTION),
    ]
}

pub fn activity_payload() -> serde_json::Value {
    json!({
        "type": "activity",
        "cid": "3091293945615310311",
        "resume": "Le Coquemar est un restaurant français de Lyon, réputé pour sa pizza napolitaine authentique cuite au feu de bois.",
        "city": "Lyon",
        "lat": 45.76,
        "lng": 4.82
    })
}

pub fn user_payload() -> serde_json::Value {
    json!({
        "type": "user",
        "user_id": "lea",
        "user_info": "Lea adore les pizzas napolitaines et les adresses authentiques."
    })
}
