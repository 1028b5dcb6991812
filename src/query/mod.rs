//! Query engine.
//!
//! Four retrieval modes against the shared stores: `naive` goes straight to
//! chunk ANN; `local` pivots on entities, `global` on relations, `hybrid`
//! merges both. The assembled context is handed to the answer prompt; an
//! empty context short-circuits to the `fail_response` sentinel with a
//! success envelope.

pub mod context;

use crate::chunking::Tokenizer;
use crate::error::{FabricError, Result};
use crate::ids::{self, FIELD_SEP};
use crate::llm::{CompletionRequest, LlmClient, strip_code_fences};
use crate::prompts::{self, PromptRegistry};
use crate::storage::{
    GraphStore, KvStore, NS_CHUNKS, NS_ENTITIES, NS_RELATIONS, NS_TEXT_CHUNKS, VectorStore,
};
use context::{ChunkRow, EntityRow, GraphContext, RelationRow};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Parameters and envelope
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Naive,
    Local,
    Global,
    Hybrid,
}

impl FromStr for QueryMode {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "naive" => Ok(QueryMode::Naive),
            "local" => Ok(QueryMode::Local),
            "global" => Ok(QueryMode::Global),
            "hybrid" => Ok(QueryMode::Hybrid),
            other => Err(FabricError::UserInput(format!("unknown query mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryParams {
    pub question: String,
    pub mode: QueryMode,
    /// Entity names restricting the candidate set; unknown names are
    /// silently dropped, and an all-unknown filter is ignored.
    pub vdb_filter: Vec<String>,
    pub top_k: Option<usize>,
    pub response_type: Option<String>,
    pub user_id: Option<String>,
}

impl QueryParams {
    pub fn new(question: impl Into<String>, mode: QueryMode) -> Self {
        Self {
            question: question.into(),
            mode,
            vdb_filter: Vec::new(),
            top_k: None,
            response_type: None,
            user_id: None,
        }
    }
}

/// JSON envelope returned to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    pub status: String,
    pub question: String,
    pub response: String,
}

/// Token budgets and defaults of the query stage.
#[derive(Debug, Clone)]
pub struct QueryEngineConfig {
    pub top_k: usize,
    pub max_token_for_text_unit: usize,
    pub max_token_for_local_context: usize,
    pub max_token_for_global_context: usize,
    pub response_type: String,
}

/// Parsed output of the keyword-extraction prompt.
#[derive(Debug, Default, Deserialize)]
struct Keywords {
    #[serde(default)]
    high_level_keywords: Vec<String>,
    #[serde(default)]
    low_level_keywords: Vec<String>,
}

/// A `vdb_filter` resolved against the graph: the entity ids for vector
/// filtering plus the names they came from.
#[derive(Debug, Clone)]
struct ResolvedFilter {
    ids: HashSet<String>,
    names: Vec<String>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct QueryEngine {
    kv: Arc<dyn KvStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRegistry>,
    tokenizer: Tokenizer,
    config: QueryEngineConfig,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").field("top_k", &self.config.top_k).finish()
    }
}

impl QueryEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRegistry>,
        tokenizer: Tokenizer,
        config: QueryEngineConfig,
    ) -> Self {
        Self { kv, vectors, graph, llm, prompts, tokenizer, config }
    }

    /// Answer a question. Errors in the user input surface as
    /// [`FabricError::UserInput`]; an empty candidate set is not an error.
    pub async fn query(&self, params: QueryParams) -> Result<QueryResponse> {
        let question = params.question.trim().to_string();
        if question.is_empty() {
            return Err(FabricError::UserInput("question must not be empty".into()));
        }
        let top_k = params.top_k.unwrap_or(self.config.top_k);
        let response_type = params
            .response_type
            .clone()
            .unwrap_or_else(|| self.config.response_type.clone());

        let filter = self.resolve_filter(&params.vdb_filter).await?;

        let answer = match params.mode {
            QueryMode::Naive => {
                self.naive(&question, top_k, filter.as_ref(), &response_type).await?
            }
            QueryMode::Local | QueryMode::Global | QueryMode::Hybrid => {
                self.graph_modes(&question, params.mode, top_k, filter.as_ref(), &response_type)
                    .await?
            }
        };

        info!(name: "query.completed", mode = ?params.mode, "query answered");
        Ok(QueryResponse { status: "success".into(), question, response: answer })
    }

    /// Resolve filter names to entity ids present in the graph.
    async fn resolve_filter(&self, names: &[String]) -> Result<Option<ResolvedFilter>> {
        if names.is_empty() {
            return Ok(None);
        }
        let mut resolved = ResolvedFilter { ids: HashSet::new(), names: Vec::new() };
        for raw in names {
            let name = ids::normalise_name(raw);
            if name.is_empty() {
                continue;
            }
            if self.graph.has_node(&name).await? {
                resolved.ids.insert(ids::entity_id(&name));
                resolved.names.push(name);
            } else {
                debug!(name: "query.filter.dropped", filter = %raw, "filter name absent from graph");
            }
        }
        if resolved.ids.is_empty() {
            warn!(name: "query.filter.ignored", "no filter name resolved; filter ignored");
            return Ok(None);
        }
        Ok(Some(resolved))
    }

    // =========================================================================
    // Naive mode
    // =========================================================================

    async fn naive(
        &self,
        question: &str,
        top_k: usize,
        filter: Option<&ResolvedFilter>,
        response_type: &str,
    ) -> Result<String> {
        // An entity filter restricts naive retrieval to the chunks those
        // entities cite.
        let chunk_filter = match filter {
            Some(resolved) => {
                let allowed = self.chunks_cited_by(&resolved.names).await?;
                if allowed.is_empty() { None } else { Some(allowed) }
            }
            None => None,
        };

        let hits = self
            .vectors
            .query(NS_CHUNKS, question, top_k, chunk_filter.as_ref())
            .await?;
        if hits.is_empty() {
            return Ok(self.prompts.get(prompts::FAIL_RESPONSE).to_string());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let payloads = self.kv.get_by_ids(NS_TEXT_CHUNKS, &ids).await?;
        let texts: Vec<String> = payloads
            .into_iter()
            .flatten()
            .filter_map(|v| v.get("text").and_then(Value::as_str).map(String::from))
            .collect();
        let kept = self.tokenizer.truncate_list(
            texts,
            Clone::clone,
            self.config.max_token_for_text_unit,
        );
        if kept.is_empty() {
            return Ok(self.prompts.get(prompts::FAIL_RESPONSE).to_string());
        }

        let prompt = self.prompts.render(
            prompts::NAIVE_RAG_RESPONSE,
            &[
                ("content_data", &kept.join("\n--New Chunk--\n")),
                ("response_type", response_type),
            ],
        );
        self.answer(prompt, question).await
    }

    /// Chunk ids cited by any of the given entities, one hop away.
    async fn chunks_cited_by(&self, names: &[String]) -> Result<HashSet<String>> {
        let mut allowed = HashSet::new();
        for name in names {
            let Some(node) = self.graph.get_node(name).await? else {
                continue;
            };
            if let Some(cited) = node.get("source_chunks").and_then(Value::as_str) {
                allowed.extend(
                    cited.split(FIELD_SEP).filter(|s| !s.is_empty()).map(String::from),
                );
            }
            // Neighbours count as reachable within one hop.
            for (source, target) in self.graph.get_node_edges(name).await? {
                let other = if &source == name { target } else { source };
                if let Some(neighbour) = self.graph.get_node(&other).await? {
                    if let Some(cited) =
                        neighbour.get("source_chunks").and_then(Value::as_str)
                    {
                        allowed.extend(
                            cited
                                .split(FIELD_SEP)
                                .filter(|s| !s.is_empty())
                                .map(String::from),
                        );
                    }
                }
            }
        }
        Ok(allowed)
    }

    // =========================================================================
    // Graph modes
    // =========================================================================

    async fn graph_modes(
        &self,
        question: &str,
        mode: QueryMode,
        top_k: usize,
        filter: Option<&ResolvedFilter>,
        response_type: &str,
    ) -> Result<String> {
        let keywords = self.extract_keywords(question).await;
        let filter_ids = filter.map(|f| &f.ids);

        let context = match mode {
            QueryMode::Local => {
                self.local_context(&keywords.low_level_keywords, top_k, filter_ids).await?
            }
            QueryMode::Global => {
                self.global_context(&keywords.high_level_keywords, top_k, filter_ids).await?
            }
            QueryMode::Hybrid => {
                let local =
                    self.local_context(&keywords.low_level_keywords, top_k, filter_ids).await?;
                let global = self
                    .global_context(&keywords.high_level_keywords, top_k, filter_ids)
                    .await?;
                local.merge(global)
            }
            QueryMode::Naive => unreachable!("naive handled by caller"),
        };

        let context = context.truncate(
            &self.tokenizer,
            self.config.max_token_for_local_context,
            self.config.max_token_for_global_context,
            self.config.max_token_for_text_unit,
        );
        if context.is_empty() {
            return Ok(self.prompts.get(prompts::FAIL_RESPONSE).to_string());
        }

        let prompt = self.prompts.render(
            prompts::RAG_RESPONSE,
            &[
                ("context_data", &context.format()),
                ("response_type", response_type),
            ],
        );
        self.answer(prompt, question).await
    }

    async fn extract_keywords(&self, question: &str) -> Keywords {
        let prompt = self.prompts.render(prompts::KEYWORDS_EXTRACTION, &[("query", question)]);
        match self.llm.complete(CompletionRequest::new(prompt)).await {
            Ok(raw) => match serde_json::from_str::<Keywords>(strip_code_fences(&raw)) {
                Ok(parsed)
                    if !(parsed.high_level_keywords.is_empty()
                        && parsed.low_level_keywords.is_empty()) =>
                {
                    parsed
                }
                _ => {
                    warn!(name: "query.keywords.fallback", "keyword JSON unusable; using raw question");
                    Keywords {
                        high_level_keywords: vec![question.to_string()],
                        low_level_keywords: vec![question.to_string()],
                    }
                }
            },
            Err(e) => {
                warn!(name: "query.keywords.fallback", error = %e, "keyword extraction failed; using raw question");
                Keywords {
                    high_level_keywords: vec![question.to_string()],
                    low_level_keywords: vec![question.to_string()],
                }
            }
        }
    }

    /// Entity-centric retrieval: ANN over entities, then their edges and
    /// most-cited chunks.
    async fn local_context(
        &self,
        keywords: &[String],
        top_k: usize,
        filter: Option<&HashSet<String>>,
    ) -> Result<GraphContext> {
        if keywords.is_empty() {
            return Ok(GraphContext::default());
        }
        let hits = self
            .vectors
            .query(NS_ENTITIES, &keywords.join(", "), top_k, filter)
            .await?;

        let mut context = GraphContext::default();
        let mut chunk_scores: HashMap<String, f64> = HashMap::new();
        let mut seen_pairs = HashSet::new();

        for hit in hits {
            let Some(name) = hit.metadata.get("entity_name").and_then(Value::as_str) else {
                continue;
            };
            // The node may trail the embedding write; absent nodes drop out.
            let Some(node) = self.graph.get_node(name).await? else {
                continue;
            };
            let rank = self.graph.node_degree(name).await?;
            context.entities.push(EntityRow {
                name: name.to_string(),
                entity_type: node
                    .get("entity_type")
                    .and_then(Value::as_str)
                    .unwrap_or(crate::domain::UNKNOWN_ENTITY_TYPE)
                    .to_string(),
                description: node
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                rank,
            });

            // One-hop neighbourhood.
            let mut weighted_degree = 0.0;
            for (source, target) in self.graph.get_node_edges(name).await? {
                let Some(edge) = self.graph.get_edge(&source, &target).await? else {
                    continue;
                };
                let weight = edge.get("weight").and_then(Value::as_f64).unwrap_or(0.0);
                weighted_degree += weight;
                if seen_pairs.insert((source.clone(), target.clone())) {
                    context.relations.push(RelationRow {
                        rank: self.graph.edge_degree(&source, &target).await?,
                        source,
                        target,
                        description: edge
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        keywords: edge
                            .get("keywords")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        weight,
                    });
                }
            }

            // Chunks cited by this entity, scored by its aggregated edge
            // weight.
            if let Some(cited) = node.get("source_chunks").and_then(Value::as_str) {
                for chunk_id in cited.split(FIELD_SEP).filter(|s| !s.is_empty()) {
                    *chunk_scores.entry(chunk_id.to_string()).or_default() +=
                        1.0 + weighted_degree;
                }
            }
        }

        context.chunks = self.fetch_scored_chunks(chunk_scores).await?;
        Ok(context)
    }

    /// Relation-centric retrieval: ANN over relations, expanded to endpoint
    /// entities and their chunks.
    async fn global_context(
        &self,
        keywords: &[String],
        top_k: usize,
        filter: Option<&HashSet<String>>,
    ) -> Result<GraphContext> {
        if keywords.is_empty() {
            return Ok(GraphContext::default());
        }
        // Relation ids live in a different hash space than the entity
        // filter; restrict by endpoint after the search instead.
        let hits = self
            .vectors
            .query(NS_RELATIONS, &keywords.join(", "), top_k, None)
            .await?;

        let mut context = GraphContext::default();
        let mut chunk_scores: HashMap<String, f64> = HashMap::new();
        let mut seen_entities = HashSet::new();

        for hit in hits {
            let (Some(source), Some(target)) = (
                hit.metadata.get("source_name").and_then(Value::as_str),
                hit.metadata.get("target_name").and_then(Value::as_str),
            ) else {
                continue;
            };
            if let Some(allowed) = filter {
                let touches_filter = allowed.contains(&ids::entity_id(source))
                    || allowed.contains(&ids::entity_id(target));
                if !touches_filter {
                    continue;
                }
            }
            let Some(edge) = self.graph.get_edge(source, target).await? else {
                continue;
            };
            let weight = edge.get("weight").and_then(Value::as_f64).unwrap_or(0.0);
            context.relations.push(RelationRow {
                source: source.to_string(),
                target: target.to_string(),
                description: edge
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                keywords: edge
                    .get("keywords")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                weight,
                rank: self.graph.edge_degree(source, target).await?,
            });

            for name in [source, target] {
                if !seen_entities.insert(name.to_string()) {
                    continue;
                }
                if let Some(node) = self.graph.get_node(name).await? {
                    context.entities.push(EntityRow {
                        name: name.to_string(),
                        entity_type: node
                            .get("entity_type")
                            .and_then(Value::as_str)
                            .unwrap_or(crate::domain::UNKNOWN_ENTITY_TYPE)
                            .to_string(),
                        description: node
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        rank: self.graph.node_degree(name).await?,
                    });
                }
            }

            if let Some(cited) = edge.get("source_chunks").and_then(Value::as_str) {
                for chunk_id in cited.split(FIELD_SEP).filter(|s| !s.is_empty()) {
                    *chunk_scores.entry(chunk_id.to_string()).or_default() += 1.0 + weight;
                }
            }
        }

        context.chunks = self.fetch_scored_chunks(chunk_scores).await?;
        Ok(context)
    }

    /// Load chunk texts for the scored citations, best first.
    async fn fetch_scored_chunks(
        &self,
        scores: HashMap<String, f64>,
    ) -> Result<Vec<ChunkRow>> {
        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let ids: Vec<String> = ranked.into_iter().map(|(id, _)| id).collect();
        let payloads = self.kv.get_by_ids(NS_TEXT_CHUNKS, &ids).await?;

        Ok(ids
            .into_iter()
            .zip(payloads)
            .filter_map(|(id, payload)| {
                payload
                    .and_then(|v| v.get("text").and_then(Value::as_str).map(String::from))
                    .map(|text| ChunkRow { id, text })
            })
            .collect())
    }

    async fn answer(&self, prompt: String, _question: &str) -> Result<String> {
        self.llm.complete(CompletionRequest::new(prompt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!(QueryMode::from_str("Hybrid").unwrap(), QueryMode::Hybrid);
        assert_eq!(QueryMode::from_str("naive").unwrap(), QueryMode::Naive);
        assert!(QueryMode::from_str("telepathic").is_err());
    }

    #[test]
    fn keywords_deserialise_with_defaults() {
        let parsed: Keywords =
            serde_json::from_str("{\"high_level_keywords\":[\"cuisine\"]}").unwrap();
        assert_eq!(parsed.high_level_keywords, vec!["cuisine"]);
        assert!(parsed.low_level_keywords.is_empty());
    }
}
