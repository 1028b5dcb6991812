//! Recommendation engine.
//!
//! Correlates a user's preference nodes with activity positive points:
//! filtered ANN over the entity collection, explicit cosine re-rank, an LLM
//! compatibility judge, and idempotent `RECO` edge persistence. A `done`
//! edge is never replaced; a `to_validate` edge is superseded by a fresh
//! candidate.

use crate::concurrency::{KeyedLocks, bounded_map, ensure_active};
use crate::domain::{RECO_EDGE_TYPE, RecoEdge, RecoStatus};
use crate::error::{FabricError, Result};
use crate::ids;
use crate::llm::{CompletionRequest, LlmClient, strip_code_fences};
use crate::prompts::{self, PromptRegistry};
use crate::storage::{GraphStore, NS_ENTITIES, Props, VectorStore, cosine_similarity};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs of the correlation stage.
#[derive(Debug, Clone)]
pub struct RecoEngineConfig {
    /// Candidate pool size for the filtered ANN pass.
    pub ann_top_k: usize,
    /// Candidates at or beyond this cosine distance are dropped.
    pub distance_threshold: f32,
    /// Survivors kept after the explicit cosine re-rank.
    pub top_k_cosine: usize,
    /// Bounded worker pool width over the preference nodes.
    pub workers: usize,
}

/// Result envelope of one `recommend` run.
#[derive(Debug, Clone, Default)]
pub struct RecoOutcome {
    /// Edges written this run.
    pub created: usize,
    /// The validated edges, including pre-existing `done` ones.
    pub verified: Vec<RecoEdge>,
}

/// Judge verdict, parsed from structured JSON output.
#[derive(Debug, Deserialize)]
struct CompatibilityVerdict {
    is_valid: bool,
    #[serde(default)]
    compatibility_score: f64,
    #[serde(default)]
    justification: String,
    #[serde(default)]
    recommendation_description: String,
}

pub struct RecoEngine {
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRegistry>,
    locks: KeyedLocks,
    config: RecoEngineConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RecoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoEngine")
            .field("ann_top_k", &self.config.ann_top_k)
            .field("workers", &self.config.workers)
            .finish()
    }
}

impl RecoEngine {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRegistry>,
        config: RecoEngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { vectors, graph, llm, prompts, locks: KeyedLocks::new(), config, cancel }
    }

    /// Produce `RECO` edges for one user.
    pub async fn recommend(&self, custom_id: &str) -> Result<RecoOutcome> {
        ensure_active(&self.cancel)?;

        let run_id = uuid::Uuid::new_v4();
        info!(name: "reco.started", custom_id, run_id = %run_id, "recommendation run started");
        let user_name = self.find_user(custom_id).await?;
        let sources = self.preference_nodes(&user_name).await?;
        let (target_ids, target_names) = self.positive_points().await?;

        if sources.is_empty() || target_ids.is_empty() {
            info!(
                name: "reco.nothing_to_do",
                custom_id,
                sources = sources.len(),
                targets = target_ids.len(),
                "no preference/positive-point pairs to correlate"
            );
            return Ok(RecoOutcome::default());
        }

        let futures: Vec<_> = sources
            .into_iter()
            .map(|source_name| {
                let target_ids = target_ids.clone();
                let target_names = target_names.clone();
                async move {
                    ensure_active(&self.cancel)?;
                    self.correlate_source(&source_name, &target_ids, &target_names).await
                }
            })
            .collect();

        let mut outcome = RecoOutcome::default();
        for result in bounded_map(self.config.workers, futures).await {
            let (created, verified) = result?;
            outcome.created += created;
            outcome.verified.extend(verified);
        }

        info!(
            name: "reco.completed",
            custom_id,
            run_id = %run_id,
            created = outcome.created,
            verified = outcome.verified.len(),
            "recommendation run finished"
        );
        Ok(outcome)
    }

    /// The user node carrying this custom id.
    async fn find_user(&self, custom_id: &str) -> Result<String> {
        let mut users: Vec<String> = self
            .graph
            .nodes_with_custom_id(custom_id)
            .await?
            .into_iter()
            .filter(|(_, props)| {
                props.get("entity_type").and_then(Value::as_str) == Some("user")
            })
            .map(|(name, _)| name)
            .collect();
        users.sort();
        users
            .into_iter()
            .next()
            .ok_or_else(|| FabricError::UserInput(format!("unknown user: {custom_id}")))
    }

    /// Names of the `user_preference` nodes linked to the user by `LIKES`.
    async fn preference_nodes(&self, user_name: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (source, target) in self.graph.get_node_edges(user_name).await? {
            let other = if source == user_name { target } else { source };
            let Some(edge) = self.graph.get_edge(user_name, &other).await?.or(
                self.graph.get_edge(&other, user_name).await?,
            ) else {
                continue;
            };
            if edge.get("type").and_then(Value::as_str) != Some("LIKES") {
                continue;
            }
            let Some(node) = self.graph.get_node(&other).await? else {
                continue;
            };
            if node.get("entity_type").and_then(Value::as_str) == Some("user_preference")
                && !names.contains(&other)
            {
                names.push(other);
            }
        }
        names.sort();
        Ok(names)
    }

    /// All positive-point entity ids plus the id-to-name mapping.
    async fn positive_points(&self) -> Result<(HashSet<String>, HashMap<String, String>)> {
        let mut target_ids = HashSet::new();
        let mut target_names = HashMap::new();
        for props in self.graph.nodes_with_type("positive_point").await? {
            let Some(name) = props.get("name").and_then(Value::as_str) else {
                continue;
            };
            let entity_id = props
                .get("entity_id")
                .and_then(Value::as_str)
                .map_or_else(|| ids::entity_id(name), String::from);
            target_ids.insert(entity_id.clone());
            target_names.insert(entity_id, name.to_string());
        }
        Ok((target_ids, target_names))
    }

    /// ANN + cosine re-rank + LLM validation for one preference node.
    async fn correlate_source(
        &self,
        source_name: &str,
        target_ids: &HashSet<String>,
        target_names: &HashMap<String, String>,
    ) -> Result<(usize, Vec<RecoEdge>)> {
        let source_id = ids::entity_id(source_name);
        let Some(source_vec) = self.vectors.get_vector(NS_ENTITIES, &source_id).await? else {
            // The embedding may trail the graph write; skip this source.
            debug!(name: "reco.source.unembedded", source = source_name, "preference has no vector yet");
            return Ok((0, Vec::new()));
        };

        let hits = self
            .vectors
            .query_by_vector(NS_ENTITIES, &source_vec, self.config.ann_top_k, Some(target_ids))
            .await?;

        // Distance gate, then explicit cosine re-rank.
        let mut survivors = Vec::new();
        for hit in hits {
            if hit.distance >= self.config.distance_threshold {
                continue;
            }
            let Some(target_vec) = self.vectors.get_vector(NS_ENTITIES, &hit.id).await? else {
                continue;
            };
            let similarity = cosine_similarity(&source_vec, &target_vec);
            survivors.push((hit.id, hit.distance, similarity));
        }
        survivors.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        survivors.truncate(self.config.top_k_cosine);

        let mut created = 0usize;
        let mut verified = Vec::new();
        for (target_id, distance, similarity) in survivors {
            ensure_active(&self.cancel)?;
            let Some(target_name) = target_names.get(&target_id) else {
                continue;
            };
            if let Some(edge) = self
                .validate_pair(source_name, target_name, distance, similarity)
                .await?
            {
                let written = self.persist_edge(&edge).await?;
                if written {
                    created += 1;
                }
                verified.push(edge);
            }
        }
        Ok((created, verified))
    }

    /// Ask the judge whether the pair is compatible.
    async fn validate_pair(
        &self,
        source_name: &str,
        target_name: &str,
        distance: f32,
        similarity: f32,
    ) -> Result<Option<RecoEdge>> {
        let source_desc = self.node_description(source_name).await?;
        let target_desc = self.node_description(target_name).await?;

        let prompt = self.prompts.render(
            prompts::COMPATIBILITY_CHECK,
            &[
                ("source_name", source_name),
                ("source_description", &source_desc),
                ("target_name", target_name),
                ("target_description", &target_desc),
            ],
        );
        let raw = self.llm.complete(CompletionRequest::new(prompt)).await?;
        let verdict: CompatibilityVerdict = match serde_json::from_str(strip_code_fences(&raw)) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    name: "reco.verdict.unparseable",
                    source = source_name,
                    target = target_name,
                    error = %e,
                    "judge output dropped"
                );
                return Ok(None);
            }
        };
        if !verdict.is_valid {
            debug!(
                name: "reco.pair.rejected",
                source = source_name,
                target = target_name,
                justification = %verdict.justification,
                "pair rejected by judge"
            );
            return Ok(None);
        }

        Ok(Some(RecoEdge {
            source: source_name.to_string(),
            target: target_name.to_string(),
            description: verdict.recommendation_description,
            weight_distance: f64::from(distance),
            weight_similarity: f64::from(similarity),
            compatibility_score: verdict.compatibility_score.clamp(0.0, 1.0),
            status: RecoStatus::ToValidate,
        }))
    }

    async fn node_description(&self, name: &str) -> Result<String> {
        Ok(self
            .graph
            .get_node(name)
            .await?
            .and_then(|props| {
                props.get("description").and_then(Value::as_str).map(String::from)
            })
            .unwrap_or_default())
    }

    /// Write the edge unless a `done` edge already exists. Returns whether a
    /// write happened.
    async fn persist_edge(&self, edge: &RecoEdge) -> Result<bool> {
        let _guard = self
            .locks
            .acquire(&KeyedLocks::pair_key(&edge.source, &edge.target))
            .await;

        if let Some(existing) = self
            .graph
            .get_edge_typed(&edge.source, &edge.target, RECO_EDGE_TYPE)
            .await?
        {
            let status = existing
                .get("status")
                .and_then(Value::as_str)
                .and_then(RecoStatus::parse);
            if status == Some(RecoStatus::Done) {
                debug!(
                    name: "reco.edge.preserved",
                    source = %edge.source,
                    target = %edge.target,
                    "existing done edge kept"
                );
                return Ok(false);
            }
            // A stale to_validate candidate is replaced outright.
            self.graph
                .delete_edge_typed(&edge.source, &edge.target, RECO_EDGE_TYPE)
                .await?;
        }

        let mut props = Props::new();
        props.insert("type".into(), json!(RECO_EDGE_TYPE));
        props.insert("description".into(), json!(edge.description));
        props.insert("weight_distance".into(), json!(edge.weight_distance));
        props.insert("weight_similarity".into(), json!(edge.weight_similarity));
        props.insert("compatibility_score".into(), json!(edge.compatibility_score));
        props.insert("status".into(), json!(edge.status.as_str()));
        self.graph.upsert_edge(&edge.source, &edge.target, props).await?;
        Ok(true)
    }
}
