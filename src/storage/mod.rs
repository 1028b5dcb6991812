//! Storage behaviour: key-value, vector, and graph adapters.
//!
//! Each of the three storage kinds is a small behavioural trait; a backend
//! is selected at construction time. A deployment may share one physical
//! backend, but the logical namespaces stay disjoint. All adapters retry
//! their own transient failures (3 attempts, exponential backoff, base 1s,
//! cap 10s) before surfacing [`FabricError::StorageUnavailable`].

pub mod memory;
pub mod surreal;

use crate::error::{FabricError, Result};
use crate::ids::FIELD_SEP;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Namespaces
// =============================================================================

/// Key-value namespaces.
pub const NS_FULL_DOCS: &str = "full_docs";
pub const NS_TEXT_CHUNKS: &str = "text_chunks";
pub const NS_LLM_CACHE: &str = "llm_cache";

/// Vector collections.
pub const NS_CHUNKS: &str = "chunks";
pub const NS_ENTITIES: &str = "entities";
pub const NS_RELATIONS: &str = "relations";

// =============================================================================
// Key-value store
// =============================================================================

/// Namespaced mapping from string key to JSON document. Writes are
/// idempotent, last-writer-wins per id.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get_by_id(&self, ns: &str, id: &str) -> Result<Option<Value>>;

    /// Fetch several documents, aligned with the input ids; missing ids map
    /// to `None`.
    async fn get_by_ids(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>>;

    async fn upsert(&self, ns: &str, docs: HashMap<String, Value>) -> Result<()>;

    /// The subset of `ids` not present in the namespace.
    async fn filter_keys(&self, ns: &str, ids: &[String]) -> Result<Vec<String>>;

    async fn drop_namespace(&self, ns: &str) -> Result<()>;

    /// Commit hook invoked at the end of an ingestion pass.
    async fn index_done_callback(&self) -> Result<()>;
}

// =============================================================================
// Vector store
// =============================================================================

/// A record to embed and upsert. The store generates the embedding from
/// `content` through its embedding client.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// An ANN hit. `distance` is cosine distance in `[0, 2]`.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub distance: f32,
    pub metadata: Map<String, Value>,
}

/// Namespaced collection of `(id, vector, metadata)` with cosine ANN search.
#[async_trait]
pub trait VectorStore: Send + Sync + std::fmt::Debug {
    /// Embed and upsert records. Collection creation is lazy: the first
    /// upsert declares the dimension.
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()>;

    /// Embed `text` and rank the collection by cosine distance, ascending,
    /// truncated to `top_k`. When `id_filter` is given the candidate set is
    /// restricted before ranking.
    async fn query(
        &self,
        ns: &str,
        text: &str,
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>>;

    /// Rank against an explicit query vector (reco correlation path).
    async fn query_by_vector(
        &self,
        ns: &str,
        vector: &[f32],
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>>;

    /// Raw stored vector for an id, if present.
    async fn get_vector(&self, ns: &str, id: &str) -> Result<Option<Vec<f32>>>;

    async fn index_done_callback(&self) -> Result<()>;
}

/// Cosine distance in `[0, 2]`; orthogonal or zero vectors map to 1.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Sort hits ascending by distance, ties broken by id so ordering is stable.
pub fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// =============================================================================
// Graph store
// =============================================================================

/// Node and edge property bags. All values are scalar after coercion.
pub type Props = Map<String, Value>;

/// Property graph with labelled nodes (label = normalised entity name) and
/// typed edges. Upserts merge commutatively; per-name writes are serialised
/// inside the adapter.
#[async_trait]
pub trait GraphStore: Send + Sync + std::fmt::Debug {
    async fn has_node(&self, name: &str) -> Result<bool>;
    async fn has_edge(&self, source: &str, target: &str) -> Result<bool>;
    async fn get_node(&self, name: &str) -> Result<Option<Props>>;

    /// The relation edge between two nodes, ignoring reco edges.
    async fn get_edge(&self, source: &str, target: &str) -> Result<Option<Props>>;

    /// The edge of a specific type between two nodes.
    async fn get_edge_typed(
        &self,
        source: &str,
        target: &str,
        edge_type: &str,
    ) -> Result<Option<Props>>;

    /// Number of edges touching a node.
    async fn node_degree(&self, name: &str) -> Result<usize>;

    /// Sum of the endpoint degrees.
    async fn edge_degree(&self, source: &str, target: &str) -> Result<usize>;

    /// All `(source, target)` pairs incident to a node.
    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>>;

    async fn upsert_node(&self, name: &str, props: Props) -> Result<()>;

    /// Merge an edge. When `props` carries no `type`, the adapter resolves
    /// one from the endpoint entity types.
    async fn upsert_edge(&self, source: &str, target: &str, props: Props) -> Result<()>;

    /// Delete the edge of a specific type between two nodes (reco
    /// replacement path).
    async fn delete_edge_typed(&self, source: &str, target: &str, edge_type: &str) -> Result<()>;

    /// Nodes of a given entity type.
    async fn nodes_with_type(&self, entity_type: &str) -> Result<Vec<Props>>;

    /// Nodes carrying a given `custom_id`.
    async fn nodes_with_custom_id(&self, custom_id: &str) -> Result<Vec<(String, Props)>>;

    /// Collapse `user` nodes sharing a `custom_id` onto the earliest-created
    /// one, re-wiring every incident edge. Returns the number of nodes
    /// removed.
    async fn merge_duplicate_users(&self) -> Result<usize>;

    async fn index_done_callback(&self) -> Result<()>;
}

// =============================================================================
// Edge-type resolution
// =============================================================================

/// Default edge type for unmapped entity-type pairs.
pub const DEFAULT_EDGE_TYPE: &str = "DIRECTED";

/// Symmetric mapping from endpoint entity types to an edge type. The table
/// ships with the built-in pairs and is configurable per deployment.
#[derive(Debug, Clone)]
pub struct EdgeTypeTable {
    pairs: HashMap<(String, String), String>,
}

impl Default for EdgeTypeTable {
    fn default() -> Self {
        Self::from_pairs(&[
            ("activity", "positive_point", "HAS_FEATURE"),
            ("activity", "negative_point", "HAS_FEATURE"),
            ("activity", "recommendation", "RECOMMENDS"),
            ("user", "user_preference", "LIKES"),
            ("user", "user_attribute", "HAS_INFORMATION"),
            ("activity", "ActivityCategory", "CLASSIFIED_AS"),
        ])
    }
}

impl EdgeTypeTable {
    pub fn from_pairs(entries: &[(&str, &str, &str)]) -> Self {
        let mut pairs = HashMap::new();
        for (a, b, ty) in entries {
            pairs.insert(((*a).to_string(), (*b).to_string()), (*ty).to_string());
            pairs.insert(((*b).to_string(), (*a).to_string()), (*ty).to_string());
        }
        Self { pairs }
    }

    /// Edge type for a pair of entity types; symmetric, `DIRECTED` fallback.
    pub fn resolve(&self, source_type: &str, target_type: &str) -> &str {
        self.pairs
            .get(&(source_type.to_string(), target_type.to_string()))
            .map_or(DEFAULT_EDGE_TYPE, String::as_str)
    }
}

// =============================================================================
// Merge rules
// =============================================================================

/// Union of two `<SEP>`-joined strings, first-seen order, duplicates dropped.
pub fn sep_union(existing: &str, incoming: &str) -> String {
    let mut seen = Vec::new();
    for part in existing.split(FIELD_SEP).chain(incoming.split(FIELD_SEP)) {
        let part = part.trim();
        if !part.is_empty() && !seen.iter().any(|s: &&str| *s == part) {
            seen.push(part);
        }
    }
    seen.join(FIELD_SEP)
}

/// Coerce a JSON value to a scalar; arrays and objects become their JSON
/// text.
pub fn coerce_scalar(value: Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => {
            Value::String(serde_json::to_string(&value).unwrap_or_default())
        }
        scalar => scalar,
    }
}

fn as_f64(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

/// Commutative node-property merge: descriptions and chunk citations union
/// by `<SEP>`, a known entity type is never displaced by `UNKNOWN`, other
/// scalars are last-writer-wins.
pub fn merge_node_props(existing: &mut Props, incoming: Props) {
    for (key, value) in incoming {
        let value = coerce_scalar(value);
        match key.as_str() {
            "description" | "source_chunks" | "keywords" => {
                let old = existing.get(&key).and_then(Value::as_str).unwrap_or("");
                let new = value.as_str().unwrap_or("");
                existing.insert(key, Value::String(sep_union(old, new)));
            }
            "entity_type" => {
                let old_known = matches!(
                    existing.get("entity_type").and_then(Value::as_str),
                    Some(t) if t != crate::domain::UNKNOWN_ENTITY_TYPE
                );
                let incoming_unknown = value
                    .as_str()
                    .is_none_or(|t| t == crate::domain::UNKNOWN_ENTITY_TYPE);
                if !(old_known && incoming_unknown) {
                    existing.insert(key, value);
                }
            }
            "created_at" => {
                // First writer wins so the earliest-created choice in
                // merge_duplicate_users stays stable.
                if !existing.contains_key("created_at") {
                    existing.insert(key, value);
                }
            }
            _ => {
                existing.insert(key, value);
            }
        }
    }
}

/// Commutative edge-property merge: weight by max, strings by `<SEP>` union,
/// the first resolved type sticks.
pub fn merge_edge_props(existing: &mut Props, incoming: Props) {
    for (key, value) in incoming {
        let value = coerce_scalar(value);
        match key.as_str() {
            "weight" => {
                let merged = as_f64(existing.get("weight")).max(as_f64(Some(&value)));
                existing.insert(key, serde_json::json!(merged));
            }
            "description" | "keywords" | "source_chunks" => {
                let old = existing.get(&key).and_then(Value::as_str).unwrap_or("");
                let new = value.as_str().unwrap_or("");
                existing.insert(key, Value::String(sep_union(old, new)));
            }
            "type" => {
                if !existing.contains_key("type") {
                    existing.insert(key, value);
                }
            }
            _ => {
                existing.insert(key, value);
            }
        }
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Retry a storage operation on transient failure: 3 attempts, exponential
/// backoff from 1s capped at 10s.
pub async fn retry_storage<T, Fut, F>(op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < ATTEMPTS => {
                warn!(name: "storage.retry", op, attempt, error = %e, "transient storage failure, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a backend driver error to the taxonomy.
pub fn backend_error(op: &str, e: impl std::fmt::Display) -> FabricError {
    FabricError::StorageUnavailable(format!("{op}: {e}"))
}
