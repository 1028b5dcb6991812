//! In-memory storage providers.
//!
//! These back the test suites and the `memory` deployment backend. The
//! vector store ranks with brute-force cosine over the whole collection; the
//! graph store keeps a petgraph `StableDiGraph` with a name index. A single
//! `RwLock` per store serialises writers, which satisfies the per-name
//! serialisation invariant.

use crate::domain::UNKNOWN_ENTITY_TYPE;
use crate::embedding::EmbeddingClient;
use crate::error::{FabricError, Result};
use crate::storage::{
    EdgeTypeTable, GraphStore, KvStore, Props, VectorHit, VectorRecord, VectorStore,
    cosine_distance, merge_edge_props, merge_node_props, sort_hits,
};
use async_trait::async_trait;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Key-value store
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    namespaces: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_by_id(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces.get(ns).and_then(|m| m.get(id)).cloned())
    }

    async fn get_by_ids(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let namespaces = self.namespaces.read().await;
        let map = namespaces.get(ns);
        Ok(ids
            .iter()
            .map(|id| map.and_then(|m| m.get(id)).cloned())
            .collect())
    }

    async fn upsert(&self, ns: &str, docs: HashMap<String, Value>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let map = namespaces.entry(ns.to_string()).or_default();
        for (id, doc) in docs {
            map.insert(id, doc);
        }
        Ok(())
    }

    async fn filter_keys(&self, ns: &str, ids: &[String]) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().await;
        let map = namespaces.get(ns);
        Ok(ids
            .iter()
            .filter(|id| !map.is_some_and(|m| m.contains_key(*id)))
            .cloned()
            .collect())
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        self.namespaces.write().await.remove(ns);
        Ok(())
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Vector store
// =============================================================================

#[derive(Debug)]
struct StoredVector {
    vector: Vec<f32>,
    metadata: Map<String, Value>,
}

#[derive(Debug)]
struct Collection {
    dim: usize,
    records: HashMap<String, StoredVector>,
}

/// Brute-force cosine vector store over in-process collections.
pub struct MemoryVectorStore {
    embedder: Arc<dyn EmbeddingClient>,
    collections: RwLock<HashMap<String, Collection>>,
}

impl std::fmt::Debug for MemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryVectorStore")
            .field("dim", &self.embedder.embedding_dim())
            .finish()
    }
}

impl MemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { embedder, collections: RwLock::new(HashMap::new()) }
    }

    fn rank(
        collection: &Collection,
        query: &[f32],
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Vec<VectorHit> {
        let mut hits: Vec<VectorHit> = collection
            .records
            .iter()
            .filter(|(id, _)| id_filter.is_none_or(|f| f.contains(*id)))
            .map(|(id, stored)| VectorHit {
                id: id.clone(),
                distance: cosine_distance(query, &stored.vector),
                metadata: stored.metadata.clone(),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.embed(texts).await?;

        let mut collections = self.collections.write().await;
        let dim = self.embedder.embedding_dim();
        let collection = collections
            .entry(ns.to_string())
            .or_insert_with(|| Collection { dim, records: HashMap::new() });
        if collection.dim != dim {
            return Err(FabricError::SchemaMismatch(format!(
                "collection {ns} holds {}-d vectors, embedder produces {dim}-d",
                collection.dim
            )));
        }
        for (record, vector) in records.into_iter().zip(vectors) {
            collection
                .records
                .insert(record.id, StoredVector { vector, metadata: record.metadata });
        }
        Ok(())
    }

    async fn query(
        &self,
        ns: &str,
        text: &str,
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let query = self
            .embedder
            .embed(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FabricError::SchemaMismatch("empty embedding batch".into()))?;
        self.query_by_vector(ns, &query, top_k, id_filter).await
    }

    async fn query_by_vector(
        &self,
        ns: &str,
        vector: &[f32],
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(ns)
            .map(|c| Self::rank(c, vector, top_k, id_filter))
            .unwrap_or_default())
    }

    async fn get_vector(&self, ns: &str, id: &str) -> Result<Option<Vec<f32>>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(ns)
            .and_then(|c| c.records.get(id))
            .map(|s| s.vector.clone()))
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Graph store
// =============================================================================

#[derive(Debug)]
struct NodeRecord {
    name: String,
    props: Props,
    created_seq: u64,
}

#[derive(Debug)]
struct EdgeRecord {
    edge_type: String,
    props: Props,
}

#[derive(Debug, Default)]
struct GraphInner {
    graph: StableDiGraph<NodeRecord, EdgeRecord>,
    index: HashMap<String, NodeIndex>,
    next_seq: u64,
}

impl GraphInner {
    fn ensure_node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut props = Map::new();
        props.insert("name".into(), json!(name));
        props.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));
        let idx = self.graph.add_node(NodeRecord {
            name: name.to_string(),
            props,
            created_seq: seq,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn node_type(&self, idx: NodeIndex) -> String {
        self.graph[idx]
            .props
            .get("entity_type")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_ENTITY_TYPE)
            .to_string()
    }

    fn find_edge(
        &self,
        source: NodeIndex,
        target: NodeIndex,
        edge_type: Option<&str>,
    ) -> Option<petgraph::stable_graph::EdgeIndex> {
        self.graph
            .edges_connecting(source, target)
            .find(|e| edge_type.is_none_or(|t| e.weight().edge_type == t))
            .map(|e| e.id())
    }

    fn degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Direction::Outgoing).count()
            + self.graph.edges_directed(idx, Direction::Incoming).count()
    }
}

/// In-process property graph on petgraph.
#[derive(Debug)]
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
    edge_types: EdgeTypeTable,
}

impl MemoryGraphStore {
    pub fn new(edge_types: EdgeTypeTable) -> Self {
        Self { inner: RwLock::new(GraphInner::default()), edge_types }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn has_node(&self, name: &str) -> Result<bool> {
        Ok(self.inner.read().await.index.contains_key(name))
    }

    async fn has_edge(&self, source: &str, target: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        let (Some(&s), Some(&t)) = (inner.index.get(source), inner.index.get(target)) else {
            return Ok(false);
        };
        Ok(inner.find_edge(s, t, None).is_some())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Props>> {
        let inner = self.inner.read().await;
        Ok(inner.index.get(name).map(|idx| inner.graph[*idx].props.clone()))
    }

    async fn get_edge(&self, source: &str, target: &str) -> Result<Option<Props>> {
        let inner = self.inner.read().await;
        let (Some(&s), Some(&t)) = (inner.index.get(source), inner.index.get(target)) else {
            return Ok(None);
        };
        let edge = inner
            .graph
            .edges_connecting(s, t)
            .find(|e| e.weight().edge_type != crate::domain::RECO_EDGE_TYPE)
            .map(|e| e.weight().props.clone());
        Ok(edge)
    }

    async fn get_edge_typed(
        &self,
        source: &str,
        target: &str,
        edge_type: &str,
    ) -> Result<Option<Props>> {
        let inner = self.inner.read().await;
        let (Some(&s), Some(&t)) = (inner.index.get(source), inner.index.get(target)) else {
            return Ok(None);
        };
        Ok(inner
            .find_edge(s, t, Some(edge_type))
            .map(|id| inner.graph[id].props.clone()))
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner.index.get(name).map_or(0, |idx| inner.degree(*idx)))
    }

    async fn edge_degree(&self, source: &str, target: &str) -> Result<usize> {
        Ok(self.node_degree(source).await? + self.node_degree(target).await?)
    }

    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.read().await;
        let Some(&idx) = inner.index.get(name) else {
            return Ok(Vec::new());
        };
        let mut pairs = Vec::new();
        for edge in inner.graph.edges_directed(idx, Direction::Outgoing) {
            pairs.push((
                inner.graph[edge.source()].name.clone(),
                inner.graph[edge.target()].name.clone(),
            ));
        }
        for edge in inner.graph.edges_directed(idx, Direction::Incoming) {
            pairs.push((
                inner.graph[edge.source()].name.clone(),
                inner.graph[edge.target()].name.clone(),
            ));
        }
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }

    async fn upsert_node(&self, name: &str, props: Props) -> Result<()> {
        let mut inner = self.inner.write().await;
        let idx = inner.ensure_node(name);
        merge_node_props(&mut inner.graph[idx].props, props);
        Ok(())
    }

    async fn upsert_edge(&self, source: &str, target: &str, props: Props) -> Result<()> {
        let mut inner = self.inner.write().await;
        let s = inner.ensure_node(source);
        let t = inner.ensure_node(target);

        let edge_type = match props.get("type").and_then(Value::as_str) {
            Some(explicit) => explicit.to_string(),
            None => {
                let st = inner.node_type(s);
                let tt = inner.node_type(t);
                self.edge_types.resolve(&st, &tt).to_string()
            }
        };

        let mut incoming = props;
        incoming.insert("type".into(), json!(edge_type));

        if let Some(edge_id) = inner.find_edge(s, t, Some(edge_type.as_str())) {
            merge_edge_props(&mut inner.graph[edge_id].props, incoming);
        } else {
            inner
                .graph
                .add_edge(s, t, EdgeRecord { edge_type, props: incoming });
        }
        Ok(())
    }

    async fn delete_edge_typed(&self, source: &str, target: &str, edge_type: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let (Some(&s), Some(&t)) = (inner.index.get(source), inner.index.get(target)) else {
            return Ok(());
        };
        if let Some(edge_id) = inner.find_edge(s, t, Some(edge_type)) {
            inner.graph.remove_edge(edge_id);
        }
        Ok(())
    }

    async fn nodes_with_type(&self, entity_type: &str) -> Result<Vec<Props>> {
        let inner = self.inner.read().await;
        Ok(inner
            .graph
            .node_weights()
            .filter(|n| {
                n.props.get("entity_type").and_then(Value::as_str) == Some(entity_type)
            })
            .map(|n| n.props.clone())
            .collect())
    }

    async fn nodes_with_custom_id(&self, custom_id: &str) -> Result<Vec<(String, Props)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .graph
            .node_weights()
            .filter(|n| n.props.get("custom_id").and_then(Value::as_str) == Some(custom_id))
            .map(|n| (n.name.clone(), n.props.clone()))
            .collect())
    }

    async fn merge_duplicate_users(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;

        // Group user nodes by custom_id.
        let mut groups: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        for idx in inner.graph.node_indices().collect::<Vec<_>>() {
            let node = &inner.graph[idx];
            let is_user =
                node.props.get("entity_type").and_then(Value::as_str) == Some("user");
            if !is_user {
                continue;
            }
            if let Some(cid) = node.props.get("custom_id").and_then(Value::as_str) {
                groups.entry(cid.to_string()).or_default().push(idx);
            }
        }

        let mut removed = 0usize;
        for (_cid, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by_key(|idx| inner.graph[*idx].created_seq);
            let primary = members[0];
            for &dup in &members[1..] {
                // Re-wire every incident edge onto the primary, then merge
                // the duplicate's properties and drop it.
                let outgoing: Vec<_> = inner
                    .graph
                    .edges_directed(dup, Direction::Outgoing)
                    .map(|e| (e.target(), e.weight().edge_type.clone(), e.weight().props.clone()))
                    .collect();
                let incoming: Vec<_> = inner
                    .graph
                    .edges_directed(dup, Direction::Incoming)
                    .map(|e| (e.source(), e.weight().edge_type.clone(), e.weight().props.clone()))
                    .collect();

                for (other, edge_type, props) in outgoing {
                    let other = if other == dup { primary } else { other };
                    if let Some(existing) = inner.find_edge(primary, other, Some(edge_type.as_str())) {
                        merge_edge_props(&mut inner.graph[existing].props, props);
                    } else {
                        inner.graph.add_edge(primary, other, EdgeRecord { edge_type, props });
                    }
                }
                for (other, edge_type, props) in incoming {
                    let other = if other == dup { primary } else { other };
                    if let Some(existing) = inner.find_edge(other, primary, Some(edge_type.as_str())) {
                        merge_edge_props(&mut inner.graph[existing].props, props);
                    } else {
                        inner.graph.add_edge(other, primary, EdgeRecord { edge_type, props });
                    }
                }

                let dup_record = inner
                    .graph
                    .remove_node(dup)
                    .ok_or_else(|| FabricError::StorageUnavailable("node vanished".into()))?;
                inner.index.remove(&dup_record.name);
                let mut dup_props = dup_record.props;
                dup_props.remove("name");
                dup_props.remove("created_at");
                merge_node_props(&mut inner.graph[primary].props, dup_props);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Props {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn kv_filter_keys_reports_missing() {
        let kv = MemoryKvStore::new();
        kv.upsert("text_chunks", HashMap::from([("a".to_string(), json!({"x": 1}))]))
            .await
            .unwrap();
        let missing = kv
            .filter_keys("text_chunks", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn graph_upsert_edge_resolves_type_from_node_types() {
        let graph = MemoryGraphStore::new(EdgeTypeTable::default());
        graph
            .upsert_node("LEA", props(&[("entity_type", json!("user"))]))
            .await
            .unwrap();
        graph
            .upsert_node("PIZZAS", props(&[("entity_type", json!("user_preference"))]))
            .await
            .unwrap();
        graph.upsert_edge("LEA", "PIZZAS", Props::new()).await.unwrap();

        let edge = graph.get_edge("LEA", "PIZZAS").await.unwrap().unwrap();
        assert_eq!(edge["type"], json!("LIKES"));
    }

    #[tokio::test]
    async fn graph_edge_merge_keeps_max_weight() {
        let graph = MemoryGraphStore::new(EdgeTypeTable::default());
        graph
            .upsert_edge("A", "B", props(&[("weight", json!(2.0)), ("description", json!("x"))]))
            .await
            .unwrap();
        graph
            .upsert_edge("A", "B", props(&[("weight", json!(1.0)), ("description", json!("y"))]))
            .await
            .unwrap();
        let edge = graph.get_edge("A", "B").await.unwrap().unwrap();
        assert_eq!(edge["weight"], json!(2.0));
        assert_eq!(edge["description"], json!("x<SEP>y"));
        assert!(!graph.has_edge("B", "A").await.unwrap());
    }

    #[tokio::test]
    async fn degrees_count_both_directions() {
        let graph = MemoryGraphStore::new(EdgeTypeTable::default());
        graph.upsert_edge("A", "B", Props::new()).await.unwrap();
        graph.upsert_edge("C", "A", Props::new()).await.unwrap();
        assert_eq!(graph.node_degree("A").await.unwrap(), 2);
        assert_eq!(graph.edge_degree("A", "B").await.unwrap(), 3);
        let edges = graph.get_node_edges("A").await.unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn reco_edges_are_invisible_to_get_edge() {
        let graph = MemoryGraphStore::new(EdgeTypeTable::default());
        graph
            .upsert_edge("P", "Q", props(&[("type", json!("RECO")), ("status", json!("done"))]))
            .await
            .unwrap();
        assert!(graph.get_edge("P", "Q").await.unwrap().is_none());
        let reco = graph.get_edge_typed("P", "Q", "RECO").await.unwrap().unwrap();
        assert_eq!(reco["status"], json!("done"));
    }

    #[tokio::test]
    async fn merge_duplicate_users_rewires_edges() {
        let graph = MemoryGraphStore::new(EdgeTypeTable::default());
        graph
            .upsert_node(
                "LEA",
                props(&[("entity_type", json!("user")), ("custom_id", json!("lea"))]),
            )
            .await
            .unwrap();
        graph
            .upsert_node(
                "LEA_BIS",
                props(&[("entity_type", json!("user")), ("custom_id", json!("lea"))]),
            )
            .await
            .unwrap();
        graph
            .upsert_node("PIZZAS", props(&[("entity_type", json!("user_preference"))]))
            .await
            .unwrap();
        graph.upsert_edge("LEA_BIS", "PIZZAS", Props::new()).await.unwrap();

        let removed = graph.merge_duplicate_users().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!graph.has_node("LEA_BIS").await.unwrap());
        assert!(graph.has_edge("LEA", "PIZZAS").await.unwrap());
        let survivors = graph.nodes_with_custom_id("lea").await.unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].0, "LEA");
    }
}
