//! SurrealDB storage providers.
//!
//! One SurrealDB connection backs all three logical stores; namespaces map
//! to distinct tables (`kv_*`, `vec_*`, `graph_node`, `graph_edge`).
//! Vector ranking follows the fetch-and-rank approach: candidate rows are
//! pulled and scored with cosine distance in process. Every operation runs
//! through the adapter retry policy before a failure surfaces as
//! `StorageUnavailable`.

use crate::concurrency::KeyedLocks;
use crate::domain::{RECO_EDGE_TYPE, UNKNOWN_ENTITY_TYPE};
use crate::embedding::EmbeddingClient;
use crate::error::{FabricError, Result};
use crate::storage::{
    EdgeTypeTable, GraphStore, KvStore, Props, VectorHit, VectorRecord, VectorStore,
    backend_error, cosine_distance, merge_edge_props, merge_node_props, retry_storage, sort_hits,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};

/// Shared connection handle.
#[derive(Debug, Clone)]
pub struct SurrealSession {
    db: Surreal<Any>,
}

impl SurrealSession {
    pub async fn connect(url: &str, namespace: &str, database: &str) -> Result<Self> {
        let db = connect(url).await.map_err(|e| backend_error("connect", e))?;
        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| backend_error("use_ns", e))?;
        Ok(Self { db })
    }
}

fn kv_table(ns: &str) -> String {
    format!("kv_{ns}")
}

fn vec_table(ns: &str) -> String {
    format!("vec_{ns}")
}

fn edge_key(source: &str, target: &str, edge_type: &str) -> String {
    format!("{source}|{target}|{edge_type}")
}

// =============================================================================
// Key-value store
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct KvRecord {
    key: String,
    doc: Value,
}

#[derive(Debug)]
pub struct SurrealKvStore {
    session: SurrealSession,
}

impl SurrealKvStore {
    pub fn new(session: SurrealSession) -> Self {
        Self { session }
    }

    async fn fetch(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        let record: Option<KvRecord> = self
            .session
            .db
            .select((kv_table(ns), id))
            .await
            .map_err(|e| backend_error("kv.select", e))?;
        Ok(record.map(|r| r.doc))
    }
}

#[async_trait]
impl KvStore for SurrealKvStore {
    async fn get_by_id(&self, ns: &str, id: &str) -> Result<Option<Value>> {
        retry_storage("kv.get_by_id", || self.fetch(ns, id)).await
    }

    async fn get_by_ids(&self, ns: &str, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(retry_storage("kv.get_by_ids", || self.fetch(ns, id)).await?);
        }
        Ok(out)
    }

    async fn upsert(&self, ns: &str, docs: HashMap<String, Value>) -> Result<()> {
        for (key, doc) in docs {
            let record = KvRecord { key: key.clone(), doc };
            retry_storage("kv.upsert", || async {
                let _: Option<KvRecord> = self
                    .session
                    .db
                    .upsert((kv_table(ns), key.as_str()))
                    .content(KvRecord { key: record.key.clone(), doc: record.doc.clone() })
                    .await
                    .map_err(|e| backend_error("kv.upsert", e))?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn filter_keys(&self, ns: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for id in ids {
            if retry_storage("kv.filter_keys", || self.fetch(ns, id)).await?.is_none() {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    }

    async fn drop_namespace(&self, ns: &str) -> Result<()> {
        retry_storage("kv.drop", || async {
            let _: Vec<KvRecord> = self
                .session
                .db
                .delete(kv_table(ns))
                .await
                .map_err(|e| backend_error("kv.drop", e))?;
            Ok(())
        })
        .await
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Vector store
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct VecRecord {
    key: String,
    content: String,
    vector: Vec<f32>,
    metadata: Value,
}

pub struct SurrealVectorStore {
    session: SurrealSession,
    embedder: Arc<dyn EmbeddingClient>,
}

impl std::fmt::Debug for SurrealVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealVectorStore")
            .field("dim", &self.embedder.embedding_dim())
            .finish()
    }
}

impl SurrealVectorStore {
    pub fn new(session: SurrealSession, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { session, embedder }
    }

    async fn all_records(&self, ns: &str) -> Result<Vec<VecRecord>> {
        self.session
            .db
            .select(vec_table(ns))
            .await
            .map_err(|e| backend_error("vector.select", e))
    }

    fn rank(
        records: Vec<VecRecord>,
        query: &[f32],
        top_k: usize,
        id_filter: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let mut hits = Vec::new();
        for record in records {
            if id_filter.is_some_and(|f| !f.contains(&record.key)) {
                continue;
            }
            if record.vector.len() != query.len() {
                return Err(FabricError::SchemaMismatch(format!(
                    "stored vector for {} has {} dimensions, query has {}",
                    record.key,
                    record.vector.len(),
                    query.len()
                )));
            }
            let metadata = match record.metadata {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            hits.push(VectorHit {
                id: record.key,
                distance: cosine_distance(query, &record.vector),
                metadata,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn upsert(&self, ns: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.embed(texts).await?;

        for (record, vector) in records.into_iter().zip(vectors) {
            retry_storage("vector.upsert", || async {
                let _: Option<VecRecord> = self
                    .session
                    .db
                    .upsert((vec_table(ns), record.id.as_str()))
                    .content(VecRecord {
                        key: record.id.clone(),
                        content: record.content.clone(),
                        vector: vector.clone(),
                        metadata: Value::Object(record.metadata.clone()),
                    })
                    .await
                    .map_err(|e| backend_error("vector.upsert", e))?;
                Ok(())
            })
            .await?;
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
        let records = retry_storage("vector.query", || self.all_records(ns)).await?;
        Self::rank(records, vector, top_k, id_filter)
    }

    async fn get_vector(&self, ns: &str, id: &str) -> Result<Option<Vec<f32>>> {
        retry_storage("vector.get", || async {
            let record: Option<VecRecord> = self
                .session
                .db
                .select((vec_table(ns), id))
                .await
                .map_err(|e| backend_error("vector.get", e))?;
            Ok(record.map(|r| r.vector))
        })
        .await
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Graph store
// =============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
struct NodeRow {
    name: String,
    props: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct EdgeRow {
    source: String,
    target: String,
    edge_type: String,
    props: Value,
}

#[derive(Debug)]
pub struct SurrealGraphStore {
    session: SurrealSession,
    edge_types: EdgeTypeTable,
    locks: KeyedLocks,
}

impl SurrealGraphStore {
    pub fn new(session: SurrealSession, edge_types: EdgeTypeTable) -> Self {
        Self { session, edge_types, locks: KeyedLocks::new() }
    }

    async fn fetch_node(&self, name: &str) -> Result<Option<NodeRow>> {
        self.session
            .db
            .select(("graph_node", name))
            .await
            .map_err(|e| backend_error("graph.get_node", e))
    }

    async fn edges_touching(&self, name: &str) -> Result<Vec<EdgeRow>> {
        let mut response = self
            .session
            .db
            .query("SELECT * FROM graph_edge WHERE source = $name OR target = $name")
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| backend_error("graph.edges", e))?;
        response.take(0).map_err(|e| backend_error("graph.edges", e))
    }

    async fn edges_between(&self, source: &str, target: &str) -> Result<Vec<EdgeRow>> {
        let mut response = self
            .session
            .db
            .query("SELECT * FROM graph_edge WHERE source = $source AND target = $target")
            .bind(("source", source.to_string()))
            .bind(("target", target.to_string()))
            .await
            .map_err(|e| backend_error("graph.edges_between", e))?;
        response.take(0).map_err(|e| backend_error("graph.edges_between", e))
    }

    async fn write_node(&self, name: &str, row: NodeRow) -> Result<()> {
        let _: Option<NodeRow> = self
            .session
            .db
            .upsert(("graph_node", name))
            .content(row)
            .await
            .map_err(|e| backend_error("graph.upsert_node", e))?;
        Ok(())
    }

    async fn write_edge(&self, row: EdgeRow) -> Result<()> {
        let key = edge_key(&row.source, &row.target, &row.edge_type);
        let _: Option<EdgeRow> = self
            .session
            .db
            .upsert(("graph_edge", key.as_str()))
            .content(row)
            .await
            .map_err(|e| backend_error("graph.upsert_edge", e))?;
        Ok(())
    }

    async fn delete_edge_row(&self, source: &str, target: &str, edge_type: &str) -> Result<()> {
        let key = edge_key(source, target, edge_type);
        let _: Option<EdgeRow> = self
            .session
            .db
            .delete(("graph_edge", key.as_str()))
            .await
            .map_err(|e| backend_error("graph.delete_edge", e))?;
        Ok(())
    }

    fn props_of(value: Value) -> Props {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn node_entity_type(&self, name: &str) -> Result<String> {
        Ok(self
            .fetch_node(name)
            .await?
            .and_then(|row| {
                Self::props_of(row.props)
                    .get("entity_type")
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string()))
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    async fn has_node(&self, name: &str) -> Result<bool> {
        Ok(retry_storage("graph.has_node", || self.fetch_node(name)).await?.is_some())
    }

    async fn has_edge(&self, source: &str, target: &str) -> Result<bool> {
        let edges = retry_storage("graph.has_edge", || self.edges_between(source, target)).await?;
        Ok(!edges.is_empty())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Props>> {
        let row = retry_storage("graph.get_node", || self.fetch_node(name)).await?;
        Ok(row.map(|r| Self::props_of(r.props)))
    }

    async fn get_edge(&self, source: &str, target: &str) -> Result<Option<Props>> {
        let edges = retry_storage("graph.get_edge", || self.edges_between(source, target)).await?;
        Ok(edges
            .into_iter()
            .find(|e| e.edge_type != RECO_EDGE_TYPE)
            .map(|e| Self::props_of(e.props)))
    }

    async fn get_edge_typed(
        &self,
        source: &str,
        target: &str,
        edge_type: &str,
    ) -> Result<Option<Props>> {
        let edges =
            retry_storage("graph.get_edge_typed", || self.edges_between(source, target)).await?;
        Ok(edges
            .into_iter()
            .find(|e| e.edge_type == edge_type)
            .map(|e| Self::props_of(e.props)))
    }

    async fn node_degree(&self, name: &str) -> Result<usize> {
        let edges = retry_storage("graph.node_degree", || self.edges_touching(name)).await?;
        Ok(edges.len())
    }

    async fn edge_degree(&self, source: &str, target: &str) -> Result<usize> {
        Ok(self.node_degree(source).await? + self.node_degree(target).await?)
    }

    async fn get_node_edges(&self, name: &str) -> Result<Vec<(String, String)>> {
        let edges = retry_storage("graph.get_node_edges", || self.edges_touching(name)).await?;
        let mut pairs: Vec<(String, String)> =
            edges.into_iter().map(|e| (e.source, e.target)).collect();
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }

    async fn upsert_node(&self, name: &str, props: Props) -> Result<()> {
        let _guard = self.locks.acquire(name).await;
        retry_storage("graph.upsert_node", || async {
            let mut merged = match self.fetch_node(name).await? {
                Some(row) => Self::props_of(row.props),
                None => {
                    let mut fresh = Props::new();
                    fresh.insert("name".into(), json!(name));
                    fresh
                        .insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));
                    fresh
                }
            };
            merge_node_props(&mut merged, props.clone());
            self.write_node(name, NodeRow { name: name.to_string(), props: Value::Object(merged) })
                .await
        })
        .await
    }

    async fn upsert_edge(&self, source: &str, target: &str, props: Props) -> Result<()> {
        let edge_type = match props.get("type").and_then(Value::as_str) {
            Some(explicit) => explicit.to_string(),
            None => {
                let source_type = self.node_entity_type(source).await?;
                let target_type = self.node_entity_type(target).await?;
                self.edge_types.resolve(&source_type, &target_type).to_string()
            }
        };

        // Endpoints must exist before the edge does.
        for name in [source, target] {
            if !self.has_node(name).await? {
                self.upsert_node(name, Props::new()).await?;
            }
        }

        let _guard = self.locks.acquire(&KeyedLocks::pair_key(source, target)).await;
        retry_storage("graph.upsert_edge", || async {
            let existing = self
                .edges_between(source, target)
                .await?
                .into_iter()
                .find(|e| e.edge_type == edge_type);
            let mut merged = existing.map(|e| Self::props_of(e.props)).unwrap_or_default();
            let mut incoming = props.clone();
            incoming.insert("type".into(), json!(edge_type));
            merge_edge_props(&mut merged, incoming);
            self.write_edge(EdgeRow {
                source: source.to_string(),
                target: target.to_string(),
                edge_type: edge_type.clone(),
                props: Value::Object(merged),
            })
            .await
        })
        .await
    }

    async fn delete_edge_typed(&self, source: &str, target: &str, edge_type: &str) -> Result<()> {
        retry_storage("graph.delete_edge", || self.delete_edge_row(source, target, edge_type))
            .await
    }

    async fn nodes_with_type(&self, entity_type: &str) -> Result<Vec<Props>> {
        retry_storage("graph.nodes_with_type", || async {
            let mut response = self
                .session
                .db
                .query("SELECT * FROM graph_node WHERE props.entity_type = $ty")
                .bind(("ty", entity_type.to_string()))
                .await
                .map_err(|e| backend_error("graph.nodes_with_type", e))?;
            let rows: Vec<NodeRow> =
                response.take(0).map_err(|e| backend_error("graph.nodes_with_type", e))?;
            Ok(rows.into_iter().map(|r| Self::props_of(r.props)).collect())
        })
        .await
    }

    async fn nodes_with_custom_id(&self, custom_id: &str) -> Result<Vec<(String, Props)>> {
        retry_storage("graph.nodes_with_custom_id", || async {
            let mut response = self
                .session
                .db
                .query("SELECT * FROM graph_node WHERE props.custom_id = $cid")
                .bind(("cid", custom_id.to_string()))
                .await
                .map_err(|e| backend_error("graph.nodes_with_custom_id", e))?;
            let rows: Vec<NodeRow> = response
                .take(0)
                .map_err(|e| backend_error("graph.nodes_with_custom_id", e))?;
            Ok(rows.into_iter().map(|r| (r.name, Self::props_of(r.props))).collect())
        })
        .await
    }

    async fn merge_duplicate_users(&self) -> Result<usize> {
        let users = retry_storage("graph.users", || async {
            let mut response = self
                .session
                .db
                .query("SELECT * FROM graph_node WHERE props.entity_type = 'user' AND props.custom_id != NONE")
                .await
                .map_err(|e| backend_error("graph.users", e))?;
            let rows: Vec<NodeRow> =
                response.take(0).map_err(|e| backend_error("graph.users", e))?;
            Ok(rows)
        })
        .await?;

        let mut groups: HashMap<String, Vec<NodeRow>> = HashMap::new();
        for row in users {
            let props = Self::props_of(row.props.clone());
            let cid = props.get("custom_id").and_then(Value::as_str).map(String::from);
            if let Some(cid) = cid {
                groups.entry(cid).or_default().push(row);
            }
        }

        let mut removed = 0usize;
        for (_cid, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            // Earliest-created node survives; creation order falls back to
            // the name so the choice stays deterministic.
            members.sort_by_key(|row| {
                let created = Self::props_of(row.props.clone())
                    .get("created_at")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                (created, row.name.clone())
            });
            let primary = members[0].name.clone();

            for dup in members.drain(1..) {
                for edge in self.edges_touching(&dup.name).await? {
                    let (new_source, new_target) = if edge.source == dup.name {
                        (primary.clone(), edge.target.clone())
                    } else {
                        (edge.source.clone(), primary.clone())
                    };
                    self.delete_edge_row(&edge.source, &edge.target, &edge.edge_type).await?;
                    let mut props = Self::props_of(edge.props);
                    props.insert("type".into(), json!(edge.edge_type));
                    self.upsert_edge(&new_source, &new_target, props).await?;
                }

                let mut dup_props = Self::props_of(dup.props);
                dup_props.remove("name");
                dup_props.remove("created_at");
                self.upsert_node(&primary, dup_props).await?;

                let _: Option<NodeRow> = self
                    .session
                    .db
                    .delete(("graph_node", dup.name.as_str()))
                    .await
                    .map_err(|e| backend_error("graph.delete_node", e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn index_done_callback(&self) -> Result<()> {
        Ok(())
    }
}
