//! Ingestion orchestrator.
//!
//! End-to-end pipeline for one document: fingerprint, chunk, extract,
//! merge, then upsert nodes, edges, and embeddings across the three stores.
//! Stages are sequential within a document; documents are processed in
//! parallel by independent callers. Everything written here is an
//! idempotent upsert, so a re-ingest after a partial failure converges.

use crate::chunking::Chunker;
use crate::concurrency::{bounded_map, ensure_active};
use crate::domain::{Chunk, Document, Entity, IngestPayload, PrincipalEntity, Relation};
use crate::error::Result;
use crate::extract::EntityExtractor;
use crate::ids::FIELD_SEP;
use crate::storage::{
    GraphStore, KvStore, NS_CHUNKS, NS_ENTITIES, NS_FULL_DOCS, NS_RELATIONS, NS_TEXT_CHUNKS,
    Props, VectorRecord, VectorStore,
};
use crate::{ids, storage};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one ingestion pass.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub doc_id: String,
    /// The document was already present; nothing was written.
    pub skipped: bool,
    pub chunks: usize,
    pub entities: usize,
    pub relations: usize,
}

pub struct IngestService {
    kv: Arc<dyn KvStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    extractor: Arc<EntityExtractor>,
    chunker: Chunker,
    llm_max_async: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("llm_max_async", &self.llm_max_async)
            .finish()
    }
}

impl IngestService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        extractor: Arc<EntityExtractor>,
        chunker: Chunker,
        llm_max_async: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self { kv, vectors, graph, extractor, chunker, llm_max_async, cancel }
    }

    /// Ingest one payload. Returns early (skipped) when the document
    /// fingerprint is already known.
    pub async fn ingest(&self, payload: IngestPayload) -> Result<IngestReport> {
        ensure_active(&self.cancel)?;

        let text = payload.text().trim().to_string();
        let doc_id = ids::doc_id(&text);

        let missing = self
            .kv
            .filter_keys(NS_FULL_DOCS, std::slice::from_ref(&doc_id))
            .await?;
        if missing.is_empty() {
            info!(name: "ingest.document.skipped", doc_id = %doc_id, "document already ingested");
            return Ok(IngestReport { doc_id, skipped: true, chunks: 0, entities: 0, relations: 0 });
        }

        // Chunk and drop the windows we have already seen.
        let chunks = self.chunker.chunk(&doc_id, &text)?;
        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let new_ids: HashSet<String> = self
            .kv
            .filter_keys(NS_TEXT_CHUNKS, &chunk_ids)
            .await?
            .into_iter()
            .collect();
        let new_chunks: Vec<Chunk> =
            chunks.into_iter().filter(|c| new_ids.contains(&c.id)).collect();

        ensure_active(&self.cancel)?;
        self.store_chunks(&new_chunks).await?;

        // Per-chunk extraction, bounded by the model concurrency budget.
        let futures: Vec<_> = new_chunks
            .iter()
            .map(|chunk| {
                let extractor = Arc::clone(&self.extractor);
                let cancel = self.cancel.clone();
                async move {
                    ensure_active(&cancel)?;
                    extractor.extract_chunk(chunk).await
                }
            })
            .collect();
        let extractions = bounded_map(self.llm_max_async, futures)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let (mut entities, relations) = self.extractor.merge_document(&extractions).await?;
        let principal = self.resolve_principal(&payload, &mut entities);

        ensure_active(&self.cancel)?;
        self.store_graph(&entities, &relations).await?;
        self.store_entity_vectors(&entities, &relations).await?;

        if let Some(principal_name) = principal {
            self.propagate_metadata(&principal_name, payload.metadata()).await?;
        }

        // The document fingerprint is written last so a failed pass stays
        // retryable.
        let document = Document {
            id: doc_id.clone(),
            text,
            source_kind: payload.source_kind(),
            metadata: payload.metadata(),
        };
        self.kv
            .upsert(
                NS_FULL_DOCS,
                HashMap::from([(doc_id.clone(), serde_json::to_value(&document).unwrap_or(Value::Null))]),
            )
            .await?;

        self.kv.index_done_callback().await?;
        self.vectors.index_done_callback().await?;
        self.graph.index_done_callback().await?;

        info!(
            name: "ingest.document.completed",
            doc_id = %doc_id,
            kind = payload.source_kind().as_str(),
            chunks = new_chunks.len(),
            entities = entities.len(),
            relations = relations.len(),
            "document ingested"
        );
        Ok(IngestReport {
            doc_id,
            skipped: false,
            chunks: new_chunks.len(),
            entities: entities.len(),
            relations: relations.len(),
        })
    }

    async fn store_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut kv_docs = HashMap::new();
        let mut records = Vec::new();
        for chunk in chunks {
            kv_docs.insert(
                chunk.id.clone(),
                serde_json::to_value(chunk).unwrap_or(Value::Null),
            );
            let mut metadata = Map::new();
            metadata.insert("doc_id".into(), json!(chunk.doc_id));
            metadata.insert("ordinal".into(), json!(chunk.ordinal));
            records.push(VectorRecord {
                id: chunk.id.clone(),
                content: chunk.text.clone(),
                metadata,
            });
        }
        self.kv.upsert(NS_TEXT_CHUNKS, kv_docs).await?;
        self.vectors.upsert(NS_CHUNKS, records).await
    }

    /// Locate (or create) the node that carries the caller metadata.
    fn resolve_principal(
        &self,
        payload: &IngestPayload,
        entities: &mut Vec<Entity>,
    ) -> Option<String> {
        match payload.principal_entity() {
            PrincipalEntity::Named { name, entity_type } => {
                if !entities.iter().any(|e| e.name == name) {
                    // The extraction may never mention the handle itself;
                    // materialise the node so the metadata has a home.
                    entities.push(Entity {
                        name: name.clone(),
                        entity_type,
                        description: payload.text().trim().to_string(),
                        source_chunks: Vec::new(),
                        custom_id: None,
                    });
                } else if let Some(existing) =
                    entities.iter_mut().find(|e| e.name == name)
                {
                    if existing.entity_type == crate::domain::UNKNOWN_ENTITY_TYPE {
                        existing.entity_type = entity_type;
                    }
                }
                Some(name)
            }
            PrincipalEntity::FirstOfType { entity_type } => {
                let found = entities
                    .iter()
                    .find(|e| e.entity_type == entity_type)
                    .map(|e| e.name.clone());
                if found.is_none() {
                    warn!(
                        name: "ingest.principal.missing",
                        kind = payload.source_kind().as_str(),
                        entity_type = %entity_type,
                        "no principal entity extracted; caller metadata not propagated"
                    );
                }
                found
            }
        }
    }

    async fn store_graph(&self, entities: &[Entity], relations: &[Relation]) -> Result<()> {
        for entity in entities {
            let mut props = Props::new();
            props.insert("entity_id".into(), json!(entity.entity_id()));
            props.insert("entity_type".into(), json!(entity.entity_type));
            props.insert("description".into(), json!(entity.description));
            props.insert(
                "source_chunks".into(),
                json!(entity.source_chunks.join(FIELD_SEP)),
            );
            if let Some(custom_id) = &entity.custom_id {
                props.insert("custom_id".into(), json!(custom_id));
            }
            storage::retry_storage("upsert_node", || {
                self.graph.upsert_node(&entity.name, props.clone())
            })
            .await?;
        }
        for relation in relations {
            let mut props = Props::new();
            props.insert("relation_id".into(), json!(relation.relation_id()));
            props.insert("weight".into(), json!(relation.weight));
            props.insert("description".into(), json!(relation.description));
            props.insert("keywords".into(), json!(relation.keywords));
            props.insert(
                "source_chunks".into(),
                json!(relation.source_chunks.join(FIELD_SEP)),
            );
            storage::retry_storage("upsert_edge", || {
                self.graph
                    .upsert_edge(&relation.source, &relation.target, props.clone())
            })
            .await?;
        }
        Ok(())
    }

    async fn store_entity_vectors(
        &self,
        entities: &[Entity],
        relations: &[Relation],
    ) -> Result<()> {
        let entity_records: Vec<VectorRecord> = entities
            .iter()
            .map(|entity| {
                let mut metadata = Map::new();
                metadata.insert("entity_name".into(), json!(entity.name));
                metadata.insert("entity_type".into(), json!(entity.entity_type));
                VectorRecord {
                    id: entity.entity_id(),
                    content: entity.embedding_content(),
                    metadata,
                }
            })
            .collect();
        self.vectors.upsert(NS_ENTITIES, entity_records).await?;

        let relation_records: Vec<VectorRecord> = relations
            .iter()
            .map(|relation| {
                let mut metadata = Map::new();
                metadata.insert("source_name".into(), json!(relation.source));
                metadata.insert("target_name".into(), json!(relation.target));
                VectorRecord {
                    id: relation.relation_id(),
                    content: relation.embedding_content(),
                    metadata,
                }
            })
            .collect();
        self.vectors.upsert(NS_RELATIONS, relation_records).await
    }

    async fn propagate_metadata(&self, principal: &str, metadata: Map<String, Value>) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        storage::retry_storage("propagate_metadata", || {
            self.graph.upsert_node(principal, metadata.clone())
        })
        .await
    }
}
