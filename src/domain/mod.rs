//! Domain model: documents, chunks, entities, relations, and reco edges.
//!
//! These are the records the three stores agree on. The graph store owns the
//! canonical entity and relation records; the vector store owns embeddings
//! keyed by the same ids; the key-value store owns immutable document and
//! chunk payloads.

use crate::error::{FabricError, Result};
use crate::ids;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// =============================================================================
// Source kinds and documents
// =============================================================================

/// What kind of free-text description a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Activity,
    User,
    Event,
    Memo,
    Query,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Activity => "activity",
            SourceKind::User => "user",
            SourceKind::Event => "event",
            SourceKind::Memo => "memo",
            SourceKind::Query => "query",
        }
    }
}

/// An immutable ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// `doc-` + sha256 of the text.
    pub id: String,
    pub text: String,
    pub source_kind: SourceKind,
    /// Caller-supplied metadata propagated to the principal entity.
    pub metadata: Map<String, Value>,
}

/// A contiguous token window of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `chunk-` + sha256 of the text.
    pub id: String,
    pub doc_id: String,
    pub ordinal: usize,
    /// Inclusive start of the token range.
    pub token_start: usize,
    /// Exclusive end of the token range.
    pub token_end: usize,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// =============================================================================
// Entities and relations
// =============================================================================

/// Sentinel type for entities whose declared type is not in the configured
/// closed set.
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";

/// A logical graph node representing a real-world concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Normalised label; unique within the graph and the `entities`
    /// collection.
    pub name: String,
    pub entity_type: String,
    /// `<SEP>`-merged description across mentions.
    pub description: String,
    /// Chunk ids that cited this entity.
    pub source_chunks: Vec<String>,
    /// Caller-supplied stable identifier (user handle, restaurant cid).
    #[serde(default)]
    pub custom_id: Option<String>,
}

impl Entity {
    pub fn entity_id(&self) -> String {
        ids::entity_id(&self.name)
    }

    /// The string embedded into the `entities` vector collection.
    pub fn embedding_content(&self) -> String {
        format!("{}\n{}", self.name, self.description)
    }
}

/// A typed directed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    /// Resolved at upsert from the endpoint entity types; `DIRECTED` when
    /// unmapped.
    pub relation_type: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    /// Chunk ids that cited this relation.
    pub source_chunks: Vec<String>,
}

impl Relation {
    pub fn relation_id(&self) -> String {
        ids::relation_id(&self.source, &self.target)
    }

    /// The string embedded into the `relations` vector collection.
    pub fn embedding_content(&self) -> String {
        format!(
            "{} {} {} {}",
            self.source, self.target, self.keywords, self.description
        )
    }
}

// =============================================================================
// Reco edges
// =============================================================================

/// Edge type for materialised recommendations.
pub const RECO_EDGE_TYPE: &str = "RECO";

/// Validation status of a reco edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoStatus {
    ToValidate,
    Done,
}

impl RecoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoStatus::ToValidate => "to_validate",
            RecoStatus::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "to_validate" => Some(RecoStatus::ToValidate),
            "done" => Some(RecoStatus::Done),
            _ => None,
        }
    }
}

/// A validated recommendation from a `user_preference` node to a
/// `positive_point` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoEdge {
    pub source: String,
    pub target: String,
    pub description: String,
    /// Cosine distance observed at ANN time.
    pub weight_distance: f64,
    /// Explicit cosine similarity computed at re-rank time.
    pub weight_similarity: f64,
    /// Judge verdict, clamped to `[0, 1]`.
    pub compatibility_score: f64,
    pub status: RecoStatus,
}

// =============================================================================
// Ingestion envelope
// =============================================================================

/// Wire payload for document ingestion, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestPayload {
    Activity {
        cid: String,
        resume: String,
        #[serde(default)]
        city: Option<String>,
        #[serde(default)]
        lat: Option<f64>,
        #[serde(default)]
        lng: Option<f64>,
    },
    User {
        user_id: String,
        user_info: String,
    },
    Event {
        event_id: String,
        description: String,
        #[serde(default)]
        start_date: Option<String>,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default)]
        city: Option<String>,
    },
    Memo {
        memo_id: String,
        description: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    Query {
        custom_id: String,
        response: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
}

/// How the orchestrator locates the principal entity for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalEntity {
    /// A node whose normalised name is known up front (users, events, memos,
    /// queries).
    Named { name: String, entity_type: String },
    /// The first extracted entity of the given type (the restaurant of an
    /// activity resume).
    FirstOfType { entity_type: String },
}

impl IngestPayload {
    /// Parse and validate a raw JSON payload. Unknown `type` values and
    /// missing required fields surface as [`FabricError::UserInput`].
    pub fn from_json(raw: &Value) -> Result<Self> {
        let payload: IngestPayload = serde_json::from_value(raw.clone())
            .map_err(|e| FabricError::UserInput(format!("bad ingest payload: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<()> {
        let text = self.text();
        if text.trim().is_empty() {
            return Err(FabricError::UserInput(
                "payload text must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            IngestPayload::Activity { .. } => SourceKind::Activity,
            IngestPayload::User { .. } => SourceKind::User,
            IngestPayload::Event { .. } => SourceKind::Event,
            IngestPayload::Memo { .. } => SourceKind::Memo,
            IngestPayload::Query { .. } => SourceKind::Query,
        }
    }

    /// The free text that gets chunked and extracted.
    pub fn text(&self) -> &str {
        match self {
            IngestPayload::Activity { resume, .. } => resume,
            IngestPayload::User { user_info, .. } => user_info,
            IngestPayload::Event { description, .. } => description,
            IngestPayload::Memo { description, .. } => description,
            IngestPayload::Query { response, .. } => response,
        }
    }

    /// Caller metadata stamped onto the principal entity node.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        match self {
            IngestPayload::Activity { cid, city, lat, lng, .. } => {
                meta.insert("custom_id".into(), json!(cid));
                meta.insert("cid".into(), json!(cid));
                if let Some(city) = city {
                    meta.insert("city".into(), json!(city));
                }
                if let Some(lat) = lat {
                    meta.insert("lat".into(), json!(lat));
                }
                if let Some(lng) = lng {
                    meta.insert("lng".into(), json!(lng));
                }
            }
            IngestPayload::User { user_id, .. } => {
                meta.insert("custom_id".into(), json!(user_id));
                meta.insert("user_id".into(), json!(user_id));
            }
            IngestPayload::Event { event_id, start_date, end_date, city, .. } => {
                meta.insert("custom_id".into(), json!(event_id));
                if let Some(v) = start_date {
                    meta.insert("start_date".into(), json!(v));
                }
                if let Some(v) = end_date {
                    meta.insert("end_date".into(), json!(v));
                }
                if let Some(v) = city {
                    meta.insert("city".into(), json!(v));
                }
            }
            IngestPayload::Memo { memo_id, user_id, .. } => {
                meta.insert("custom_id".into(), json!(memo_id));
                if let Some(v) = user_id {
                    meta.insert("user_id".into(), json!(v));
                }
            }
            IngestPayload::Query { custom_id, user_id, timestamp, .. } => {
                meta.insert("custom_id".into(), json!(custom_id));
                if let Some(v) = user_id {
                    meta.insert("user_id".into(), json!(v));
                }
                if let Some(v) = timestamp {
                    meta.insert("timestamp".into(), json!(v));
                }
            }
        }
        meta
    }

    /// Where the caller metadata lands.
    pub fn principal_entity(&self) -> PrincipalEntity {
        match self {
            IngestPayload::Activity { .. } => PrincipalEntity::FirstOfType {
                entity_type: "restaurant".into(),
            },
            IngestPayload::User { user_id, .. } => PrincipalEntity::Named {
                name: ids::normalise_name(user_id),
                entity_type: "user".into(),
            },
            IngestPayload::Event { event_id, .. } => PrincipalEntity::Named {
                name: ids::normalise_name(event_id),
                entity_type: "event".into(),
            },
            IngestPayload::Memo { memo_id, .. } => PrincipalEntity::Named {
                name: ids::normalise_name(memo_id),
                entity_type: "memo".into(),
            },
            IngestPayload::Query { custom_id, .. } => PrincipalEntity::Named {
                name: ids::normalise_name(custom_id),
                entity_type: "query".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_activity_payload() {
        let raw = json!({
            "type": "activity",
            "cid": "3091293945615310311",
            "resume": "Le Coquemar est un restaurant français",
            "city": "Lyon",
            "lat": 45.76,
            "lng": 4.82
        });
        let payload = IngestPayload::from_json(&raw).unwrap();
        assert_eq!(payload.source_kind(), SourceKind::Activity);
        assert_eq!(payload.text(), "Le Coquemar est un restaurant français");
        let meta = payload.metadata();
        assert_eq!(meta["custom_id"], json!("3091293945615310311"));
        assert_eq!(meta["city"], json!("Lyon"));
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = json!({"type": "banquet", "text": "x"});
        let err = IngestPayload::from_json(&raw).unwrap_err();
        assert!(matches!(err, FabricError::UserInput(_)));
    }

    #[test]
    fn rejects_missing_required_field() {
        let raw = json!({"type": "user", "user_id": "lea"});
        assert!(IngestPayload::from_json(&raw).is_err());
    }

    #[test]
    fn rejects_empty_text() {
        let raw = json!({"type": "user", "user_id": "lea", "user_info": "  "});
        assert!(matches!(
            IngestPayload::from_json(&raw),
            Err(FabricError::UserInput(_))
        ));
    }

    #[test]
    fn user_principal_is_normalised_handle() {
        let raw = json!({"type": "user", "user_id": "lea", "user_info": "Lea adore les pizzas"});
        let payload = IngestPayload::from_json(&raw).unwrap();
        assert_eq!(
            payload.principal_entity(),
            PrincipalEntity::Named { name: "LEA".into(), entity_type: "user".into() }
        );
    }

    #[test]
    fn reco_status_round_trips() {
        assert_eq!(RecoStatus::parse("done"), Some(RecoStatus::Done));
        assert_eq!(RecoStatus::parse("to_validate"), Some(RecoStatus::ToValidate));
        assert_eq!(RecoStatus::parse("bogus"), None);
    }
}
