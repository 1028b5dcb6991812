//! Integration tests for the ingestion pipeline: chunk/entity persistence,
//! metadata propagation, idempotency, and duplicate-user merging.

mod common;

use common::{StubEmbedder, activity_payload, default_routes, fabric_with, user_payload};
use serde_json::{Value, json};
use tastevin::domain::IngestPayload;
use tastevin::ids;
use tastevin::storage::{NS_CHUNKS, NS_ENTITIES, NS_FULL_DOCS, NS_TEXT_CHUNKS};

fn payload(raw: &Value) -> IngestPayload {
    IngestPayload::from_json(raw).expect("payload parses")
}

#[tokio::test]
async fn restaurant_ingest_builds_graph_and_vectors() -> anyhow::Result<()> {
    let t = fabric_with(StubEmbedder::new(), default_routes());

    let report = t.fabric.ingest.ingest(payload(&activity_payload())).await?;
    assert!(!report.skipped);
    assert!(report.chunks >= 1);
    assert!(report.entities >= 3);

    // The restaurant node carries the caller metadata.
    let node = t.graph.get_node("LE_COQUEMAR").await.unwrap().expect("restaurant node");
    assert_eq!(node["entity_type"], json!("restaurant"));
    assert_eq!(node["custom_id"], json!("3091293945615310311"));
    assert_eq!(node["city"], json!("Lyon"));
    assert_eq!(node["entity_id"], json!(ids::entity_id("LE_COQUEMAR")));

    // At least one edge to LYON.
    assert!(t.graph.has_edge("LE_COQUEMAR", "LYON").await.unwrap());
    let lyon = t.graph.get_node("LYON").await.unwrap().expect("location node");
    assert_eq!(lyon["entity_type"], json!("location"));

    // Round-trip: every chunk in KV has a vector under the same id, and the
    // entity embedding uses the hashed id.
    let chunk_ids: Vec<String> = {
        let doc_id = report.doc_id.clone();
        let doc = t.kv.get_by_id(NS_FULL_DOCS, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc["source_kind"], json!("activity"));
        // Collect chunk ids through the vector hits instead of scanning KV.
        let hits = t
            .vectors
            .query(NS_CHUNKS, "Le Coquemar", 10, None)
            .await
            .unwrap();
        hits.into_iter().map(|h| h.id).collect()
    };
    assert!(!chunk_ids.is_empty());
    for chunk_id in &chunk_ids {
        let stored = t.kv.get_by_id(NS_TEXT_CHUNKS, chunk_id).await.unwrap();
        assert!(stored.is_some(), "chunk {chunk_id} missing from KV");
    }
    let entity_vec = t
        .vectors
        .get_vector(NS_ENTITIES, &ids::entity_id("LE_COQUEMAR"))
        .await?;
    assert!(entity_vec.is_some());
    Ok(())
}

#[tokio::test]
async fn duplicate_ingest_is_idempotent() {
    let t = fabric_with(StubEmbedder::new(), default_routes());

    let first = t.fabric.ingest.ingest(payload(&activity_payload())).await.unwrap();
    let second = t.fabric.ingest.ingest(payload(&activity_payload())).await.unwrap();

    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(first.doc_id, second.doc_id);

    // Exactly one restaurant node and one embedding for it.
    let restaurants = t.graph.nodes_with_type("restaurant").await.unwrap();
    assert_eq!(restaurants.len(), 1);
    let entity_vec = t
        .vectors
        .get_vector(NS_ENTITIES, &ids::entity_id("LE_COQUEMAR"))
        .await
        .unwrap();
    assert!(entity_vec.is_some());

    // No duplicate chunks: the vector hits are unique ids.
    let hits = t.vectors.query(NS_CHUNKS, "Le Coquemar", 50, None).await.unwrap();
    let mut ids: Vec<String> = hits.into_iter().map(|h| h.id).collect();
    let before = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), before);
}

#[tokio::test]
async fn merge_commutativity_across_documents() {
    // Two documents mention LYON with different descriptions; the merged
    // description is the same set of parts regardless of ingest order.
    let second_resume = json!({
        "type": "activity",
        "cid": "777",
        "resume": "Chez Paulette, institution lyonnaise au coeur du Vieux Lyon.",
    });
    let second_extraction = concat!(
        "(\"entity\"<|>\"Chez Paulette\"<|>\"restaurant\"<|>\"Institution lyonnaise.\")##",
        "(\"entity\"<|>\"Lyon\"<|>\"location\"<|>\"Capitale de la gastronomie.\")##",
        "(\"relationship\"<|>\"Chez Paulette\"<|>\"Lyon\"<|>\"au coeur du Vieux Lyon\"<|>\"localisation\"<|>7)<|COMPLETE|>"
    );
    let mut routes = default_routes();
    routes.push(("Chez Paulette", second_extraction));

    let run = |order: bool| {
        let routes = routes.clone();
        let second = second_resume.clone();
        async move {
            let t = fabric_with(StubEmbedder::new(), routes);
            let (a, b) = (activity_payload(), second);
            if order {
                t.fabric.ingest.ingest(payload(&a)).await.unwrap();
                t.fabric.ingest.ingest(payload(&b)).await.unwrap();
            } else {
                t.fabric.ingest.ingest(payload(&b)).await.unwrap();
                t.fabric.ingest.ingest(payload(&a)).await.unwrap();
            }
            let node = t.graph.get_node("LYON").await.unwrap().unwrap();
            let mut parts: Vec<String> = node["description"]
                .as_str()
                .unwrap()
                .split("<SEP>")
                .map(String::from)
                .collect();
            parts.sort();
            parts
        }
    };

    assert_eq!(run(true).await, run(false).await);
}

#[tokio::test]
async fn user_ingest_creates_principal_with_custom_id() {
    let t = fabric_with(StubEmbedder::new(), default_routes());
    t.fabric.ingest.ingest(payload(&user_payload())).await.unwrap();

    let node = t.graph.get_node("LEA").await.unwrap().expect("user node");
    assert_eq!(node["entity_type"], json!("user"));
    assert_eq!(node["custom_id"], json!("lea"));

    // Preference extracted and linked by LIKES.
    let edge = t.graph.get_edge("LEA", "PIZZAS_NAPOLITAINES").await.unwrap().unwrap();
    assert_eq!(edge["type"], json!("LIKES"));
}

#[tokio::test]
async fn duplicate_users_collapse_onto_earliest() {
    let t = fabric_with(StubEmbedder::new(), default_routes());
    t.fabric.ingest.ingest(payload(&user_payload())).await.unwrap();

    // A second handle for the same person, as an upstream rename produces.
    let second = json!({
        "type": "user",
        "user_id": "lea2",
        "user_info": "Lea adore les pizzas napolitaines, profil migré."
    });
    t.fabric.ingest.ingest(payload(&second)).await.unwrap();
    let mut props = tastevin::storage::Props::new();
    props.insert("custom_id".into(), json!("lea"));
    t.graph.upsert_node("LEA2", props).await.unwrap();

    let removed = t.graph.merge_duplicate_users().await.unwrap();
    assert_eq!(removed, 1);

    // One surviving user with this custom id; the LIKES edge survives.
    let survivors = t.graph.nodes_with_custom_id("lea").await.unwrap();
    let users: Vec<_> = survivors
        .iter()
        .filter(|(_, p)| p.get("entity_type").and_then(Value::as_str) == Some("user"))
        .collect();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].0, "LEA");
    assert!(t.graph.has_edge("LEA", "PIZZAS_NAPOLITAINES").await.unwrap());
    assert!(!t.graph.has_node("LEA2").await.unwrap());
}

#[tokio::test]
async fn zero_entity_documents_still_ingest_chunks() {
    // No extraction route matches the memo text, so the model returns the
    // empty completion for it.
    let t = fabric_with(StubEmbedder::new(), default_routes());
    let memo = json!({
        "type": "memo",
        "memo_id": "m-42",
        "description": "Penser à réserver pour samedi soir."
    });
    let report = t.fabric.ingest.ingest(payload(&memo)).await.unwrap();
    assert!(report.chunks >= 1);

    // The principal memo node exists even without extracted entities.
    let node = t.graph.get_node("M42").await.unwrap().expect("memo node");
    assert_eq!(node["entity_type"], json!("memo"));
}

#[tokio::test]
async fn unknown_payload_type_is_rejected() {
    let err = IngestPayload::from_json(&json!({"type": "banquet", "x": 1})).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}
