//! Cross-chunk merge of extraction output.
//!
//! Every chunk of a document is extracted independently; this module folds
//! the per-chunk buckets into one entity and one relation per key.
//! Descriptions and keywords are `<SEP>`-joined without duplicates,
//! relation weights are summed, and relation endpoints that were never
//! emitted as entity records become placeholder entities.

use crate::domain::{Entity, Relation, UNKNOWN_ENTITY_TYPE};
use crate::ids::FIELD_SEP;
use std::collections::{BTreeMap, HashMap};

/// Extraction output of a single chunk, names already normalised and types
/// already validated against the configured closed set.
#[derive(Debug, Clone, Default)]
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub entities: Vec<ChunkEntity>,
    pub relations: Vec<ChunkRelation>,
    pub content_keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ChunkRelation {
    pub source: String,
    pub target: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
}

fn join_unique(parts: &mut Vec<String>, incoming: &str) {
    let incoming = incoming.trim();
    if !incoming.is_empty() && !parts.iter().any(|p| p == incoming) {
        parts.push(incoming.to_string());
    }
}

/// Most frequent non-UNKNOWN type wins; ties break lexicographically so the
/// result is independent of chunk order.
fn dominant_type(counts: &HashMap<String, usize>) -> String {
    counts
        .iter()
        .filter(|(ty, _)| ty.as_str() != UNKNOWN_ENTITY_TYPE)
        .max_by(|(ty_a, n_a), (ty_b, n_b)| n_a.cmp(n_b).then_with(|| ty_b.cmp(ty_a)))
        .map(|(ty, _)| ty.clone())
        .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string())
}

struct EntityAccumulator {
    type_counts: HashMap<String, usize>,
    descriptions: Vec<String>,
    source_chunks: Vec<String>,
}

struct RelationAccumulator {
    descriptions: Vec<String>,
    keywords: Vec<String>,
    weight: f64,
    source_chunks: Vec<String>,
}

/// Fold per-chunk buckets into deduplicated entities and relations.
/// `BTreeMap` keys keep the output deterministic.
pub fn merge_extractions(
    extractions: &[ChunkExtraction],
) -> (Vec<Entity>, Vec<Relation>) {
    let mut entities: BTreeMap<String, EntityAccumulator> = BTreeMap::new();
    let mut relations: BTreeMap<(String, String), RelationAccumulator> = BTreeMap::new();

    for extraction in extractions {
        for entity in &extraction.entities {
            let acc = entities
                .entry(entity.name.clone())
                .or_insert_with(|| EntityAccumulator {
                    type_counts: HashMap::new(),
                    descriptions: Vec::new(),
                    source_chunks: Vec::new(),
                });
            *acc.type_counts.entry(entity.entity_type.clone()).or_default() += 1;
            join_unique(&mut acc.descriptions, &entity.description);
            join_unique(&mut acc.source_chunks, &extraction.chunk_id);
        }

        for relation in &extraction.relations {
            let key = (relation.source.clone(), relation.target.clone());
            let acc = relations.entry(key).or_insert_with(|| RelationAccumulator {
                descriptions: Vec::new(),
                keywords: Vec::new(),
                weight: 0.0,
                source_chunks: Vec::new(),
            });
            acc.weight += relation.weight;
            join_unique(&mut acc.descriptions, &relation.description);
            join_unique(&mut acc.keywords, &relation.keywords);
            join_unique(&mut acc.source_chunks, &extraction.chunk_id);
        }
    }

    // Relation endpoints the model never described become placeholder nodes
    // so the edge always has both ends.
    for ((source, target), acc) in &relations {
        for endpoint in [source, target] {
            entities
                .entry(endpoint.clone())
                .or_insert_with(|| EntityAccumulator {
                    type_counts: HashMap::new(),
                    descriptions: acc
                        .descriptions
                        .first()
                        .map(|d| vec![d.clone()])
                        .unwrap_or_default(),
                    source_chunks: acc.source_chunks.clone(),
                });
        }
    }

    let merged_entities = entities
        .into_iter()
        .map(|(name, acc)| Entity {
            name,
            entity_type: dominant_type(&acc.type_counts),
            description: acc.descriptions.join(FIELD_SEP),
            source_chunks: acc.source_chunks,
            custom_id: None,
        })
        .collect();

    let merged_relations = relations
        .into_iter()
        .map(|((source, target), acc)| Relation {
            source,
            target,
            relation_type: String::new(),
            description: acc.descriptions.join(FIELD_SEP),
            keywords: acc.keywords.join(FIELD_SEP),
            weight: acc.weight,
            source_chunks: acc.source_chunks,
        })
        .collect();

    (merged_entities, merged_relations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, ty: &str, desc: &str) -> ChunkEntity {
        ChunkEntity {
            name: name.into(),
            entity_type: ty.into(),
            description: desc.into(),
        }
    }

    fn relation(src: &str, tgt: &str, weight: f64) -> ChunkRelation {
        ChunkRelation {
            source: src.into(),
            target: tgt.into(),
            description: format!("{src}-{tgt}"),
            keywords: "kw".into(),
            weight,
        }
    }

    #[test]
    fn descriptions_join_without_duplicates() {
        let extractions = vec![
            ChunkExtraction {
                chunk_id: "c1".into(),
                entities: vec![entity("LYON", "location", "une ville")],
                ..Default::default()
            },
            ChunkExtraction {
                chunk_id: "c2".into(),
                entities: vec![
                    entity("LYON", "location", "une ville"),
                    entity("LYON", "location", "capitale de la gastronomie"),
                ],
                ..Default::default()
            },
        ];
        let (entities, _) = merge_extractions(&extractions);
        assert_eq!(entities.len(), 1);
        assert_eq!(
            entities[0].description,
            "une ville<SEP>capitale de la gastronomie"
        );
        assert_eq!(entities[0].source_chunks, vec!["c1", "c2"]);
    }

    #[test]
    fn relation_weights_sum_within_a_document() {
        let extractions = vec![
            ChunkExtraction {
                chunk_id: "c1".into(),
                relations: vec![relation("A", "B", 2.0)],
                ..Default::default()
            },
            ChunkExtraction {
                chunk_id: "c2".into(),
                relations: vec![relation("A", "B", 3.0)],
                ..Default::default()
            },
        ];
        let (_, relations) = merge_extractions(&extractions);
        assert_eq!(relations.len(), 1);
        assert!((relations[0].weight - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn relation_endpoints_get_placeholder_entities() {
        let extractions = vec![ChunkExtraction {
            chunk_id: "c1".into(),
            relations: vec![relation("A", "B", 1.0)],
            ..Default::default()
        }];
        let (entities, _) = merge_extractions(&extractions);
        let names: Vec<_> = entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(entities.iter().all(|e| e.entity_type == UNKNOWN_ENTITY_TYPE));
    }

    #[test]
    fn dominant_type_ignores_unknown_and_is_order_free() {
        let a = vec![
            ChunkExtraction {
                chunk_id: "c1".into(),
                entities: vec![entity("X", "UNKNOWN", "d")],
                ..Default::default()
            },
            ChunkExtraction {
                chunk_id: "c2".into(),
                entities: vec![entity("X", "restaurant", "d")],
                ..Default::default()
            },
        ];
        let mut b = a.clone();
        b.reverse();
        let (ea, _) = merge_extractions(&a);
        let (eb, _) = merge_extractions(&b);
        assert_eq!(ea[0].entity_type, "restaurant");
        assert_eq!(eb[0].entity_type, "restaurant");
    }
}
