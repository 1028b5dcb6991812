//! Tabular context assembly.
//!
//! Retrieved entities, relations, and source chunks are rendered as CSV
//! tables inside the answer prompt, each section truncated to its token
//! budget.

use crate::chunking::Tokenizer;

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct RelationRow {
    pub source: String,
    pub target: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: String,
    pub text: String,
}

/// Retrieved graph context before formatting.
#[derive(Debug, Clone, Default)]
pub struct GraphContext {
    pub entities: Vec<EntityRow>,
    pub relations: Vec<RelationRow>,
    pub chunks: Vec<ChunkRow>,
}

impl GraphContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.chunks.is_empty()
    }

    /// Union with another context, deduplicated by entity name, relation
    /// pair, and chunk id.
    pub fn merge(mut self, other: GraphContext) -> GraphContext {
        for entity in other.entities {
            if !self.entities.iter().any(|e| e.name == entity.name) {
                self.entities.push(entity);
            }
        }
        for relation in other.relations {
            let seen = self
                .relations
                .iter()
                .any(|r| r.source == relation.source && r.target == relation.target);
            if !seen {
                self.relations.push(relation);
            }
        }
        for chunk in other.chunks {
            if !self.chunks.iter().any(|c| c.id == chunk.id) {
                self.chunks.push(chunk);
            }
        }
        self
    }

    /// Apply per-section token budgets, keeping the highest-ranked rows.
    pub fn truncate(
        mut self,
        tokenizer: &Tokenizer,
        max_entity_tokens: usize,
        max_relation_tokens: usize,
        max_chunk_tokens: usize,
    ) -> GraphContext {
        self.entities.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.name.cmp(&b.name)));
        self.relations.sort_by(|a, b| {
            b.rank
                .cmp(&a.rank)
                .then_with(|| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| (a.source.clone(), a.target.clone()).cmp(&(b.source.clone(), b.target.clone())))
        });

        self.entities =
            tokenizer.truncate_list(self.entities, |e| e.description.clone(), max_entity_tokens);
        self.relations =
            tokenizer.truncate_list(self.relations, |r| r.description.clone(), max_relation_tokens);
        self.chunks = tokenizer.truncate_list(self.chunks, |c| c.text.clone(), max_chunk_tokens);
        self
    }

    /// Render the three CSV sections the answer prompt consumes.
    pub fn format(&self) -> String {
        let mut out = String::new();

        out.push_str("-----Entities-----\n```csv\nid,entity,type,description,rank\n");
        for (i, e) in self.entities.iter().enumerate() {
            out.push_str(&format!(
                "{i},{},{},{},{}\n",
                csv_escape(&e.name),
                csv_escape(&e.entity_type),
                csv_escape(&e.description),
                e.rank
            ));
        }
        out.push_str("```\n-----Relationships-----\n```csv\nid,source,target,description,keywords,weight,rank\n");
        for (i, r) in self.relations.iter().enumerate() {
            out.push_str(&format!(
                "{i},{},{},{},{},{},{}\n",
                csv_escape(&r.source),
                csv_escape(&r.target),
                csv_escape(&r.description),
                csv_escape(&r.keywords),
                r.weight,
                r.rank
            ));
        }
        out.push_str("```\n-----Sources-----\n```csv\nid,content\n");
        for (i, c) in self.chunks.iter().enumerate() {
            out.push_str(&format!("{i},{}\n", csv_escape(&c.text)));
        }
        out.push_str("```\n");
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> GraphContext {
        GraphContext {
            entities: vec![EntityRow {
                name: "LE_COQUEMAR".into(),
                entity_type: "restaurant".into(),
                description: "bouchon, lyonnais".into(),
                rank: 2,
            }],
            relations: vec![RelationRow {
                source: "LE_COQUEMAR".into(),
                target: "LYON".into(),
                description: "situé à Lyon".into(),
                keywords: "lieu".into(),
                weight: 9.0,
                rank: 3,
            }],
            chunks: vec![ChunkRow { id: "chunk-1".into(), text: "texte".into() }],
        }
    }

    #[test]
    fn format_renders_three_sections() {
        let rendered = ctx().format();
        assert!(rendered.contains("-----Entities-----"));
        assert!(rendered.contains("-----Relationships-----"));
        assert!(rendered.contains("-----Sources-----"));
        // Embedded comma forces quoting.
        assert!(rendered.contains("\"bouchon, lyonnais\""));
    }

    #[test]
    fn merge_dedups_by_id() {
        let merged = ctx().merge(ctx());
        assert_eq!(merged.entities.len(), 1);
        assert_eq!(merged.relations.len(), 1);
        assert_eq!(merged.chunks.len(), 1);
    }

    #[test]
    fn truncate_orders_by_rank() {
        let tokenizer = Tokenizer::new().unwrap();
        let mut context = ctx();
        context.entities.push(EntityRow {
            name: "LYON".into(),
            entity_type: "location".into(),
            description: "ville".into(),
            rank: 9,
        });
        let truncated = context.truncate(&tokenizer, 4000, 4000, 4000);
        assert_eq!(truncated.entities[0].name, "LYON");
    }

    #[test]
    fn empty_context_reports_empty() {
        assert!(GraphContext::default().is_empty());
        assert!(!ctx().is_empty());
    }
}
