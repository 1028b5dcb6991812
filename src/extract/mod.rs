//! Entity and relationship extraction.
//!
//! Runs the extraction prompt over each chunk, parses tuple records, gleans
//! entities the model missed on the first pass, and merges per-chunk
//! buckets into document-level entities and relations.

pub mod merge;
pub mod records;

use crate::chunking::Tokenizer;
use crate::domain::{Chunk, Entity, Relation, UNKNOWN_ENTITY_TYPE};
use crate::error::Result;
use crate::ids::{FIELD_SEP, normalise_name};
use crate::llm::{CompletionRequest, HistoryMessage, LlmClient};
use crate::prompts::{self, PromptRegistry};
use merge::{ChunkEntity, ChunkExtraction, ChunkRelation};
use records::{Delimiters, RawRecord, parse_records};
use std::sync::Arc;
use tracing::{debug, warn};

/// Knobs of the extraction stage.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Closed set of entity types accepted from the model.
    pub entity_types: Vec<String>,
    /// Extra gleaning rounds after the first pass.
    pub max_gleaning: usize,
    /// Descriptions above this token count get an LLM summary.
    pub summary_max_tokens: usize,
}

/// LLM-backed extractor.
pub struct EntityExtractor {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRegistry>,
    tokenizer: Tokenizer,
    delimiters: Delimiters,
    config: ExtractorConfig,
}

impl std::fmt::Debug for EntityExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityExtractor")
            .field("entity_types", &self.config.entity_types.len())
            .field("max_gleaning", &self.config.max_gleaning)
            .finish()
    }
}

impl EntityExtractor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRegistry>,
        tokenizer: Tokenizer,
        config: ExtractorConfig,
    ) -> Self {
        Self { llm, prompts, tokenizer, delimiters: Delimiters::default(), config }
    }

    fn extraction_prompt(&self, text: &str) -> String {
        self.prompts.render(
            prompts::ENTITY_EXTRACTION,
            &[
                ("entity_types", &self.config.entity_types.join(", ")),
                ("tuple_delimiter", &self.delimiters.tuple),
                ("record_delimiter", &self.delimiters.record),
                ("completion_delimiter", &self.delimiters.completion),
                ("input_text", text),
            ],
        )
    }

    /// Map a raw type string onto the configured closed set,
    /// case-insensitively; anything else lands in the `UNKNOWN` bucket.
    fn canonical_type(&self, raw: &str) -> String {
        let lowered = raw.trim().to_lowercase();
        self.config
            .entity_types
            .iter()
            .find(|ty| ty.to_lowercase() == lowered)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string())
    }

    fn collect(&self, chunk_id: &str, raw: &str, out: &mut ChunkExtraction) {
        let (parsed, dropped) = parse_records(raw, &self.delimiters);
        if dropped > 0 {
            warn!(name: "extract.records.dropped", chunk_id, dropped, "malformed extraction records dropped");
        }
        for record in parsed {
            match record {
                RawRecord::Entity { name, entity_type, description } => {
                    let name = normalise_name(&name);
                    if name.is_empty() {
                        continue;
                    }
                    out.entities.push(ChunkEntity {
                        name,
                        entity_type: self.canonical_type(&entity_type),
                        description,
                    });
                }
                RawRecord::Relation { source, target, description, keywords, weight } => {
                    let source = normalise_name(&source);
                    let target = normalise_name(&target);
                    if source.is_empty() || target.is_empty() || source == target {
                        continue;
                    }
                    out.relations.push(ChunkRelation {
                        source,
                        target,
                        description,
                        keywords,
                        weight,
                    });
                }
                RawRecord::ContentKeywords(keywords) => {
                    out.content_keywords.extend(keywords);
                }
            }
        }
    }

    /// Extract one chunk, gleaning up to the configured number of extra
    /// rounds.
    pub async fn extract_chunk(&self, chunk: &Chunk) -> Result<ChunkExtraction> {
        let mut out = ChunkExtraction { chunk_id: chunk.id.clone(), ..Default::default() };

        let prompt = self.extraction_prompt(&chunk.text);
        let first = self.llm.complete(CompletionRequest::new(prompt.clone())).await?;
        self.collect(&chunk.id, &first, &mut out);

        let mut history = vec![
            HistoryMessage::user(prompt),
            HistoryMessage::assistant(first),
        ];

        for round in 0..self.config.max_gleaning {
            let continue_prompt = self.prompts.get(prompts::CONTINUE_EXTRACTION).to_string();
            let gleaned = self
                .llm
                .complete(
                    CompletionRequest::new(continue_prompt.clone())
                        .with_history(history.clone()),
                )
                .await?;
            self.collect(&chunk.id, &gleaned, &mut out);
            history.push(HistoryMessage::user(continue_prompt));
            history.push(HistoryMessage::assistant(gleaned));

            if round + 1 == self.config.max_gleaning {
                break;
            }
            let verdict = self
                .llm
                .complete(
                    CompletionRequest::new(self.prompts.get(prompts::IF_LOOP).to_string())
                        .with_history(history.clone()),
                )
                .await?;
            if !verdict.trim().to_uppercase().starts_with("YES") {
                break;
            }
        }

        debug!(
            name: "extract.chunk.done",
            chunk_id = %chunk.id,
            entities = out.entities.len(),
            relations = out.relations.len(),
            "chunk extraction finished"
        );
        Ok(out)
    }

    /// Merge per-chunk buckets and summarise descriptions that grew past the
    /// token budget.
    pub async fn merge_document(
        &self,
        extractions: &[ChunkExtraction],
    ) -> Result<(Vec<Entity>, Vec<Relation>)> {
        let (mut entities, relations) = merge::merge_extractions(extractions);

        for entity in &mut entities {
            if self.tokenizer.count_tokens(&entity.description) <= self.config.summary_max_tokens {
                continue;
            }
            let prompt = self.prompts.render(
                prompts::SUMMARIZE_ENTITY_DESCRIPTIONS,
                &[
                    ("entity_name", &entity.name),
                    ("description_list", &entity.description.replace(FIELD_SEP, ", ")),
                ],
            );
            let summary = self.llm.complete(CompletionRequest::new(prompt)).await?;
            let summary = summary.trim();
            if !summary.is_empty() {
                entity.description = summary.to_string();
            }
        }
        Ok((entities, relations))
    }
}
