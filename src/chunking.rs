//! Token-window chunker.
//!
//! Documents are split into consecutive windows of `max_token_size` tokens
//! with a fixed overlap, using the cl100k_base vocabulary. Chunking is
//! deterministic: the same text always yields the same chunks and therefore
//! the same content-addressed chunk ids.

use crate::domain::Chunk;
use crate::error::{FabricError, Result};
use crate::ids;
use serde_json::Map;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Shared cl100k_base tokenizer. Construction is expensive; build once and
/// clone the `Arc`.
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("vocab", &"cl100k_base").finish()
    }
}

impl Tokenizer {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| FabricError::Configuration(format!("tokenizer init failed: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Truncate `text` to at most `max_tokens` tokens.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> Result<String> {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return Ok(text.to_string());
        }
        self.decode(tokens[..max_tokens].to_vec())
    }

    /// Keep list entries (in order) while the running token total stays under
    /// `max_tokens`.
    pub fn truncate_list<T>(
        &self,
        items: Vec<T>,
        text_of: impl Fn(&T) -> String,
        max_tokens: usize,
    ) -> Vec<T> {
        let mut total = 0usize;
        let mut kept = Vec::new();
        for item in items {
            total += self.count_tokens(&text_of(&item));
            if total > max_tokens && !kept.is_empty() {
                break;
            }
            kept.push(item);
        }
        kept
    }

    /// Decode a token window. Window boundaries can split a multi-byte
    /// character, so the bytes are converted lossily.
    fn decode(&self, tokens: Vec<u32>) -> Result<String> {
        let bytes: Vec<u8> = self.bpe._decode_native_and_split(tokens).flatten().collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Splits documents into overlapping token windows.
#[derive(Debug, Clone)]
pub struct Chunker {
    tokenizer: Tokenizer,
    max_token_size: usize,
    overlap_token_size: usize,
}

impl Chunker {
    pub fn new(tokenizer: Tokenizer, max_token_size: usize, overlap_token_size: usize) -> Result<Self> {
        if max_token_size == 0 || overlap_token_size >= max_token_size {
            return Err(FabricError::Configuration(format!(
                "invalid chunking window: max {max_token_size}, overlap {overlap_token_size}"
            )));
        }
        Ok(Self { tokenizer, max_token_size, overlap_token_size })
    }

    /// Produce the chunks of `text`, each carrying its ordinal and token
    /// range. Empty input yields no chunks.
    pub fn chunk(&self, doc_id: &str, text: &str) -> Result<Vec<Chunk>> {
        let tokens = self.tokenizer.bpe.encode_with_special_tokens(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let step = self.max_token_size - self.overlap_token_size;
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut ordinal = 0usize;
        loop {
            let end = (start + self.max_token_size).min(tokens.len());
            let slice = tokens[start..end].to_vec();
            let chunk_text = self.tokenizer.decode(slice)?;
            let trimmed = chunk_text.trim();
            if !trimmed.is_empty() {
                chunks.push(Chunk {
                    id: ids::chunk_id(trimmed),
                    doc_id: doc_id.to_string(),
                    ordinal,
                    token_start: start,
                    token_end: end,
                    text: trimmed.to_string(),
                    metadata: Map::new(),
                });
                ordinal += 1;
            }
            if end == tokens.len() {
                break;
            }
            start += step;
        }
        Ok(chunks)
    }
}
