//! Deterministic ids and label normalisation.
//!
//! Every record in every store is content-addressed: the same text, entity
//! name, or relation pair always hashes to the same id, across restarts and
//! across adapters. Normalised names double as graph labels.

use sha2::{Digest, Sha256};

/// Joiner used when merging descriptions, keywords, and chunk citations.
pub const FIELD_SEP: &str = "<SEP>";

/// Lowercase hex sha256 of the input.
fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalise an entity name into a graph label: strip surrounding quotes,
/// uppercase, collapse whitespace runs to `_`, drop anything outside
/// `[A-Z0-9_]`.
pub fn normalise_name(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_uppercase();

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_sep = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            pending_sep = !out.is_empty();
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_sep {
                out.push('_');
                pending_sep = false;
            }
            out.push(c);
        }
    }
    out
}

pub fn doc_id(text: &str) -> String {
    format!("doc-{}", sha256_hex(text))
}

pub fn chunk_id(text: &str) -> String {
    format!("chunk-{}", sha256_hex(text))
}

/// Entity id from an already-normalised name.
pub fn entity_id(name: &str) -> String {
    format!("ent-{}", sha256_hex(name))
}

/// Relation id from already-normalised endpoint names.
pub fn relation_id(source: &str, target: &str) -> String {
    format!("rel-{}", sha256_hex(&format!("{source}|{target}")))
}

/// Cache key for an LLM completion: hash of everything that shapes the
/// response.
pub fn llm_cache_key(prompt: &str, system: &str, history: &str, model_id: &str) -> String {
    format!("llm-{}", sha256_hex(&format!("{prompt}{system}{history}{model_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_quotes_case_and_whitespace() {
        assert_eq!(normalise_name("\"Le Coquemar\""), "LE_COQUEMAR");
        assert_eq!(normalise_name("  pizzas   napolitaines "), "PIZZAS_NAPOLITAINES");
        assert_eq!(normalise_name("Lyon"), "LYON");
    }

    #[test]
    fn strips_non_alphanumerics() {
        assert_eq!(normalise_name("Café-de-l'Ouest!"), "CAFDELOUEST");
        assert_eq!(normalise_name("croix_rousse"), "CROIX_ROUSSE");
    }

    #[test]
    fn ids_are_stable_and_prefixed() {
        let a = entity_id("LE_COQUEMAR");
        let b = entity_id("LE_COQUEMAR");
        assert_eq!(a, b);
        assert!(a.starts_with("ent-"));
        assert_eq!(a.len(), "ent-".len() + 64);
    }

    #[test]
    fn relation_id_is_direction_sensitive() {
        assert_ne!(relation_id("A", "B"), relation_id("B", "A"));
    }

    #[test]
    fn doc_and_chunk_ids_differ_for_same_text() {
        assert_ne!(doc_id("hello"), chunk_id("hello"));
    }
}
