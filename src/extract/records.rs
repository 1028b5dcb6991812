//! Tuple-record grammar parser.
//!
//! The extraction prompt asks the model for records shaped like
//! `("entity"<|>NAME<|>TYPE<|>DESC)` and
//! `("relationship"<|>SRC<|>TGT<|>DESC<|>KEYWORDS<|>WEIGHT)`, separated by
//! `##` and terminated by `<|COMPLETE|>`. Parsing is tolerant: surrounding
//! whitespace and quoting are stripped, malformed records are dropped and
//! counted, never fatal.

/// Delimiters of the record grammar.
#[derive(Debug, Clone)]
pub struct Delimiters {
    pub tuple: String,
    pub record: String,
    pub completion: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            tuple: crate::prompts::TUPLE_DELIMITER.to_string(),
            record: crate::prompts::RECORD_DELIMITER.to_string(),
            completion: crate::prompts::COMPLETION_DELIMITER.to_string(),
        }
    }
}

/// One parsed record, fields still raw (unnormalised).
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Entity {
        name: String,
        entity_type: String,
        description: String,
    },
    Relation {
        source: String,
        target: String,
        description: String,
        keywords: String,
        weight: f64,
    },
    ContentKeywords(Vec<String>),
}

/// Parse an extraction response. Returns the records and the number of
/// malformed ones that were dropped.
pub fn parse_records(response: &str, delimiters: &Delimiters) -> (Vec<RawRecord>, usize) {
    let body = response.replace(&delimiters.completion, "");
    let mut records = Vec::new();
    let mut dropped = 0usize;

    for raw in body.split(&delimiters.record) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match parse_one(raw, &delimiters.tuple) {
            Some(record) => records.push(record),
            None => dropped += 1,
        }
    }
    (records, dropped)
}

fn parse_one(raw: &str, tuple_delimiter: &str) -> Option<RawRecord> {
    // Strip one layer of surrounding parentheses if present.
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(raw);

    let fields: Vec<String> = inner
        .split(tuple_delimiter)
        .map(clean_field)
        .collect();
    let head = fields.first()?.to_lowercase();

    match head.as_str() {
        "entity" if fields.len() >= 4 => Some(RawRecord::Entity {
            name: fields[1].clone(),
            entity_type: fields[2].clone(),
            description: fields[3].clone(),
        }),
        "relationship" if fields.len() >= 5 => {
            let weight = fields
                .get(5)
                .and_then(|w| w.parse::<f64>().ok())
                .unwrap_or(1.0);
            Some(RawRecord::Relation {
                source: fields[1].clone(),
                target: fields[2].clone(),
                description: fields[3].clone(),
                keywords: fields[4].clone(),
                weight,
            })
        }
        "content_keywords" if fields.len() >= 2 => Some(RawRecord::ContentKeywords(
            fields[1]
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        )),
        _ => None,
    }
}

fn clean_field(field: &str) -> String {
    field
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (Vec<RawRecord>, usize) {
        parse_records(text, &Delimiters::default())
    }

    #[test]
    fn parses_entity_and_relation_records() {
        let response = concat!(
            "(\"entity\"<|>\"Le Coquemar\"<|>\"restaurant\"<|>\"Un bouchon lyonnais.\")##",
            "(\"relationship\"<|>\"Le Coquemar\"<|>\"Lyon\"<|>\"situé à Lyon\"<|>\"localisation\"<|>9)##",
            "(\"content_keywords\"<|>\"restaurant, lyon\")<|COMPLETE|>"
        );
        let (records, dropped) = parse(response);
        assert_eq!(dropped, 0);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            RawRecord::Entity {
                name: "Le Coquemar".into(),
                entity_type: "restaurant".into(),
                description: "Un bouchon lyonnais.".into(),
            }
        );
        match &records[1] {
            RawRecord::Relation { weight, keywords, .. } => {
                assert!((weight - 9.0).abs() < f64::EPSILON);
                assert_eq!(keywords, "localisation");
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(
            records[2],
            RawRecord::ContentKeywords(vec!["restaurant".into(), "lyon".into()])
        );
    }

    #[test]
    fn invalid_weight_defaults_to_one() {
        let (records, _) =
            parse("(\"relationship\"<|>A<|>B<|>desc<|>kw<|>heavy)");
        match &records[0] {
            RawRecord::Relation { weight, .. } => assert!((weight - 1.0).abs() < f64::EPSILON),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn missing_weight_defaults_to_one() {
        let (records, dropped) = parse("(\"relationship\"<|>A<|>B<|>desc<|>kw)");
        assert_eq!(dropped, 0);
        match &records[0] {
            RawRecord::Relation { weight, .. } => assert!((weight - 1.0).abs() < f64::EPSILON),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn malformed_records_are_dropped_not_fatal() {
        let response = "(\"entity\"<|>only-two)##garbage##(\"entity\"<|>A<|>t<|>d)";
        let (records, dropped) = parse(response);
        assert_eq!(records.len(), 1);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn tolerates_whitespace_and_missing_parens() {
        let (records, dropped) = parse("  \"entity\"<|> A <|> restaurant <|> d  ");
        assert_eq!(dropped, 0);
        assert_eq!(
            records[0],
            RawRecord::Entity {
                name: "A".into(),
                entity_type: "restaurant".into(),
                description: "d".into()
            }
        );
    }

    #[test]
    fn empty_response_parses_to_nothing() {
        let (records, dropped) = parse("<|COMPLETE|>");
        assert!(records.is_empty());
        assert_eq!(dropped, 0);
    }
}
