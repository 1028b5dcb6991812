//! Prompt template registry.
//!
//! Templates are first-class values keyed by name so tests and deployments
//! can substitute them. Placeholders use `{name}` and are replaced literally
//! by [`PromptRegistry::render`]; braces that are not a known placeholder
//! (JSON examples, record grammars) pass through untouched.

use std::collections::HashMap;

pub const ENTITY_EXTRACTION: &str = "entity_extraction";
pub const SUMMARIZE_ENTITY_DESCRIPTIONS: &str = "summarize_entity_descriptions";
pub const CONTINUE_EXTRACTION: &str = "continue_extraction";
pub const IF_LOOP: &str = "if_loop";
pub const KEYWORDS_EXTRACTION: &str = "keywords_extraction";
pub const RAG_RESPONSE: &str = "rag_response";
pub const NAIVE_RAG_RESPONSE: &str = "naive_rag_response";
pub const FAIL_RESPONSE: &str = "fail_response";
pub const COMPATIBILITY_CHECK: &str = "compatibility_check";

/// Default delimiters of the tuple-record grammar.
pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

const ENTITY_EXTRACTION_TEMPLATE: &str = r#"-Goal-
Given a text document about restaurants, users and their tastes, and a list of entity types, identify all entities of those types from the text and all relationships among the identified entities.

-Steps-
1. Identify all entities. For each identified entity, extract the following information:
- entity_name: Name of the entity, capitalized
- entity_type: One of the following types: [{entity_types}]
- entity_description: Comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are *clearly related* to each other.
For each pair of related entities, extract the following information:
- source_entity: name of the source entity, as identified in step 1
- target_entity: name of the target entity, as identified in step 1
- relationship_description: explanation as to why you think the source entity and the target entity are related to each other
- relationship_keywords: one or more high-level key words that summarize the overarching nature of the relationship
- relationship_strength: a numeric score indicating strength of the relationship between the source entity and target entity
Format each relationship as ("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_strength>)

3. Identify high-level key words that summarize the main concepts, themes, or topics of the entire text.
Format the content-level key words as ("content_keywords"{tuple_delimiter}<high_level_keywords>)

4. Return output in French as a single list of all the entities and relationships identified in steps 1 and 2. Use **{record_delimiter}** as the list delimiter.

5. When finished, output {completion_delimiter}

######################
-Example-
######################
Entity_types: [restaurant, cuisine, location, positive_point]
Text:
La Mère Brazier propose une cuisine lyonnaise raffinée dans le premier arrondissement, réputée pour ses quenelles faites maison.
######################
Output:
("entity"{tuple_delimiter}"La Mère Brazier"{tuple_delimiter}"restaurant"{tuple_delimiter}"Restaurant de cuisine lyonnaise raffinée du premier arrondissement."){record_delimiter}
("entity"{tuple_delimiter}"Cuisine lyonnaise"{tuple_delimiter}"cuisine"{tuple_delimiter}"Cuisine traditionnelle de la région de Lyon."){record_delimiter}
("entity"{tuple_delimiter}"Premier arrondissement"{tuple_delimiter}"location"{tuple_delimiter}"Quartier où se trouve le restaurant."){record_delimiter}
("entity"{tuple_delimiter}"Quenelles faites maison"{tuple_delimiter}"positive_point"{tuple_delimiter}"Spécialité appréciée du restaurant."){record_delimiter}
("relationship"{tuple_delimiter}"La Mère Brazier"{tuple_delimiter}"Premier arrondissement"{tuple_delimiter}"Le restaurant se trouve dans le premier arrondissement."{tuple_delimiter}"localisation"{tuple_delimiter}9){record_delimiter}
("relationship"{tuple_delimiter}"La Mère Brazier"{tuple_delimiter}"Quenelles faites maison"{tuple_delimiter}"Le restaurant est réputé pour ses quenelles."{tuple_delimiter}"spécialité, point fort"{tuple_delimiter}8){record_delimiter}
("content_keywords"{tuple_delimiter}"restaurant, cuisine lyonnaise, spécialité"){completion_delimiter}

######################
-Real Data-
######################
Entity_types: [{entity_types}]
Text: {input_text}
######################
Output:
"#;

const SUMMARIZE_TEMPLATE: &str = r#"You are a helpful assistant responsible for generating a comprehensive summary of the data provided below.
Given one entity and a list of descriptions, all related to the same entity.
Please concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, please resolve the contradictions and provide a single, coherent summary.
Make sure it is written in third person, and include the entity name so we have the full context.

#######
-Data-
Entity: {entity_name}
Description List: {description_list}
#######
Output:
"#;

const CONTINUE_EXTRACTION_TEMPLATE: &str = r#"MANY entities were missed in the last extraction. Add them below using the same format:
"#;

const IF_LOOP_TEMPLATE: &str = r#"It appears some entities may have still been missed. Answer YES | NO if there are still entities that need to be added.
"#;

const KEYWORDS_EXTRACTION_TEMPLATE: &str = r#"-Role-
You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query.

-Goal-
Given the query, list both high-level and low-level keywords. High-level keywords focus on overarching concepts or themes, while low-level keywords focus on specific entities, details, or concrete terms.

-Instructions-
Output the keywords in JSON format.
The JSON should have two keys:
- "high_level_keywords" for overarching concepts or themes
- "low_level_keywords" for specific entities or details

######################
-Example-
######################
Query: "un restaurant italien pas cher près de la Croix-Rousse"
Output:
{
  "high_level_keywords": ["restaurant", "cuisine italienne", "budget"],
  "low_level_keywords": ["italien", "pas cher", "Croix-Rousse"]
}

######################
-Real Data-
######################
Query: {query}
Output:
"#;

const RAG_RESPONSE_TEMPLATE: &str = r#"-Role-
You are a helpful assistant responding to questions about restaurants, users, and recommendations, using the data tables provided.

-Goal-
Generate a response of the target length and format that responds to the user's question, summarizing all information in the input data tables appropriate for the response length and format.
If you don't know the answer, just say so. Do not make anything up.
Do not include information where the supporting evidence for it is not provided.

-Target response length and format-
{response_type}

-Data tables-
{context_data}

Add no information that is not supported by the data tables.
"#;

const NAIVE_RAG_RESPONSE_TEMPLATE: &str = r#"-Role-
You are a helpful assistant responding to questions about documents provided below.

-Goal-
Generate a response of the target length and format that responds to the user's question, summarizing all information in the input documents appropriate for the response length and format.
If you don't know the answer, just say so. Do not make anything up.

-Target response length and format-
{response_type}

-Documents-
{content_data}

Add no information that is not supported by the documents.
"#;

const FAIL_RESPONSE_TEMPLATE: &str =
    "Sorry, I'm not able to provide an answer to that question.";

const COMPATIBILITY_CHECK_TEMPLATE: &str = r#"-Role-
You are a judge deciding whether a user preference is compatible with a positive feature of an activity.

-Goal-
Given a user preference and a positive point of a restaurant or activity, decide whether recommending the activity for this preference makes sense.

-User preference-
Name: {source_name}
Description: {source_description}

-Positive point-
Name: {target_name}
Description: {target_description}

-Instructions-
Answer with a single JSON object and nothing else:
{
  "is_valid": true or false,
  "compatibility_score": a number between 0.0 and 1.0,
  "justification": "why the pair is or is not compatible",
  "recommendation_description": "one sentence recommending the activity for this preference"
}
"#;

/// Named prompt templates with `{placeholder}` substitution.
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    templates: HashMap<String, String>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(ENTITY_EXTRACTION.to_string(), ENTITY_EXTRACTION_TEMPLATE.to_string());
        templates.insert(
            SUMMARIZE_ENTITY_DESCRIPTIONS.to_string(),
            SUMMARIZE_TEMPLATE.to_string(),
        );
        templates.insert(
            CONTINUE_EXTRACTION.to_string(),
            CONTINUE_EXTRACTION_TEMPLATE.to_string(),
        );
        templates.insert(IF_LOOP.to_string(), IF_LOOP_TEMPLATE.to_string());
        templates.insert(
            KEYWORDS_EXTRACTION.to_string(),
            KEYWORDS_EXTRACTION_TEMPLATE.to_string(),
        );
        templates.insert(RAG_RESPONSE.to_string(), RAG_RESPONSE_TEMPLATE.to_string());
        templates.insert(
            NAIVE_RAG_RESPONSE.to_string(),
            NAIVE_RAG_RESPONSE_TEMPLATE.to_string(),
        );
        templates.insert(FAIL_RESPONSE.to_string(), FAIL_RESPONSE_TEMPLATE.to_string());
        templates.insert(
            COMPATIBILITY_CHECK.to_string(),
            COMPATIBILITY_CHECK_TEMPLATE.to_string(),
        );
        Self { templates }
    }
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw template text; panics are avoided by falling back to empty for
    /// unknown names (tests assert registration instead).
    pub fn get(&self, name: &str) -> &str {
        self.templates.get(name).map_or("", String::as_str)
    }

    /// Replace a template (test seam and per-deployment overrides).
    pub fn set(&mut self, name: &str, template: impl Into<String>) {
        self.templates.insert(name.to_string(), template.into());
    }

    /// Render a template, replacing each `{key}` with its value.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> String {
        let mut out = self.get(name).to_string();
        for (key, value) in vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_templates_registered() {
        let registry = PromptRegistry::new();
        for name in [
            ENTITY_EXTRACTION,
            SUMMARIZE_ENTITY_DESCRIPTIONS,
            CONTINUE_EXTRACTION,
            IF_LOOP,
            KEYWORDS_EXTRACTION,
            RAG_RESPONSE,
            NAIVE_RAG_RESPONSE,
            FAIL_RESPONSE,
            COMPATIBILITY_CHECK,
        ] {
            assert!(!registry.get(name).is_empty(), "missing template {name}");
        }
    }

    #[test]
    fn render_substitutes_placeholders() {
        let registry = PromptRegistry::new();
        let rendered = registry.render(
            SUMMARIZE_ENTITY_DESCRIPTIONS,
            &[("entity_name", "LYON"), ("description_list", "a<SEP>b")],
        );
        assert!(rendered.contains("Entity: LYON"));
        assert!(rendered.contains("a<SEP>b"));
        assert!(!rendered.contains("{entity_name}"));
    }

    #[test]
    fn render_leaves_json_braces_alone() {
        let registry = PromptRegistry::new();
        let rendered = registry.render(KEYWORDS_EXTRACTION, &[("query", "pizza")]);
        assert!(rendered.contains("\"high_level_keywords\""));
        assert!(rendered.contains("Query: pizza"));
    }

    #[test]
    fn overrides_take_effect() {
        let mut registry = PromptRegistry::new();
        registry.set(FAIL_RESPONSE, "no luck");
        assert_eq!(registry.get(FAIL_RESPONSE), "no luck");
    }
}
