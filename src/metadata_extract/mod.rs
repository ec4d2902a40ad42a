//! Metadata extraction (`spec.md` §4.7 / C7.b).
//!
//! Asks an [`LlmClient`] to produce `{keywords, topics, entities,
//! document_type}` JSON for a chunk, then resiliently parses whatever comes
//! back. Grounded on `metadata_extraction_service.py`'s
//! `MetadataExtractionService._parse_json_response`/`_validate_metadata`:
//! LLMs reliably wrap JSON in prose or code fences, so the parse path tries
//! progressively cruder recovery strategies before giving up and returning
//! defaults.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{instrument, warn};

use crate::llm::LlmClient;

const MAX_CHUNK_CHARS_FOR_PROMPT: usize = 4000;
const MAX_KEYWORDS: usize = 10;
const MAX_TOPICS: usize = 5;
const MAX_ENTITIES: usize = 20;

/// Structured metadata extracted from one chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedMetadata {
    pub keywords: Vec<String>,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub document_type: String,
}

impl Default for ExtractedMetadata {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            topics: Vec::new(),
            entities: Vec::new(),
            document_type: "unknown".to_string(),
        }
    }
}

/// Raw, untrusted JSON shape the LLM is expected to produce. Fields are
/// `serde_json::Value` rather than `Vec<String>`/`String` directly, since a
/// misbehaving model may send the wrong type for a field and the extractor
/// must coerce rather than reject.
#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    keywords: JsonValue,
    #[serde(default)]
    topics: JsonValue,
    #[serde(default)]
    entities: JsonValue,
    #[serde(default)]
    document_type: JsonValue,
}

fn metadata_extraction_prompt(chunk: &str) -> String {
    let truncated: String = if chunk.len() > MAX_CHUNK_CHARS_FOR_PROMPT {
        let mut s: String = chunk.chars().take(MAX_CHUNK_CHARS_FOR_PROMPT).collect();
        s.push_str("...");
        s
    } else {
        chunk.to_string()
    };

    format!(
        "Analyze the following text and extract metadata in JSON format.\n\n\
Extract:\n\
- keywords: up to 10 important keywords or key phrases\n\
- topics: up to 5 high-level topics this text relates to\n\
- entities: up to 20 named entities (people, organizations, locations, products)\n\
- document_type: a single lowercase word describing the kind of document this chunk is from\n\n\
Respond with ONLY a JSON object with these four keys, no other text.\n\n\
Text:\n{truncated}"
    )
}

/// Extracts structured metadata for a chunk, via an external LLM.
pub struct MetadataExtractor {
    llm: Arc<dyn LlmClient>,
}

impl MetadataExtractor {
    /// Creates an extractor backed by `llm`.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Extracts metadata for one chunk. Never fails: on any LLM error or
    /// unparseable response, falls back to [`ExtractedMetadata::default`].
    #[instrument(skip(self, chunk))]
    pub async fn extract(&self, chunk: &str) -> ExtractedMetadata {
        let prompt = metadata_extraction_prompt(chunk);
        match self.llm.extract_metadata(&prompt).await {
            Ok(raw) => parse_json_response(&raw),
            Err(err) => {
                warn!(error = %err, "error extracting metadata for chunk, using defaults");
                ExtractedMetadata::default()
            }
        }
    }

    /// Extracts metadata for every chunk in `chunks`, in order.
    pub async fn extract_for_chunks(&self, chunks: &[String]) -> Vec<ExtractedMetadata> {
        let mut results = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            results.push(self.extract(chunk).await);
        }
        results
    }
}

/// Parses an LLM's metadata response, trying (in order): a direct
/// `serde_json` parse of the whole response, the same after stripping code
/// fences, the same after slicing to the first `{`..last `}`, a
/// brace-balanced regex extraction, and finally a per-key regex fallback.
/// Returns defaults if every strategy fails.
pub fn parse_json_response(response: &str) -> ExtractedMetadata {
    let stripped = strip_code_fences(response);

    if let Some(parsed) = try_parse_object(&stripped) {
        return validate_metadata(parsed);
    }

    if let Some(sliced) = slice_to_braces(&stripped) {
        if let Some(parsed) = try_parse_object(&sliced) {
            return validate_metadata(parsed);
        }
        if let Some(balanced) = extract_balanced_braces(&sliced) {
            if let Some(parsed) = try_parse_object(&balanced) {
                return validate_metadata(parsed);
            }
        }
    }

    warn!("could not parse metadata JSON from LLM response, falling back to regex extraction");
    extract_fallback_metadata(response)
}

fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.trim_start().trim_end_matches("```").trim().to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.trim_start().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

fn slice_to_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(text[start..=end].to_string())
}

fn extract_balanced_braces(text: &str) -> Option<String> {
    let re = Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("static regex is valid");
    re.find(text).map(|m| m.as_str().to_string())
}

fn try_parse_object(text: &str) -> Option<RawMetadata> {
    serde_json::from_str::<RawMetadata>(text).ok()
}

fn json_string_list(value: &JsonValue, max_len: usize) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(_) | JsonValue::Bool(_) => Some(v.to_string()),
                _ => None,
            })
            .take(max_len)
            .collect(),
        _ => Vec::new(),
    }
}

fn validate_metadata(raw: RawMetadata) -> ExtractedMetadata {
    let document_type = match &raw.document_type {
        JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_lowercase(),
        _ => "unknown".to_string(),
    };

    ExtractedMetadata {
        keywords: json_string_list(&raw.keywords, MAX_KEYWORDS),
        topics: json_string_list(&raw.topics, MAX_TOPICS),
        entities: json_string_list(&raw.entities, MAX_ENTITIES),
        document_type,
    }
}

fn extract_fallback_metadata(response: &str) -> ExtractedMetadata {
    let mut metadata = ExtractedMetadata::default();

    if let Some(list) = extract_list_field(response, "keywords") {
        metadata.keywords = list.into_iter().take(MAX_KEYWORDS).collect();
    }
    if let Some(list) = extract_list_field(response, "topics") {
        metadata.topics = list.into_iter().take(MAX_TOPICS).collect();
    }
    if let Some(list) = extract_list_field(response, "entities") {
        metadata.entities = list.into_iter().take(MAX_ENTITIES).collect();
    }
    if let Some(doc_type) = extract_string_field(response, "document_type") {
        metadata.document_type = doc_type.to_lowercase();
    }

    metadata
}

fn extract_list_field(response: &str, key: &str) -> Option<Vec<String>> {
    let pattern = format!(r#""{key}"\s*:\s*\[(?s)(.*?)\]"#);
    let re = Regex::new(&pattern).expect("dynamic regex built from a static key is valid");
    let captured = re.captures(response)?.get(1)?.as_str();

    Some(
        captured
            .split(',')
            .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

fn extract_string_field(response: &str, key: &str) -> Option<String> {
    let pattern = format!(r#""{key}"\s*:\s*"([^"]*)""#);
    let re = Regex::new(&pattern).expect("dynamic regex built from a static key is valid");
    re.captures(response).map(|c| c[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatedHnswError, Result};
    use async_trait::async_trait;

    struct JsonLlm(&'static str);

    #[async_trait]
    impl LlmClient for JsonLlm {
        async fn chunk_split(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_string())
        }
        async fn contextualize(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_string())
        }
        async fn extract_metadata(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
        async fn enhance_query(&self, query: &str, _history: &[String]) -> Result<Vec<String>> {
            Ok(vec![query.to_string()])
        }
        async fn select_context(&self, _query: &str, candidates: &[String]) -> Result<Vec<usize>> {
            Ok((0..candidates.len()).collect())
        }
        async fn generate_answer(
            &self,
            _query: &str,
            selected: &[String],
            _history: &[String],
        ) -> Result<crate::llm::GeneratedAnswer> {
            Ok(crate::llm::GeneratedAnswer {
                answer: selected.join(" "),
                confidence: 1.0,
            })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn chunk_split(&self, _prompt: &str) -> Result<String> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn contextualize(&self, _prompt: &str) -> Result<String> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn extract_metadata(&self, _prompt: &str) -> Result<String> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn enhance_query(&self, _query: &str, _history: &[String]) -> Result<Vec<String>> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn select_context(&self, _query: &str, _candidates: &[String]) -> Result<Vec<usize>> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn generate_answer(
            &self,
            _query: &str,
            _selected: &[String],
            _history: &[String],
        ) -> Result<crate::llm::GeneratedAnswer> {
            Err(GatedHnswError::invalid_input("llm unavailable"))
        }
    }

    #[test]
    fn parses_clean_json() {
        let response = r#"{"keywords": ["rust", "hnsw"], "topics": ["search"], "entities": ["Acme Corp"], "document_type": "Report"}"#;
        let metadata = parse_json_response(response);
        assert_eq!(metadata.keywords, vec!["rust".to_string(), "hnsw".to_string()]);
        assert_eq!(metadata.document_type, "report");
    }

    #[test]
    fn parses_json_wrapped_in_code_fence() {
        let response = "```json\n{\"keywords\": [\"a\"], \"topics\": [], \"entities\": [], \"document_type\": \"memo\"}\n```";
        let metadata = parse_json_response(response);
        assert_eq!(metadata.keywords, vec!["a".to_string()]);
        assert_eq!(metadata.document_type, "memo");
    }

    #[test]
    fn parses_json_preceded_by_prose() {
        let response = "Sure, here is the metadata:\n{\"keywords\": [\"x\", \"y\"], \"topics\": [\"t\"], \"entities\": [], \"document_type\": \"email\"}\nLet me know if you need anything else.";
        let metadata = parse_json_response(response);
        assert_eq!(metadata.keywords, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(metadata.topics, vec!["t".to_string()]);
    }

    #[test]
    fn falls_back_to_regex_extraction_on_malformed_json() {
        let response = r#"{"keywords": ["a", "b",], "topics": ["t1"] "entities": [], "document_type": "note"}"#;
        let metadata = parse_json_response(response);
        assert_eq!(metadata.keywords, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(metadata.document_type, "note");
    }

    #[test]
    fn returns_defaults_on_total_failure() {
        let metadata = parse_json_response("not json at all, sorry");
        assert_eq!(metadata, ExtractedMetadata::default());
    }

    #[test]
    fn truncates_oversized_lists() {
        let keywords: Vec<String> = (0..20).map(|i| format!("\"kw{i}\"")).collect();
        let response = format!(
            r#"{{"keywords": [{}], "topics": [], "entities": [], "document_type": "doc"}}"#,
            keywords.join(",")
        );
        let metadata = parse_json_response(&response);
        assert_eq!(metadata.keywords.len(), MAX_KEYWORDS);
    }

    #[tokio::test]
    async fn extract_uses_llm_response() {
        let extractor = MetadataExtractor::new(Arc::new(JsonLlm(
            r#"{"keywords": ["k"], "topics": [], "entities": [], "document_type": "report"}"#,
        )));
        let metadata = extractor.extract("some chunk").await;
        assert_eq!(metadata.keywords, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn extract_falls_back_to_defaults_when_llm_fails() {
        let extractor = MetadataExtractor::new(Arc::new(FailingLlm));
        let metadata = extractor.extract("some chunk").await;
        assert_eq!(metadata, ExtractedMetadata::default());
    }
}
