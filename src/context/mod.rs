//! Contextualization (`spec.md` §4.7 / C7.a).
//!
//! Generates a 2-3 sentence context for a chunk, situating it within its
//! parent document, so the context can be appended to the chunk before
//! embedding. Grounded on `context_generation_service.py`'s
//! `ContextGenerationService` and `token_utils.py`'s `TokenUtils`; per
//! `SPEC_FULL.md`'s Design Note, token counts are estimated from word counts
//! (`word_count / 0.75`) rather than a real BPE tokenizer, since no
//! `tiktoken`-equivalent crate is in the teacher's or pack's dependency set.

use std::sync::Arc;

use regex::Regex;
use tracing::{instrument, warn};

use crate::chunking::{count_words, split_into_sentences};
use crate::llm::LlmClient;

const MAX_DOCUMENT_TOKENS: usize = 4000;
const MAX_PROMPT_TOKENS: usize = 6000;
const FALLBACK_DOCUMENT_TOKENS: usize = 3000;
const MAX_CONTEXT_TOKENS: usize = 300;
const DEFAULT_BEGINNING_RATIO: f64 = 0.6;
const ELISION_MARKER: &str = "\n\n[... middle content omitted ...]\n\n";
const MAX_EMBEDDING_TEXT_TOKENS: usize = 8000;
const FALLBACK_CONTEXT_TOKENS: usize = 200;

/// Estimates the token count of `text` from its word count
/// (`word_count / 0.75`, matching `TokenUtils.count_tokens`'s fallback path).
pub fn count_tokens(text: &str) -> usize {
    let words = count_words(text);
    (words as f64 / 0.75) as usize
}

/// Truncates `text` to approximately `max_tokens` tokens, estimating from the
/// text's character-per-token ratio. A no-op if `text` is already within budget.
pub fn truncate_to_token_limit(text: &str, max_tokens: usize) -> String {
    if text.is_empty() {
        return text.to_string();
    }
    let current_tokens = count_tokens(text);
    if current_tokens <= max_tokens || current_tokens == 0 {
        return text.to_string();
    }

    let chars_per_token = text.chars().count() as f64 / current_tokens as f64;
    let target_chars = (max_tokens as f64 * chars_per_token) as usize;
    text.chars().take(target_chars).collect()
}

/// Splits `document` into a beginning section and an end section, each
/// packed up to its own token share of `max_tokens` (`beginning_ratio` for
/// the beginning), joined by [`ELISION_MARKER`] when both are non-empty.
/// Falls back to [`truncate_to_token_limit`] when there's no room for the
/// marker itself, or when the sentence splitter finds nothing.
pub fn smart_document_truncation(document: &str, max_tokens: usize, beginning_ratio: f64) -> String {
    if document.is_empty() {
        return document.to_string();
    }
    let current_tokens = count_tokens(document);
    if current_tokens <= max_tokens {
        return document.to_string();
    }

    let mut beginning_tokens = (max_tokens as f64 * beginning_ratio) as usize;
    let mut end_tokens = max_tokens.saturating_sub(beginning_tokens);
    let separator_tokens = count_tokens(ELISION_MARKER);

    if separator_tokens >= beginning_tokens {
        return truncate_to_token_limit(document, max_tokens);
    }
    beginning_tokens -= separator_tokens / 2;
    end_tokens = end_tokens.saturating_sub(separator_tokens / 2);

    let sentences = split_into_sentences(document);
    if sentences.is_empty() {
        return truncate_to_token_limit(document, max_tokens);
    }

    let beginning_section = section_by_tokens(&sentences, beginning_tokens, true);
    let end_section = section_by_tokens(&sentences, end_tokens, false);

    let mut truncated = match (beginning_section.is_empty(), end_section.is_empty()) {
        (false, false) => format!("{beginning_section}{ELISION_MARKER}{end_section}"),
        (false, true) => beginning_section,
        (true, false) => end_section,
        (true, true) => truncate_to_token_limit(document, max_tokens),
    };

    if count_tokens(&truncated) > max_tokens {
        warn!("smart-truncated document still exceeds token budget, applying final truncation");
        truncated = truncate_to_token_limit(&truncated, max_tokens);
    }
    truncated
}

fn section_by_tokens(sentences: &[String], max_tokens: usize, from_start: bool) -> String {
    let mut section = Vec::new();
    let mut current_tokens = 0usize;

    let ordered: Vec<&String> = if from_start {
        sentences.iter().collect()
    } else {
        sentences.iter().rev().collect()
    };

    for sentence in ordered {
        let sentence_tokens = count_tokens(sentence);
        if current_tokens + sentence_tokens > max_tokens {
            break;
        }
        if from_start {
            section.push(sentence.as_str());
        } else {
            section.insert(0, sentence.as_str());
        }
        current_tokens += sentence_tokens;
    }

    section.join(" ")
}

/// Whether `text` is within `max_tokens`, alongside its estimated token count
/// (`validate_embedding_text_length`).
pub fn validate_embedding_text_length(text: &str, max_tokens: usize) -> (bool, usize) {
    let tokens = count_tokens(text);
    (tokens <= max_tokens, tokens)
}

/// Builds the final embedding text for a chunk: `"{chunk}\n\nContext:
/// {context}"`, falling back to the context alone truncated to 200 tokens,
/// then to the bare chunk, if the combined text overflows the embedding
/// model's token budget (`spec.md` §4.7's embedding-text rule).
pub fn build_embedding_text(chunk: &str, context: &str) -> String {
    if context.is_empty() {
        return chunk.to_string();
    }

    let combined = format!("{chunk}\n\nContext: {context}");
    let (within_budget, _) = validate_embedding_text_length(&combined, MAX_EMBEDDING_TEXT_TOKENS);
    if within_budget {
        return combined;
    }

    let shortened_context = truncate_to_token_limit(context, FALLBACK_CONTEXT_TOKENS);
    let retry = format!("{chunk}\n\nContext: {shortened_context}");
    let (within_budget, _) = validate_embedding_text_length(&retry, MAX_EMBEDDING_TEXT_TOKENS);
    if within_budget {
        return retry;
    }

    chunk.to_string()
}

fn contextualizer_prompt(document: &str, chunk: &str) -> String {
    format!(
        "You are an assistant specialized in analyzing document chunks and providing relevant context.\n\n\
<instructions>\n\
    <instruction>You will be given a document and a specific chunk from that document</instruction>\n\
    <instruction>Provide 2-3 concise sentences that situate this chunk within the broader document</instruction>\n\
    <instruction>Identify the main topic or concept discussed in the chunk</instruction>\n\
    <instruction>Include relevant information or comparisons from the broader document context</instruction>\n\
    <instruction>Note how this information relates to the overall theme or purpose of the document if applicable</instruction>\n\
    <instruction>Include key figures, dates, or percentages that provide important context</instruction>\n\
    <instruction>Avoid phrases like \"This chunk discusses\" - instead, directly state the context</instruction>\n\
    <instruction>Keep your response brief and focused on improving search retrieval</instruction>\n\
</instructions>\n\n\
Here is the document:\n\
<document>\n{document}\n</document>\n\n\
Here is the chunk to contextualize:\n\
<chunk>\n{chunk}\n</chunk>\n\n\
Respond only with the succinct context for this chunk. Do not mention it is a chunk or that you are providing context."
    )
}

/// Generates per-chunk context for embedding, via an external LLM.
pub struct Contextualizer {
    llm: Arc<dyn LlmClient>,
}

impl Contextualizer {
    /// Creates a contextualizer backed by `llm`.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Generates the context for one chunk. Never fails: on any LLM error,
    /// falls back to a synthetic one-sentence context derived from the
    /// chunk's first sentence.
    #[instrument(skip(self, chunk, document))]
    pub async fn generate(&self, chunk: &str, document: &str) -> String {
        let mut truncated_document = self.prepare_document_for_context(document);
        let mut prompt = contextualizer_prompt(&truncated_document, chunk);

        if count_tokens(&prompt) > MAX_PROMPT_TOKENS {
            warn!("contextualizer prompt over budget, applying additional truncation");
            truncated_document =
                smart_document_truncation(document, FALLBACK_DOCUMENT_TOKENS, DEFAULT_BEGINNING_RATIO);
            prompt = contextualizer_prompt(&truncated_document, chunk);
        }

        match self.llm.contextualize(&prompt).await {
            Ok(raw) => Self::validate_and_truncate(&raw),
            Err(err) => {
                warn!(error = %err, "error generating context for chunk, using fallback");
                Self::fallback_context(chunk)
            }
        }
    }

    /// Generates context for every chunk in `chunks`, in document order.
    pub async fn generate_for_chunks(&self, chunks: &[String], document: &str) -> Vec<String> {
        let mut contexts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            contexts.push(self.generate(chunk, document).await);
        }
        contexts
    }

    fn prepare_document_for_context(&self, document: &str) -> String {
        if count_tokens(document) <= MAX_DOCUMENT_TOKENS {
            return document.to_string();
        }
        smart_document_truncation(document, MAX_DOCUMENT_TOKENS, DEFAULT_BEGINNING_RATIO)
    }

    fn validate_and_truncate(context: &str) -> String {
        let trimmed = context.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        if count_tokens(trimmed) > MAX_CONTEXT_TOKENS {
            return truncate_to_token_limit(trimmed, MAX_CONTEXT_TOKENS);
        }
        trimmed.to_string()
    }

    fn fallback_context(chunk: &str) -> String {
        let first_sentence = chunk.split('.').next().unwrap_or("");
        if first_sentence.len() > 10 {
            let snippet: String = first_sentence.chars().take(100).collect();
            format!("This content discusses {}.", snippet.trim().to_lowercase())
        } else {
            "This content covers information from the document.".to_string()
        }
    }
}

/// Wraps each `(chunk, context)` pair as `<chunk_context>...</chunk_context>\n<chunk>...</chunk>`,
/// or bare `<chunk>...</chunk>` when the context is empty.
pub fn create_contextualized_chunks(chunks: &[String], contexts: &[String]) -> Vec<String> {
    chunks
        .iter()
        .zip(contexts)
        .map(|(chunk, context)| {
            if context.trim().is_empty() {
                format!("<chunk>{chunk}</chunk>")
            } else {
                format!("<chunk_context>{context}</chunk_context>\n<chunk>{chunk}</chunk>")
            }
        })
        .collect()
}

/// Extracts the `<chunk>...</chunk>` body from a contextualized chunk,
/// returning the whole input unchanged if no tag is found.
pub fn extract_chunk_content(contextualized_chunk: &str) -> String {
    let re = Regex::new(r"(?s)<chunk>(.*?)</chunk>").expect("static regex is valid");
    match re.captures(contextualized_chunk) {
        Some(caps) => caps[1].trim().to_string(),
        None => contextualized_chunk.to_string(),
    }
}

/// Extracts the `<chunk_context>...</chunk_context>` body, returning an
/// empty string if no tag is found.
pub fn extract_chunk_context(contextualized_chunk: &str) -> String {
    let re = Regex::new(r"(?s)<chunk_context>(.*?)</chunk_context>").expect("static regex is valid");
    match re.captures(contextualized_chunk) {
        Some(caps) => caps[1].trim().to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatedHnswError, Result};
    use async_trait::async_trait;

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn chunk_split(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_string())
        }
        async fn contextualize(&self, _prompt: &str) -> Result<String> {
            Ok("This section covers the quarterly roadmap.".to_string())
        }
        async fn extract_metadata(&self, _prompt: &str) -> Result<String> {
            Ok("{}".to_string())
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
    fn count_tokens_estimates_from_word_count() {
        assert_eq!(count_tokens(""), 0);
        assert!(count_tokens("one two three four") > 0);
    }

    #[test]
    fn smart_truncation_joins_beginning_and_end_with_marker() {
        let sentences: Vec<String> = (0..50)
            .map(|i| format!("This is sentence number {i} in a long document about quarterly planning."))
            .collect();
        let document = sentences.join(" ");
        let truncated = smart_document_truncation(&document, 60, 0.6);
        assert!(truncated.contains(ELISION_MARKER));
        assert!(count_tokens(&truncated) <= 60);
    }

    #[test]
    fn smart_truncation_is_noop_under_budget() {
        let document = "A short document.".to_string();
        assert_eq!(smart_document_truncation(&document, 1000, 0.6), document);
    }

    #[test]
    fn build_embedding_text_appends_context() {
        let text = build_embedding_text("chunk body", "some context");
        assert_eq!(text, "chunk body\n\nContext: some context");
    }

    #[test]
    fn build_embedding_text_drops_context_when_empty() {
        assert_eq!(build_embedding_text("chunk body", ""), "chunk body");
    }

    #[test]
    fn contextualized_wrapping_omits_tag_when_context_empty() {
        let chunks = vec!["hello".to_string()];
        let contexts = vec!["".to_string()];
        let wrapped = create_contextualized_chunks(&chunks, &contexts);
        assert_eq!(wrapped[0], "<chunk>hello</chunk>");
    }

    #[test]
    fn extract_helpers_roundtrip_wrapped_chunk() {
        let wrapped = "<chunk_context>the context</chunk_context>\n<chunk>the body</chunk>";
        assert_eq!(extract_chunk_content(wrapped), "the body");
        assert_eq!(extract_chunk_context(wrapped), "the context");
    }

    #[test]
    fn extract_chunk_content_returns_input_when_untagged() {
        assert_eq!(extract_chunk_content("plain text"), "plain text");
    }

    #[tokio::test]
    async fn generate_returns_llm_context_on_success() {
        let contextualizer = Contextualizer::new(Arc::new(EchoLlm));
        let context = contextualizer.generate("some chunk", "some document").await;
        assert_eq!(context, "This section covers the quarterly roadmap.");
    }

    #[tokio::test]
    async fn generate_falls_back_when_llm_fails() {
        let contextualizer = Contextualizer::new(Arc::new(FailingLlm));
        let context = contextualizer
            .generate("Revenue grew substantially this quarter.", "doc")
            .await;
        assert!(context.starts_with("This content discusses"));
    }
}
