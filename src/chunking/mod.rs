//! Deterministic document chunking (`spec.md` §4.6 / C6).
//!
//! Chunks are grouped by a complexity-derived target word count, packaged
//! into `<|start_chunk_i|>`/`<|end_chunk_i|>`-delimited buckets, and handed
//! to an [`LlmClient`] for a split-after refinement pass. Any failure along
//! that refinement path — unparseable response, oversized sections, no
//! buckets found — falls back to the same size-based grouping recomputed
//! fresh on the input at hand.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::Result;
use crate::llm::LlmClient;

/// High complexity threshold (`spec.md` §4.6): text at or above this score
/// gets the smallest target chunk size.
const HIGH_COMPLEXITY: f32 = 0.7;
/// Medium complexity threshold.
const MEDIUM_COMPLEXITY: f32 = 0.4;

/// Target chunk size, in words, for high-complexity text.
const SIZE_HIGH_COMPLEXITY: usize = 300;
/// Target chunk size, in words, for medium-complexity text.
const SIZE_MEDIUM_COMPLEXITY: usize = 500;
/// Target chunk size, in words, for low-complexity text.
const SIZE_LOW_COMPLEXITY: usize = 700;

/// Upper bound on an acceptable section size; sections beyond this trigger
/// the size-based fallback rather than trusting the LLM's split points.
const MAX_SECTION_WORDS: usize = 2000;

/// Computes the document complexity score used to pick a target chunk size.
///
/// `0.4 * lexical_density + 0.4 * sentence_complexity + 0.2 * punctuation_complexity`,
/// clamped to `[0, 1]`. Returns `0.0` for blank input.
pub fn calculate_text_complexity(text: &str) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let words = extract_words(text);
    let sentences = split_into_sentences(text);

    if words.is_empty() || sentences.is_empty() {
        return 0.0;
    }

    let unique_words: std::collections::HashSet<&str> =
        words.iter().map(|w| w.as_str()).collect();
    let lexical_density = unique_words.len() as f32 / words.len() as f32;

    let avg_sentence_length = words.len() as f32 / sentences.len() as f32;
    let sentence_complexity = (avg_sentence_length / 20.0).min(1.0);

    let complex_punct = text
        .chars()
        .filter(|c| matches!(c, ';' | ':' | '(' | ')' | '{' | '}' | '[' | ']'))
        .count();
    let punct_density = complex_punct as f32 / words.len() as f32;
    let punct_complexity = (punct_density * 100.0).min(1.0);

    let complexity =
        lexical_density * 0.4 + sentence_complexity * 0.4 + punct_complexity * 0.2;
    complexity.min(1.0)
}

/// Maps a complexity score to a target chunk size in words.
pub fn target_chunk_size(complexity_score: f32) -> usize {
    if complexity_score >= HIGH_COMPLEXITY {
        SIZE_HIGH_COMPLEXITY
    } else if complexity_score >= MEDIUM_COMPLEXITY {
        SIZE_MEDIUM_COMPLEXITY
    } else {
        SIZE_LOW_COMPLEXITY
    }
}

/// Splits `text` into word tokens (Unicode word-boundary rules, UAX #29),
/// lowercased.
fn extract_words(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

/// Counts word tokens (Unicode word-boundary rules, case-preserving, for
/// size accounting).
pub fn count_words(text: &str) -> usize {
    text.unicode_words().count()
}

/// Returns the contiguous run of alphanumerics immediately before `s`'s
/// trailing `.`/`?`/`!` (or before the end of `s`, if it has none).
fn trailing_word_before_terminator(s: &str) -> String {
    let trimmed = s.trim_end();
    let body = match trimmed.chars().last() {
        Some(c) if matches!(c, '.' | '?' | '!') => &trimmed[..trimmed.len() - c.len_utf8()],
        _ => trimmed,
    };
    body.chars()
        .rev()
        .take_while(|c| c.is_alphanumeric())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Splits `text` into sentences.
///
/// Uses `unicode-segmentation`'s UAX #29 sentence-boundary iterator for the
/// base split, then merges a fragment back into the previous one whenever
/// the previous fragment ends on what looks like an abbreviation (a single
/// letter, or `Mr`/`Mrs`/`Ms`/`Dr`/`vs`/`etc`/`e.g`/`i.e`/`st`) rather than a
/// true sentence end — the crate's boundary algorithm is general-purpose and
/// has no notion of this domain's abbreviation list.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    const ABBREVIATIONS: &[&str] = &["mr", "mrs", "ms", "dr", "vs", "etc", "e.g", "i.e", "st"];

    let mut sentences: Vec<String> = Vec::new();

    for piece in text.unicode_sentences() {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }

        let merge_with_previous = sentences.last().is_some_and(|prev| {
            let preceding = trailing_word_before_terminator(prev);
            preceding.len() == 1 || ABBREVIATIONS.contains(&preceding.to_lowercase().as_str())
        });

        if merge_with_previous {
            let last = sentences.last_mut().expect("checked by merge_with_previous");
            last.push(' ');
            last.push_str(trimmed);
        } else {
            sentences.push(trimmed.to_string());
        }
    }

    sentences
}

/// Groups sentences into buckets near `target_words`, never splitting a
/// bucket below half the target unless a single sentence alone exceeds it.
fn group_sentences(sentences: &[String], target_words: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0usize;

    for sentence in sentences {
        let sentence_words = count_words(sentence);
        if current_words + sentence_words > target_words
            && !current.is_empty()
            && current_words as f32 >= target_words as f32 * 0.5
        {
            chunks.push(current.join(" "));
            current = vec![sentence.as_str()];
            current_words = sentence_words;
        } else {
            current.push(sentence.as_str());
            current_words += sentence_words;
        }
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Groups `text` into initial, delimited buckets sized by its complexity.
///
/// Falls back to a single `<|start_chunk_0|>`-wrapped bucket containing the
/// whole document when no sentences are found.
pub fn prepare_chunked_text(document_text: &str) -> String {
    let complexity = calculate_text_complexity(document_text);
    let target = target_chunk_size(complexity);
    info!(complexity, target, "computed chunking target size");

    let sentences = split_into_sentences(document_text);
    if sentences.is_empty() {
        warn!("no sentences found while preparing chunked text, using whole document");
        return format!("<|start_chunk_0|>\n{document_text}<|end_chunk_0|>");
    }

    let mut chunks = group_sentences(&sentences, target);
    if chunks.is_empty() {
        chunks = vec![document_text.to_string()];
    }

    let mut chunked_text = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        chunked_text.push_str(&format!(
            "<|start_chunk_{i}|>\n{}<|end_chunk_{i}|>",
            chunk.trim()
        ));
    }
    chunked_text
}

/// One `<|start_chunk_i|>...<|end_chunk_i|>` bucket extracted from delimited text.
struct DelimitedChunk {
    index: usize,
    text: String,
}

/// Extracts `<|start_chunk_N|>...<|end_chunk_N|>` buckets in order. A
/// malformed or mismatched end tag for a given `N` drops that bucket rather
/// than panicking; callers treat an empty result as "no buckets found".
fn extract_delimited_chunks(chunked_text: &str) -> Vec<DelimitedChunk> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while let Some(start_rel) = chunked_text[cursor..].find("<|start_chunk_") {
        let start_abs = cursor + start_rel;
        let after_tag = start_abs + "<|start_chunk_".len();
        let Some(close_rel) = chunked_text[after_tag..].find('|').or_else(|| {
            chunked_text[after_tag..].find('>')
        }) else {
            break;
        };
        let digits_end = chunked_text[after_tag..after_tag + close_rel]
            .trim_end_matches('>')
            .to_string();
        let Ok(index) = digits_end.trim().parse::<usize>() else {
            cursor = after_tag;
            continue;
        };
        let Some(gt_rel) = chunked_text[after_tag..].find('>') else {
            break;
        };
        let body_start = after_tag + gt_rel + 1;

        let end_tag = format!("<|end_chunk_{index}|>");
        let Some(end_rel) = chunked_text[body_start..].find(&end_tag) else {
            cursor = body_start;
            continue;
        };
        let body_end = body_start + end_rel;

        out.push(DelimitedChunk {
            index,
            text: chunked_text[body_start..body_end].to_string(),
        });
        cursor = body_end + end_tag.len();
    }

    out
}

/// Parses an LLM `split_after: 0, 2, 5` / `split_after: none` response into
/// the set of chunk indices after which a split should occur.
fn parse_split_points(llm_response: &str) -> Vec<usize> {
    let Some(after_marker) = llm_response.split("split_after:").nth(1) else {
        return Vec::new();
    };
    let after_marker = after_marker.trim();
    if after_marker.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    after_marker
        .split(',')
        .filter_map(|tok| tok.trim().parse::<usize>().ok())
        .collect()
}

/// Re-groups delimited buckets into final chunks at the given split points,
/// joining everything between consecutive split points (inclusive) into one
/// chunk.
fn apply_split_points(buckets: &[DelimitedChunk], split_after: &[usize]) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for bucket in buckets {
        current.push_str(&bucket.text);
        if split_after.contains(&bucket.index) {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                sections.push(trimmed);
            }
            current.clear();
        }
    }
    let trimmed = current.trim().to_string();
    if !trimmed.is_empty() {
        sections.push(trimmed);
    }
    sections
}

/// Re-derives complexity and target size on `text` fresh — deliberately
/// does not reuse whatever target size produced `text` in the first place,
/// matching `_fallback_size_based_chunking`'s behavior exactly.
pub fn fallback_size_based_chunking(text: &str) -> Vec<String> {
    let complexity = calculate_text_complexity(text);
    let target = target_chunk_size(complexity);
    warn!(complexity, target, "using fallback size-based chunking");

    let sentences = split_into_sentences(text);
    if sentences.is_empty() {
        return vec![text.to_string()];
    }

    let chunks = group_sentences(&sentences, target);
    if chunks.is_empty() {
        vec![text.to_string()]
    } else {
        chunks
    }
}

/// Splits delimited, LLM-annotated text into final sections, falling back to
/// size-based chunking whenever the LLM's suggestions can't be trusted: no
/// buckets found, no splits suggested, or an oversized resulting section.
pub fn split_text_by_llm_suggestions(chunked_text: &str, llm_response: &str) -> Vec<String> {
    let split_after = parse_split_points(llm_response);
    info!(?split_after, "parsed LLM split points");

    let buckets = extract_delimited_chunks(chunked_text);
    if buckets.is_empty() {
        warn!("no delimited chunks found, falling back to size-based chunking");
        return fallback_size_based_chunking(chunked_text);
    }

    if split_after.is_empty() {
        info!("no splits suggested, using fallback size-based chunking");
        let original: String = buckets.iter().map(|b| b.text.trim()).collect();
        return fallback_size_based_chunking(&original);
    }

    let sections = apply_split_points(&buckets, &split_after);

    let oversized = sections
        .iter()
        .any(|s| count_words(s) > MAX_SECTION_WORDS);
    if oversized {
        warn!("oversized section found, falling back to size-based chunking");
        let original: String = buckets.iter().map(|b| b.text.trim()).collect();
        return fallback_size_based_chunking(&original);
    }

    info!(count = sections.len(), "created sections with acceptable sizes");
    sections
}

/// Builds the chunk-split refinement prompt sent to the LLM collaborator.
fn chunking_prompt(chunked_text: &str) -> String {
    format!(
        "You are an assistant specialized in splitting text into semantically \
consistent sections.\n\n\
<instructions>\n\
    <instruction>The text has been divided into chunks, each marked with <|start_chunk_X|> and <|end_chunk_X|> tags, where X is the chunk number</instruction>\n\
    <instruction>Identify points where splits should occur, such that consecutive chunks of similar themes stay together</instruction>\n\
    <instruction>Each chunk must be between 200 and 1000 words</instruction>\n\
    <instruction>If chunks 1 and 2 belong together but chunk 3 starts a new topic, suggest a split after chunk 2</instruction>\n\
    <instruction>The chunks must be listed in ascending order</instruction>\n\
    <instruction>Respond ONLY with the format: split_after: X, Y, Z (where X, Y, Z are chunk numbers)</instruction>\n\
    <instruction>If no splits are needed, respond with: split_after: none</instruction>\n\
    <instruction>Do NOT include any explanatory text, reasoning, or additional commentary</instruction>\n\
</instructions>\n\n\
This is the document text:\n\
<document>\n\
{chunked_text}\n\
</document>\n\n\
Respond ONLY with the split_after format. No other text."
    )
}

/// Chunks a raw document into semantically-grouped sections.
///
/// Computes a complexity-derived initial grouping, asks `llm` to refine the
/// split points, and falls back to the initial size-based grouping — or, as
/// a last resort, the whole document as one chunk — on any failure.
#[instrument(skip(document_text, llm))]
pub async fn chunk_document(document_text: &str, llm: &Arc<dyn LlmClient>) -> Result<Vec<String>> {
    info!(len = document_text.len(), "starting document chunking");

    let chunked_text = prepare_chunked_text(document_text);

    let chunks = match llm.chunk_split(&chunking_prompt(&chunked_text)).await {
        Ok(llm_response) => split_text_by_llm_suggestions(&chunked_text, &llm_response),
        Err(err) => {
            warn!(error = %err, "LLM chunk-split call failed, falling back to size-based chunking");
            fallback_size_based_chunking(document_text)
        }
    };

    info!(count = chunks.len(), "finished document chunking");
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GeneratedAnswer, LlmClient as _};
    use async_trait::async_trait;

    #[test]
    fn blank_text_has_zero_complexity() {
        assert_eq!(calculate_text_complexity("   "), 0.0);
    }

    #[test]
    fn long_sentences_raise_complexity() {
        let simple = "The cat sat. It slept. It ate.";
        let complex = "Given the aforementioned constraints (which were numerous, \
            intricate, and occasionally contradictory); the committee, after \
            extensive deliberation spanning several meetings, ultimately decided \
            to postpone the vote indefinitely.";
        assert!(calculate_text_complexity(complex) > calculate_text_complexity(simple));
    }

    #[test]
    fn target_size_buckets_by_threshold() {
        assert_eq!(target_chunk_size(0.9), SIZE_HIGH_COMPLEXITY);
        assert_eq!(target_chunk_size(0.5), SIZE_MEDIUM_COMPLEXITY);
        assert_eq!(target_chunk_size(0.1), SIZE_LOW_COMPLEXITY);
    }

    #[test]
    fn sentence_splitter_respects_abbreviations() {
        let text = "Dr. Smith went home. He was tired.";
        let sentences = split_into_sentences(text);
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].starts_with("Dr. Smith"));
    }

    #[test]
    fn prepare_chunked_text_wraps_whole_document_when_no_sentences() {
        let out = prepare_chunked_text("   ");
        assert!(out.contains("<|start_chunk_0|>"));
        assert!(out.contains("<|end_chunk_0|>"));
    }

    #[test]
    fn extract_delimited_chunks_finds_all_buckets() {
        let text = "<|start_chunk_0|>\nfirst<|end_chunk_0|><|start_chunk_1|>\nsecond<|end_chunk_1|>";
        let buckets = extract_delimited_chunks(text);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].index, 0);
        assert!(buckets[0].text.contains("first"));
        assert_eq!(buckets[1].index, 1);
    }

    #[test]
    fn parse_split_points_handles_none() {
        assert_eq!(parse_split_points("split_after: none"), Vec::<usize>::new());
    }

    #[test]
    fn parse_split_points_handles_list() {
        assert_eq!(parse_split_points("split_after: 0, 2, 5"), vec![0, 2, 5]);
    }

    #[test]
    fn split_by_suggestions_falls_back_when_no_buckets_found() {
        let sections = split_text_by_llm_suggestions("plain text, no markers", "split_after: none");
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn split_by_suggestions_honors_split_points() {
        let chunked = "<|start_chunk_0|>\nalpha beta<|end_chunk_0|><|start_chunk_1|>\ngamma delta<|end_chunk_1|><|start_chunk_2|>\nepsilon<|end_chunk_2|>";
        let sections = split_text_by_llm_suggestions(chunked, "split_after: 0");
        assert_eq!(sections.len(), 2);
        assert!(sections[0].contains("alpha"));
        assert!(sections[1].contains("gamma") && sections[1].contains("epsilon"));
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn chunk_split(&self, _prompt: &str) -> Result<String> {
            Err(crate::error::GatedHnswError::invalid_input("llm unavailable"))
        }
        async fn contextualize(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_string())
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
        ) -> Result<GeneratedAnswer> {
            Ok(GeneratedAnswer {
                answer: selected.join("\n\n"),
                confidence: 0.0,
            })
        }
    }

    #[tokio::test]
    async fn chunk_document_falls_back_when_llm_fails() {
        let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
        let text = "Sentence one is here. Sentence two follows. Sentence three ends it.";
        let chunks = chunk_document(text, &llm).await.unwrap();
        assert!(!chunks.is_empty());
    }
}
