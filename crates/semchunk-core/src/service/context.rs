//! Prompt context assembled from chunks of earlier subtopics.

use crate::chunk::{Chunk, ChunkType};
use crate::service::models::ScoredChunk;
use serde::{Deserialize, Serialize};

/// Nearest chunks fetched for a context block by default.
pub const DEFAULT_CONTEXT_HITS: usize = 7;

/// Limits applied when rendering context text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Chunks listed per type
    pub per_type_limit: usize,
    /// Characters kept of each listed chunk
    pub max_chars: usize,
    /// Characters kept from the end of the previous subtopic
    pub tail_chars: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            per_type_limit: 3,
            max_chars: 300,
            tail_chars: 500,
        }
    }
}

/// Render search hits grouped by chunk type, in order of first appearance,
/// followed by the end of the previous subtopic when given.
///
/// Returns an empty string when there is nothing to show.
pub fn format_context(
    hits: &[ScoredChunk],
    previous: Option<&str>,
    options: &ContextOptions,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    if !hits.is_empty() {
        lines.push("RELEVANT CONCEPTS FROM PREVIOUS LESSONS:".to_string());

        let mut groups: Vec<(ChunkType, Vec<&Chunk>)> = Vec::new();
        for hit in hits {
            let chunk_type = hit.chunk.chunk_type;
            match groups.iter_mut().find(|(t, _)| *t == chunk_type) {
                Some((_, members)) => members.push(&hit.chunk),
                None => groups.push((chunk_type, vec![&hit.chunk])),
            }
        }

        for (chunk_type, members) in groups {
            lines.push(format!("\n{} concepts:", chunk_type.as_str().to_uppercase()));
            for chunk in members.into_iter().take(options.per_type_limit) {
                lines.push(format!("- {}...", head(&chunk.content, options.max_chars)));
            }
        }
    }

    if let Some(previous) = previous.filter(|p| !p.is_empty()) {
        lines.push("\nPREVIOUS LESSON CONCLUSION:".to_string());
        lines.push(tail(previous, options.tail_chars).to_string());
    }

    lines.join("\n")
}

/// Importance of a chunk type in a condensed summary, lowest first.
fn importance(chunk_type: ChunkType) -> u8 {
    match chunk_type {
        ChunkType::Definition => 0,
        ChunkType::Concept => 1,
        ChunkType::Application => 2,
        ChunkType::Procedure => 3,
        ChunkType::Example => 4,
    }
}

/// Condensed summary: definitions first, examples last, each entry tagged
/// with its type and cut to `max_chars`.
pub fn summarize(chunks: &[Chunk], max_chars: usize) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| importance(c.chunk_type));
    ordered
        .into_iter()
        .map(|c| {
            format!(
                "[{}] {}...",
                c.chunk_type.as_str().to_uppercase(),
                head(&c.content, max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// First `n` characters of `text`.
fn head(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Last `n` characters of `text`.
fn tail(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ParentId;

    fn hit(chunk_type: ChunkType, content: &str) -> ScoredChunk {
        ScoredChunk::new(Chunk::new(ParentId(1), chunk_type, content), 0.1)
    }

    #[test]
    fn test_groups_by_first_appearance() {
        let hits = vec![
            hit(ChunkType::Example, "e1"),
            hit(ChunkType::Definition, "d1"),
            hit(ChunkType::Example, "e2"),
            hit(ChunkType::Example, "e3"),
            hit(ChunkType::Example, "e4"),
        ];
        let text = format_context(&hits, None, &ContextOptions::default());
        let expected = "RELEVANT CONCEPTS FROM PREVIOUS LESSONS:\n\
                        \nEXAMPLE concepts:\n- e1...\n- e2...\n- e3...\n\
                        \nDEFINITION concepts:\n- d1...";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let options = ContextOptions {
            per_type_limit: 3,
            max_chars: 3,
            tail_chars: 2,
        };
        let hits = vec![hit(ChunkType::Concept, "éèêë")];
        let text = format_context(&hits, Some("fin: ça"), &options);
        assert!(text.contains("- éèê..."));
        assert!(text.ends_with("\nPREVIOUS LESSON CONCLUSION:\nça"));
    }

    #[test]
    fn test_previous_only_and_empty() {
        let options = ContextOptions::default();
        assert_eq!(format_context(&[], None, &options), "");
        assert_eq!(
            format_context(&[], Some("the end"), &options),
            "\nPREVIOUS LESSON CONCLUSION:\nthe end"
        );
        assert_eq!(tail("abc", 0), "");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[test]
    fn test_summary_puts_definitions_first() {
        let chunks = vec![
            Chunk::new(ParentId(1), ChunkType::Example, "for instance"),
            Chunk::new(ParentId(1), ChunkType::Definition, "a monoid is"),
            Chunk::new(ParentId(1), ChunkType::Concept, "associativity"),
        ];
        assert_eq!(
            summarize(&chunks, 200),
            "[DEFINITION] a monoid is...\n\n\
             [CONCEPT] associativity...\n\n\
             [EXAMPLE] for instance..."
        );
        assert_eq!(summarize(&chunks[..1], 3), "[EXAMPLE] for...");
    }
}
