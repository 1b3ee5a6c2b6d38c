//! Text Chunker
//!
//! Deterministic splitter honoring markdown structure under a token budget:
//! 1. Fenced code blocks are lifted out behind placeholders; never split.
//! 2. The remainder splits on markdown headings.
//! 3. Oversized sections split on blank-line paragraphs, greedily packed.
//! 4. Oversized paragraphs split on sentence boundaries, greedily packed.
//! 5. Oversized sentences are emitted as-is.
//! 6. Placeholders are restored, empty chunks dropped.
//!
//! Token counting uses the cl100k_base tokenizer. The tokenizer choice is
//! part of the data-format contract: switching it invalidates persisted
//! salience weights.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

use crate::memory::{Chunk, Metadata, MetadataValue};

/// Default token budget per chunk.
pub const DEFAULT_MAX_TOKENS: usize = 512;

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^#{1,6}\s+.+$").expect("valid heading pattern"))
}

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"```[\s\S]*?```").expect("valid fence pattern"))
}

fn blank_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n\s*\n").expect("valid blank-line pattern"))
}

/// Markdown chunker with a fixed tokenizer.
pub struct Chunker {
    tokenizer: Option<CoreBPE>,
    max_tokens: usize,
}

impl Chunker {
    /// Create a chunker with the default 512-token budget.
    pub fn new() -> Self {
        Self::with_max_tokens(DEFAULT_MAX_TOKENS)
    }

    /// Create a chunker with a custom token budget.
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        let tokenizer = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("cl100k_base unavailable, using approximate token counts: {e}");
                None
            }
        };
        Self {
            tokenizer,
            max_tokens: max_tokens.max(1),
        }
    }

    /// Split markdown text into chunks with stable ids
    /// `<memory_id>-chunk-<index>` and monotonically increasing indices.
    pub fn chunk(&self, text: &str, memory_id: &str, metadata: &Metadata) -> Vec<Chunk> {
        let (masked, code_blocks) = extract_code_blocks(text);
        let sections = split_by_headings(&masked);

        let mut pieces: Vec<String> = Vec::new();
        for section in sections {
            if self.count_tokens(&section) > self.max_tokens {
                pieces.extend(self.split_by_paragraphs(&section));
            } else {
                pieces.push(section);
            }
        }

        let restored = restore_code_blocks(pieces, &code_blocks);

        let mut chunks = Vec::new();
        let mut index = 0usize;
        for piece in restored {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut chunk_metadata = metadata.clone();
            chunk_metadata
                .entry("memory_id".to_string())
                .or_insert_with(|| MetadataValue::Str(memory_id.to_string()));
            chunk_metadata
                .entry("chunk_index".to_string())
                .or_insert(MetadataValue::Int(index as i64));

            chunks.push(Chunk {
                id: Chunk::make_id(memory_id, index),
                memory_id: memory_id.to_string(),
                content: trimmed.to_string(),
                tokens: self.count_tokens(trimmed),
                embedding: None,
                metadata: chunk_metadata,
            });
            index += 1;
        }

        debug!(chunks = chunks.len(), memory_id, "chunked text");
        chunks
    }

    /// Chunk a (user, assistant) exchange. A pair under the token budget is
    /// emitted as a single chunk with a fixed layout; otherwise falls through
    /// to the generic algorithm.
    pub fn chunk_conversation(
        &self,
        user_message: &str,
        assistant_message: &str,
        memory_id: &str,
        metadata: &Metadata,
    ) -> Vec<Chunk> {
        let conversation = format_conversation(user_message, assistant_message);
        let total_tokens = self.count_tokens(&conversation);

        if total_tokens <= self.max_tokens {
            let mut chunk_metadata = metadata.clone();
            chunk_metadata
                .entry("memory_id".to_string())
                .or_insert_with(|| MetadataValue::Str(memory_id.to_string()));
            chunk_metadata
                .entry("chunk_index".to_string())
                .or_insert(MetadataValue::Int(0));

            return vec![Chunk {
                id: Chunk::make_id(memory_id, 0),
                memory_id: memory_id.to_string(),
                content: conversation,
                tokens: total_tokens,
                embedding: None,
                metadata: chunk_metadata,
            }];
        }

        self.chunk(&conversation, memory_id, metadata)
    }

    /// Token count under the fixed tokenizer, with a word-count approximation
    /// when the tokenizer is unavailable.
    pub fn count_tokens(&self, text: &str) -> usize {
        if let Some(bpe) = &self.tokenizer {
            return bpe.encode_ordinary(text).len();
        }
        // 1 token ~ 0.75 words
        (text.split_whitespace().count() as f64 / 0.75) as usize
    }

    fn split_by_paragraphs(&self, section: &str) -> Vec<String> {
        let paragraphs: Vec<&str> = blank_line_pattern().split(section).collect();

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for paragraph in paragraphs {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            let paragraph_tokens = self.count_tokens(paragraph);

            if paragraph_tokens > self.max_tokens {
                if !current.is_empty() {
                    chunks.push(current.join("\n\n"));
                    current.clear();
                    current_tokens = 0;
                }
                chunks.extend(self.split_by_sentences(paragraph));
                continue;
            }

            if current_tokens + paragraph_tokens > self.max_tokens && !current.is_empty() {
                chunks.push(current.join("\n\n"));
                current.clear();
                current_tokens = 0;
            }

            current.push(paragraph.to_string());
            current_tokens += paragraph_tokens;
        }

        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
        }
        chunks
    }

    fn split_by_sentences(&self, paragraph: &str) -> Vec<String> {
        let sentences = split_sentences(paragraph);

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for sentence in sentences {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }

            let sentence_tokens = self.count_tokens(sentence);

            // A single oversized sentence cannot be split further
            if sentence_tokens > self.max_tokens {
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                    current.clear();
                    current_tokens = 0;
                }
                chunks.push(sentence.to_string());
                continue;
            }

            if current_tokens + sentence_tokens > self.max_tokens && !current.is_empty() {
                chunks.push(current.join(" "));
                current.clear();
                current_tokens = 0;
            }

            current.push(sentence.to_string());
            current_tokens += sentence_tokens;
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed conversation chunk layout.
pub fn format_conversation(user: &str, assistant: &str) -> String {
    format!("**User:**\n{user}\n\n**Assistant:**\n{assistant}")
}

fn extract_code_blocks(text: &str) -> (String, HashMap<String, String>) {
    let mut blocks = HashMap::new();
    let mut counter = 0usize;
    let masked = code_block_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let placeholder = format!("__CODE_BLOCK_{counter}__");
            blocks.insert(placeholder.clone(), caps[0].to_string());
            counter += 1;
            placeholder
        })
        .into_owned();
    (masked, blocks)
}

fn restore_code_blocks(chunks: Vec<String>, blocks: &HashMap<String, String>) -> Vec<String> {
    chunks
        .into_iter()
        .map(|mut chunk| {
            for (placeholder, code) in blocks {
                if chunk.contains(placeholder) {
                    chunk = chunk.replace(placeholder, code);
                }
            }
            chunk
        })
        .collect()
}

fn split_by_headings(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut saw_heading = false;

    for line in text.split('\n') {
        if heading_pattern().is_match(line) {
            saw_heading = true;
            if !current.is_empty() {
                sections.push(current.join("\n"));
            }
            current = vec![line];
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }

    // Heading-free input stays a single section
    if !saw_heading {
        return vec![text.to_string()];
    }
    sections
}

/// Split on `.!?` followed by whitespace, keeping the punctuation with the
/// preceding sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let next_is_space = chars.get(i + 1).map(|n| n.is_whitespace()).unwrap_or(false);
            if next_is_space {
                let sentence: String = chars[start..=i].iter().collect();
                sentences.push(sentence);
                // Skip the whitespace run
                i += 1;
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                start = i;
                continue;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        sentences.push(chars[start..].iter().collect());
    }
    sentences
}

// ============================================================================
// TESTS
// ============================================================================
