//! Keyword extraction for cache key generation
//!
//! Builds deterministic keyword signatures so reworded queries with the same
//! important terms share an L2 cache slot.

/// Stop words filtered out of signatures (English + Japanese particles).
const STOP_WORDS: &[&str] = &[
    // English stop words
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
    "of", "with", "by", "from", "is", "are", "was", "were", "be", "been",
    "have", "has", "had", "do", "does", "did", "will", "would", "should",
    "could", "may", "might", "can", "must", "this", "that", "these", "those",
    "it", "its", "what", "which", "who", "when", "where", "why", "how",
    // Japanese particles and common words
    "の", "は", "が", "を", "に", "へ", "と", "で", "や", "か", "も",
    "から", "まで", "より", "など", "として", "について", "による",
    "こと", "もの", "ため", "よう", "これ", "それ", "あれ", "どれ",
];

/// Default number of keywords in a signature.
pub const DEFAULT_TOP_N: usize = 3;

/// Default minimum keyword length (in characters).
pub const DEFAULT_MIN_LENGTH: usize = 3;

/// Extract the top `top_n` keywords from a query.
///
/// Tokens are lowercased, split on whitespace/hyphens/underscores, filtered
/// against the stop-word list and `min_length`, deduplicated preserving
/// order, then ranked by descending length with an alphabetical tiebreak.
pub fn extract_keywords(query: &str, top_n: usize, min_length: usize) -> Vec<String> {
    if query.trim().is_empty() {
        return vec![];
    }

    let normalized: String = query
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let words = normalized.split(|c: char| c.is_whitespace() || c == '-' || c == '_');

    let mut unique: Vec<String> = Vec::new();
    for word in words {
        if word.is_empty() || STOP_WORDS.contains(&word) || word.chars().count() < min_length {
            continue;
        }
        if !unique.iter().any(|w| w == word) {
            unique.push(word.to_string());
        }
    }

    // Longer words first, then alphabetical for stability
    unique.sort_by(|a, b| {
        b.chars()
            .count()
            .cmp(&a.chars().count())
            .then_with(|| a.cmp(b))
    });
    unique.truncate(top_n);
    unique
}

/// Join sorted keywords with `+` into a deterministic signature.
pub fn build_signature(keywords: &[String]) -> String {
    if keywords.is_empty() {
        return String::new();
    }
    let mut sorted = keywords.to_vec();
    sorted.sort();
    sorted.join("+")
}

/// Extract keywords and build the signature in one call.
/// Returns `None` when no keywords survive filtering.
pub fn signature_for(query: &str) -> Option<String> {
    let keywords = extract_keywords(query, DEFAULT_TOP_N, DEFAULT_MIN_LENGTH);
    let signature = build_signature(&keywords);
    if signature.is_empty() {
        None
    } else {
        Some(signature)
    }
}

// ============================================================================
// TESTS
// ============================================================================
