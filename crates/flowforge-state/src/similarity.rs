//! Token-set similarity used by attempt-store lookups.
//!
//! Jaccard similarity over lowercase word tokens of length >= 3. Shared by
//! the in-memory fake and the JSONL store so both rank identically.

use std::collections::BTreeSet;

/// Tokenize `text` into the lowercase word set used for similarity ranking.
pub(crate) fn token_set(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            if current.len() >= 3 {
                tokens.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 {
        tokens.insert(current);
    }
    tokens
}

/// Jaccard similarity between two token sets. Empty sets score 0.0.
pub(crate) fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.union(right).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Similarity between two descriptions.
pub(crate) fn description_similarity(query: &str, target: &str) -> f64 {
    jaccard(&token_set(query), &token_set(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_set_drops_short_tokens() {
        let tokens = token_set("extract the code blocks of a doc");
        assert!(tokens.contains("extract"));
        assert!(tokens.contains("code"));
        assert!(tokens.contains("blocks"));
        assert!(!tokens.contains("of"));
        assert!(!tokens.contains("a"));
    }

    #[test]
    fn test_identical_descriptions_score_one() {
        let score = description_similarity(
            "summarize the report into bullet points",
            "summarize the report into bullet points",
        );
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_descriptions_score_zero() {
        let score = description_similarity("fetch remote document", "compute word totals");
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_overlap_scores_between_zero_and_one() {
        let score =
            description_similarity("summarize the report", "summarize the quarterly numbers");
        assert!(score > 0.0 && score < 1.0);
    }
}
