//! Deterministic sentence segmentation and keyword helpers.

use regex::Regex;
use std::sync::LazyLock;

/// Sentence boundary: terminal punctuation followed by whitespace or end of text.
/// Decimal points ("0.5 mg") and abbreviations without a trailing space stay intact.
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)").expect("valid sentence regex"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z\-]+").expect("valid word regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "can", "for", "from", "has", "have",
    "in", "is", "it", "its", "may", "of", "on", "or", "should", "that", "the", "their", "these",
    "this", "to", "was", "were", "when", "which", "while", "with", "within", "without", "also",
    "most", "more", "such", "than", "other", "used", "use", "patients", "patient", "often",
    "generally", "typically", "recommended", "including",
];

/// Split text into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_BOUNDARY
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split text into sentences, keeping only those with at least `min_len` characters.
pub fn split_sentences_min(text: &str, min_len: usize) -> Vec<String> {
    split_sentences(text)
        .into_iter()
        .filter(|s| s.chars().count() >= min_len)
        .collect()
}

/// Extract up to `max` lower-case content keywords, in order of first appearance.
pub fn keywords(text: &str, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in WORD.find_iter(text) {
        let word = m.as_str().to_lowercase();
        if word.len() < 3 || STOPWORDS.contains(&word.as_str()) || out.contains(&word) {
            continue;
        }
        out.push(word);
        if out.len() >= max {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_basic() {
        let s = split_sentences("First claim. Second claim! Third claim?");
        assert_eq!(s, vec!["First claim", "Second claim", "Third claim"]);
    }

    #[test]
    fn test_split_keeps_decimals() {
        let s = split_sentences("Give 0.5 mg/kg twice daily. Reassess at 48 h.");
        assert_eq!(s, vec!["Give 0.5 mg/kg twice daily", "Reassess at 48 h"]);
    }

    #[test]
    fn test_split_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences(" ... ").is_empty());
    }

    #[test]
    fn test_split_is_deterministic() {
        let text = "Azithromycin needs no renal adjustment. Monitor QT interval.";
        assert_eq!(split_sentences(text), split_sentences(text));
    }

    #[test]
    fn test_split_min_length() {
        let s = split_sentences_min("Short. This sentence is long enough.", 10);
        assert_eq!(s, vec!["This sentence is long enough"]);
    }

    #[test]
    fn test_keywords_drop_stopwords() {
        let k = keywords(
            "Amoxicillin is recommended for community-acquired pneumonia in adults",
            4,
        );
        assert_eq!(
            k,
            vec!["amoxicillin", "community-acquired", "pneumonia", "adults"]
        );
    }

    #[test]
    fn test_keywords_deduplicates() {
        let k = keywords("Sepsis sepsis SEPSIS shock", 5);
        assert_eq!(k, vec!["sepsis", "shock"]);
    }
}
