//! Prompt templates and response parsers.
//!
//! The primary answer and every consistency or entropy trial are generated
//! from the same [`answer_prompt`], so resampling varies only the temperature.

use regex::Regex;
use std::sync::LazyLock;

use medguard_core::types::RetrievedChunk;

use crate::decompose::SubAnswer;

const ANSWER_TEMPLATE: &str = "\
You are a medical information assistant.
Answer the question based ONLY on the following context.
If the context does not contain the answer, say \"I don't have enough information to answer \
this question reliably. Please consult a healthcare professional.\"
Do NOT make up or infer information not present in the context.
Always cite the source document id when providing information.

Context:
{context}

Question: {question}

Answer:";

const RERANK_TEMPLATE: &str = "\
Rate how relevant the passage is to the medical question on a scale from 0 (irrelevant) \
to 10 (directly answers it). Reply with the number only.

Question: {question}

Passage:
{passage}

Relevance:";

const DECOMPOSE_TEMPLATE: &str = "\
You are a medical librarian. Break down this complex medical question into 2-{max} simpler, \
specific questions that together would provide a complete answer.

Complex question: {question}

Provide the simpler questions as a numbered list:";

const SYNTHESIS_TEMPLATE: &str = "\
Based on the following information, provide a comprehensive answer to the original question.

Original question: {question}

Information gathered:
{findings}

Instructions:
- Combine the information into one coherent answer
- Only use the information provided above
- If there are contradictions, mention them
- Be specific and cite relevant details

Comprehensive answer:";

static LEADING_ENUMERATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\-\.\)\s]+").expect("valid enumeration regex"));

static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid number regex"));

/// Render the retrieved chunks as a context block, one per paragraph.
pub fn render_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[{}] {}", c.source_document_id, c.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn answer_prompt(question: &str, chunks: &[RetrievedChunk]) -> String {
    ANSWER_TEMPLATE
        .replace("{context}", &render_context(chunks))
        .replace("{question}", question.trim())
}

pub fn rerank_prompt(question: &str, passage: &str) -> String {
    RERANK_TEMPLATE
        .replace("{question}", question.trim())
        .replace("{passage}", passage.trim())
}

pub fn decompose_prompt(question: &str, max_sub_questions: usize) -> String {
    DECOMPOSE_TEMPLATE
        .replace("{max}", &max_sub_questions.max(2).to_string())
        .replace("{question}", question.trim())
}

/// Prompt combining sub-answers, numbered from 1, into a final answer.
pub fn synthesis_prompt(question: &str, sub_answers: &[SubAnswer]) -> String {
    let findings = sub_answers
        .iter()
        .enumerate()
        .map(|(i, sub)| {
            format!(
                "Sub-question {}: {}\nAnswer: {}",
                i + 1,
                sub.question.trim(),
                sub.answer.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    SYNTHESIS_TEMPLATE
        .replace("{question}", question.trim())
        .replace("{findings}", &findings)
}

/// Parse a 0-10 relevance grade into [0, 1]. `None` if no number is present.
pub fn parse_relevance(response: &str) -> Option<f32> {
    let raw: f32 = FIRST_NUMBER.find(response)?.as_str().parse().ok()?;
    Some((raw / 10.0).clamp(0.0, 1.0))
}

/// Extract numbered or bulleted sub-questions, at most `max`.
pub fn parse_sub_questions(response: &str, max: usize) -> Vec<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == '-')
        })
        .map(|line| LEADING_ENUMERATION.replace(line, "").trim().to_string())
        .filter(|q| !q.is_empty())
        .take(max)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(doc: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            id: format!("{doc}-0"),
            text: text.into(),
            source_document_id: doc.into(),
            relevance_score: 1.0,
            recall_score: 1.0,
        }
    }

    #[test]
    fn test_answer_prompt_includes_context_and_question() {
        let prompt = answer_prompt(
            "  What treats CAP? ",
            &[chunk("PMC1", "Amoxicillin."), chunk("PMC2", "Doxycycline.")],
        );
        assert!(prompt.contains("[PMC1] Amoxicillin.\n\n[PMC2] Doxycycline."));
        assert!(prompt.contains("Question: What treats CAP?\n"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_answer_prompt_is_deterministic() {
        let chunks = [chunk("PMC1", "Amoxicillin.")];
        assert_eq!(answer_prompt("q", &chunks), answer_prompt("q", &chunks));
    }

    #[test]
    fn test_parse_relevance() {
        assert_eq!(parse_relevance("8"), Some(0.8));
        assert_eq!(parse_relevance("Relevance: 7.5/10"), Some(0.75));
        assert_eq!(parse_relevance("42"), Some(1.0));
        assert_eq!(parse_relevance("not relevant"), None);
    }

    #[test]
    fn test_parse_sub_questions() {
        let response =
            "Here you go:\n1. What is sepsis?\n2) How is it treated?\n- Which antibiotics?\n\n3.\n";
        assert_eq!(
            parse_sub_questions(response, 4),
            vec![
                "What is sepsis?",
                "How is it treated?",
                "Which antibiotics?"
            ]
        );
        assert_eq!(parse_sub_questions(response, 1).len(), 1);
    }

    #[test]
    fn test_synthesis_prompt_lists_sub_answers() {
        let subs = [
            SubAnswer {
                question: "What causes sepsis?".into(),
                answer: "Infection. ".into(),
                chunk_ids: vec!["s1".into()],
            },
            SubAnswer {
                question: "How is it treated?".into(),
                answer: "Antibiotics.".into(),
                chunk_ids: vec![],
            },
        ];
        let prompt = synthesis_prompt(" Sepsis? ", &subs);
        assert!(prompt.contains("Original question: Sepsis?\n"));
        assert!(prompt.contains(
            "Sub-question 1: What causes sepsis?\nAnswer: Infection.\n\nSub-question 2: How is it treated?"
        ));
        assert!(prompt.ends_with("Comprehensive answer:"));
    }

    #[test]
    fn test_decompose_prompt_bounds() {
        let prompt = decompose_prompt("complex", 4);
        assert!(prompt.contains("2-4 simpler"));
        assert!(prompt.contains("Complex question: complex"));
    }
}
