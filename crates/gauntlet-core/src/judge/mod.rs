//! Step evaluator: scores an actual/expected output pair through a judge
//! model call. The judge call goes through the same provider-adapter
//! contract as ordinary steps, at temperature 0 for determinism.
//!
//! Verdict parsing is fail-closed: only a verdict whose normalized text
//! starts with "passed" counts as success. Hedged wording, malformed output
//! and judge-call errors all fail the step, with the original text (or
//! error) preserved as the failure reason.

use crate::catalog::ProjectSnapshot;
use crate::model::{ChatMessage, MatchType};
use crate::providers::llm::ChatRequest;
use crate::providers::ProviderRegistry;
use std::sync::Arc;
use tracing::debug;

/// Canonical instruction for `exact` comparisons.
const EXACT_INSTRUCTION: &str = "You are comparing the actual output of a test step against its \
expected output. Require literal, character-for-character equivalence, including whitespace and \
formatting. If the actual output is identical to the expected output, reply with exactly \
'passed'. If there is any difference at all, reply with a short explanation of the difference. \
Never reply 'passed' unless the two are identical.";

/// Canonical instruction for `same_meaning` comparisons.
const SAME_MEANING_INSTRUCTION: &str = "You are comparing the actual output of a test step \
against its expected output. Compare meaning, not wording: paraphrasing, formatting and ordering \
differences are acceptable. Treat sets of answers as unordered; extra facts that do not \
contradict the expected output are acceptable. Canonicalize conversational perspective: an \
instruction to 'greet the assistant' means the assistant greets the user, so do not fail a \
comparison over who is addressing whom. If the actual output conveys the same meaning as the \
expected output, reply with exactly 'passed'. Otherwise reply with a short explanation of what \
is missing or different.";

/// Outcome of one judged comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    /// The original, non-normalized verdict text, persisted as the step's
    /// failure reason.
    Failed(String),
}

/// System instruction for a judge request: the step's custom validation
/// prompt when present and non-empty, else the canonical instruction for
/// its match type.
pub fn system_instruction(match_type: MatchType, custom_prompt: Option<&str>) -> String {
    if let Some(custom) = custom_prompt {
        if !custom.trim().is_empty() {
            return custom.to_string();
        }
    }
    match match_type {
        MatchType::Exact => EXACT_INSTRUCTION.to_string(),
        MatchType::SameMeaning => SAME_MEANING_INSTRUCTION.to_string(),
    }
}

/// User content for a judge request: the literal actual and expected
/// outputs, unmodified.
pub fn comparison_content(actual: &str, expected: &str) -> String {
    format!("ACTUAL OUTPUT:\n{actual}\n\nEXPECTED OUTPUT:\n{expected}")
}

/// Parse the judge's raw reply.
///
/// Normalization lower-cases the text and removes every character that is
/// not a lowercase letter. A normalized text starting with "passed" is a
/// success; anything else fails with the original text as the reason.
pub fn parse_verdict(raw: &str) -> Verdict {
    let normalized: String = raw
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase())
        .collect();
    if normalized.starts_with("passed") {
        Verdict::Passed
    } else {
        Verdict::Failed(raw.to_string())
    }
}

/// The judge: a fixed judge model invoked through the provider registry.
pub struct Judge {
    registry: Arc<ProviderRegistry>,
    model: String,
}

impl Judge {
    pub fn new(registry: Arc<ProviderRegistry>, model: impl Into<String>) -> Self {
        Self {
            registry,
            model: model.into(),
        }
    }

    /// Score `actual` against `expected`. Errors here (missing judge model,
    /// missing credential, provider failure) are judge-call exceptions: the
    /// caller turns them into a failed step with the error as the reason.
    pub async fn evaluate(
        &self,
        snapshot: &ProjectSnapshot,
        actual: &str,
        expected: &str,
        match_type: MatchType,
        custom_prompt: Option<&str>,
    ) -> anyhow::Result<Verdict> {
        let entry = snapshot.model(&self.model).ok_or_else(|| {
            anyhow::anyhow!("judge model '{}' is not in the model catalog", self.model)
        })?;
        let credential = snapshot.credential(&entry.provider).ok_or_else(|| {
            anyhow::anyhow!(
                "no credential configured for judge provider '{}'",
                entry.provider
            )
        })?;
        let adapter = self.registry.resolve(&entry.provider);

        let request = ChatRequest {
            model: entry.model.clone(),
            messages: vec![
                ChatMessage::system(system_instruction(match_type, custom_prompt)),
                ChatMessage::user(comparison_content(actual, expected)),
            ],
            // Deterministic verdicts.
            temperature: 0.0,
            max_tokens: None,
        };

        let response = adapter.chat(&request, credential).await?;
        let text = response
            .primary_text()
            .ok_or_else(|| anyhow::anyhow!("judge response has no message content"))?;
        let verdict = parse_verdict(text);
        debug!(
            model = %self.model,
            passed = matches!(verdict, Verdict::Passed),
            "judge verdict"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_verdicts_survive_punctuation_and_case() {
        assert_eq!(parse_verdict("passed"), Verdict::Passed);
        assert_eq!(parse_verdict("Passed. Matches requirement."), Verdict::Passed);
        assert_eq!(parse_verdict("  PASSED!! (identical)"), Verdict::Passed);
        assert_eq!(parse_verdict("passed, same greeting intent"), Verdict::Passed);
    }

    #[test]
    fn non_passing_verdicts_keep_the_original_text() {
        let raw = "Close but missing field X.";
        assert_eq!(parse_verdict(raw), Verdict::Failed(raw.to_string()));
    }

    #[test]
    fn ambiguous_verdicts_fail_closed() {
        // "not passed" normalizes to "notpassed", which does not start with
        // "passed".
        assert_eq!(
            parse_verdict("not passed"),
            Verdict::Failed("not passed".to_string())
        );
        assert_eq!(parse_verdict(""), Verdict::Failed(String::new()));
        assert_eq!(
            parse_verdict("The test has passed"),
            Verdict::Failed("The test has passed".to_string())
        );
    }

    #[test]
    fn custom_prompt_overrides_canonical_instruction() {
        let custom = system_instruction(MatchType::Exact, Some("Judge leniently."));
        assert_eq!(custom, "Judge leniently.");

        // Blank custom prompts fall back to the match-type instruction.
        let blank = system_instruction(MatchType::Exact, Some("   "));
        assert!(blank.contains("character-for-character"));

        let semantic = system_instruction(MatchType::SameMeaning, None);
        assert!(semantic.contains("greet the assistant"));
    }

    #[test]
    fn comparison_content_is_literal() {
        let content = comparison_content("Hello there!", "Hello");
        assert!(content.contains("ACTUAL OUTPUT:\nHello there!"));
        assert!(content.contains("EXPECTED OUTPUT:\nHello"));
    }
}
