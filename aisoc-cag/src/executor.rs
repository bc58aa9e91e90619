//! Query execution against a published cache entry
//!
//! Each query restores its own session from the entry's immutable state,
//! rewinds it to the end of the prefix, appends the question and generates
//! within a token budget and a deadline.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{GenerationBackend, GenerationSession, Step};
use crate::cache::entry::CacheEntry;
use crate::cache::types::Fingerprint;
use crate::error::{CagError, Result};
use crate::record::{ThreatIndicator, ThreatPriority};
use crate::relevance;

/// Why an answer stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// `max_tokens` reached, or the backend ran out of room
    TokenBudget,
    /// Generation deadline passed
    Deadline,
}

/// One cached record the question touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub source_id: String,
    pub priority: ThreatPriority,
    pub severity_level: u8,
    pub indicators: Vec<ThreatIndicator>,
    pub score: u32,
}

/// Answer to a question over a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer_text: String,
    pub used_entry_fingerprint: Fingerprint,
    pub latency_ms: u64,
    /// Cached units the question touches, best first
    pub matched_record_ids: Vec<String>,
    pub truncated: Option<Truncation>,
    pub generated_tokens: usize,
    pub findings: Vec<Finding>,
}

enum Outcome {
    Step(Result<Step>),
    Cancelled,
    Deadline,
}

/// Runs questions against cache entries
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    max_tokens_cap: usize,
    generation_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(max_tokens_cap: usize, generation_timeout: Duration) -> Self {
        Self {
            max_tokens_cap: max_tokens_cap.max(1),
            generation_timeout,
        }
    }

    /// Clamp a requested budget to `[1, max_tokens_cap]`
    pub fn clamp_tokens(&self, max_tokens: usize) -> usize {
        max_tokens.clamp(1, self.max_tokens_cap)
    }

    /// Restore a private session rewound to the end of the prefix
    fn restore(
        &self,
        entry: &CacheEntry,
        backend: &dyn GenerationBackend,
    ) -> Result<Box<dyn GenerationSession>> {
        entry.verify_state()?;

        let corrupt = |reason: String| CagError::StateCorruption {
            fingerprint: entry.fingerprint().to_string(),
            reason,
        };

        let mut session = backend
            .restore(entry.prefix_state())
            .map_err(|e| corrupt(format!("restore failed: {e}")))?;

        let origin = entry.metadata.origin_length;
        if session.len() < origin {
            return Err(corrupt(format!(
                "restored session holds {} units, prefix needs {}",
                session.len(),
                origin
            )));
        }
        session.truncate(origin);
        Ok(session)
    }

    /// Answer `question` from `entry`
    pub async fn execute(
        &self,
        entry: &CacheEntry,
        backend: &dyn GenerationBackend,
        question: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let question = question.trim();
        if question.is_empty() {
            return Err(CagError::InvalidQuery("question is empty".to_string()));
        }

        let started = Instant::now();
        let budget = self.clamp_tokens(max_tokens);
        let mut session = self.restore(entry, backend)?;
        session.feed(&format!("\nQuestion: {}\nAnswer:", question))?;

        let deadline = tokio::time::Instant::now() + self.generation_timeout;
        let mut raw = String::new();
        let mut generated = 0usize;
        let mut truncated = None;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Outcome::Deadline,
                step = session.next(budget.saturating_sub(generated).max(1)) => Outcome::Step(step),
            };

            match outcome {
                Outcome::Cancelled => {
                    debug!("Generation on {} cancelled", entry.fingerprint().short());
                    return Err(CagError::Cancelled);
                }
                Outcome::Deadline => {
                    warn!(
                        "Generation on {} hit the {:?} deadline after {} tokens",
                        entry.fingerprint().short(),
                        self.generation_timeout,
                        generated
                    );
                    truncated = Some(Truncation::Deadline);
                    break;
                }
                // past the budget only a further token means the answer was cut
                Outcome::Step(Ok(Step::Token(_))) if generated >= budget => {
                    truncated = Some(Truncation::TokenBudget);
                    break;
                }
                Outcome::Step(Ok(Step::Token(piece))) => {
                    raw.push_str(&piece);
                    generated += 1;
                }
                Outcome::Step(Ok(Step::End)) => break,
                Outcome::Step(Ok(Step::Exhausted)) => {
                    truncated = Some(Truncation::TokenBudget);
                    break;
                }
                Outcome::Step(Err(CagError::GenerationTimeout { timeout_ms })) if generated > 0 => {
                    warn!(
                        "Backend timed out after {}ms on {}, keeping {} tokens",
                        timeout_ms,
                        entry.fingerprint().short(),
                        generated
                    );
                    truncated = Some(Truncation::Deadline);
                    break;
                }
                Outcome::Step(Err(e)) => return Err(e),
            }
        }
        drop(session);

        let answer_text = strip_scratch(&raw);
        let matched = relevance::matching(entry.units(), question);
        let findings = matched
            .iter()
            .map(|ranked| Finding {
                source_id: ranked.unit.source_id().to_string(),
                priority: ranked.unit.priority(),
                severity_level: ranked.unit.severity_level(),
                indicators: ranked.unit.indicators().to_vec(),
                score: ranked.score,
            })
            .collect::<Vec<_>>();

        let result = QueryResult {
            answer_text,
            used_entry_fingerprint: entry.fingerprint().clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            matched_record_ids: findings.iter().map(|f| f.source_id.clone()).collect(),
            truncated,
            generated_tokens: generated,
            findings,
        };

        debug!(
            "Answered on {} in {}ms ({} tokens, {} matched, truncated: {:?})",
            entry.fingerprint().short(),
            result.latency_ms,
            result.generated_tokens,
            result.matched_record_ids.len(),
            result.truncated
        );
        Ok(result)
    }
}

// a block runs to its closing tag, or to the end of the text if unterminated
static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<think>.*?(?:</think>|$)").expect("valid think block pattern")
});

static THINK_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?think>").expect("valid think tag pattern"));

/// Remove model scratch reasoning from generated text
///
/// Drops closed `<think>` blocks, an unterminated trailing block, and any
/// stray tags left over.
pub fn strip_scratch(text: &str) -> String {
    let without_blocks = THINK_BLOCK.replace_all(text, "");
    THINK_TAG.replace_all(&without_blocks, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_closed_blocks() {
        let text = "<think>\nlet me reason\nabout this\n</think>\n\nThree SSH failures on web-01.";
        assert_eq!(strip_scratch(text), "Three SSH failures on web-01.");
    }

    #[test]
    fn test_strip_is_case_insensitive_and_handles_many_blocks() {
        let text = "<THINK>a</Think>First. <think>b</think>Second.";
        assert_eq!(strip_scratch(text), "First. Second.");
    }

    #[test]
    fn test_strip_unterminated_trailing_block() {
        let text = "Answer so far. <think>still reasoning when the budget ran";
        assert_eq!(strip_scratch(text), "Answer so far.");
    }

    #[test]
    fn test_strip_stray_closing_tag() {
        assert_eq!(strip_scratch("reasoning</think> Final answer"), "reasoning Final answer");
        assert_eq!(strip_scratch("plain"), "plain");
    }

    #[test]
    fn test_clamp_tokens() {
        let executor = QueryExecutor::new(500, Duration::from_secs(1));
        assert_eq!(executor.clamp_tokens(0), 1);
        assert_eq!(executor.clamp_tokens(50), 50);
        assert_eq!(executor.clamp_tokens(5000), 500);
    }
}
