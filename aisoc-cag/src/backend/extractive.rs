//! Deterministic offline backend
//!
//! The state blob is the serialized piece sequence of the prefix. Generation
//! picks the cached event lines that best answer the question and streams them
//! back word by word, so answers are always grounded in the warmed prefix.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::{
    split_pieces, GenerationBackend, GenerationSession, PrefixState, Step, TokenBuffer, WarmState,
};
use crate::error::{CagError, Result};
use crate::relevance::QueryTerms;

const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ExtractiveState {
    version: u32,
    tokens: Vec<String>,
}

static EVENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?:CRITICAL|HIGH|MEDIUM|LOW) L(\d+)\]").expect("valid event line pattern")
});

/// Offline backend answering from the cached event lines
#[derive(Debug, Clone)]
pub struct ExtractiveBackend {
    max_lines: usize,
    context_window: Option<usize>,
}

impl Default for ExtractiveBackend {
    fn default() -> Self {
        Self {
            max_lines: 5,
            context_window: None,
        }
    }
}

impl ExtractiveBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of event lines quoted in one answer
    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self
    }

    /// Session length at which generation reports `Exhausted`
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = Some(window);
        self
    }
}

#[async_trait]
impl GenerationBackend for ExtractiveBackend {
    fn name(&self) -> &str {
        "extractive"
    }

    fn count_tokens(&self, text: &str) -> usize {
        split_pieces(text).len()
    }

    async fn warm(&self, prefix: &str) -> Result<WarmState> {
        let tokens: Vec<String> = split_pieces(prefix).into_iter().map(str::to_string).collect();
        let origin_length = tokens.len();
        let blob = serde_json::to_vec(&ExtractiveState {
            version: STATE_VERSION,
            tokens,
        })?;

        debug!("Warmed extractive prefix: {} pieces", origin_length);
        Ok(WarmState {
            state: PrefixState::new(blob),
            origin_length,
        })
    }

    fn restore(&self, state: &PrefixState) -> Result<Box<dyn GenerationSession>> {
        let decoded: ExtractiveState = serde_json::from_slice(state.as_bytes())?;
        if decoded.version != STATE_VERSION {
            return Err(CagError::Backend(format!(
                "unsupported extractive state version {}",
                decoded.version
            )));
        }

        Ok(Box::new(ExtractiveSession {
            buffer: TokenBuffer::from_tokens(decoded.tokens),
            pending: None,
            max_lines: self.max_lines,
            context_window: self.context_window,
        }))
    }
}

struct ExtractiveSession {
    buffer: TokenBuffer,
    pending: Option<VecDeque<String>>,
    max_lines: usize,
    context_window: Option<usize>,
}

impl ExtractiveSession {
    fn compose_answer(&self) -> String {
        let prefix = self.buffer.prefix_text();
        let prompt = self.buffer.prompt_text();
        let terms = QueryTerms::parse(&prompt.replace("Question:", " ").replace("Answer:", " "));

        let events: Vec<(&str, u8)> = prefix
            .lines()
            .map(str::trim)
            .filter_map(|line| {
                let caps = EVENT_LINE.captures(line)?;
                let level = caps.get(1)?.as_str().parse().ok()?;
                Some((line, level))
            })
            .collect();

        if events.is_empty() {
            return "The knowledge base contains no security events.".to_string();
        }

        let mut scored: Vec<(&str, u8, u32)> = events
            .iter()
            .map(|(line, level)| (*line, *level, terms.score_line(line, *level)))
            .filter(|(_, _, score)| *score > 0)
            .collect();
        // stable sort keeps prefix order among equal scores
        scored.sort_by(|a, b| b.2.cmp(&a.2));

        let (header, lines): (String, Vec<&str>) = if scored.is_empty() {
            let mut by_severity = events.clone();
            by_severity.sort_by(|a, b| b.1.cmp(&a.1));
            (
                "No cached event matches the question directly. Most severe cached events:"
                    .to_string(),
                by_severity
                    .into_iter()
                    .take(self.max_lines)
                    .map(|(line, _)| line)
                    .collect(),
            )
        } else {
            let lines: Vec<&str> = scored
                .into_iter()
                .take(self.max_lines)
                .map(|(line, _, _)| line)
                .collect();
            (
                format!(
                    "Found {} relevant security event(s) in the knowledge base:",
                    lines.len()
                ),
                lines,
            )
        };

        let mut answer = header;
        for line in lines {
            answer.push_str("\n- ");
            answer.push_str(line);
        }
        answer
    }
}

#[async_trait]
impl GenerationSession for ExtractiveSession {
    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
        self.pending = None;
    }

    fn feed(&mut self, text: &str) -> Result<()> {
        self.buffer.push_text(text);
        self.pending = None;
        Ok(())
    }

    async fn next(&mut self, _remaining: usize) -> Result<Step> {
        if let Some(window) = self.context_window {
            if self.buffer.len() >= window {
                return Ok(Step::Exhausted);
            }
        }

        if self.pending.is_none() {
            let answer = self.compose_answer();
            self.pending = Some(split_pieces(&answer).into_iter().map(str::to_string).collect());
        }

        match self.pending.as_mut().and_then(VecDeque::pop_front) {
            Some(piece) => {
                self.buffer.push_token(piece.clone());
                Ok(Step::Token(piece))
            }
            None => Ok(Step::End),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "You are a security analyst.\n\
        === KNOWLEDGE BASE ===\n\
        [CRITICAL L12] 2024-05-01 10:00:00 | id=a | agent=web-01 | rule=31103 | SQL injection attempt\n\
        [HIGH L7] 2024-05-01 09:00:00 | id=b | agent=db-02 | rule=5710 | sshd: authentication failed\n\
        [LOW L2] 2024-05-01 08:00:00 | id=c | agent=web-01 | rule=530 | disk usage report\n\
        === END OF KNOWLEDGE BASE ===\n";

    async fn answer(backend: &ExtractiveBackend, question: &str) -> (String, Step) {
        let warm = backend.warm(PREFIX).await.unwrap();
        let mut session = backend.restore(&warm.state).unwrap();
        session.truncate(warm.origin_length);
        session
            .feed(&format!("\nQuestion: {}\nAnswer:", question))
            .unwrap();

        let mut out = String::new();
        loop {
            match session.next(1000).await.unwrap() {
                Step::Token(piece) => out.push_str(&piece),
                other => return (out, other),
            }
        }
    }

    #[tokio::test]
    async fn test_warm_restore_round_trip_length() {
        let backend = ExtractiveBackend::new();
        let warm = backend.warm(PREFIX).await.unwrap();
        let session = backend.restore(&warm.state).unwrap();
        assert_eq!(session.len(), warm.origin_length);
        assert_eq!(warm.origin_length, backend.count_tokens(PREFIX));
    }

    #[tokio::test]
    async fn test_answer_quotes_matching_lines() {
        let backend = ExtractiveBackend::new();
        let (text, step) = answer(&backend, "any failed ssh logins?").await;

        assert_eq!(step, Step::End);
        assert!(text.starts_with("Found 1 relevant"));
        assert!(text.contains("id=b"));
        assert!(!text.contains("id=c"));
    }

    #[tokio::test]
    async fn test_answer_falls_back_to_most_severe() {
        let backend = ExtractiveBackend::new().with_max_lines(2);
        let (text, _) = answer(&backend, "kubernetes quota").await;

        assert!(text.starts_with("No cached event matches"));
        assert!(text.contains("id=a"));
        assert!(text.contains("id=b"));
        assert!(!text.contains("id=c"));
    }

    #[tokio::test]
    async fn test_context_window_exhausts() {
        let backend = ExtractiveBackend::new().with_context_window(10);
        let (text, step) = answer(&backend, "anything").await;
        assert!(text.is_empty());
        assert_eq!(step, Step::Exhausted);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let backend = ExtractiveBackend::new();
        assert!(backend.restore(&PrefixState::new(b"not json".to_vec())).is_err());
    }
}
