//! Generation backend boundary
//!
//! A backend does two things: process a prefix document once into a reusable
//! [`PrefixState`], and resume from such a state to generate a continuation.
//! Every resume yields a private [`GenerationSession`]; the state blob itself is
//! never written to after warming.

pub mod extractive;
pub mod openai;

pub use extractive::ExtractiveBackend;
pub use openai::{OpenAiCompatBackend, OpenAiCompatConfig};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::cache::types::sha256_hex;
use crate::error::Result;

/// Serialized processed state of a prefix document
///
/// Cloning shares the same immutable bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PrefixState(Arc<[u8]>);

impl PrefixState {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 hex digest of the blob
    pub fn digest(&self) -> String {
        sha256_hex(&self.0)
    }
}

impl fmt::Debug for PrefixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrefixState({} bytes)", self.0.len())
    }
}

/// Result of warming a prefix
#[derive(Debug, Clone)]
pub struct WarmState {
    pub state: PrefixState,
    /// Session length right after the prefix, in the backend's units
    pub origin_length: usize,
}

/// One generation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A decoded piece of output text
    Token(String),
    /// End of sequence
    End,
    /// The backend cannot continue (context window or server-side limit)
    Exhausted,
}

/// Something that can turn a prefix into a resumable state
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Stable backend name; part of every cache fingerprint
    fn name(&self) -> &str;

    /// Token count used for context budgeting
    fn count_tokens(&self, text: &str) -> usize;

    /// Process the prefix once and serialize the resulting state
    async fn warm(&self, prefix: &str) -> Result<WarmState>;

    /// Decode a private working session from a stored state
    fn restore(&self, state: &PrefixState) -> Result<Box<dyn GenerationSession>>;
}

/// A private, mutable copy of a warmed prefix
#[async_trait]
pub trait GenerationSession: Send {
    /// Current length in the backend's units
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything past `len`
    fn truncate(&mut self, len: usize);

    /// Append prompt text after the current position
    fn feed(&mut self, text: &str) -> Result<()>;

    /// Produce the next step; `remaining` is the caller's token allowance
    async fn next(&mut self, remaining: usize) -> Result<Step>;
}

/// Split text into whitespace-delimited pieces
///
/// Each piece is a run of non-whitespace followed by its trailing whitespace,
/// so concatenating the pieces gives back the input.
pub fn split_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_space = false;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else if in_space {
            pieces.push(&text[start..i]);
            start = i;
            in_space = false;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Piece buffer shared by the built-in sessions
#[derive(Debug, Clone, Default)]
pub(crate) struct TokenBuffer {
    tokens: Vec<String>,
    /// Length of the restored prefix; text past it is the prompt
    boundary: usize,
}

impl TokenBuffer {
    pub(crate) fn from_tokens(tokens: Vec<String>) -> Self {
        let boundary = tokens.len();
        Self { tokens, boundary }
    }

    pub(crate) fn from_text(text: &str) -> Self {
        Self::from_tokens(split_pieces(text).into_iter().map(str::to_string).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
        self.boundary = self.boundary.min(len);
    }

    pub(crate) fn push_text(&mut self, text: &str) {
        self.tokens
            .extend(split_pieces(text).into_iter().map(str::to_string));
    }

    pub(crate) fn push_token(&mut self, token: String) {
        self.tokens.push(token);
    }

    /// Text of the restored prefix
    pub(crate) fn prefix_text(&self) -> String {
        self.tokens[..self.boundary].concat()
    }

    /// Text appended after the restored prefix
    pub(crate) fn prompt_text(&self) -> String {
        self.tokens[self.boundary..].concat()
    }
}
