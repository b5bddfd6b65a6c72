//! The user's request for one turn.

use serde::{Deserialize, Serialize};

/// Longest request text accepted, in characters.
pub const MAX_REQUEST_CHARS: usize = 1000;

/// A natural-language request plus the context captured when it was made.
///
/// Immutable once built; retries within a turn reuse the same request and
/// carry new feedback separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    text: String,
    prior_feedback: Option<String>,
    context: Option<String>,
}

impl CommandRequest {
    /// Trims `text` and limits it to [`MAX_REQUEST_CHARS`] characters.
    pub fn new(text: &str) -> Self {
        Self {
            text: sanitize(text),
            prior_feedback: None,
            context: None,
        }
    }

    /// Feedback carried over from an earlier turn (`--nope`).
    pub fn with_prior_feedback(mut self, feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        let feedback = feedback.trim();
        self.prior_feedback = (!feedback.is_empty()).then(|| feedback.to_string());
        self
    }

    /// Conversation-history snapshot handed to the generator.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.trim().is_empty()).then_some(context);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn prior_feedback(&self) -> Option<&str> {
        self.prior_feedback.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

fn sanitize(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_REQUEST_CHARS) {
        Some((cut, _)) => trimmed[..cut].to_string(),
        None => trimmed.to_string(),
    }
}
