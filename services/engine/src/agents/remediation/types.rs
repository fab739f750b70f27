//! Types for remediation dialogues

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of caller-held conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Parsed outcome of a completed dialogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueResult {
    /// Markdown guide shown to the user
    pub guide: String,
    /// Terms from the issue, spelling-corrected but never expanded
    pub keywords: Vec<String>,
}

impl DialogueResult {
    /// Placeholder for a completion that produced no text
    pub fn no_response() -> Self {
        Self {
            guide: "No response".to_string(),
            keywords: Vec::new(),
        }
    }
}

/// Why a call was torn down before it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    TimedOut,
    Aborted,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::TimedOut => write!(f, "timed out"),
            CancelReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Errors raised by a remediation dialogue
#[derive(Debug, Clone, Error)]
pub enum DialogueError {
    #[error("Invalid issue: {0}")]
    Input(String),

    /// Provider could not be reached or refused the request
    #[error("Completion provider failed: {message}")]
    Provider { message: String, retryable: bool },

    /// Stream started but ended in an error
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Dialogue call {0}")]
    Cancelled(CancelReason),
}

impl DialogueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DialogueError::Input(_) => ErrorKind::Input,
            DialogueError::Provider { .. } => ErrorKind::Provider,
            DialogueError::Generation(_) => ErrorKind::Generation,
            DialogueError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the same call may succeed if repeated later
    pub fn is_retryable(&self) -> bool {
        match self {
            DialogueError::Provider { retryable, .. } => *retryable,
            DialogueError::Cancelled(CancelReason::TimedOut) => true,
            DialogueError::Input(_)
            | DialogueError::Generation(_)
            | DialogueError::Cancelled(CancelReason::Aborted) => false,
        }
    }

    /// Message safe to return to API callers
    pub fn public_message(&self) -> &'static str {
        match self {
            DialogueError::Input(_) => "Issue is required",
            DialogueError::Provider {
                retryable: true, ..
            } => "The guidance provider is temporarily unavailable, please try again",
            DialogueError::Provider {
                retryable: false, ..
            } => "The guidance provider rejected the request",
            DialogueError::Generation(_) => "Guidance generation failed before completing",
            DialogueError::Cancelled(CancelReason::TimedOut) => "Guidance request timed out",
            DialogueError::Cancelled(CancelReason::Aborted) => "Guidance request was cancelled",
        }
    }
}

/// Lifecycle of a single dialogue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Idle,
    Validated,
    Streaming,
    Completed,
    Failed,
}

/// Attempted a transition the lifecycle does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid dialogue transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: DialogueState,
    pub to: DialogueState,
}

impl DialogueState {
    pub fn can_transition_to(self, next: DialogueState) -> bool {
        use DialogueState::*;
        matches!(
            (self, next),
            (Idle, Validated)
                | (Idle, Failed)
                | (Validated, Streaming)
                | (Validated, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }

    pub fn transition(&mut self, next: DialogueState) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DialogueState::Completed | DialogueState::Failed)
    }
}
