//! Dialogue lifecycle hooks

use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::provider::ProviderFailure;
use super::types::{DialogueError, DialogueResult};

const EXCERPT_CHARS: usize = 80;

/// Correlation data for one dialogue call
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: Uuid,
    pub issue_excerpt: String,
}

impl CallContext {
    pub fn new(issue: &str) -> Self {
        let trimmed = issue.trim();
        let mut excerpt: String = trimmed.chars().take(EXCERPT_CHARS).collect();
        if trimmed.chars().count() > EXCERPT_CHARS {
            excerpt.push('…');
        }

        Self {
            call_id: Uuid::new_v4(),
            issue_excerpt: excerpt,
        }
    }
}

/// Receives lifecycle events from the dialogue engine. All hooks default to
/// no-ops.
pub trait DialogueObserver: Send + Sync {
    fn validation_failed(&self, _call: &CallContext, _error: &DialogueError) {}

    fn provider_retry(&self, _call: &CallContext, _failure: &ProviderFailure, _backoff: Duration) {}

    fn completed(&self, _call: &CallContext, _result: &DialogueResult, _elapsed: Duration) {}

    fn failed(&self, _call: &CallContext, _error: &DialogueError, _elapsed: Duration) {}
}

/// Emits structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DialogueObserver for TracingObserver {
    fn validation_failed(&self, call: &CallContext, error: &DialogueError) {
        warn!(
            call_id = %call.call_id,
            issue = %call.issue_excerpt,
            error = %error,
            "Rejected remediation request"
        );
    }

    fn provider_retry(&self, call: &CallContext, failure: &ProviderFailure, backoff: Duration) {
        warn!(
            call_id = %call.call_id,
            issue = %call.issue_excerpt,
            error = %failure,
            backoff_ms = backoff.as_millis() as u64,
            "Completion provider unavailable, retrying once"
        );
    }

    fn completed(&self, call: &CallContext, result: &DialogueResult, elapsed: Duration) {
        info!(
            call_id = %call.call_id,
            issue = %call.issue_excerpt,
            guide_chars = result.guide.chars().count(),
            keywords = result.keywords.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Remediation guide generated"
        );
    }

    fn failed(&self, call: &CallContext, error: &DialogueError, elapsed: Duration) {
        warn!(
            call_id = %call.call_id,
            issue = %call.issue_excerpt,
            kind = %error.kind(),
            retryable = error.is_retryable(),
            error = %error,
            elapsed_ms = elapsed.as_millis() as u64,
            "Remediation dialogue failed"
        );
    }
}
