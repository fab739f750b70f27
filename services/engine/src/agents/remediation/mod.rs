//! Remediation Dialogue Agent
//!
//! Turns one posture finding plus caller-held conversation history into a
//! streamed markdown guide and the keywords it was built from.
//!
//! The agent owns no conversation state. History is borrowed for the
//! duration of a call and every call is independent: no coalescing, and
//! cancelling one call never touches another.
//!
//! ## Example Usage
//!
//! ```ignore
//! use posture_engine::agents::remediation::{OpenAiProvider, RemediationAgent};
//!
//! let provider = OpenAiProvider::new(&openai_key, "gpt-4o", None);
//! let agent = RemediationAgent::new(Arc::new(provider));
//!
//! let result = agent.advise("RLS is disabled on table `orders`", &history).await?;
//! println!("{}", result.guide);
//! ```

pub mod observer;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod types;

use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use observer::{CallContext, DialogueObserver, TracingObserver};
pub use provider::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionStream, OpenAiProvider,
    ProviderFailure, DEFAULT_MODEL,
};
pub use types::*;

/// Per-agent dialogue settings
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    /// Upper bound on a whole call, retries included
    pub timeout: Duration,
    /// Wait before the single retry of an unavailable provider
    pub retry_backoff: Duration,
    pub temperature: f32,
    pub top_p: f32,
    /// Drop keywords that do not trace back to the issue text
    pub strict_keywords: bool,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            temperature: 0.7,
            top_p: 1.0,
            strict_keywords: true,
        }
    }
}

/// Per-call bookkeeping
struct DialogueCall {
    ctx: CallContext,
    state: DialogueState,
    started: Instant,
}

impl DialogueCall {
    fn new(issue: &str) -> Self {
        Self {
            ctx: CallContext::new(issue),
            state: DialogueState::Idle,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: DialogueState) {
        if let Err(e) = self.state.transition(next) {
            warn!(call_id = %self.ctx.call_id, error = %e, "Dialogue state violation");
        }
    }
}

/// Generates remediation guides through an injected completion provider
pub struct RemediationAgent {
    provider: Arc<dyn CompletionProvider>,
    observer: Arc<dyn DialogueObserver>,
    config: DialogueConfig,
}

impl RemediationAgent {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            observer: Arc::new(TracingObserver),
            config: DialogueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DialogueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DialogueObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Reject an empty issue before any provider work. Rejections reach
    /// the observer like those raised inside a call.
    pub fn validate_issue<'i>(&self, issue: &'i str) -> Result<&'i str, DialogueError> {
        self.validate(&mut DialogueCall::new(issue), issue)
    }

    fn validate<'i>(
        &self,
        call: &mut DialogueCall,
        issue: &'i str,
    ) -> Result<&'i str, DialogueError> {
        let issue = issue.trim();
        if issue.is_empty() {
            let err = DialogueError::Input("issue is empty".to_string());
            call.enter(DialogueState::Failed);
            self.observer.validation_failed(&call.ctx, &err);
            return Err(err);
        }
        call.enter(DialogueState::Validated);
        Ok(issue)
    }

    /// Generate a guide without forwarding increments
    pub async fn advise(
        &self,
        issue: &str,
        history: &[ConversationTurn],
    ) -> Result<DialogueResult, DialogueError> {
        self.advise_streaming(issue, history, None, CancellationToken::new())
            .await
    }

    /// Generate a guide, forwarding each increment to `increments` in
    /// arrival order. The call ends with `Cancelled` when the configured
    /// timeout elapses, `cancel` fires, or the increment receiver is dropped.
    pub async fn advise_streaming(
        &self,
        issue: &str,
        history: &[ConversationTurn],
        increments: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> Result<DialogueResult, DialogueError> {
        let mut call = DialogueCall::new(issue);
        let issue = self.validate(&mut call, issue)?;

        debug!(
            call_id = %call.ctx.call_id,
            provider = self.provider.name(),
            history = history.len(),
            "Starting remediation dialogue"
        );

        // Dropping the losing branch drops the in-flight provider stream
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DialogueError::Cancelled(CancelReason::Aborted)),
            result = tokio::time::timeout(
                self.config.timeout,
                self.run(&mut call, issue, history, increments.as_ref()),
            ) => result.unwrap_or(Err(DialogueError::Cancelled(CancelReason::TimedOut))),
        };

        let elapsed = call.started.elapsed();
        match &outcome {
            Ok(result) => {
                call.enter(DialogueState::Completed);
                self.observer.completed(&call.ctx, result, elapsed);
            }
            Err(err) => {
                call.enter(DialogueState::Failed);
                self.observer.failed(&call.ctx, err, elapsed);
            }
        }

        outcome
    }

    async fn run(
        &self,
        call: &mut DialogueCall,
        issue: &str,
        history: &[ConversationTurn],
        increments: Option<&mpsc::Sender<String>>,
    ) -> Result<DialogueResult, DialogueError> {
        let request =
            prompt::compose(issue, history, self.config.temperature, self.config.top_p);

        let mut stream = self.open_with_retry(&call.ctx, &request).await?;
        call.enter(DialogueState::Streaming);

        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let chunk = item.map_err(|failure| DialogueError::Generation(failure.to_string()))?;
            let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) else {
                continue;
            };

            if let Some(tx) = increments {
                if tx.send(delta.clone()).await.is_err() {
                    return Err(DialogueError::Cancelled(CancelReason::Aborted));
                }
            }
            text.push_str(&delta);
        }

        let mut result = parser::parse_completion(&text);
        if self.config.strict_keywords {
            result.keywords = parser::retain_traceable(result.keywords, issue);
        }
        Ok(result)
    }

    /// Open the provider stream, retrying once if the provider is unavailable
    async fn open_with_retry(
        &self,
        ctx: &CallContext,
        request: &CompletionRequest<'_>,
    ) -> Result<CompletionStream, DialogueError> {
        match self.provider.open_stream(request).await {
            Ok(stream) => Ok(stream),
            Err(failure @ ProviderFailure::Unavailable(_)) => {
                self.observer
                    .provider_retry(ctx, &failure, self.config.retry_backoff);
                tokio::time::sleep(self.config.retry_backoff).await;
                self.provider
                    .open_stream(request)
                    .await
                    .map_err(open_failure)
            }
            Err(failure) => Err(open_failure(failure)),
        }
    }
}

fn open_failure(failure: ProviderFailure) -> DialogueError {
    match failure {
        ProviderFailure::Unavailable(message) => DialogueError::Provider {
            message,
            retryable: true,
        },
        ProviderFailure::Rejected(message) => DialogueError::Provider {
            message,
            retryable: false,
        },
        ProviderFailure::Interrupted(message) => DialogueError::Generation(message),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the scripted provider does on one `open_stream` call
    #[derive(Clone)]
    pub enum Step {
        Fail(ProviderFailure),
        Chunks(Vec<Result<CompletionChunk, ProviderFailure>>),
        /// Open a stream that never yields
        Hang,
    }

    pub fn text_chunks(parts: &[&str]) -> Step {
        Step::Chunks(parts.iter().map(|p| Ok(CompletionChunk::text(*p))).collect())
    }

    /// Provider replaying a fixed script, one step per call
    pub struct ScriptedProvider {
        script: Mutex<VecDeque<Step>>,
        pub calls: AtomicUsize,
        pub last_messages: Mutex<Vec<ConversationTurn>>,
    }

    impl ScriptedProvider {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn step_stream(step: Step) -> Result<CompletionStream, ProviderFailure> {
        match step {
            Step::Fail(failure) => Err(failure),
            Step::Chunks(items) => Ok(Box::pin(stream::iter(items))),
            Step::Hang => Ok(Box::pin(stream::pending())),
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn open_stream(
            &self,
            request: &CompletionRequest<'_>,
        ) -> Result<CompletionStream, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() =
                request.messages.iter().map(|m| m.as_ref().clone()).collect();

            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Chunks(vec![]));
            step_stream(step)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent(provider: Arc<ScriptedProvider>) -> RemediationAgent {
        RemediationAgent::new(provider).with_config(DialogueConfig {
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
            ..DialogueConfig::default()
        })
    }

    #[derive(Default)]
    struct CountingObserver {
        validation: AtomicUsize,
        retries: AtomicUsize,
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl DialogueObserver for CountingObserver {
        fn validation_failed(&self, _call: &CallContext, _error: &DialogueError) {
            self.validation.fetch_add(1, Ordering::SeqCst);
        }

        fn provider_retry(&self, _call: &CallContext, _failure: &ProviderFailure, _backoff: Duration) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn completed(&self, _call: &CallContext, _result: &DialogueResult, _elapsed: Duration) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn failed(&self, _call: &CallContext, _error: &DialogueError, _elapsed: Duration) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_empty_issue_never_calls_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let observer = Arc::new(CountingObserver::default());
        let agent = agent(provider.clone()).with_observer(observer.clone());

        let err = agent.advise("   \n", &[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::Input(_)));
        assert_eq!(provider.calls(), 0);
        assert_eq!(observer.validation.load(Ordering::SeqCst), 1);
        assert_eq!(observer.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_validate_issue_reports_rejections() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let observer = Arc::new(CountingObserver::default());
        let agent = agent(provider.clone()).with_observer(observer.clone());

        assert_eq!(agent.validate_issue("  rls off \n").unwrap(), "rls off");
        assert_eq!(observer.validation.load(Ordering::SeqCst), 0);

        let err = agent.validate_issue("\t").unwrap_err();
        assert!(matches!(err, DialogueError::Input(_)));
        assert_eq!(observer.validation.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_streams_and_parses_guide() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_chunks(&[
            "Guide: Enable ",
            "row level security on `orders`.\n",
            "Keyword: orders, row level security, encryption",
        ])]));
        let history = vec![
            ConversationTurn::user("What is RLS?"),
            ConversationTurn::assistant("Guide: Row level security ..."),
        ];
        let (tx, mut rx) = mpsc::channel(16);

        let result = agent(provider.clone())
            .advise_streaming(
                "Table orders has no row level security",
                &history,
                Some(tx),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.guide, "Enable row level security on `orders`.");
        assert_eq!(result.keywords, vec!["orders", "row level security"]);

        let mut received = Vec::new();
        while let Some(delta) = rx.recv().await {
            received.push(delta);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0], "Guide: Enable ");

        let messages = provider.last_messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], history[0]);
        assert_eq!(messages[3], ConversationTurn::user("Table orders has no row level security"));
    }

    #[tokio::test]
    async fn test_lenient_keywords_when_not_strict() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_chunks(&[
            "Guide: x\nKeyword: orders, encryption",
        ])]));
        let agent = agent(provider).with_config(DialogueConfig {
            strict_keywords: false,
            ..DialogueConfig::default()
        });

        let result = agent.advise("orders table", &[]).await.unwrap();
        assert_eq!(result.keywords, vec!["orders", "encryption"]);
    }

    #[tokio::test]
    async fn test_zero_choices_is_no_response() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Chunks(vec![
            Ok(CompletionChunk::empty()),
            Ok(CompletionChunk::empty()),
        ])]));

        let result = agent(provider).advise("rls off", &[]).await.unwrap();
        assert_eq!(result, DialogueResult::no_response());
    }

    #[tokio::test]
    async fn test_unavailable_provider_retried_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Fail(ProviderFailure::Unavailable("connection refused".to_string())),
            text_chunks(&["Guide: ok\nKeyword: rls"]),
        ]));
        let observer = Arc::new(CountingObserver::default());

        let result = agent(provider.clone())
            .with_observer(observer.clone())
            .advise("rls off", &[])
            .await
            .unwrap();

        assert_eq!(result.guide, "ok");
        assert_eq!(provider.calls(), 2);
        assert_eq!(observer.retries.load(Ordering::SeqCst), 1);
        assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_twice_is_retryable_provider_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Fail(ProviderFailure::Unavailable("timeout".to_string())),
            Step::Fail(ProviderFailure::Unavailable("timeout".to_string())),
            text_chunks(&["never reached"]),
        ]));

        let err = agent(provider.clone()).advise("rls off", &[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::Provider { retryable: true, .. }));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_provider_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Fail(
            ProviderFailure::Rejected("401 invalid api key".to_string()),
        )]));

        let err = agent(provider.clone()).advise("rls off", &[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::Provider { retryable: false, .. }));
        assert!(!err.is_retryable());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_error_discards_partial_guide() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Chunks(vec![
            Ok(CompletionChunk::text("Guide: Enable row")),
            Err(ProviderFailure::Interrupted("connection reset".to_string())),
        ])]));
        let observer = Arc::new(CountingObserver::default());

        let err = agent(provider)
            .with_observer(observer.clone())
            .advise("rls off", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::Generation(_)));
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_yields_cancelled() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Hang]));
        let agent = agent(provider).with_config(DialogueConfig {
            timeout: Duration::from_millis(50),
            ..DialogueConfig::default()
        });

        let err = agent.advise("rls off", &[]).await.unwrap_err();
        assert!(matches!(err, DialogueError::Cancelled(CancelReason::TimedOut)));
    }

    #[tokio::test]
    async fn test_cancel_token_aborts_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Hang]));
        let agent = agent(provider);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = agent
            .advise_streaming("rls off", &[], None, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::Cancelled(CancelReason::Aborted)));
    }

    #[tokio::test]
    async fn test_dropped_receiver_aborts_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_chunks(&["Guide: a", "b"])]));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = agent(provider)
            .advise_streaming("rls off", &[], Some(tx), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::Cancelled(CancelReason::Aborted)));
    }

    /// Hangs for issues mentioning "slow", answers otherwise
    struct KeyedProvider;

    #[async_trait::async_trait]
    impl CompletionProvider for KeyedProvider {
        fn name(&self) -> &str {
            "keyed"
        }

        async fn open_stream(
            &self,
            request: &CompletionRequest<'_>,
        ) -> Result<CompletionStream, ProviderFailure> {
            let issue = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if issue.contains("slow") {
                step_stream(Step::Hang)
            } else {
                step_stream(text_chunks(&["Guide: fast answer\nKeyword: fast"]))
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_independent() {
        let agent = RemediationAgent::new(Arc::new(KeyedProvider)).with_config(DialogueConfig {
            timeout: Duration::from_millis(100),
            ..DialogueConfig::default()
        });

        let (slow, fast) = tokio::join!(
            agent.advise("slow issue", &[]),
            agent.advise("fast issue", &[])
        );

        assert!(matches!(slow, Err(DialogueError::Cancelled(CancelReason::TimedOut))));
        let fast = fast.unwrap();
        assert_eq!(fast.guide, "fast answer");
        assert_eq!(fast.keywords, vec!["fast"]);
    }
}
