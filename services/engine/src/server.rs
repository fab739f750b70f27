//! HTTP surface: audit, remediation and health endpoints

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::agents::posture::{
    AuditRun, PostureAgent, PostureError, ProjectConnection, Recommendation, SecurityChecks,
    Table, User,
};
use crate::agents::remediation::{ConversationTurn, DialogueError, RemediationAgent};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub posture: Arc<PostureAgent>,
    /// `None` when no completion provider is configured
    pub remediation: Option<Arc<RemediationAgent>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth", post(audit_project))
        .route("/api/ai/question", post(ask_question))
        .route("/api/ai/question/stream", post(ask_question_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler error; only sanitized messages reach the caller
#[derive(Debug)]
pub enum ApiError {
    Posture(PostureError),
    Dialogue(DialogueError),
    RemediationDisabled,
}

impl From<PostureError> for ApiError {
    fn from(err: PostureError) -> Self {
        ApiError::Posture(err)
    }
}

impl From<DialogueError> for ApiError {
    fn from(err: DialogueError) -> Self {
        ApiError::Dialogue(err)
    }
}

fn dialogue_error_body(err: &DialogueError) -> serde_json::Value {
    if err.kind().status_code() == StatusCode::INTERNAL_SERVER_ERROR {
        serde_json::json!({
            "error": err.public_message(),
            "retryable": err.is_retryable()
        })
    } else {
        serde_json::json!({ "error": err.public_message() })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Posture(err) => {
                debug!(kind = %err.kind(), error = %err, "Audit request failed");
                (
                    err.kind().status_code(),
                    Json(serde_json::json!({ "message": err.public_message() })),
                )
                    .into_response()
            }
            ApiError::Dialogue(err) => {
                debug!(kind = %err.kind(), error = %err, "Remediation request failed");
                (err.kind().status_code(), Json(dialogue_error_body(&err))).into_response()
            }
            ApiError::RemediationDisabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "Remediation guidance is not configured"
                })),
            )
                .into_response(),
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "posture-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// --- Audit ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditRequest {
    #[serde(default, alias = "url")]
    project_url: Option<String>,
    #[serde(default, alias = "key")]
    service_role_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub user_stats: UserStats,
    pub summary: AuditSummary,
    pub security_checks: SecurityChecks,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub users: Vec<User>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total_tables: u64,
    pub tables_with_protection: u64,
    pub tables_without_protection: u64,
    pub tables: Vec<Table>,
}

impl From<&AuditRun> for AuditResponse {
    fn from(run: &AuditRun) -> Self {
        let snapshot = &run.snapshot;
        let summary = snapshot.summary();
        Self {
            user_stats: UserStats {
                users: snapshot.users().to_vec(),
            },
            summary: AuditSummary {
                total_tables: summary.total_tables,
                tables_with_protection: summary.tables_with_protection,
                tables_without_protection: summary.tables_without_protection,
                tables: snapshot.tables().to_vec(),
            },
            security_checks: snapshot.security_checks().clone(),
            recommendations: snapshot.recommendations().to_vec(),
        }
    }
}

async fn audit_project(
    State(state): State<AppState>,
    payload: Result<Json<AuditRequest>, JsonRejection>,
) -> Result<Json<AuditResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| {
        warn!(error = %e.body_text(), "Rejected malformed audit request");
        PostureError::InvalidCredentials(e.body_text())
    })?;

    let project_url = req.project_url.as_deref().unwrap_or_default();
    let conn = ProjectConnection::new(
        project_url,
        req.service_role_key.as_deref().unwrap_or_default(),
    )
    .map_err(|e| {
        warn!(project = %project_hint(project_url), error = %e, "Rejected audit credentials");
        e
    })?;

    let run = state.posture.audit(&conn).await?;
    Ok(Json(AuditResponse::from(&run)))
}

/// Host of a possibly malformed project URL, for log correlation
fn project_hint(project_url: &str) -> String {
    match reqwest::Url::parse(project_url.trim()) {
        Ok(url) => url.host_str().unwrap_or("unknown").to_string(),
        Err(_) => project_url.trim().chars().take(64).collect(),
    }
}

// --- Remediation ---

#[derive(Debug, Deserialize)]
struct QuestionRequest {
    #[serde(default)]
    issue: Option<String>,
    #[serde(default)]
    history: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
struct QuestionResponse {
    suggestion: String,
}

fn parse_question(
    payload: Result<Json<QuestionRequest>, JsonRejection>,
) -> Result<(String, Vec<ConversationTurn>), DialogueError> {
    let Json(req) = payload.map_err(|e| {
        warn!(error = %e.body_text(), "Rejected malformed remediation request");
        DialogueError::Input(e.body_text())
    })?;
    Ok((req.issue.unwrap_or_default(), req.history))
}

/// Input errors take precedence over a missing provider
fn remediation_agent(state: &AppState, issue: &str) -> Result<Arc<RemediationAgent>, ApiError> {
    match &state.remediation {
        Some(agent) => {
            agent.validate_issue(issue)?;
            Ok(agent.clone())
        }
        None if issue.trim().is_empty() => {
            warn!("Rejected remediation request without an issue");
            Err(DialogueError::Input("issue is empty".to_string()).into())
        }
        None => Err(ApiError::RemediationDisabled),
    }
}

async fn ask_question(
    State(state): State<AppState>,
    payload: Result<Json<QuestionRequest>, JsonRejection>,
) -> Result<Json<QuestionResponse>, ApiError> {
    let (issue, history) = parse_question(payload)?;
    let agent = remediation_agent(&state, &issue)?;

    let result = agent.advise(&issue, &history).await?;
    Ok(Json(QuestionResponse {
        suggestion: result.guide,
    }))
}

/// Server-Sent Events: `delta` events carrying JSON-encoded increments,
/// then one `result` or `error` event.
async fn ask_question_stream(
    State(state): State<AppState>,
    payload: Result<Json<QuestionRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (issue, history) = parse_question(payload)?;
    let agent = remediation_agent(&state, &issue)?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(stream_dialogue(agent, issue, history, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

async fn stream_dialogue(
    agent: Arc<RemediationAgent>,
    issue: String,
    history: Vec<ConversationTurn>,
    events: mpsc::Sender<Result<Event, Infallible>>,
) {
    let cancel = CancellationToken::new();
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);

    // Forward increments until the dialogue ends; a closed event channel
    // means the client disconnected and the call is cancelled.
    let forward = {
        let events = events.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = events.closed() => {
                        cancel.cancel();
                        break;
                    }
                    delta = delta_rx.recv() => {
                        let Some(delta) = delta else { break };
                        let event = match Event::default().event("delta").json_data(&delta) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode delta event");
                                continue;
                            }
                        };
                        if events.send(Ok(event)).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
    };

    let (outcome, _) = tokio::join!(
        agent.advise_streaming(&issue, &history, Some(delta_tx), cancel.clone()),
        forward
    );

    let event = match outcome {
        Ok(result) => Event::default().event("result").json_data(&result),
        Err(err) => Event::default()
            .event("error")
            .json_data(dialogue_error_body(&err)),
    };

    match event {
        Ok(event) => {
            let _ = events.send(Ok(event)).await;
        }
        Err(e) => warn!(error = %e, "Failed to encode final dialogue event"),
    }
}
