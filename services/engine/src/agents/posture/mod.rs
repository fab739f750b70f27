//! Database Posture Agent
//!
//! Audits a hosted Postgres project for row-level security coverage,
//! built-in auth and MFA enrollment.
//!
//! ## Components
//!
//! - [`CatalogSource`]: reads raw facts from a project. [`SupabaseCollector`]
//!   talks to PostgREST and the GoTrue admin API.
//! - [`evaluator`]: pure functions from [`RawFacts`] to a [`PostureSnapshot`].
//! - [`EvaluationCache`]: memoizes snapshots by fact digest.
//!
//! ## Example Usage
//!
//! ```ignore
//! use posture_engine::agents::posture::{PostureAgent, ProjectConnection, SupabaseCollector};
//!
//! let collector = SupabaseCollector::new(Duration::from_secs(15))?;
//! let agent = PostureAgent::new(Arc::new(collector));
//!
//! let conn = ProjectConnection::new("https://abc.supabase.co", &service_role_key)?;
//! let run = agent.audit(&conn).await?;
//! println!("{}", run.snapshot.summary().protection_adoption_rate);
//! ```

pub mod cache;
pub mod collector;
pub mod evaluator;
pub mod types;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub use cache::EvaluationCache;
pub use collector::{CatalogSource, SupabaseCollector};
pub use types::*;

/// Result of one audit, with timing metadata kept outside the snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRun {
    /// Project host
    pub project: String,
    pub snapshot: Arc<PostureSnapshot>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Collects facts for a project and evaluates them
pub struct PostureAgent {
    source: Arc<dyn CatalogSource>,
    cache: EvaluationCache,
}

impl PostureAgent {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self::with_cache(source, EvaluationCache::new())
    }

    pub fn with_cache(source: Arc<dyn CatalogSource>, cache: EvaluationCache) -> Self {
        Self { source, cache }
    }

    /// Read the three facts concurrently; the first failure wins
    pub async fn collect_facts(&self, conn: &ProjectConnection) -> Result<RawFacts, PostureError> {
        let (tables, users, auth_enabled) = tokio::try_join!(
            self.source.list_protection_status(conn),
            self.source.list_users(conn),
            self.source.auth_config(conn),
        )?;

        Ok(RawFacts {
            tables,
            users,
            auth_enabled,
        })
    }

    pub async fn audit(&self, conn: &ProjectConnection) -> Result<AuditRun, PostureError> {
        let start = std::time::Instant::now();
        info!(project = %conn.project_ref(), "Starting posture audit");

        let facts = match self.collect_facts(conn).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(
                    project = %conn.project_ref(),
                    kind = %e.kind(),
                    error = %e,
                    "Posture audit failed"
                );
                return Err(e);
            }
        };

        let snapshot = self.cache.evaluate(&facts);
        let duration = start.elapsed();

        info!(
            project = %conn.project_ref(),
            tables = snapshot.summary().total_tables,
            unprotected = snapshot.summary().tables_without_protection,
            users = snapshot.security_checks().total_users,
            findings = snapshot.recommendations().len(),
            rate = %snapshot.summary().protection_adoption_rate,
            duration_ms = duration.as_millis() as u64,
            "Posture audit complete"
        );

        Ok(AuditRun {
            project: conn.project_ref().to_string(),
            snapshot,
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
        })
    }
}
