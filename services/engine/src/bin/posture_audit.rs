//! Posture Audit - Standalone Binary
//!
//! Runs one audit against a project and prints the result as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Audit a project
//! posture-audit --project-url https://abc.supabase.co --service-role-key "$KEY"
//!
//! # Compare against a previous run
//! posture-audit --baseline last-run.json > this-run.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use posture_engine::agents::posture::collector::{
    DEFAULT_RLS_STATUS_FUNCTION, DEFAULT_USERS_PAGE_SIZE,
};
use posture_engine::agents::posture::{
    AuditRun, PostureAgent, PostureDiff, PostureSnapshot, ProjectConnection, SupabaseCollector,
};
use posture_engine::config::{init_tracing, LogFormat};

/// Posture Audit - row-level security, auth and MFA audit for one project
#[derive(Parser)]
#[command(name = "posture-audit", version, about)]
struct Args {
    /// Project URL (e.g., "https://abc.supabase.co")
    #[arg(long, env = "SUPABASE_URL")]
    project_url: String,

    /// Service role key
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    service_role_key: String,

    /// Previous output (or bare snapshot) to diff against
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// Catalog function listing row-level security per table
    #[arg(long, env = "RLS_STATUS_FUNCTION", default_value = DEFAULT_RLS_STATUS_FUNCTION)]
    rls_status_function: String,

    #[arg(long, env = "USERS_PAGE_SIZE", default_value_t = DEFAULT_USERS_PAGE_SIZE)]
    users_page_size: u32,

    /// HTTP timeout in seconds
    #[arg(long, env = "CATALOG_TIMEOUT_SECS", default_value_t = 15)]
    timeout_secs: u64,
}

#[derive(serde::Serialize)]
struct AuditReport<'a> {
    #[serde(flatten)]
    run: &'a AuditRun,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<PostureDiff>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Baseline {
    Report { snapshot: PostureSnapshot },
    Snapshot(PostureSnapshot),
}

fn read_baseline(path: &Path) -> Result<PostureSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read baseline {}", path.display()))?;
    let baseline: Baseline = serde_json::from_str(&raw)
        .with_context(|| format!("Baseline {} is not a posture snapshot", path.display()))?;

    Ok(match baseline {
        Baseline::Report { snapshot } | Baseline::Snapshot(snapshot) => snapshot,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the report
    init_tracing(LogFormat::Json);

    let args = Args::parse();

    // Read the baseline first so a bad path fails before any network call
    let baseline = args.baseline.as_deref().map(read_baseline).transpose()?;

    let conn = ProjectConnection::new(&args.project_url, &args.service_role_key)
        .context("Invalid project connection")?;

    let collector = SupabaseCollector::new(Duration::from_secs(args.timeout_secs))
        .context("Failed to initialize catalog collector")?
        .with_rls_function(&args.rls_status_function)
        .with_users_page_size(args.users_page_size);
    let agent = PostureAgent::new(Arc::new(collector));

    let run = agent.audit(&conn).await.context("Posture audit failed")?;
    let diff = baseline.map(|b| run.snapshot.diff(&b));

    if let Some(diff) = &diff {
        info!(
            introduced = diff.introduced.len(),
            resolved = diff.resolved.len(),
            previous_rate = %diff.previous_rate,
            current_rate = %diff.current_rate,
            "Compared against baseline"
        );
    }

    let report = AuditReport { run: &run, diff };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use posture_engine::agents::posture::{evaluator, RawFacts, Table};
    use std::io::Write;

    fn snapshot() -> PostureSnapshot {
        evaluator::evaluate(&RawFacts {
            tables: vec![Table::new("orders", false)],
            users: vec![],
            auth_enabled: true,
        })
    }

    #[test]
    fn test_read_baseline_accepts_report_and_snapshot() {
        let snapshot = snapshot();
        let run = AuditRun {
            project: "abc.supabase.co".to_string(),
            snapshot: Arc::new(snapshot.clone()),
            completed_at: chrono::Utc::now(),
            duration_ms: 3,
        };

        let mut report_file = tempfile::NamedTempFile::new().unwrap();
        let report = AuditReport { run: &run, diff: None };
        write!(report_file, "{}", serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(read_baseline(report_file.path()).unwrap(), snapshot);

        let mut snapshot_file = tempfile::NamedTempFile::new().unwrap();
        write!(snapshot_file, "{}", serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(read_baseline(snapshot_file.path()).unwrap(), snapshot);
    }

    #[test]
    fn test_read_baseline_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"hello\": 1}}").unwrap();
        assert!(read_baseline(file.path()).is_err());
        assert!(read_baseline(Path::new("/nonexistent/baseline.json")).is_err());
    }
}
