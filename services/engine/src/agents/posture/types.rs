//! Types for database posture audits
//!
//! Raw facts gathered from a project's catalog, the snapshot derived from
//! them, and the errors the collector can raise.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// One inspected table and its row-level security state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub has_protection: bool,
    /// Number of active policies, when the catalog function reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_count: Option<u32>,
}

impl Table {
    pub fn new(name: impl Into<String>, has_protection: bool) -> Self {
        Self {
            name: name.into(),
            has_protection,
            policy_count: None,
        }
    }

    pub fn with_policy_count(mut self, count: u32) -> Self {
        self.policy_count = Some(count);
        self
    }
}

/// A project account and its MFA enrollment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "hasMFA")]
    pub has_mfa: bool,
}

/// Everything the collector reads for one audit run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFacts {
    pub tables: Vec<Table>,
    pub users: Vec<User>,
    pub auth_enabled: bool,
}

/// Share of tables with row-level security, in tenths of a percent.
///
/// Kept as an integer so the value is exact, hashable and renders the same
/// way everywhere it is shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdoptionRate(u32);

impl AdoptionRate {
    /// `round(protected / total * 100, 1)`; zero when there are no tables.
    pub fn from_counts(protected: usize, total: usize) -> Self {
        if total == 0 {
            return Self(0);
        }
        let protected = protected.min(total) as u64;
        let total = total as u64;
        // tenths = round(protected * 1000 / total), half away from zero
        let tenths = (protected * 1000 * 2 + total) / (total * 2);
        Self(tenths as u32)
    }

    pub fn tenths(self) -> u32 {
        self.0
    }

    pub fn as_percent(self) -> f64 {
        f64::from(self.0) / 10.0
    }
}

impl std::fmt::Display for AdoptionRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}%", self.0 / 10, self.0 % 10)
    }
}

impl Serialize for AdoptionRate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AdoptionRate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for AdoptionRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s.trim().trim_end_matches('%');
        let (whole, fraction) = number.split_once('.').unwrap_or((number, "0"));
        let whole: u32 = whole
            .parse()
            .map_err(|_| format!("invalid adoption rate: {}", s))?;
        let fraction: u32 = match fraction.len() {
            1 => fraction
                .parse()
                .map_err(|_| format!("invalid adoption rate: {}", s))?,
            _ => return Err(format!("adoption rate must have one decimal: {}", s)),
        };
        Ok(Self(whole * 10 + fraction))
    }
}

/// Table counts for a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_tables: u64,
    pub tables_with_protection: u64,
    pub tables_without_protection: u64,
    pub protection_adoption_rate: AdoptionRate,
}

/// Project-wide security checks panel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityChecks {
    pub auth_enabled: bool,
    pub total_users: u64,
    pub users_with_mfa: u64,
    pub protection_adoption_rate: AdoptionRate,
}

/// Risk ranking for a recommendation; declaration order is ascending risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A finding against a single table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recommendation {
    pub table: String,
    pub severity: Severity,
    pub recommendation: String,
    pub details: String,
}

/// Point-in-time result of one audit run.
///
/// Built once by the evaluator and never mutated afterwards; a new run
/// produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureSnapshot {
    tables: Vec<Table>,
    users: Vec<User>,
    summary: Summary,
    security_checks: SecurityChecks,
    recommendations: Vec<Recommendation>,
    fact_digest: String,
}

impl PostureSnapshot {
    pub(crate) fn new(
        tables: Vec<Table>,
        users: Vec<User>,
        summary: Summary,
        security_checks: SecurityChecks,
        recommendations: Vec<Recommendation>,
        fact_digest: String,
    ) -> Self {
        Self {
            tables,
            users,
            summary,
            security_checks,
            recommendations,
            fact_digest,
        }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn security_checks(&self) -> &SecurityChecks {
        &self.security_checks
    }

    pub fn recommendations(&self) -> &[Recommendation] {
        &self.recommendations
    }

    /// Hex SHA-256 of the raw facts this snapshot was evaluated from
    pub fn fact_digest(&self) -> &str {
        &self.fact_digest
    }

    /// Compare against an earlier run of the same project
    pub fn diff(&self, baseline: &PostureSnapshot) -> PostureDiff {
        let key = |r: &Recommendation| (r.table.clone(), r.severity);
        let before: std::collections::HashSet<_> =
            baseline.recommendations.iter().map(key).collect();
        let after: std::collections::HashSet<_> = self.recommendations.iter().map(key).collect();

        PostureDiff {
            introduced: self
                .recommendations
                .iter()
                .filter(|r| !before.contains(&key(*r)))
                .cloned()
                .collect(),
            resolved: baseline
                .recommendations
                .iter()
                .filter(|r| !after.contains(&key(*r)))
                .cloned()
                .collect(),
            previous_rate: baseline.summary.protection_adoption_rate,
            current_rate: self.summary.protection_adoption_rate,
        }
    }
}

/// Findings that changed between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureDiff {
    pub introduced: Vec<Recommendation>,
    pub resolved: Vec<Recommendation>,
    pub previous_rate: AdoptionRate,
    pub current_rate: AdoptionRate,
}

impl PostureDiff {
    pub fn is_unchanged(&self) -> bool {
        self.introduced.is_empty()
            && self.resolved.is_empty()
            && self.previous_rate == self.current_rate
    }
}

/// Connection parameters for one project.
///
/// `Debug` never prints the service role key.
#[derive(Clone)]
pub struct ProjectConnection {
    project_url: Url,
    service_role_key: String,
}

impl ProjectConnection {
    pub fn new(project_url: &str, service_role_key: &str) -> Result<Self, PostureError> {
        let key = service_role_key.trim();
        if key.is_empty() {
            return Err(PostureError::InvalidCredentials(
                "service role key is empty".to_string(),
            ));
        }

        let url = Url::parse(project_url.trim()).map_err(|e| {
            PostureError::InvalidCredentials(format!("project URL is not a valid URL: {}", e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(PostureError::InvalidCredentials(format!(
                "project URL must be http(s) with a host: {}",
                url
            )));
        }

        Ok(Self {
            project_url: url,
            service_role_key: key.to_string(),
        })
    }

    /// Host name used to correlate log lines with a project
    pub fn project_ref(&self) -> &str {
        self.project_url.host_str().unwrap_or("unknown")
    }

    /// Join a path onto the project root, keeping any base path
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.project_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) fn service_role_key(&self) -> &str {
        &self.service_role_key
    }
}

impl std::fmt::Debug for ProjectConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectConnection")
            .field("project_url", &self.project_url.as_str())
            .field("service_role_key", &"<redacted>")
            .finish()
    }
}

/// Errors raised while collecting posture facts
#[derive(Debug, Error)]
pub enum PostureError {
    /// Project URL or key is malformed
    #[error("Invalid project credentials: {0}")]
    InvalidCredentials(String),

    /// Network failure, rejected credentials or an unusable response
    #[error("Catalog unreachable: {0}")]
    Connectivity(String),

    /// Credentials cannot read catalog metadata
    #[error("Catalog access denied: {0}")]
    Permission(String),
}

impl PostureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PostureError::InvalidCredentials(_) => ErrorKind::Input,
            PostureError::Connectivity(_) => ErrorKind::Connectivity,
            PostureError::Permission(_) => ErrorKind::Permission,
        }
    }

    /// Message safe to return to API callers
    pub fn public_message(&self) -> &'static str {
        match self {
            PostureError::InvalidCredentials(_) => {
                "Invalid project URL or service role key"
            }
            PostureError::Connectivity(_) => {
                "Could not reach the project with the supplied credentials"
            }
            PostureError::Permission(_) => {
                "The supplied key cannot read table security metadata; make sure the catalog function is installed"
            }
        }
    }
}

impl From<reqwest::Error> for PostureError {
    fn from(err: reqwest::Error) -> Self {
        PostureError::Connectivity(err.to_string())
    }
}
