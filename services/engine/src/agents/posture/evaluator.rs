//! Posture Evaluator
//!
//! Pure functions that turn collected facts into a [`PostureSnapshot`].
//! No I/O; identical facts always produce an identical snapshot.

use sha2::{Digest, Sha256};

use super::types::*;

/// Summarize table protection. The adoption rate is computed here and only
/// here; every other view copies it.
pub fn compute_summary(tables: &[Table]) -> Summary {
    let total = tables.len();
    let protected = tables.iter().filter(|t| t.has_protection).count();
    let unprotected = total.saturating_sub(protected);

    Summary {
        total_tables: total as u64,
        tables_with_protection: protected as u64,
        tables_without_protection: unprotected as u64,
        protection_adoption_rate: AdoptionRate::from_counts(protected, total),
    }
}

pub fn compute_security_checks(
    users: &[User],
    auth_enabled: bool,
    rate: AdoptionRate,
) -> SecurityChecks {
    SecurityChecks {
        auth_enabled,
        total_users: users.len() as u64,
        users_with_mfa: users.iter().filter(|u| u.has_mfa).count() as u64,
        protection_adoption_rate: rate,
    }
}

/// Findings per table, highest severity first, then by table name.
pub fn generate_recommendations(tables: &[Table]) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = tables
        .iter()
        .filter_map(|table| {
            if !table.has_protection {
                Some(Recommendation {
                    table: table.name.clone(),
                    severity: Severity::High,
                    recommendation: format!(
                        "Enable row-level security on table `{}`",
                        table.name
                    ),
                    details: format!(
                        "Row-level security is disabled on `{}`. Any client holding the public API key can read and modify every row. Run `alter table {} enable row level security;` and add policies for the access you intend to allow.",
                        table.name, table.name
                    ),
                })
            } else if table.policy_count == Some(0) {
                Some(Recommendation {
                    table: table.name.clone(),
                    severity: Severity::Medium,
                    recommendation: format!(
                        "Add at least one row-level security policy to `{}`",
                        table.name
                    ),
                    details: format!(
                        "Row-level security is enabled on `{}` but no policies are defined, so every non-privileged query is denied. Add `create policy` statements for the roles that need access.",
                        table.name
                    ),
                })
            } else {
                None
            }
        })
        .collect();

    recommendations.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.table.cmp(&b.table))
    });
    recommendations
}

/// Hex SHA-256 over the canonical JSON encoding of the facts
pub fn fact_digest(facts: &RawFacts) -> String {
    let mut hasher = Sha256::new();
    // Struct field order is fixed, so the encoding is stable for equal facts
    let encoded = serde_json::to_vec(facts).unwrap_or_default();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}

/// Evaluate a full snapshot
pub fn evaluate(facts: &RawFacts) -> PostureSnapshot {
    evaluate_with_digest(facts, fact_digest(facts))
}

pub(crate) fn evaluate_with_digest(facts: &RawFacts, digest: String) -> PostureSnapshot {
    let summary = compute_summary(&facts.tables);
    let security_checks = compute_security_checks(
        &facts.users,
        facts.auth_enabled,
        summary.protection_adoption_rate,
    );
    let recommendations = generate_recommendations(&facts.tables);

    PostureSnapshot::new(
        facts.tables.clone(),
        facts.users.clone(),
        summary,
        security_checks,
        recommendations,
        digest,
    )
}
