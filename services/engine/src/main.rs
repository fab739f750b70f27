//! Lornu AI Posture Engine
//!
//! HTTP service for database posture audits and remediation guidance.
//! Project credentials arrive per request and are never stored.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use posture_engine::agents::posture::{EvaluationCache, PostureAgent, SupabaseCollector};
use posture_engine::agents::remediation::{OpenAiProvider, RemediationAgent};
use posture_engine::config::{init_tracing, EngineConfig};
use posture_engine::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::parse();
    init_tracing(config.log_format);

    info!("Starting Lornu AI Posture Engine");

    let collector = SupabaseCollector::new(config.catalog_timeout())
        .context("Failed to initialize catalog collector")?
        .with_rls_function(&config.rls_status_function)
        .with_users_page_size(config.users_page_size);

    let posture = Arc::new(PostureAgent::with_cache(
        Arc::new(collector),
        EvaluationCache::with_capacity(config.evaluation_cache_size),
    ));

    // Remediation is optional - requires OPENAI_KEY
    let remediation = match config.openai_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            let provider = OpenAiProvider::new(
                key,
                &config.openai_model,
                config.openai_base_url.as_deref(),
            );
            info!(model = %config.openai_model, "Remediation provider initialized");
            Some(Arc::new(
                RemediationAgent::new(Arc::new(provider)).with_config(config.dialogue_config()),
            ))
        }
        None => {
            warn!("Remediation guidance not available (set OPENAI_KEY to enable)");
            None
        }
    };

    let app = router(AppState {
        posture,
        remediation,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Engine listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
