//! Service configuration
//!
//! Every setting is a CLI flag with an environment variable fallback.

use clap::{ArgAction, Parser, ValueEnum};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::agents::posture::collector::{DEFAULT_RLS_STATUS_FUNCTION, DEFAULT_USERS_PAGE_SIZE};
use crate::agents::remediation::{DialogueConfig, DEFAULT_MODEL};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line human-readable output for local runs
    Pretty,
}

/// Posture Engine - database security audits and remediation guidance
#[derive(Parser, Clone)]
#[command(name = "engine", author, version, about, long_about = None)]
pub struct EngineConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// OpenAI API key; remediation endpoints are disabled without it
    #[arg(long, env = "OPENAI_KEY", hide_env_values = true)]
    pub openai_key: Option<String>,

    /// Chat model used for remediation guides
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub openai_model: String,

    /// Alternate OpenAI-compatible API base (e.g. "http://localhost:11434/v1")
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    /// Upper bound on one remediation call, retries included
    #[arg(long, env = "DIALOGUE_TIMEOUT_SECS", default_value_t = 60)]
    pub dialogue_timeout_secs: u64,

    /// Wait before retrying an unavailable provider
    #[arg(long, env = "PROVIDER_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub provider_retry_backoff_ms: u64,

    /// HTTP timeout for catalog and auth admin requests
    #[arg(long, env = "CATALOG_TIMEOUT_SECS", default_value_t = 15)]
    pub catalog_timeout_secs: u64,

    /// Catalog function listing row-level security per table
    #[arg(long, env = "RLS_STATUS_FUNCTION", default_value = DEFAULT_RLS_STATUS_FUNCTION)]
    pub rls_status_function: String,

    /// Users requested per admin API page
    #[arg(long, env = "USERS_PAGE_SIZE", default_value_t = DEFAULT_USERS_PAGE_SIZE)]
    pub users_page_size: u32,

    /// Snapshots memoized by fact digest (0 disables)
    #[arg(long, env = "EVALUATION_CACHE_SIZE", default_value_t = 128)]
    pub evaluation_cache_size: usize,

    /// Drop remediation keywords that do not appear in the issue
    #[arg(long, env = "STRICT_KEYWORDS", default_value_t = true, action = ArgAction::Set)]
    pub strict_keywords: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl EngineConfig {
    pub fn dialogue_config(&self) -> DialogueConfig {
        DialogueConfig {
            timeout: Duration::from_secs(self.dialogue_timeout_secs),
            retry_backoff: Duration::from_millis(self.provider_retry_backoff_ms),
            strict_keywords: self.strict_keywords,
            ..DialogueConfig::default()
        }
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("port", &self.port)
            .field("openai_key", &self.openai_key.as_ref().map(|_| "<redacted>"))
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field("dialogue_timeout_secs", &self.dialogue_timeout_secs)
            .field("provider_retry_backoff_ms", &self.provider_retry_backoff_ms)
            .field("catalog_timeout_secs", &self.catalog_timeout_secs)
            .field("rls_status_function", &self.rls_status_function)
            .field("users_page_size", &self.users_page_size)
            .field("evaluation_cache_size", &self.evaluation_cache_size)
            .field("strict_keywords", &self.strict_keywords)
            .field("log_format", &self.log_format)
            .finish()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}
