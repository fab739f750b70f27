//! Lornu AI Posture Engine Library
//!
//! Database security posture audits and streamed remediation guidance.

pub mod agents;
pub mod config;
pub mod error;
pub mod server;

pub use agents::posture::{PostureAgent, PostureSnapshot, SupabaseCollector};
pub use agents::remediation::{OpenAiProvider, RemediationAgent};
pub use error::ErrorKind;
