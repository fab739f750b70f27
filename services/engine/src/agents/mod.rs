//! Agent modules for the Posture Engine
//!
//! - `posture`: collects catalog facts and evaluates a project's security posture
//! - `remediation`: streams remediation guides for individual findings

pub mod posture;
pub mod remediation;

pub use posture::PostureAgent;
pub use remediation::RemediationAgent;
