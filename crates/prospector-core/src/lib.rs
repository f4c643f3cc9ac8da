//! # Prospector Core
//!
//! Shared foundation for the Prospector pipeline orchestrator:
//! - Error type and `Result` alias used across all crates
//! - Configuration (TOML, serde-defaulted, `~/.prospector/config.toml`)
//! - The capability boundary — the one seam through which all real work
//!   (discovery, enrichment, audits, email send) is invoked
//! - Audit hook — structured state-transition records for external sinks
//! - Credential redaction for error text

pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod redact;

pub use audit::{AuditRecord, AuditSink, MemorySink, TracingSink};
pub use capability::{CapabilityInvoker, CapabilityOutcome, FnInvoker, InvokeOptions};
pub use config::OrchestratorConfig;
pub use error::{ProspectorError, Result};
pub use redact::redact_credentials;
