//! # Prospector Security
//!
//! Ephemeral token authority: every unit of delegated work gets a
//! short-lived credential scoped to exactly one capability and revoked the
//! moment the work finishes, minimizing blast radius if a token leaks.

pub mod tokens;

pub use tokens::{EphemeralToken, TokenAuthority};
