//! Ephemeral token issuance, validation, and revocation.
//!
//! Tokens live in an in-memory table behind a tokio mutex. A background
//! sweep removes expired and revoked entries on a fixed interval so the
//! table stays bounded; the sweep only deletes entries that are already
//! logically dead, so it can never race a legitimate `validate`.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use chrono::{DateTime, Duration, Utc};
use prospector_core::config::TokenConfig;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A short-lived scoped credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralToken {
    /// The opaque token string (`ptk_…`).
    pub token: String,
    pub tenant_id: String,
    /// Owning workflow or capability id.
    pub workflow_id: String,
    /// Granted scopes; `*` matches anything.
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    /// Hard-clamped to the configured ceiling regardless of requested TTL.
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl EphemeralToken {
    /// Whether this token is currently valid.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Issues, validates, and revokes ephemeral tokens.
pub struct TokenAuthority {
    tokens: Mutex<HashMap<String, EphemeralToken>>,
    max_ttl: Duration,
}

impl TokenAuthority {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            max_ttl: Duration::seconds(config.max_ttl_secs as i64),
        }
    }

    /// Issue a token. The requested TTL is clamped to the configured
    /// ceiling — `expires_at - issued_at` never exceeds it.
    pub async fn create(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        expires_in_secs: u64,
        scopes: Vec<String>,
    ) -> EphemeralToken {
        let now = Utc::now();
        let requested = Duration::seconds(expires_in_secs as i64);
        let ttl = if requested > self.max_ttl {
            self.max_ttl
        } else {
            requested
        };

        let token = EphemeralToken {
            token: generate_token(),
            tenant_id: tenant_id.to_string(),
            workflow_id: workflow_id.to_string(),
            scopes,
            issued_at: now,
            expires_at: now + ttl,
            revoked: false,
        };

        let mut tokens = self.tokens.lock().await;
        tokens.insert(token.token.clone(), token.clone());
        tracing::debug!(
            "🔑 Token issued for {} (workflow {}, ttl {}s)",
            tenant_id,
            workflow_id,
            ttl.num_seconds()
        );
        token
    }

    /// Look up a token. Returns `None` if unknown, expired, or revoked.
    pub async fn validate(&self, token: &str) -> Option<EphemeralToken> {
        let tokens = self.tokens.lock().await;
        tokens
            .get(token)
            .filter(|t| t.is_active(Utc::now()))
            .cloned()
    }

    /// Revoke a token. Returns true if the token existed and was live.
    pub async fn revoke(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().await;
        match tokens.get_mut(token) {
            Some(t) if !t.revoked => {
                t.revoked = true;
                tracing::debug!("🔒 Token revoked (workflow {})", t.workflow_id);
                true
            }
            _ => false,
        }
    }

    /// Check whether a live token grants the required scope.
    pub async fn has_scope(&self, token: &str, required: &str) -> bool {
        match self.validate(token).await {
            Some(t) => t.scopes.iter().any(|s| s == "*" || s == required),
            None => false,
        }
    }

    /// Remove expired and revoked entries. Returns how many were purged.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.is_active(now));
        let purged = before - tokens.len();
        if purged > 0 {
            tracing::debug!("🧹 Token sweep purged {} entries", purged);
        }
        purged
    }

    /// Number of live entries in the table.
    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run the sweep on a fixed interval as a background tokio task.
    pub fn spawn_sweeper(authority: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                authority.sweep().await;
            }
        })
    }
}

/// Generate an unguessable token string: `ptk_` + base64url(sha256(random)).
fn generate_token() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);

    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hasher.finalize();

    format!("ptk_{}", BASE64URL.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(&TokenConfig {
            max_ttl_secs: 3600,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
        })
    }

    #[tokio::test]
    async fn test_ttl_never_exceeds_ceiling() {
        let auth = authority();
        // Ask for a week; ceiling is one hour
        let token = auth
            .create("t1", "wf-1", 7 * 24 * 3600, vec!["discover".into()])
            .await;
        let lifetime = token.expires_at - token.issued_at;
        assert!(lifetime <= Duration::seconds(3600));

        // A modest request is honored as-is
        let short = auth.create("t1", "wf-1", 120, vec![]).await;
        let lifetime = short.expires_at - short.issued_at;
        assert!(lifetime <= Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_validate_and_revoke() {
        let auth = authority();
        let token = auth.create("t1", "wf-1", 300, vec!["discover".into()]).await;

        assert!(auth.validate(&token.token).await.is_some());
        assert!(auth.revoke(&token.token).await);
        assert!(auth.validate(&token.token).await.is_none());
        // Second revoke is a no-op
        assert!(!auth.revoke(&token.token).await);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let auth = authority();
        assert!(auth.validate("ptk_nonsense").await.is_none());
        assert!(!auth.revoke("ptk_nonsense").await);
    }

    #[tokio::test]
    async fn test_scopes() {
        let auth = authority();
        let scoped = auth
            .create("t1", "wf-1", 300, vec!["discover-businesses".into()])
            .await;
        let wildcard = auth.create("t1", "wf-1", 300, vec!["*".into()]).await;

        assert!(auth.has_scope(&scoped.token, "discover-businesses").await);
        assert!(!auth.has_scope(&scoped.token, "send-email").await);
        assert!(auth.has_scope(&wildcard.token, "send-email").await);
    }

    #[tokio::test]
    async fn test_sweep_purges_revoked() {
        let auth = authority();
        let a = auth.create("t1", "wf-1", 300, vec![]).await;
        let _b = auth.create("t1", "wf-1", 300, vec![]).await;
        auth.revoke(&a.token).await;

        let purged = auth.sweep().await;
        assert_eq!(purged, 1);
        assert_eq!(auth.len().await, 1);
    }

    #[test]
    fn test_token_format() {
        let t = generate_token();
        assert!(t.starts_with("ptk_"));
        assert!(t.len() > 20);
        assert_ne!(generate_token(), generate_token());
    }
}
