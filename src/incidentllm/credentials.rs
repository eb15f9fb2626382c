//! Bearer-token acquisition for the remote backends.
//!
//! The remote GQL, KQL, and document-SQL backends all authenticate with a
//! bearer token obtained from a shared credential provider. The provider is
//! a lazy process-wide singleton: nothing is instantiated at module load,
//! the first request that needs a token builds it.
//!
//! Tokens are cached per scope until shortly before expiry (~60 min
//! upstream). Long-running operations must call
//! [`TokenCredential::invalidate`] between retries so a fresh token is
//! acquired; a stale token on a 30-minute ingestion is the classic way to
//! fail at row 9000.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::incidentllm::backends::common::get_shared_http_client;
use crate::incidentllm::config::CredentialConfig;
use crate::incidentllm::error::{PlatformError, Result};

/// Provider of bearer tokens, keyed by OAuth scope.
///
/// Lock order across the platform is credential-provider first, then the
/// backend cache, then any per-backend client lock.
#[async_trait]
pub trait TokenCredential: Send + Sync + std::fmt::Debug {
    /// Return a bearer token valid for `scope`, acquiring one if the cached
    /// token is absent or near expiry.
    async fn token(&self, scope: &str) -> Result<String>;

    /// Drop the cached token for `scope` so the next call re-acquires.
    async fn invalidate(&self, scope: &str);
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Client-credentials OAuth flow against a tenant token endpoint.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl std::fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ClientSecretCredential {
    pub fn new(tenant_id: String, client_id: String, client_secret: String) -> Self {
        Self {
            tenant_id,
            client_id,
            client_secret,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn token_endpoint(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        )
    }

    async fn acquire(&self, scope: &str) -> Result<CachedToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
        ];
        let response = get_shared_http_client()
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| PlatformError::auth(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::auth(format!(
                "token acquisition failed ({}): {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::auth(format!("malformed token response: {}", e)))?;

        Ok(CachedToken {
            value: parsed.access_token,
            // Refresh 5 minutes early so in-flight requests never carry a
            // token that expires mid-call.
            expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in - 300),
        })
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn token(&self, scope: &str) -> Result<String> {
        // The fetch holds the cache lock for its duration: the suspension IS
        // the guarded operation, and it keeps concurrent callers from
        // stampeding the token endpoint.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope) {
            if cached.expires_at > Utc::now() {
                return Ok(cached.value.clone());
            }
        }
        let fresh = self.acquire(scope).await?;
        let value = fresh.value.clone();
        cache.insert(scope.to_string(), fresh);
        Ok(value)
    }

    async fn invalidate(&self, scope: &str) {
        self.cache.lock().await.remove(scope);
    }
}

/// Fixed-token credential for tests and offline mode.
pub struct StaticTokenCredential {
    token: String,
}

impl std::fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn token(&self, _scope: &str) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn invalidate(&self, _scope: &str) {}
}

lazy_static! {
    static ref GLOBAL_CREDENTIAL: std::sync::Mutex<Option<Arc<dyn TokenCredential>>> =
        std::sync::Mutex::new(None);
}

/// Return the process-wide credential provider, building it from `config`
/// on first use.
///
/// When the client-credentials variables are absent a
/// [`StaticTokenCredential`] with an empty token is installed; backends that
/// actually need auth will then fail with a clear `auth` error at query
/// time rather than at startup.
pub fn global_credential(config: &CredentialConfig) -> Arc<dyn TokenCredential> {
    let mut slot = GLOBAL_CREDENTIAL
        .lock()
        .expect("credential singleton poisoned");
    if let Some(existing) = slot.as_ref() {
        return existing.clone();
    }
    let built: Arc<dyn TokenCredential> = match (
        config.tenant_id.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
    ) {
        (Some(tenant), Some(client), Some(secret)) => {
            Arc::new(ClientSecretCredential::new(tenant, client, secret))
        }
        _ => {
            log::warn!("credential variables absent; remote backends will fail auth at query time");
            Arc::new(StaticTokenCredential::new(""))
        }
    };
    *slot = Some(built.clone());
    built
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credential_returns_fixed_token() {
        let cred = StaticTokenCredential::new("abc123");
        assert_eq!(cred.token("any-scope").await.unwrap(), "abc123");
        cred.invalidate("any-scope").await;
        assert_eq!(cred.token("any-scope").await.unwrap(), "abc123");
    }
}
