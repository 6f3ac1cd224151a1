use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::HeaderValue;
use http::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::PipelineError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Refresh this long before the token's stated expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Bearer token with its expiry.
pub struct AccessToken {
    token: SecretString,
    expires_on: SystemTime,
}

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on,
        }
    }

    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    #[must_use]
    pub fn expires_on(&self) -> SystemTime {
        self.expires_on
    }

    fn needs_refresh(&self, now: SystemTime) -> bool {
        self.expires_on
            .checked_sub(REFRESH_MARGIN)
            .is_none_or(|refresh_at| now >= refresh_at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of access tokens. Acquisition itself lives outside this crate.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Obtain a token valid for `scopes`.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying identity provider.
    async fn get_token(
        &self,
        scopes: &[String],
    ) -> Result<AccessToken, Box<dyn std::error::Error + Send + Sync>>;
}

/// Authorizes requests with `Authorization: Bearer <token>`.
///
/// The token is cached and fetched again once it is within five minutes of
/// expiry. Concurrent callers that find the cache stale wait on a single
/// fetch, and stop waiting when their request is canceled. Plain-HTTP
/// requests are rejected so the token never leaves over an unencrypted channel.
pub struct BearerTokenPolicy {
    credential: Arc<dyn TokenCredential>,
    scopes: Vec<String>,
    cache: ArcSwapOption<AccessToken>,
    refresh: tokio::sync::Mutex<()>,
}

impl BearerTokenPolicy {
    #[must_use]
    pub fn new(credential: Arc<dyn TokenCredential>, scopes: Vec<String>) -> Self {
        Self {
            credential,
            scopes,
            cache: ArcSwapOption::empty(),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    fn cached(&self) -> Option<Arc<AccessToken>> {
        self.cache
            .load_full()
            .filter(|token| !token.needs_refresh(SystemTime::now()))
    }

    async fn token(&self) -> Result<Arc<AccessToken>, PipelineError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let fresh = Arc::new(
            self.credential
                .get_token(&self.scopes)
                .await
                .map_err(PipelineError::Credential)?,
        );
        tracing::debug!(scopes = ?self.scopes, "acquired access token");
        self.cache.store(Some(Arc::clone(&fresh)));
        Ok(fresh)
    }
}

impl fmt::Debug for BearerTokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenPolicy")
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Policy for BearerTokenPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        if request.url().scheme() != "https" {
            return Err(PipelineError::InvalidScheme {
                scheme: request.url().scheme().to_owned(),
                reason: "bearer token authentication requires HTTPS".to_owned(),
            });
        }

        let cancel = request.cancellation_token().clone();
        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PipelineError::Canceled),
            token = self.token() => token?,
        };
        let raw = zeroize::Zeroizing::new(format!("Bearer {}", token.token().expose_secret()));
        let mut value = HeaderValue::from_str(&raw)?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        next.run(request).await
    }
}
