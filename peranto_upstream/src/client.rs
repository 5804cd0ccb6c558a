//! The resilient upstream client
//!
//! [`ResilientClient`] wraps a transport with the concerns every call to
//! the upstream identity API shares: a cached service token refreshed
//! ahead of expiry, bounded retries of transient failures, and eviction of
//! credentials the upstream no longer accepts.

use std::{fmt, sync::Arc};

use aliri::jwt;
use aliri_clock::{Clock, DurationSecs, System};
use http::StatusCode;
use peranto::cache::CredentialCache;

use crate::{
    braids::AccessToken,
    error::UpstreamError,
    retry::{JitterSource, RetryPolicy},
    token::AccessTokenSource,
    transport::{UpstreamRequest, UpstreamResponse, UpstreamTransport},
};

#[cfg(feature = "rand")]
fn default_jitter() -> Box<dyn JitterSource + Send + Sync> {
    Box::new(crate::retry::RandomEarlyJitter)
}

#[cfg(not(feature = "rand"))]
fn default_jitter() -> Box<dyn JitterSource + Send + Sync> {
    Box::new(crate::retry::NullJitter)
}

/// A client for the upstream identity API that retries transient failures
/// and manages its own service token
pub struct ResilientClient<C = System> {
    transport: Arc<dyn UpstreamTransport>,
    tokens: Arc<dyn AccessTokenSource>,
    token_cache: CredentialCache<jwt::Audience, AccessToken, C>,
    refresh_guard: tokio::sync::Mutex<()>,
    audience: jwt::Audience,
    policy: RetryPolicy,
    jitter: Box<dyn JitterSource + Send + Sync>,
    clock: C,
}

impl ResilientClient<System> {
    /// Constructs a client for the API identified by `audience`
    ///
    /// Service tokens become refresh-due one minute before they expire.
    /// Retry delays are randomly jittered when the `rand` feature is
    /// enabled, which it is by default.
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        tokens: Arc<dyn AccessTokenSource>,
        audience: jwt::Audience,
    ) -> Self {
        Self {
            transport,
            tokens,
            token_cache: CredentialCache::new(DurationSecs(60)),
            refresh_guard: tokio::sync::Mutex::new(()),
            audience,
            policy: RetryPolicy::default(),
            jitter: default_jitter(),
            clock: System,
        }
    }
}

impl<C> ResilientClient<C> {
    /// Replaces the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the jitter source applied to retry delays
    pub fn with_jitter(mut self, jitter: impl JitterSource + Send + Sync + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes.
    pub fn with_clock<D: Clock>(self, clock: D) -> ResilientClient<D>
    where
        D: Clone,
    {
        ResilientClient {
            transport: self.transport,
            tokens: self.tokens,
            token_cache: CredentialCache::new(DurationSecs(60)).with_clock(clock.clone()),
            refresh_guard: self.refresh_guard,
            audience: self.audience,
            policy: self.policy,
            jitter: self.jitter,
            clock,
        }
    }
}

impl<C: Clock> ResilientClient<C> {
    /// Sends the request, retrying transient failures
    ///
    /// Successful responses are returned as-is. A 401 from the upstream
    /// evicts the cached service token so the next attempt authenticates
    /// freshly. Only 429 and 5xx statuses are retried, and only while the
    /// request is marked retryable and the attempt budget lasts; every
    /// other status is surfaced immediately as a rejection.
    pub async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let bearer = self.service_token().await?;

            let response = self
                .transport
                .send(&bearer, &request)
                .await
                .map_err(UpstreamError::Transport)?;

            if response.is_success() {
                return Ok(response);
            }

            if response.status == StatusCode::UNAUTHORIZED {
                tracing::warn!("upstream rejected the service token, discarding it");
                self.token_cache.remove(&self.audience);
            }

            if !(request.is_retryable() && response.is_transient()) {
                return Err(UpstreamError::Rejected {
                    status: response.status,
                    body: response.body,
                });
            }

            if attempts >= self.policy.max_attempts() {
                tracing::warn!(
                    attempts,
                    response.status = response.status.as_u16(),
                    "upstream retry budget exhausted"
                );
                return Err(UpstreamError::Exhausted {
                    attempts,
                    status: response.status,
                    body: response.body,
                });
            }

            // Jitter shortens only the backoff; a wait stretched out to a
            // rate-limit reset instant is not cut below that instant.
            let backoff = self.jitter.jitter(self.policy.backoff(attempts));
            let delay = self.policy.delay_before_retry(
                backoff,
                response.rate_limit_reset,
                self.clock.now(),
            );
            tracing::debug!(
                attempts,
                response.status = response.status.as_u16(),
                delay_ms = delay.as_millis() as u64,
                "retrying transient upstream failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// The service token to authenticate the next call with
    ///
    /// Refreshes are single-flight: concurrent callers wait on the first
    /// refresh rather than each requesting their own token. If a refresh
    /// fails while the cached token is still valid, the cached token keeps
    /// being served.
    async fn service_token(&self) -> Result<Arc<AccessToken>, UpstreamError> {
        if !self.token_cache.needs_refresh(&self.audience) {
            if let Some(token) = self.token_cache.get(&self.audience) {
                return Ok(token);
            }
        }

        let _flight = self.refresh_guard.lock().await;

        if !self.token_cache.needs_refresh(&self.audience) {
            if let Some(token) = self.token_cache.get(&self.audience) {
                return Ok(token);
            }
        }

        match self.tokens.request_token().await {
            Ok(issued) => {
                self.token_cache
                    .set(self.audience.clone(), issued.access_token, issued.lifetime);
                self.token_cache
                    .get(&self.audience)
                    .ok_or(UpstreamError::Credential(
                        "issued token expired immediately".into(),
                    ))
            }
            Err(error) => {
                if let Some(token) = self.token_cache.get(&self.audience) {
                    tracing::warn!(
                        error = (&*error as &dyn std::error::Error),
                        "service token refresh failed, keeping the current token"
                    );
                    return Ok(token);
                }
                Err(UpstreamError::Credential(error))
            }
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for ResilientClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("audience", &self.audience)
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish()
    }
}
