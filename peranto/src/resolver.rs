//! Per-tenant signing-key resolution
//!
//! Inbound tokens name their authority through the issuer claim. The
//! resolver derives the tenant domain from that claim *before* any
//! verification, checks it against the configured tenant allow-list, and
//! only then materializes a per-tenant key source backed by a bounded
//! [`CredentialCache`]. Gating on the allow-list up front keeps a hostile
//! caller from minting arbitrary issuers to exhaust resolver state.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, RwLock},
};

use aliri::{
    jwk::KeyId,
    jwt::{self, CoreHeaders},
    Jwk, Jwks, JwtRef,
};
use aliri_base64::Base64Url;
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    cache::CredentialCache,
    error::{AuthError, BoxError},
    ids::TenantDomain,
};

/// An asynchronous source of published JSON Web Key Sets
///
/// Implementations perform the actual network fetch; the resolver owns
/// caching, rate limiting, and single-flight coordination.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetches the key set published at `jwks_url`
    async fn fetch_key_set(&self, jwks_url: &str) -> Result<Jwks, BoxError>;
}

/// A key-set source backed by a `reqwest` HTTP client
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
#[derive(Clone, Debug)]
pub struct HttpKeySetSource {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl HttpKeySetSource {
    /// Constructs a source with a 10 second request timeout
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(std::time::Duration::from_secs(10))
    }

    /// Constructs a source with a custom request timeout
    pub fn with_timeout(timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("peranto/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch_key_set(&self, jwks_url: &str) -> Result<Jwks, BoxError> {
        tracing::debug!(jwks.url = %jwks_url, "fetching tenant key set");
        let response = self.client.get(jwks_url).send().await?;
        response.error_for_status_ref()?;
        let jwks = response.json::<Jwks>().await?;
        tracing::info!(jwks.url = %jwks_url, keys = jwks.keys().len(), "tenant key set fetched");
        Ok(jwks)
    }
}

/// The outcome of resolving a token's signing key
#[derive(Clone, Debug)]
pub struct ResolvedKey {
    /// The public key material to verify the token's signature with
    pub key: Arc<Jwk>,
    /// The canonical issuer the token must have been issued by
    pub issuer: jwt::Issuer,
    /// The tenant domain the token was resolved under
    pub domain: TenantDomain,
}

#[derive(Debug)]
struct FetchWindow {
    start: UnixTime,
    count: u32,
}

#[derive(Debug)]
struct TenantKeySource<C> {
    issuer: jwt::Issuer,
    jwks_url: String,
    key_ttl: DurationSecs,
    max_fetches_per_minute: u32,
    keys: CredentialCache<KeyId, Jwk, C>,
    fetch_guard: tokio::sync::Mutex<()>,
    fetch_window: Mutex<FetchWindow>,
    clock: C,
}

impl<C: Clock> TenantKeySource<C> {
    fn new(
        domain: &TenantDomain,
        key_ttl: DurationSecs,
        refresh_buffer: DurationSecs,
        max_keys: usize,
        max_fetches_per_minute: u32,
        clock: C,
    ) -> Self
    where
        C: Clone,
    {
        Self {
            issuer: jwt::Issuer::new(format!("https://{}/", domain)),
            jwks_url: format!("https://{}/.well-known/jwks.json", domain),
            key_ttl,
            max_fetches_per_minute,
            keys: CredentialCache::bounded(refresh_buffer, max_keys).with_clock(clock.clone()),
            fetch_guard: tokio::sync::Mutex::new(()),
            fetch_window: Mutex::new(FetchWindow {
                start: UnixTime(0),
                count: 0,
            }),
            clock,
        }
    }

    async fn signing_key(
        &self,
        kid: &KeyId,
        fetcher: &dyn KeySetSource,
    ) -> Result<Arc<Jwk>, AuthError> {
        if !self.keys.needs_refresh(kid) {
            if let Some(key) = self.keys.get(kid) {
                return Ok(key);
            }
        }

        // Single-flight: one fetch per tenant at a time; waiters re-check
        // the cache once the in-flight fetch has landed.
        let _flight = self.fetch_guard.lock().await;

        if !self.keys.needs_refresh(kid) {
            if let Some(key) = self.keys.get(kid) {
                return Ok(key);
            }
        }

        if !self.try_acquire_fetch() {
            if let Some(key) = self.keys.get(kid) {
                tracing::warn!(
                    issuer = %self.issuer,
                    "key-set fetch budget exhausted, serving cached key awaiting refresh"
                );
                return Ok(key);
            }
            return Err(AuthError::KeySetUnavailable(
                "per-tenant key-set fetch budget exhausted".into(),
            ));
        }

        match fetcher.fetch_key_set(&self.jwks_url).await {
            Ok(jwks) => {
                self.absorb(jwks);
                self.keys.get(kid).ok_or(AuthError::UnknownKeyId)
            }
            Err(error) => {
                if let Some(key) = self.keys.get(kid) {
                    tracing::warn!(
                        issuer = %self.issuer,
                        error = (&*error as &dyn std::error::Error),
                        "key-set fetch failed, serving cached key awaiting refresh"
                    );
                    return Ok(key);
                }
                Err(AuthError::KeySetUnavailable(error))
            }
        }
    }

    fn absorb(&self, jwks: Jwks) {
        for key in jwks.keys() {
            match key.key_id() {
                Some(kid) => {
                    // Only public material ever enters the cache.
                    self.keys
                        .set(kid.to_owned(), key.clone().public_only(), self.key_ttl);
                }
                None => {
                    tracing::debug!(issuer = %self.issuer, "ignoring key without a key ID");
                }
            }
        }
    }

    fn try_acquire_fetch(&self) -> bool {
        let now = self.clock.now();
        let mut window = self.fetch_window.lock().expect("fetch window lock poisoned");
        if now.0.saturating_sub(window.start.0) >= 60 {
            window.start = now;
            window.count = 0;
        }
        if window.count >= self.max_fetches_per_minute {
            false
        } else {
            window.count += 1;
            true
        }
    }
}

/// Resolves the signing key for an as-yet-unverified token
///
/// One key source is created per allow-listed tenant domain, on first use,
/// and retained for the life of the resolver. The allow-list bounds the
/// number of sources.
pub struct TenantKeyResolver<C = System> {
    source: Arc<dyn KeySetSource>,
    allowed: HashSet<TenantDomain>,
    tenants: RwLock<HashMap<TenantDomain, Arc<TenantKeySource<C>>>>,
    key_ttl: DurationSecs,
    refresh_buffer: DurationSecs,
    max_keys_per_tenant: usize,
    max_fetches_per_minute: u32,
    clock: C,
}

impl TenantKeyResolver<System> {
    /// Constructs a resolver trusting exactly the given tenant domains
    ///
    /// Defaults: fetched keys are cached for one hour with a five minute
    /// refresh buffer, at most five keys per tenant, and at most ten
    /// key-set fetches per tenant per minute.
    pub fn new(
        source: Arc<dyn KeySetSource>,
        allowed: impl IntoIterator<Item = TenantDomain>,
    ) -> Self {
        Self {
            source,
            allowed: allowed.into_iter().collect(),
            tenants: RwLock::new(HashMap::new()),
            key_ttl: DurationSecs(3600),
            refresh_buffer: DurationSecs(300),
            max_keys_per_tenant: 5,
            max_fetches_per_minute: 10,
            clock: System,
        }
    }
}

impl<C> TenantKeyResolver<C> {
    /// Sets how long a fetched signing key may be served from cache
    pub fn with_key_lifetime(mut self, key_ttl: DurationSecs) -> Self {
        self.key_ttl = key_ttl;
        self
    }

    /// Sets how far ahead of expiry a key becomes refresh-due
    pub fn with_refresh_buffer(mut self, refresh_buffer: DurationSecs) -> Self {
        self.refresh_buffer = refresh_buffer;
        self
    }

    /// Bounds the number of keys cached per tenant
    pub fn with_max_keys_per_tenant(mut self, max_keys: usize) -> Self {
        self.max_keys_per_tenant = max_keys;
        self
    }

    /// Bounds outbound key-set fetches per tenant per minute
    pub fn with_fetch_rate_limit(mut self, max_fetches_per_minute: u32) -> Self {
        self.max_fetches_per_minute = max_fetches_per_minute;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes. Discards any tenant key state already
    /// accumulated, so configure the clock before use.
    pub fn with_clock<D>(self, clock: D) -> TenantKeyResolver<D> {
        TenantKeyResolver {
            source: self.source,
            allowed: self.allowed,
            tenants: RwLock::new(HashMap::new()),
            key_ttl: self.key_ttl,
            refresh_buffer: self.refresh_buffer,
            max_keys_per_tenant: self.max_keys_per_tenant,
            max_fetches_per_minute: self.max_fetches_per_minute,
            clock,
        }
    }
}

impl<C: Clock + Clone> TenantKeyResolver<C> {
    /// Resolves the public signing key for the presented token
    ///
    /// The token is decomposed without verifying its signature to read the
    /// key ID and issuer claim; nothing read here is trusted beyond
    /// selecting key material. Verification happens afterwards, in the
    /// verifier.
    pub async fn resolve_signing_key(&self, token: &JwtRef) -> Result<ResolvedKey, AuthError> {
        let (kid, issuer) = decompose_unverified(token)?;
        let kid = kid.ok_or(AuthError::InvalidToken(
            "token header does not identify a signing key",
        ))?;

        let domain = issuer_domain(&issuer)?;
        if !self.allowed.contains(&domain) {
            tracing::warn!(
                issuer = %issuer,
                domain = %domain,
                "rejecting token issued by an unknown tenant domain"
            );
            return Err(AuthError::UnknownIssuer { domain });
        }

        let tenant = self.tenant(&domain);
        let key = tenant.signing_key(&kid, &*self.source).await?;

        Ok(ResolvedKey {
            key,
            issuer: tenant.issuer.clone(),
            domain,
        })
    }

    fn tenant(&self, domain: &TenantDomain) -> Arc<TenantKeySource<C>> {
        {
            let tenants = self.tenants.read().expect("tenant map lock poisoned");
            if let Some(tenant) = tenants.get(domain) {
                return Arc::clone(tenant);
            }
        }

        let mut tenants = self.tenants.write().expect("tenant map lock poisoned");
        Arc::clone(tenants.entry(domain.clone()).or_insert_with(|| {
            tracing::debug!(domain = %domain, "creating key source for tenant");
            Arc::new(TenantKeySource::new(
                domain,
                self.key_ttl,
                self.refresh_buffer,
                self.max_keys_per_tenant,
                self.max_fetches_per_minute,
                self.clock.clone(),
            ))
        }))
    }
}

impl<C> fmt::Debug for TenantKeyResolver<C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TenantKeyResolver")
            .field("allowed", &self.allowed)
            .field("key_ttl", &self.key_ttl)
            .field("refresh_buffer", &self.refresh_buffer)
            .field("max_keys_per_tenant", &self.max_keys_per_tenant)
            .field("max_fetches_per_minute", &self.max_fetches_per_minute)
            .field("clock", &self.clock)
            .finish()
    }
}

#[derive(Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    iss: Option<jwt::Issuer>,
}

fn decompose_unverified(token: &JwtRef) -> Result<(Option<KeyId>, jwt::Issuer), AuthError> {
    let decomposed = token
        .decompose::<jwt::BasicHeaders>()
        .map_err(|_| AuthError::MalformedToken("token is not a structurally valid JWT"))?;

    let kid = decomposed.kid().map(ToOwned::to_owned);

    let payload = Base64Url::from_encoded(decomposed.untrusted_payload())
        .map_err(|_| AuthError::MalformedToken("token payload is not base64url"))?;
    let claims: UnverifiedClaims = serde_json::from_slice(payload.as_slice())
        .map_err(|_| AuthError::MalformedToken("token payload is not a JSON object"))?;

    let issuer = claims
        .iss
        .ok_or(AuthError::MalformedToken("issuer claim is missing"))?;

    Ok((kid, issuer))
}

fn issuer_domain(issuer: &jwt::IssuerRef) -> Result<TenantDomain, AuthError> {
    let url = url::Url::parse(issuer.as_str())
        .map_err(|_| AuthError::MalformedToken("issuer claim is not a well-formed URL"))?;
    let host = url
        .host_str()
        .ok_or(AuthError::MalformedToken("issuer URL has no host"))?;
    Ok(TenantDomain::from(host))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aliri::{jwa, jwt};
    use aliri_base64::Base64UrlRef;
    use aliri_clock::TestClock;

    use super::*;

    #[derive(Debug)]
    struct FakeKeySetSource {
        jwks: Jwks,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl FakeKeySetSource {
        fn new(jwks: Jwks) -> Self {
            Self {
                jwks,
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                jwks: Jwks::default(),
                fetches: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySetSource for FakeKeySetSource {
        async fn fetch_key_set(&self, _jwks_url: &str) -> Result<Jwks, BoxError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".into())
            } else {
                Ok(self.jwks.clone())
            }
        }
    }

    const TENANT: &str = "tenant.example.com";

    fn test_key(kid: &str) -> Jwk {
        let secret = Base64UrlRef::from_slice(b"super secret signing key").to_owned();
        Jwk::from(jwa::Hmac::new(secret))
            .with_algorithm(jwa::Algorithm::HS256)
            .with_key_id(KeyId::from(kid))
    }

    fn test_jwks(kid: &str) -> Jwks {
        let mut jwks = Jwks::default();
        jwks.add_key(test_key(kid));
        jwks
    }

    fn signed_token(kid: &str, issuer: &str) -> jwt::Jwt {
        let headers = jwt::BasicHeaders::with_key_id(jwa::Algorithm::HS256, KeyId::from(kid));
        let claims = jwt::BasicClaims::new()
            .with_issuer(issuer)
            .with_future_expiration(300);
        jwt::Jwt::try_from_parts_with_signature(&headers, &claims, &test_key(kid)).unwrap()
    }

    fn resolver(source: Arc<dyn KeySetSource>) -> TenantKeyResolver {
        TenantKeyResolver::new(source, [TenantDomain::from_static(TENANT)])
    }

    #[tokio::test]
    async fn resolves_and_caches_the_signing_key() {
        let source = Arc::new(FakeKeySetSource::new(test_jwks("key-1")));
        let resolver = resolver(Arc::clone(&source) as Arc<dyn KeySetSource>);
        let token = signed_token("key-1", "https://tenant.example.com/");

        let first = resolver.resolve_signing_key(&token).await.unwrap();
        let second = resolver.resolve_signing_key(&token).await.unwrap();

        assert_eq!(first.issuer.as_str(), "https://tenant.example.com/");
        assert_eq!(first.domain.as_str(), TENANT);
        assert_eq!(second.domain.as_str(), TENANT);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn rejects_issuers_outside_the_allow_list_without_fetching() {
        let source = Arc::new(FakeKeySetSource::new(test_jwks("key-1")));
        let resolver = resolver(Arc::clone(&source) as Arc<dyn KeySetSource>);
        let token = signed_token("key-1", "https://evil.example.net/");

        let err = resolver.resolve_signing_key(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::UnknownIssuer { .. }));
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn rejects_tokens_with_an_unparseable_issuer() {
        let source = Arc::new(FakeKeySetSource::new(test_jwks("key-1")));
        let resolver = resolver(source);
        let token = signed_token("key-1", "not a url");

        let err = resolver.resolve_signing_key(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::MalformedToken(_)));
    }

    #[tokio::test]
    async fn unknown_key_id_is_rejected_after_a_fetch() {
        let source = Arc::new(FakeKeySetSource::new(test_jwks("other-key")));
        let resolver = resolver(Arc::clone(&source) as Arc<dyn KeySetSource>);
        let token = signed_token("key-1", "https://tenant.example.com/");

        let err = resolver.resolve_signing_key(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::UnknownKeyId));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_without_cached_key_is_unavailable() {
        let source = Arc::new(FakeKeySetSource::failing());
        let resolver = resolver(source);
        let token = signed_token("key-1", "https://tenant.example.com/");

        let err = resolver.resolve_signing_key(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::KeySetUnavailable(_)));
    }

    #[tokio::test]
    async fn rate_limited_refresh_serves_the_cached_key() {
        let clock = TestClock::new(UnixTime(1_000_000));
        let source = Arc::new(FakeKeySetSource::new(test_jwks("key-1")));
        let resolver = TenantKeyResolver::new(
            Arc::clone(&source) as Arc<dyn KeySetSource>,
            [TenantDomain::from_static(TENANT)],
        )
        .with_key_lifetime(DurationSecs(600))
        .with_refresh_buffer(DurationSecs(550))
        .with_fetch_rate_limit(1)
        .with_clock(clock.clone());
        let token = signed_token("key-1", "https://tenant.example.com/");

        resolver.resolve_signing_key(&token).await.unwrap();

        // The key becomes refresh-due 50 seconds in, but the fetch budget
        // for the one-minute window is already spent; the still-valid
        // cached key is served instead of failing the request.
        clock.advance(DurationSecs(55));
        resolver.resolve_signing_key(&token).await.unwrap();

        assert_eq!(source.fetch_count(), 1);
    }
}
