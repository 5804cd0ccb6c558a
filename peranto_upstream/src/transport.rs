//! The wire-level seam between the resilient client and the network
//!
//! [`UpstreamTransport`] carries a single request/response exchange and
//! nothing else. Retry, token handling, and error classification all live
//! above it, which keeps the transport trivially fakeable in tests.

use aliri_clock::UnixTime;
use async_trait::async_trait;
use http::{Method, StatusCode};
use peranto::BoxError;

use crate::braids::AccessTokenRef;

/// A single request to the upstream identity API
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    retryable: bool,
}

impl UpstreamRequest {
    /// A GET request for the given API path
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A POST request for the given API path
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    /// A PATCH request for the given API path
    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::PATCH, path);
        req.body = Some(body);
        req
    }

    /// A DELETE request for the given API path
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retryable: true,
        }
    }

    /// Appends a query parameter
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Attaches a JSON body, replacing any existing one
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Marks the request as unsafe to replay
    ///
    /// Transient failures of a non-retryable request surface immediately
    /// instead of being attempted again.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// The HTTP method of the request
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The API path of the request
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query parameters of the request
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The JSON body of the request, if any
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Whether the request may be replayed on transient failure
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// A response from the upstream identity API
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    /// The response status
    pub status: StatusCode,
    /// The decoded JSON body; `null` when the response had none
    pub body: serde_json::Value,
    /// The advertised rate-limit reset instant, when present
    pub rate_limit_reset: Option<UnixTime>,
}

impl UpstreamResponse {
    /// Whether the status indicates success
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the status is worth retrying
    ///
    /// Only rate limiting and server-side failures are transient; every
    /// other status reflects the request itself and will not improve on
    /// replay.
    pub fn is_transient(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS || self.status.is_server_error()
    }
}

/// Carries one exchange with the upstream identity API
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Sends the request, authorized as the given service token
    ///
    /// Implementations report only delivery failures as errors; an HTTP
    /// response of any status is a successful exchange.
    async fn send(
        &self,
        bearer: &AccessTokenRef,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, BoxError>;
}

/// A transport backed by a `reqwest` HTTP client
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

#[cfg(feature = "reqwest")]
impl ReqwestTransport {
    /// Constructs a transport for the API rooted at `base_url`
    pub fn new(base_url: reqwest::Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("peranto/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Constructs a transport reusing an existing client
    pub fn with_client(client: reqwest::Client, base_url: reqwest::Url) -> Self {
        Self { client, base_url }
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(
        &self,
        bearer: &AccessTokenRef,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, BoxError> {
        let url = self.base_url.join(request.path())?;
        let mut builder = self
            .client
            .request(request.method().clone(), url)
            .bearer_auth(bearer.as_str());

        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let rate_limit_reset = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(UnixTime);

        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };

        tracing::debug!(
            request.method = %request.method(),
            request.path = request.path(),
            response.status = status.as_u16(),
            "exchanged request with upstream"
        );

        Ok(UpstreamResponse {
            status,
            body,
            rate_limit_reset,
        })
    }
}
