//! Service token acquisition
//!
//! The resilient client authenticates to the upstream identity API with a
//! service token obtained through the client credentials flow. The flow
//! itself sits behind [`AccessTokenSource`] so tests can mint tokens
//! without a network.

use aliri::jwt;
use aliri_clock::DurationSecs;
use async_trait::async_trait;
use peranto::{BoxError, ClientIdRef};
use serde::{Deserialize, Serialize};

use crate::braids::{AccessToken, ClientSecret};

/// A freshly issued service token and its advertised lifetime
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// The bearer token
    pub access_token: AccessToken,
    /// How long the issuer says the token will remain valid
    pub lifetime: DurationSecs,
}

/// An asynchronous source of service tokens
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Requests a fresh token from the issuing authority
    async fn request_token(&self) -> Result<IssuedToken, BoxError>;
}

#[derive(Serialize)]
struct ClientCredentialsPayload<'a> {
    grant_type: &'static str,
    client_id: &'a ClientIdRef,
    client_secret: &'a ClientSecret,
    audience: &'a jwt::AudienceRef,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: AccessToken,
    expires_in: DurationSecs,
}

/// A token source using the OAuth2 client credentials flow
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
#[derive(Debug)]
pub struct ClientCredentialsTokenSource {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: peranto::ClientId,
    client_secret: ClientSecret,
    audience: jwt::Audience,
}

#[cfg(feature = "reqwest")]
impl ClientCredentialsTokenSource {
    /// Constructs a source exchanging the given credentials at `token_url`
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        client_id: peranto::ClientId,
        client_secret: ClientSecret,
        audience: jwt::Audience,
    ) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret,
            audience,
        }
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl AccessTokenSource for ClientCredentialsTokenSource {
    #[tracing::instrument(
        err,
        skip(self),
        fields(
            token_url = %self.token_url,
            credentials.client_id = %self.client_id,
            credentials.audience = %self.audience,
        ),
    )]
    async fn request_token(&self) -> Result<IssuedToken, BoxError> {
        tracing::trace!("requesting service token from authority");

        let payload = ClientCredentialsPayload {
            grant_type: "client_credentials",
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            audience: &self.audience,
        };

        let response = self
            .client
            .post(self.token_url.clone())
            .json(&payload)
            .send()
            .await?;

        tracing::debug!(
            response.status = response.status().as_u16(),
            "received token response from issuing authority"
        );

        response.error_for_status_ref()?;
        let body: TokenResponse = response.json().await?;

        tracing::info!(lifetime = body.expires_in.0, "received new service token");

        Ok(IssuedToken {
            access_token: body.access_token,
            lifetime: body.expires_in,
        })
    }
}
