use http::StatusCode;
use thiserror::Error;

use crate::{
    ids::{ClientId, TenantDomain},
    problem::ProblemKind,
};

/// A boxed error from a pluggable source implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The ways authentication or authorization of an inbound request can fail
///
/// Every variant maps to a stable machine-readable code and an HTTP status
/// through [`ProblemKind`]; the routing layer never needs to inspect
/// messages.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization` header was presented
    #[error("authorization header is missing")]
    MissingToken,

    /// The token was readable but could not be accepted
    #[error("invalid bearer token: {0}")]
    InvalidToken(&'static str),

    /// The token's signature was valid at some point, but it has expired
    #[error("bearer token has expired")]
    TokenExpired,

    /// The token or its issuer claim could not be parsed at all
    #[error("malformed bearer token: {0}")]
    MalformedToken(&'static str),

    /// The caller authenticated, but is not in the client allow-list
    #[error("client '{client_id}' is not allowed to call this service")]
    ClientNotAllowed {
        /// The identifier the caller presented
        client_id: ClientId,
    },

    /// The issuer is well-formed, but its domain is not a configured tenant
    #[error("issuer domain '{domain}' is not a known tenant")]
    UnknownIssuer {
        /// The domain extracted from the issuer claim
        domain: TenantDomain,
    },

    /// No signing key matching the token's key ID is available
    #[error("no signing key matches the presented token")]
    UnknownKeyId,

    /// The tenant's key set could not be retrieved in time to verify
    #[error("tenant key set is currently unavailable")]
    KeySetUnavailable(#[source] BoxError),
}

impl ProblemKind for AuthError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken
            | Self::InvalidToken(_)
            | Self::TokenExpired
            | Self::MalformedToken(_)
            | Self::UnknownIssuer { .. }
            | Self::UnknownKeyId => StatusCode::UNAUTHORIZED,
            Self::ClientNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::KeySetUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::MalformedToken(_) => "malformed_token",
            Self::ClientNotAllowed { .. } => "client_not_allowed",
            Self::UnknownIssuer { .. } => "unknown_issuer",
            Self::UnknownKeyId => "invalid_token",
            Self::KeySetUnavailable(_) => "key_set_unavailable",
        }
    }
}
