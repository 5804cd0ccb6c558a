//! Claims carried by access tokens presented to the proxy

use aliri::jwt::{self, Audiences, CoreClaims, IssuerRef, SubjectRef};
use aliri_clock::UnixTime;
use aliri_oauth2::{HasScope, Scope};
use serde::Deserialize;

use crate::ids::{ClientId, ClientIdRef};

/// The payload claims expected on an inbound bearer token
///
/// Beyond the registered JWT claims, tokens carry the OAuth2 `scope`,
/// and identify the calling application through `client_id` with `azp`
/// (authorized party) as a fallback, as issued by Auth0-style authorities.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    aud: Audiences,
    #[serde(default)]
    iss: Option<jwt::Issuer>,
    #[serde(default)]
    sub: Option<jwt::Subject>,
    #[serde(default)]
    exp: Option<UnixTime>,
    #[serde(default)]
    nbf: Option<UnixTime>,
    #[serde(default)]
    iat: Option<UnixTime>,
    #[serde(default)]
    scope: Scope,
    #[serde(default)]
    client_id: Option<ClientId>,
    #[serde(default)]
    azp: Option<ClientId>,
}

impl TokenClaims {
    /// The time the token was issued, if stated
    pub fn iat(&self) -> Option<UnixTime> {
        self.iat
    }

    /// The identifier of the calling client
    ///
    /// Prefers the `client_id` claim and falls back to `azp`.
    pub fn client_id(&self) -> Option<&ClientIdRef> {
        self.client_id.as_deref().or(self.azp.as_deref())
    }
}

impl CoreClaims for TokenClaims {
    fn nbf(&self) -> Option<UnixTime> {
        self.nbf
    }

    fn exp(&self) -> Option<UnixTime> {
        self.exp
    }

    fn aud(&self) -> &Audiences {
        &self.aud
    }

    fn iss(&self) -> Option<&IssuerRef> {
        self.iss.as_deref()
    }

    fn sub(&self) -> Option<&SubjectRef> {
        self.sub.as_deref()
    }
}

impl HasScope for TokenClaims {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_falls_back_to_azp() {
        let claims: TokenClaims = serde_json::from_value(serde_json::json!({
            "iss": "https://tenant.example.com/",
            "azp": "app_123",
            "exp": 2_000_000_000u64,
        }))
        .unwrap();

        assert_eq!(claims.client_id().unwrap().as_str(), "app_123");
    }

    #[test]
    fn explicit_client_id_wins_over_azp() {
        let claims: TokenClaims = serde_json::from_value(serde_json::json!({
            "client_id": "app_a",
            "azp": "app_b",
        }))
        .unwrap();

        assert_eq!(claims.client_id().unwrap().as_str(), "app_a");
    }

    #[test]
    fn scope_accepts_space_delimited_strings() {
        let claims: TokenClaims = serde_json::from_value(serde_json::json!({
            "scope": "read:users update:users",
        }))
        .unwrap();

        assert!(claims
            .scope()
            .iter()
            .any(|s| s.as_str() == "read:users"));
    }
}
