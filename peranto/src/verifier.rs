//! Bearer token verification
//!
//! The verifier drives the full acceptance pipeline for an inbound
//! `Authorization` header: bearer extraction, per-tenant key resolution,
//! signature verification, claim validation, and the client allow-list
//! check. Success produces a [`Principal`]; every failure is a typed
//! [`AuthError`].

use aliri::{error::ClaimsRejected, error::JwtVerifyError, jwa, jwt, JwtRef};
use aliri_clock::System;
use aliri_oauth2::HasScope;

use crate::{
    claims::TokenClaims,
    error::AuthError,
    ids::ClientId,
    principal::Principal,
    resolver::{ResolvedKey, TenantKeyResolver},
};

/// The set of client applications permitted to call the service
///
/// One client may additionally be designated the master client, granting
/// it administrative operations. The master client is implicitly allowed.
#[derive(Clone, Debug, Default)]
pub struct ClientRegistry {
    allowed: std::collections::HashSet<ClientId>,
    master: Option<ClientId>,
}

impl ClientRegistry {
    /// Constructs an empty registry that allows no clients
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client to the allow-list
    pub fn allow(mut self, client_id: ClientId) -> Self {
        self.allowed.insert(client_id);
        self
    }

    /// Designates the master client
    pub fn with_master(mut self, client_id: ClientId) -> Self {
        self.master = Some(client_id);
        self
    }

    /// Whether the client may call the service
    pub fn is_allowed(&self, client_id: &ClientId) -> bool {
        self.allowed.contains(client_id) || self.is_master(client_id)
    }

    /// Whether the client is the designated master client
    pub fn is_master(&self, client_id: &ClientId) -> bool {
        self.master.as_ref() == Some(client_id)
    }
}

/// Verifies inbound bearer tokens into authenticated principals
#[derive(Debug)]
pub struct TokenVerifier<C = System> {
    resolver: TenantKeyResolver<C>,
    audience: jwt::Audience,
    algorithms: Vec<jwa::Algorithm>,
    clients: ClientRegistry,
}

impl<C> TokenVerifier<C> {
    /// Constructs a verifier requiring the given audience on every token
    ///
    /// Only RS256 signatures are accepted unless further algorithms are
    /// added with [`add_approved_algorithm`][Self::add_approved_algorithm].
    pub fn new(
        resolver: TenantKeyResolver<C>,
        audience: jwt::Audience,
        clients: ClientRegistry,
    ) -> Self {
        Self {
            resolver,
            audience,
            algorithms: vec![jwa::Algorithm::RS256],
            clients,
        }
    }

    /// Approves an additional signature algorithm
    pub fn add_approved_algorithm(mut self, alg: jwa::Algorithm) -> Self {
        self.algorithms.push(alg);
        self
    }
}

impl<C: aliri_clock::Clock + Clone> TokenVerifier<C> {
    /// Verifies the value of an `Authorization` header
    ///
    /// The header must carry a `Bearer` scheme. Absence of the header is
    /// reported distinctly from presence of an unacceptable token.
    pub async fn verify(&self, authorization: Option<&str>) -> Result<Principal, AuthError> {
        let header = authorization.ok_or(AuthError::MissingToken)?;
        let token = extract_bearer(header)?;
        self.verify_token(token).await
    }

    /// Verifies an `Authorization` header on an endpoint where
    /// authentication is optional
    ///
    /// An absent header is not an error; a header that is present but
    /// unacceptable still is.
    pub async fn verify_optional(
        &self,
        authorization: Option<&str>,
    ) -> Result<Option<Principal>, AuthError> {
        match authorization {
            None => Ok(None),
            Some(header) => {
                let token = extract_bearer(header)?;
                self.verify_token(token).await.map(Some)
            }
        }
    }

    /// Verifies a raw bearer token
    pub async fn verify_token(&self, token: &JwtRef) -> Result<Principal, AuthError> {
        let resolved = self.resolver.resolve_signing_key(token).await?;

        let validator = jwt::CoreValidator::default()
            .extend_approved_algorithms(self.algorithms.iter().copied())
            .require_issuer(resolved.issuer.clone())
            .add_allowed_audience(self.audience.clone());

        let validated = token
            .verify::<TokenClaims, jwt::BasicHeaders, _>(&*resolved.key, &validator)
            .map_err(classify_verify_error)?;
        let (_, claims) = validated.extract();

        self.accept_claims(claims, &resolved)
    }

    // The validator already checked issuer and audience; they are checked
    // once more here, directly against the claims, so that acceptance does
    // not rest on validator configuration alone.
    fn accept_claims(
        &self,
        claims: TokenClaims,
        resolved: &ResolvedKey,
    ) -> Result<Principal, AuthError> {
        use aliri::jwt::CoreClaims;

        let issuer_ok = claims.iss().map_or(false, |iss| iss == &*resolved.issuer);
        if !issuer_ok {
            return Err(AuthError::InvalidToken("issuer does not match the tenant"));
        }

        let audience_ok = claims.aud().iter().any(|aud| aud == &*self.audience);
        if !audience_ok {
            return Err(AuthError::InvalidToken(
                "token was not issued for this service",
            ));
        }

        let client_id = claims
            .client_id()
            .ok_or(AuthError::InvalidToken(
                "token does not identify a client application",
            ))?
            .to_owned();
        if !self.clients.is_allowed(&client_id) {
            tracing::warn!(
                client.id = %client_id,
                tenant = %resolved.domain,
                "rejecting token from a client outside the allow-list"
            );
            return Err(AuthError::ClientNotAllowed { client_id });
        }

        let subject = claims
            .sub()
            .ok_or(AuthError::InvalidToken("subject claim is missing"))?
            .to_owned();
        let expires_at = claims
            .exp()
            .ok_or(AuthError::InvalidToken("expiration claim is missing"))?;

        let is_master = self.clients.is_master(&client_id);
        tracing::debug!(
            client.id = %client_id,
            tenant = %resolved.domain,
            master = is_master,
            "accepted bearer token"
        );

        Ok(Principal::new(
            subject,
            client_id,
            resolved.domain.clone(),
            claims.scope().clone(),
            is_master,
            claims.iat(),
            expires_at,
        ))
    }
}

fn extract_bearer(header: &str) -> Result<&JwtRef, AuthError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidToken(
            "authorization header is not a bearer token",
        ))?
        .trim();
    if token.is_empty() {
        return Err(AuthError::InvalidToken("bearer token is empty"));
    }
    Ok(JwtRef::from_str(token))
}

fn classify_verify_error(error: JwtVerifyError) -> AuthError {
    match error {
        JwtVerifyError::ClaimsRejected(ClaimsRejected::TokenExpired) => AuthError::TokenExpired,
        JwtVerifyError::ClaimsRejected(ClaimsRejected::TokenNotYetValid) => {
            AuthError::InvalidToken("token is not yet valid")
        }
        JwtVerifyError::ClaimsRejected(ClaimsRejected::InvalidAudience) => {
            AuthError::InvalidToken("token was not issued for this service")
        }
        JwtVerifyError::ClaimsRejected(ClaimsRejected::InvalidIssuer) => {
            AuthError::InvalidToken("issuer does not match the tenant")
        }
        JwtVerifyError::ClaimsRejected(ClaimsRejected::InvalidAlgorithm) => {
            AuthError::InvalidToken("token uses an unapproved signature algorithm")
        }
        JwtVerifyError::ClaimsRejected(_) => AuthError::InvalidToken("token claims were rejected"),
        JwtVerifyError::MalformedToken(_)
        | JwtVerifyError::MalformedTokenHeader(_)
        | JwtVerifyError::MalformedTokenPayload(_)
        | JwtVerifyError::MalformedTokenSignature(_) => {
            AuthError::MalformedToken("token could not be parsed")
        }
        _ => AuthError::InvalidToken("token signature could not be verified"),
    }
}
