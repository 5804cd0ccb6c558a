use aliri::jwt;
use aliri_clock::UnixTime;
use aliri_oauth2::{HasScope, Scope};

use crate::ids::{ClientId, ClientIdRef, TenantDomain, TenantDomainRef};

/// An authenticated caller
///
/// Constructed once per request by the verifier after the presented token
/// has passed signature, claim, and allow-list checks. Immutable and never
/// persisted.
#[derive(Clone, Debug)]
#[must_use]
pub struct Principal {
    subject: jwt::Subject,
    client_id: ClientId,
    tenant: TenantDomain,
    scope: Scope,
    is_master_client: bool,
    issued_at: Option<UnixTime>,
    expires_at: UnixTime,
}

impl Principal {
    pub(crate) fn new(
        subject: jwt::Subject,
        client_id: ClientId,
        tenant: TenantDomain,
        scope: Scope,
        is_master_client: bool,
        issued_at: Option<UnixTime>,
        expires_at: UnixTime,
    ) -> Self {
        Self {
            subject,
            client_id,
            tenant,
            scope,
            is_master_client,
            issued_at,
            expires_at,
        }
    }

    /// The subject of the verified token
    pub fn subject(&self) -> &jwt::SubjectRef {
        &self.subject
    }

    /// The identifier of the calling client application
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The tenant domain the token was issued under
    pub fn tenant(&self) -> &TenantDomainRef {
        &self.tenant
    }

    /// Whether the caller is the configured master client
    pub fn is_master_client(&self) -> bool {
        self.is_master_client
    }

    /// The time the token was issued, when stated
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.issued_at
    }

    /// The time the token expires
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }
}

impl HasScope for Principal {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}
