use std::fmt::Write;

use aliri_braid::braid;
use rand::RngCore;

/// The DNS domain of a tenant's token authority
///
/// Derived from the host portion of a token's issuer URL and used as the
/// key for per-tenant signing-key resolution.
#[braid(serde)]
pub struct TenantDomain;

/// An opaque tenant identifier, as used by the seat ledger
#[braid(serde)]
pub struct TenantId;

/// An OAuth2 client ID
#[braid(serde)]
pub struct ClientId;

/// An upstream user identifier
#[braid(serde)]
pub struct UserId;

/// An upstream role identifier
#[braid(serde)]
pub struct RoleId;

/// A role's natural key: its name
#[braid(serde)]
pub struct RoleName;

/// A user's natural key: their email address
#[braid(serde)]
pub struct Email;

/// An identifier correlating an error response with traces and logs
#[braid(serde)]
pub struct CorrelationId;

impl CorrelationId {
    /// Generates a fresh random correlation identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut out = String::with_capacity(32);
        for b in bytes {
            write!(out, "{:02x}", b).expect("writes to strings never fail");
        }
        Self::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_random_hex() {
        let a = CorrelationId::random();
        let b = CorrelationId::random();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
