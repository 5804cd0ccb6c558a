use http::StatusCode;
use peranto::{ProblemKind, TenantId};
use thiserror::Error;

/// The ways a seat operation can fail
#[derive(Debug, Error)]
pub enum SeatError {
    /// The tenant has no seat record
    #[error("tenant '{tenant_id}' is not provisioned")]
    UnknownTenant {
        /// The tenant that was asked about
        tenant_id: TenantId,
    },

    /// The tenant already has a seat record
    #[error("tenant '{tenant_id}' is already provisioned")]
    AlreadyProvisioned {
        /// The tenant that was to be provisioned
        tenant_id: TenantId,
    },

    /// Reserving the requested seats would exceed the tenant's limit
    #[error("reserving {requested} seat(s) would exceed the limit ({seat_used} of {seat_limit} in use)")]
    SeatLimitExceeded {
        /// How many seats the caller asked for
        requested: u32,
        /// How many seats are currently in use
        seat_used: u32,
        /// The tenant's seat limit
        seat_limit: u32,
    },

    /// Releasing the requested seats would drive usage negative
    #[error("cannot release {requested} seat(s) when only {seat_used} are in use")]
    ReleaseExceedsUsage {
        /// How many seats the caller asked to release
        requested: u32,
        /// How many seats are currently in use
        seat_used: u32,
    },

    /// The requested seat limit is outside the acceptable range
    #[error("seat limit must be between 1 and {max}, got {requested}")]
    InvalidLimit {
        /// The limit the caller asked for
        requested: u32,
        /// The largest limit the ledger accepts
        max: u32,
    },

    /// The requested seat limit is below the seats already in use
    #[error("cannot lower the seat limit to {requested} while {seat_used} seats are in use")]
    LimitBelowUsage {
        /// The limit the caller asked for
        requested: u32,
        /// How many seats are currently in use
        seat_used: u32,
    },

    /// The tenant still has seats in use and cannot be deprovisioned
    #[error("tenant '{tenant_id}' still has {seat_used} seat(s) in use")]
    TenantNotEmpty {
        /// The tenant that was to be deprovisioned
        tenant_id: TenantId,
        /// How many seats are currently in use
        seat_used: u32,
    },

    /// The backing store failed
    #[error("seat store failure")]
    Store(#[from] SeatStoreError),
}

impl ProblemKind for SeatError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownTenant { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyProvisioned { .. } | Self::TenantNotEmpty { .. } => StatusCode::CONFLICT,
            Self::SeatLimitExceeded { .. }
            | Self::ReleaseExceedsUsage { .. }
            | Self::InvalidLimit { .. }
            | Self::LimitBelowUsage { .. } => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::AlreadyProvisioned { .. } => "already_provisioned",
            Self::SeatLimitExceeded { .. } => "seat_limit_exceeded",
            Self::ReleaseExceedsUsage { .. } => "release_exceeds_usage",
            Self::InvalidLimit { .. } => "invalid_seat_limit",
            Self::LimitBelowUsage { .. } => "limit_below_usage",
            Self::TenantNotEmpty { .. } => "tenant_not_empty",
            Self::Store(_) => "seat_store_failure",
        }
    }
}

/// A failure of the durable seat store
#[derive(Debug, Error)]
pub enum SeatStoreError {
    /// The store could not be read or written
    #[error("error accessing the seat store")]
    Io(#[from] std::io::Error),

    /// The stored data could not be interpreted
    ///
    /// A corrupt store is never silently replaced; the operator has to
    /// inspect and repair it.
    #[error("seat store contents are corrupt: {reason}")]
    Corrupt {
        /// What made the contents unacceptable
        reason: String,
    },

    /// A record could not be serialized for storage
    #[error("error encoding seat records")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_failures_are_bad_requests() {
        let exceeded = SeatError::SeatLimitExceeded {
            requested: 2,
            seat_used: 9,
            seat_limit: 10,
        };
        let below_usage = SeatError::LimitBelowUsage {
            requested: 3,
            seat_used: 5,
        };
        let over_release = SeatError::ReleaseExceedsUsage {
            requested: 4,
            seat_used: 1,
        };

        assert_eq!(exceeded.status(), StatusCode::BAD_REQUEST);
        assert_eq!(below_usage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(over_release.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn lifecycle_collisions_are_conflicts() {
        let provisioned = SeatError::AlreadyProvisioned {
            tenant_id: TenantId::from("tenant_a"),
        };
        let not_empty = SeatError::TenantNotEmpty {
            tenant_id: TenantId::from("tenant_a"),
            seat_used: 2,
        };

        assert_eq!(provisioned.status(), StatusCode::CONFLICT);
        assert_eq!(not_empty.status(), StatusCode::CONFLICT);
    }
}
