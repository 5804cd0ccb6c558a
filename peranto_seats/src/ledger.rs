//! The in-memory seat ledger
//!
//! The ledger is the single authority on seat usage while the service
//! runs. Records are loaded once from the durable store at startup; every
//! change is persisted before it is committed in memory, so the store can
//! never claim more seats than the ledger has actually handed out.

use std::{collections::HashMap, fmt, sync::Arc};

use aliri_clock::{Clock, System};
use peranto::TenantId;

use crate::{
    error::{SeatError, SeatStoreError},
    store::{SeatRecord, SeatStore},
};

/// A snapshot of one tenant's seat availability
#[derive(Clone, Copy, Debug)]
pub struct Availability {
    /// The number of seats currently in use
    pub seat_used: u32,
    /// The tenant's seat limit
    pub seat_limit: u32,
}

impl Availability {
    /// How many seats remain available
    pub fn available_seats(&self) -> u32 {
        self.seat_limit.saturating_sub(self.seat_used)
    }

    /// Whether at least one seat is available
    pub fn is_available(&self) -> bool {
        self.available_seats() > 0
    }
}

type TenantSlot = Arc<tokio::sync::Mutex<SeatRecord>>;

/// Tracks seat usage per tenant, persisting every change
///
/// Reservations for different tenants proceed independently; operations on
/// the same tenant are serialized by a per-tenant lock. Provisioning and
/// deprovisioning additionally serialize among themselves so that two
/// concurrent provisions cannot both succeed.
pub struct SeatLedger<C = System> {
    store: Arc<dyn SeatStore>,
    tenants: std::sync::RwLock<HashMap<TenantId, TenantSlot>>,
    admin_guard: tokio::sync::Mutex<()>,
    max_seat_limit: u32,
    clock: C,
}

impl SeatLedger<System> {
    /// Constructs an empty ledger over the given store
    ///
    /// Call [`load`][Self::load] before serving traffic to take over the
    /// store's records. Seat limits are accepted up to 10 000 by default.
    pub fn new(store: Arc<dyn SeatStore>) -> Self {
        Self {
            store,
            tenants: std::sync::RwLock::new(HashMap::new()),
            admin_guard: tokio::sync::Mutex::new(()),
            max_seat_limit: 10_000,
            clock: System,
        }
    }
}

impl<C> SeatLedger<C> {
    /// Bounds the seat limit a tenant may be provisioned or updated to
    pub fn with_max_seat_limit(mut self, max_seat_limit: u32) -> Self {
        self.max_seat_limit = max_seat_limit;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes.
    pub fn with_clock<D>(self, clock: D) -> SeatLedger<D> {
        SeatLedger {
            store: self.store,
            tenants: self.tenants,
            admin_guard: self.admin_guard,
            max_seat_limit: self.max_seat_limit,
            clock,
        }
    }
}

impl<C: Clock> SeatLedger<C> {
    /// Loads every record from the durable store into the ledger
    ///
    /// Fails loudly on an unreadable store or on records that violate the
    /// ledger's invariants; a proxy running on a silently emptied ledger
    /// would hand out seats it does not have.
    pub async fn load(&self) -> Result<usize, SeatError> {
        let records = self.store.load().await?;

        let mut tenants = HashMap::with_capacity(records.len());
        for record in records {
            if record.seat_limit == 0 {
                return Err(SeatStoreError::Corrupt {
                    reason: format!("tenant '{}' has a zero seat limit", record.tenant_id),
                }
                .into());
            }
            if record.seat_used > record.seat_limit {
                return Err(SeatStoreError::Corrupt {
                    reason: format!(
                        "tenant '{}' uses {} seats over its limit of {}",
                        record.tenant_id, record.seat_used, record.seat_limit
                    ),
                }
                .into());
            }
            tenants.insert(
                record.tenant_id.clone(),
                Arc::new(tokio::sync::Mutex::new(record)),
            );
        }

        let count = tenants.len();
        *self.tenants.write().expect("tenant map lock poisoned") = tenants;
        tracing::info!(tenants = count, "seat ledger loaded");
        Ok(count)
    }

    /// Creates a seat record for a new tenant
    pub async fn provision(&self, tenant_id: TenantId, seat_limit: u32) -> Result<(), SeatError> {
        self.validate_limit(seat_limit)?;

        let _admin = self.admin_guard.lock().await;
        if self.slot(&tenant_id).is_some() {
            return Err(SeatError::AlreadyProvisioned { tenant_id });
        }

        let record = SeatRecord {
            tenant_id: tenant_id.clone(),
            seat_limit,
            seat_used: 0,
            last_updated: self.clock.now(),
        };
        self.store.persist(&record).await?;

        self.tenants
            .write()
            .expect("tenant map lock poisoned")
            .insert(tenant_id.clone(), Arc::new(tokio::sync::Mutex::new(record)));
        tracing::info!(tenant.id = %tenant_id, seat_limit, "tenant provisioned");
        Ok(())
    }

    /// Removes the seat record of a tenant with no seats in use
    pub async fn deprovision(&self, tenant_id: &TenantId) -> Result<(), SeatError> {
        let _admin = self.admin_guard.lock().await;
        let slot = self.slot(tenant_id).ok_or_else(|| SeatError::UnknownTenant {
            tenant_id: tenant_id.clone(),
        })?;

        let record = slot.lock().await;
        if record.seat_used > 0 {
            return Err(SeatError::TenantNotEmpty {
                tenant_id: tenant_id.clone(),
                seat_used: record.seat_used,
            });
        }

        self.store.remove(tenant_id).await?;
        drop(record);

        self.tenants
            .write()
            .expect("tenant map lock poisoned")
            .remove(tenant_id);
        tracing::info!(tenant.id = %tenant_id, "tenant deprovisioned");
        Ok(())
    }

    /// The tenant's current seat availability
    pub async fn check_availability(&self, tenant_id: &TenantId) -> Result<Availability, SeatError> {
        let slot = self.slot(tenant_id).ok_or_else(|| SeatError::UnknownTenant {
            tenant_id: tenant_id.clone(),
        })?;
        let record = slot.lock().await;
        Ok(Availability {
            seat_used: record.seat_used,
            seat_limit: record.seat_limit,
        })
    }

    /// Reserves seats for the tenant
    ///
    /// Either all requested seats are reserved or none are. A committed
    /// reservation is durable; if the caller abandons the work the seats
    /// were reserved for, releasing them again is the caller's job.
    pub async fn reserve(&self, tenant_id: &TenantId, seats: u32) -> Result<Availability, SeatError> {
        let slot = self.slot(tenant_id).ok_or_else(|| SeatError::UnknownTenant {
            tenant_id: tenant_id.clone(),
        })?;
        let mut record = slot.lock().await;

        let seat_used = record
            .seat_used
            .checked_add(seats)
            .filter(|&used| used <= record.seat_limit)
            .ok_or(SeatError::SeatLimitExceeded {
                requested: seats,
                seat_used: record.seat_used,
                seat_limit: record.seat_limit,
            })?;

        let updated = SeatRecord {
            seat_used,
            last_updated: self.clock.now(),
            ..record.clone()
        };
        self.store.persist(&updated).await?;
        *record = updated;

        tracing::debug!(
            tenant.id = %tenant_id,
            seats,
            seat_used = record.seat_used,
            seat_limit = record.seat_limit,
            "seats reserved"
        );
        Ok(Availability {
            seat_used: record.seat_used,
            seat_limit: record.seat_limit,
        })
    }

    /// Releases previously reserved seats
    ///
    /// Releasing for an unknown tenant is a no-op rather than an error;
    /// deprovisioning legitimately races with seat releases for the same
    /// tenant.
    pub async fn release(
        &self,
        tenant_id: &TenantId,
        seats: u32,
    ) -> Result<Option<Availability>, SeatError> {
        let Some(slot) = self.slot(tenant_id) else {
            tracing::warn!(tenant.id = %tenant_id, "releasing seats for an unknown tenant");
            return Ok(None);
        };
        let mut record = slot.lock().await;

        let seat_used =
            record
                .seat_used
                .checked_sub(seats)
                .ok_or(SeatError::ReleaseExceedsUsage {
                    requested: seats,
                    seat_used: record.seat_used,
                })?;

        let updated = SeatRecord {
            seat_used,
            last_updated: self.clock.now(),
            ..record.clone()
        };
        self.store.persist(&updated).await?;
        *record = updated;

        tracing::debug!(
            tenant.id = %tenant_id,
            seats,
            seat_used = record.seat_used,
            "seats released"
        );
        Ok(Some(Availability {
            seat_used: record.seat_used,
            seat_limit: record.seat_limit,
        }))
    }

    /// Changes the tenant's seat limit
    ///
    /// The limit may move freely in either direction as long as it stays
    /// at or above the seats currently in use.
    pub async fn update_limit(
        &self,
        tenant_id: &TenantId,
        seat_limit: u32,
    ) -> Result<Availability, SeatError> {
        self.validate_limit(seat_limit)?;

        let slot = self.slot(tenant_id).ok_or_else(|| SeatError::UnknownTenant {
            tenant_id: tenant_id.clone(),
        })?;
        let mut record = slot.lock().await;

        if seat_limit < record.seat_used {
            return Err(SeatError::LimitBelowUsage {
                requested: seat_limit,
                seat_used: record.seat_used,
            });
        }

        let updated = SeatRecord {
            seat_limit,
            last_updated: self.clock.now(),
            ..record.clone()
        };
        self.store.persist(&updated).await?;
        *record = updated;

        tracing::info!(tenant.id = %tenant_id, seat_limit, "seat limit updated");
        Ok(Availability {
            seat_used: record.seat_used,
            seat_limit: record.seat_limit,
        })
    }

    fn slot(&self, tenant_id: &TenantId) -> Option<TenantSlot> {
        self.tenants
            .read()
            .expect("tenant map lock poisoned")
            .get(tenant_id)
            .cloned()
    }

    fn validate_limit(&self, seat_limit: u32) -> Result<(), SeatError> {
        if seat_limit < 1 || seat_limit > self.max_seat_limit {
            return Err(SeatError::InvalidLimit {
                requested: seat_limit,
                max: self.max_seat_limit,
            });
        }
        Ok(())
    }
}

impl<C: fmt::Debug> fmt::Debug for SeatLedger<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SeatLedger")
            .field("max_seat_limit", &self.max_seat_limit)
            .field("clock", &self.clock)
            .finish()
    }
}
