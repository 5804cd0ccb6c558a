//! Durable stores for seat records

use std::collections::BTreeMap;

use aliri_clock::UnixTime;
use async_trait::async_trait;
use peranto::{TenantId, TenantIdRef};
use serde::{Deserialize, Serialize};

use crate::error::SeatStoreError;

/// The durable state of one tenant's seat allocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeatRecord {
    /// The tenant the record belongs to
    pub tenant_id: TenantId,
    /// The maximum number of seats the tenant may use
    pub seat_limit: u32,
    /// The number of seats currently in use
    pub seat_used: u32,
    /// When the record last changed
    pub last_updated: UnixTime,
}

/// A durable store of seat records
///
/// The ledger persists a record before committing the change in memory,
/// so implementations must make [`persist`][SeatStore::persist] atomic:
/// either the updated record is fully stored or the previous state
/// survives.
#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Loads every stored seat record
    async fn load(&self) -> Result<Vec<SeatRecord>, SeatStoreError>;

    /// Stores one record, replacing any previous record for its tenant
    async fn persist(&self, record: &SeatRecord) -> Result<(), SeatStoreError>;

    /// Removes the record for the given tenant, if one exists
    async fn remove(&self, tenant_id: &TenantIdRef) -> Result<(), SeatStoreError>;
}

/// A seat store that lives only in memory
///
/// Suitable for tests and for deployments that accept losing seat state
/// on restart.
#[derive(Debug, Default)]
pub struct MemorySeatStore {
    records: std::sync::Mutex<BTreeMap<TenantId, SeatRecord>>,
}

impl MemorySeatStore {
    /// Constructs an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store preloaded with the given records
    pub fn with_records(records: impl IntoIterator<Item = SeatRecord>) -> Self {
        Self {
            records: std::sync::Mutex::new(
                records
                    .into_iter()
                    .map(|r| (r.tenant_id.clone(), r))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl SeatStore for MemorySeatStore {
    async fn load(&self) -> Result<Vec<SeatRecord>, SeatStoreError> {
        let records = self.records.lock().expect("seat store lock poisoned");
        Ok(records.values().cloned().collect())
    }

    async fn persist(&self, record: &SeatRecord) -> Result<(), SeatStoreError> {
        let mut records = self.records.lock().expect("seat store lock poisoned");
        records.insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, tenant_id: &TenantIdRef) -> Result<(), SeatStoreError> {
        let mut records = self.records.lock().expect("seat store lock poisoned");
        records.remove(tenant_id);
        Ok(())
    }
}

/// A seat store backed by a JSON file
///
/// The whole record set is rewritten on every change, through a temporary
/// file renamed into place so a crash mid-write never leaves a torn file.
/// A missing file reads as an empty store; an unreadable file is an error,
/// never an empty store.
#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
#[derive(Debug)]
pub struct FileSeatStore {
    path: std::path::PathBuf,
    snapshot: tokio::sync::Mutex<Option<BTreeMap<TenantId, SeatRecord>>>,
}

#[cfg(feature = "file")]
impl FileSeatStore {
    /// Constructs a store persisting to the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: tokio::sync::Mutex::new(None),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<TenantId, SeatRecord>, SeatStoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(error) => return Err(error.into()),
        };

        let records: Vec<SeatRecord> =
            serde_json::from_slice(&data).map_err(|error| SeatStoreError::Corrupt {
                reason: error.to_string(),
            })?;
        Ok(records
            .into_iter()
            .map(|r| (r.tenant_id.clone(), r))
            .collect())
    }

    async fn write_all(
        &self,
        records: &BTreeMap<TenantId, SeatRecord>,
    ) -> Result<(), SeatStoreError> {
        let data = serde_json::to_vec_pretty(&records.values().collect::<Vec<_>>())
            .map_err(SeatStoreError::Encode)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn mutate<F>(&self, apply: F) -> Result<(), SeatStoreError>
    where
        F: FnOnce(&mut BTreeMap<TenantId, SeatRecord>),
    {
        let mut snapshot = self.snapshot.lock().await;
        let mut records = match snapshot.take() {
            Some(records) => records,
            None => self.read_all().await?,
        };

        apply(&mut records);
        self.write_all(&records).await?;
        *snapshot = Some(records);
        Ok(())
    }
}

#[cfg(feature = "file")]
#[async_trait]
impl SeatStore for FileSeatStore {
    async fn load(&self) -> Result<Vec<SeatRecord>, SeatStoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let records = self.read_all().await?;
        let loaded = records.values().cloned().collect();
        *snapshot = Some(records);
        Ok(loaded)
    }

    async fn persist(&self, record: &SeatRecord) -> Result<(), SeatStoreError> {
        self.mutate(|records| {
            records.insert(record.tenant_id.clone(), record.clone());
        })
        .await
    }

    async fn remove(&self, tenant_id: &TenantIdRef) -> Result<(), SeatStoreError> {
        self.mutate(|records| {
            records.remove(tenant_id);
        })
        .await
    }
}

#[cfg(all(test, feature = "file"))]
mod tests {
    use super::*;

    fn record(tenant: &str, limit: u32, used: u32) -> SeatRecord {
        SeatRecord {
            tenant_id: TenantId::from(tenant),
            seat_limit: limit,
            seat_used: used,
            last_updated: UnixTime(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn a_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSeatStore::new(dir.path().join("seats.json"));

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seats.json");

        let store = FileSeatStore::new(&path);
        store.persist(&record("tenant_a", 10, 3)).await.unwrap();
        store.persist(&record("tenant_b", 5, 0)).await.unwrap();

        let reopened = FileSeatStore::new(&path);
        let mut records = reopened.load().await.unwrap();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tenant_id.as_str(), "tenant_a");
        assert_eq!(records[0].seat_used, 3);
        assert_eq!(records[1].tenant_id.as_str(), "tenant_b");
    }

    #[tokio::test]
    async fn removal_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seats.json");

        let store = FileSeatStore::new(&path);
        store.persist(&record("tenant_a", 10, 0)).await.unwrap();
        store.remove(TenantIdRef::from_str("tenant_a")).await.unwrap();

        let reopened = FileSeatStore::new(&path);
        assert!(reopened.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_corrupt_file_is_an_error_not_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seats.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = FileSeatStore::new(&path);
        let err = store.load().await.unwrap_err();

        assert!(matches!(err, SeatStoreError::Corrupt { .. }));
    }
}
