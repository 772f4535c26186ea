//! In-process remote store
//!
//! Upsert-by-id store used by tests and by hosts that embed the backend.
//! Failures and latency can be injected per table or per record.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{RemoteRecord, RemoteStore};
use crate::error::RemoteError;
use crate::store::now;
use crate::sync::Fields;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: RemoteRecord,
    scope: Option<String>,
}

#[derive(Debug, Clone)]
struct Fault {
    table: String,
    record_id: Option<String>,
    error: RemoteError,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, StoredRecord>>,
    write_faults: Vec<Fault>,
    query_faults: Vec<Fault>,
    last_stamp: Option<DateTime<Utc>>,
    writes: usize,
}

impl MemoryState {
    /// Strictly increasing write timestamps
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let mut stamp = now();
        if let Some(last) = self.last_stamp {
            if stamp <= last {
                stamp = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(stamp);
        stamp
    }

    fn take_fault(faults: &mut Vec<Fault>, table: &str, record_id: Option<&str>) -> Option<RemoteError> {
        let index = faults.iter().position(|f| {
            f.table == table
                && match (&f.record_id, record_id) {
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (None, _) => true,
                    (Some(_), None) => false,
                }
        })?;

        let fault = &mut faults[index];
        let error = fault.error.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            faults.remove(index);
        }
        Some(error)
    }

    fn write(&mut self, table: &str, id: &str, fields: Fields, deleted: bool, scope: Option<String>) {
        let updated_at = self.next_stamp();
        self.tables.entry(table.to_string()).or_default().insert(
            id.to_string(),
            StoredRecord {
                record: RemoteRecord {
                    id: id.to_string(),
                    fields,
                    updated_at,
                    deleted,
                },
                scope,
            },
        );
        self.writes += 1;
    }
}

/// Remote store kept in memory
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
    scope: Option<String>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp records written through this client with an authorization scope
    pub fn with_scope(scope: &str) -> Self {
        Self {
            scope: Some(scope.to_string()),
            ..Self::default()
        }
    }

    /// Simulate an edit made by another client, stamped now
    pub fn put_remote(&self, table: &str, id: &str, fields: Fields) -> RemoteRecord {
        let mut state = self.state.lock();
        state.write(table, id, fields, false, None);
        state.tables[table][id].record.clone()
    }

    /// Simulate an edit made by another client at an explicit time
    pub fn seed(&self, table: &str, id: &str, fields: Fields, updated_at: DateTime<Utc>) {
        self.seed_record(table, None, RemoteRecord {
            id: id.to_string(),
            fields,
            updated_at,
            deleted: false,
        });
    }

    /// Insert a record as-is, optionally inside a scope
    pub fn seed_record(&self, table: &str, scope: Option<&str>, record: RemoteRecord) {
        let mut state = self.state.lock();
        if state.last_stamp.map_or(true, |last| record.updated_at > last) {
            state.last_stamp = Some(record.updated_at);
        }
        state.tables.entry(table.to_string()).or_default().insert(
            record.id.clone(),
            StoredRecord {
                record,
                scope: scope.map(str::to_string),
            },
        );
    }

    /// Simulate a delete made by another client
    pub fn delete_remote(&self, table: &str, id: &str) {
        self.state.lock().write(table, id, Fields::new(), true, None);
    }

    pub fn record(&self, table: &str, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|records| records.get(id))
            .map(|stored| stored.record.clone())
    }

    /// Live records of a table
    pub fn records(&self, table: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|records| {
                records
                    .values()
                    .filter(|stored| !stored.record.deleted)
                    .map(|stored| stored.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of accepted mutations, seeds excluded
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Fail the next `times` writes to a record (or any record of the table)
    pub fn fail_writes(&self, table: &str, record_id: Option<&str>, error: RemoteError, times: usize) {
        if times == 0 {
            return;
        }
        self.state.lock().write_faults.push(Fault {
            table: table.to_string(),
            record_id: record_id.map(str::to_string),
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` reads (delta queries and fetches) on a table
    pub fn fail_queries(&self, table: &str, error: RemoteError, times: usize) {
        if times == 0 {
            return;
        }
        self.state.lock().query_faults.push(Fault {
            table: table.to_string(),
            record_id: None,
            error,
            remaining: times,
        });
    }

    /// Delay every call, to exercise timeouts and cancellation
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn upsert(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = MemoryState::take_fault(&mut state.write_faults, table, Some(id)) {
            return Err(error);
        }
        state.write(table, id, payload.clone(), false, self.scope.clone());
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn insert(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        self.upsert(table, id, payload).await
    }

    async fn update(&self, table: &str, id: &str, payload: &Fields) -> Result<(), RemoteError> {
        self.upsert(table, id, payload).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = MemoryState::take_fault(&mut state.write_faults, table, Some(id)) {
            return Err(error);
        }
        let already_gone = state
            .tables
            .get(table)
            .and_then(|records| records.get(id))
            .map_or(true, |stored| stored.record.deleted);
        if !already_gone {
            state.write(table, id, Fields::new(), true, self.scope.clone());
        }
        Ok(())
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = MemoryState::take_fault(&mut state.query_faults, table, Some(id)) {
            return Err(error);
        }
        Ok(state
            .tables
            .get(table)
            .and_then(|records| records.get(id))
            .map(|stored| stored.record.clone()))
    }

    async fn query_updated_since(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(error) = MemoryState::take_fault(&mut state.query_faults, table, None) {
            return Err(error);
        }

        let mut records: Vec<RemoteRecord> = state
            .tables
            .get(table)
            .map(|records| {
                records
                    .values()
                    .filter(|stored| since.map_or(true, |since| stored.record.updated_at > since))
                    .filter(|stored| match (scope, stored.scope.as_deref()) {
                        (Some(wanted), Some(owner)) => wanted == owner,
                        _ => true,
                    })
                    .map(|stored| stored.record.clone())
                    .collect()
            })
            .unwrap_or_default();

        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let remote = MemoryRemoteStore::new();
        let payload = fields(json!({"qty": 5}));

        remote.insert("stock", "a", &payload).await.unwrap();
        remote.update("stock", "a", &payload).await.unwrap();

        assert_eq!(remote.records("stock").len(), 1);
        assert_eq!(remote.record("stock", "a").unwrap().fields, payload);
    }

    #[tokio::test]
    async fn test_query_since_is_exclusive_and_ordered() {
        let remote = MemoryRemoteStore::new();
        let first = remote.put_remote("boats", "b2", Fields::new());
        let second = remote.put_remote("boats", "b1", Fields::new());
        assert!(second.updated_at > first.updated_at);

        let all = remote.query_updated_since("boats", None, None).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["b2", "b1"]);

        let newer = remote
            .query_updated_since("boats", Some(first.updated_at), None)
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, "b1");
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let remote = MemoryRemoteStore::new();
        remote.insert("boats", "b1", &Fields::new()).await.unwrap();
        remote.delete("boats", "b1").await.unwrap();
        remote.delete("boats", "b1").await.unwrap();

        assert!(remote.records("boats").is_empty());
        assert!(remote.record("boats", "b1").unwrap().deleted);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let remote = MemoryRemoteStore::new();
        remote.fail_writes("stock", Some("a"), RemoteError::Network("reset".into()), 1);

        let err = remote.insert("stock", "a", &Fields::new()).await.unwrap_err();
        assert!(err.is_transient());
        remote.insert("stock", "a", &Fields::new()).await.unwrap();
        remote.insert("stock", "b", &Fields::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_returns_tombstones() {
        let remote = MemoryRemoteStore::new();
        assert!(remote.fetch("boats", "b1").await.unwrap().is_none());

        remote.put_remote("boats", "b1", fields(json!({"name": "Orca"})));
        let live = remote.fetch("boats", "b1").await.unwrap().unwrap();
        assert_eq!(live.fields["name"], "Orca");

        remote.delete_remote("boats", "b1");
        assert!(remote.fetch("boats", "b1").await.unwrap().unwrap().deleted);

        remote.fail_queries("boats", RemoteError::Network("offline".into()), 1);
        assert!(remote.fetch("boats", "b1").await.is_err());
    }

    #[tokio::test]
    async fn test_scope_filters_queries() {
        let remote = MemoryRemoteStore::new();
        let at = now();
        for (id, scope) in [("b1", Some("fleet-a")), ("b2", Some("fleet-b")), ("b3", None)] {
            remote.seed_record(
                "boats",
                scope,
                RemoteRecord {
                    id: id.to_string(),
                    fields: Fields::new(),
                    updated_at: at,
                    deleted: false,
                },
            );
        }

        let visible = remote
            .query_updated_since("boats", None, Some("fleet-a"))
            .await
            .unwrap();
        let ids: Vec<&str> = visible.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b3"]);
    }
}
