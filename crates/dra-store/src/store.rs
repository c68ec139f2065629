//! StateStore — redb-backed persistence for slices, claims and classes.
//!
//! Objects are validated before they are written, so nothing invalid is
//! ever stored. Claim specs are write-once; only the status changes after
//! creation, through [`StateStore::update_claim_status`].

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dra_core::{Claim, ClaimStatus, ClaimTemplate, DeviceClass, Slice};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::filter::SliceFilter;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [SLICES, CLAIMS, CLASSES, TEMPLATES] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one record inside a single write transaction.
    /// `update` sees the current value (if any) and returns the value to
    /// store.
    fn upsert<T, F>(&self, table: Table, key: &str, update: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let next = update(current)?;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    // ── Slices ─────────────────────────────────────────────────────

    /// Publish or replace a slice. Taints without a timestamp are stamped
    /// with the current time.
    pub fn put_slice(&self, slice: &Slice) -> StateResult<Slice> {
        slice.validate()?;
        let key = slice.metadata.name.clone();
        let now = epoch_secs();
        let stored = self.upsert(SLICES, &key, |current: Option<Slice>| {
            let mut next = slice.clone();
            next.default_taint_times(now);
            next.metadata.resource_version = current.map_or(0, |c| c.metadata.resource_version) + 1;
            Ok(next)
        })?;
        debug!(
            %key,
            driver = %stored.spec.driver,
            pool = %stored.spec.pool.name,
            generation = stored.spec.pool.generation,
            devices = stored.spec.devices.len(),
            "slice stored"
        );
        Ok(stored)
    }

    pub fn get_slice(&self, name: &str) -> StateResult<Option<Slice>> {
        self.get(SLICES, name)
    }

    /// List slices matching an exact-match field filter.
    pub fn list_slices(&self, filter: &SliceFilter) -> StateResult<Vec<Slice>> {
        let mut slices: Vec<Slice> = self.list(SLICES)?;
        slices.retain(|s| filter.matches(s));
        Ok(slices)
    }

    pub fn delete_slice(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(SLICES, name)?;
        debug!(%name, existed, "slice deleted");
        Ok(existed)
    }

    // ── Claims ─────────────────────────────────────────────────────

    /// Create a claim. The spec is immutable from here on.
    pub fn create_claim(&self, claim: &Claim) -> StateResult<Claim> {
        claim.validate()?;
        let key = claim.key();
        let stored = self.upsert(CLAIMS, &key, |current: Option<Claim>| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(key.clone()));
            }
            let mut next = claim.clone();
            next.metadata.resource_version = 1;
            if next.metadata.uid.is_empty() {
                next.metadata.uid = format!("{}-{}", key.replace('/', "-"), epoch_nanos());
            }
            Ok(next)
        })?;
        debug!(%key, uid = %stored.metadata.uid, "claim created");
        Ok(stored)
    }

    pub fn get_claim(&self, key: &str) -> StateResult<Option<Claim>> {
        self.get(CLAIMS, key)
    }

    pub fn list_claims(&self) -> StateResult<Vec<Claim>> {
        self.list(CLAIMS)
    }

    /// Replace the status of a claim if its version still equals
    /// `expected_version`. A stale base yields [`StateError::Conflict`].
    pub fn update_claim_status(
        &self,
        key: &str,
        expected_version: u64,
        status: &ClaimStatus,
    ) -> StateResult<Claim> {
        status.validate()?;
        let stored = self.upsert(CLAIMS, key, |current: Option<Claim>| {
            let mut claim = current.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let actual = claim.metadata.resource_version;
            if actual != expected_version {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected: expected_version,
                    actual,
                });
            }
            claim.status = status.clone();
            claim.metadata.resource_version = actual + 1;
            Ok(claim)
        })?;
        debug!(
            %key,
            version = stored.metadata.resource_version,
            phase = ?stored.status.phase(),
            "claim status updated"
        );
        Ok(stored)
    }

    /// Delete a claim. Refused while it still holds an allocation.
    pub fn delete_claim(&self, key: &str) -> StateResult<bool> {
        if let Some(claim) = self.get_claim(key)?
            && claim.status.allocation.is_some()
        {
            return Err(StateError::Write(format!("{key}: claim is still allocated")));
        }
        self.delete(CLAIMS, key)
    }

    // ── Classes ────────────────────────────────────────────────────

    /// Insert or update a device class.
    pub fn put_class(&self, class: &DeviceClass) -> StateResult<DeviceClass> {
        class.validate()?;
        let key = class.metadata.name.clone();
        let stored = self.upsert(CLASSES, &key, |current: Option<DeviceClass>| {
            let mut next = class.clone();
            next.metadata.resource_version = current.map_or(0, |c| c.metadata.resource_version) + 1;
            Ok(next)
        })?;
        debug!(%key, selectors = stored.spec.selectors.len(), "class stored");
        Ok(stored)
    }

    pub fn get_class(&self, name: &str) -> StateResult<Option<DeviceClass>> {
        self.get(CLASSES, name)
    }

    pub fn list_classes(&self) -> StateResult<Vec<DeviceClass>> {
        self.list(CLASSES)
    }

    pub fn delete_class(&self, name: &str) -> StateResult<bool> {
        self.delete(CLASSES, name)
    }

    // ── Templates ──────────────────────────────────────────────────

    pub fn put_template(&self, template: &ClaimTemplate) -> StateResult<ClaimTemplate> {
        template.validate()?;
        let key = template.metadata.key();
        self.upsert(TEMPLATES, &key, |current: Option<ClaimTemplate>| {
            let mut next = template.clone();
            next.metadata.resource_version = current.map_or(0, |c| c.metadata.resource_version) + 1;
            Ok(next)
        })
    }

    pub fn get_template(&self, key: &str) -> StateResult<Option<ClaimTemplate>> {
        self.get(TEMPLATES, key)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
