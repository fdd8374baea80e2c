//! Storage module for the local, offline-first copy of the user's data.
//!
//! A single native_db database holds the synced entity tables, the durable
//! mutation queue and the per-kind id mapping snapshots.

use crate::models::{
    EntityKind, EventLocal, EventTypeLocal, GeofenceLocal, IdMappingSnapshot, OperationKind,
    QueuedOperationLocal,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use native_db::{Builder, Database, Models, ToInput};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::path::Path;

static MODELS: OnceCell<Models> = OnceCell::new();

fn models() -> Result<&'static Models> {
    MODELS.get_or_try_init(|| {
        let mut models = Models::new();
        models.define::<EventTypeLocal>()?;
        models.define::<EventLocal>()?;
        models.define::<GeofenceLocal>()?;
        models.define::<QueuedOperationLocal>()?;
        models.define::<IdMappingSnapshot>()?;
        Ok(models)
    })
}

pub struct LocalStore {
    database: Database<'static>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let database = Builder::new()
            .create(models()?, path)
            .with_context(|| format!("Failed to open local store at {}", path.display()))?;
        Ok(Self { database })
    }

    /// Opens a throwaway database that lives only as long as the store.
    pub fn in_memory() -> Result<Self> {
        let database = Builder::new().create_in_memory(models()?)?;
        Ok(Self { database })
    }

    // ===== GENERIC ENTITY ACCESS =====

    /// Returns every stored row of `T` in primary key order.
    pub fn all<T: ToInput>(&self) -> Result<Vec<T>> {
        let r = self.database.r_transaction()?;
        let items = r
            .scan()
            .primary::<T>()?
            .all()?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(items)
    }

    pub fn get<T: ToInput>(&self, id_local: &str) -> Result<Option<T>> {
        let r = self.database.r_transaction()?;
        Ok(r.get().primary::<T>(id_local.to_string())?)
    }

    /// Inserts or replaces a row, committing before returning.
    pub fn upsert<T: ToInput>(&self, item: T) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        rw.upsert(item)?;
        rw.commit()?;
        Ok(())
    }

    /// Removes a row by primary key. Returns the removed row, if any existed.
    pub fn remove<T: ToInput>(&self, id_local: &str) -> Result<Option<T>> {
        let rw = self.database.rw_transaction()?;
        let existing: Option<T> = rw.get().primary(id_local.to_string())?;
        let removed = match existing {
            Some(item) => Some(rw.remove(item)?),
            None => None,
        };
        rw.commit()?;
        Ok(removed)
    }

    // ===== ENTITY HELPERS =====

    pub fn event_types(&self) -> Result<Vec<EventTypeLocal>> {
        self.all::<EventTypeLocal>()
    }

    pub fn events(&self) -> Result<Vec<EventLocal>> {
        self.all::<EventLocal>()
    }

    pub fn geofences(&self) -> Result<Vec<GeofenceLocal>> {
        self.all::<GeofenceLocal>()
    }

    pub fn find_event_by_external_id(&self, external_id: &str) -> Result<Option<EventLocal>> {
        Ok(self
            .events()?
            .into_iter()
            .find(|event| event.external_id.as_deref() == Some(external_id)))
    }

    pub fn find_geofence_by_backend_id(&self, backend_id: &str) -> Result<Option<GeofenceLocal>> {
        Ok(self
            .geofences()?
            .into_iter()
            .find(|geofence| geofence.backend_id.as_deref() == Some(backend_id)))
    }

    /// Whether any local event still points at the given event type.
    pub fn event_type_in_use(&self, event_type_id_local: &str) -> Result<bool> {
        Ok(self
            .events()?
            .iter()
            .any(|event| event.event_type_id_local == event_type_id_local))
    }

    // ===== MUTATION QUEUE =====

    /// Appends an operation with the next sequence number. The row is committed
    /// before this returns.
    pub fn append_operation(
        &self,
        kind: OperationKind,
        entity_id_local: &str,
        payload: String,
        idempotency_key: String,
    ) -> Result<QueuedOperationLocal> {
        let rw = self.database.rw_transaction()?;
        let mut last_sequence = 0u64;
        for item in rw.scan().primary::<QueuedOperationLocal>()?.all()? {
            last_sequence = last_sequence.max(item?.sequence);
        }

        let operation = QueuedOperationLocal {
            sequence: last_sequence + 1,
            kind,
            entity_id_local: entity_id_local.to_string(),
            payload,
            idempotency_key,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        rw.insert(operation.clone())?;
        rw.commit()?;
        Ok(operation)
    }

    /// Pending operations, oldest first.
    pub fn operations(&self) -> Result<Vec<QueuedOperationLocal>> {
        let r = self.database.r_transaction()?;
        let mut operations = r
            .scan()
            .primary::<QueuedOperationLocal>()?
            .all()?
            .collect::<Result<Vec<QueuedOperationLocal>, _>>()?;
        // Sequence is assigned inside the append transaction; wall-clock time can step back.
        operations.sort_by_key(|op| op.sequence);
        Ok(operations)
    }

    pub fn update_operation(&self, operation: QueuedOperationLocal) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        let existing: Option<QueuedOperationLocal> = rw.get().primary(operation.sequence)?;
        if existing.is_none() {
            return Err(anyhow!(
                "Queued operation {} no longer exists",
                operation.sequence
            ));
        }
        rw.upsert(operation)?;
        rw.commit()?;
        Ok(())
    }

    pub fn remove_operation(&self, sequence: u64) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        let existing: Option<QueuedOperationLocal> = rw.get().primary(sequence)?;
        if let Some(operation) = existing {
            rw.remove(operation)?;
        }
        rw.commit()?;
        Ok(())
    }

    // ===== ID MAPPING SNAPSHOTS =====

    pub fn load_mapping_snapshot(&self, kind: EntityKind) -> Result<BTreeMap<String, String>> {
        let r = self.database.r_transaction()?;
        let snapshot: Option<IdMappingSnapshot> = r.get().primary(kind.as_str().to_string())?;
        Ok(snapshot.map(|s| s.entries).unwrap_or_default())
    }

    pub fn save_mapping_snapshot(
        &self,
        kind: EntityKind,
        entries: BTreeMap<String, String>,
    ) -> Result<()> {
        self.upsert(IdMappingSnapshot {
            kind: kind.as_str().to_string(),
            entries,
            saved_at: Utc::now(),
        })
    }
}
