//! Bidirectional local id ↔ backend id mapping for event types and events.
//!
//! Geofences keep their backend id on the entity itself and do not use this table.

use crate::models::{EntityKind, LocalId};
use crate::storage::LocalStore;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

/// One kind's mapping. Both directions are always updated together, and a backend
/// id is owned by at most one local id.
#[derive(Debug, Clone)]
pub struct IdMappingStore {
    kind: EntityKind,
    local_to_backend: HashMap<LocalId, String>,
    backend_to_local: HashMap<String, LocalId>,
}

impl IdMappingStore {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            local_to_backend: HashMap::new(),
            backend_to_local: HashMap::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn backend_id(&self, local: &LocalId) -> Option<&str> {
        self.local_to_backend.get(local).map(String::as_str)
    }

    pub fn local_id(&self, backend: &str) -> Option<LocalId> {
        self.backend_to_local.get(backend).copied()
    }

    pub fn contains_backend_id(&self, backend: &str) -> bool {
        self.backend_to_local.contains_key(backend)
    }

    /// Links `local` to `backend`, replacing any previous pairing of either side.
    ///
    /// A backend id already owned by a different local id is taken away from it, so
    /// the mapping stays one-to-one (last writer wins). Returns whether anything changed.
    pub fn set_mapping(&mut self, local: LocalId, backend: impl Into<String>) -> bool {
        let backend = backend.into();
        if self.backend_id(&local) == Some(backend.as_str()) {
            return false;
        }

        if let Some(previous_backend) = self.local_to_backend.remove(&local) {
            self.backend_to_local.remove(&previous_backend);
        }
        if let Some(previous_local) = self.backend_to_local.remove(&backend) {
            tracing::warn!(
                kind = %self.kind,
                backend_id = %backend,
                previous_local = %previous_local,
                new_local = %local,
                "Backend id re-linked to a different local entity"
            );
            self.local_to_backend.remove(&previous_local);
        }

        self.local_to_backend.insert(local, backend.clone());
        self.backend_to_local.insert(backend, local);
        true
    }

    /// Removes `local`'s pairing in both directions. Returns the backend id it had.
    pub fn remove_mapping(&mut self, local: &LocalId) -> Option<String> {
        let backend = self.local_to_backend.remove(local)?;
        self.backend_to_local.remove(&backend);
        Some(backend)
    }

    pub fn len(&self) -> usize {
        self.local_to_backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_to_backend.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LocalId, &str)> {
        self.local_to_backend
            .iter()
            .map(|(local, backend)| (local, backend.as_str()))
    }

    /// The persisted form: only the local→backend direction.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.local_to_backend
            .iter()
            .map(|(local, backend)| (local.to_string(), backend.clone()))
            .collect()
    }

    /// Rebuilds both directions from a stored snapshot. Entries whose local id does not
    /// parse, or whose backend id is blank, are dropped.
    pub fn from_snapshot(kind: EntityKind, entries: BTreeMap<String, String>) -> Self {
        let mut store = Self::new(kind);
        let mut dropped = 0usize;
        for (local, backend) in entries {
            match local.parse::<LocalId>() {
                Ok(local) if !backend.trim().is_empty() => {
                    store.set_mapping(local, backend);
                }
                _ => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::debug!(kind = %kind, dropped, "Dropped unreadable id mapping entries");
        }
        store
    }

    pub fn load(store: &LocalStore, kind: EntityKind) -> Result<Self> {
        let entries = store.load_mapping_snapshot(kind)?;
        Ok(Self::from_snapshot(kind, entries))
    }

    pub fn save(&self, store: &LocalStore) -> Result<()> {
        store.save_mapping_snapshot(self.kind, self.snapshot())
    }
}

/// The two mapped kinds, loaded and saved together.
#[derive(Debug, Clone)]
pub struct IdMappings {
    pub event_types: IdMappingStore,
    pub events: IdMappingStore,
}

impl Default for IdMappings {
    fn default() -> Self {
        Self {
            event_types: IdMappingStore::new(EntityKind::EventType),
            events: IdMappingStore::new(EntityKind::Event),
        }
    }
}

impl IdMappings {
    pub fn load_all(store: &LocalStore) -> Result<Self> {
        Ok(Self {
            event_types: IdMappingStore::load(store, EntityKind::EventType)?,
            events: IdMappingStore::load(store, EntityKind::Event)?,
        })
    }

    pub fn save_all(&self, store: &LocalStore) -> Result<()> {
        self.event_types.save(store)?;
        self.events.save(store)?;
        Ok(())
    }

    /// Mapping for a kind that uses the table, `None` for geofences.
    pub fn for_kind(&self, kind: EntityKind) -> Option<&IdMappingStore> {
        match kind {
            EntityKind::EventType => Some(&self.event_types),
            EntityKind::Event => Some(&self.events),
            EntityKind::Geofence => None,
        }
    }

    pub fn for_kind_mut(&mut self, kind: EntityKind) -> Option<&mut IdMappingStore> {
        match kind {
            EntityKind::EventType => Some(&mut self.event_types),
            EntityKind::Event => Some(&mut self.events),
            EntityKind::Geofence => None,
        }
    }

    /// Resolves a stored local event type id to its backend id.
    pub fn event_type_backend_id(&self, event_type_id_local: &str) -> Option<String> {
        let local: LocalId = event_type_id_local.parse().ok()?;
        self.event_types.backend_id(&local).map(str::to_string)
    }

    /// Resolves a backend event type id to the stored local id string.
    pub fn event_type_local_id(&self, backend: &str) -> Option<String> {
        self.event_types.local_id(backend).map(|id| id.to_string())
    }
}
