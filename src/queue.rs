//! Durable queue of local mutations waiting to reach the backend.
//!
//! Operations are drained oldest first. References to other entities are resolved
//! through the id mappings at drain time, so an operation recorded offline picks up
//! whatever backend ids exist by the time it is sent.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::client::Backend;
use crate::error::ApiError;
use crate::id_mapping::IdMappings;
use crate::models::{
    EntityKind, EventLocal, EventTypeLocal, GeofenceLocal, LocalId, Operation, OperationKind,
    QueuedOperationLocal, UpdateEventTypeRequest,
};
use crate::storage::LocalStore;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub obsolete: usize,
}

/// What happened to one queued operation during a drain pass.
#[derive(Debug)]
enum Outcome {
    /// Backend confirmed it, or it was already satisfied.
    Done,
    /// A referenced entity has no backend id yet; retry on a later pass.
    Skipped(String),
    /// Nothing left to send.
    Obsolete(String),
    Failed(String),
}

impl From<ApiError> for Outcome {
    fn from(err: ApiError) -> Self {
        if err.is_conflict() {
            Outcome::Done
        } else {
            Outcome::Failed(err.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationQueue {
    store: Arc<LocalStore>,
    max_attempts: u32,
}

impl MutationQueue {
    pub fn new(store: Arc<LocalStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Persists `operation` against `entity_id_local`. Returns once the row is committed.
    ///
    /// The idempotency key is the target's local id. The upload phase leaves any entity
    /// with a queued create to this keyed path.
    pub fn enqueue(&self, operation: &Operation, entity_id_local: &str) -> Result<QueuedOperationLocal> {
        let payload = operation
            .encode()
            .with_context(|| format!("Failed to encode {} operation", operation.kind()))?;
        let queued = self.store.append_operation(
            operation.kind(),
            entity_id_local,
            payload,
            entity_id_local.to_string(),
        )?;
        tracing::debug!(
            sequence = queued.sequence,
            kind = %queued.kind,
            id_local = %entity_id_local,
            "Queued mutation"
        );
        Ok(queued)
    }

    /// Pending operations, oldest first.
    pub fn pending(&self) -> Result<Vec<QueuedOperationLocal>> {
        self.store.operations()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.store.operations()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Local ids with a delete of the given kind still waiting in the queue.
    pub fn pending_deletes(&self, kind: EntityKind) -> Result<HashSet<String>> {
        Ok(self
            .store
            .operations()?
            .into_iter()
            .filter(|op| op.kind.is_delete() && op.kind.entity_kind() == kind)
            .map(|op| op.entity_id_local)
            .collect())
    }

    /// Local ids with a create of the given kind still waiting in the queue.
    pub fn pending_creates(&self, kind: EntityKind) -> Result<HashSet<String>> {
        Ok(self
            .store
            .operations()?
            .into_iter()
            .filter(|op| op.kind.is_create() && op.kind.entity_kind() == kind)
            .map(|op| op.entity_id_local)
            .collect())
    }

    /// Backend ids captured by queued geofence deletes. The local rows are already gone,
    /// so these ids are the only link back to the remote records.
    pub fn pending_geofence_deletes(&self) -> Result<HashSet<String>> {
        let mut backend_ids = HashSet::new();
        for op in self.store.operations()? {
            if op.kind != OperationKind::DeleteGeofence {
                continue;
            }
            match Operation::decode(&op.payload) {
                Ok(Operation::DeleteGeofence {
                    backend_id: Some(backend_id),
                }) => {
                    backend_ids.insert(backend_id);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(sequence = op.sequence, error = %err, "Unreadable queued geofence delete");
                }
            }
        }
        Ok(backend_ids)
    }

    /// Sends every pending operation once.
    ///
    /// Per-operation failures are recorded on the row and never abort the pass. Only a
    /// failure to update the queue itself is returned as an error.
    pub async fn drain(&self, backend: &dyn Backend, mappings: &mut IdMappings) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut creates_still_pending: HashSet<String> = HashSet::new();

        for mut queued in self.store.operations()? {
            let outcome = match Operation::decode(&queued.payload) {
                Ok(operation) => {
                    self.dispatch(&queued, operation, backend, mappings, &creates_still_pending)
                        .await
                }
                Err(err) => Outcome::Failed(format!("Unreadable payload: {}", err)),
            };

            match outcome {
                Outcome::Done => {
                    self.store.remove_operation(queued.sequence)?;
                    report.succeeded += 1;
                }
                Outcome::Obsolete(reason) => {
                    tracing::info!(
                        sequence = queued.sequence,
                        kind = %queued.kind,
                        id_local = %queued.entity_id_local,
                        reason = %reason,
                        "Dropping obsolete queued mutation"
                    );
                    self.store.remove_operation(queued.sequence)?;
                    report.obsolete += 1;
                }
                Outcome::Skipped(reason) => {
                    tracing::debug!(
                        sequence = queued.sequence,
                        kind = %queued.kind,
                        id_local = %queued.entity_id_local,
                        reason = %reason,
                        "Skipping queued mutation for now"
                    );
                    if queued.kind.is_create() {
                        creates_still_pending.insert(queued.entity_id_local.clone());
                    }
                    report.skipped += 1;
                }
                Outcome::Failed(error) => {
                    queued.attempts += 1;
                    queued.last_error = Some(error.clone());
                    if queued.attempts >= self.max_attempts {
                        tracing::error!(
                            sequence = queued.sequence,
                            kind = %queued.kind,
                            id_local = %queued.entity_id_local,
                            attempts = queued.attempts,
                            error = %error,
                            "Discarding queued mutation after repeated failures"
                        );
                        self.store.remove_operation(queued.sequence)?;
                        report.discarded += 1;
                    } else {
                        tracing::warn!(
                            sequence = queued.sequence,
                            kind = %queued.kind,
                            id_local = %queued.entity_id_local,
                            attempts = queued.attempts,
                            error = %error,
                            "Queued mutation failed"
                        );
                        if queued.kind.is_create() {
                            creates_still_pending.insert(queued.entity_id_local.clone());
                        }
                        self.store.update_operation(queued)?;
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            tracing::info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                discarded = report.discarded,
                obsolete = report.obsolete,
                "Drained mutation queue"
            );
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        queued: &QueuedOperationLocal,
        operation: Operation,
        backend: &dyn Backend,
        mappings: &mut IdMappings,
        creates_still_pending: &HashSet<String>,
    ) -> Outcome {
        let target = queued.entity_id_local.as_str();
        let local_id: Option<LocalId> = target.parse().ok();
        let key = Some(queued.idempotency_key.as_str());

        match operation {
            // ===== EVENT TYPES =====
            Operation::CreateEventType(payload) => {
                let Some(local_id) = local_id else {
                    return Outcome::Obsolete("target id is not a local id".into());
                };
                if mappings.event_types.backend_id(&local_id).is_some() {
                    return Outcome::Done;
                }
                match self.store.get::<EventTypeLocal>(target) {
                    Ok(Some(_)) => {}
                    Ok(None) => return Outcome::Obsolete("event type no longer exists".into()),
                    Err(err) => return Outcome::Failed(err.to_string()),
                }
                match backend.create_event_type(&(&payload).into(), key).await {
                    Ok(remote) => {
                        mappings.event_types.set_mapping(local_id, remote.id);
                        Outcome::Done
                    }
                    Err(err) => err.into(),
                }
            }
            Operation::UpdateEventType(payload) => {
                let Some(backend_id) = mapped(mappings, EntityKind::EventType, local_id) else {
                    return self.unresolved_update::<EventTypeLocal>(target);
                };
                let request = UpdateEventTypeRequest {
                    name: Some(payload.name),
                    color: Some(payload.color),
                    icon: Some(payload.icon),
                };
                match backend.update_event_type(&backend_id, &request).await {
                    Ok(_) => Outcome::Done,
                    Err(err) => err.into(),
                }
            }
            Operation::DeleteEventType => {
                let Some(backend_id) = mapped(mappings, EntityKind::EventType, local_id) else {
                    return unresolved_delete(target, creates_still_pending);
                };
                let result = backend.delete_event_type(&backend_id).await;
                self.finish_delete(result, mappings, EntityKind::EventType, local_id)
            }

            // ===== EVENTS =====
            Operation::CreateEvent(payload) => {
                let Some(local_id) = local_id else {
                    return Outcome::Obsolete("target id is not a local id".into());
                };
                if mappings.events.backend_id(&local_id).is_some() {
                    return Outcome::Done;
                }
                match self.store.get::<EventLocal>(target) {
                    Ok(Some(_)) => {}
                    Ok(None) => return Outcome::Obsolete("event no longer exists".into()),
                    Err(err) => return Outcome::Failed(err.to_string()),
                }
                let Some(event_type_id) =
                    mappings.event_type_backend_id(&payload.event_type_id_local)
                else {
                    return Outcome::Skipped("event type not synced yet".into());
                };
                match backend
                    .create_event(&payload.to_request(event_type_id), key)
                    .await
                {
                    Ok(remote) => {
                        mappings.events.set_mapping(local_id, remote.id);
                        Outcome::Done
                    }
                    Err(err) => err.into(),
                }
            }
            Operation::UpdateEvent(payload) => {
                let Some(backend_id) = mapped(mappings, EntityKind::Event, local_id) else {
                    return self.unresolved_update::<EventLocal>(target);
                };
                let Some(event_type_id) =
                    mappings.event_type_backend_id(&payload.event_type_id_local)
                else {
                    return Outcome::Skipped("event type not synced yet".into());
                };
                match backend
                    .update_event(&backend_id, &payload.to_request(event_type_id))
                    .await
                {
                    Ok(_) => Outcome::Done,
                    Err(err) => err.into(),
                }
            }
            Operation::DeleteEvent => {
                let Some(backend_id) = mapped(mappings, EntityKind::Event, local_id) else {
                    return unresolved_delete(target, creates_still_pending);
                };
                let result = backend.delete_event(&backend_id).await;
                self.finish_delete(result, mappings, EntityKind::Event, local_id)
            }

            // ===== GEOFENCES =====
            Operation::CreateGeofence(payload) => {
                let mut geofence = match self.store.get::<GeofenceLocal>(target) {
                    Ok(Some(geofence)) => geofence,
                    Ok(None) => return Outcome::Obsolete("geofence no longer exists".into()),
                    Err(err) => return Outcome::Failed(err.to_string()),
                };
                if geofence.is_synced() {
                    return Outcome::Done;
                }
                let (entry, exit) = match resolve_geofence_event_types(
                    mappings,
                    payload.event_type_entry_id_local.as_deref(),
                    payload.event_type_exit_id_local.as_deref(),
                ) {
                    Some(resolved) => resolved,
                    None => return Outcome::Skipped("entry/exit event type not synced yet".into()),
                };
                match backend
                    .create_geofence(&payload.to_request(entry, exit), key)
                    .await
                {
                    Ok(remote) => {
                        geofence.backend_id = Some(remote.id);
                        match self.store.upsert(geofence) {
                            Ok(()) => Outcome::Done,
                            Err(err) => Outcome::Failed(err.to_string()),
                        }
                    }
                    Err(err) => err.into(),
                }
            }
            Operation::UpdateGeofence(payload) => {
                let geofence = match self.store.get::<GeofenceLocal>(target) {
                    Ok(Some(geofence)) => geofence,
                    Ok(None) => return Outcome::Obsolete("geofence no longer exists".into()),
                    Err(err) => return Outcome::Failed(err.to_string()),
                };
                let Some(backend_id) = geofence.backend_id else {
                    return Outcome::Skipped("geofence not synced yet".into());
                };
                let (entry, exit) = match resolve_geofence_event_types(
                    mappings,
                    payload.event_type_entry_id_local.as_deref(),
                    payload.event_type_exit_id_local.as_deref(),
                ) {
                    Some(resolved) => resolved,
                    None => return Outcome::Skipped("entry/exit event type not synced yet".into()),
                };
                match backend
                    .update_geofence(&backend_id, &payload.to_request(entry, exit))
                    .await
                {
                    Ok(_) => Outcome::Done,
                    Err(err) => err.into(),
                }
            }
            Operation::DeleteGeofence { backend_id } => {
                let Some(backend_id) = backend_id else {
                    return unresolved_delete(target, creates_still_pending);
                };
                match backend.delete_geofence(&backend_id).await {
                    Ok(()) => Outcome::Done,
                    Err(err) if err.is_not_found() => Outcome::Done,
                    Err(err) => err.into(),
                }
            }
        }
    }

    /// An update whose target has no backend id: obsolete once the target is gone,
    /// otherwise wait for its create.
    fn unresolved_update<T: native_db::ToInput>(&self, target: &str) -> Outcome {
        match self.store.get::<T>(target) {
            Ok(Some(_)) => Outcome::Skipped("target not synced yet".into()),
            Ok(None) => Outcome::Obsolete("target no longer exists".into()),
            Err(err) => Outcome::Failed(err.to_string()),
        }
    }

    fn finish_delete(
        &self,
        result: Result<(), ApiError>,
        mappings: &mut IdMappings,
        kind: EntityKind,
        local_id: Option<LocalId>,
    ) -> Outcome {
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() || err.is_conflict() => {}
            Err(err) => return Outcome::Failed(err.to_string()),
        }
        if let (Some(mapping), Some(local_id)) = (mappings.for_kind_mut(kind), local_id) {
            mapping.remove_mapping(&local_id);
        }
        Outcome::Done
    }
}

fn mapped(mappings: &IdMappings, kind: EntityKind, local_id: Option<LocalId>) -> Option<String> {
    let local_id = local_id?;
    mappings
        .for_kind(kind)?
        .backend_id(&local_id)
        .map(str::to_string)
}

/// A delete with nothing to address on the backend. It only has to wait if an earlier
/// create for the same entity is still queued.
fn unresolved_delete(target: &str, creates_still_pending: &HashSet<String>) -> Outcome {
    if creates_still_pending.contains(target) {
        Outcome::Skipped("create for the same entity still pending".into())
    } else {
        Outcome::Obsolete("entity never reached the backend".into())
    }
}

/// Resolves optional entry/exit event type references. `None` when a referenced type is
/// not mapped yet.
fn resolve_geofence_event_types(
    mappings: &IdMappings,
    entry_local: Option<&str>,
    exit_local: Option<&str>,
) -> Option<(Option<String>, Option<String>)> {
    let resolve = |local: Option<&str>| -> Option<Option<String>> {
        match local {
            None => Some(None),
            Some(local) => mappings.event_type_backend_id(local).map(Some),
        }
    };
    Some((resolve(entry_local)?, resolve(exit_local)?))
}
