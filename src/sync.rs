use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::client::Backend;
use crate::config::SyncConfig;
use crate::id_mapping::IdMappings;
use crate::models::{
    BatchCreateEventsRequest, CreateEventRequest, EntityKind, EventLocal, EventPayload,
    EventTypeLocal, EventTypePayload, GeofenceLocal, GeofencePayload, LocalId, Operation,
    QueuedOperationLocal, Syncable,
};
use crate::queue::{DrainReport, MutationQueue};
use crate::reconcile::{PendingDeletes, ReconcileReport, Reconciler, RemoteSnapshot};
use crate::storage::LocalStore;

// ===== STATE =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Draining,
    Uploading,
    Downloading,
    Reconciling,
}

impl SyncPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SyncPhase::Draining => "Sending pending changes",
            SyncPhase::Uploading => "Uploading new records",
            SyncPhase::Downloading => "Downloading from server",
            SyncPhase::Reconciling => "Reconciling local data",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Idle,
    Syncing {
        phase: SyncPhase,
        progress: SyncProgress,
    },
    Error(String),
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::Syncing { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub event_types_created: usize,
    pub geofences_created: usize,
    pub events_created: usize,
    /// Creates the backend rejected as duplicates; reconciliation links them.
    pub conflicts: usize,
    pub failed: usize,
    /// Entities whose references are not synced yet.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub drain: DrainReport,
    pub upload: UploadReport,
    pub reconcile: ReconcileReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ===== NOTIFICATIONS =====

/// Hook for whoever wants to hear about sync progress. Implementations must return quickly.
pub trait SyncNotifier: Send + Sync {
    fn phase_completed(&self, _phase: SyncPhase) {}
    fn sync_completed(&self, _summary: &SyncSummary) {}
    fn sync_failed(&self, _error: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SyncNotifier for NoopNotifier {}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl SyncNotifier for TracingNotifier {
    fn phase_completed(&self, phase: SyncPhase) {
        tracing::debug!(phase = ?phase, "Sync phase completed");
    }

    fn sync_completed(&self, summary: &SyncSummary) {
        tracing::info!(
            drained = summary.drain.succeeded,
            uploaded = summary.upload.event_types_created
                + summary.upload.geofences_created
                + summary.upload.events_created,
            local_writes = summary.reconcile.writes(),
            "Sync completed"
        );
    }

    fn sync_failed(&self, error: &str) {
        tracing::error!(error, "Sync failed");
    }
}

// ===== ENGINE =====

/// Offline-first sync engine. Cloning is cheap; all clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    backend: Arc<dyn Backend>,
    store: Arc<LocalStore>,
    queue: MutationQueue,
    config: SyncConfig,
    notifier: Arc<dyn SyncNotifier>,
    mappings: Mutex<IdMappings>,
    running: AtomicBool,
    online: AtomicBool,
    state: watch::Sender<SyncState>,
    last_synced_at: watch::Sender<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &*self.inner.state.borrow())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    /// Builds an engine over `store`, loading the persisted id mappings.
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<LocalStore>,
        config: SyncConfig,
        notifier: Arc<dyn SyncNotifier>,
    ) -> Result<Self> {
        let mappings = IdMappings::load_all(&store).context("Failed to load id mappings")?;
        let queue = MutationQueue::new(store.clone(), config.max_queue_attempts);
        let (state, _) = watch::channel(SyncState::Idle);
        let (last_synced_at, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(EngineInner {
                backend,
                store,
                queue,
                config,
                notifier,
                mappings: Mutex::new(mappings),
                running: AtomicBool::new(false),
                online: AtomicBool::new(true),
                state,
                last_synced_at,
            }),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    pub fn progress(&self) -> Option<(SyncPhase, SyncProgress)> {
        match &*self.inner.state.borrow() {
            SyncState::Syncing { phase, progress } => Some((*phase, *progress)),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_synced_at.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Backend id for a local entity. Geofences read it from the entity itself.
    pub async fn backend_id(&self, kind: EntityKind, id_local: &str) -> Result<Option<String>> {
        if kind == EntityKind::Geofence {
            return Ok(self
                .inner
                .store
                .get::<GeofenceLocal>(id_local)?
                .and_then(|g| g.backend_id));
        }
        let Ok(local_id) = id_local.parse::<LocalId>() else {
            return Ok(None);
        };
        let mappings = self.inner.mappings.lock().await;
        Ok(mappings
            .for_kind(kind)
            .and_then(|m| m.backend_id(&local_id))
            .map(str::to_string))
    }

    pub async fn local_id(&self, kind: EntityKind, backend_id: &str) -> Result<Option<String>> {
        if kind == EntityKind::Geofence {
            return Ok(self
                .inner
                .store
                .find_geofence_by_backend_id(backend_id)?
                .map(|g| g.id_local));
        }
        let mappings = self.inner.mappings.lock().await;
        Ok(mappings
            .for_kind(kind)
            .and_then(|m| m.local_id(backend_id))
            .map(|id| id.to_string()))
    }

    // ===== LOCAL MUTATIONS =====

    /// Durably queues a mutation, then kicks off a background sync when online.
    pub fn enqueue(&self, operation: Operation, entity_id_local: &str) -> Result<QueuedOperationLocal> {
        let queued = self.inner.queue.enqueue(&operation, entity_id_local)?;
        if self.inner.config.sync_on_enqueue && self.is_online() && !self.is_running() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let engine = self.clone();
                handle.spawn(async move {
                    if let Err(e) = engine.perform_full_sync().await {
                        tracing::warn!("Background sync after enqueue failed: {:#}", e);
                    }
                });
            }
        }
        Ok(queued)
    }

    /// Writes an event type locally and queues its create or update.
    pub fn save_event_type(&self, event_type: EventTypeLocal) -> Result<QueuedOperationLocal> {
        let exists = self
            .inner
            .store
            .get::<EventTypeLocal>(&event_type.id_local)?
            .is_some();
        let payload = EventTypePayload::from(&event_type);
        let id_local = event_type.id_local.clone();
        self.inner.store.upsert(event_type)?;
        let operation = if exists {
            Operation::UpdateEventType(payload)
        } else {
            Operation::CreateEventType(payload)
        };
        self.enqueue(operation, &id_local)
    }

    /// Removes an event type locally and queues the backend delete. Returns whether it existed.
    pub fn delete_event_type(&self, id_local: &str) -> Result<bool> {
        if self.inner.store.remove::<EventTypeLocal>(id_local)?.is_none() {
            return Ok(false);
        }
        self.enqueue(Operation::DeleteEventType, id_local)?;
        Ok(true)
    }

    pub fn save_event(&self, event: EventLocal) -> Result<QueuedOperationLocal> {
        let exists = self
            .inner
            .store
            .get::<EventLocal>(&event.id_local)?
            .is_some();
        let payload = EventPayload::from_local(&event)
            .with_context(|| format!("Event {} has unreadable properties", event.id_local))?;
        let id_local = event.id_local.clone();
        self.inner.store.upsert(event)?;
        let operation = if exists {
            Operation::UpdateEvent(payload)
        } else {
            Operation::CreateEvent(payload)
        };
        self.enqueue(operation, &id_local)
    }

    pub fn delete_event(&self, id_local: &str) -> Result<bool> {
        if self.inner.store.remove::<EventLocal>(id_local)?.is_none() {
            return Ok(false);
        }
        self.enqueue(Operation::DeleteEvent, id_local)?;
        Ok(true)
    }

    pub fn save_geofence(&self, geofence: GeofenceLocal) -> Result<QueuedOperationLocal> {
        let exists = self
            .inner
            .store
            .get::<GeofenceLocal>(&geofence.id_local)?
            .is_some();
        let payload = GeofencePayload::from(&geofence);
        let id_local = geofence.id_local.clone();
        self.inner.store.upsert(geofence)?;
        let operation = if exists {
            Operation::UpdateGeofence(payload)
        } else {
            Operation::CreateGeofence(payload)
        };
        self.enqueue(operation, &id_local)
    }

    /// Removes a geofence locally. The queued delete carries the backend id, since the
    /// row holding it is gone by the time the queue drains.
    pub fn delete_geofence(&self, id_local: &str) -> Result<bool> {
        let Some(removed) = self.inner.store.remove::<GeofenceLocal>(id_local)? else {
            return Ok(false);
        };
        self.enqueue(
            Operation::DeleteGeofence {
                backend_id: removed.backend_id,
            },
            id_local,
        )?;
        Ok(true)
    }

    // ===== SYNC =====

    /// User-initiated sync. Same rules as [`perform_full_sync`](Self::perform_full_sync).
    pub async fn manual_sync(&self) -> Result<Option<SyncSummary>> {
        tracing::info!("Manual sync requested");
        self.perform_full_sync().await
    }

    /// Sends queued mutations without uploading or downloading anything else.
    /// Skipped under the same conditions as a full sync.
    pub async fn drain_queue(&self) -> Result<Option<DrainReport>> {
        if !self.is_online() {
            return Ok(None);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = RunGuard(&self.inner.running);

        let mut mappings = self.inner.mappings.lock().await;
        let report = self
            .inner
            .queue
            .drain(&*self.inner.backend, &mut mappings)
            .await;
        mappings.save_all(&self.inner.store)?;
        Ok(Some(report?))
    }

    /// Runs drain, upload, download and reconcile.
    ///
    /// Returns `Ok(None)` without doing anything when offline or when another run is
    /// in progress. A phase-fatal error moves the state to `Error` and is returned.
    pub async fn perform_full_sync(&self) -> Result<Option<SyncSummary>> {
        if !self.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(None);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress, skipping");
            return Ok(None);
        }
        let _guard = RunGuard(&self.inner.running);

        match self.run_phases().await {
            Ok(summary) => {
                self.inner.state.send_replace(SyncState::Idle);
                self.inner
                    .last_synced_at
                    .send_replace(Some(summary.finished_at));
                self.inner.notifier.sync_completed(&summary);
                Ok(Some(summary))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.inner
                    .state
                    .send_replace(SyncState::Error(message.clone()));
                self.inner.notifier.sync_failed(&message);
                Err(e)
            }
        }
    }

    async fn run_phases(&self) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let store = &*self.inner.store;
        let mut mappings = self.inner.mappings.lock().await;

        // Drain never aborts the run; a broken queue table is logged and the
        // remaining phases still bring local data up to date.
        let pending = self.inner.queue.len().unwrap_or(0);
        self.publish(SyncPhase::Draining, 0, pending);
        let drain = match self
            .inner
            .queue
            .drain(&*self.inner.backend, &mut mappings)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Queue drain failed: {:#}", e);
                DrainReport::default()
            }
        };
        mappings.save_all(store)?;
        self.inner.notifier.phase_completed(SyncPhase::Draining);

        let upload = self.upload_unsynced(&mut mappings).await;
        mappings.save_all(store)?;
        let upload = upload?;
        self.inner.notifier.phase_completed(SyncPhase::Uploading);

        let snapshot = self.download().await?;
        self.inner.notifier.phase_completed(SyncPhase::Downloading);

        self.publish(SyncPhase::Reconciling, 0, 1);
        let pending_deletes = PendingDeletes {
            event_types: self.inner.queue.pending_deletes(EntityKind::EventType)?,
            events: self.inner.queue.pending_deletes(EntityKind::Event)?,
            geofences: self.inner.queue.pending_geofence_deletes()?,
        };
        let reconcile = Reconciler::new(store, &mut mappings, self.inner.config.tolerances)
            .reconcile_all(&snapshot, &pending_deletes);
        mappings.save_all(store)?;
        let reconcile = reconcile.context("Reconciliation failed")?;
        self.publish(SyncPhase::Reconciling, 1, 1);
        self.inner.notifier.phase_completed(SyncPhase::Reconciling);

        Ok(SyncSummary {
            drain,
            upload,
            reconcile,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn publish(&self, phase: SyncPhase, completed: usize, total: usize) {
        self.inner.state.send_replace(SyncState::Syncing {
            phase,
            progress: SyncProgress { completed, total },
        });
    }

    /// Creates every local entity that has no backend id yet: event types, then
    /// geofences, then events in batches.
    async fn upload_unsynced(&self, mappings: &mut IdMappings) -> Result<UploadReport> {
        let store = &*self.inner.store;
        let backend = &*self.inner.backend;
        let mut report = UploadReport::default();

        let event_types: Vec<EventTypeLocal> = store
            .event_types()?
            .into_iter()
            .filter(|local| {
                local
                    .local_id()
                    .map_or(false, |id| mappings.event_types.backend_id(&id).is_none())
            })
            .collect();
        let geofences: Vec<GeofenceLocal> = store
            .geofences()?
            .into_iter()
            .filter(|local| !local.is_synced())
            .collect();
        let total = event_types.len() + geofences.len();
        let mut completed = 0;
        self.publish(SyncPhase::Uploading, completed, total);

        for local in event_types {
            let Some(local_id) = local.local_id() else {
                continue;
            };
            match backend
                .create_event_type(&(&local).into(), Some(&local.id_local))
                .await
            {
                Ok(remote) => {
                    tracing::debug!(kind = "event_type", id_local = %local.id_local, backend_id = %remote.id, "Uploaded event type");
                    mappings.event_types.set_mapping(local_id, remote.id);
                    report.event_types_created += 1;
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(kind = "event_type", id_local = %local.id_local, "Event type already exists on backend, leaving it to reconciliation");
                    report.conflicts += 1;
                }
                Err(e) => {
                    tracing::warn!(kind = "event_type", id_local = %local.id_local, error = %e, "Failed to upload event type");
                    report.failed += 1;
                }
            }
            completed += 1;
            self.publish(SyncPhase::Uploading, completed, total);
        }

        for mut local in geofences {
            let payload = GeofencePayload::from(&local);
            let entry = resolve_reference(mappings, payload.event_type_entry_id_local.as_deref());
            let exit = resolve_reference(mappings, payload.event_type_exit_id_local.as_deref());
            let (Some(entry), Some(exit)) = (entry, exit) else {
                tracing::debug!(kind = "geofence", id_local = %local.id_local, "Geofence references an unsynced event type, skipping");
                report.skipped += 1;
                completed += 1;
                continue;
            };
            match backend
                .create_geofence(&payload.to_request(entry, exit), Some(&local.id_local))
                .await
            {
                Ok(remote) => {
                    tracing::debug!(kind = "geofence", id_local = %local.id_local, backend_id = %remote.id, "Uploaded geofence");
                    local.backend_id = Some(remote.id);
                    store.upsert(local)?;
                    report.geofences_created += 1;
                }
                Err(e) if e.is_conflict() => report.conflicts += 1,
                Err(e) => {
                    tracing::warn!(kind = "geofence", id_local = %local.id_local, error = %e, "Failed to upload geofence");
                    report.failed += 1;
                }
            }
            completed += 1;
            self.publish(SyncPhase::Uploading, completed, total);
        }

        // Batch items carry no idempotency key, so an event whose keyed create is
        // still queued belongs to the drain. Reconcile links it if that create landed.
        let queued_creates = self.inner.queue.pending_creates(EntityKind::Event)?;
        let mut pending_events: Vec<(EventLocal, CreateEventRequest)> = Vec::new();
        for local in store.events()? {
            let Some(local_id) = local.local_id() else {
                continue;
            };
            if mappings.events.backend_id(&local_id).is_some() {
                continue;
            }
            if queued_creates.contains(&local.id_local) {
                tracing::debug!(kind = "event", id_local = %local.id_local, "Event create still queued, leaving it to the drain");
                report.skipped += 1;
                continue;
            }
            let Some(event_type_id) = mappings.event_type_backend_id(&local.event_type_id_local)
            else {
                report.skipped += 1;
                continue;
            };
            match EventPayload::from_local(&local) {
                Ok(payload) => {
                    let request = payload.to_request(event_type_id);
                    pending_events.push((local, request));
                }
                Err(e) => {
                    tracing::warn!(kind = "event", id_local = %local.id_local, error = %e, "Event has unreadable properties, skipping upload");
                    report.skipped += 1;
                }
            }
        }

        let batch_size = self.inner.config.event_batch_size.max(1);
        let batches = pending_events.len().div_ceil(batch_size);
        for (index, chunk) in pending_events.chunks(batch_size).enumerate() {
            self.publish(SyncPhase::Uploading, index, batches);
            let request = BatchCreateEventsRequest {
                events: chunk.iter().map(|(_, request)| request.clone()).collect(),
            };
            match backend.create_events_batch(&request).await {
                Ok(response) => {
                    let failed: std::collections::HashSet<usize> =
                        response.errors.iter().map(|e| e.index).collect();
                    for error in &response.errors {
                        if let Some((local, _)) = chunk.get(error.index) {
                            tracing::warn!(kind = "event", id_local = %local.id_local, error = %error.message, "Backend rejected event in batch");
                        }
                    }
                    report.failed += failed.len();

                    let linked = match_batch_results(
                        chunk,
                        &failed,
                        &response.created,
                        self.inner.config.tolerances.event_timestamp,
                    );
                    for (position, backend_id) in linked {
                        if let Some(local_id) = chunk[position].0.local_id() {
                            mappings.events.set_mapping(local_id, backend_id);
                            report.events_created += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(batch = index, size = chunk.len(), error = %e, "Event batch upload failed");
                    report.failed += chunk.len();
                }
            }
        }
        if batches > 0 {
            self.publish(SyncPhase::Uploading, batches, batches);
        }

        Ok(report)
    }

    async fn download(&self) -> Result<RemoteSnapshot> {
        let backend = &*self.inner.backend;
        self.publish(SyncPhase::Downloading, 0, 3);

        let event_types = backend
            .list_event_types()
            .await
            .context("Failed to download event types")?;
        self.publish(SyncPhase::Downloading, 1, 3);

        let geofences = backend
            .list_geofences()
            .await
            .context("Failed to download geofences")?;
        self.publish(SyncPhase::Downloading, 2, 3);

        let events = backend
            .fetch_all_events()
            .await
            .context("Failed to download events")?;
        self.publish(SyncPhase::Downloading, 3, 3);

        tracing::info!(
            event_types = event_types.len(),
            geofences = geofences.len(),
            events = events.len(),
            "Downloaded backend snapshot"
        );
        Ok(RemoteSnapshot {
            event_types,
            geofences,
            events,
        })
    }
}

/// `Some(None)` for no reference, `Some(Some(id))` when resolved, `None` when unsynced.
fn resolve_reference(mappings: &IdMappings, local: Option<&str>) -> Option<Option<String>> {
    match local {
        None => Some(None),
        Some(local) => mappings.event_type_backend_id(local).map(Some),
    }
}

/// Pairs created batch events with the chunk entries they came from.
///
/// Entries listed in the error indices are never matched. Each created event claims
/// the unclaimed entry with the same event type and the nearest timestamp within
/// `tolerance`. Returns `(chunk position, backend id)` pairs.
pub fn match_batch_results(
    chunk: &[(EventLocal, CreateEventRequest)],
    failed_indices: &std::collections::HashSet<usize>,
    created: &[crate::models::Event],
    tolerance: std::time::Duration,
) -> Vec<(usize, String)> {
    let tolerance_ms = tolerance.as_millis() as i64;
    let mut claimed = vec![false; chunk.len()];
    let mut linked = Vec::new();

    for remote in created {
        let best = chunk
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed[*i] && !failed_indices.contains(i))
            .filter(|(_, (_, request))| request.event_type_id == remote.event_type_id)
            .map(|(i, (_, request))| {
                (
                    (request.timestamp - remote.timestamp).num_milliseconds().abs(),
                    i,
                )
            })
            .filter(|(delta, _)| *delta <= tolerance_ms)
            .min();
        if let Some((_, position)) = best {
            claimed[position] = true;
            linked.push((position, remote.id.clone()));
        }
    }
    linked
}
