//! Reconciliation of the local store against a downloaded backend snapshot.
//!
//! The backend wins: every mapped entity is overwritten with the remote fields.
//! Unmapped remote records are first matched heuristically against unmapped local
//! entities, so a record created independently on both sides is linked rather than
//! duplicated. Local entities mapped to a backend id that is missing from the
//! snapshot are deleted; entities that never synced are left alone.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::config::MatchTolerances;
use crate::id_mapping::IdMappings;
use crate::models::{
    Event, EventLocal, EventType, EventTypeLocal, Geofence, GeofenceLocal, LocalId, Syncable,
};
use crate::storage::LocalStore;

/// Everything downloaded in one sync run.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub event_types: Vec<EventType>,
    pub geofences: Vec<Geofence>,
    pub events: Vec<Event>,
}

/// Entities with a queued delete. Event types and events are keyed by local id;
/// geofences by the backend id captured when the local row was removed.
#[derive(Debug, Clone, Default)]
pub struct PendingDeletes {
    pub event_types: HashSet<String>,
    pub events: HashSet<String>,
    pub geofences: HashSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub created: usize,
    pub linked: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: usize,
}

impl KindReport {
    pub fn writes(&self) -> usize {
        self.created + self.linked + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub event_types: KindReport,
    pub geofences: KindReport,
    pub events: KindReport,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.event_types.writes() + self.geofences.writes() + self.events.writes()
    }
}

// ===== MATCHING HEURISTICS =====

/// Case-insensitive name match. Ties go to the oldest local entity.
pub fn match_event_type<'a, I>(candidates: I, name: &str) -> Option<&'a EventTypeLocal>
where
    I: IntoIterator<Item = &'a EventTypeLocal>,
{
    candidates
        .into_iter()
        .filter(|local| local.matches_name(name))
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id_local.cmp(&b.id_local))
        })
}

/// Same event type and a timestamp within `tolerance`. The closest timestamp wins.
pub fn match_event<'a, I>(
    candidates: I,
    event_type_id_local: &str,
    timestamp: DateTime<Utc>,
    tolerance: std::time::Duration,
) -> Option<&'a EventLocal>
where
    I: IntoIterator<Item = &'a EventLocal>,
{
    let tolerance_ms = tolerance.as_millis() as i64;
    candidates
        .into_iter()
        .filter(|local| local.event_type_id_local == event_type_id_local)
        .map(|local| {
            let delta = (local.timestamp - timestamp).num_milliseconds().abs();
            (delta, local)
        })
        .filter(|(delta, _)| *delta <= tolerance_ms)
        .min_by(|(a, la), (b, lb)| a.cmp(b).then_with(|| la.id_local.cmp(&lb.id_local)))
        .map(|(_, local)| local)
}

/// Exact name and both coordinates within `tolerance_degrees`.
pub fn match_geofence<'a, I>(
    candidates: I,
    remote: &Geofence,
    tolerance_degrees: f64,
) -> Option<&'a GeofenceLocal>
where
    I: IntoIterator<Item = &'a GeofenceLocal>,
{
    // Float noise on values like 0.0001 must not push an exact-tolerance delta out.
    let limit = tolerance_degrees + 1e-9;
    candidates.into_iter().find(|local| {
        local.name == remote.name
            && (local.latitude - remote.latitude).abs() <= limit
            && (local.longitude - remote.longitude).abs() <= limit
    })
}

// ===== RECONCILER =====

pub struct Reconciler<'a> {
    store: &'a LocalStore,
    mappings: &'a mut IdMappings,
    tolerances: MatchTolerances,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a LocalStore, mappings: &'a mut IdMappings, tolerances: MatchTolerances) -> Self {
        Self {
            store,
            mappings,
            tolerances,
        }
    }

    /// Applies the whole snapshot. Event type orphans go last, once events that
    /// referenced them have had the chance to disappear.
    pub fn reconcile_all(
        &mut self,
        snapshot: &RemoteSnapshot,
        pending: &PendingDeletes,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            event_types: self.reconcile_event_types(&snapshot.event_types, &pending.event_types)?,
            geofences: self.reconcile_geofences(&snapshot.geofences, &pending.geofences)?,
            events: self.reconcile_events(&snapshot.events, &pending.events)?,
        };
        let (deleted, protected) =
            self.delete_orphan_event_types(&snapshot.event_types, &pending.event_types)?;
        report.event_types.deleted += deleted;
        report.event_types.skipped += protected;
        Ok(report)
    }

    // ===== EVENT TYPES =====

    pub fn reconcile_event_types(
        &mut self,
        remotes: &[EventType],
        pending_deletes: &HashSet<String>,
    ) -> Result<KindReport> {
        let mut report = KindReport::default();
        let mut locals: HashMap<String, EventTypeLocal> = self
            .store
            .event_types()?
            .into_iter()
            .map(|local| (local.id_local.clone(), local))
            .collect();

        for remote in remotes {
            if let Some(local_id) = self.mappings.event_types.local_id(&remote.id) {
                let key = local_id.to_string();
                if let Some(local) = locals.get_mut(&key) {
                    if local.apply_remote(remote) {
                        self.store.upsert(local.clone())?;
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    continue;
                }
                if pending_deletes.contains(&key) {
                    report.skipped += 1;
                    continue;
                }
                tracing::warn!(kind = "event_type", id_local = %key, backend_id = %remote.id, "Removing stale mapping to missing local entity");
                self.mappings.event_types.remove_mapping(&local_id);
            }

            let unmapped = locals.values().filter(|local| {
                local
                    .local_id()
                    .map_or(false, |id| self.mappings.event_types.backend_id(&id).is_none())
            });
            let matched = match_event_type(unmapped, &remote.name).map(|l| l.id_local.clone());

            match matched.and_then(|id| locals.get_mut(&id)) {
                Some(local) => {
                    let Some(local_id) = local.local_id() else {
                        continue;
                    };
                    tracing::info!(kind = "event_type", id_local = %local.id_local, backend_id = %remote.id, name = %remote.name, "Linked local event type by name");
                    self.mappings.event_types.set_mapping(local_id, remote.id.clone());
                    local.apply_remote(remote);
                    self.store.upsert(local.clone())?;
                    report.linked += 1;
                }
                None => {
                    let local = EventTypeLocal::from_remote(remote);
                    if let Some(local_id) = local.local_id() {
                        self.mappings.event_types.set_mapping(local_id, remote.id.clone());
                    }
                    self.store.upsert(local.clone())?;
                    locals.insert(local.id_local.clone(), local);
                    report.created += 1;
                }
            }
        }

        Ok(report)
    }

    /// Deletes mapped event types whose backend id vanished. Types still referenced by
    /// a local event are kept. Returns `(deleted, protected)`.
    pub fn delete_orphan_event_types(
        &mut self,
        remotes: &[EventType],
        pending_deletes: &HashSet<String>,
    ) -> Result<(usize, usize)> {
        let remote_ids: HashSet<&str> = remotes.iter().map(|r| r.id.as_str()).collect();
        let orphans: Vec<(LocalId, String)> = self
            .mappings
            .event_types
            .iter()
            .filter(|(_, backend)| !remote_ids.contains(backend))
            .map(|(local, backend)| (*local, backend.to_string()))
            .collect();

        let mut deleted = 0;
        let mut protected = 0;
        for (local_id, backend_id) in orphans {
            let key = local_id.to_string();
            if self.store.event_type_in_use(&key)? {
                tracing::warn!(kind = "event_type", id_local = %key, backend_id = %backend_id, "Keeping event type removed on backend because local events reference it");
                protected += 1;
                continue;
            }
            if self.store.remove::<EventTypeLocal>(&key)?.is_some() {
                tracing::info!(kind = "event_type", id_local = %key, backend_id = %backend_id, "Deleted event type removed on backend");
                deleted += 1;
            } else if pending_deletes.contains(&key) {
                continue;
            }
            self.mappings.event_types.remove_mapping(&local_id);
        }
        Ok((deleted, protected))
    }

    // ===== GEOFENCES =====

    pub fn reconcile_geofences(
        &mut self,
        remotes: &[Geofence],
        pending_deletes: &HashSet<String>,
    ) -> Result<KindReport> {
        let mut report = KindReport::default();
        let mut locals: HashMap<String, GeofenceLocal> = self
            .store
            .geofences()?
            .into_iter()
            .map(|local| (local.id_local.clone(), local))
            .collect();
        let mut by_backend: HashMap<String, String> = locals
            .values()
            .filter_map(|l| l.backend_id.clone().map(|b| (b, l.id_local.clone())))
            .collect();

        for remote in remotes {
            if pending_deletes.contains(&remote.id) && !by_backend.contains_key(&remote.id) {
                tracing::debug!(kind = "geofence", backend_id = %remote.id, "Geofence delete still queued, not restoring it");
                report.skipped += 1;
                continue;
            }
            let entry = remote
                .event_type_entry_id
                .as_deref()
                .and_then(|b| self.mappings.event_type_local_id(b));
            let exit = remote
                .event_type_exit_id
                .as_deref()
                .and_then(|b| self.mappings.event_type_local_id(b));

            let known = by_backend
                .get(&remote.id)
                .and_then(|id| locals.get_mut(id));
            if let Some(local) = known {
                if local.apply_remote(remote, entry, exit) {
                    self.store.upsert(local.clone())?;
                    report.updated += 1;
                } else {
                    report.unchanged += 1;
                }
                continue;
            }

            let unsynced = locals.values().filter(|l| !l.is_synced());
            let matched = match_geofence(
                unsynced,
                remote,
                self.tolerances.geofence_coordinate_degrees,
            )
            .map(|l| l.id_local.clone());

            match matched.and_then(|id| locals.get_mut(&id)) {
                Some(local) => {
                    tracing::info!(kind = "geofence", id_local = %local.id_local, backend_id = %remote.id, name = %remote.name, "Linked local geofence by name and position");
                    local.apply_remote(remote, entry, exit);
                    self.store.upsert(local.clone())?;
                    by_backend.insert(remote.id.clone(), local.id_local.clone());
                    report.linked += 1;
                }
                None => {
                    let mut local = GeofenceLocal::default();
                    local.apply_remote(remote, entry, exit);
                    self.store.upsert(local.clone())?;
                    by_backend.insert(remote.id.clone(), local.id_local.clone());
                    locals.insert(local.id_local.clone(), local);
                    report.created += 1;
                }
            }
        }

        let remote_ids: HashSet<&str> = remotes.iter().map(|r| r.id.as_str()).collect();
        for local in locals.values() {
            let Some(backend_id) = local.backend_id.as_deref() else {
                continue;
            };
            if remote_ids.contains(backend_id) {
                continue;
            }
            self.store.remove::<GeofenceLocal>(&local.id_local)?;
            tracing::info!(kind = "geofence", id_local = %local.id_local, backend_id = %backend_id, "Deleted geofence removed on backend");
            report.deleted += 1;
        }

        Ok(report)
    }

    // ===== EVENTS =====

    pub fn reconcile_events(
        &mut self,
        remotes: &[Event],
        pending_deletes: &HashSet<String>,
    ) -> Result<KindReport> {
        let mut report = KindReport::default();
        let mut locals: HashMap<String, EventLocal> = self
            .store
            .events()?
            .into_iter()
            .map(|local| (local.id_local.clone(), local))
            .collect();

        for remote in remotes {
            let Some(event_type_local) = self.mappings.event_type_local_id(&remote.event_type_id)
            else {
                tracing::warn!(kind = "event", backend_id = %remote.id, event_type_id = %remote.event_type_id, "Skipping event with unknown event type");
                report.skipped += 1;
                continue;
            };

            if let Some(local_id) = self.mappings.events.local_id(&remote.id) {
                let key = local_id.to_string();
                if let Some(local) = locals.get_mut(&key) {
                    match local.apply_remote(remote, &event_type_local) {
                        Ok(true) => {
                            self.store.upsert(local.clone())?;
                            report.updated += 1;
                        }
                        Ok(false) => report.unchanged += 1,
                        Err(err) => {
                            tracing::warn!(kind = "event", id_local = %key, backend_id = %remote.id, error = %err, "Failed to apply remote event");
                            report.skipped += 1;
                        }
                    }
                    continue;
                }
                if pending_deletes.contains(&key) {
                    report.skipped += 1;
                    continue;
                }
                tracing::warn!(kind = "event", id_local = %key, backend_id = %remote.id, "Removing stale mapping to missing local entity");
                self.mappings.events.remove_mapping(&local_id);
            }

            let unmapped = locals.values().filter(|local| {
                local
                    .local_id()
                    .map_or(false, |id| self.mappings.events.backend_id(&id).is_none())
            });
            let matched = match_event(
                unmapped,
                &event_type_local,
                remote.timestamp,
                self.tolerances.event_timestamp,
            )
            .map(|l| l.id_local.clone());

            match matched.and_then(|id| locals.get_mut(&id)) {
                Some(local) => {
                    let Some(local_id) = local.local_id() else {
                        continue;
                    };
                    if let Err(err) = local.apply_remote(remote, &event_type_local) {
                        tracing::warn!(kind = "event", id_local = %local.id_local, backend_id = %remote.id, error = %err, "Failed to apply remote event");
                        report.skipped += 1;
                        continue;
                    }
                    tracing::info!(kind = "event", id_local = %local.id_local, backend_id = %remote.id, "Linked local event by type and timestamp");
                    self.mappings.events.set_mapping(local_id, remote.id.clone());
                    self.store.upsert(local.clone())?;
                    report.linked += 1;
                }
                None => match EventLocal::from_remote(remote, &event_type_local) {
                    Ok(local) => {
                        if let Some(local_id) = local.local_id() {
                            self.mappings.events.set_mapping(local_id, remote.id.clone());
                        }
                        self.store.upsert(local.clone())?;
                        locals.insert(local.id_local.clone(), local);
                        report.created += 1;
                    }
                    Err(err) => {
                        tracing::warn!(kind = "event", backend_id = %remote.id, error = %err, "Failed to build local event");
                        report.skipped += 1;
                    }
                },
            }
        }

        let remote_ids: HashSet<&str> = remotes.iter().map(|r| r.id.as_str()).collect();
        let orphans: Vec<(LocalId, String)> = self
            .mappings
            .events
            .iter()
            .filter(|(_, backend)| !remote_ids.contains(backend))
            .map(|(local, backend)| (*local, backend.to_string()))
            .collect();
        for (local_id, backend_id) in orphans {
            let key = local_id.to_string();
            if locals.contains_key(&key) {
                self.store.remove::<EventLocal>(&key)?;
                tracing::info!(kind = "event", id_local = %key, backend_id = %backend_id, "Deleted event removed on backend");
                report.deleted += 1;
            } else if pending_deletes.contains(&key) {
                continue;
            }
            self.mappings.events.remove_mapping(&local_id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    fn event_type(name: &str) -> EventTypeLocal {
        EventTypeLocal::new(name.into(), "#000000".into(), "circle".into())
    }

    #[test]
    fn test_event_type_name_match_ignores_case() {
        let locals = vec![event_type("coffee"), event_type("Tea")];
        let matched = match_event_type(&locals, "Coffee").unwrap();
        assert_eq!(matched.name, "coffee");
        assert!(match_event_type(&locals, "Water").is_none());
    }

    #[test]
    fn test_event_match_window() {
        let et = LocalId::new();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let local = EventLocal::new(&et, base);
        let locals = vec![local];
        let window = Duration::from_secs(1);

        let later = base + ChronoDuration::milliseconds(500);
        let earlier = base - ChronoDuration::milliseconds(500);
        let too_far = base + ChronoDuration::seconds(2);
        assert!(match_event(&locals, &et.to_string(), later, window).is_some());
        assert!(match_event(&locals, &et.to_string(), earlier, window).is_some());
        assert!(match_event(&locals, &et.to_string(), too_far, window).is_none());
        assert!(match_event(&locals, &LocalId::new().to_string(), base, window).is_none());
    }

    #[test]
    fn test_event_match_prefers_closest() {
        let et = LocalId::new();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let far = EventLocal::new(&et, base + ChronoDuration::milliseconds(900));
        let near = EventLocal::new(&et, base + ChronoDuration::milliseconds(100));
        let locals = vec![far, near.clone()];

        let matched = match_event(&locals, &et.to_string(), base, Duration::from_secs(1)).unwrap();
        assert_eq!(matched.id_local, near.id_local);
    }

    #[test]
    fn test_geofence_match_needs_exact_name_and_close_position() {
        let local = GeofenceLocal::new("Office".into(), 47.60000, -122.30000, 100.0);
        let locals = vec![local];
        let mut remote = Geofence {
            id: "gf_1".into(),
            name: "Office".into(),
            latitude: 47.60005,
            longitude: -122.30005,
            radius: 100.0,
            event_type_entry_id: None,
            event_type_exit_id: None,
            is_active: true,
            notify_on_entry: false,
            notify_on_exit: false,
        };
        assert!(match_geofence(&locals, &remote, 0.0001).is_some());

        remote.name = "office".into();
        assert!(match_geofence(&locals, &remote, 0.0001).is_none());

        remote.name = "Office".into();
        remote.latitude = 47.6005;
        assert!(match_geofence(&locals, &remote, 0.0001).is_none());
    }

    #[test]
    fn test_event_types_reconcile_links_then_stays_quiet() {
        let store = LocalStore::in_memory().unwrap();
        let mut mappings = IdMappings::default();
        let local = event_type("coffee");
        store.upsert(local.clone()).unwrap();

        let remotes = vec![EventType {
            id: "et_999".into(),
            name: "Coffee".into(),
            color: "#6f4e37".into(),
            icon: "cup".into(),
            created_at: None,
            updated_at: None,
        }];

        let mut reconciler = Reconciler::new(&store, &mut mappings, MatchTolerances::default());
        let first = reconciler
            .reconcile_event_types(&remotes, &HashSet::new())
            .unwrap();
        assert_eq!(first.linked, 1);
        assert_eq!(first.created, 0);

        let second = reconciler
            .reconcile_event_types(&remotes, &HashSet::new())
            .unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 1);

        let stored = store.event_types().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Coffee");
        assert_eq!(
            mappings.event_types.local_id("et_999").map(|id| id.to_string()),
            Some(local.id_local)
        );
    }

    #[test]
    fn test_unsynced_geofence_survives_and_orphan_is_deleted() {
        let store = LocalStore::in_memory().unwrap();
        let mut mappings = IdMappings::default();
        let unsynced = GeofenceLocal::new("Gym".into(), 1.0, 1.0, 50.0);
        let mut orphan = GeofenceLocal::new("Old".into(), 2.0, 2.0, 50.0);
        orphan.backend_id = Some("gf_gone".into());
        store.upsert(unsynced.clone()).unwrap();
        store.upsert(orphan.clone()).unwrap();

        let mut reconciler = Reconciler::new(&store, &mut mappings, MatchTolerances::default());
        let report = reconciler
            .reconcile_geofences(&[], &HashSet::new())
            .unwrap();

        assert_eq!(report.deleted, 1);
        let remaining = store.geofences().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id_local, unsynced.id_local);
    }

    #[test]
    fn test_geofence_with_queued_delete_is_not_restored() {
        let store = LocalStore::in_memory().unwrap();
        let mut mappings = IdMappings::default();
        let remote = Geofence {
            id: "gf_1".into(),
            name: "Office".into(),
            latitude: 47.6,
            longitude: -122.3,
            radius: 100.0,
            event_type_entry_id: None,
            event_type_exit_id: None,
            is_active: true,
            notify_on_entry: false,
            notify_on_exit: false,
        };
        let pending: HashSet<String> = ["gf_1".to_string()].into_iter().collect();

        let mut reconciler = Reconciler::new(&store, &mut mappings, MatchTolerances::default());
        let report = reconciler
            .reconcile_geofences(std::slice::from_ref(&remote), &pending)
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.created, 0);
        assert!(store.geofences().unwrap().is_empty());

        let restored = reconciler
            .reconcile_geofences(std::slice::from_ref(&remote), &HashSet::new())
            .unwrap();
        assert_eq!(restored.created, 1);
    }
}
