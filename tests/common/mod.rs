#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use trendy_sync::client::Backend;
use trendy_sync::config::SyncConfig;
use trendy_sync::error::{ApiError, ApiResult};
use trendy_sync::models::{
    BatchCreateEventsRequest, BatchCreateEventsResponse, BatchError, CreateEventRequest,
    CreateEventTypeRequest, CreateGeofenceRequest, Event, EventType, Geofence, SourceType,
    UpdateEventRequest, UpdateEventTypeRequest, UpdateGeofenceRequest,
};
use trendy_sync::storage::LocalStore;
use trendy_sync::sync::{NoopNotifier, SyncEngine};

/// In-memory backend with the same duplicate and idempotency rules as the real API.
#[derive(Default)]
pub struct FakeState {
    pub event_types: Vec<EventType>,
    pub events: Vec<Event>,
    pub geofences: Vec<Geofence>,
    /// Ids handed out to creates, in order, before falling back to generated ones.
    pub assigned_ids: VecDeque<String>,
    pub calls: Vec<String>,
    pub idempotency_keys: Vec<String>,
    idempotent_results: HashMap<String, String>,
    next_id: usize,
    /// When set, every create fails with this HTTP status.
    pub fail_creates: Option<u16>,
    /// When set, batch uploads fail with this HTTP status.
    pub fail_batches: Option<u16>,
    /// When set, deletes fail with this HTTP status.
    pub fail_deletes: Option<u16>,
    /// When set, list calls fail with this HTTP status.
    pub fail_lists: Option<u16>,
    /// Events in a batch whose notes equal this value are rejected.
    pub reject_notes: Option<String>,
    /// Delay applied to list calls.
    pub list_delay: Option<Duration>,
    /// Number of upcoming single creates that are stored but answered with a
    /// transport error, as if the response never arrived.
    pub lost_create_responses: usize,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        if let Some(id) = self.assigned_ids.pop_front() {
            return id;
        }
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    /// Records the key and returns the id a previous create with it produced.
    fn replay(&mut self, idempotency_key: Option<&str>) -> Option<String> {
        let key = idempotency_key?;
        self.idempotency_keys.push(key.to_string());
        self.idempotent_results.get(key).cloned()
    }

    fn remember(&mut self, idempotency_key: Option<&str>, id: &str) {
        if let Some(key) = idempotency_key {
            self.idempotent_results.insert(key.to_string(), id.to_string());
        }
    }

    /// Answers a stored create, dropping the response if one is due to be lost.
    fn respond<T>(&mut self, created: T) -> ApiResult<T> {
        if self.lost_create_responses > 0 {
            self.lost_create_responses -= 1;
            return Err(ApiError::Transport("connection reset by peer".into()));
        }
        Ok(created)
    }
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: impl Into<String>) {
        self.state().calls.push(call.into());
    }

    async fn list_pause(&self) -> ApiResult<()> {
        let (delay, failure) = {
            let state = self.state();
            (state.list_delay, state.fail_lists)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(status) => Err(ApiError::HttpStatus { status }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn list_event_types(&self) -> ApiResult<Vec<EventType>> {
        self.record("list_event_types");
        self.list_pause().await?;
        Ok(self.state().event_types.clone())
    }

    async fn create_event_type(
        &self,
        request: &CreateEventTypeRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<EventType> {
        self.record(format!("create_event_type:{}", request.name));
        let mut state = self.state();
        if let Some(status) = state.fail_creates {
            return Err(ApiError::HttpStatus { status });
        }
        if let Some(existing) = state.replay(idempotency_key) {
            if let Some(et) = state.event_types.iter().find(|et| et.id == existing) {
                return Ok(et.clone());
            }
        }
        if state
            .event_types
            .iter()
            .any(|et| et.name.to_lowercase() == request.name.to_lowercase())
        {
            return Err(ApiError::Conflict(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        let created = EventType {
            id: state.next_id("et"),
            name: request.name.clone(),
            color: request.color.clone(),
            icon: request.icon.clone(),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        state.remember(idempotency_key, &created.id);
        state.event_types.push(created.clone());
        state.respond(created)
    }

    async fn update_event_type(
        &self,
        id: &str,
        request: &UpdateEventTypeRequest,
    ) -> ApiResult<EventType> {
        self.record(format!("update_event_type:{}", id));
        let mut state = self.state();
        let Some(et) = state.event_types.iter_mut().find(|et| et.id == id) else {
            return Err(ApiError::HttpStatus { status: 404 });
        };
        if let Some(name) = &request.name {
            et.name = name.clone();
        }
        if let Some(color) = &request.color {
            et.color = color.clone();
        }
        if let Some(icon) = &request.icon {
            et.icon = icon.clone();
        }
        Ok(et.clone())
    }

    async fn delete_event_type(&self, id: &str) -> ApiResult<()> {
        self.record(format!("delete_event_type:{}", id));
        let mut state = self.state();
        if let Some(status) = state.fail_deletes {
            return Err(ApiError::HttpStatus { status });
        }
        let before = state.event_types.len();
        state.event_types.retain(|et| et.id != id);
        if state.event_types.len() == before {
            return Err(ApiError::HttpStatus { status: 404 });
        }
        Ok(())
    }

    async fn fetch_all_events(&self) -> ApiResult<Vec<Event>> {
        self.record("fetch_all_events");
        self.list_pause().await?;
        Ok(self.state().events.clone())
    }

    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Event> {
        self.record("create_event");
        let mut state = self.state();
        if let Some(status) = state.fail_creates {
            return Err(ApiError::HttpStatus { status });
        }
        if let Some(existing) = state.replay(idempotency_key) {
            if let Some(event) = state.events.iter().find(|e| e.id == existing) {
                return Ok(event.clone());
            }
        }
        let id = state.next_id("ev");
        let created = event_from_request(id, request);
        state.remember(idempotency_key, &created.id);
        state.events.push(created.clone());
        state.respond(created)
    }

    async fn create_events_batch(
        &self,
        request: &BatchCreateEventsRequest,
    ) -> ApiResult<BatchCreateEventsResponse> {
        self.record(format!("create_events_batch:{}", request.events.len()));
        let mut state = self.state();
        if let Some(status) = state.fail_batches {
            return Err(ApiError::HttpStatus { status });
        }
        let mut response = BatchCreateEventsResponse {
            total: request.events.len(),
            ..Default::default()
        };
        for (index, item) in request.events.iter().enumerate() {
            if state.reject_notes.is_some() && item.notes == state.reject_notes {
                response.errors.push(BatchError {
                    index,
                    message: "rejected".into(),
                });
                continue;
            }
            let id = state.next_id("ev");
            let created = event_from_request(id, item);
            state.events.push(created.clone());
            response.created.push(created);
        }
        response.success = response.created.len();
        response.failed = response.errors.len();
        Ok(response)
    }

    async fn update_event(&self, id: &str, request: &UpdateEventRequest) -> ApiResult<Event> {
        self.record(format!("update_event:{}", id));
        let mut state = self.state();
        let Some(position) = state.events.iter().position(|e| e.id == id) else {
            return Err(ApiError::HttpStatus { status: 404 });
        };
        let updated = event_from_request(id.to_string(), request);
        state.events[position] = updated.clone();
        Ok(updated)
    }

    async fn delete_event(&self, id: &str) -> ApiResult<()> {
        self.record(format!("delete_event:{}", id));
        let mut state = self.state();
        if let Some(status) = state.fail_deletes {
            return Err(ApiError::HttpStatus { status });
        }
        let before = state.events.len();
        state.events.retain(|e| e.id != id);
        if state.events.len() == before {
            return Err(ApiError::HttpStatus { status: 404 });
        }
        Ok(())
    }

    async fn list_geofences(&self) -> ApiResult<Vec<Geofence>> {
        self.record("list_geofences");
        self.list_pause().await?;
        Ok(self.state().geofences.clone())
    }

    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Geofence> {
        self.record(format!("create_geofence:{}", request.name));
        let mut state = self.state();
        if let Some(status) = state.fail_creates {
            return Err(ApiError::HttpStatus { status });
        }
        if let Some(existing) = state.replay(idempotency_key) {
            if let Some(geofence) = state.geofences.iter().find(|g| g.id == existing) {
                return Ok(geofence.clone());
            }
        }
        let id = state.next_id("gf");
        let created = geofence_from_request(id, request);
        state.remember(idempotency_key, &created.id);
        state.geofences.push(created.clone());
        state.respond(created)
    }

    async fn update_geofence(
        &self,
        id: &str,
        request: &UpdateGeofenceRequest,
    ) -> ApiResult<Geofence> {
        self.record(format!("update_geofence:{}", id));
        let mut state = self.state();
        let Some(position) = state.geofences.iter().position(|g| g.id == id) else {
            return Err(ApiError::HttpStatus { status: 404 });
        };
        let updated = geofence_from_request(id.to_string(), request);
        state.geofences[position] = updated.clone();
        Ok(updated)
    }

    async fn delete_geofence(&self, id: &str) -> ApiResult<()> {
        self.record(format!("delete_geofence:{}", id));
        let mut state = self.state();
        if let Some(status) = state.fail_deletes {
            return Err(ApiError::HttpStatus { status });
        }
        let before = state.geofences.len();
        state.geofences.retain(|g| g.id != id);
        if state.geofences.len() == before {
            return Err(ApiError::HttpStatus { status: 404 });
        }
        Ok(())
    }
}

fn event_from_request(id: String, request: &CreateEventRequest) -> Event {
    Event {
        id,
        event_type_id: request.event_type_id.clone(),
        timestamp: request.timestamp,
        end_date: request.end_date,
        notes: request.notes.clone(),
        is_all_day: request.is_all_day,
        source_type: request.source_type,
        external_id: request.external_id.clone(),
        original_title: request.original_title.clone(),
        geofence_id: request.geofence_id.clone(),
        location_latitude: request.location_latitude,
        location_longitude: request.location_longitude,
        location_name: request.location_name.clone(),
        properties: request.properties.clone(),
    }
}

fn geofence_from_request(id: String, request: &CreateGeofenceRequest) -> Geofence {
    Geofence {
        id,
        name: request.name.clone(),
        latitude: request.latitude,
        longitude: request.longitude,
        radius: request.radius,
        event_type_entry_id: request.event_type_entry_id.clone(),
        event_type_exit_id: request.event_type_exit_id.clone(),
        is_active: request.is_active,
        notify_on_entry: request.notify_on_entry,
        notify_on_exit: request.notify_on_exit,
    }
}

// ===== FIXTURES =====

pub fn remote_event_type(id: &str, name: &str) -> EventType {
    EventType {
        id: id.into(),
        name: name.into(),
        color: "#6f4e37".into(),
        icon: "cup".into(),
        created_at: None,
        updated_at: None,
    }
}

pub fn remote_event(id: &str, event_type_id: &str, timestamp: DateTime<Utc>) -> Event {
    Event {
        id: id.into(),
        event_type_id: event_type_id.into(),
        timestamp,
        end_date: None,
        notes: None,
        is_all_day: false,
        source_type: SourceType::Manual,
        external_id: None,
        original_title: None,
        geofence_id: None,
        location_latitude: None,
        location_longitude: None,
        location_name: None,
        properties: Default::default(),
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        sync_on_enqueue: false,
        ..SyncConfig::default()
    }
}

/// Engine over an in-memory store, with background syncs on enqueue disabled.
pub fn engine_with(backend: Arc<FakeBackend>) -> SyncEngine {
    engine_with_config(backend, test_config())
}

pub fn engine_with_config(backend: Arc<FakeBackend>, config: SyncConfig) -> SyncEngine {
    let store = Arc::new(LocalStore::in_memory().expect("in-memory store"));
    SyncEngine::new(backend, store, config, Arc::new(NoopNotifier)).expect("engine")
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
