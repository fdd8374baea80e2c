//! Typed queue operations.
//!
//! Every queued mutation is an [`Operation`]: a kind plus a kind-specific payload.
//! Payloads reference other entities by *local* id so that a mutation recorded
//! offline can be resolved against whatever mappings exist when the queue drains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::v1::{
    CreateEventRequest, CreateEventTypeRequest, CreateGeofenceRequest, EntityKind, EventLocal,
    EventTypeLocal, GeofenceLocal, Properties, SourceType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateEventType,
    UpdateEventType,
    DeleteEventType,
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    CreateGeofence,
    UpdateGeofence,
    DeleteGeofence,
}

impl OperationKind {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            OperationKind::CreateEventType
            | OperationKind::UpdateEventType
            | OperationKind::DeleteEventType => EntityKind::EventType,
            OperationKind::CreateEvent | OperationKind::UpdateEvent | OperationKind::DeleteEvent => {
                EntityKind::Event
            }
            OperationKind::CreateGeofence
            | OperationKind::UpdateGeofence
            | OperationKind::DeleteGeofence => EntityKind::Geofence,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            OperationKind::CreateEventType
                | OperationKind::CreateEvent
                | OperationKind::CreateGeofence
        )
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            OperationKind::DeleteEventType
                | OperationKind::DeleteEvent
                | OperationKind::DeleteGeofence
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateEventType => "create_event_type",
            OperationKind::UpdateEventType => "update_event_type",
            OperationKind::DeleteEventType => "delete_event_type",
            OperationKind::CreateEvent => "create_event",
            OperationKind::UpdateEvent => "update_event",
            OperationKind::DeleteEvent => "delete_event",
            OperationKind::CreateGeofence => "create_geofence",
            OperationKind::UpdateGeofence => "update_geofence",
            OperationKind::DeleteGeofence => "delete_geofence",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypePayload {
    pub name: String,
    pub color: String,
    pub icon: String,
}

impl From<&EventTypeLocal> for EventTypePayload {
    fn from(local: &EventTypeLocal) -> Self {
        Self {
            name: local.name.clone(),
            color: local.color.clone(),
            icon: local.icon.clone(),
        }
    }
}

impl From<&EventTypePayload> for CreateEventTypeRequest {
    fn from(payload: &EventTypePayload) -> Self {
        Self {
            name: payload.name.clone(),
            color: payload.color.clone(),
            icon: payload.icon.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type_id_local: String,
    pub timestamp: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub is_all_day: bool,
    pub source_type: SourceType,
    pub external_id: Option<String>,
    pub original_title: Option<String>,
    pub geofence_id: Option<String>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub location_name: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl EventPayload {
    pub fn from_local(local: &EventLocal) -> serde_json::Result<Self> {
        Ok(Self {
            event_type_id_local: local.event_type_id_local.clone(),
            timestamp: local.timestamp,
            end_date: local.end_date,
            notes: local.notes.clone(),
            is_all_day: local.is_all_day,
            source_type: local.source_type,
            external_id: local.external_id.clone(),
            original_title: local.original_title.clone(),
            geofence_id: local.geofence_id.clone(),
            location_latitude: local.location_latitude,
            location_longitude: local.location_longitude,
            location_name: local.location_name.clone(),
            properties: local.properties()?,
        })
    }

    /// Builds the wire request once the event type's backend id is known.
    pub fn to_request(&self, event_type_backend_id: String) -> CreateEventRequest {
        CreateEventRequest {
            event_type_id: event_type_backend_id,
            timestamp: self.timestamp,
            end_date: self.end_date,
            notes: self.notes.clone(),
            is_all_day: self.is_all_day,
            source_type: self.source_type,
            external_id: self.external_id.clone(),
            original_title: self.original_title.clone(),
            geofence_id: self.geofence_id.clone(),
            location_latitude: self.location_latitude,
            location_longitude: self.location_longitude,
            location_name: self.location_name.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofencePayload {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub event_type_entry_id_local: Option<String>,
    pub event_type_exit_id_local: Option<String>,
    pub is_active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

impl From<&GeofenceLocal> for GeofencePayload {
    fn from(local: &GeofenceLocal) -> Self {
        Self {
            name: local.name.clone(),
            latitude: local.latitude,
            longitude: local.longitude,
            radius: local.radius,
            event_type_entry_id_local: local.event_type_entry_id_local.clone(),
            event_type_exit_id_local: local.event_type_exit_id_local.clone(),
            is_active: local.is_active,
            notify_on_entry: local.notify_on_entry,
            notify_on_exit: local.notify_on_exit,
        }
    }
}

impl GeofencePayload {
    pub fn to_request(
        &self,
        entry_backend_id: Option<String>,
        exit_backend_id: Option<String>,
    ) -> CreateGeofenceRequest {
        CreateGeofenceRequest {
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            radius: self.radius,
            event_type_entry_id: entry_backend_id,
            event_type_exit_id: exit_backend_id,
            is_active: self.is_active,
            notify_on_entry: self.notify_on_entry,
            notify_on_exit: self.notify_on_exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    CreateEventType(EventTypePayload),
    UpdateEventType(EventTypePayload),
    DeleteEventType,
    CreateEvent(EventPayload),
    UpdateEvent(EventPayload),
    DeleteEvent,
    CreateGeofence(GeofencePayload),
    UpdateGeofence(GeofencePayload),
    /// Carries the backend id captured at delete time, since the local row is gone.
    DeleteGeofence { backend_id: Option<String> },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateEventType(_) => OperationKind::CreateEventType,
            Operation::UpdateEventType(_) => OperationKind::UpdateEventType,
            Operation::DeleteEventType => OperationKind::DeleteEventType,
            Operation::CreateEvent(_) => OperationKind::CreateEvent,
            Operation::UpdateEvent(_) => OperationKind::UpdateEvent,
            Operation::DeleteEvent => OperationKind::DeleteEvent,
            Operation::CreateGeofence(_) => OperationKind::CreateGeofence,
            Operation::UpdateGeofence(_) => OperationKind::UpdateGeofence,
            Operation::DeleteGeofence { .. } => OperationKind::DeleteGeofence,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}
