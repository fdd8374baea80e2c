use chrono::{DateTime, Utc};
use native_db::{native_db, ToKey};
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::serde_helpers::{deserialize_empty_as_none, deserialize_null_default};

// ===== TRAITS =====

/// Implemented by every locally persisted entity that takes part in sync.
pub trait Syncable {
    fn kind() -> EntityKind;
    fn id_local(&self) -> &str;

    /// Parsed local id, `None` when the stored key is not a valid id.
    fn local_id(&self) -> Option<LocalId> {
        self.id_local().parse().ok()
    }
}

// ===== IDENTIFIERS =====

/// Process-local identifier assigned when an entity is first written locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl Serialize for LocalId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LocalId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ===== ENUMS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    EventType,
    Event,
    Geofence,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::EventType => "event_type",
            EntityKind::Event => "event",
            EntityKind::Geofence => "geofence",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event came from. Unknown wire values decode as `Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceType {
    #[default]
    Manual,
    HealthKit,
    Geofence,
    Imported,
}

impl From<&str> for SourceType {
    fn from(s: &str) -> Self {
        match s {
            "manual" => SourceType::Manual,
            "healthkit" => SourceType::HealthKit,
            "geofence" => SourceType::Geofence,
            "imported" => SourceType::Imported,
            _ => SourceType::Manual,
        }
    }
}

impl From<String> for SourceType {
    fn from(s: String) -> Self {
        SourceType::from(s.as_str())
    }
}

impl From<SourceType> for String {
    fn from(source: SourceType) -> Self {
        match source {
            SourceType::Manual => "manual",
            SourceType::HealthKit => "healthkit",
            SourceType::Geofence => "geofence",
            SourceType::Imported => "imported",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Text,
    Number,
    Boolean,
    Date,
    Select,
    Duration,
    Url,
    Email,
}

/// A typed custom property value as carried on the wire: `{"type": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    pub value: serde_json::Value,
}

impl PropertyValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            property_type: PropertyType::Text,
            value: serde_json::Value::String(value.into()),
        }
    }

    pub fn number(value: f64) -> Self {
        Self {
            property_type: PropertyType::Number,
            value: serde_json::json!(value),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            property_type: PropertyType::Boolean,
            value: serde_json::Value::Bool(value),
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

// ===== EVENT TYPE =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct EventTypeLocal {
    #[primary_key]
    pub id_local: String,
    pub name: String,
    pub color: String,
    pub icon: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEventTypeRequest {
    pub name: String,
    pub color: String,
    pub icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateEventTypeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Syncable for EventTypeLocal {
    fn kind() -> EntityKind {
        EntityKind::EventType
    }

    fn id_local(&self) -> &str {
        &self.id_local
    }
}

impl EventTypeLocal {
    pub fn new(name: String, color: String, icon: String) -> Self {
        let now = Utc::now();
        Self {
            id_local: LocalId::new().to_string(),
            name,
            color,
            icon,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds a fresh local entity for a backend record seen for the first time.
    pub fn from_remote(remote: &EventType) -> Self {
        let mut local = Self::new(remote.name.clone(), remote.color.clone(), remote.icon.clone());
        if let Some(created_at) = remote.created_at {
            local.created_at = created_at;
        }
        local
    }

    /// Overwrites every field the API carries. Returns whether anything changed.
    pub fn apply_remote(&mut self, remote: &EventType) -> bool {
        let changed =
            self.name != remote.name || self.color != remote.color || self.icon != remote.icon;
        if changed {
            self.name = remote.name.clone();
            self.color = remote.color.clone();
            self.icon = remote.icon.clone();
            self.updated_at = remote.updated_at.unwrap_or_else(Utc::now);
        }
        changed
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

impl From<&EventTypeLocal> for CreateEventTypeRequest {
    fn from(local: &EventTypeLocal) -> Self {
        Self {
            name: local.name.clone(),
            color: local.color.clone(),
            icon: local.icon.clone(),
        }
    }
}

// ===== EVENT =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct EventLocal {
    #[primary_key]
    pub id_local: String,
    pub event_type_id_local: String,
    pub timestamp: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub is_all_day: bool,
    pub source_type: SourceType,
    pub external_id: Option<String>,
    pub original_title: Option<String>,
    /// Backend geofence id, stored directly rather than through a mapping.
    pub geofence_id: Option<String>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub location_name: Option<String>,
    /// JSON encoded `Properties`
    pub properties_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_all_day: bool,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_empty_as_none"
    )]
    pub geofence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "deserialize_null_default"
    )]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub event_type_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub is_all_day: bool,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

/// `PUT /events/{id}` accepts the full create shape.
pub type UpdateEventRequest = CreateEventRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateEventsRequest {
    pub events: Vec<CreateEventRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateEventsResponse {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created: Vec<Event>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub errors: Vec<BatchError>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub success: usize,
    #[serde(default)]
    pub failed: usize,
}

impl Syncable for EventLocal {
    fn kind() -> EntityKind {
        EntityKind::Event
    }

    fn id_local(&self) -> &str {
        &self.id_local
    }
}

impl Default for EventLocal {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id_local: LocalId::new().to_string(),
            event_type_id_local: String::new(),
            timestamp: now,
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
            properties_json: "{}".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl EventLocal {
    pub fn new(event_type_id_local: &LocalId, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type_id_local: event_type_id_local.to_string(),
            timestamp,
            ..Self::default()
        }
    }

    pub fn properties(&self) -> serde_json::Result<Properties> {
        if self.properties_json.trim().is_empty() {
            return Ok(Properties::new());
        }
        serde_json::from_str(&self.properties_json)
    }

    pub fn set_properties(&mut self, properties: &Properties) -> serde_json::Result<()> {
        self.properties_json = serde_json::to_string(properties)?;
        Ok(())
    }

    /// Builds a fresh local entity for a backend event whose event type resolved to
    /// `event_type_id_local`.
    pub fn from_remote(remote: &Event, event_type_id_local: &str) -> serde_json::Result<Self> {
        let mut local = Self::default();
        local.apply_remote(remote, event_type_id_local)?;
        Ok(local)
    }

    /// Overwrites every field the API carries. Returns whether anything changed.
    pub fn apply_remote(
        &mut self,
        remote: &Event,
        event_type_id_local: &str,
    ) -> serde_json::Result<bool> {
        let properties_json = serde_json::to_string(&remote.properties)?;
        let changed = self.event_type_id_local != event_type_id_local
            || self.timestamp != remote.timestamp
            || self.end_date != remote.end_date
            || self.notes != remote.notes
            || self.is_all_day != remote.is_all_day
            || self.source_type != remote.source_type
            || self.external_id != remote.external_id
            || self.original_title != remote.original_title
            || self.geofence_id != remote.geofence_id
            || self.location_latitude != remote.location_latitude
            || self.location_longitude != remote.location_longitude
            || self.location_name != remote.location_name
            || self.properties_json != properties_json;

        if changed {
            self.event_type_id_local = event_type_id_local.to_string();
            self.timestamp = remote.timestamp;
            self.end_date = remote.end_date;
            self.notes = remote.notes.clone();
            self.is_all_day = remote.is_all_day;
            self.source_type = remote.source_type;
            self.external_id = remote.external_id.clone();
            self.original_title = remote.original_title.clone();
            self.geofence_id = remote.geofence_id.clone();
            self.location_latitude = remote.location_latitude;
            self.location_longitude = remote.location_longitude;
            self.location_name = remote.location_name.clone();
            self.properties_json = properties_json;
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }
}

// ===== GEOFENCE =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 3, version = 1)]
#[native_db]
pub struct GeofenceLocal {
    #[primary_key]
    pub id_local: String,
    /// Authoritative backend id, set once the geofence has been uploaded or linked.
    pub backend_id: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub event_type_entry_id_local: Option<String>,
    pub event_type_exit_id_local: Option<String>,
    pub is_active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_empty_as_none"
    )]
    pub event_type_entry_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_empty_as_none"
    )]
    pub event_type_exit_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_active: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub notify_on_entry: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub notify_on_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGeofenceRequest {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type_entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type_exit_id: Option<String>,
    pub is_active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

/// `PUT /geofences/{id}` accepts the full create shape.
pub type UpdateGeofenceRequest = CreateGeofenceRequest;

impl Syncable for GeofenceLocal {
    fn kind() -> EntityKind {
        EntityKind::Geofence
    }

    fn id_local(&self) -> &str {
        &self.id_local
    }
}

impl Default for GeofenceLocal {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id_local: LocalId::new().to_string(),
            backend_id: None,
            name: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            radius: 100.0,
            event_type_entry_id_local: None,
            event_type_exit_id_local: None,
            is_active: true,
            notify_on_entry: false,
            notify_on_exit: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl GeofenceLocal {
    pub fn new(name: String, latitude: f64, longitude: f64, radius: f64) -> Self {
        Self {
            name,
            latitude,
            longitude,
            radius,
            ..Self::default()
        }
    }

    pub fn is_synced(&self) -> bool {
        self.backend_id.is_some()
    }

    /// Overwrites every field the API carries. Entry/exit event types arrive already
    /// resolved to local ids. Returns whether anything changed.
    pub fn apply_remote(
        &mut self,
        remote: &Geofence,
        entry_local: Option<String>,
        exit_local: Option<String>,
    ) -> bool {
        let changed = self.backend_id.as_deref() != Some(remote.id.as_str())
            || self.name != remote.name
            || self.latitude != remote.latitude
            || self.longitude != remote.longitude
            || self.radius != remote.radius
            || self.event_type_entry_id_local != entry_local
            || self.event_type_exit_id_local != exit_local
            || self.is_active != remote.is_active
            || self.notify_on_entry != remote.notify_on_entry
            || self.notify_on_exit != remote.notify_on_exit;

        if changed {
            self.backend_id = Some(remote.id.clone());
            self.name = remote.name.clone();
            self.latitude = remote.latitude;
            self.longitude = remote.longitude;
            self.radius = remote.radius;
            self.event_type_entry_id_local = entry_local;
            self.event_type_exit_id_local = exit_local;
            self.is_active = remote.is_active;
            self.notify_on_entry = remote.notify_on_entry;
            self.notify_on_exit = remote.notify_on_exit;
            self.updated_at = Utc::now();
        }
        changed
    }
}

// ===== SYNC BOOKKEEPING =====

/// A pending mutation, persisted until the backend confirms it or attempts run out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 4, version = 1)]
#[native_db]
pub struct QueuedOperationLocal {
    #[primary_key]
    pub sequence: u64,
    pub kind: super::operation::OperationKind,
    pub entity_id_local: String,
    /// JSON encoded `Operation`
    pub payload: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Full local→backend snapshot of one entity kind's id mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 5, version = 1)]
#[native_db]
pub struct IdMappingSnapshot {
    #[primary_key]
    pub kind: String,
    pub entries: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
}
