pub mod operation;
pub mod serde_helpers;
pub mod v1;

// ===== VERSIONED MODELS FOLLOWING NATIVE_DB PATTERN =====
// Following the pattern from the native_db documentation:
// https://docs.rs/native_db/latest/native_db/

pub mod data {
    // Type aliases pointing to the latest versions
    pub type EventTypeLocal = super::v1::EventTypeLocal;
    pub type EventLocal = super::v1::EventLocal;
    pub type GeofenceLocal = super::v1::GeofenceLocal;
    pub type QueuedOperationLocal = super::v1::QueuedOperationLocal;
    pub type IdMappingSnapshot = super::v1::IdMappingSnapshot;

    // Wire shapes are not persisted and are not versioned
    pub type EventType = super::v1::EventType;
    pub type Event = super::v1::Event;
    pub type Geofence = super::v1::Geofence;

    // Re-export versioned modules for direct access
    pub use super::v1;
}

pub use data::*;

// Re-export common traits, ids and enums shared across versions
pub use v1::{
    BatchCreateEventsRequest, BatchCreateEventsResponse, BatchError, CreateEventRequest,
    CreateEventTypeRequest, CreateGeofenceRequest, EntityKind, LocalId, PropertyType,
    PropertyValue, Properties, SourceType, Syncable, UpdateEventRequest, UpdateEventTypeRequest,
    UpdateGeofenceRequest,
};

pub use operation::{EventPayload, EventTypePayload, GeofencePayload, Operation, OperationKind};
