use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::sync::Arc;

use crate::config::ApiConfig;
use crate::error::{classify_error_response, ApiResult};
use crate::models::{
    BatchCreateEventsRequest, BatchCreateEventsResponse, CreateEventRequest,
    CreateEventTypeRequest, CreateGeofenceRequest, Event, EventType, Geofence,
    UpdateEventRequest, UpdateEventTypeRequest, UpdateGeofenceRequest,
};
use crate::transport::{decode_json, ensure_success, HttpTransport, StaticToken, TokenProvider};

// ===== BACKEND SEAM =====

/// Everything the sync engine needs from the remote API.
///
/// Single creates take an optional idempotency key; the engine passes the entity's
/// local id so a retried create can never produce a second backend record. Batch
/// items carry no key, so only events without a queued create are batched.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_event_types(&self) -> ApiResult<Vec<EventType>>;
    async fn create_event_type(
        &self,
        request: &CreateEventTypeRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<EventType>;
    async fn update_event_type(
        &self,
        id: &str,
        request: &UpdateEventTypeRequest,
    ) -> ApiResult<EventType>;
    async fn delete_event_type(&self, id: &str) -> ApiResult<()>;

    /// Every event the user owns, across all pages.
    async fn fetch_all_events(&self) -> ApiResult<Vec<Event>>;
    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Event>;
    /// Creates many events at once. Partial success is reported per index in the response.
    async fn create_events_batch(
        &self,
        request: &BatchCreateEventsRequest,
    ) -> ApiResult<BatchCreateEventsResponse>;
    async fn update_event(&self, id: &str, request: &UpdateEventRequest) -> ApiResult<Event>;
    async fn delete_event(&self, id: &str) -> ApiResult<()>;

    async fn list_geofences(&self) -> ApiResult<Vec<Geofence>>;
    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Geofence>;
    async fn update_geofence(
        &self,
        id: &str,
        request: &UpdateGeofenceRequest,
    ) -> ApiResult<Geofence>;
    async fn delete_geofence(&self, id: &str) -> ApiResult<()>;
}

// ===== CLIENT IMPLEMENTATION =====

#[derive(Debug)]
pub struct BackendClient {
    transport: HttpTransport,
}

impl BackendClient {
    /// Creates a client authenticating with the token from the config.
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        let tokens = Arc::new(StaticToken::new(config.api_token.clone()));
        Self::with_token_provider(config, tokens)
    }

    /// Creates a client that asks `tokens` for a bearer token before every request.
    pub fn with_token_provider(
        config: ApiConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> ApiResult<Self> {
        Ok(Self {
            transport: HttpTransport::new(config, tokens)?,
        })
    }

    /// Creates a client from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = ApiConfig::from_env()?;
        Ok(Self::new(config)?)
    }

    pub fn config(&self) -> &ApiConfig {
        self.transport.config()
    }
}

#[async_trait]
impl Backend for BackendClient {
    // ===== EVENT TYPES =====

    async fn list_event_types(&self) -> ApiResult<Vec<EventType>> {
        self.transport.get_json("/event-types", &[]).await
    }

    async fn create_event_type(
        &self,
        request: &CreateEventTypeRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<EventType> {
        self.transport
            .post_json("/event-types", request, idempotency_key)
            .await
    }

    async fn update_event_type(
        &self,
        id: &str,
        request: &UpdateEventTypeRequest,
    ) -> ApiResult<EventType> {
        self.transport
            .put_json(&format!("/event-types/{}", id), request)
            .await
    }

    async fn delete_event_type(&self, id: &str) -> ApiResult<()> {
        self.transport.delete(&format!("/event-types/{}", id)).await
    }

    // ===== EVENTS =====

    async fn fetch_all_events(&self) -> ApiResult<Vec<Event>> {
        self.transport.fetch_all_pages("/events").await
    }

    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Event> {
        self.transport
            .post_json("/events", request, idempotency_key)
            .await
    }

    async fn create_events_batch(
        &self,
        request: &BatchCreateEventsRequest,
    ) -> ApiResult<BatchCreateEventsResponse> {
        if request.events.is_empty() {
            return Ok(BatchCreateEventsResponse::default());
        }

        let response = self
            .transport
            .execute(Method::POST, "/events/batch", &[], Some(request), None)
            .await?;

        // A batch where every item failed comes back as 400 with the usual body.
        if response.status() == StatusCode::BAD_REQUEST {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return match serde_json::from_str::<BatchCreateEventsResponse>(&body) {
                Ok(parsed) if parsed.total > 0 || !parsed.errors.is_empty() => Ok(parsed),
                _ => Err(classify_error_response(status, &body)),
            };
        }

        let response = ensure_success(response).await?;
        decode_json(response).await
    }

    async fn update_event(&self, id: &str, request: &UpdateEventRequest) -> ApiResult<Event> {
        self.transport
            .put_json(&format!("/events/{}", id), request)
            .await
    }

    async fn delete_event(&self, id: &str) -> ApiResult<()> {
        self.transport.delete(&format!("/events/{}", id)).await
    }

    // ===== GEOFENCES =====

    async fn list_geofences(&self) -> ApiResult<Vec<Geofence>> {
        self.transport.get_json("/geofences", &[]).await
    }

    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Geofence> {
        self.transport
            .post_json("/geofences", request, idempotency_key)
            .await
    }

    async fn update_geofence(
        &self,
        id: &str,
        request: &UpdateGeofenceRequest,
    ) -> ApiResult<Geofence> {
        self.transport
            .put_json(&format!("/geofences/{}", id), request)
            .await
    }

    async fn delete_geofence(&self, id: &str) -> ApiResult<()> {
        self.transport.delete(&format!("/geofences/{}", id)).await
    }
}
