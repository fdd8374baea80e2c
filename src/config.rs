use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const API_PATH: &str = "/api/v1";

/// Largest `limit` the API honours. Bigger values are silently replaced with its
/// default page size, which would end paging after the first page.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_token: String,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub page_size: usize,
    pub request_timeout_secs: u64,
}

impl ApiConfig {
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_token: api_token.into(),
            max_retries: 3,
            retry_base_delay_ms: 500,
            page_size: 100,
            request_timeout_secs: 30,
        }
    }

    /// Creates a new api config from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_token(None)
    }

    /// Creates a new api config from environment variables with an optional bearer token
    pub fn from_env_with_token(api_token: Option<String>) -> Result<Self> {
        dotenv::dotenv().ok();

        let base_url = std::env::var("TRENDY_API_URL")
            .map_err(|_| anyhow!("TRENDY_API_URL environment variable is required"))?;

        let api_token = api_token.unwrap_or_else(|| {
            std::env::var("TRENDY_API_TOKEN").unwrap_or_else(|_| {
                tracing::warn!("TRENDY_API_TOKEN environment variable not found, using empty token");
                String::new()
            })
        });

        let mut config = Self::new(&base_url, api_token);
        config.max_retries = env_or("TRENDY_MAX_RETRIES", config.max_retries)?;
        config.retry_base_delay_ms = env_or("TRENDY_RETRY_BASE_DELAY_MS", config.retry_base_delay_ms)?;
        config.page_size = env_or("TRENDY_PAGE_SIZE", config.page_size)?;
        config.request_timeout_secs =
            env_or("TRENDY_REQUEST_TIMEOUT_SECS", config.request_timeout_secs)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(anyhow!(
                "TRENDY_PAGE_SIZE must be between 1 and {}, got {}",
                MAX_PAGE_SIZE,
                self.page_size
            ));
        }
        validate_base_url(&self.base_url)
    }

    /// Page size actually sent as `limit`.
    pub fn page_limit(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full URL for a path below the api prefix, e.g. `endpoint("/events")`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Appends the `/api/v1` prefix unless the URL already ends with it.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with(API_PATH) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, API_PATH)
    }
}

/// Rejects anything that is not an absolute http(s) URL.
pub fn validate_base_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| anyhow!("Invalid API URL {}: {}", url, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("Unsupported API URL scheme: {}", other)),
    }
}

/// Heuristic matching windows used when linking unmapped local entities to backend records.
///
/// Wide windows can merge records that were genuinely distinct; narrow ones let
/// duplicates through. The defaults favour merging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchTolerances {
    pub event_timestamp: Duration,
    pub geofence_coordinate_degrees: f64,
}

impl Default for MatchTolerances {
    fn default() -> Self {
        Self {
            event_timestamp: Duration::from_secs(1),
            geofence_coordinate_degrees: 0.0001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub event_batch_size: usize,
    pub max_queue_attempts: u32,
    pub tolerances: MatchTolerances,
    /// Start a background sync whenever a mutation is queued while online.
    pub sync_on_enqueue: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("trendy_sync.db"),
            event_batch_size: 100,
            max_queue_attempts: 5,
            tolerances: MatchTolerances::default(),
            sync_on_enqueue: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Ok(path) = std::env::var("TRENDY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.event_batch_size = env_or("TRENDY_EVENT_BATCH_SIZE", config.event_batch_size)?;
        if config.event_batch_size == 0 {
            return Err(anyhow!("TRENDY_EVENT_BATCH_SIZE must be greater than zero"));
        }
        Ok(config)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}
