//! Authenticated HTTP plumbing shared by every endpoint: bearer auth, 429 backoff,
//! idempotency keys, JSON decoding and limit/offset pagination.

use crate::config::{ApiConfig, MAX_PAGE_SIZE};
use crate::error::{classify_error_response, ApiError, ApiResult};
use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Supplies the bearer token for each request. Token refresh lives behind this trait.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> ApiResult<String>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> ApiResult<String> {
        Ok(self.0.clone())
    }
}

/// Delay before retry number `attempt` (zero based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

pub struct HttpTransport {
    config: ApiConfig,
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url)
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: ApiConfig, tokens: Arc<dyn TokenProvider>) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Sends a request, retrying on HTTP 429 with exponential backoff.
    ///
    /// The response is returned whatever its status apart from 429; callers decide
    /// what a non-success status means.
    pub async fn execute<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = self.config.endpoint(path);
        let mut attempt = 0u32;

        loop {
            let token = self.tokens.bearer_token().await?;
            let mut request = self.client.request(method.clone(), &url);
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(key) = idempotency_key {
                request = request.header(IDEMPOTENCY_HEADER, key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt >= self.config.max_retries {
                tracing::warn!(%method, path, attempts = attempt + 1, "Rate limit retries exhausted");
                return Err(ApiError::RateLimited {
                    attempts: attempt + 1,
                });
            }

            let delay = backoff_delay(self.config.retry_base_delay(), attempt);
            tracing::debug!(%method, path, attempt, delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// [`execute`](Self::execute), then maps any non-success status to an [`ApiError`].
    pub async fn send<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> ApiResult<Response>
    where
        B: Serialize + ?Sized,
    {
        let response = self
            .execute(method, path, query, body, idempotency_key)
            .await?;
        ensure_success(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let response = self
            .send::<()>(Method::GET, path, query, None, None)
            .await?;
        decode_json(response).await
    }

    pub async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(Method::POST, path, &[], Some(body), idempotency_key)
            .await?;
        decode_json(response).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(Method::PUT, path, &[], Some(body), None)
            .await?;
        decode_json(response).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<()> {
        self.send::<()>(Method::DELETE, path, &[], None, None)
            .await?;
        Ok(())
    }

    /// Fetches every page of a list endpoint.
    pub async fn fetch_all_pages<T: DeserializeOwned>(&self, path: &str) -> ApiResult<Vec<T>> {
        let page_size = self.config.page_limit();
        fetch_all(page_size, |limit, offset| async move {
            self.get_json::<Vec<T>>(
                path,
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await
        })
        .await
    }
}

/// Pages through a `limit`/`offset` endpoint until a page comes back shorter than `page_size`.
pub async fn fetch_all<T, F, Fut>(page_size: usize, mut fetch_page: F) -> ApiResult<Vec<T>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = ApiResult<Vec<T>>>,
{
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let mut items = Vec::new();
    let mut offset = 0usize;

    loop {
        let page = fetch_page(page_size, offset).await?;
        let received = page.len();
        items.extend(page);
        if received < page_size {
            break;
        }
        offset += received;
    }

    Ok(items)
}

pub async fn ensure_success(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_error_response(status.as_u16(), &body))
}

pub async fn decode_json<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        ApiError::Decoding(format!("{} - Response: {}", e, preview))
    })
}
