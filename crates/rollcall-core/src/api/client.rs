//! API client for the school-management REST API.
//!
//! Every request returns the response body as JSON so results can flow
//! straight into fetch and mutation units. Paths are relative to the
//! configured base URL.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::query::{MutationProducer, Producer};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// JSON client for the remote API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, backing off and retrying while the server answers 429.
    async fn send<F>(&self, url: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if status.as_u16() != 429 {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::from_status(status, &body));
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Read a JSON body; an empty body reads as `null`.
    async fn read_json(url: &str, response: Response) -> Result<Value, ApiError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            debug!(url = url, error = %e, "Response was not JSON");
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        let response = self.send(&url, || self.request(Method::GET, &url)).await?;
        Self::read_json(&url, response).await
    }

    /// Send `body` as JSON with the given method and read the JSON reply.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value, ApiError> {
        let url = self.url(path);
        let response = self
            .send(&url, || self.request(method.clone(), &url).json(body))
            .await?;
        Self::read_json(&url, response).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, ApiError> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, ApiError> {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        let response = self.send(&url, || self.request(Method::DELETE, &url)).await?;
        Self::read_json(&url, response).await
    }

    // ===== Producers =====

    /// A fetch producer that GETs `path`. The path doubles as the label.
    pub fn get_producer(&self, path: &str) -> Producer {
        let client = self.clone();
        let path = path.to_string();
        Producer::new(path.clone(), move || {
            let client = client.clone();
            let path = path.clone();
            async move { client.get_json(&path).await }
        })
    }

    /// A mutation producer sending its payload to `path` with `method`.
    pub fn mutation_producer<P>(&self, method: Method, path: &str) -> MutationProducer<P>
    where
        P: Serialize + Send + Sync + 'static,
    {
        let client = self.clone();
        let path = path.to_string();
        MutationProducer::new(move |payload: P| {
            let client = client.clone();
            let method = method.clone();
            let path = path.clone();
            async move { client.send_json(method, &path, &payload).await }
        })
    }
}
