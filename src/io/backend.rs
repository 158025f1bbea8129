//! Backend HTTP client
//!
//! Endpoints (JSON over HTTP/HTTPS):
//! - POST /api/auth/login              {username, password} -> token grant
//! - POST /api/auth/refresh            {refresh_token}      -> token grant
//! - POST /api/detections              event metadata (bearer) -> 201 {id}
//! - POST /api/detections/{id}/image   raw image bytes (bearer)
//! - GET  /api/health                  liveness probe (bearer)
//!
//! 401/403 are reported as `Unauthorized` so callers can tell credential
//! problems apart from connectivity problems.

use crate::domain::event::PotholeEvent;
use crate::infra::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors returned by backend calls
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("server error (HTTP {0})")]
    Server(u16),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl BackendError {
    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }

    /// Failures that say nothing about the credentials or tokens sent
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Network(_) | BackendError::Timeout)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

/// Device login credentials
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Response body of login and refresh
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    pub expires_in: u64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant").field("expires_in", &self.expires_in).finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Outbound calls to the backend
#[async_trait]
pub trait Backend: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<TokenGrant, BackendError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, BackendError>;

    /// Upload event metadata; the event id makes retries idempotent
    async fn upload_event(&self, token: &str, event: &PotholeEvent) -> Result<(), BackendError>;

    async fn upload_image(&self, token: &str, event_id: Uuid, image: Bytes)
        -> Result<(), BackendError>;

    async fn health(&self, token: &str) -> Result<(), BackendError>;
}

/// Map a non-success status to an error
fn classify_status(status: StatusCode, body: String) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthorized(status.as_u16())
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Server(status.as_u16())
        }
        s if s.is_server_error() => BackendError::Server(s.as_u16()),
        s => BackendError::Rejected { status: s.as_u16(), body },
    }
}

/// reqwest-backed implementation
pub struct HttpBackend {
    http: Client,
    base_url: String,
    device_id: String,
}

impl HttpBackend {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let http = Client::builder()
            .timeout(config.backend_timeout())
            .connect_timeout(config.backend_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.backend_url().to_string(),
            device_id: config.device_id().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn token_exchange<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<TokenGrant, BackendError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json::<TokenGrant>().await?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn login(&self, credentials: &Credentials) -> Result<TokenGrant, BackendError> {
        self.token_exchange("/api/auth/login", credentials).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, BackendError> {
        self.token_exchange("/api/auth/refresh", &RefreshRequest { refresh_token }).await
    }

    async fn upload_event(&self, token: &str, event: &PotholeEvent) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url("/api/detections"))
            .bearer_auth(token)
            .json(&event.payload(&self.device_id))
            .send()
            .await?;

        // 409: the backend already holds this id from an earlier attempt
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::expect_success(response).await.map(|_| ())
    }

    async fn upload_image(
        &self,
        token: &str,
        event_id: Uuid,
        image: Bytes,
    ) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url(&format!("/api/detections/{}/image", event_id)))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn health(&self, token: &str) -> Result<(), BackendError> {
        let response = self.http.get(self.url("/api/health")).bearer_auth(token).send().await?;
        Self::expect_success(response).await.map(|_| ())
    }
}
