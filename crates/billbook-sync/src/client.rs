//! # Sync Client
//!
//! The network seam between the dispatcher and the reconciliation server.
//! The dispatcher only sees [`SyncClient`]; [`HttpSyncClient`] is the
//! production implementation, tests plug in scripted or in-process clients.
//!
//! ## Requests
//! ```text
//!   POST {base_url}/sync/push   PushRequest  ──►  PushResponse
//!   POST {base_url}/sync/pull   PullRequest  ──►  PullResponse
//!
//!   headers:  X-Tenant-Id   owner id
//!             X-User-Id     user id
//!             X-Device-Id   device id
//! ```

use async_trait::async_trait;
use billbook_core::{Provenance, PullRequest, PullResponse, PushRequest, PushResponse};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{status_error, SyncError, SyncResult};

/// Tenant header understood by the server.
pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const USER_HEADER: &str = "X-User-Id";
pub const DEVICE_HEADER: &str = "X-Device-Id";

/// Push and pull against the reconciliation server.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse>;

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// JSON-over-HTTP client.
#[derive(Debug, Clone)]
pub struct HttpSyncClient {
    http: Client,
    base_url: String,
    provenance: Provenance,
    timeout: Duration,
}

impl HttpSyncClient {
    /// Creates a client for the configured server.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let timeout = config.request_timeout();
        let http = Client::builder()
            .user_agent(concat!("billbook-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(HttpSyncClient {
            http,
            base_url: config.server.base_url.trim_end_matches('/').to_string(),
            provenance: config.provenance(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> SyncResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Sync request");

        let response = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(TENANT_HEADER, &self.provenance.owner_id)
            .header(USER_HEADER, &self.provenance.user_id)
            .header(DEVICE_HEADER, &self.provenance.device_id)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| SyncError::InvalidResponse(format!("Failed to parse response: {e}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status.as_u16(), body))
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout.as_secs())
        } else {
            SyncError::from(err)
        }
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        self.post("/sync/push", &request).await
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.post("/sync/pull", &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let mut config = SyncConfig::default();
        config.server.base_url = "https://sync.example.com/".to_string();
        let client = HttpSyncClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://sync.example.com");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let mut config = SyncConfig::default();
        // Port 9 (discard) on loopback is closed on test machines.
        config.server.base_url = "http://127.0.0.1:9".to_string();
        config.server.request_timeout_secs = 2;
        let client = HttpSyncClient::new(&config).unwrap();

        let err = client.pull(PullRequest::default()).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
