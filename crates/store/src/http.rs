//! HTTP storage adapter.
//!
//! Talks to a backend REST API instead of local state. Every call carries a
//! fresh `X-Trace-Id` and emits a [`TraceEvent::StoreCall`] with the status
//! and duration. Requests are never retried here; the poller already
//! provides the retry cadence for reads, and writes surface their failure
//! to the orchestrator.

use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode};
use uuid::Uuid;

use async_trait::async_trait;
use qh_domain::config::StoreConfig;
use qh_domain::error::{Error, Result};
use qh_domain::session::{MeasurementResult, SessionInfo, SessionPatch};
use qh_domain::trace::TraceEvent;

use crate::adapter::StoreAdapter;

/// Remote adapter over the `/api/v1/sessions` backend surface.
pub struct HttpStoreAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStoreAdapter {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(ref key) = config.api_key {
            let val = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::Config(format!("invalid API key header: {e}")))?;
            headers.insert(AUTHORIZATION, val);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        self.http
            .request(method, url)
            .header("X-Trace-Id", Uuid::new_v4().to_string())
    }

    /// Send, trace, and surface non-2xx statuses as errors. A 404 is
    /// returned as `Ok(None)` so reads can treat it as "absent".
    async fn send(&self, path: &str, builder: RequestBuilder) -> Result<Option<reqwest::Response>> {
        let start = Instant::now();
        let result = builder.send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(endpoint = path, error = %e, "store call failed");
                return Err(from_reqwest(path, e));
            }
        };

        let status = response.status();
        TraceEvent::StoreCall {
            endpoint: path.to_owned(),
            status: status.as_u16(),
            duration_ms,
        }
        .emit();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{path} returned {status}: {body}")));
        }

        Ok(Some(response))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        response.json().await.map_err(|e| from_reqwest(path, e))
    }
}

fn from_reqwest(path: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{path} timed out"))
    } else {
        Error::Http(format!("{path}: {e}"))
    }
}

#[async_trait]
impl StoreAdapter for HttpStoreAdapter {
    async fn store_results(&self, session_id: &str, results: &MeasurementResult) -> Result<()> {
        let path = format!("/api/v1/sessions/{session_id}/measurements");
        let builder = self.request(Method::POST, &path).json(results);
        match self.send(&path, builder).await? {
            Some(_) => Ok(()),
            None => Err(Error::Store(format!("session {session_id} not found"))),
        }
    }

    async fn get_results(&self, session_id: &str) -> Result<Option<MeasurementResult>> {
        let path = format!("/api/v1/sessions/{session_id}/measurements/latest");
        let builder = self.request(Method::GET, &path);
        match self.send(&path, builder).await? {
            Some(resp) => Ok(Some(self.read_json(&path, resp).await?)),
            None => Ok(None),
        }
    }

    async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let path = format!("/api/v1/sessions/{session_id}");
        let builder = self.request(Method::GET, &path);
        match self.send(&path, builder).await? {
            Some(resp) => Ok(Some(self.read_json(&path, resp).await?)),
            None => Ok(None),
        }
    }

    async fn update_session_info(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        let path = format!("/api/v1/sessions/{session_id}");
        let builder = self.request(Method::PATCH, &path).json(&patch);
        match self.send(&path, builder).await? {
            Some(_) => Ok(()),
            None => Err(Error::Store(format!("session {session_id} not found"))),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let path = "/api/v1/sessions";
        let builder = self.request(Method::GET, path);
        match self.send(path, builder).await? {
            Some(resp) => self.read_json(path, resp).await,
            None => Ok(Vec::new()),
        }
    }
}
