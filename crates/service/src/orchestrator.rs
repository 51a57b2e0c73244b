//! The orchestrator behind the RPC catalogue.
//!
//! Owns the wiring between storage, session identity, and the event
//! broadcaster: answers every catalogued method, drives measurement
//! lifecycle transitions, and turns stale session reads into
//! `SESSION_EXPIRED` broadcasts.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use async_trait::async_trait;
use qh_domain::config::Config;
use qh_domain::error::Error;
use qh_domain::session::{MeasurementResult, SessionInfo, SessionPatch, SessionStatus};
use qh_protocol::{ApiError, ApiErrorCode, ApiEventType, ApiMethod};
use qh_sessions::{HandoffChannel, SessionManager};
use qh_store::StoreAdapter;

use crate::broadcast::EventBroadcaster;
use crate::bus::RequestHandler;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    #[serde(default)]
    session_id: Option<String>,
}

pub struct QHealthService {
    store: Arc<dyn StoreAdapter>,
    broadcaster: Arc<EventBroadcaster>,
    sessions: Arc<SessionManager>,
    config: Arc<Config>,
}

impl QHealthService {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        broadcaster: Arc<EventBroadcaster>,
        sessions: Arc<SessionManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            sessions,
            config,
        }
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // RPC handlers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn get_latest_results(&self, params: Option<Value>) -> Result<Value, ApiError> {
        let session_id = parse_session_id(params)?.unwrap_or_else(|| self.sessions.session_id());
        self.results_for(&session_id).await
    }

    async fn get_results_by_session_id(&self, params: Option<Value>) -> Result<Value, ApiError> {
        let session_id = parse_session_id(params)?
            .ok_or_else(|| ApiError::invalid_request("sessionId is required"))?;
        self.results_for(&session_id).await
    }

    /// Shared result lookup: a missing result is diagnosed through session
    /// metadata so callers get a precise error code instead of a generic
    /// "not found".
    async fn results_for(&self, session_id: &str) -> Result<Value, ApiError> {
        if let Some(result) = self
            .store
            .get_results(session_id)
            .await
            .map_err(store_error)?
        {
            return to_json(&result);
        }

        let info = self.lookup_info(session_id).await?;
        Err(match info.map(|i| i.status) {
            None => ApiError::new(
                ApiErrorCode::SessionNotFound,
                format!("no session with id {session_id}"),
            ),
            Some(SessionStatus::Expired) => ApiError::new(
                ApiErrorCode::SessionExpired,
                format!("session {session_id} has expired"),
            ),
            Some(SessionStatus::Measuring) => ApiError::new(
                ApiErrorCode::MeasurementInProgress,
                "measurement is still in progress",
            ),
            Some(SessionStatus::Failed) => ApiError::new(
                ApiErrorCode::MeasurementFailed,
                "the last measurement failed",
            ),
            Some(_) => ApiError::new(
                ApiErrorCode::MeasurementNotComplete,
                "no results available yet",
            ),
        })
    }

    async fn get_session_info(&self) -> Result<Value, ApiError> {
        let session_id = self.sessions.session_id();
        match self.lookup_info(&session_id).await? {
            Some(info) => to_json(&info),
            None => Err(ApiError::new(
                ApiErrorCode::SessionNotFound,
                format!("no session with id {session_id}"),
            )),
        }
    }

    async fn get_session_status(&self, params: Option<Value>) -> Result<Value, ApiError> {
        let session_id = parse_session_id(params)?.unwrap_or_else(|| self.sessions.session_id());
        match self.lookup_info(&session_id).await? {
            Some(info) => Ok(json!({
                "sessionId": info.session_id,
                "status": info.status,
            })),
            None => Err(ApiError::new(
                ApiErrorCode::SessionNotFound,
                format!("no session with id {session_id}"),
            )),
        }
    }

    async fn list_sessions(&self) -> Result<Value, ApiError> {
        let sessions = self.store.list_sessions().await.map_err(store_error)?;
        to_json(&sessions)
    }

    fn ping(&self) -> Value {
        json!({
            "status": "ok",
            "timestamp": Utc::now().timestamp_millis(),
        })
    }

    /// Store lookup that turns an expired snapshot into a broadcast. The
    /// store reports EXPIRED exactly once, so the broadcast fires once too.
    async fn lookup_info(&self, session_id: &str) -> Result<Option<SessionInfo>, ApiError> {
        let info = self
            .store
            .get_session_info(session_id)
            .await
            .map_err(store_error)?;

        if let Some(info) = &info {
            if info.status == SessionStatus::Expired {
                self.broadcaster.broadcast(
                    ApiEventType::SessionExpired,
                    json!({ "sessionId": session_id }),
                    Some(session_id),
                );
            }
        }
        Ok(info)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Measurement lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Record that the current session started measuring and announce it.
    pub async fn measurement_started(&self) -> Result<(), ApiError> {
        let session_id = self.sessions.session_id();

        if let Some(info) = self.lookup_info(&session_id).await? {
            if !info.status.can_transition_to(SessionStatus::Measuring) {
                return Err(match info.status {
                    SessionStatus::Measuring => ApiError::new(
                        ApiErrorCode::MeasurementInProgress,
                        "a measurement is already running",
                    ),
                    SessionStatus::Expired => ApiError::new(
                        ApiErrorCode::SessionExpired,
                        format!("session {session_id} has expired"),
                    ),
                    other => ApiError::internal(format!(
                        "cannot start measuring from status {other}"
                    )),
                });
            }
        }

        self.store
            .update_session_info(&session_id, SessionPatch::status(SessionStatus::Measuring))
            .await
            .map_err(store_error)?;

        self.broadcaster.broadcast(
            ApiEventType::MeasurementStarted,
            json!({ "sessionId": session_id }),
            Some(&session_id),
        );
        Ok(())
    }

    /// Persist final vital signs for the current session and announce
    /// completion. A storage failure is announced as an `ERROR` event and
    /// returned; session state is left untouched in that case.
    pub async fn complete_measurement(&self, vital_signs: Value) -> Result<(), ApiError> {
        let session_id = self.sessions.session_id();
        let result = MeasurementResult {
            session_id: session_id.clone(),
            vital_signs,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.store.store_results(&session_id, &result).await {
            tracing::error!(session_id = %session_id, error = %e, "storing results failed");
            self.broadcaster.broadcast(
                ApiEventType::Error,
                json!({
                    "code": "STORAGE_ERROR",
                    "message": e.to_string(),
                    "sessionId": session_id,
                }),
                Some(&session_id),
            );
            return Err(store_error(e));
        }

        self.broadcaster.broadcast(
            ApiEventType::MeasurementComplete,
            to_json(&result)?,
            Some(&session_id),
        );
        Ok(())
    }

    /// Mark the current measurement as failed and announce it. The
    /// `MEASUREMENT_FAILED` event fires even when no transition applies,
    /// so listeners always learn about the failure.
    pub async fn fail_measurement(&self, detail: Value) -> Result<(), ApiError> {
        let session_id = self.sessions.session_id();

        let can_transition = self
            .lookup_info(&session_id)
            .await?
            .map(|info| info.status.can_transition_to(SessionStatus::Failed))
            .unwrap_or(false);
        if can_transition {
            self.store
                .update_session_info(&session_id, SessionPatch::status(SessionStatus::Failed))
                .await
                .map_err(store_error)?;
        }

        self.broadcaster.broadcast(
            ApiEventType::MeasurementFailed,
            json!({
                "sessionId": session_id,
                "error": detail,
            }),
            Some(&session_id),
        );
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Session lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create the store record for the current session and announce it.
    pub async fn announce_session(&self) -> Result<(), ApiError> {
        let handle = self.sessions.current();
        self.store
            .update_session_info(&handle.session_id, SessionPatch::default())
            .await
            .map_err(store_error)?;

        self.broadcaster.broadcast(
            ApiEventType::SessionCreated,
            json!({
                "sessionId": handle.session_id,
                "createdAt": handle.created_at.timestamp_millis(),
            }),
            Some(&handle.session_id),
        );
        Ok(())
    }

    /// Mint a fresh session, write it to the handoff channel, and announce
    /// it as if newly created.
    pub async fn refresh_session(&self, channel: &mut dyn HandoffChannel) -> Result<(), ApiError> {
        self.sessions.refresh(channel);
        self.announce_session().await
    }
}

#[async_trait]
impl RequestHandler for QHealthService {
    async fn handle_request(
        &self,
        method: ApiMethod,
        params: Option<Value>,
    ) -> Result<Value, ApiError> {
        tracing::debug!(method = %method, "handling request");
        match method {
            ApiMethod::GetLatestResults => self.get_latest_results(params).await,
            ApiMethod::GetResultsBySessionId => self.get_results_by_session_id(params).await,
            ApiMethod::GetSessionInfo => self.get_session_info().await,
            ApiMethod::GetSessionStatus => self.get_session_status(params).await,
            ApiMethod::ListSessions => self.list_sessions().await,
            ApiMethod::Ping => Ok(self.ping()),
        }
    }
}

fn parse_session_id(params: Option<Value>) -> Result<Option<String>, ApiError> {
    let Some(params) = params else {
        return Ok(None);
    };
    let parsed: SessionIdParams = serde_json::from_value(params)
        .map_err(|e| ApiError::invalid_request(format!("malformed params: {e}")))?;
    Ok(parsed.session_id.filter(|id| !id.is_empty()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::internal(format!("serialization: {e}")))
}

fn store_error(e: Error) -> ApiError {
    match e {
        Error::Timeout(msg) => ApiError::timeout(msg),
        other => ApiError::internal(other.to_string()),
    }
}
