//! Local storage adapter.
//!
//! Keeps results and session metadata in an in-process map, optionally
//! persisted wholesale to `qhealth-store.json` after every write. This is
//! the default adapter for the desktop↔mobile handoff flow: the measuring
//! side writes results here and the waiting side polls them back out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use async_trait::async_trait;
use qh_domain::error::{Error, Result};
use qh_domain::session::{MeasurementResult, SessionInfo, SessionPatch, SessionStatus};
use qh_domain::trace::TraceEvent;

use crate::adapter::StoreAdapter;

const STATE_FILE: &str = "qhealth-store.json";

/// How far back we assume a session started when results arrive for a
/// session we have no metadata for.
const INFERRED_CREATION_LEAD: i64 = 60;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    results: HashMap<String, MeasurementResult>,
    sessions: HashMap<String, SessionInfo>,
}

/// In-process store with optional JSON file persistence.
pub struct LocalStoreAdapter {
    state: RwLock<StoreState>,
    state_path: Option<PathBuf>,
    expiry: Duration,
}

impl LocalStoreAdapter {
    /// Memory-only store (state is lost when the process exits).
    pub fn in_memory(expiry: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            state_path: None,
            expiry,
        }
    }

    /// Load or create the store at `state_dir/qhealth-store.json`.
    pub fn with_state_file(state_dir: &Path, expiry: Duration) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(Error::Io)?;

        let state_path = state_dir.join(STATE_FILE);
        let state = if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            StoreState::default()
        };

        tracing::info!(
            sessions = state.sessions.len(),
            path = %state_path.display(),
            "local store loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            state_path: Some(state_path),
            expiry,
        })
    }

    fn flush(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Store(format!("serializing store state: {e}")))?;
        std::fs::write(path, json).map_err(Error::Io)?;
        Ok(())
    }

    /// Drop every expired session and result. Called opportunistically on
    /// writes and on `list_sessions`; reads handle their own entry.
    fn sweep(&self, state: &mut StoreState) -> usize {
        let now = Utc::now();
        let before = state.sessions.len() + state.results.len();
        state.sessions.retain(|_, info| !info.is_expired(now));
        let expiry = self.expiry;
        state
            .results
            .retain(|_, result| now.signed_duration_since(result.timestamp) <= expiry);
        before - (state.sessions.len() + state.results.len())
    }

    /// Metadata inferred from a bare result (results stored before any
    /// session record existed).
    fn infer_info(&self, session_id: &str, result: &MeasurementResult) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_owned(),
            status: SessionStatus::Completed,
            created_at: result.timestamp - Duration::seconds(INFERRED_CREATION_LEAD),
            last_measurement_at: Some(result.timestamp),
            measurement_count: 1,
            expires_at: result.timestamp + self.expiry,
        }
    }
}

#[async_trait]
impl StoreAdapter for LocalStoreAdapter {
    async fn store_results(&self, session_id: &str, results: &MeasurementResult) -> Result<()> {
        let mut state = self.state.write();
        self.sweep(&mut state);

        state
            .results
            .insert(session_id.to_owned(), results.clone());

        let count = match state.sessions.get_mut(session_id) {
            Some(info) => {
                info.status = SessionStatus::Completed;
                info.last_measurement_at = Some(results.timestamp);
                info.measurement_count += 1;
                info.measurement_count
            }
            None => {
                let info = self.infer_info(session_id, results);
                let count = info.measurement_count;
                state.sessions.insert(session_id.to_owned(), info);
                count
            }
        };

        self.flush(&state)?;

        TraceEvent::ResultsStored {
            session_id: session_id.to_owned(),
            measurement_count: count,
        }
        .emit();

        Ok(())
    }

    async fn get_results(&self, session_id: &str) -> Result<Option<MeasurementResult>> {
        let mut state = self.state.write();
        let Some(result) = state.results.get(session_id) else {
            return Ok(None);
        };

        let age = Utc::now().signed_duration_since(result.timestamp);
        if age > self.expiry {
            state.results.remove(session_id);
            self.flush(&state)?;
            return Ok(None);
        }

        Ok(Some(result.clone()))
    }

    async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let mut state = self.state.write();

        if let Some(info) = state.sessions.get(session_id) {
            if info.is_expired(Utc::now()) {
                // Terminal snapshot: delete the backing storage, report
                // EXPIRED exactly once.
                let mut snapshot = info.clone();
                snapshot.status = SessionStatus::Expired;
                state.sessions.remove(session_id);
                state.results.remove(session_id);
                self.flush(&state)?;

                TraceEvent::SessionExpired {
                    session_id: session_id.to_owned(),
                }
                .emit();
                return Ok(Some(snapshot));
            }
            return Ok(Some(info.clone()));
        }

        // No metadata — reconstruct from a live result if one exists.
        match state.results.get(session_id) {
            Some(result)
                if Utc::now().signed_duration_since(result.timestamp) <= self.expiry =>
            {
                Ok(Some(self.infer_info(session_id, result)))
            }
            _ => Ok(None),
        }
    }

    async fn update_session_info(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        let mut state = self.state.write();
        self.sweep(&mut state);

        let info = state
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| SessionInfo::new(session_id, Utc::now(), self.expiry));
        info.apply(patch);

        self.flush(&state)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut state = self.state.write();
        if self.sweep(&mut state) > 0 {
            self.flush(&state)?;
        }
        Ok(state.sessions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> LocalStoreAdapter {
        LocalStoreAdapter::in_memory(Duration::hours(1))
    }

    fn result_at(session_id: &str, offset: Duration) -> MeasurementResult {
        MeasurementResult {
            session_id: session_id.to_owned(),
            vital_signs: json!({"heartRate": 72}),
            timestamp: Utc::now() + offset,
        }
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let store = store();
        let result = result_at("sid-1", Duration::zero());

        store.store_results("sid-1", &result).await.unwrap();
        let got = store.get_results("sid-1").await.unwrap().unwrap();
        assert_eq!(got.vital_signs, result.vital_signs);
        assert_eq!(got.timestamp, result.timestamp);

        let info = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.measurement_count, 1);
        assert_eq!(info.last_measurement_at, Some(result.timestamp));
    }

    #[tokio::test]
    async fn replace_on_write_keeps_latest_only() {
        let store = store();
        store
            .store_results("sid-1", &result_at("sid-1", Duration::zero()))
            .await
            .unwrap();

        let second = MeasurementResult {
            session_id: "sid-1".into(),
            vital_signs: json!({"heartRate": 65}),
            timestamp: Utc::now(),
        };
        store.store_results("sid-1", &second).await.unwrap();

        let got = store.get_results("sid-1").await.unwrap().unwrap();
        assert_eq!(got.vital_signs["heartRate"], 65);

        let info = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(info.measurement_count, 2);
    }

    #[tokio::test]
    async fn expired_result_is_absent_and_deleted() {
        let store = store();
        let stale = result_at("sid-1", Duration::hours(-2));
        store.store_results("sid-1", &stale).await.unwrap();

        assert!(store.get_results("sid-1").await.unwrap().is_none());
        // Deleted on read, not merely hidden.
        assert!(store.state.read().results.is_empty());
    }

    #[tokio::test]
    async fn expired_session_reported_exactly_once() {
        let store = store();
        store
            .update_session_info(
                "sid-1",
                SessionPatch {
                    expires_at: Some(Utc::now() - Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(first.status, SessionStatus::Expired);

        // Second read: the storage was deleted, nothing left to report.
        assert!(store.get_session_info("sid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_session_is_distinct_from_expired() {
        let store = store();
        assert!(store.get_session_info("never-existed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn info_inferred_from_bare_result() {
        let store = store();
        let result = result_at("sid-1", Duration::zero());
        // Plant a result without going through store_results.
        store
            .state
            .write()
            .results
            .insert("sid-1".into(), result.clone());

        let info = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.measurement_count, 1);
        assert_eq!(info.created_at, result.timestamp - Duration::seconds(60));
    }

    #[tokio::test]
    async fn update_creates_default_active_record() {
        let store = store();
        store
            .update_session_info("sid-1", SessionPatch::status(SessionStatus::Measuring))
            .await
            .unwrap();

        let info = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(info.status, SessionStatus::Measuring);
        assert_eq!(info.measurement_count, 0);
    }

    #[tokio::test]
    async fn list_excludes_expired_sessions() {
        let store = store();
        store
            .update_session_info("live", SessionPatch::default())
            .await
            .unwrap();
        store
            .update_session_info(
                "stale",
                SessionPatch {
                    expires_at: Some(Utc::now() - Duration::minutes(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "live");
    }

    #[tokio::test]
    async fn write_sweeps_expired_entries() {
        let store = store();
        store
            .update_session_info(
                "stale",
                SessionPatch {
                    expires_at: Some(Utc::now() - Duration::minutes(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Any write sweeps; the stale session disappears without a read.
        store
            .store_results("sid-1", &result_at("sid-1", Duration::zero()))
            .await
            .unwrap();
        assert!(!store.state.read().sessions.contains_key("stale"));
    }

    #[tokio::test]
    async fn state_survives_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = result_at("sid-1", Duration::zero());

        {
            let store =
                LocalStoreAdapter::with_state_file(dir.path(), Duration::hours(1)).unwrap();
            store.store_results("sid-1", &result).await.unwrap();
        }

        let store = LocalStoreAdapter::with_state_file(dir.path(), Duration::hours(1)).unwrap();
        let got = store.get_results("sid-1").await.unwrap().unwrap();
        assert_eq!(got.vital_signs, result.vital_signs);

        let info = store.get_session_info("sid-1").await.unwrap().unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
    }
}
