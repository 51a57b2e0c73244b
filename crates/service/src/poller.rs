//! Result poller — drives the waiting side of the handoff.
//!
//! Polls a results source on a two-phase cadence: every 2.5 s for the
//! first 30 s, then every 5 s, giving up for good at the hard timeout.
//! Transient fetch errors are recorded in the published state and polling
//! continues; only a found result, an expired session, cancellation, or
//! the hard timeout stop the loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use qh_domain::config::PollingConfig;
use qh_domain::session::MeasurementResult;
use qh_domain::trace::TraceEvent;
use qh_protocol::{ApiError, ApiErrorCode, ApiMethod};
use qh_store::StoreAdapter;

use crate::bus::MessageBus;

/// Where the poller looks for results.
#[async_trait]
pub trait ResultsSource: Send + Sync {
    /// `Ok(None)` means "not there yet, keep polling".
    async fn fetch(&self, session_id: &str) -> Result<Option<MeasurementResult>, ApiError>;
}

/// Polls a storage adapter directly (same-device flow).
pub struct StoreSource(pub Arc<dyn StoreAdapter>);

#[async_trait]
impl ResultsSource for StoreSource {
    async fn fetch(&self, session_id: &str) -> Result<Option<MeasurementResult>, ApiError> {
        self.0
            .get_results(session_id)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }
}

/// Polls the peer over RPC (cross-context flow). "Not found" and "not
/// complete yet" answers are part of normal polling, not errors.
pub struct RpcSource(pub Arc<MessageBus>);

#[async_trait]
impl ResultsSource for RpcSource {
    async fn fetch(&self, session_id: &str) -> Result<Option<MeasurementResult>, ApiError> {
        let params = serde_json::json!({ "sessionId": session_id });
        match self
            .0
            .call(ApiMethod::GetResultsBySessionId, Some(params), None)
            .await
        {
            Ok(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| ApiError::internal(format!("malformed result payload: {e}"))),
            Err(e)
                if matches!(
                    e.code,
                    ApiErrorCode::SessionNotFound
                        | ApiErrorCode::MeasurementNotComplete
                        | ApiErrorCode::MeasurementInProgress
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Published on a watch channel after every attempt.
#[derive(Debug, Clone)]
pub enum PollState {
    /// Still waiting. `error` carries the last transient failure, if any.
    Polling { error: Option<String> },
    Found(MeasurementResult),
    /// Gave up: hard timeout reached or the session expired.
    Expired,
}

pub struct ResultPoller {
    state_rx: watch::Receiver<PollState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ResultPoller {
    /// Start polling `session_id` on a background task.
    pub fn spawn(source: Arc<dyn ResultsSource>, session_id: String, config: PollingConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(PollState::Polling { error: None });
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            poll_loop(source, session_id, config, state_tx, token).await;
        });

        Self {
            state_rx,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> PollState {
        self.state_rx.borrow().clone()
    }

    /// Receiver for state changes; useful for driving UI updates.
    pub fn watch(&self) -> watch::Receiver<PollState> {
        self.state_rx.clone()
    }

    /// Stop polling. The current state is left as-is.
    pub fn disable(&self) {
        self.cancel.cancel();
    }

    /// Wait for the background task to finish (after a result, timeout,
    /// or `disable`).
    pub async fn join(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for ResultPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    source: Arc<dyn ResultsSource>,
    session_id: String,
    config: PollingConfig,
    state_tx: watch::Sender<PollState>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut attempts: u32 = 0;

    let finish = |outcome: &str, attempts: u32| {
        TraceEvent::PollFinished {
            session_id: session_id.clone(),
            outcome: outcome.to_owned(),
            attempts,
        }
        .emit();
    };

    loop {
        if cancel.is_cancelled() {
            finish("cancelled", attempts);
            return;
        }

        let elapsed = started.elapsed();
        if elapsed >= config.hard_timeout() {
            state_tx.send_replace(PollState::Expired);
            finish("timeout", attempts);
            return;
        }

        attempts += 1;
        TraceEvent::PollAttempt {
            session_id: session_id.clone(),
            attempt: attempts,
            elapsed_ms: elapsed.as_millis() as u64,
        }
        .emit();

        match source.fetch(&session_id).await {
            Ok(Some(result)) => {
                state_tx.send_replace(PollState::Found(result));
                finish("found", attempts);
                return;
            }
            Ok(None) => {
                state_tx.send_replace(PollState::Polling { error: None });
            }
            Err(e) if e.code == ApiErrorCode::SessionExpired => {
                state_tx.send_replace(PollState::Expired);
                finish("session_expired", attempts);
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "poll attempt failed");
                state_tx.send_replace(PollState::Polling {
                    error: Some(e.to_string()),
                });
            }
        }

        let interval = if started.elapsed() < config.slow_after() {
            config.initial_interval()
        } else {
            config.slow_interval()
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                finish("cancelled", attempts);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
