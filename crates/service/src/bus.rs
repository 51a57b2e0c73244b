//! Message bus — outbound RPC correlation and inbound dispatch.
//!
//! Outbound: `call` mints a request envelope, parks a oneshot sender under
//! its `requestId`, hands the envelope to the peer sink, and waits with a
//! timeout. Inbound: `handle_incoming` enforces the origin whitelist,
//! validates requests at the boundary, dispatches them to the registered
//! handler, and completes pending calls from response envelopes.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use async_trait::async_trait;
use qh_domain::config::ApiConfig;
use qh_domain::trace::TraceEvent;
use qh_protocol::{
    validate_request, ApiError, ApiMethod, Envelope, RequestEnvelope, ResponseEnvelope,
};

/// Outbound half of the cross-context transport.
pub type PeerSink = mpsc::Sender<Envelope>;

/// Receives validated inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        method: ApiMethod,
        params: Option<Value>,
    ) -> Result<Value, ApiError>;
}

type PendingTx = oneshot::Sender<Result<Value, ApiError>>;

pub struct MessageBus {
    peer: PeerSink,
    api: ApiConfig,
    /// Map of request_id → pending oneshot sender.
    pending: Mutex<HashMap<String, PendingTx>>,
}

impl MessageBus {
    pub fn new(peer: PeerSink, api: ApiConfig) -> Self {
        Self {
            peer,
            api,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Call the peer and wait for its response.
    ///
    /// `timeout` overrides the configured default. On timeout the pending
    /// entry is removed so a late response is discarded rather than
    /// resolving a caller that already gave up.
    pub async fn call(
        &self,
        method: ApiMethod,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let request = RequestEnvelope::new(method, params, &self.api.version);
        let request_id = request.request_id.clone();
        let envelope = Envelope::Request(request);

        // Size guard applies to our own requests too.
        let size = envelope
            .encoded_size()
            .map_err(|e| ApiError::internal(format!("request serialization failed: {e}")))?;
        if size > self.api.max_request_bytes {
            return Err(ApiError::invalid_request(format!(
                "request too large: {size} bytes"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let prev = self.pending.lock().insert(request_id.clone(), tx);
        debug_assert!(prev.is_none(), "request_id collision: {request_id}");

        TraceEvent::RequestDispatched {
            request_id: request_id.clone(),
            method: method.as_str().to_owned(),
        }
        .emit();

        if self.peer.send(envelope).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(ApiError::internal("peer channel closed"));
        }

        let timeout = timeout.unwrap_or_else(|| self.api.request_timeout());
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Sender dropped without resolving — bus torn down.
                self.pending.lock().remove(&request_id);
                Err(ApiError::internal("request abandoned before completion"))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                let timeout_ms = timeout.as_millis() as u64;
                TraceEvent::RequestTimedOut {
                    request_id,
                    method: method.as_str().to_owned(),
                    timeout_ms,
                }
                .emit();
                Err(ApiError::timeout(format!(
                    "no response within {timeout_ms}ms"
                )))
            }
        }
    }

    /// Process one inbound envelope from `origin`.
    ///
    /// Envelopes from a non-whitelisted origin are dropped without any
    /// reply; acknowledging them would leak that the widget is listening.
    pub async fn handle_incoming(
        &self,
        origin: &str,
        envelope: Envelope,
        handler: &dyn RequestHandler,
    ) {
        if !self.api.origin_allowed(origin) {
            TraceEvent::OriginRejected {
                origin: origin.to_owned(),
            }
            .emit();
            return;
        }

        match envelope {
            Envelope::Request(request) => self.handle_request(request, handler).await,
            Envelope::Response(response) => self.complete_request(response),
            Envelope::Event(event) => {
                // Inbound events are the broadcaster's concern; the bus
                // only correlates requests.
                tracing::debug!(event = %event.event, "event envelope ignored by bus");
            }
        }
    }

    async fn handle_request(&self, request: RequestEnvelope, handler: &dyn RequestHandler) {
        let response = match validate_request(
            &request,
            &self.api.version,
            self.api.max_request_bytes,
        ) {
            Ok(method) => match handler.handle_request(method, request.params.clone()).await {
                Ok(data) => ResponseEnvelope::ok(&request, data, &self.api.version),
                Err(error) => ResponseEnvelope::err(&request, error, &self.api.version),
            },
            Err(error) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    method = %request.method,
                    error = %error,
                    "request rejected at boundary"
                );
                ResponseEnvelope::err(&request, error, &self.api.version)
            }
        };

        if self.peer.send(Envelope::Response(response)).await.is_err() {
            tracing::warn!(request_id = %request.request_id, "peer channel closed, response dropped");
        }
    }

    /// Resolve the pending call matching this response. Responses with no
    /// pending entry (late arrivals, replays) are discarded.
    fn complete_request(&self, response: ResponseEnvelope) {
        let Some(tx) = self.pending.lock().remove(&response.request_id) else {
            tracing::debug!(
                request_id = %response.request_id,
                "response for unknown request discarded"
            );
            return;
        };

        TraceEvent::ResponseReceived {
            request_id: response.request_id.clone(),
            success: response.success,
        }
        .emit();

        let outcome = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(response
                .error
                .unwrap_or_else(|| ApiError::internal("error response without a body")))
        };
        let _ = tx.send(outcome);
    }

    /// Fail every in-flight call (teardown).
    pub fn cancel_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, tx) in pending {
            let _ = tx.send(Err(ApiError::internal("bus shut down")));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle_request(
            &self,
            method: ApiMethod,
            params: Option<Value>,
        ) -> Result<Value, ApiError> {
            Ok(json!({"method": method.as_str(), "params": params}))
        }
    }

    fn bus() -> (MessageBus, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        (MessageBus::new(tx, ApiConfig::default()), rx)
    }

    #[tokio::test]
    async fn call_resolves_from_matching_response() {
        let (bus, mut peer_rx) = bus();

        let call = bus.call(ApiMethod::Ping, None, None);
        tokio::pin!(call);

        // Drive the call until the request reaches the peer.
        let request = tokio::select! {
            biased;
            envelope = peer_rx.recv() => envelope.unwrap(),
            _ = &mut call => panic!("call resolved before any response"),
        };
        let Envelope::Request(request) = request else {
            panic!("expected request envelope");
        };

        let response = ResponseEnvelope::ok(&request, json!({"pong": true}), "1.0.0");
        bus.complete_request(response);

        let data = call.await.unwrap();
        assert_eq!(data["pong"], true);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_surfaces_api_error() {
        let (bus, mut peer_rx) = bus();

        let call = bus.call(ApiMethod::GetSessionInfo, None, None);
        tokio::pin!(call);
        let request = tokio::select! {
            biased;
            envelope = peer_rx.recv() => envelope.unwrap(),
            _ = &mut call => panic!("call resolved early"),
        };
        let Envelope::Request(request) = request else {
            panic!("expected request envelope");
        };

        bus.complete_request(ResponseEnvelope::err(
            &request,
            ApiError::new(qh_protocol::ApiErrorCode::SessionNotFound, "no such session"),
            "1.0.0",
        ));

        let err = call.await.unwrap_err();
        assert_eq!(err.code, qh_protocol::ApiErrorCode::SessionNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_and_clears_pending() {
        let (bus, _peer_rx) = bus();

        let err = bus
            .call(ApiMethod::Ping, None, Some(Duration::from_millis(5000)))
            .await
            .unwrap_err();

        assert_eq!(err.code, qh_protocol::ApiErrorCode::Timeout);
        assert!(err.message.contains("5000ms"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn oversized_call_is_rejected_before_send() {
        let (tx, mut peer_rx) = mpsc::channel(16);
        let api = ApiConfig {
            max_request_bytes: 256,
            ..Default::default()
        };
        let bus = MessageBus::new(tx, api);

        let blob = "x".repeat(1024);
        let err = bus
            .call(
                ApiMethod::GetResultsBySessionId,
                Some(json!({ "sessionId": blob })),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, qh_protocol::ApiErrorCode::InvalidRequest);
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_response_is_discarded() {
        let (bus, _peer_rx) = bus();
        let request = RequestEnvelope::new(ApiMethod::Ping, None, "1.0.0");
        // No pending entry for this id; must not panic or leak state.
        bus.complete_request(ResponseEnvelope::ok(&request, Value::Null, "1.0.0"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_response() {
        let (tx, mut peer_rx) = mpsc::channel(16);
        let api = ApiConfig {
            allowed_origins: vec!["https://app.example.com".into()],
            ..Default::default()
        };
        let bus = MessageBus::new(tx, api);

        let request = RequestEnvelope::new(ApiMethod::Ping, None, "1.0.0");
        bus.handle_incoming("https://evil.example.com", Envelope::Request(request), &EchoHandler)
            .await;

        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_request_from_allowed_origin_gets_error_response() {
        let (bus, mut peer_rx) = bus();

        let mut request = RequestEnvelope::new(ApiMethod::Ping, None, "1.0.0");
        request.method = "NOT_A_METHOD".into();
        let request_id = request.request_id.clone();

        bus.handle_incoming("https://anywhere.example", Envelope::Request(request), &EchoHandler)
            .await;

        let Some(Envelope::Response(response)) = peer_rx.recv().await else {
            panic!("expected response envelope");
        };
        assert_eq!(response.request_id, request_id);
        assert!(!response.success);
        assert_eq!(
            response.error.unwrap().code,
            qh_protocol::ApiErrorCode::InvalidRequest
        );
    }

    #[tokio::test]
    async fn valid_request_is_dispatched_to_handler() {
        let (bus, mut peer_rx) = bus();

        let request =
            RequestEnvelope::new(ApiMethod::GetSessionStatus, Some(json!({"sessionId": "s1"})), "1.0.0");
        bus.handle_incoming("https://anywhere.example", Envelope::Request(request), &EchoHandler)
            .await;

        let Some(Envelope::Response(response)) = peer_rx.recv().await else {
            panic!("expected response envelope");
        };
        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["method"], "GET_SESSION_STATUS");
        assert_eq!(data["params"]["sessionId"], "s1");
    }

    #[tokio::test]
    async fn cancel_all_fails_inflight_calls() {
        let (bus, mut peer_rx) = bus();

        let call = bus.call(ApiMethod::Ping, None, None);
        tokio::pin!(call);
        tokio::select! {
            biased;
            _ = peer_rx.recv() => {}
            _ = &mut call => panic!("call resolved early"),
        }

        bus.cancel_all();
        let err = call.await.unwrap_err();
        assert_eq!(err.code, qh_protocol::ApiErrorCode::InternalError);
    }
}
