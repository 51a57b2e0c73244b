//! Event broadcaster — peer envelopes plus local subscriptions.
//!
//! A broadcast does three things, in order: hands an event envelope to the
//! peer sink (if one is attached), invokes local handlers registered for
//! that event type in registration order, and publishes the envelope on a
//! same-process notification channel. A panicking handler is isolated so
//! the handlers after it still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use qh_domain::trace::TraceEvent;
use qh_protocol::{ApiEventType, Envelope, EventEnvelope};

use crate::bus::PeerSink;

/// Token returned by [`EventBroadcaster::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

const NOTIFY_CAPACITY: usize = 64;

pub struct EventBroadcaster {
    peer: Option<PeerSink>,
    version: String,
    listeners: Mutex<HashMap<ApiEventType, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
    notify: broadcast::Sender<EventEnvelope>,
}

impl EventBroadcaster {
    pub fn new(peer: Option<PeerSink>, version: &str) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            peer,
            version: version.to_owned(),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notify,
        }
    }

    /// Register a handler for one event type. Handlers for the same type
    /// fire in registration order.
    pub fn on<F>(&self, event: ApiEventType, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Unknown ids are a no-op.
    pub fn off(&self, event: ApiEventType, id: HandlerId) {
        if let Some(handlers) = self.listeners.lock().get_mut(&event) {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Subscribe to every broadcast as envelopes on a same-process channel.
    /// Slow subscribers miss events rather than applying backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.notify.subscribe()
    }

    /// Broadcast one event to the peer, local handlers, and subscribers.
    pub fn broadcast(&self, event: ApiEventType, payload: Value, session_id: Option<&str>) {
        let envelope = EventEnvelope::new(
            event,
            payload,
            &self.version,
            session_id.map(str::to_owned),
        );

        TraceEvent::EventBroadcast {
            event: event.as_str().to_owned(),
            session_id: session_id.map(str::to_owned),
        }
        .emit();

        if let Some(peer) = &self.peer {
            if let Err(e) = peer.try_send(Envelope::Event(envelope.clone())) {
                tracing::warn!(event = %event, error = %e, "peer event dropped");
            }
        }

        // Snapshot the handlers, then release the lock before invoking:
        // a handler may itself call on()/off().
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .get(&event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope.payload))).is_err() {
                tracing::error!(event = %event, "event handler panicked");
            }
        }

        // No receivers is fine.
        let _ = self.notify.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[test]
    fn handlers_fire_in_registration_order() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            broadcaster.on(ApiEventType::MeasurementComplete, move |_| {
                order.lock().push(label);
            });
        }

        broadcaster.broadcast(ApiEventType::MeasurementComplete, json!({}), None);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        let reached = Arc::new(AtomicUsize::new(0));

        broadcaster.on(ApiEventType::Error, |_| panic!("boom"));
        {
            let reached = Arc::clone(&reached);
            broadcaster.on(ApiEventType::Error, move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
            });
        }

        broadcaster.broadcast(ApiEventType::Error, json!({"code": "X"}), None);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        let count = Arc::new(AtomicUsize::new(0));

        let id = {
            let count = Arc::clone(&count);
            broadcaster.on(ApiEventType::SessionCreated, move |_| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };
        {
            let count = Arc::clone(&count);
            broadcaster.on(ApiEventType::SessionCreated, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        broadcaster.off(ApiEventType::SessionCreated, id);
        broadcaster.broadcast(ApiEventType::SessionCreated, json!({}), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_only_sees_its_event_type() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            broadcaster.on(ApiEventType::MeasurementFailed, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        broadcaster.broadcast(ApiEventType::MeasurementComplete, json!({}), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peer_receives_event_envelope() {
        let (tx, mut rx) = mpsc::channel(8);
        let broadcaster = EventBroadcaster::new(Some(tx), "1.0.0");

        broadcaster.broadcast(
            ApiEventType::MeasurementStarted,
            json!({"sessionId": "s1"}),
            Some("s1"),
        );

        let Some(Envelope::Event(envelope)) = rx.recv().await else {
            panic!("expected event envelope");
        };
        assert_eq!(envelope.event, ApiEventType::MeasurementStarted);
        assert_eq!(envelope.session_id.as_deref(), Some("s1"));
        assert_eq!(envelope.version, "1.0.0");
    }

    #[tokio::test]
    async fn subscribers_see_every_event() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        let mut sub = broadcaster.subscribe();

        broadcaster.broadcast(ApiEventType::SessionExpired, json!({"sessionId": "s1"}), Some("s1"));
        broadcaster.broadcast(ApiEventType::Error, json!({"code": "E"}), None);

        assert_eq!(sub.recv().await.unwrap().event, ApiEventType::SessionExpired);
        assert_eq!(sub.recv().await.unwrap().event, ApiEventType::Error);
    }

    #[test]
    fn broadcast_without_peer_or_listeners_is_harmless() {
        let broadcaster = EventBroadcaster::new(None, "1.0.0");
        broadcaster.broadcast(ApiEventType::SessionCreated, json!({}), None);
    }
}
