//! Events emitted to sync listeners.
//!
//! Two families share one listener stream: engine events, tagged by `type`,
//! and channel events, tagged by `status`. Both serialize to the JSON shape
//! hosts consume.

use crate::state::{SyncPhase, SyncState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Step reported by a `phase` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Pull request.
    Pull,
    /// Waiting for the host queue.
    DrainQueue,
    /// Push request.
    Push,
}

/// Event produced by the sync state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The engine entered a new state.
    State {
        /// New state.
        state: SyncState,
    },
    /// An attempt started.
    SyncStart {
        /// Reason given to `start`.
        reason: String,
    },
    /// A start request was coalesced into the running attempt.
    SyncQueued {
        /// Reason given to `start`.
        reason: String,
    },
    /// An attempt entered a step.
    Phase {
        /// Step entered.
        phase: AttemptPhase,
        /// 1-based attempt number within the session.
        attempt: u32,
    },
    /// An HTTP response was received.
    Http {
        /// Request phase.
        phase: SyncPhase,
        /// HTTP status code.
        status: u16,
    },
    /// A retry was scheduled after a retriable failure.
    RetryScheduled {
        /// Retry number.
        attempt: u32,
        /// Backoff before the retry.
        #[serde(rename = "delayMs")]
        delay_ms: u64,
        /// Failure that caused the retry.
        message: String,
    },
    /// The server rejected the credentials.
    AuthRequired,
    /// Authentication was given up.
    AuthFailed,
    /// The attempt failed.
    Error {
        /// Failure description.
        message: String,
    },
    /// The host must flush its outbound queue and acknowledge.
    DrainQueue,
}

/// Connection notification fed in by the host's realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// The channel connected.
    Connected,
    /// The channel disconnected.
    Disconnected,
    /// The channel reported an error.
    Error {
        /// Error payload.
        #[serde(default)]
        data: Value,
    },
    /// Remote data changed; triggers a sync.
    Cdc,
}

/// Any event delivered to sync listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncEvent {
    /// Engine event.
    Engine(EngineEvent),
    /// Channel event.
    Channel(ChannelEvent),
}

impl SyncEvent {
    /// Returns the event as a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Returns the engine event, if any.
    pub fn as_engine(&self) -> Option<&EngineEvent> {
        match self {
            SyncEvent::Engine(event) => Some(event),
            SyncEvent::Channel(_) => None,
        }
    }
}

impl From<EngineEvent> for SyncEvent {
    fn from(event: EngineEvent) -> Self {
        SyncEvent::Engine(event)
    }
}

impl From<ChannelEvent> for SyncEvent {
    fn from(event: ChannelEvent) -> Self {
        SyncEvent::Channel(event)
    }
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Registered sync listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener; returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers an event to every listener in registration order.
    ///
    /// The lock is released before listeners run, so a listener may add or
    /// remove listeners. A panicking listener is logged and skipped; the
    /// remaining listeners still receive the event.
    pub fn emit(&self, event: &SyncEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(listeners = snapshot.len(), ?event, "emitting sync event");
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(?event, "sync listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn engine_event_shapes() {
        let event = SyncEvent::from(EngineEvent::State {
            state: SyncState::Syncing(SyncPhase::Pull),
        });
        assert_eq!(event.to_json(), json!({"type": "state", "state": "syncing(pull)"}));

        let event = SyncEvent::from(EngineEvent::RetryScheduled {
            attempt: 2,
            delay_ms: 2000,
            message: "network error: reset".into(),
        });
        assert_eq!(
            event.to_json(),
            json!({"type": "retry_scheduled", "attempt": 2, "delayMs": 2000, "message": "network error: reset"})
        );

        let event = SyncEvent::from(EngineEvent::Phase {
            phase: AttemptPhase::DrainQueue,
            attempt: 1,
        });
        assert_eq!(
            event.to_json(),
            json!({"type": "phase", "phase": "drain_queue", "attempt": 1})
        );

        assert_eq!(
            SyncEvent::from(EngineEvent::AuthRequired).to_json(),
            json!({"type": "auth_required"})
        );
        assert_eq!(
            SyncEvent::from(EngineEvent::Http {
                phase: SyncPhase::Push,
                status: 503
            })
            .to_json(),
            json!({"type": "http", "phase": "push", "status": 503})
        );
    }

    #[test]
    fn channel_event_shapes() {
        let cdc: ChannelEvent = serde_json::from_value(json!({"status": "cdc"})).unwrap();
        assert_eq!(cdc, ChannelEvent::Cdc);

        let error: ChannelEvent =
            serde_json::from_value(json!({"status": "error", "data": {"code": 1}})).unwrap();
        assert_eq!(error, ChannelEvent::Error { data: json!({"code": 1}) });

        assert_eq!(
            SyncEvent::from(ChannelEvent::Connected).to_json(),
            json!({"status": "connected"})
        );
    }

    #[test]
    fn listeners_receive_in_order_and_can_be_removed() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let first = registry.add(move |event| sink.lock().push(("first", event.clone())));
        let sink = Arc::clone(&seen);
        registry.add(move |event| sink.lock().push(("second", event.clone())));

        registry.emit(&EngineEvent::DrainQueue.into());
        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        registry.emit(&EngineEvent::AuthFailed.into());

        let seen = seen.lock();
        let names: Vec<&str> = seen.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["first", "second", "second"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listener_may_unregister_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot = Arc::new(Mutex::new(None));

        let reg = Arc::clone(&registry);
        let own = Arc::clone(&slot);
        let id = registry.add(move |_| {
            if let Some(id) = *own.lock() {
                reg.remove(id);
            }
        });
        *slot.lock() = Some(id);

        registry.emit(&EngineEvent::DrainQueue.into());
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(0));

        registry.add(|_| panic!("listener bug"));
        let sink = Arc::clone(&seen);
        registry.add(move |_| *sink.lock() += 1);

        registry.emit(&EngineEvent::DrainQueue.into());
        registry.emit(&EngineEvent::AuthFailed.into());
        assert_eq!(*seen.lock(), 2);
        assert_eq!(registry.len(), 2);
    }
}
