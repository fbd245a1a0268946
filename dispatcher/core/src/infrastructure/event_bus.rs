// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Named Pub/Sub with Subscription Masks
//
// Event types are registered by name before they can be emitted. Each
// connected session attaches a bounded channel and a set of glob masks;
// an emitted event is pushed to every session with a matching mask. A
// session whose queue is full misses the event; it is never waited on.
// In-process observers get every event through a tokio broadcast channel.

use glob::Pattern;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::error::RpcError;
use crate::domain::event::{Event, EventTypeInfo, EventTypeSpec};
use crate::domain::session::SessionId;

struct Subscriber {
    masks: BTreeSet<String>,
    compiled: Vec<Pattern>,
    sink: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl Subscriber {
    fn matches(&self, name: &str) -> bool {
        self.compiled.iter().any(|pattern| pattern.matches(name))
    }

    /// Queue `event` without waiting; false if it was not delivered
    fn offer(&self, session: SessionId, event: &Event) -> bool {
        match self.sink.try_send(event.clone()) {
            Ok(()) => {
                let missed = self.dropped.swap(0, Ordering::Relaxed);
                if missed > 0 {
                    debug!(session_id = %session, missed, "Session caught up with its event queue");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!(session_id = %session, event_type = %event.name, "Session event queue is full, dropping events");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn recompile(&mut self) {
        // Masks are validated before they enter the set
        self.compiled = self
            .masks
            .iter()
            .filter_map(|mask| Pattern::new(mask).ok())
            .collect();
    }
}

struct Inner {
    sender: broadcast::Sender<Event>,
    types: RwLock<HashMap<String, EventTypeSpec>>,
    sessions: RwLock<HashMap<SessionId, Subscriber>>,
    session_capacity: usize,
}

/// Event bus for registering event types, emitting events and routing them
/// to subscribed sessions
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new event bus. Both the internal broadcast channel and each
    /// session's queue buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                sender,
                types: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                session_capacity: capacity.max(1),
            }),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Registering the same name with identical metadata is a no-op
    pub fn register_event_type(&self, spec: EventTypeSpec) -> Result<(), RpcError> {
        let mut types = self.inner.types.write();
        match types.get(&spec.name) {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(RpcError::already_registered("Event type", &spec.name)),
            None => {
                debug!(event_type = %spec.name, "Registered event type");
                types.insert(spec.name.clone(), spec);
                Ok(())
            }
        }
    }

    pub fn unregister_event_type(&self, name: &str) -> bool {
        self.inner.types.write().remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.types.read().contains_key(name)
    }

    pub fn event_types(&self) -> Vec<EventTypeInfo> {
        let types = self.inner.types.read();
        let sessions = self.inner.sessions.read();
        let mut infos: Vec<EventTypeInfo> = types
            .values()
            .map(|spec| EventTypeInfo {
                spec: spec.clone(),
                subscribers: sessions.values().filter(|s| s.matches(&spec.name)).count(),
            })
            .collect();
        infos.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        infos
    }

    /// True when at least one session's masks match `name`
    pub fn is_active(&self, name: &str) -> bool {
        self.inner
            .sessions
            .read()
            .values()
            .any(|subscriber| subscriber.matches(name))
    }

    /// Emit an event. Unregistered types are logged and dropped.
    /// Returns the number of sessions the event was delivered to.
    pub fn emit(&self, name: &str, args: Value) -> usize {
        if !self.is_registered(name) {
            warn!(event_type = %name, "Dropping event of unregistered type");
            return 0;
        }

        let event = Event::new(name, args);
        debug!(event_type = %name, "Publishing event");

        let mut delivered = 0;
        {
            let sessions = self.inner.sessions.read();
            for (session, subscriber) in sessions.iter() {
                if subscriber.matches(name) && subscriber.offer(*session, &event) {
                    delivered += 1;
                }
            }
        }

        // send() only fails when no observer is listening
        let _ = self.inner.sender.send(event);
        delivered
    }

    /// Attach a session and return the channel its events are delivered on
    pub fn attach(&self, session: SessionId) -> mpsc::Receiver<Event> {
        let (sink, receiver) = mpsc::channel(self.inner.session_capacity);
        self.inner.sessions.write().insert(
            session,
            Subscriber {
                masks: BTreeSet::new(),
                compiled: Vec::new(),
                sink,
                dropped: AtomicU64::new(0),
            },
        );
        receiver
    }

    /// Drop every subscription of a session
    pub fn detach(&self, session: SessionId) {
        self.inner.sessions.write().remove(&session);
    }

    /// Add masks to a session's subscription set; returns the resulting set
    pub fn subscribe(
        &self,
        session: SessionId,
        masks: &[String],
    ) -> Result<Vec<String>, EventBusError> {
        for mask in masks {
            Pattern::new(mask).map_err(|e| EventBusError::InvalidMask {
                mask: mask.clone(),
                reason: e.msg.to_string(),
            })?;
        }

        let mut sessions = self.inner.sessions.write();
        let subscriber = sessions
            .get_mut(&session)
            .ok_or(EventBusError::UnknownSession(session))?;
        subscriber.masks.extend(masks.iter().cloned());
        subscriber.recompile();
        Ok(subscriber.masks.iter().cloned().collect())
    }

    /// Remove masks from a session's subscription set; returns the resulting set
    pub fn unsubscribe(
        &self,
        session: SessionId,
        masks: &[String],
    ) -> Result<Vec<String>, EventBusError> {
        let mut sessions = self.inner.sessions.write();
        let subscriber = sessions
            .get_mut(&session)
            .ok_or(EventBusError::UnknownSession(session))?;
        for mask in masks {
            subscriber.masks.remove(mask);
        }
        subscriber.recompile();
        Ok(subscriber.masks.iter().cloned().collect())
    }

    pub fn masks(&self, session: SessionId) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .get(&session)
            .map(|s| s.masks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to all emitted events, independent of session masks
    pub fn subscribe_all(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Get the number of in-process observers
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }
}

/// Receiver for all events emitted on the bus
pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Errors that can occur when subscribing to or receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),

    #[error("Invalid subscription mask '{mask}': {reason}")]
    InvalidMask { mask: String, reason: String },

    #[error("Session {0} is not attached to the event bus")]
    UnknownSession(SessionId),
}

impl From<EventBusError> for RpcError {
    fn from(err: EventBusError) -> Self {
        match err {
            EventBusError::InvalidMask { .. } => RpcError::invalid_parameters(err.to_string()),
            EventBusError::UnknownSession(_) => RpcError::invalid_state(err.to_string()),
            _ => RpcError::call_error(err.to_string()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use serde_json::json;

    fn bus_with(types: &[&str]) -> EventBus {
        let bus = EventBus::new(16);
        for name in types {
            bus.register_event_type(EventTypeSpec::new(*name)).unwrap();
        }
        bus
    }

    #[test]
    fn test_register_is_idempotent_for_identical_metadata() {
        let bus = EventBus::new(4);
        let spec = EventTypeSpec::new("disk.attached").with_source("devd");
        bus.register_event_type(spec.clone()).unwrap();
        bus.register_event_type(spec).unwrap();

        let err = bus
            .register_event_type(EventTypeSpec::new("disk.attached").with_source("other"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyRegistered);
    }

    #[tokio::test]
    async fn test_delivery_follows_masks() {
        let bus = bus_with(&["task.updated", "system.device.attached"]);
        let session = SessionId::new();
        let mut rx = bus.attach(session);
        bus.subscribe(session, &["task.*".to_string()]).unwrap();

        assert_eq!(bus.emit("system.device.attached", json!({})), 0);
        assert_eq!(bus.emit("task.updated", json!({"id": 1})), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "task.updated");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_type_is_dropped() {
        let bus = bus_with(&[]);
        let session = SessionId::new();
        let mut rx = bus.attach(session);
        bus.subscribe(session, &["*".to_string()]).unwrap();
        let mut observer = bus.subscribe_all();

        assert_eq!(bus.emit("nobody.registered", json!({})), 0);
        assert!(rx.try_recv().is_err());
        assert!(matches!(observer.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_subscribe_then_unsubscribe_is_empty() {
        let bus = bus_with(&["task.updated"]);
        let session = SessionId::new();
        let _rx = bus.attach(session);

        let masks = bus.subscribe(session, &["*".to_string()]).unwrap();
        assert_eq!(masks, vec!["*".to_string()]);
        assert!(bus.is_active("task.updated"));

        let masks = bus.unsubscribe(session, &["*".to_string()]).unwrap();
        assert!(masks.is_empty());
        assert!(!bus.is_active("task.updated"));
    }

    #[test]
    fn test_invalid_mask_rejected() {
        let bus = bus_with(&[]);
        let session = SessionId::new();
        let _rx = bus.attach(session);
        let err = bus.subscribe(session, &["[".to_string()]).unwrap_err();
        assert!(matches!(err, EventBusError::InvalidMask { .. }));
        assert!(bus.masks(session).is_empty());
    }

    #[test]
    fn test_refcount_tracks_sessions() {
        let bus = bus_with(&["task.progress"]);
        let a = SessionId::new();
        let b = SessionId::new();
        let _ra = bus.attach(a);
        let _rb = bus.attach(b);
        bus.subscribe(a, &["task.*".to_string()]).unwrap();
        bus.subscribe(b, &["*".to_string()]).unwrap();

        assert_eq!(bus.event_types()[0].subscribers, 2);
        bus.detach(a);
        assert_eq!(bus.event_types()[0].subscribers, 1);
    }

    #[tokio::test]
    async fn test_internal_observer_receives_everything() {
        let bus = bus_with(&["a.b", "c.d"]);
        let mut observer = bus.subscribe_all();
        bus.emit("a.b", json!({}));
        bus.emit("c.d", json!({}));
        assert_eq!(observer.recv().await.unwrap().name, "a.b");
        assert_eq!(observer.recv().await.unwrap().name, "c.d");
    }

    #[tokio::test]
    async fn test_slow_session_misses_events_beyond_its_queue() {
        let bus = EventBus::new(4);
        bus.register_event_type(EventTypeSpec::new("seq.tick")).unwrap();
        let slow = SessionId::new();
        let mut rx = bus.attach(slow);
        bus.subscribe(slow, &["*".to_string()]).unwrap();

        let delivered: Vec<usize> = (0..6).map(|i| bus.emit("seq.tick", json!({"n": i}))).collect();
        assert_eq!(delivered, vec![1, 1, 1, 1, 0, 0]);

        for i in 0..4 {
            assert_eq!(rx.recv().await.unwrap().args["n"], i);
        }
        assert!(rx.try_recv().is_err());

        // Room again once drained
        assert_eq!(bus.emit("seq.tick", json!({"n": 6})), 1);
        assert_eq!(rx.recv().await.unwrap().args["n"], 6);
    }

    #[tokio::test]
    async fn test_single_emitter_order_is_preserved() {
        let bus = EventBus::new(64);
        bus.register_event_type(EventTypeSpec::new("seq.tick")).unwrap();
        let session = SessionId::new();
        let mut rx = bus.attach(session);
        bus.subscribe(session, &["seq.*".to_string()]).unwrap();

        for i in 0..50 {
            bus.emit("seq.tick", json!({"n": i}));
        }
        for i in 0..50 {
            assert_eq!(rx.recv().await.unwrap().args["n"], i);
        }
    }
}
