//! Scoped publish/subscribe event bus.
//!
//! The [`EventBus`] is an explicitly constructed registry: components receive
//! an `Arc<EventBus>` at startup instead of reaching for a global. Event types
//! are registered with [`EventBus::define`] and published under a [`Scope`].
//!
//! Delivery is synchronous and in publish order. A subscription bound to one
//! scope never sees events published under another; global subscriptions
//! ([`EventBus::subscribe_global`]) see everything. A callback that fails or
//! panics is logged and does not affect the remaining callbacks.
//!
//! Consumers that should never slow down publication use
//! [`EventBus::subscribe_channel`], which forwards envelopes into an
//! unbounded channel.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::with_builtin_events();
//! let scope = Scope::session(&session_id);
//! let (_handle, mut rx) = bus.subscribe_channel(Some(scope.clone()));
//! bus.publish_event(&SessionStatusChanged { session_id, status: SessionStatus::Done }, &scope)?;
//! assert_eq!(rx.recv().await.map(|e| e.event_type), Some("session.status".into()));
//! ```

use crate::error::AgentError;
use crate::types::SessionId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Subscriber callback. Errors and panics are logged by the bus, never
/// propagated.
pub type Callback = Arc<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// Reports whether a subscription can still receive events.
type Liveness = Box<dyn Fn() -> bool + Send + Sync>;

/// Wildcard event type accepted by [`EventBus::subscribe`].
pub const WILDCARD: &str = "*";

/// Execution context an event is published under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Session(SessionId),
    Named(String),
}

impl Scope {
    #[must_use]
    pub fn session(id: &SessionId) -> Self {
        Self::Session(id.clone())
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Session(id) => Some(id),
            Self::Named(_) => None,
        }
    }
}

/// Wire shape delivered to every subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<SessionId>,
}

impl EventEnvelope {
    /// Decode the payload as `E` if the envelope carries that event type.
    #[must_use]
    pub fn decode<E: BusEvent>(&self) -> Option<E> {
        if self.event_type != E::TYPE {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    #[must_use]
    pub fn is<E: BusEvent>(&self) -> bool {
        self.event_type == E::TYPE
    }
}

/// A typed event with a registered name and schema.
pub trait BusEvent: Serialize + DeserializeOwned {
    const TYPE: &'static str;

    fn schema() -> Value;
}

/// Handle returned by subscribe calls, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Binding {
    Scoped(Scope),
    Global,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    Type(String),
    Any,
}

struct Subscription {
    id: u64,
    binding: Binding,
    target: Target,
    once: bool,
    callback: Callback,
    alive: Option<Liveness>,
}

impl Subscription {
    fn is_alive(&self) -> bool {
        self.alive.as_ref().is_none_or(|alive| alive())
    }

    fn matches(&self, event_type: &str, scope: &Scope) -> bool {
        let scope_ok = match &self.binding {
            Binding::Global => true,
            Binding::Scoped(bound) => bound == scope,
        };
        let type_ok = match &self.target {
            Target::Any => true,
            Target::Type(t) => t == event_type,
        };
        scope_ok && type_ok
    }
}

#[derive(Default)]
struct Registry {
    definitions: HashMap<String, Value>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

/// Scoped, typed publish/subscribe registry.
#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("definitions", &registry.definitions.len())
            .field("subscriptions", &registry.subscriptions.len())
            .finish()
    }
}

impl EventBus {
    /// An empty bus with no event types defined.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with every runtime event type already defined.
    #[must_use]
    pub fn with_builtin_events() -> Self {
        let bus = Self::new();
        {
            let mut registry = bus.write();
            for (event_type, schema) in crate::events::builtin_definitions() {
                registry.definitions.insert(event_type.to_string(), schema);
            }
        }
        bus
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an event type. Re-registering with an identical schema is a
    /// no-op; a different schema fails with [`AgentError::DuplicateType`].
    ///
    /// # Errors
    /// Returns `DuplicateType` when the type exists with another schema.
    pub fn define(&self, event_type: impl Into<String>, schema: Value) -> Result<(), AgentError> {
        let event_type = event_type.into();
        let mut registry = self.write();
        match registry.definitions.get(&event_type) {
            Some(existing) if *existing == schema => Ok(()),
            Some(_) => Err(AgentError::DuplicateType { event_type }),
            None => {
                registry.definitions.insert(event_type, schema);
                Ok(())
            }
        }
    }

    /// Register a typed event.
    ///
    /// # Errors
    /// Returns `DuplicateType` when the type exists with another schema.
    pub fn define_event<E: BusEvent>(&self) -> Result<(), AgentError> {
        self.define(E::TYPE, E::schema())
    }

    #[must_use]
    pub fn is_defined(&self, event_type: &str) -> bool {
        self.read().definitions.contains_key(event_type)
    }

    /// Publish `payload` under `scope`, delivering synchronously to every
    /// matching subscriber. Returns the number of callbacks invoked.
    ///
    /// # Errors
    /// Returns `UnknownEventType` for undefined types and `InvalidPayload`
    /// when the payload misses a field the schema requires.
    pub fn publish(
        &self,
        event_type: &str,
        payload: Value,
        scope: &Scope,
    ) -> Result<usize, AgentError> {
        let callbacks: Vec<Callback> = {
            let mut registry = self.write();
            let schema = registry.definitions.get(event_type).ok_or_else(|| {
                AgentError::UnknownEventType {
                    event_type: event_type.to_string(),
                }
            })?;
            validate(event_type, schema, &payload)?;

            registry.subscriptions.retain(Subscription::is_alive);
            let callbacks = registry
                .subscriptions
                .iter()
                .filter(|s| s.matches(event_type, scope))
                .map(|s| Arc::clone(&s.callback))
                .collect();
            registry
                .subscriptions
                .retain(|s| !(s.once && s.matches(event_type, scope)));
            callbacks
        };

        let envelope = EventEnvelope {
            event_type: event_type.to_string(),
            data: payload,
            timestamp: OffsetDateTime::now_utc(),
            session_id: scope.session_id().cloned(),
        };

        for callback in &callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Event subscriber failed (event_type={event_type}, error={e:#})");
                }
                Err(_) => {
                    log::error!("Event subscriber panicked (event_type={event_type})");
                }
            }
        }

        Ok(callbacks.len())
    }

    /// Publish a typed event.
    ///
    /// # Errors
    /// See [`EventBus::publish`]; serialization failures are `Internal`.
    pub fn publish_event<E: BusEvent>(&self, event: &E, scope: &Scope) -> Result<usize, AgentError> {
        let payload = serde_json::to_value(event).map_err(anyhow::Error::from)?;
        self.publish(E::TYPE, payload, scope)
    }

    fn insert(
        &self,
        binding: Binding,
        target: Target,
        once: bool,
        callback: Callback,
        alive: Option<Liveness>,
    ) -> SubscriptionHandle {
        let mut registry = self.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscriptions.push(Subscription {
            id,
            binding,
            target,
            once,
            callback,
            alive,
        });
        SubscriptionHandle(id)
    }

    fn target(event_type: &str) -> Target {
        if event_type == WILDCARD {
            Target::Any
        } else {
            Target::Type(event_type.to_string())
        }
    }

    /// Subscribe to `event_type` (or [`WILDCARD`]) within `scope`.
    pub fn subscribe<F>(&self, scope: Scope, event_type: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(
            Binding::Scoped(scope),
            Self::target(event_type),
            false,
            Arc::new(callback),
            None,
        )
    }

    /// Like [`EventBus::subscribe`], removed after the first delivery.
    pub fn subscribe_once<F>(&self, scope: Scope, event_type: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(
            Binding::Scoped(scope),
            Self::target(event_type),
            true,
            Arc::new(callback),
            None,
        )
    }

    /// Cross-scope wildcard: receives every event published on the bus.
    pub fn subscribe_global<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(Binding::Global, Target::Any, false, Arc::new(callback), None)
    }

    /// Forward every event of `scope` (or of all scopes, when `None`) into a
    /// channel. The subscription is removed on the first publish after the
    /// receiver is dropped.
    pub fn subscribe_channel(
        &self,
        scope: Option<Scope>,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = tx.clone();
        let alive: Liveness = Box::new(move || !watcher.is_closed());
        let forward = move |envelope: &EventEnvelope| {
            tx.send(envelope.clone())
                .map_err(|_| anyhow::anyhow!("channel subscriber disconnected"))
        };
        let binding = scope.map_or(Binding::Global, Binding::Scoped);
        let handle = self.insert(binding, Target::Any, false, Arc::new(forward), Some(alive));
        (handle, rx)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut registry = self.write();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != handle.0);
        registry.subscriptions.len() != before
    }

    /// Live subscriptions; channel subscribers whose receiver is gone are
    /// not counted.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.read()
            .subscriptions
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }

    /// Drop every subscription. Definitions are kept.
    pub fn clear(&self) {
        self.write().subscriptions.clear();
    }
}

fn validate(event_type: &str, schema: &Value, payload: &Value) -> Result<(), AgentError> {
    let invalid = |reason: String| AgentError::InvalidPayload {
        event_type: event_type.to_string(),
        reason,
    };

    if schema.get("type").and_then(Value::as_str) == Some("object") && !payload.is_object() {
        return Err(invalid("expected an object".to_string()));
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if payload.get(field).is_none() {
                return Err(invalid(format!("missing field `{field}`")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn bus_with(types: &[&str]) -> EventBus {
        let bus = EventBus::new();
        for t in types {
            bus.define(*t, json!({"type": "object", "required": ["n"]}))
                .ok();
        }
        bus
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |label: &str| -> Callback {
            let log = Arc::clone(&log_clone);
            let label = label.to_string();
            Arc::new(move |e: &EventEnvelope| {
                log.lock()
                    .map_err(|_| anyhow::anyhow!("poisoned"))?
                    .push(format!("{label}:{}:{}", e.event_type, e.data["n"]));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn define_is_idempotent_but_rejects_conflicts() {
        let bus = EventBus::new();
        assert!(bus.define("a", json!({"required": ["x"]})).is_ok());
        assert!(bus.define("a", json!({"required": ["x"]})).is_ok());
        let err = bus.define("a", json!({"required": ["y"]}));
        assert!(matches!(err, Err(AgentError::DuplicateType { .. })));
    }

    #[test]
    fn publish_requires_definition_and_schema_fields() {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        assert!(matches!(
            bus.publish("missing", json!({"n": 1}), &scope),
            Err(AgentError::UnknownEventType { .. })
        ));
        assert!(matches!(
            bus.publish("a", json!({"other": 1}), &scope),
            Err(AgentError::InvalidPayload { .. })
        ));
        assert!(matches!(
            bus.publish("a", json!(5), &scope),
            Err(AgentError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn delivers_in_publish_order_to_type_and_wildcard_subscribers() -> anyhow::Result<()> {
        let bus = bus_with(&["a", "b"]);
        let scope = Scope::named("s");
        let (log, make) = recorder();

        let cb_a = make("typed");
        let cb_all = make("all");
        bus.subscribe(scope.clone(), "a", move |e| cb_a(e));
        bus.subscribe(scope.clone(), WILDCARD, move |e| cb_all(e));

        bus.publish("a", json!({"n": 1}), &scope)?;
        bus.publish("b", json!({"n": 2}), &scope)?;
        bus.publish("a", json!({"n": 3}), &scope)?;

        let seen = log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
        assert_eq!(
            seen,
            vec!["typed:a:1", "all:a:1", "all:b:2", "typed:a:3", "all:a:3"]
        );
        Ok(())
    }

    #[test]
    fn scopes_are_isolated_except_for_global_subscribers() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let s1 = Scope::named("one");
        let s2 = Scope::named("two");
        let (log, make) = recorder();

        let cb_one = make("one");
        let cb_global = make("global");
        bus.subscribe(s1.clone(), WILDCARD, move |e| cb_one(e));
        bus.subscribe_global(move |e| cb_global(e));

        assert_eq!(bus.publish("a", json!({"n": 1}), &s2)?, 1);
        assert_eq!(bus.publish("a", json!({"n": 2}), &s1)?, 2);

        let seen = log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
        assert_eq!(seen, vec!["global:a:1", "one:a:2", "global:a:2"]);
        Ok(())
    }

    #[test]
    fn subscribe_once_fires_a_single_time() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        let (log, make) = recorder();
        let cb = make("once");
        bus.subscribe_once(scope.clone(), "a", move |e| cb(e));

        bus.publish("a", json!({"n": 1}), &scope)?;
        bus.publish("a", json!({"n": 2}), &scope)?;

        assert_eq!(log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
        Ok(())
    }

    #[test]
    fn failing_callback_does_not_stop_delivery() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        let (log, make) = recorder();
        let cb = make("after");

        bus.subscribe(scope.clone(), "a", |_| Err(anyhow::anyhow!("boom")));
        bus.subscribe(scope.clone(), "a", move |e| cb(e));

        assert_eq!(bus.publish("a", json!({"n": 1}), &scope)?, 2);
        assert_eq!(log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        let (log, make) = recorder();
        let cb = make("after");

        bus.subscribe(scope.clone(), "a", |_| panic!("subscriber bug"));
        bus.subscribe(scope.clone(), "a", move |e| cb(e));

        assert_eq!(bus.publish("a", json!({"n": 1}), &scope)?, 2);
        assert_eq!(bus.publish("a", json!({"n": 2}), &scope)?, 2);
        assert_eq!(log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.len(), 2);
        Ok(())
    }

    #[test]
    fn unsubscribe_removes_handle() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        let handle = bus.subscribe(scope.clone(), "a", |_| Ok(()));
        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        assert_eq!(bus.publish("a", json!({"n": 1}), &scope)?, 0);
        Ok(())
    }

    #[test]
    fn callbacks_may_subscribe_during_delivery() -> anyhow::Result<()> {
        let bus = Arc::new(bus_with(&["a"]));
        let scope = Scope::named("s");
        let inner = Arc::clone(&bus);
        let inner_scope = scope.clone();
        bus.subscribe_once(scope.clone(), "a", move |_| {
            inner.subscribe(inner_scope.clone(), "a", |_| Ok(()));
            Ok(())
        });

        bus.publish("a", json!({"n": 1}), &scope)?;
        assert_eq!(bus.subscriber_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn channel_subscriber_receives_envelopes() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let session = SessionId::from_string("ses_1");
        let scope = Scope::session(&session);
        let (_handle, mut rx) = bus.subscribe_channel(Some(scope.clone()));

        bus.publish("a", json!({"n": 7}), &scope)?;
        let envelope = rx.recv().await.ok_or_else(|| anyhow::anyhow!("no event"))?;
        assert_eq!(envelope.event_type, "a");
        assert_eq!(envelope.session_id, Some(session));

        let value = serde_json::to_value(&envelope)?;
        assert_eq!(value["type"], "a");
        assert_eq!(value["data"]["n"], 7);
        assert_eq!(value["sessionId"], "ses_1");
        assert!(value["timestamp"].is_string());
        Ok(())
    }

    #[test]
    fn dropped_channel_receiver_is_unsubscribed() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let scope = Scope::named("s");
        let (_handle, rx) = bus.subscribe_channel(Some(scope.clone()));
        assert_eq!(bus.publish("a", json!({"n": 1}), &scope)?, 1);

        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("a", json!({"n": 2}), &scope)?, 0);
        assert_eq!(bus.publish("a", json!({"n": 3}), &scope)?, 0);
        assert_eq!(bus.read().subscriptions.len(), 0);
        Ok(())
    }

    #[test]
    fn named_scope_envelope_omits_session_id() -> anyhow::Result<()> {
        let bus = bus_with(&["a"]);
        let (_handle, mut rx) = bus.subscribe_channel(None);
        bus.publish("a", json!({"n": 1}), &Scope::named("req"))?;
        let envelope = rx.try_recv()?;
        let value = serde_json::to_value(&envelope)?;
        assert!(value.get("sessionId").is_none());
        Ok(())
    }

    #[test]
    fn concurrent_publishers_are_safe() -> anyhow::Result<()> {
        let bus = Arc::new(bus_with(&["a"]));
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe_global(move |_| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    let scope = Scope::named(format!("s{i}"));
                    for n in 0..50 {
                        bus.publish("a", json!({"n": n}), &scope).ok();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("thread panicked"))?;
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 400);
        Ok(())
    }
}
