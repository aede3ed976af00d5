//! Typed event registry with fan-out dispatch, keyed by wire type name.
//!
//! Registration is static (each name may be claimed once); listener
//! dispatch is dynamic and keyed by the same string, since the wire
//! envelope carries a type name rather than a Rust type.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::session::Session;
use crate::wire::{EventEnvelope, EventType};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type RawListener = Arc<dyn Fn(Arc<Session>, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-server typed event registry and listener fan-out.
#[derive(Default)]
pub struct EventBus {
    registered: Mutex<HashSet<&'static str>>,
    listeners: Mutex<HashMap<&'static str, Vec<RawListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims an event type's wire name. Re-registering the same name is a
    /// configuration error, not a runtime one.
    pub fn register<T>(&self, event_type: &EventType<T>) -> Result<(), RegistryError> {
        let mut registered = self.registered.lock().unwrap();
        if !registered.insert(event_type.name) {
            return Err(RegistryError::Duplicate(event_type.name.to_owned()));
        }
        Ok(())
    }

    /// Adds a listener for `event_type`, composing JSON decoding with the
    /// typed callback. Listeners for the same type fire in registration
    /// order.
    pub fn on<T, F, Fut>(&self, event_type: &EventType<T>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Arc<Session>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = event_type.name;
        let wrapped: RawListener = Arc::new(move |session, value| match serde_json::from_value::<T>(value) {
            Ok(payload) => Box::pin(handler(session, payload)) as BoxFuture<'static, ()>,
            Err(err) => {
                warn!(event = name, error = %err, "dropping event: payload does not match registered shape");
                Box::pin(async {})
            }
        });
        self.listeners.lock().unwrap().entry(name).or_default().push(wrapped);
    }

    /// Dispatches one inbound envelope to every listener registered for its
    /// type, sequentially, in registration order. Unknown types are dropped.
    pub async fn dispatch(&self, session: Arc<Session>, envelope: EventEnvelope) {
        let listeners = {
            let guard = self.listeners.lock().unwrap();
            match guard.get(envelope.kind.as_str()) {
                Some(listeners) => listeners.clone(),
                None => {
                    debug!(event = %envelope.kind, "no listeners registered for event type");
                    return;
                }
            }
        };
        for listener in listeners {
            listener(session.clone(), envelope.data.clone()).await;
        }
    }
}
