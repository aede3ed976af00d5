//! Request/response RPC layered over the event bus: a session (or a local
//! handler) registers an endpoint key; callers invoke it and get routed a
//! `receive` or `error` back, correlated by a caller-chosen key.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::TableError;
use crate::event_bus::{BoxFuture, EventBus};
use crate::extensions::table::ServerTable;
use crate::extensions::ServerListener;
use crate::session::Session;
use crate::wire::{
    EndpointCallPayload, EndpointErrorPayload, EndpointInfo, EndpointReceivePayload, ENDPOINT_CALL, ENDPOINT_ERROR,
    ENDPOINT_RECEIVE, ENDPOINT_REGISTER,
};

/// A local handler taking the raw request JSON and producing either the raw
/// response JSON or a human-readable error message.
pub type LocalHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Wraps a typed async function as a [`LocalHandler`], matching the "deserialize,
/// invoke, serialize" shape of a `ServerEndpoint`.
pub fn typed_local<Req, Res, F, Fut>(handler: F) -> LocalHandler
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, String>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |value: Value| {
        let handler = handler.clone();
        Box::pin(async move {
            let req: Req = serde_json::from_value(value).map_err(|err| format!("invalid request: {err}"))?;
            let res = handler(req).await?;
            serde_json::to_value(res).map_err(|err| format!("failed to serialize response: {err}"))
        }) as BoxFuture<'static, Result<Value, String>>
    })
}

enum Provider {
    Session(Arc<Session>),
    Local(LocalHandler),
}

struct CallState {
    caller: Arc<Session>,
    endpoint_key: String,
    correlation_key: String,
}

fn call_key(endpoint_key: &str, correlation_key: &str) -> String {
    format!("{endpoint_key}:{correlation_key}")
}

/// Correlates remote callers with remote (or local) providers across the
/// event bus's `endpoint/*` event kinds.
pub struct EndpointExtension {
    providers: RwLock<HashMap<String, Provider>>,
    calls: RwLock<HashMap<String, CallState>>,
    caller_index: RwLock<HashMap<String, HashSet<String>>>,
    endpoints_table: Arc<ServerTable<EndpointInfo>>,
}

impl EndpointExtension {
    pub fn new(bus: Arc<EventBus>, data_path: &Path) -> Result<Arc<Self>, TableError> {
        let info = crate::wire::TableInfo {
            extension: "server".into(),
            name: "endpoints".into(),
            use_database: false,
            cache: false,
            cache_size: None,
        };
        let endpoints_table = ServerTable::new(info, data_path)?;

        let this = Arc::new(Self {
            providers: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            caller_index: RwLock::new(HashMap::new()),
            endpoints_table,
        });

        bus.register(&ENDPOINT_REGISTER).ok();
        bus.register(&ENDPOINT_CALL).ok();
        bus.register(&ENDPOINT_RECEIVE).ok();
        bus.register(&ENDPOINT_ERROR).ok();

        let register_ext = this.clone();
        bus.on(&ENDPOINT_REGISTER, move |session, info: EndpointInfo| {
            let ext = register_ext.clone();
            async move { ext.register_session_provider(session, info).await }
        });

        let call_ext = this.clone();
        bus.on(&ENDPOINT_CALL, move |session, payload: EndpointCallPayload| {
            let ext = call_ext.clone();
            async move { ext.handle_call(session, payload).await }
        });

        let receive_ext = this.clone();
        bus.on(&ENDPOINT_RECEIVE, move |session, payload: EndpointReceivePayload| {
            let ext = receive_ext.clone();
            async move { ext.handle_response(session, payload.endpoint_key, payload.key, Ok(payload.data)).await }
        });

        let error_ext = this.clone();
        bus.on(&ENDPOINT_ERROR, move |session, payload: EndpointErrorPayload| {
            let ext = error_ext.clone();
            async move { ext.handle_response(session, payload.endpoint_key, payload.key, Err(payload.error)).await }
        });

        Ok(this)
    }

    pub fn endpoints_table(&self) -> Arc<ServerTable<EndpointInfo>> {
        self.endpoints_table.clone()
    }

    /// Makes the `endpoints` table reachable through the generic
    /// `table/listen`/`table/item_fetch` protocol, the same way
    /// `ServerExtension` registers its `apps` table. Called once from
    /// `Server::new`, after the table extension exists (the endpoint
    /// extension is constructed first, so this can't happen in `new`).
    pub async fn register_endpoints_table(&self, table_ext: &crate::extensions::table::TableExtension) {
        table_ext.register_existing(self.endpoints_table.clone()).await;
    }

    /// Binds `key` to an in-process handler rather than a remote session.
    /// Used by other extensions (the table extension's item endpoints) to
    /// expose server-local RPCs over the same wire protocol as remote ones.
    pub async fn register_local(&self, key: impl Into<String>, handler: LocalHandler) {
        let key = key.into();
        self.providers.write().await.insert(key.clone(), Provider::Local(handler));
        let _ = self.endpoints_table.add_one(key.clone(), EndpointInfo { key }).await;
    }

    async fn register_session_provider(&self, session: Arc<Session>, info: EndpointInfo) {
        info!(endpoint = %info.key, session = %session.key(), "endpoint registered");
        self.providers.write().await.insert(info.key.clone(), Provider::Session(session));
        let _ = self.endpoints_table.add_one(info.key.clone(), info).await;
    }

    async fn handle_call(&self, caller: Arc<Session>, payload: EndpointCallPayload) {
        let EndpointCallPayload { endpoint_key, key, data } = payload;
        let provider = {
            let providers = self.providers.read().await;
            match providers.get(&endpoint_key) {
                Some(Provider::Session(session)) => Some(ProviderSnapshot::Session(session.clone())),
                Some(Provider::Local(handler)) => Some(ProviderSnapshot::Local(handler.clone())),
                None => None,
            }
        };

        match provider {
            None => {
                let message = match self.endpoints_table.get(&endpoint_key).await {
                    Ok(Some(_)) => "Endpoint not connected",
                    _ => "Endpoint not found",
                };
                self.send_error(&caller, &endpoint_key, &key, message).await;
            }
            Some(ProviderSnapshot::Session(provider_session)) => {
                if provider_session.is_closed() {
                    self.send_error(&caller, &endpoint_key, &key, "Endpoint not connected").await;
                    return;
                }
                self.record_call(caller.clone(), endpoint_key.clone(), key.clone()).await;
                let forward = EndpointCallPayload { endpoint_key: endpoint_key.clone(), key: key.clone(), data };
                if let Err(err) = provider_session.send(&ENDPOINT_CALL, &forward).await {
                    warn!(endpoint = %endpoint_key, error = %err, "failed to forward call to provider session");
                }
            }
            Some(ProviderSnapshot::Local(handler)) => match handler(data).await {
                Ok(response) => {
                    let payload = EndpointReceivePayload { endpoint_key, key, data: response };
                    if let Err(err) = caller.send(&ENDPOINT_RECEIVE, &payload).await {
                        warn!(error = %err, "failed to deliver local endpoint response");
                    }
                }
                Err(message) => {
                    warn!(endpoint = %endpoint_key, error = %message, "local endpoint handler failed");
                    self.send_error(&caller, &endpoint_key, &key, &message).await;
                }
            },
        }
    }

    async fn record_call(&self, caller: Arc<Session>, endpoint_key: String, correlation_key: String) {
        let caller_key = caller.key();
        let entry_key = call_key(&endpoint_key, &correlation_key);
        self.calls.write().await.insert(entry_key.clone(), CallState { caller, endpoint_key, correlation_key });
        self.caller_index.write().await.entry(caller_key).or_default().insert(entry_key);
    }

    /// A provider (remote session or the hub itself) answered a call. Looks
    /// up the recorded caller and forwards the response; an unrecognized
    /// `(endpoint_key, key)` pair means the responder answered a call the
    /// hub never routed, so the hub bounces an error back to them instead.
    async fn handle_response(&self, responder: Arc<Session>, endpoint_key: String, key: String, result: Result<Value, String>) {
        let entry_key = call_key(&endpoint_key, &key);
        let state = self.calls.write().await.remove(&entry_key);
        let Some(state) = state else {
            self.send_error(&responder, &endpoint_key, &key, "Endpoint not connected").await;
            return;
        };
        if let Some(set) = self.caller_index.write().await.get_mut(&state.caller.key()) {
            set.remove(&entry_key);
        }

        match result {
            Ok(data) => {
                let payload = EndpointReceivePayload { endpoint_key: state.endpoint_key, key: state.correlation_key, data };
                if let Err(err) = state.caller.send(&ENDPOINT_RECEIVE, &payload).await {
                    warn!(error = %err, "failed to deliver endpoint response to caller");
                }
            }
            Err(message) => {
                self.send_error(&state.caller, &state.endpoint_key, &state.correlation_key, &message).await;
            }
        }
    }

    async fn send_error(&self, session: &Arc<Session>, endpoint_key: &str, key: &str, message: &str) {
        let payload = EndpointErrorPayload { endpoint_key: endpoint_key.to_owned(), key: key.to_owned(), error: message.to_owned() };
        if let Err(err) = session.send(&ENDPOINT_ERROR, &payload).await {
            warn!(error = %err, "failed to deliver endpoint error to caller");
        }
    }

    /// Purges every outstanding call entry a disconnected caller left
    /// behind, so a long-lived caller that never disconnects is the only
    /// way to accumulate unbounded state (see the design notes on endpoint
    /// call garbage collection).
    pub async fn purge_caller(&self, session_key: &str) {
        let Some(keys) = self.caller_index.write().await.remove(session_key) else { return };
        let mut calls = self.calls.write().await;
        for key in keys {
            calls.remove(&key);
        }
    }
}

enum ProviderSnapshot {
    Session(Arc<Session>),
    Local(LocalHandler),
}

impl ServerListener for EndpointExtension {
    fn on_initialized<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.endpoints_table.load().await {
                warn!(error = %err, "failed to load endpoints table from disk");
            }

            let locals: Vec<String> = self
                .providers
                .read()
                .await
                .iter()
                .filter_map(|(key, provider)| matches!(provider, Provider::Local(_)).then(|| key.clone()))
                .collect();
            for key in locals {
                if let Err(err) = self.endpoints_table.add_one(key.clone(), EndpointInfo { key: key.clone() }).await {
                    warn!(endpoint = %key, error = %err, "failed to reconcile local endpoint into endpoints table");
                }
            }

            if let Err(err) = self.endpoints_table.save().await {
                warn!(error = %err, "failed to save endpoints table after reconciliation");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::App;

    fn test_app(name: &str) -> App {
        App { name: name.into(), group: "g".into(), version: "1".into() }
    }

    #[tokio::test]
    async fn call_with_no_provider_yields_endpoint_not_found() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        let (caller, mut rx) = Session::new_for_test(test_app("c"));

        ext.handle_call(caller, EndpointCallPayload { endpoint_key: "svc:ping".into(), key: "1".into(), data: Value::Null }).await;

        let msg = rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "endpoint/error");
        let payload: EndpointErrorPayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.error, "Endpoint not found");
    }

    #[tokio::test]
    async fn call_to_persisted_but_unregistered_endpoint_yields_not_connected() {
        // Simulates a restart: the endpoint was registered in a prior process
        // (so it's in the endpoints table) but hasn't reconnected yet, so it
        // has no entry in the in-memory `providers` map.
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        ext.endpoints_table.add_one("svc:ping".into(), EndpointInfo { key: "svc:ping".into() }).await.unwrap();

        let (caller, mut rx) = Session::new_for_test(test_app("c"));
        ext.handle_call(caller, EndpointCallPayload { endpoint_key: "svc:ping".into(), key: "1".into(), data: Value::Null }).await;

        let msg = rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        let payload: EndpointErrorPayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.error, "Endpoint not connected");
    }

    #[tokio::test]
    async fn call_to_disconnected_session_provider_yields_not_connected() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        let (provider, _prx) = Session::new_for_test(test_app("p"));
        provider.disconnect().await;
        ext.register_session_provider(provider, EndpointInfo { key: "svc:ping".into() }).await;

        let (caller, mut rx) = Session::new_for_test(test_app("c"));
        ext.handle_call(caller, EndpointCallPayload { endpoint_key: "svc:ping".into(), key: "1".into(), data: Value::Null }).await;

        let msg = rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        let payload: EndpointErrorPayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.error, "Endpoint not connected");
    }

    #[tokio::test]
    async fn call_is_forwarded_to_provider_and_response_routed_back_to_caller() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();

        let (provider, mut provider_rx) = Session::new_for_test(test_app("p"));
        ext.register_session_provider(provider.clone(), EndpointInfo { key: "svc:ping".into() }).await;

        let (caller, mut caller_rx) = Session::new_for_test(test_app("c"));
        ext.handle_call(caller, EndpointCallPayload { endpoint_key: "svc:ping".into(), key: "1".into(), data: Value::Null }).await;

        let msg = provider_rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "endpoint/call");

        ext.handle_response(provider, "svc:ping".into(), "1".into(), Ok(serde_json::json!("pong"))).await;

        let msg = caller_rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "endpoint/receive");
        let payload: EndpointReceivePayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.data, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn local_handler_runs_in_process_and_replies_directly() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        ext.register_local("svc:echo", typed_local(|req: String| async move { Ok::<_, String>(req) })).await;

        let (caller, mut rx) = Session::new_for_test(test_app("c"));
        ext.handle_call(caller, EndpointCallPayload { endpoint_key: "svc:echo".into(), key: "1".into(), data: serde_json::json!("hi") }).await;

        let msg = rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        let payload: EndpointReceivePayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.data, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn response_with_no_matching_call_bounces_error_back_to_responder() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        let (responder, mut rx) = Session::new_for_test(test_app("r"));

        ext.handle_response(responder, "svc:ping".into(), "unknown".into(), Ok(Value::Null)).await;

        let msg = rx.recv().await.unwrap();
        let axum::extract::ws::Message::Text(text) = msg else { panic!() };
        let envelope: crate::wire::EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "endpoint/error");
    }

    #[tokio::test]
    async fn purge_caller_drops_its_outstanding_calls() {
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let ext = EndpointExtension::new(bus, dir.path()).unwrap();
        let (provider, _prx) = Session::new_for_test(test_app("p"));
        ext.register_session_provider(provider, EndpointInfo { key: "svc:ping".into() }).await;

        let (caller, mut rx) = Session::new_for_test(test_app("c"));
        ext.handle_call(caller.clone(), EndpointCallPayload { endpoint_key: "svc:ping".into(), key: "1".into(), data: Value::Null }).await;
        let _ = rx.recv().await;

        assert_eq!(ext.calls.read().await.len(), 1);
        ext.purge_caller(&caller.key()).await;
        assert!(ext.calls.read().await.is_empty());
    }
}
