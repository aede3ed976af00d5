//! Accepts connections, performs the handshake via [`Session`], keeps the
//! live-session registry keyed by `App::key()`, and fans out connect /
//! disconnect notifications.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::event_bus::{BoxFuture, EventBus};
use crate::session::{DisconnectHook, Session};
use crate::wire::Address;

pub type ConnectHook = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Owns the transport acceptor and the live-session registry.
pub struct Network {
    pub address: Address,
    bus: Arc<EventBus>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    connect_listeners: RwLock<Vec<ConnectHook>>,
    disconnect_listeners: RwLock<Vec<DisconnectHook>>,
}

impl Network {
    pub fn new(address: Address, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            address,
            bus,
            sessions: RwLock::new(HashMap::new()),
            connect_listeners: RwLock::new(Vec::new()),
            disconnect_listeners: RwLock::new(Vec::new()),
        })
    }

    pub async fn add_connect_listener(&self, hook: ConnectHook) {
        self.connect_listeners.write().await.push(hook);
    }

    pub async fn add_disconnect_listener(&self, hook: DisconnectHook) {
        self.disconnect_listeners.write().await.push(hook);
    }

    pub async fn session(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Binds the configured address and serves the upgrade route in a
    /// detached background task. Returns the bound address, which may
    /// differ from `self.address` when the configured port is `0`.
    pub async fn start(self: Arc<Self>) -> std::io::Result<std::net::SocketAddr> {
        let listener = tokio::net::TcpListener::bind((self.address.host.as_str(), self.address.port)).await?;
        let bound = listener.local_addr()?;
        let router = self.clone().router();
        info!(address = %self.address, bound = %bound, "websocket listener bound");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!(error = %err, "websocket listener stopped unexpectedly");
            }
        });
        Ok(bound)
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(self)
    }

    /// Handshakes, replaces any stale session sharing the same key, fires
    /// connect listeners, then drives the session's read loop to
    /// completion.
    pub async fn accept(self: Arc<Self>, socket: axum::extract::ws::WebSocket) {
        let session = match Session::handshake(socket).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "dropping connection: handshake failed");
                return;
            }
        };

        let key = session.key();
        let previous = {
            let mut sessions = self.sessions.write().await;
            let previous = sessions.insert(key.clone(), session.clone());
            previous
        };
        if let Some(previous) = previous {
            info!(key = %key, "newer session replacing stale session with the same identity");
            previous.disconnect().await;
        }

        let this = self.clone();
        let hook_key = key.clone();
        session.add_disconnect_listener(Arc::new(move |disconnected| {
            let this = this.clone();
            let hook_key = hook_key.clone();
            Box::pin(async move {
                this.handle_session_disconnected(hook_key, disconnected).await;
            })
        }));

        info!(key = %key, "session connected");
        let connect_listeners = self.connect_listeners.read().await.clone();
        for listener in connect_listeners {
            listener(session.clone()).await;
        }

        session.listen(self.bus.clone()).await;
    }

    async fn handle_session_disconnected(&self, key: String, session: Arc<Session>) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(current) = sessions.get(&key) {
                if Arc::ptr_eq(current, &session) {
                    sessions.remove(&key);
                }
            }
        }
        info!(key = %key, "session disconnected");
        let disconnect_listeners = self.disconnect_listeners.read().await.clone();
        for listener in disconnect_listeners {
            listener(session.clone()).await;
        }
    }
}

async fn ws_handler(State(network): State<Arc<Network>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { network.accept(socket).await })
}
