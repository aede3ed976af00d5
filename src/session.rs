//! Per-connection framing: handshake, inbound dispatch, outbound send,
//! and orderly, idempotent shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::error::SessionError;
use crate::event_bus::{BoxFuture, EventBus};
use crate::wire::{App, EventEnvelope, EventType};

type BoxedSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;
type BoxedStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

/// Invoked with the session that just disconnected.
pub type DisconnectHook = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A single client connection: one transport, one handshake identity, one
/// outbound send queue, and the set of observers notified on disconnect.
pub struct Session {
    pub id: String,
    app: RwLock<App>,
    outbound: AsyncMutex<BoxedSink>,
    inbound: AsyncMutex<Option<BoxedStream>>,
    closed: AtomicBool,
    disconnect_listeners: RwLock<Vec<DisconnectHook>>,
}

impl Session {
    /// Reads the first frame as the handshake `App` identity. A malformed
    /// or absent handshake fails closed without constructing a session.
    pub async fn handshake(socket: WebSocket) -> Result<Arc<Session>, SessionError> {
        let (sink, mut stream) = socket.split();
        let app = match stream.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<App>(&text)?,
            Some(Ok(_)) => return Err(SessionError::Handshake("expected a text handshake frame".into())),
            Some(Err(err)) => return Err(SessionError::Transport(err)),
            None => return Err(SessionError::Handshake("connection closed before handshake".into())),
        };
        Ok(Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            app: RwLock::new(app),
            outbound: AsyncMutex::new(Box::pin(sink)),
            inbound: AsyncMutex::new(Some(Box::pin(stream))),
            closed: AtomicBool::new(false),
            disconnect_listeners: RwLock::new(Vec::new()),
        }))
    }

    pub fn app(&self) -> App {
        self.app.read().unwrap().clone()
    }

    pub fn key(&self) -> String {
        self.app.read().unwrap().key()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn add_disconnect_listener(&self, hook: DisconnectHook) {
        self.disconnect_listeners.write().unwrap().push(hook);
    }

    /// Serializes `data` into `{type, data}` and writes one text frame.
    /// Sends on a closed session fail without touching the transport.
    pub async fn send<T: Serialize>(&self, event_type: &EventType<T>, data: &T) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let envelope = EventEnvelope {
            kind: event_type.name.to_owned(),
            data: serde_json::to_value(data)?,
        };
        let text = serde_json::to_string(&envelope)?;
        let mut sink = self.outbound.lock().await;
        sink.send(Message::Text(text.into())).await.map_err(SessionError::Transport)
    }

    /// Consumes inbound frames until the transport closes or errors,
    /// dispatching each as an [`EventEnvelope`] through `bus`. Always ends
    /// in a call to [`Session::disconnect`].
    pub async fn listen(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut stream = match self.inbound.lock().await.take() {
            Some(stream) => stream,
            None => return,
        };
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<EventEnvelope>(&text) {
                    Ok(envelope) => bus.dispatch(self.clone(), envelope).await,
                    Err(err) => warn!(session = %self.id, error = %err, "dropping malformed frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(session = %self.id, error = %err, "transport error, closing session");
                    break;
                }
            }
        }
        self.disconnect().await;
    }

    /// Idempotent: closes the transport best-effort, flips the closed
    /// flag once, and fans out to every disconnect listener exactly once.
    pub async fn disconnect(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut sink = self.outbound.lock().await;
            let _ = sink.close().await;
        }
        let listeners = self.disconnect_listeners.read().unwrap().clone();
        for listener in listeners {
            listener(self.clone()).await;
        }
    }

    #[cfg(test)]
    pub fn new_for_test(app: App) -> (Arc<Session>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let sink = futures_util::sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg)
                .map_err(|_| axum::Error::new(std::io::Error::other("test sink closed")))?;
            Ok::<_, axum::Error>(tx)
        });
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            app: RwLock::new(app),
            outbound: AsyncMutex::new(Box::pin(sink)),
            inbound: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
            disconnect_listeners: RwLock::new(Vec::new()),
        });
        (session, rx)
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
    async fn send_on_closed_session_fails_without_writing() {
        let (session, mut rx) = Session::new_for_test(test_app("a"));
        session.disconnect().await;
        let greet: EventType<String> = EventType::new("greet");
        let err = session.send(&greet, &"hi".to_owned()).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_serializes_envelope_shape() {
        let (session, mut rx) = Session::new_for_test(test_app("a"));
        let greet: EventType<String> = EventType::new("greet");
        session.send(&greet, &"hi".to_owned()).await.unwrap();
        let Message::Text(text) = rx.recv().await.unwrap() else { panic!("expected text frame") };
        let envelope: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "greet");
        assert_eq!(envelope.data, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_notifies_once() {
        let (session, _rx) = Session::new_for_test(test_app("a"));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        session.add_disconnect_listener(Arc::new(move |_session| {
            let calls_clone = calls_clone.clone();
            Box::pin(async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
        }));
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn key_combines_group_and_name() {
        let (session, _rx) = Session::new_for_test(test_app("alpha"));
        assert_eq!(session.key(), "g/alpha");
    }
}
