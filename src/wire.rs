//! Wire-level types: the handshake identity, the envelope every frame is
//! carried in, and the payload shapes used by the built-in extensions.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bind address for the hub's WebSocket listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", if self.secure { "wss" } else { "ws" }, self.host, self.port)
    }
}

/// Identity announced by a client as the first frame on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub version: String,
}

impl App {
    /// Stable identity used to index the live-session table. Two sessions
    /// sharing a key may never both be alive; the newer replaces the older.
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }
}

/// The wire form every frame takes: a discriminator plus an opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// A registered event kind. Carries no runtime state beyond its wire name;
/// `T` exists purely to let [`crate::event_bus::EventBus::on`] and
/// [`crate::session::Session::send`] check payload shapes at compile time.
pub struct EventType<T> {
    pub name: &'static str,
    marker: PhantomData<fn() -> T>,
}

impl<T> EventType<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, marker: PhantomData }
    }
}

impl<T> Clone for EventType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EventType<T> {}

// -- Endpoint extension wire payloads ---------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCallPayload {
    #[serde(rename = "type")]
    pub endpoint_key: String,
    pub key: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointReceivePayload {
    #[serde(rename = "type")]
    pub endpoint_key: String,
    pub key: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointErrorPayload {
    #[serde(rename = "type")]
    pub endpoint_key: String,
    pub key: String,
    pub error: String,
}

// -- Table extension wire payloads ------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub extension: String,
    pub name: String,
    #[serde(default)]
    pub use_database: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache_size: Option<usize>,
}

impl TableInfo {
    pub fn key(&self) -> String {
        format!("{}:{}", self.extension, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemsPayload {
    #[serde(rename = "type")]
    pub table_key: String,
    pub items: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableKeysPayload {
    #[serde(rename = "type")]
    pub table_key: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemGetRequest {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemGetResponse {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
    pub items: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemFetchRequest {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
    pub limit: i64,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemFetchResponse {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
    pub items: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemSizeRequest {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableItemSizeResponse {
    #[serde(rename = "type")]
    pub table_key: String,
    pub key: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableClearPayload {
    #[serde(rename = "type")]
    pub table_key: String,
}

// -- Event type constants -----------------------------------------------
//
// Every wire name the core dispatches on, gathered here so extensions
// register against one shared source of truth instead of re-typing string
// literals.

pub const ENDPOINT_REGISTER: EventType<EndpointInfo> = EventType::new("endpoint/register");
pub const ENDPOINT_CALL: EventType<EndpointCallPayload> = EventType::new("endpoint/call");
pub const ENDPOINT_RECEIVE: EventType<EndpointReceivePayload> = EventType::new("endpoint/receive");
pub const ENDPOINT_ERROR: EventType<EndpointErrorPayload> = EventType::new("endpoint/error");

pub const TABLE_REGISTER: EventType<TableInfo> = EventType::new("table/register");
pub const TABLE_LISTEN: EventType<String> = EventType::new("table/listen");
pub const TABLE_ITEM_ADD: EventType<TableItemsPayload> = EventType::new("table/item_add");
pub const TABLE_ITEM_UPDATE: EventType<TableItemsPayload> = EventType::new("table/item_update");
pub const TABLE_ITEM_REMOVE: EventType<TableKeysPayload> = EventType::new("table/item_remove");
pub const TABLE_ITEM_CLEAR: EventType<TableClearPayload> = EventType::new("table/item_clear");

/// Same wire name as [`TABLE_ITEM_REMOVE`], typed for the outbound direction
/// only: replication to listening sessions carries the removed items
/// themselves, not just their keys, matching `table/item_add`/`item_update`.
pub const TABLE_ITEM_REMOVE_NOTIFY: EventType<TableItemsPayload> = EventType::new("table/item_remove");

pub const TABLE_ITEM_GET: &str = "table/item_get";
pub const TABLE_ITEM_FETCH: &str = "table/item_fetch";
pub const TABLE_ITEM_SIZE: &str = "table/item_size";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_key_joins_group_and_name() {
        let app = App { name: "a".into(), group: "g".into(), version: "1".into() };
        assert_eq!(app.key(), "g/a");
    }

    #[test]
    fn table_info_key_joins_extension_and_name() {
        let info = TableInfo { extension: "ext".into(), name: "t".into(), use_database: false, cache: false, cache_size: None };
        assert_eq!(info.key(), "ext:t");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = EventEnvelope { kind: "table/listen".into(), data: Value::String("ext:t".into()) };
        let text = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, "table/listen");
        assert_eq!(back.data, Value::String("ext:t".into()));
    }

    #[test]
    fn address_display_reflects_security() {
        let addr = Address { host: "localhost".into(), port: 26423, secure: false };
        assert_eq!(addr.to_string(), "ws://localhost:26423");
    }
}
