//! The table extension's bus-facing half: turns `table/*` wire events into
//! calls against the right [`ServerTable`], and exposes the three generic
//! item endpoints (`table/item_get`, `table/item_fetch`, `table/item_size`)
//! through the endpoint extension so callers reach any table the same way
//! they reach any other RPC.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::TableError;
use crate::event_bus::{BoxFuture, EventBus};
use crate::extensions::endpoint::{typed_local, EndpointExtension};
use crate::extensions::ServerListener;
use crate::session::Session;
use crate::wire::{
    TableClearPayload, TableInfo, TableItemFetchRequest, TableItemFetchResponse, TableItemGetRequest,
    TableItemGetResponse, TableItemSizeRequest, TableItemSizeResponse, TableItemsPayload, TableKeysPayload,
    TABLE_ITEM_ADD, TABLE_ITEM_CLEAR, TABLE_ITEM_FETCH, TABLE_ITEM_GET, TABLE_ITEM_REMOVE, TABLE_ITEM_SIZE,
    TABLE_ITEM_UPDATE, TABLE_LISTEN, TABLE_REGISTER,
};

use super::server_table::{DynTable, ServerTable};

/// Owns every table registered on the hub, dynamic-dispatched behind
/// [`DynTable`] so the replication protocol never needs to know a table's
/// item type.
pub struct TableExtension {
    tables: RwLock<HashMap<String, Arc<dyn DynTable>>>,
    data_path: PathBuf,
    tracked_sessions: RwLock<HashSet<String>>,
}

impl TableExtension {
    pub async fn new(bus: Arc<EventBus>, data_path: PathBuf, endpoint_ext: Arc<EndpointExtension>) -> Arc<Self> {
        let this = Arc::new(Self {
            tables: RwLock::new(HashMap::new()),
            data_path,
            tracked_sessions: RwLock::new(HashSet::new()),
        });

        bus.register(&TABLE_REGISTER).ok();
        bus.register(&TABLE_LISTEN).ok();
        bus.register(&TABLE_ITEM_ADD).ok();
        bus.register(&TABLE_ITEM_UPDATE).ok();
        bus.register(&TABLE_ITEM_REMOVE).ok();
        bus.register(&TABLE_ITEM_CLEAR).ok();

        let register_ext = this.clone();
        bus.on(&TABLE_REGISTER, move |session, info: TableInfo| {
            let ext = register_ext.clone();
            async move { ext.handle_register(session, info).await }
        });

        let listen_ext = this.clone();
        bus.on(&TABLE_LISTEN, move |session, table_key: String| {
            let ext = listen_ext.clone();
            async move { ext.handle_listen(session, table_key).await }
        });

        let add_ext = this.clone();
        bus.on(&TABLE_ITEM_ADD, move |_session, payload: TableItemsPayload| {
            let ext = add_ext.clone();
            async move { ext.handle_item_add(payload).await }
        });

        let update_ext = this.clone();
        bus.on(&TABLE_ITEM_UPDATE, move |_session, payload: TableItemsPayload| {
            let ext = update_ext.clone();
            async move { ext.handle_item_update(payload).await }
        });

        let remove_ext = this.clone();
        bus.on(&TABLE_ITEM_REMOVE, move |_session, payload: TableKeysPayload| {
            let ext = remove_ext.clone();
            async move { ext.handle_item_remove(payload).await }
        });

        let clear_ext = this.clone();
        bus.on(&TABLE_ITEM_CLEAR, move |_session, payload: TableClearPayload| {
            let ext = clear_ext.clone();
            async move { ext.handle_item_clear(payload).await }
        });

        let get_ext = this.clone();
        endpoint_ext
            .register_local(
                TABLE_ITEM_GET,
                typed_local(move |req: TableItemGetRequest| {
                    let ext = get_ext.clone();
                    async move { ext.handle_item_get(req).await }
                }),
            )
            .await;

        let fetch_ext = this.clone();
        endpoint_ext
            .register_local(
                TABLE_ITEM_FETCH,
                typed_local(move |req: TableItemFetchRequest| {
                    let ext = fetch_ext.clone();
                    async move { ext.handle_item_fetch(req).await }
                }),
            )
            .await;

        let size_ext = this.clone();
        endpoint_ext
            .register_local(
                TABLE_ITEM_SIZE,
                typed_local(move |req: TableItemSizeRequest| {
                    let ext = size_ext.clone();
                    async move { ext.handle_item_size(req).await }
                }),
            )
            .await;

        this
    }

    /// Registers a typed table owned by another extension (the endpoint
    /// extension's own `endpoints` table, the server extension's `apps`
    /// table) into the shared registry so it becomes reachable through the
    /// generic `table/listen`/`table/item_fetch` protocol.
    pub async fn register_existing(&self, table: Arc<dyn DynTable>) {
        let key = table.key();
        self.tables.write().await.entry(key).or_insert(table);
    }

    /// Builds and registers a new typed table.
    pub async fn register<T>(&self, info: TableInfo) -> Result<Arc<ServerTable<T>>, TableError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let table = ServerTable::<T>::new(info, &self.data_path)?;
        self.register_existing(table.clone()).await;
        Ok(table)
    }

    /// Registers a table whose item shape is only known at the wire level —
    /// a client's `table/register` with an opaque schema. `serde_json::Value`
    /// is trivially both the storage and wire type, so this reuses the exact
    /// same [`ServerTable`] machinery as a typed local table.
    async fn register_from_info(&self, info: TableInfo) -> Result<Arc<dyn DynTable>, TableError> {
        let key = info.key();
        {
            let tables = self.tables.read().await;
            if let Some(existing) = tables.get(&key) {
                return Ok(existing.clone());
            }
        }
        let table: Arc<dyn DynTable> = ServerTable::<Value>::new(info, &self.data_path)?;
        if let Err(err) = table.load().await {
            warn!(table = %key, error = %err, "failed to load newly registered table from disk");
        }
        let mut tables = self.tables.write().await;
        Ok(tables.entry(key).or_insert(table).clone())
    }

    async fn lookup(&self, table_key: &str) -> Option<Arc<dyn DynTable>> {
        self.tables.read().await.get(table_key).cloned()
    }

    async fn handle_register(&self, _session: Arc<Session>, info: TableInfo) {
        if let Err(err) = self.register_from_info(info.clone()).await {
            warn!(table = %info.key(), error = %err, "failed to register table");
        }
    }

    async fn handle_listen(self: Arc<Self>, session: Arc<Session>, table_key: String) {
        let Some(table) = self.lookup(&table_key).await else {
            warn!(table = %table_key, session = %session.key(), "listen requested for unknown table");
            return;
        };
        table.attach_session(session.clone()).await;
        self.ensure_disconnect_tracked(session).await;
    }

    /// A session's first `table/listen` registers one disconnect hook that
    /// detaches it from every table, rather than one hook per table —
    /// `ServerTable::detach_session` on a table the session never joined is
    /// just a no-op removal.
    async fn ensure_disconnect_tracked(self: &Arc<Self>, session: Arc<Session>) {
        let key = session.key();
        {
            let tracked = self.tracked_sessions.read().await;
            if tracked.contains(&key) {
                return;
            }
        }
        let mut tracked = self.tracked_sessions.write().await;
        if !tracked.insert(key) {
            return;
        }
        let ext = self.clone();
        session.add_disconnect_listener(Arc::new(move |disconnected| {
            let ext = ext.clone();
            Box::pin(async move {
                ext.detach_everywhere(&disconnected.key()).await;
            })
        }));
    }

    async fn detach_everywhere(&self, session_key: &str) {
        let tables: Vec<Arc<dyn DynTable>> = self.tables.read().await.values().cloned().collect();
        for table in tables {
            table.detach_session(session_key).await;
        }
    }

    async fn handle_item_add(&self, payload: TableItemsPayload) {
        let Some(table) = self.lookup(&payload.table_key).await else {
            warn!(table = %payload.table_key, "item_add for unknown table");
            return;
        };
        if let Err(err) = table.add_json(payload.items).await {
            warn!(table = %payload.table_key, error = %err, "failed to add items");
        }
    }

    async fn handle_item_update(&self, payload: TableItemsPayload) {
        let Some(table) = self.lookup(&payload.table_key).await else {
            warn!(table = %payload.table_key, "item_update for unknown table");
            return;
        };
        if let Err(err) = table.update_json(payload.items).await {
            warn!(table = %payload.table_key, error = %err, "failed to update items");
        }
    }

    async fn handle_item_remove(&self, payload: TableKeysPayload) {
        let Some(table) = self.lookup(&payload.table_key).await else {
            warn!(table = %payload.table_key, "item_remove for unknown table");
            return;
        };
        if let Err(err) = table.remove_json(payload.keys).await {
            warn!(table = %payload.table_key, error = %err, "failed to remove items");
        }
    }

    async fn handle_item_clear(&self, payload: TableClearPayload) {
        let Some(table) = self.lookup(&payload.table_key).await else {
            warn!(table = %payload.table_key, "item_clear for unknown table");
            return;
        };
        if let Err(err) = table.clear_json().await {
            warn!(table = %payload.table_key, error = %err, "failed to clear table");
        }
    }

    async fn handle_item_get(&self, req: TableItemGetRequest) -> Result<TableItemGetResponse, String> {
        let table = self.lookup(&req.table_key).await.ok_or_else(|| "Table not found".to_owned())?;
        let keys = if req.keys.is_empty() { vec![req.key.clone()] } else { req.keys.clone() };
        let items = table.get_all_json(keys).await.map_err(|err| err.to_string())?;
        Ok(TableItemGetResponse { table_key: req.table_key, key: req.key, items })
    }

    async fn handle_item_fetch(&self, req: TableItemFetchRequest) -> Result<TableItemFetchResponse, String> {
        let table = self.lookup(&req.table_key).await.ok_or_else(|| "Table not found".to_owned())?;
        let items = table.fetch_json(req.limit, req.cursor.clone()).await.map_err(|err| err.to_string())?;
        Ok(TableItemFetchResponse { table_key: req.table_key, key: req.key, items })
    }

    async fn handle_item_size(&self, req: TableItemSizeRequest) -> Result<TableItemSizeResponse, String> {
        let table = self.lookup(&req.table_key).await.ok_or_else(|| "Table not found".to_owned())?;
        let size = table.size().await.map_err(|err| err.to_string())?;
        Ok(TableItemSizeResponse { table_key: req.table_key, key: req.key, size })
    }
}

impl ServerListener for TableExtension {
    fn on_initialized<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let tables: Vec<Arc<dyn DynTable>> = self.tables.read().await.values().cloned().collect();
            for table in tables {
                if let Err(err) = table.load().await {
                    warn!(table = %table.key(), error = %err, "failed to load table from disk");
                }
            }
        })
    }

    fn on_shutdown<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let tables: Vec<Arc<dyn DynTable>> = self.tables.read().await.values().cloned().collect();
            for table in tables {
                if let Err(err) = table.save().await {
                    warn!(table = %table.key(), error = %err, "failed to save table on shutdown");
                }
            }
        })
    }
}
