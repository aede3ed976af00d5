//! `ServerTable<T>`: the authoritative in-server representation of one
//! client-visible table — a storage adapter, an optional LRU cache, and the
//! set of sessions subscribed to its mutations.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::warn;

use crate::error::TableError;
use crate::event_bus::BoxFuture;
use crate::session::Session;
use crate::wire::{TableClearPayload, TableInfo, TableItemsPayload, TABLE_ITEM_ADD, TABLE_ITEM_CLEAR, TABLE_ITEM_REMOVE_NOTIFY, TABLE_ITEM_UPDATE};

use super::json_adapter::JsonAdapter;
use super::sql_adapter::SqlAdapter;

const DEFAULT_CACHE_SIZE: usize = 512;

enum StorageAdapter {
    Json(JsonAdapter),
    Sql(SqlAdapter),
}

impl StorageAdapter {
    async fn load(&self) -> Result<(), TableError> {
        match self {
            Self::Json(a) => a.load().await,
            Self::Sql(a) => a.load().await,
        }
    }

    async fn store(&self) -> Result<(), TableError> {
        match self {
            Self::Json(a) => a.store().await,
            Self::Sql(a) => a.store().await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TableError> {
        match self {
            Self::Json(a) => a.get(key).await,
            Self::Sql(a) => a.get(key).await,
        }
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, Value>, TableError> {
        match self {
            Self::Json(a) => a.get_all(keys).await,
            Self::Sql(a) => a.get_all(keys).await,
        }
    }

    async fn set_all(&self, items: HashMap<String, Value>) -> Result<(), TableError> {
        match self {
            Self::Json(a) => a.set_all(items).await,
            Self::Sql(a) => a.set_all(items).await,
        }
    }

    async fn remove_all(&self, keys: &[String]) -> Result<(), TableError> {
        match self {
            Self::Json(a) => a.remove_all(keys).await,
            Self::Sql(a) => a.remove_all(keys).await,
        }
    }

    async fn clear(&self) -> Result<(), TableError> {
        match self {
            Self::Json(a) => a.clear().await,
            Self::Sql(a) => a.clear().await,
        }
    }

    async fn size(&self) -> Result<usize, TableError> {
        match self {
            Self::Json(a) => a.size().await,
            Self::Sql(a) => a.size().await,
        }
    }

    async fn fetch_forward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        match self {
            Self::Json(a) => a.fetch_forward(limit, cursor).await,
            Self::Sql(a) => a.fetch_forward(limit, cursor).await,
        }
    }

    async fn fetch_backward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        match self {
            Self::Json(a) => a.fetch_backward(limit, cursor).await,
            Self::Sql(a) => a.fetch_backward(limit, cursor).await,
        }
    }
}

/// Hint cache over decoded items. A miss always falls back to the adapter;
/// the cache is never the only copy of the truth.
struct Cache {
    capacity: usize,
    map: HashMap<String, Value>,
    order: VecDeque<String>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self { capacity, map: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).cloned()
    }

    fn put(&mut self, key: String, value: Value) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Notified of a table's mutations once a session subscribes to it. The
/// only implementation shipped here is [`SessionTableHandler`], but the
/// trait keeps the fan-out path independent of how a listener reacts.
pub trait TableListener: Send + Sync {
    fn on_add<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()>;
    fn on_update<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()>;
    fn on_remove<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()>;
    fn on_clear<'a>(&'a self, table_key: &'a str) -> BoxFuture<'a, ()>;
}

/// Translates one table's internal mutation callbacks into replication
/// frames for a single subscribed session.
pub struct SessionTableHandler {
    session: Arc<Session>,
}

impl TableListener for SessionTableHandler {
    fn on_add<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = TableItemsPayload { table_key: table_key.to_owned(), items: items.clone() };
            if let Err(err) = self.session.send(&TABLE_ITEM_ADD, &payload).await {
                warn!(session = %self.session.id, table = table_key, error = %err, "failed to replicate table add");
            }
        })
    }

    fn on_update<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = TableItemsPayload { table_key: table_key.to_owned(), items: items.clone() };
            if let Err(err) = self.session.send(&TABLE_ITEM_UPDATE, &payload).await {
                warn!(session = %self.session.id, table = table_key, error = %err, "failed to replicate table update");
            }
        })
    }

    fn on_remove<'a>(&'a self, table_key: &'a str, items: &'a HashMap<String, Value>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = TableItemsPayload { table_key: table_key.to_owned(), items: items.clone() };
            if let Err(err) = self.session.send(&TABLE_ITEM_REMOVE_NOTIFY, &payload).await {
                warn!(session = %self.session.id, table = table_key, error = %err, "failed to replicate table remove");
            }
        })
    }

    fn on_clear<'a>(&'a self, table_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = TableClearPayload { table_key: table_key.to_owned() };
            if let Err(err) = self.session.send(&TABLE_ITEM_CLEAR, &payload).await {
                warn!(session = %self.session.id, table = table_key, error = %err, "failed to replicate table clear");
            }
        })
    }
}

/// The JSON-level surface the table extension dispatches against,
/// independent of a table's concrete item type `T`. Every `ServerTable<T>`
/// implements this so the extension's generic replication protocol
/// (`table/item_add`, `table/item_fetch`, …) never needs to know `T`.
pub trait DynTable: Send + Sync {
    fn info(&self) -> &TableInfo;
    fn key(&self) -> String {
        self.info().key()
    }

    fn add_json<'a>(&'a self, items: HashMap<String, Value>) -> BoxFuture<'a, Result<(), TableError>>;
    fn update_json<'a>(&'a self, items: HashMap<String, Value>) -> BoxFuture<'a, Result<(), TableError>>;
    fn remove_json<'a>(&'a self, keys: Vec<String>) -> BoxFuture<'a, Result<(), TableError>>;
    fn clear_json<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>>;
    fn get_all_json<'a>(&'a self, keys: Vec<String>) -> BoxFuture<'a, Result<HashMap<String, Value>, TableError>>;
    fn fetch_json<'a>(&'a self, limit: i64, cursor: Option<String>) -> BoxFuture<'a, Result<HashMap<String, Value>, TableError>>;
    fn size<'a>(&'a self) -> BoxFuture<'a, Result<usize, TableError>>;
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>>;
    fn save<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>>;
    fn attach_session<'a>(&'a self, session: Arc<Session>) -> BoxFuture<'a, ()>;
    fn detach_session<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, ()>;
    fn listener_count<'a>(&'a self) -> BoxFuture<'a, usize>;
}

pub struct ServerTable<T> {
    info: TableInfo,
    adapter: StorageAdapter,
    cache: Option<AsyncMutex<Cache>>,
    handlers: RwLock<HashMap<String, Arc<SessionTableHandler>>>,
    dirty: AtomicBool,
    saving: AtomicBool,
    self_ref: std::sync::Weak<ServerTable<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ServerTable<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(info: TableInfo, data_root: &Path) -> Result<Arc<Self>, TableError> {
        let dir = data_root.join("tables").join(&info.extension).join(&info.name);
        let adapter = if info.use_database {
            StorageAdapter::Sql(SqlAdapter::new(dir)?)
        } else {
            StorageAdapter::Json(JsonAdapter::new(dir))
        };
        let cache = info.cache.then(|| AsyncMutex::new(Cache::new(info.cache_size.unwrap_or(DEFAULT_CACHE_SIZE))));
        Ok(Arc::new_cyclic(|weak| Self {
            info,
            adapter,
            cache,
            handlers: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            saving: AtomicBool::new(false),
            self_ref: weak.clone(),
            _marker: PhantomData,
        }))
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, TableError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().await.get(key) {
                return Ok(Some(serde_json::from_value(hit)?));
            }
        }
        let Some(value) = self.adapter.get(key).await? else { return Ok(None) };
        if let Some(cache) = &self.cache {
            cache.lock().await.put(key.to_owned(), value.clone());
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, T>, TableError> {
        decode_map(self.get_all_values(keys).await?)
    }

    async fn get_all_values(&self, keys: &[String]) -> Result<HashMap<String, Value>, TableError> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        if let Some(cache) = &self.cache {
            let guard = cache.lock().await;
            for key in keys {
                match guard.get(key) {
                    Some(value) => {
                        out.insert(key.clone(), value);
                    }
                    None => misses.push(key.clone()),
                }
            }
        } else {
            misses = keys.to_vec();
        }
        if !misses.is_empty() {
            let fetched = self.adapter.get_all(&misses).await?;
            if let Some(cache) = &self.cache {
                let mut guard = cache.lock().await;
                for (k, v) in &fetched {
                    guard.put(k.clone(), v.clone());
                }
            }
            out.extend(fetched);
        }
        Ok(out)
    }

    /// `limit > 0` seeks forward from the first key (or strictly after
    /// `cursor`); `limit < 0` seeks backward from the last key (or
    /// strictly before `cursor`).
    pub async fn fetch(&self, limit: i64, cursor: Option<&str>) -> Result<HashMap<String, T>, TableError> {
        decode_map(self.fetch_values(limit, cursor).await?)
    }

    async fn fetch_values(&self, limit: i64, cursor: Option<&str>) -> Result<HashMap<String, Value>, TableError> {
        let page = if limit >= 0 {
            self.adapter.fetch_forward(limit as usize, cursor).await?
        } else {
            self.adapter.fetch_backward(limit.unsigned_abs() as usize, cursor).await?
        };
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().await;
            for (k, v) in &page {
                guard.put(k.clone(), v.clone());
            }
        }
        Ok(page.into_iter().collect())
    }

    /// Pages forward by the cache size (default 512) until exhausted,
    /// using the last key of each page as the next cursor.
    pub async fn iterate_all(&self) -> Result<Vec<(String, T)>, TableError> {
        let page_size = self.info.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.adapter.fetch_forward(page_size, cursor.as_deref()).await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|(k, _)| k.clone());
            for (k, v) in page {
                out.push((k, serde_json::from_value(v)?));
            }
        }
        Ok(out)
    }

    pub async fn size(&self) -> Result<usize, TableError> {
        self.adapter.size().await
    }

    pub async fn add_one(&self, key: String, value: T) -> Result<(), TableError> {
        self.add(HashMap::from([(key, value)])).await
    }

    pub async fn add(&self, items: HashMap<String, T>) -> Result<(), TableError> {
        let json_items = encode_map(items)?;
        self.mutate_upsert(json_items, MutationKind::Add).await
    }

    pub async fn update(&self, items: HashMap<String, T>) -> Result<(), TableError> {
        let json_items = encode_map(items)?;
        self.mutate_upsert(json_items, MutationKind::Update).await
    }

    pub async fn remove_one(&self, key: &str) -> Result<(), TableError> {
        self.remove(std::slice::from_ref(&key.to_owned())).await
    }

    pub async fn remove(&self, keys: &[String]) -> Result<(), TableError> {
        let removed = self.adapter.get_all(keys).await?;
        self.adapter.remove_all(keys).await?;
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().await;
            for key in keys {
                guard.remove(key);
            }
        }
        self.notify_remove(&removed).await;
        self.mark_changed();
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), TableError> {
        self.adapter.clear().await?;
        if let Some(cache) = &self.cache {
            cache.lock().await.clear();
        }
        self.notify_clear().await;
        self.mark_changed();
        Ok(())
    }

    async fn mutate_upsert(&self, items: HashMap<String, Value>, kind: MutationKind) -> Result<(), TableError> {
        self.adapter.set_all(items.clone()).await?;
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().await;
            for (k, v) in &items {
                guard.put(k.clone(), v.clone());
            }
        }
        match kind {
            MutationKind::Add => self.notify_add(&items).await,
            MutationKind::Update => self.notify_update(&items).await,
        }
        self.mark_changed();
        Ok(())
    }

    async fn notify_add(&self, items: &HashMap<String, Value>) {
        let key = self.info.key();
        for handler in self.snapshot_handlers().await {
            handler.on_add(&key, items).await;
        }
    }

    async fn notify_update(&self, items: &HashMap<String, Value>) {
        let key = self.info.key();
        for handler in self.snapshot_handlers().await {
            handler.on_update(&key, items).await;
        }
    }

    async fn notify_remove(&self, items: &HashMap<String, Value>) {
        let key = self.info.key();
        for handler in self.snapshot_handlers().await {
            handler.on_remove(&key, items).await;
        }
    }

    async fn notify_clear(&self) {
        let key = self.info.key();
        for handler in self.snapshot_handlers().await {
            handler.on_clear(&key).await;
        }
    }

    async fn snapshot_handlers(&self) -> Vec<Arc<SessionTableHandler>> {
        self.handlers.read().await.values().cloned().collect()
    }

    /// Schedules the single in-flight debounced flush, if one isn't
    /// already running. Further mutations while it sleeps just leave
    /// `dirty` set, and the task loops once more before exiting.
    fn mark_changed(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        if self.saving.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                this.dirty.store(false, Ordering::SeqCst);
                if let Err(err) = this.adapter.store().await {
                    warn!(table = %this.info.key(), error = %err, "table save failed, dirty flag left set for retry");
                    this.dirty.store(true, Ordering::SeqCst);
                }
                if !this.dirty.load(Ordering::SeqCst) {
                    break;
                }
            }
            this.saving.store(false, Ordering::SeqCst);
        });
    }

    pub async fn attach_session(&self, session: Arc<Session>) {
        let key = session.key();
        let mut handlers = self.handlers.write().await;
        handlers.entry(key).or_insert_with(|| Arc::new(SessionTableHandler { session }));
    }

    pub async fn detach_session(&self, session_key: &str) {
        self.handlers.write().await.remove(session_key);
    }

    pub async fn listener_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn load(&self) -> Result<(), TableError> {
        self.adapter.load().await
    }

    pub async fn save(&self) -> Result<(), TableError> {
        self.adapter.store().await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

enum MutationKind {
    Add,
    Update,
}

fn encode_map<T: Serialize>(items: HashMap<String, T>) -> Result<HashMap<String, Value>, TableError> {
    items.into_iter().map(|(k, v)| Ok((k, serde_json::to_value(v)?))).collect()
}

fn decode_map<T: DeserializeOwned>(items: HashMap<String, Value>) -> Result<HashMap<String, T>, TableError> {
    items.into_iter().map(|(k, v)| Ok((k, serde_json::from_value(v)?))).collect()
}

impl<T> DynTable for ServerTable<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn info(&self) -> &TableInfo {
        &self.info
    }

    fn add_json<'a>(&'a self, items: HashMap<String, Value>) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(self.mutate_upsert(items, MutationKind::Add))
    }

    fn update_json<'a>(&'a self, items: HashMap<String, Value>) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(self.mutate_upsert(items, MutationKind::Update))
    }

    fn remove_json<'a>(&'a self, keys: Vec<String>) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(async move { self.remove(&keys).await })
    }

    fn clear_json<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(self.clear())
    }

    fn get_all_json<'a>(&'a self, keys: Vec<String>) -> BoxFuture<'a, Result<HashMap<String, Value>, TableError>> {
        Box::pin(async move { self.get_all_values(&keys).await })
    }

    fn fetch_json<'a>(&'a self, limit: i64, cursor: Option<String>) -> BoxFuture<'a, Result<HashMap<String, Value>, TableError>> {
        Box::pin(async move { self.fetch_values(limit, cursor.as_deref()).await })
    }

    fn size<'a>(&'a self) -> BoxFuture<'a, Result<usize, TableError>> {
        Box::pin(self.size())
    }

    fn load<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(self.load())
    }

    fn save<'a>(&'a self) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(self.save())
    }

    fn attach_session<'a>(&'a self, session: Arc<Session>) -> BoxFuture<'a, ()> {
        Box::pin(self.attach_session(session))
    }

    fn detach_session<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.detach_session(session_key))
    }

    fn listener_count<'a>(&'a self) -> BoxFuture<'a, usize> {
        Box::pin(self.listener_count())
    }
}
