//! Embedded SQL KV storage adapter, backed by `rusqlite`. Ordering follows
//! row insertion order (the autoincrement `id`), unlike the JSON adapter's
//! lexicographic ordering — cursors are opaque to clients so the difference
//! never leaks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::TableError;

pub struct SqlAdapter {
    conn: Arc<StdMutex<Connection>>,
}

impl SqlAdapter {
    pub fn new(dir: PathBuf) -> Result<Self, TableError> {
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("data.db"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT UNIQUE NOT NULL,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Arc::new(StdMutex::new(conn)) })
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, TableError>
    where
        F: FnOnce(&Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .expect("sqlite worker task panicked")
        .map_err(TableError::from)
    }

    pub async fn load(&self) -> Result<(), TableError> {
        // The connection is opened (and the table created) in `new`; nothing
        // further to rehydrate into memory since every read goes straight to
        // the database.
        Ok(())
    }

    pub async fn store(&self) -> Result<(), TableError> {
        // Each write below is its own autocommit transaction, so there is
        // nothing left to flush.
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, TableError> {
        let key = key.to_owned();
        self.blocking(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
        })
        .await
        .and_then(|text| match text {
            Some(text) => serde_json::from_str(&text).map(Some).map_err(TableError::from),
            None => Ok(None),
        })
    }

    pub async fn get_all(&self, keys: &[String]) -> Result<std::collections::HashMap<String, Value>, TableError> {
        let keys = keys.to_vec();
        let rows = self
            .blocking(move |conn| {
                let mut out = Vec::new();
                for key in &keys {
                    let value: Option<String> = conn
                        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                        .optional()?;
                    if let Some(value) = value {
                        out.push((key.clone(), value));
                    }
                }
                Ok(out)
            })
            .await?;
        rows.into_iter()
            .map(|(k, text)| serde_json::from_str(&text).map(|v| (k, v)).map_err(TableError::from))
            .collect()
    }

    pub async fn set(&self, key: String, value: Value) -> Result<(), TableError> {
        let text = serde_json::to_string(&value)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, text],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn set_all(&self, items: std::collections::HashMap<String, Value>) -> Result<(), TableError> {
        let items = items
            .into_iter()
            .map(|(k, v)| Ok((k, serde_json::to_string(&v)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        self.blocking(move |conn| {
            for (key, text) in &items {
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, text],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<(), TableError> {
        let key = key.to_owned();
        self.blocking(move |conn| conn.execute("DELETE FROM kv WHERE key = ?1", params![key]).map(|_| ())).await
    }

    pub async fn remove_all(&self, keys: &[String]) -> Result<(), TableError> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            for key in &keys {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
            Ok(())
        })
        .await
    }

    pub async fn first(&self) -> Result<Option<String>, TableError> {
        self.blocking(|conn| {
            conn.query_row("SELECT key FROM kv ORDER BY id ASC LIMIT 1", [], |row| row.get(0)).optional()
        })
        .await
    }

    pub async fn last(&self) -> Result<Option<String>, TableError> {
        self.blocking(|conn| {
            conn.query_row("SELECT key FROM kv ORDER BY id DESC LIMIT 1", [], |row| row.get(0)).optional()
        })
        .await
    }

    /// Cursor position is resolved by the row's `id`; a cursor naming a key
    /// that no longer exists yields an empty page rather than guessing.
    pub async fn fetch_forward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        let cursor = cursor.map(ToOwned::to_owned);
        let limit = limit as i64;
        let rows = self
            .blocking(move |conn| match cursor {
                None => {
                    let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY id ASC LIMIT ?1")?;
                    let rows = stmt.query_map(params![limit], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
                    rows.collect::<Result<Vec<_>, _>>()
                }
                Some(cursor) => {
                    let cursor_id: Option<i64> =
                        conn.query_row("SELECT id FROM kv WHERE key = ?1", params![cursor], |row| row.get(0)).optional()?;
                    match cursor_id {
                        None => Ok(Vec::new()),
                        Some(cursor_id) => {
                            let mut stmt =
                                conn.prepare("SELECT key, value FROM kv WHERE id > ?1 ORDER BY id ASC LIMIT ?2")?;
                            let rows = stmt.query_map(params![cursor_id, limit], |row| {
                                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                            })?;
                            rows.collect::<Result<Vec<_>, _>>()
                        }
                    }
                }
            })
            .await?;
        rows.into_iter().map(|(k, text)| serde_json::from_str(&text).map(|v| (k, v)).map_err(TableError::from)).collect()
    }

    pub async fn fetch_backward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        let cursor = cursor.map(ToOwned::to_owned);
        let limit = limit as i64;
        let rows = self
            .blocking(move |conn| match cursor {
                None => {
                    let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY id DESC LIMIT ?1")?;
                    let rows = stmt.query_map(params![limit], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
                    rows.collect::<Result<Vec<_>, _>>()
                }
                Some(cursor) => {
                    let cursor_id: Option<i64> =
                        conn.query_row("SELECT id FROM kv WHERE key = ?1", params![cursor], |row| row.get(0)).optional()?;
                    match cursor_id {
                        None => Ok(Vec::new()),
                        Some(cursor_id) => {
                            let mut stmt =
                                conn.prepare("SELECT key, value FROM kv WHERE id < ?1 ORDER BY id DESC LIMIT ?2")?;
                            let rows = stmt.query_map(params![cursor_id, limit], |row| {
                                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                            })?;
                            rows.collect::<Result<Vec<_>, _>>()
                        }
                    }
                }
            })
            .await?;
        rows.into_iter().map(|(k, text)| serde_json::from_str(&text).map(|v| (k, v)).map_err(TableError::from)).collect()
    }

    pub async fn clear(&self) -> Result<(), TableError> {
        self.blocking(|conn| conn.execute("DELETE FROM kv", []).map(|_| ())).await
    }

    pub async fn size(&self) -> Result<usize, TableError> {
        self.blocking(|conn| conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: i64) -> Value {
        Value::from(n)
    }

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        adapter.set("b".into(), v(2)).await.unwrap();
        adapter.set("a".into(), v(1)).await.unwrap();
        assert_eq!(adapter.get("a").await.unwrap(), Some(v(1)));
        adapter.remove("a").await.unwrap();
        assert_eq!(adapter.get("a").await.unwrap(), None);
        assert_eq!(adapter.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ordering_is_insertion_order_not_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        adapter.set("zebra".into(), v(1)).await.unwrap();
        adapter.set("apple".into(), v(2)).await.unwrap();
        assert_eq!(adapter.first().await.unwrap(), Some("zebra".to_owned()));
        assert_eq!(adapter.last().await.unwrap(), Some("apple".to_owned()));
    }

    #[tokio::test]
    async fn fetch_forward_is_strictly_after_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        for (k, n) in [("a", 1), ("b", 2), ("c", 3)] {
            adapter.set(k.into(), v(n)).await.unwrap();
        }
        let page = adapter.fetch_forward(10, Some("a")).await.unwrap();
        assert_eq!(page, vec![("b".to_owned(), v(2)), ("c".to_owned(), v(3))]);
    }

    #[tokio::test]
    async fn fetch_backward_is_strictly_before_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        for (k, n) in [("a", 1), ("b", 2), ("c", 3)] {
            adapter.set(k.into(), v(n)).await.unwrap();
        }
        let page = adapter.fetch_backward(10, Some("c")).await.unwrap();
        assert_eq!(page, vec![("b".to_owned(), v(2)), ("a".to_owned(), v(1))]);
    }

    #[tokio::test]
    async fn upsert_does_not_change_insertion_position() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        adapter.set("a".into(), v(1)).await.unwrap();
        adapter.set("b".into(), v(2)).await.unwrap();
        adapter.set("a".into(), v(99)).await.unwrap();
        assert_eq!(adapter.get("a").await.unwrap(), Some(v(99)));
        assert_eq!(adapter.first().await.unwrap(), Some("a".to_owned()));
    }

    #[tokio::test]
    async fn store_then_reopen_survives_a_fresh_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let first = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        first.set("k".into(), v(42)).await.unwrap();
        first.store().await.unwrap();
        drop(first);

        let second = SqlAdapter::new(dir.path().to_path_buf()).unwrap();
        second.load().await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), Some(v(42)));
    }
}
