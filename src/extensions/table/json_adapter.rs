//! JSON-file storage adapter. Ordering is lexicographic over keys, which a
//! `BTreeMap` gives for free instead of re-sorting on every call.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::TableError;

pub struct JsonAdapter {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Value>>,
}

impl JsonAdapter {
    pub fn new(dir: PathBuf) -> Self {
        Self { path: dir.join("data.json"), data: RwLock::new(BTreeMap::new()) }
    }

    pub async fn load(&self) -> Result<(), TableError> {
        if !self.path.exists() {
            return Ok(());
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        let parsed: BTreeMap<String, Value> = serde_json::from_str(&text)?;
        *self.data.write().await = parsed;
        Ok(())
    }

    pub async fn store(&self) -> Result<(), TableError> {
        let snapshot = self.data.read().await.clone();
        let text = serde_json::to_string(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, TableError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    pub async fn get_all(&self, keys: &[String]) -> Result<std::collections::HashMap<String, Value>, TableError> {
        let data = self.data.read().await;
        Ok(keys.iter().filter_map(|key| data.get(key).cloned().map(|value| (key.clone(), value))).collect())
    }

    pub async fn set(&self, key: String, value: Value) -> Result<(), TableError> {
        self.data.write().await.insert(key, value);
        Ok(())
    }

    pub async fn set_all(&self, items: std::collections::HashMap<String, Value>) -> Result<(), TableError> {
        self.data.write().await.extend(items);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), TableError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    pub async fn remove_all(&self, keys: &[String]) -> Result<(), TableError> {
        let mut data = self.data.write().await;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    pub async fn first(&self) -> Result<Option<String>, TableError> {
        Ok(self.data.read().await.keys().next().cloned())
    }

    pub async fn last(&self) -> Result<Option<String>, TableError> {
        Ok(self.data.read().await.keys().next_back().cloned())
    }

    pub async fn fetch_forward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        let data = self.data.read().await;
        let items: Vec<(String, Value)> = match cursor {
            Some(cursor) => data
                .range::<str, _>((Bound::Excluded(cursor), Bound::Unbounded))
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => data.iter().take(limit).map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        Ok(items)
    }

    pub async fn fetch_backward(&self, limit: usize, cursor: Option<&str>) -> Result<Vec<(String, Value)>, TableError> {
        let data = self.data.read().await;
        let items: Vec<(String, Value)> = match cursor {
            Some(cursor) => data
                .range::<str, _>((Bound::Unbounded, Bound::Excluded(cursor)))
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => data.iter().rev().take(limit).map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        Ok(items)
    }

    pub async fn clear(&self) -> Result<(), TableError> {
        self.data.write().await.clear();
        Ok(())
    }

    pub async fn size(&self) -> Result<usize, TableError> {
        Ok(self.data.read().await.len())
    }
}
