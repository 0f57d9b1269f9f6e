//! Path-addressed persistent store.
//!
//! The system of record is a Realtime-Database-style JSON tree addressed by
//! slash-separated paths. `RtdbStore` is the production REST backend;
//! `MemoryStore` backs tests and local development.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[async_trait]
pub trait PathStore: Send + Sync {
    /// Read the value at `path`; `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replace the value at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Merge the keys of an object `value` into the object at `path`.
    async fn update(&self, path: &str, value: Value) -> Result<()>;

    /// Append `value` under a generated, chronologically ordered key.
    /// Returns the key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Delete the value at `path`.
    async fn remove(&self, path: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct RtdbStore {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl RtdbStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("store base_url is required"));
        }
        let parsed = Url::parse(&base_url).map_err(|e| anyhow!("invalid store base_url: {e}"))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "invalid store base_url scheme: {other} (expected http or https)"
                ));
            }
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    fn node_url(&self, path: &str) -> Result<Url> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(anyhow!("store path is required"));
        }
        let mut url = Url::parse(&format!("{}/{path}.json", self.base_url))
            .map_err(|e| anyhow!("invalid store path {path:?}: {e}"))?;
        if let Some(token) = self.auth_token.as_deref() {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder, action: &str) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("store {action} failed: status={status} body={body}"));
        }
        serde_json::from_str(&body).map_err(|e| anyhow!("store {action} returned bad JSON: {e}"))
    }
}

#[async_trait]
impl PathStore for RtdbStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let url = self.node_url(path)?;
        let value = self.execute(self.http.get(url), "get").await?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let url = self.node_url(path)?;
        self.execute(self.http.put(url).json(&value), "set").await?;
        Ok(())
    }

    async fn update(&self, path: &str, value: Value) -> Result<()> {
        let url = self.node_url(path)?;
        self.execute(self.http.patch(url).json(&value), "update")
            .await?;
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let url = self.node_url(path)?;
        let body = self.execute(self.http.post(url).json(&value), "push").await?;
        body.get("name")
            .and_then(|name| name.as_str())
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow!("store push response missing generated key"))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let url = self.node_url(path)?;
        self.execute(self.http.delete(url), "remove").await?;
        Ok(())
    }
}

/// In-memory JSON tree with the same path semantics as `RtdbStore`.
#[derive(Default)]
pub struct MemoryStore {
    root: Mutex<Value>,
    push_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Value::Null),
            push_counter: AtomicU64::new(0),
        }
    }

    fn segments(path: &str) -> Result<Vec<String>> {
        let segments: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        if segments.is_empty() {
            return Err(anyhow!("store path is required"));
        }
        Ok(segments)
    }

    fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
        let mut node = root;
        for segment in segments {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    fn lookup_mut<'a>(root: &'a mut Value, segments: &[String]) -> &'a mut Value {
        segments.iter().fold(root, |node, segment| {
            if !node.is_object() {
                *node = Value::Object(serde_json::Map::new());
            }
            match node {
                Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
                _ => unreachable!("node coerced to an object above"),
            }
        })
    }
}

#[async_trait]
impl PathStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = Self::segments(path)?;
        let root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Self::lookup(&root, &segments)
            .filter(|value| !value.is_null())
            .cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let segments = Self::segments(path)?;
        let mut root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *Self::lookup_mut(&mut root, &segments) = value;
        Ok(())
    }

    async fn update(&self, path: &str, value: Value) -> Result<()> {
        let segments = Self::segments(path)?;
        let mut root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let node = Self::lookup_mut(&mut root, &segments);
        match (node.as_object_mut(), value) {
            (Some(existing), Value::Object(incoming)) => {
                for (key, item) in incoming {
                    existing.insert(key, item);
                }
            }
            (_, value) => *node = value,
        }
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let segments = Self::segments(path)?;
        // Zero-padded counter keys sort chronologically, like platform push ids.
        let key = format!("k{:012}", self.push_counter.fetch_add(1, Ordering::Relaxed));
        let mut root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let node = Self::lookup_mut(&mut root, &segments);
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = node.as_object_mut() {
            map.insert(key.clone(), value);
        }
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let segments = Self::segments(path)?;
        let mut root = self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some((last, parents)) = segments.split_last() else {
            return Ok(());
        };
        let mut node = &mut *root;
        for segment in parents {
            match node.as_object_mut().and_then(|map| map.get_mut(segment)) {
                Some(next) => node = next,
                None => return Ok(()),
            }
        }
        if let Some(map) = node.as_object_mut() {
            map.remove(last);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let store = MemoryStore::new();
        store
            .set("tenants/t1", json!({ "name": "Pastas Rosa" }))
            .await
            .expect("set");
        let value = store.get("tenants/t1").await.expect("get");
        assert_eq!(value, Some(json!({ "name": "Pastas Rosa" })));

        store.remove("tenants/t1").await.expect("remove");
        assert_eq!(store.get("tenants/t1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn get_missing_path_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("tenants/absent").await.expect("get"), None);
    }

    #[tokio::test]
    async fn update_merges_into_existing_object() {
        let store = MemoryStore::new();
        store
            .set("tenants/t1", json!({ "name": "Pastas Rosa", "active": true }))
            .await
            .expect("set");
        store
            .update("tenants/t1", json!({ "active": false }))
            .await
            .expect("update");
        assert_eq!(
            store.get("tenants/t1").await.expect("get"),
            Some(json!({ "name": "Pastas Rosa", "active": false }))
        );
    }

    #[tokio::test]
    async fn push_keys_preserve_insertion_order() {
        let store = MemoryStore::new();
        let first = store.push("rules/t1", json!({ "n": 1 })).await.expect("push");
        let second = store.push("rules/t1", json!({ "n": 2 })).await.expect("push");
        assert!(first < second);

        let value = store.get("rules/t1").await.expect("get").expect("object");
        let keys: Vec<&String> = value.as_object().expect("object").keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
