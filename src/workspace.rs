//! Per-instance key/value workspace.
//!
//! Each instance's workspace is one record of kind `workspace` in the
//! [`RecordStore`], holding a JSON object of values. Only the current lock
//! holder of the instance writes to it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::store::{RecordStore, StoreError};

pub const WORKSPACE_KIND: &str = "workspace";

/// Opens workspaces on a record store.
#[derive(Clone)]
pub struct WorkspaceStore {
    store: Arc<dyn RecordStore>,
}

impl WorkspaceStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn open(&self, instance_id: &str) -> Workspace {
        Workspace {
            instance_id: instance_id.to_string(),
            store: Arc::clone(&self.store),
            aliases: Arc::new(RwLock::new(HashMap::new())),
            write: Arc::new(Mutex::new(())),
        }
    }
}

/// Handle on one instance's workspace. Clones share alias registrations.
#[derive(Clone)]
pub struct Workspace {
    instance_id: String,
    store: Arc<dyn RecordStore>,
    aliases: Arc<RwLock<HashMap<String, String>>>,
    write: Arc<Mutex<()>>,
}

/// Mutable view of the workspace values inside [`Workspace::batch`].
pub struct WorkspaceData<'a> {
    values: &'a mut Map<String, Value>,
    aliases: &'a HashMap<String, String>,
}

impl WorkspaceData<'_> {
    fn key<'k>(&'k self, key: &'k str) -> &'k str {
        self.aliases.get(key).map(String::as_str).unwrap_or(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.values.get(self.key(key)) {
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| StoreError::codec("workspace get", e)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::codec("workspace put", e))?;
        let key = self.key(key).to_string();
        self.values.insert(key, value);
        Ok(())
    }

    pub fn put_value(&mut self, key: &str, value: Value) {
        let key = self.key(key).to_string();
        self.values.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let key = self.key(key).to_string();
        self.values.remove(&key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(self.key(key))
    }
}

impl Workspace {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register alias → canonical key pairs. Later registrations replace earlier ones.
    pub fn register_key_overloads<I, A, K>(&self, pairs: I)
    where
        I: IntoIterator<Item = (A, K)>,
        A: Into<String>,
        K: Into<String>,
    {
        let mut aliases = self.aliases.write().unwrap_or_else(|p| p.into_inner());
        for (alias, key) in pairs {
            aliases.insert(alias.into(), key.into());
        }
    }

    fn resolve(&self, key: &str) -> String {
        self.aliases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    async fn load_values(&self) -> Result<Map<String, Value>, StoreError> {
        match self.store.load(WORKSPACE_KIND, &self.instance_id).await? {
            Some(Value::Object(mut body)) => match body.remove("values") {
                Some(Value::Object(values)) => Ok(values),
                _ => Ok(Map::new()),
            },
            Some(_) => Err(StoreError::permanent("workspace load", "workspace body is not an object")),
            None => Ok(Map::new()),
        }
    }

    async fn store_values(&self, values: Map<String, Value>) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "instance_id": self.instance_id,
            "values": Value::Object(values),
        });
        self.store.store(WORKSPACE_KIND, &self.instance_id, body).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let key = self.resolve(key);
        match self.load_values().await?.remove(&key) {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| StoreError::codec("workspace get", e)),
            None => Ok(None),
        }
    }

    /// Raw JSON value for a key, used by route substitution.
    pub async fn get_value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = self.resolve(key);
        Ok(self.load_values().await?.remove(&key))
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.batch(|data| data.put(key, value)).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.batch(|data| {
            data.remove(key);
            Ok(())
        })
        .await
    }

    /// Apply several reads and writes as one unit. Nothing is written when the
    /// closure returns an error.
    pub async fn batch<R, F>(&self, apply: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut WorkspaceData<'_>) -> Result<R, StoreError>,
    {
        let _guard = self.write.lock().await;
        let mut values = self.load_values().await?;
        let aliases = self.aliases.read().unwrap_or_else(|p| p.into_inner()).clone();
        let result = {
            let mut data = WorkspaceData {
                values: &mut values,
                aliases: &aliases,
            };
            apply(&mut data)?
        };
        self.store_values(values).await?;
        Ok(result)
    }

    pub async fn delete_workspace(&self) -> Result<(), StoreError> {
        self.store.delete(WORKSPACE_KIND, &self.instance_id).await.map(|_| ())
    }
}
