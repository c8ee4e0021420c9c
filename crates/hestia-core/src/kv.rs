use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Namespaced key-value storage offered to drivers by the persistence layer.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    async fn kv_set(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()>;

    async fn kv_delete(&self, namespace: &str, key: &str) -> Result<()>;

    async fn kv_get_all(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Gateway services available to a driver during and after `init`.
#[derive(Clone)]
pub struct DriverApi {
    namespace: String,
    origin: String,
    store: Arc<dyn KeyValueStore>,
}

impl DriverApi {
    pub fn new(namespace: impl Into<String>, origin: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: format!("drivers/{}", namespace.into()),
            origin: origin.into(),
            store,
        }
    }

    /// Public origin of the gateway (`https://host:port`).
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.kv_get(&self.namespace, key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let v = serde_json::to_value(value)?;
        self.store.kv_set(&self.namespace, key, v).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.kv_delete(&self.namespace, key).await
    }

    pub async fn get_all(&self) -> Result<Vec<(String, serde_json::Value)>> {
        self.store.kv_get_all(&self.namespace).await
    }
}

impl std::fmt::Debug for DriverApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverApi")
            .field("namespace", &self.namespace)
            .field("origin", &self.origin)
            .finish()
    }
}
