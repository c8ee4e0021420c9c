use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HestiaError, Result};

/// One configured instance of a storage driver, owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Id of the driver in the registry
    pub driver: String,
    /// Display name ("Harddisk", "Harddisk-2", ...)
    pub name: String,
    /// Driver-owned configuration (tokens, account ids), opaque to the gateway
    #[serde(default)]
    pub config: serde_json::Value,
    /// Buckets mirrored by this connection, in insertion order
    #[serde(default)]
    pub buckets: Vec<String>,
}

impl Connection {
    pub fn new(driver: impl Into<String>, name: impl Into<String>, address: &str) -> Self {
        Self {
            driver: driver.into(),
            name: name.into(),
            config: serde_json::Value::Null,
            buckets: vec![address.to_string()],
        }
    }

    /// Append `bucket` if missing. Returns true when the set changed.
    pub fn add_bucket(&mut self, bucket: &str) -> bool {
        if self.buckets.iter().any(|b| b == bucket) {
            return false;
        }
        self.buckets.push(bucket.to_string());
        true
    }
}

/// The per-connection projection of a user handed to drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub address: String,
    pub internal_bucket_address: Option<String>,
    pub connection_id: String,
    pub driver_config: serde_json::Value,
}

impl ConnectionContext {
    /// Context for a user that has no connection yet (first-time registration).
    pub fn unconnected(address: &str) -> Self {
        Self {
            address: address.to_string(),
            internal_bucket_address: None,
            connection_id: String::new(),
            driver_config: serde_json::Value::Null,
        }
    }
}

/// A registered identity and its connection registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Root identity, primary key
    pub address: String,
    #[serde(default)]
    pub internal_bucket_address: Option<String>,
    /// Connection used when a bucket is not explicitly mapped anywhere
    pub default_connection: String,
    pub connections: BTreeMap<String, Connection>,
}

impl User {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            internal_bucket_address: None,
            default_connection: String::new(),
            connections: BTreeMap::new(),
        }
    }

    pub fn connection(&self, id: &str) -> Result<&Connection> {
        self.connections
            .get(id)
            .ok_or_else(|| HestiaError::not_found(format!("Connection \"{}\" not found", id)))
    }

    pub fn connection_mut(&mut self, id: &str) -> Result<&mut Connection> {
        self.connections
            .get_mut(id)
            .ok_or_else(|| HestiaError::not_found(format!("Connection \"{}\" not found", id)))
    }

    /// Whether `connection_id` mirrors `bucket`. The user's own address is
    /// implicitly mirrored by every connection.
    pub fn maps(&self, connection_id: &str, bucket: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => bucket == self.address || conn.buckets.iter().any(|b| b == bucket),
            None => false,
        }
    }

    /// Connection ids mapped to `bucket`, falling back to the default connection.
    pub fn connections_for(&self, bucket: &str) -> Vec<String> {
        let mapped: Vec<String> = self
            .connections
            .keys()
            .filter(|id| self.maps(id, bucket))
            .cloned()
            .collect();

        if mapped.is_empty() && self.connections.contains_key(&self.default_connection) {
            vec![self.default_connection.clone()]
        } else {
            mapped
        }
    }

    /// Every bucket this user routes, starting with the root address.
    pub fn buckets(&self) -> Vec<String> {
        let mut out = vec![self.address.clone()];
        if let Some(internal) = &self.internal_bucket_address {
            if !out.contains(internal) {
                out.push(internal.clone());
            }
        }
        for conn in self.connections.values() {
            for b in &conn.buckets {
                if !out.contains(b) {
                    out.push(b.clone());
                }
            }
        }
        out
    }

    /// Whether this user owns `bucket` (root, internal, or any mirrored bucket).
    pub fn owns_bucket(&self, bucket: &str) -> bool {
        self.buckets().iter().any(|b| b == bucket)
    }

    /// Project this user for a driver call on one connection.
    pub fn context_for(&self, connection_id: &str) -> Result<ConnectionContext> {
        let conn = self.connection(connection_id)?;
        Ok(ConnectionContext {
            address: self.address.clone(),
            internal_bucket_address: self.internal_bucket_address.clone(),
            connection_id: connection_id.to_string(),
            driver_config: conn.config.clone(),
        })
    }

    /// Next free display name for a connection to a driver called `base`.
    pub fn next_connection_name(&self, driver: &str, base: &str) -> String {
        let n = self
            .connections
            .values()
            .filter(|c| c.driver == driver)
            .count();
        if n == 0 {
            base.to_string()
        } else {
            format!("{}-{}", base, n + 1)
        }
    }
}
