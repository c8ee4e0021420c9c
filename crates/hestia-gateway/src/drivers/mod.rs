//! Driver registry: builds configured drivers from a static constructor table
//! and runs their periodic maintenance.

mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashSet;
use hestia_core::{
    Connection, ConnectionContext, Driver, DriverApi, DriverInfo, HestiaError, KeyValueStore,
    RegisterOutcome, Result, User,
};
use hestia_disk::DiskDriver;
use hestia_hub::HubDriver;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use memory::MemoryDriver;

/// One entry of the driver table, keyed by driver id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Constructor to use: `disk`, `gaia-hub` or `memory`
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub auto_register: bool,
    #[serde(default)]
    pub root_only: bool,
    /// Driver-specific options, handed to `Driver::init`
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl DriverConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }
}

fn construct(kind: &str) -> Option<Box<dyn Driver>> {
    match kind {
        "disk" => Some(Box::new(DiskDriver::new())),
        "gaia-hub" => Some(Box::new(HubDriver::new())),
        "memory" => Some(Box::new(MemoryDriver::new())),
        _ => None,
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Driver ids are `/`-separated segments of word characters, dots and dashes,
/// each starting with a word character.
pub fn valid_driver_id(id: &str) -> bool {
    !id.is_empty()
        && id.split('/').all(|seg| {
            let mut chars = seg.chars();
            matches!(chars.next(), Some(c) if is_word(c))
                && chars.all(|c| is_word(c) || c == '.' || c == '-')
        })
}

/// Marks a driver id as ticking for as long as it lives, panics included.
struct TickGuard {
    set: Arc<DashSet<String>>,
    id: String,
}

impl TickGuard {
    fn acquire(set: &Arc<DashSet<String>>, id: &str) -> Option<Self> {
        set.insert(id.to_string()).then(|| Self {
            set: set.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
    infos: Vec<DriverInfo>,
    /// Ids whose tick is in flight
    ticking: Arc<DashSet<String>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every driver of `table`. Drivers that fail to initialize are
    /// logged and skipped.
    pub async fn init(
        table: &BTreeMap<String, DriverConfig>,
        origin: &str,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let mut registry = Self::new();

        for (id, config) in table {
            let Some(driver) = construct(&config.kind) else {
                error!("Driver \"{}\": unknown kind \"{}\"", id, config.kind);
                continue;
            };
            let api = DriverApi::new(id.as_str(), origin, kv.clone());
            if let Err(e) = registry.register_driver(id, config, driver, api).await {
                error!("Error initializing driver \"{}\": {}", id, e);
            }
        }

        info!(
            "Initialized {} out of {} drivers",
            registry.infos.len(),
            table.len()
        );
        registry
    }

    /// Initialize `driver` under `id` and add it to the registry.
    pub async fn register_driver(
        &mut self,
        id: &str,
        config: &DriverConfig,
        mut driver: Box<dyn Driver>,
        api: DriverApi,
    ) -> Result<DriverInfo> {
        if !valid_driver_id(id) {
            return Err(HestiaError::malformed(format!("Invalid driver id \"{}\"", id)));
        }
        if self.drivers.contains_key(id) {
            return Err(HestiaError::not_allowed(format!("Driver \"{}\" already registered", id)));
        }

        let options = serde_json::Value::Object(config.options.clone());
        let init = driver.init(id, &options, api).await?;

        if let Some(existing) = self.infos.iter().find(|i| i.long_id == init.long_id) {
            if !init.multi_instance || !existing.multi_instance {
                return Err(HestiaError::not_allowed(format!(
                    "Driver \"{}\" ({}) cannot be loaded twice; already loaded as \"{}\"",
                    id, init.long_id, existing.id
                )));
            }
        }

        if config.auto_register && !init.auto_registerable {
            warn!("Driver \"{}\" cannot auto-register; ignoring auto_register", id);
        }

        let info = DriverInfo {
            id: id.to_string(),
            long_id: init.long_id,
            name: config.name.clone().unwrap_or(init.name),
            icon: config.icon_url.clone().or(init.icon).unwrap_or_default(),
            whitelist: config.whitelist.clone(),
            multi_instance: init.multi_instance,
            multi_user: init.multi_user,
            auto_register: config.auto_register && init.auto_registerable,
            root_only: config.root_only,
        };

        info!("Loaded driver \"{}\" ({})", id, info.long_id);
        self.drivers.insert(id.to_string(), Arc::from(driver));
        self.infos.push(info.clone());
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(id)
            .cloned()
            .ok_or_else(|| HestiaError::not_found(format!("Driver \"{}\" not found", id)))
    }

    pub fn info(&self, id: &str) -> Result<&DriverInfo> {
        self.infos
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| HestiaError::not_found(format!("Driver \"{}\" not found", id)))
    }

    pub fn infos(&self) -> &[DriverInfo] {
        &self.infos
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn any_auto_register(&self) -> bool {
        self.infos.iter().any(|i| i.auto_register)
    }

    /// Whether the connection's driver is configured `root_only`.
    /// Unknown drivers count as root-only so they are never picked as default.
    pub fn is_root_only(&self, driver_id: &str) -> bool {
        self.info(driver_id).map(|i| i.root_only).unwrap_or(true)
    }

    /// Add a connection to `driver_id` for `user`, from a finished registration.
    /// Returns the new connection id. Does not persist the user.
    pub async fn attach(
        &self,
        user: &mut User,
        driver_id: &str,
        userdata: serde_json::Value,
    ) -> Result<String> {
        let info = self.info(driver_id)?;
        if !info.allows(&user.address) {
            return Err(HestiaError::not_allowed(format!(
                "{} is not whitelisted for driver \"{}\"",
                user.address, driver_id
            )));
        }
        if !info.multi_user && user.connections.values().any(|c| c.driver == driver_id) {
            return Err(HestiaError::not_allowed(format!(
                "Already connected to driver \"{}\"",
                driver_id
            )));
        }

        let driver = self.get(driver_id)?;
        driver.post_register_check(user, &userdata).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut conn = Connection::new(
            driver_id,
            user.next_connection_name(driver_id, &info.name),
            &user.address,
        );
        conn.config = userdata;
        user.connections.insert(id.clone(), conn);

        if !user.connections.contains_key(&user.default_connection) {
            user.default_connection = id.clone();
        }

        debug!("Attached connection {} ({}) to {}", id, driver_id, user.address);
        Ok(id)
    }

    /// Register `user` with every auto-registering driver they are not yet on.
    /// Returns whether any connection was added.
    pub async fn auto_register_user(&self, user: &mut User) -> Result<bool> {
        let mut added = false;

        for info in self.infos.iter().filter(|i| i.auto_register) {
            if user.connections.values().any(|c| c.driver == info.id) || !info.allows(&user.address) {
                continue;
            }

            let driver = self.get(&info.id)?;
            let ctx = ConnectionContext {
                internal_bucket_address: user.internal_bucket_address.clone(),
                ..ConnectionContext::unconnected(&user.address)
            };
            match driver.auto_register(&ctx).await? {
                RegisterOutcome::Finish { userdata, .. } => {
                    self.attach(user, &info.id, userdata).await?;
                    added = true;
                }
                RegisterOutcome::Redirect { .. } => {
                    warn!("Driver \"{}\" asked for a redirect during auto-registration", info.id);
                }
            }
        }

        if added {
            info!("Auto-registered {}", user.address);
        }
        Ok(added)
    }

    /// Run every driver's `tick`, skipping drivers whose previous tick is
    /// still running.
    pub fn tick(&self) {
        for (id, driver) in &self.drivers {
            let Some(guard) = TickGuard::acquire(&self.ticking, id) else {
                debug!("Driver \"{}\" still ticking, skipping", id);
                continue;
            };

            let driver = driver.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.tick().await {
                    error!("Error ticking driver \"{}\": {}", guard.id, e);
                }
            });
        }
    }

    #[cfg(test)]
    fn is_ticking(&self, id: &str) -> bool {
        self.ticking.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use hestia_core::{
        DeleteRequest, DriverInit, DriverSpaceInfo, ListFilesResponse, ReadRequest, ReadResult,
        RegisterRequest, WriteRequest,
    };

    use crate::store::MemoryStore;

    fn api(id: &str) -> DriverApi {
        DriverApi::new(id, "http://localhost:4010", Arc::new(MemoryStore::new()))
    }

    fn config(kind: &str, auto_register: bool) -> DriverConfig {
        DriverConfig {
            auto_register,
            ..DriverConfig::new(kind)
        }
    }

    /// Driver whose tick takes a while, counting how often it ran.
    struct SlowTicker {
        ticks: Arc<AtomicUsize>,
        panics: bool,
    }

    #[async_trait]
    impl Driver for SlowTicker {
        async fn init(&mut self, _: &str, _: &serde_json::Value, _: DriverApi) -> Result<DriverInit> {
            Ok(DriverInit {
                name: "Slow".into(),
                long_id: "test.slow".into(),
                icon: None,
                multi_instance: false,
                multi_user: false,
                auto_registerable: false,
            })
        }
        async fn perform_read(&self, _: ReadRequest<'_>) -> Result<ReadResult> {
            Err(HestiaError::not_found("x"))
        }
        async fn perform_write(&self, _: WriteRequest<'_>) -> Result<()> {
            Ok(())
        }
        async fn perform_delete(&self, _: DeleteRequest<'_>) -> Result<()> {
            Ok(())
        }
        async fn list_files(&self, _: &str, _: usize, _: bool, _: &ConnectionContext) -> Result<ListFilesResponse> {
            Ok(hestia_core::paginate(Vec::new(), 0, 1))
        }
        async fn get_info(&self, _: &ConnectionContext) -> Result<DriverSpaceInfo> {
            Ok(DriverSpaceInfo { space_used: 0, space_available: None })
        }
        async fn register(
            &self,
            _: Option<&ConnectionContext>,
            _: Option<&str>,
            _: Option<&RegisterRequest>,
        ) -> Result<RegisterOutcome> {
            Err(HestiaError::not_allowed("no"))
        }
        async fn tick(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.panics {
                panic!("tick blew up");
            }
            Ok(())
        }
        async fn unregister(&self, _: &ConnectionContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_valid_driver_id() {
        assert!(valid_driver_id("disk"));
        assert!(valid_driver_id("hub.io/user-2"));
        assert!(!valid_driver_id(""));
        assert!(!valid_driver_id("-disk"));
        assert!(!valid_driver_id("a//b"));
        assert!(!valid_driver_id("disk/"));
    }

    #[tokio::test]
    async fn test_init_skips_bad_entries() {
        let mut table = BTreeMap::new();
        table.insert("mem".to_string(), config("memory", true));
        table.insert("mem-2".to_string(), config("memory", false));
        table.insert("nope".to_string(), config("carrier-pigeon", false));
        table.insert("-bad".to_string(), config("memory", false));

        let registry = DriverRegistry::init(&table, "http://localhost", Arc::new(MemoryStore::new())).await;
        assert_eq!(registry.len(), 2);
        assert!(registry.any_auto_register());
        assert!(registry.get("nope").is_err());
        assert!(registry.info("mem-2").unwrap().multi_instance);
    }

    #[tokio::test]
    async fn test_duplicate_long_id_rejected_unless_multi_instance() {
        let mut registry = DriverRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        registry
            .register_driver("a", &config("x", false), Box::new(SlowTicker { ticks: ticks.clone(), panics: false }), api("a"))
            .await
            .unwrap();
        let err = registry
            .register_driver("b", &config("x", false), Box::new(SlowTicker { ticks, panics: false }), api("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_attach_names_and_defaults() {
        let mut registry = DriverRegistry::new();
        let cfg = DriverConfig {
            name: Some("Scratch".into()),
            ..config("memory", true)
        };
        registry
            .register_driver("mem", &cfg, Box::new(MemoryDriver::new()), api("mem"))
            .await
            .unwrap();

        let mut user = User::new("alice");
        assert!(registry.auto_register_user(&mut user).await.unwrap());
        assert_eq!(user.connections.len(), 1);
        let (id, conn) = user.connections.iter().next().unwrap();
        assert_eq!(&user.default_connection, id);
        assert_eq!(conn.name, "Scratch");
        assert_eq!(conn.buckets, vec!["alice"]);

        // already registered: nothing to do
        assert!(!registry.auto_register_user(&mut user).await.unwrap());
    }

    #[tokio::test]
    async fn test_whitelist_is_enforced() {
        let mut registry = DriverRegistry::new();
        let cfg = DriverConfig {
            whitelist: Some(vec!["bob".into()]),
            ..config("memory", false)
        };
        registry
            .register_driver("mem", &cfg, Box::new(MemoryDriver::new()), api("mem"))
            .await
            .unwrap();

        let mut user = User::new("alice");
        let err = registry
            .attach(&mut user, "mem", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_tick_is_single_flight() {
        let mut registry = DriverRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        registry
            .register_driver("slow", &config("x", false), Box::new(SlowTicker { ticks: ticks.clone(), panics: false }), api("slow"))
            .await
            .unwrap();

        registry.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_ticking("slow"));
        registry.tick();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!registry.is_ticking("slow"));
    }

    #[tokio::test]
    async fn test_panicking_tick_is_released() {
        let mut registry = DriverRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        registry
            .register_driver("boom", &config("x", false), Box::new(SlowTicker { ticks: ticks.clone(), panics: true }), api("boom"))
            .await
            .unwrap();

        registry.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_ticking("boom"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!registry.is_ticking("boom"));

        registry.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
