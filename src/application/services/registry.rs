use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;

use crate::common::config::{StorageSettings, DEFAULT_CONFIG_PREFIX};
use crate::common::errors::{Result, StorageError};
use crate::domain::repositories::file_storage::FileStorage;
use crate::infrastructure::repositories::local_storage::LocalFileStorage;
use crate::infrastructure::repositories::memory_storage::MemoryFileStorage;

type DriverFuture = BoxFuture<'static, Result<Arc<dyn FileStorage>>>;
type DriverFactory = Arc<dyn Fn(StorageSettings) -> DriverFuture + Send + Sync>;

struct RegistryState {
    stores: HashMap<String, Arc<dyn FileStorage>>,
    aliases: HashMap<String, String>,
    default_store: Option<String>,
    backends: HashMap<String, DriverFactory>,
}

impl RegistryState {
    fn with_builtin_backends() -> Self {
        let mut backends: HashMap<String, DriverFactory> = HashMap::new();

        backends.insert(
            "local".to_string(),
            Arc::new(|settings: StorageSettings| -> DriverFuture {
                Box::pin(async move {
                    Ok(Arc::new(LocalFileStorage::from_settings(&settings).await?)
                        as Arc<dyn FileStorage>)
                })
            }),
        );
        backends.insert(
            "memory".to_string(),
            Arc::new(|_settings: StorageSettings| -> DriverFuture {
                Box::pin(async move {
                    Ok(Arc::new(MemoryFileStorage::new()) as Arc<dyn FileStorage>)
                })
            }),
        );
        #[cfg(feature = "s3")]
        backends.insert(
            "s3".to_string(),
            Arc::new(|settings: StorageSettings| -> DriverFuture {
                Box::pin(async move {
                    use crate::infrastructure::repositories::s3_storage::S3Storage;
                    Ok(Arc::new(S3Storage::from_settings(&settings).await?)
                        as Arc<dyn FileStorage>)
                })
            }),
        );
        #[cfg(feature = "gcs")]
        backends.insert(
            "gcs".to_string(),
            Arc::new(|settings: StorageSettings| -> DriverFuture {
                Box::pin(async move {
                    use crate::infrastructure::repositories::gcs_storage::GcsStorage;
                    Ok(Arc::new(GcsStorage::from_settings(&settings).await?)
                        as Arc<dyn FileStorage>)
                })
            }),
        );
        #[cfg(feature = "gridfs")]
        backends.insert(
            "gridfs".to_string(),
            Arc::new(|settings: StorageSettings| -> DriverFuture {
                Box::pin(async move {
                    use crate::infrastructure::repositories::gridfs_storage::GridFsStorage;
                    Ok(Arc::new(GridFsStorage::from_settings(&settings).await?)
                        as Arc<dyn FileStorage>)
                })
            }),
        );

        Self {
            stores: HashMap::new(),
            aliases: HashMap::new(),
            default_store: None,
            backends,
        }
    }

    fn is_taken(&self, name: &str) -> bool {
        self.stores.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Walks the alias chain down to a concrete store name.
    fn resolve(&self, name: &str) -> Option<String> {
        let mut current = name;
        let mut seen = HashSet::new();
        loop {
            if self.stores.contains_key(current) {
                return Some(current.to_string());
            }
            if !seen.insert(current.to_string()) {
                return None;
            }
            current = self.aliases.get(current)?;
        }
    }
}

static REGISTRY: Lazy<RwLock<RegistryState>> =
    Lazy::new(|| RwLock::new(RegistryState::with_builtin_backends()));

fn read_state() -> std::sync::RwLockReadGuard<'static, RegistryState> {
    REGISTRY.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state() -> std::sync::RwLockWriteGuard<'static, RegistryState> {
    REGISTRY.write().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide catalog of named stores.
///
/// The registry maps names to driver instances, remembers which store is the
/// default (the first one configured, unless changed), and keeps an alias
/// table whose entries chain down to concrete stores. Configuration
/// mutations are serialized; lookups take shared read guards.
pub struct DepotRegistry;

impl DepotRegistry {
    /// Registers a new store built from `depot.*` keys of a flat settings
    /// map. The first configured store becomes the default. Configuring an
    /// already used name is an error.
    pub async fn configure(
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn FileStorage>> {
        Self::configure_with_prefix(name, config, DEFAULT_CONFIG_PREFIX).await
    }

    pub async fn configure_with_prefix(
        name: &str,
        config: &HashMap<String, String>,
        prefix: &str,
    ) -> Result<Arc<dyn FileStorage>> {
        if read_state().is_taken(name) {
            return Err(StorageError::configuration(format!(
                "depot '{}' has already been configured",
                name
            )));
        }

        let settings = StorageSettings::from_map(config, prefix);
        let store = Self::from_settings(settings).await?;
        Self::register_store(name, store.clone())?;
        Ok(store)
    }

    /// Builds an unregistered store from settings. This is how `configure`
    /// constructs drivers; it is also useful to create throwaway stores.
    pub async fn from_settings(settings: StorageSettings) -> Result<Arc<dyn FileStorage>> {
        let factory = read_state()
            .backends
            .get(settings.backend())
            .cloned()
            .ok_or_else(|| {
                StorageError::configuration(format!(
                    "unknown storage backend '{}'",
                    settings.backend()
                ))
            })?;
        factory(settings).await
    }

    /// Registers an already built store under a name. Follows the same
    /// rules as `configure` for duplicates and default selection.
    pub fn register_store(name: &str, store: Arc<dyn FileStorage>) -> Result<()> {
        let mut state = write_state();
        if state.is_taken(name) {
            return Err(StorageError::configuration(format!(
                "depot '{}' has already been configured",
                name
            )));
        }
        tracing::debug!(name, backend = store.backend(), "registering depot");
        state.stores.insert(name.to_string(), store);
        if state.default_store.is_none() {
            state.default_store = Some(name.to_string());
        }
        Ok(())
    }

    /// Registers a driver constructor under a backend key, the
    /// statically-linked counterpart of loading driver classes by dotted
    /// path. Built-in backends are pre-registered under `local`, `memory`,
    /// `s3`, `gcs` and `gridfs`.
    pub fn register_backend<F, Fut>(key: &str, factory: F)
    where
        F: Fn(StorageSettings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn FileStorage>>> + Send + 'static,
    {
        write_state()
            .backends
            .insert(
                key.to_string(),
                Arc::new(move |s: StorageSettings| -> DriverFuture { Box::pin(factory(s)) }),
            );
    }

    /// Changes the default store. The target must already be registered.
    pub fn set_default(name: &str) -> Result<()> {
        let mut state = write_state();
        if !state.stores.contains_key(name) {
            return Err(StorageError::configuration(format!(
                "depot '{}' has not been configured",
                name
            )));
        }
        state.default_store = Some(name.to_string());
        Ok(())
    }

    /// Name of the default store. Errors when nothing is configured yet.
    pub fn get_default() -> Result<String> {
        read_state().default_store.clone().ok_or_else(|| {
            StorageError::configuration("no depot has been configured")
        })
    }

    /// Gets a store by name, resolving aliases; with no name, the default.
    pub fn get(name: Option<&str>) -> Result<Arc<dyn FileStorage>> {
        let state = read_state();
        let name = match name {
            Some(name) => name.to_string(),
            None => state.default_store.clone().ok_or_else(|| {
                StorageError::configuration("no depot has been configured")
            })?,
        };
        let concrete = state.resolve(&name).ok_or_else(|| {
            StorageError::configuration(format!("depot '{}' has not been configured", name))
        })?;
        Ok(state.stores[&concrete].clone())
    }

    /// Points `alias` at `target`. The target must resolve to a concrete
    /// store, and an alias may not shadow a store name: doing so would
    /// orphan files previously saved under it.
    pub fn alias(alias: &str, target: &str) -> Result<()> {
        let mut state = write_state();
        if state.stores.contains_key(alias) {
            return Err(StorageError::configuration(format!(
                "'{}' is already in use as a storage name",
                alias
            )));
        }
        if state.resolve(target).is_none() {
            return Err(StorageError::configuration(format!(
                "depot '{}' has not been configured",
                target
            )));
        }
        state.aliases.insert(alias.to_string(), target.to_string());
        Ok(())
    }

    /// Resolves a name through the alias chain to a concrete store name.
    pub fn resolve(name: &str) -> Option<String> {
        read_state().resolve(name)
    }

    /// Drops every configured store and alias. Registered backends stay.
    /// Meant for tests.
    pub fn clear() {
        let mut state = write_state();
        state.stores.clear();
        state.aliases.clear();
        state.default_store = None;
    }
}

/// Serializes tests that exercise the process-wide registry.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::Mutex;
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(path: &std::path::Path) -> HashMap<String, String> {
        HashMap::from([(
            "depot.storage_path".to_string(),
            path.to_string_lossy().into_owned(),
        )])
    }

    fn memory_config() -> HashMap<String, String> {
        HashMap::from([("depot.backend".to_string(), "memory".to_string())])
    }

    #[tokio::test]
    async fn test_first_configured_is_default() {
        let _guard = test_guard();
        DepotRegistry::clear();
        let dir = tempfile::tempdir().unwrap();

        DepotRegistry::configure("first", &local_config(dir.path()))
            .await
            .unwrap();
        DepotRegistry::configure("second", &memory_config())
            .await
            .unwrap();
        assert_eq!(DepotRegistry::get_default().unwrap(), "first");

        DepotRegistry::set_default("second").unwrap();
        assert_eq!(DepotRegistry::get_default().unwrap(), "second");
        assert_eq!(DepotRegistry::get(None).unwrap().backend(), "memory");
    }

    #[tokio::test]
    async fn test_unconfigured_registry_is_detected() {
        let _guard = test_guard();
        DepotRegistry::clear();
        assert!(DepotRegistry::get_default().is_err());
        assert!(DepotRegistry::get(None).is_err());
        assert!(DepotRegistry::set_default("does_not_exist").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_names_refused() {
        let _guard = test_guard();
        DepotRegistry::clear();
        DepotRegistry::configure("first", &memory_config())
            .await
            .unwrap();
        let err = DepotRegistry::configure("first", &memory_config())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_unknown_backend_refused() {
        let _guard = test_guard();
        DepotRegistry::clear();
        let config = HashMap::from([("depot.backend".to_string(), "carrier-pigeon".to_string())]);
        let err = DepotRegistry::configure("first", &config).await.unwrap_err();
        assert!(err.message.contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn test_alias_chain_resolution() {
        let _guard = test_guard();
        DepotRegistry::clear();
        DepotRegistry::configure("store", &memory_config())
            .await
            .unwrap();

        DepotRegistry::alias("b", "store").unwrap();
        DepotRegistry::alias("a", "b").unwrap();

        assert_eq!(DepotRegistry::resolve("a").as_deref(), Some("store"));
        assert!(DepotRegistry::get(Some("a")).is_ok());
    }

    #[tokio::test]
    async fn test_alias_can_be_repointed() {
        let _guard = test_guard();
        DepotRegistry::clear();
        let dir = tempfile::tempdir().unwrap();
        DepotRegistry::configure("first", &local_config(dir.path()))
            .await
            .unwrap();
        DepotRegistry::configure("second", &memory_config())
            .await
            .unwrap();

        DepotRegistry::alias("used_storage", "first").unwrap();
        assert_eq!(
            DepotRegistry::get(Some("used_storage")).unwrap().backend(),
            "local"
        );
        DepotRegistry::alias("used_storage", "second").unwrap();
        assert_eq!(
            DepotRegistry::get(Some("used_storage")).unwrap().backend(),
            "memory"
        );
    }

    #[tokio::test]
    async fn test_alias_rules() {
        let _guard = test_guard();
        DepotRegistry::clear();
        DepotRegistry::configure("mystorage", &memory_config())
            .await
            .unwrap();

        // missing target
        assert!(DepotRegistry::alias("x", "missing").is_err());
        // shadowing a concrete store name
        assert!(DepotRegistry::alias("mystorage", "mystorage").is_err());
        // configuring over an alias name
        DepotRegistry::alias("nickname", "mystorage").unwrap();
        assert!(DepotRegistry::configure("nickname", &memory_config())
            .await
            .is_err());
    }
}
