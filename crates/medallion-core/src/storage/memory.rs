//! In-memory storage backend.
//!
//! Stores are registered by name for the lifetime of the process, so every
//! provider opened on `memory://<name>` sees the same objects.

use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::{BackendConfig, StorageProvider};

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<InMemory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub name: String,
    pub key: Option<Path>,
}

fn shared_store(name: &str) -> Arc<InMemory> {
    let mut registry = REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(InMemory::new()))
        .clone()
}

impl StorageProvider {
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let object_store: Arc<dyn ObjectStore> = shared_store(&config.name);
        let canonical_url = match &config.key {
            Some(key) => format!("memory://{}/{key}", config.name),
            None => format!("memory://{}", config.name),
        };

        Self {
            config: BackendConfig::Memory(config),
            object_store,
            canonical_url,
        }
    }
}
