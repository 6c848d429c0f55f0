/// Stage type registry using ArcSwap
///
/// Maps a stage type name to its constructor and metadata. Registration happens at
/// process start; afterwards the registry is read-only during execution and shared
/// across concurrent runs. Each registration swaps the whole lookup table, so readers
/// never block and never observe a half-updated map.

use crate::config::EngineConfig;
use crate::pipeline::types::ModuleDescriptor;
use crate::runtime::stage::StageFactory;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// A registered stage type
#[derive(Clone)]
pub struct RegisteredModule {
    /// Metadata reported by `list_modules`
    pub descriptor: ModuleDescriptor,
    /// Constructor for stage instances
    pub factory: StageFactory,
    /// Backend whose registration is active
    pub backend: String,
    /// Every backend that registered this name, in registration order
    pub providers: Vec<String>,
}

impl std::fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("name", &self.descriptor.name)
            .field("capability", &self.descriptor.capability)
            .field("backend", &self.backend)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Lock-free registry of stage types
///
/// Key: lowercase type name. Lookups are case-insensitive and a dotted name such as
/// `core.FeatureReader` also matches its last segment.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: ArcSwap<HashMap<String, RegisteredModule>>,
    config: EngineConfig,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new(config: EngineConfig) -> Self {
        Self {
            modules: ArcSwap::new(Arc::new(HashMap::new())),
            config,
        }
    }

    /// Create a registry holding the built-in `core` backend
    pub fn with_builtin(config: EngineConfig) -> Self {
        let registry = Self::new(config);
        crate::stages::register_builtin(&registry);
        registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a stage type for `backend`
    ///
    /// The last registration wins unless the configured backend precedence ranks the
    /// current owner higher. Provenance is recorded either way. Returns whether the
    /// new registration became active.
    pub fn register(&self, backend: &str, descriptor: ModuleDescriptor, factory: StageFactory) -> bool {
        let key = descriptor.name.to_ascii_lowercase();
        let rank = self.config.backend_rank(backend);
        let mut activated = false;

        self.modules.rcu(|current| {
            let mut updated = (**current).clone();
            let owner = updated.get(&key).map(|m| m.backend.clone());
            let mut providers = updated.get(&key).map(|m| m.providers.clone()).unwrap_or_default();
            providers.push(backend.to_string());

            if let Some(owner) = owner {
                if self.config.backend_rank(&owner) < rank {
                    if let Some(existing) = updated.get_mut(&key) {
                        existing.providers = providers;
                    }
                    activated = false;
                    return updated;
                }
            }

            updated.insert(
                key.clone(),
                RegisteredModule {
                    descriptor: descriptor.clone(),
                    factory: factory.clone(),
                    backend: backend.to_string(),
                    providers,
                },
            );
            activated = true;
            updated
        });

        if activated {
            tracing::debug!("🧩 Registered stage type {} from backend {}", descriptor.name, backend);
        } else {
            tracing::debug!(
                "🧩 Kept existing {} over backend {} (precedence)",
                descriptor.name,
                backend
            );
        }
        activated
    }

    /// Look up a stage type (lock-free read)
    pub fn resolve(&self, type_name: &str) -> Option<RegisteredModule> {
        let modules = self.modules.load();
        let key = type_name.trim().to_ascii_lowercase();

        if let Some(module) = modules.get(&key) {
            return Some(module.clone());
        }
        key.rsplit_once('.')
            .and_then(|(_, last)| modules.get(last))
            .cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_some()
    }

    /// Metadata of every registered type, sorted by name
    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        let mut modules: Vec<ModuleDescriptor> = self
            .modules
            .load()
            .values()
            .map(|m| m.descriptor.clone())
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn len(&self) -> usize {
        self.modules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.load().is_empty()
    }
}
