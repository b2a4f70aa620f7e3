//! Runtime backend registry for dynamic backend selection.
//!
//! Backends are registered by [`BackendType`] from any crate, which keeps
//! hardcoded backend types out of the worker. The reference kernel crate
//! registers its CPU backend through [`register_backend`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::{Backend, BackendType};

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

/// Global backend registry mapping backend types to constructors.
struct BackendRegistry {
    backends: RwLock<HashMap<BackendType, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, ty: BackendType, constructor: BackendConstructor) {
        let mut guard = self
            .backends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(ty, constructor);
    }

    fn create(&self, ty: BackendType) -> Option<Arc<dyn Backend>> {
        let guard = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let constructor = guard.get(&ty)?;
        Some(constructor())
    }

    fn contains(&self, ty: BackendType) -> bool {
        let guard = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.contains_key(&ty)
    }

    fn list(&self) -> Vec<BackendType> {
        let guard = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.keys().copied().collect()
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend constructor for `ty`, replacing any previous one.
///
/// # Example
/// ```ignore
/// use layerwise::backend::{registry::register_backend, BackendType};
///
/// register_backend(BackendType::Cpu, || std::sync::Arc::new(MyCpuBackend::new()));
/// ```
pub fn register_backend<F>(ty: BackendType, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    tracing::debug!(backend = %ty, "registering backend");
    global_registry().register(ty, Box::new(constructor));
}

/// Create a backend instance, `None` if nothing is registered for `ty`.
pub fn create_backend(ty: BackendType) -> Option<Arc<dyn Backend>> {
    global_registry().create(ty)
}

/// List all registered backend types.
pub fn list_backends() -> Vec<BackendType> {
    global_registry().list()
}

/// Check if a backend is registered for `ty`.
pub fn has_backend(ty: BackendType) -> bool {
    global_registry().contains(ty)
}
