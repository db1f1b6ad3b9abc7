use std::{collections::BTreeMap, sync::Arc};

use super::{Backend, CompileError, DsaPolicy, GenericBackend, RenderOptions};

/// Backends available to configs and templates, keyed by identifier.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    dsa: DsaPolicy,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    pub fn new(dsa: DsaPolicy) -> Self {
        Self {
            backends: BTreeMap::new(),
            dsa,
        }
    }

    /// Registry with the built-in `netjson` and `openwrt` backends.
    pub fn with_defaults(dsa: DsaPolicy) -> Result<Self, CompileError> {
        let mut registry = Self::new(dsa);
        registry.register(Arc::new(GenericBackend::netjson()?));
        registry.register(Arc::new(GenericBackend::openwrt()?));
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Backend>, CompileError> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| CompileError::UnknownBackend(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Render options for a device running `os` on `backend`.
    pub fn options_for(&self, backend: &dyn Backend, os: Option<&str>) -> RenderOptions {
        RenderOptions {
            dsa: backend.supports_dsa().then(|| self.dsa.uses_dsa(os)),
        }
    }
}
