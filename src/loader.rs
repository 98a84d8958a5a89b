//! Module loading: how a capability is acquired when the namespace lacks it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::ModuleError;
use crate::namespace::CapabilityRef;
use crate::sqlite::SqlEngine;

/// Identifier of the built-in SQL engine module.
pub const SQL_MODULE: &str = "rusqlite";

/// Loads a module by identifier.
///
/// `Ok(None)` means the loader ran but the module yielded nothing.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, module_id: &str) -> anyhow::Result<Option<CapabilityRef>>;
}

type Factory = Arc<dyn Fn() -> anyhow::Result<CapabilityRef> + Send + Sync>;

static GLOBAL: Lazy<Arc<ModuleRegistry>> =
    Lazy::new(|| Arc::new(ModuleRegistry::with_builtins()));

/// Table of module factories keyed by identifier.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows the SQL engine module.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .factories
            .write()
            .insert(SQL_MODULE.to_string(), Arc::new(load_sql_engine));
        registry
    }

    /// The process-wide registry, pre-populated with [`SQL_MODULE`].
    pub fn global() -> Arc<ModuleRegistry> {
        GLOBAL.clone()
    }

    /// Register a factory under `module_id`. Ids are never replaced.
    pub fn register<F>(&self, module_id: &str, factory: F) -> Result<(), ModuleError>
    where
        F: Fn() -> anyhow::Result<CapabilityRef> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(module_id) {
            return Err(ModuleError::AlreadyRegistered(module_id.to_string()));
        }
        factories.insert(module_id.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.factories.read().contains_key(module_id)
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load(&self, module_id: &str) -> anyhow::Result<Option<CapabilityRef>> {
        // Clone out so the factory runs without the table locked.
        let factory = self.factories.read().get(module_id).cloned();
        match factory {
            Some(factory) => factory().map(Some),
            None => Err(anyhow::anyhow!("cannot find module '{module_id}'")),
        }
    }
}

fn load_sql_engine() -> anyhow::Result<CapabilityRef> {
    Ok(Arc::new(SqlEngine::new()))
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("ModuleRegistry").field("modules", &ids).finish()
    }
}
