//! Capability resolution: return what the namespace already holds, otherwise
//! acquire it once and bind it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::CapabilityUnavailable;
use crate::loader::{ModuleLoader, ModuleRegistry, SQL_MODULE};
use crate::namespace::{CapabilityRef, Namespace};

/// Namespace slot the SQL engine lives in.
pub const SQL_CAPABILITY: &str = "SQL";

/// Return the capability bound under `name`, acquiring and binding it first
/// if the slot is empty.
///
/// `acquire` is called at most once, and only when the slot is empty. The
/// namespace is written only when `acquire` yields a reference. An error or
/// `None` from `acquire` leaves the namespace as it was and is reported as
/// [`CapabilityUnavailable`], so a later call may try again.
///
/// Concurrent callers for the same name are serialized, so `acquire` runs
/// once for all of them. Other names stay available while `acquire` runs, so
/// it may resolve its own dependencies from `namespace`, but never `name`
/// itself.
pub fn ensure_capability<F>(
    namespace: &Namespace,
    name: &str,
    acquire: F,
) -> Result<CapabilityRef, CapabilityUnavailable>
where
    F: FnOnce() -> anyhow::Result<Option<CapabilityRef>>,
{
    if name.is_empty() {
        return Err(CapabilityUnavailable::with_hint(
            name,
            "capability name must not be empty",
        ));
    }

    if let Some(existing) = namespace.get(name) {
        return Ok(existing);
    }

    let gate = namespace.gate(name);
    let _acquiring = gate.lock();
    // Another caller may have bound it while we waited.
    if let Some(existing) = namespace.get(name) {
        return Ok(existing);
    }

    match acquire() {
        Ok(Some(capability)) => {
            debug!(capability = name, "acquired capability");
            Ok(namespace.bind(name, capability))
        }
        Ok(None) => Err(CapabilityUnavailable::with_hint(
            name,
            format!(
                "Cannot find global {name} object. Acquisition yielded nothing. \
                 Load the {name} capability before using it."
            ),
        )),
        Err(err) => Err(CapabilityUnavailable::with_hint(
            name,
            format!(
                "Cannot find global {name} object. Acquisition failed. \
                 Load the {name} capability before using it."
            ),
        )
        .caused_by(err)),
    }
}

/// A capability name together with the module that provides it.
#[derive(Clone)]
pub struct CapabilityResolver {
    name: String,
    module_id: String,
    loader: Arc<dyn ModuleLoader>,
}

impl CapabilityResolver {
    pub fn new(
        name: impl Into<String>,
        module_id: impl Into<String>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self {
            name: name.into(),
            module_id: module_id.into(),
            loader,
        }
    }

    /// The SQL engine: slot [`SQL_CAPABILITY`], module [`SQL_MODULE`], loaded
    /// through the global module registry.
    pub fn sql() -> Self {
        Self::new(SQL_CAPABILITY, SQL_MODULE, ModuleRegistry::global())
    }

    /// Use `loader` instead of the current one.
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn resolve(&self, namespace: &Namespace) -> Result<CapabilityRef, CapabilityUnavailable> {
        ensure_capability(namespace, &self.name, || self.loader.load(&self.module_id))
            .map_err(|err| self.with_module_hint(err))
    }

    /// Like [`resolve`](Self::resolve), but downcast to the entry point type.
    ///
    /// A freshly loaded module of the wrong type is not bound.
    pub fn resolve_as<T: Any + Send + Sync>(
        &self,
        namespace: &Namespace,
    ) -> Result<Arc<T>, CapabilityUnavailable> {
        let capability = ensure_capability(namespace, &self.name, || {
            let loaded = self.loader.load(&self.module_id)?;
            match loaded {
                Some(capability) if !capability.is::<T>() => Err(anyhow::anyhow!(
                    "module '{}' does not provide a {}",
                    self.module_id,
                    std::any::type_name::<T>()
                )),
                other => Ok(other),
            }
        })
        .map_err(|err| self.with_module_hint(err))?;

        capability.downcast::<T>().map_err(|_| {
            CapabilityUnavailable::with_hint(
                &self.name,
                format!(
                    "global {} object is bound to an incompatible type; expected {}",
                    self.name,
                    std::any::type_name::<T>()
                ),
            )
        })
    }

    fn with_module_hint(&self, err: CapabilityUnavailable) -> CapabilityUnavailable {
        if err.name.is_empty() {
            return err;
        }
        let mut missing = CapabilityUnavailable::missing(&self.name, &self.module_id);
        missing.source = err.source;
        missing
    }
}

impl fmt::Debug for CapabilityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityResolver")
            .field("name", &self.name)
            .field("module_id", &self.module_id)
            .finish()
    }
}
