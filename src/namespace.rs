//! The shared namespace capabilities are looked up in.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Opaque handle to an acquired library entry point.
pub type CapabilityRef = Arc<dyn Any + Send + Sync>;

static GLOBAL: Lazy<Namespace> = Lazy::new(Namespace::new);

/// Mapping from capability name to capability reference.
///
/// Holds at most one binding per name. Entries are only ever added through
/// [`Namespace::bind`], which refuses to replace an existing binding.
#[derive(Default)]
pub struct Namespace {
    slots: Mutex<HashMap<String, CapabilityRef>>,
    // One acquisition lock per name, so resolving one capability never waits
    // on another.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Namespace {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide namespace.
    pub fn global() -> &'static Namespace {
        &GLOBAL
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.slots.lock().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<CapabilityRef> {
        self.slots.lock().get(name).cloned()
    }

    /// Typed lookup. `None` when unbound or bound to another type.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|cap| cap.downcast::<T>().ok())
    }

    /// Bind `capability` under `name` unless the slot is taken.
    ///
    /// Returns the reference that ends up bound: `capability` itself, or the
    /// existing one if the slot was already occupied.
    pub fn bind(&self, name: &str, capability: CapabilityRef) -> CapabilityRef {
        self.slots
            .lock()
            .entry(name.to_string())
            .or_insert(capability)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Names of all bound capabilities, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// The lock serializing acquisition of `name`.
    ///
    /// The map lock is released before this returns; only callers resolving
    /// the same name contend on the returned gate.
    pub(crate) fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("bound", &self.names())
            .finish()
    }
}

/// Whether `name` is bound in `namespace`.
pub fn is_bound(namespace: &Namespace, name: &str) -> bool {
    namespace.is_bound(name)
}
