//! Opening databases by name.
//!
//! A [`Driver`] keeps a table of named readers, each yielding a SQLite image.
//! Opening a name consumes its reader; opening the empty name creates a fresh
//! in-memory database.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::resolver::CapabilityResolver;
use crate::sqlite::{Database, SqlEngine};

type Reader = Box<dyn Read + Send>;

pub struct Driver {
    namespace: Arc<Namespace>,
    resolver: CapabilityResolver,
    readers: Mutex<HashMap<String, Reader>>,
}

impl Driver {
    /// A driver that finds the engine in `namespace`, loading it through the
    /// global module registry when absent.
    pub fn new(namespace: Arc<Namespace>) -> Self {
        Self::with_resolver(namespace, CapabilityResolver::sql())
    }

    pub fn with_resolver(namespace: Arc<Namespace>, resolver: CapabilityResolver) -> Self {
        Self {
            namespace,
            resolver,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a reader under `name` for a later [`open`](Driver::open).
    pub fn add_reader<R>(&self, name: &str, reader: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        let mut readers = self.readers.lock();
        if readers.contains_key(name) {
            return Err(Error::ReaderAlreadyRegistered(name.to_string()));
        }
        readers.insert(name.to_string(), Box::new(reader));
        Ok(())
    }

    pub fn has_reader(&self, name: &str) -> bool {
        self.readers.lock().contains_key(name)
    }

    /// Open the database registered as `dsn`, or a new in-memory one when
    /// `dsn` is empty.
    pub fn open(&self, dsn: &str) -> Result<Database> {
        let engine = self.engine()?;
        if dsn.is_empty() {
            return engine.new_database();
        }

        let reader = self
            .readers
            .lock()
            .remove(dsn)
            .ok_or_else(|| Error::ReaderNotFound(dsn.to_string()))?;
        debug!(dsn, "opening database from registered reader");
        engine.open_reader(reader)
    }

    fn engine(&self) -> Result<Arc<SqlEngine>> {
        Ok(self.resolver.resolve_as::<SqlEngine>(&self.namespace)?)
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut readers: Vec<String> = self.readers.lock().keys().cloned().collect();
        readers.sort();
        f.debug_struct("Driver")
            .field("resolver", &self.resolver)
            .field("readers", &readers)
            .finish()
    }
}
