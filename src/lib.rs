//! Lazy resolution of the SQL engine capability.
//!
//! # Intention
//!
//! - Find the SQL engine in a shared [`Namespace`] under `"SQL"`, loading it
//!   once through a [`ModuleLoader`] when it is missing.
//! - Fail with a [`CapabilityUnavailable`] naming the capability instead of
//!   handing out an empty engine.
//! - Provide thin bindings, a reader-backed [`Driver`] and a [`SqlService`]
//!   that all obtain the engine through the resolver.
//!
//! # Architectural Boundaries
//!
//! - SQL is parsed and executed by SQLite, never here.
//! - The resolver writes a namespace slot at most once and never replaces a
//!   binding.

pub mod driver;
pub mod error;
pub mod loader;
pub mod namespace;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod sqlite;

pub use driver::Driver;
pub use error::{CapabilityUnavailable, Error, ModuleError, Result};
pub use loader::{ModuleLoader, ModuleRegistry, SQL_MODULE};
pub use namespace::{is_bound, CapabilityRef, Namespace};
pub use resolver::{ensure_capability, CapabilityResolver, SQL_CAPABILITY};
pub use schema::{
    ColumnConstraint, ColumnDefinition, DataType, DefaultValue, ForeignKey, ForeignKeyAction,
    IndexDefinition, Schema, TableDefinition,
};
pub use service::{DatabaseSource, Lifecycle, ServiceConfig, SqlQuery, SqlService};
pub use sqlite::{Database, Params, QueryResult, SqlEngine, Statement, Value};
