//! Error types.
//!
//! `CapabilityUnavailable` is the only failure the resolver produces. The
//! bindings, driver and service layers report through [`Error`], which wraps
//! it transparently.

use thiserror::Error;

/// The capability is not bound and could not be acquired.
#[derive(Debug, Error)]
#[error("{hint}")]
pub struct CapabilityUnavailable {
    /// Name of the namespace slot that stayed empty.
    pub name: String,
    /// Human readable diagnostic, always mentions `name`.
    pub hint: String,
    /// What the acquisition strategy reported, if it failed rather than
    /// returning nothing.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CapabilityUnavailable {
    /// The standard diagnostic for a capability expected from `module`.
    pub fn missing(name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            hint: format!("Cannot find global {name} object. Did you load {module}?"),
            source: None,
        }
    }

    pub fn with_hint(name: &str, hint: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            hint: hint.into(),
            source: None,
        }
    }

    pub fn caused_by(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Errors from the module registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module `{0}` already registered")]
    AlreadyRegistered(String),
}

/// Crate level error for everything built on top of the resolver.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Capability(#[from] CapabilityUnavailable),

    #[error("SQL engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reader `{0}` already registered")]
    ReaderAlreadyRegistered(String),

    #[error("reader `{0}` does not exist; call add_reader() first")]
    ReaderNotFound(String),

    #[error("no current row; call step() first")]
    NoCurrentRow,

    #[error("service not started")]
    NotStarted,

    #[error("service already started")]
    AlreadyStarted,

    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
