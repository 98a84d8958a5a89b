use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::lock::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::resolver::CapabilityResolver;
use crate::schema::Schema;
use crate::sqlite::{Database, Params, SqlEngine, Value};

/// Start/stop hooks of a long running component.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// SQL Query with named parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Params,
}

impl SqlQuery {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            params: Params::new(),
        }
    }
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Where the service keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseSource {
    #[default]
    Memory,
    File { path: PathBuf },
}

/// SQL service configuration
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub source: DatabaseSource,
    #[serde(default)]
    pub schema: Schema,
}

impl ServiceConfig {
    /// Config for a database file at `path`.
    pub fn file(path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            source: DatabaseSource::File { path: path.into() },
            schema,
        }
    }

    /// Config for a private in-memory database.
    pub fn memory(schema: Schema) -> Self {
        Self {
            source: DatabaseSource::Memory,
            schema,
        }
    }
}

/// A database behind the SQL engine capability, opened on start and closed
/// on stop.
pub struct SqlService {
    config: ServiceConfig,
    namespace: Arc<Namespace>,
    resolver: CapabilityResolver,
    database: Mutex<Option<Database>>,
}

impl SqlService {
    pub fn new(config: ServiceConfig, namespace: Arc<Namespace>) -> Self {
        Self {
            config,
            namespace,
            resolver: CapabilityResolver::sql(),
            database: Mutex::new(None),
        }
    }

    /// Acquire the engine through `resolver` instead of the default one.
    pub fn with_resolver(mut self, resolver: CapabilityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.database.lock().await.is_some()
    }

    /// Run `query`, returning every row keyed by column name.
    pub async fn execute(&self, query: SqlQuery) -> Result<Vec<HashMap<String, Value>>> {
        let guard = self.database.lock().await;
        let db = guard.as_ref().ok_or(Error::NotStarted)?;

        let mut stmt = db.prepare(&query.statement)?;
        if !query.params.is_empty() {
            stmt.bind_named(&query.params)?;
        }
        let mut rows = Vec::new();
        while stmt.step()? {
            rows.push(stmt.get_as_map()?);
        }
        Ok(rows)
    }

    /// Rows changed by the last statement run through [`execute`](Self::execute).
    pub async fn rows_modified(&self) -> Result<i64> {
        let guard = self.database.lock().await;
        let db = guard.as_ref().ok_or(Error::NotStarted)?;
        Ok(db.rows_modified())
    }

    fn open(&self, engine: &SqlEngine) -> Result<Database> {
        match &self.config.source {
            DatabaseSource::Memory => engine.new_database(),
            DatabaseSource::File { path } => engine.open_file(path),
        }
    }

    fn initialize_schema(&self, db: &Database) -> Result<()> {
        db.run("PRAGMA foreign_keys = ON")?;
        for statement in self.config.schema.to_statements()? {
            debug!(%statement, "applying schema");
            db.connection().execute(&statement, [])?;
        }
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for SqlService {
    async fn start(&self) -> Result<()> {
        let mut guard = self.database.lock().await;
        if guard.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let engine = self.resolver.resolve_as::<SqlEngine>(&self.namespace)?;
        let db = self.open(&engine)?;
        self.initialize_schema(&db)?;
        info!(
            source = ?self.config.source,
            tables = self.config.schema.tables.len(),
            "sql service started"
        );
        *guard = Some(db);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let db = self.database.lock().await.take();
        if let Some(db) = db {
            db.close()?;
            info!("sql service stopped");
        }
        Ok(())
    }
}
