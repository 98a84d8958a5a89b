//! Thin bindings over the SQL engine capability.
//!
//! [`SqlEngine`] is the object bound into the namespace under `"SQL"`. Everything
//! else here is reached through it: databases, prepared statements and the
//! value model. SQL itself is parsed and executed by SQLite.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Batch, Connection, Row, ToSql};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{CapabilityUnavailable, Error, Result};
use crate::namespace::Namespace;
use crate::resolver::CapabilityResolver;

/// Core value types for SQLite operations
///
/// SQLite has no boolean storage class. [`Value::Boolean`] is written as an
/// INTEGER (`0` or `1`) and reads back as [`Value::Integer`], so booleans do
/// not round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Boolean(b) => {
                ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b)))
            }
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Named parameter bindings for SQL queries.
///
/// Names may carry their SQLite prefix (`:`, `@` or `$`); bare names are
/// bound as `:name`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Params {
    pub values: HashMap<String, Value>,
}

impl Params {
    /// Create a new Params object
    pub fn new() -> Self {
        Self::default()
    }
    /// Add a named value
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn prefixed(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .map(|(name, value)| {
                let name = if name.starts_with(|c| matches!(c, ':' | '@' | '$')) {
                    name.clone()
                } else {
                    format!(":{name}")
                };
                (name, value.clone())
            })
            .collect()
    }
}

/// Rows produced by one statement of [`Database::exec`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

/// Entry point of the SQL engine.
#[derive(Debug, Default)]
pub struct SqlEngine {
    _private: (),
}

impl SqlEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine bound in `namespace`, loading it if necessary.
    pub fn resolve(namespace: &Namespace) -> Result<Arc<SqlEngine>, CapabilityUnavailable> {
        CapabilityResolver::sql().resolve_as::<SqlEngine>(namespace)
    }

    /// Version string of the underlying SQLite library.
    pub fn version(&self) -> &'static str {
        rusqlite::version()
    }

    /// A new, empty in-memory database.
    pub fn new_database(&self) -> Result<Database> {
        let conn = Connection::open_in_memory()?;
        debug!("opened in-memory database");
        Ok(Database { conn, image: None })
    }

    /// Open (or create) a database file on disk.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<Database> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened database file");
        Ok(Database { conn, image: None })
    }

    /// Open a database from a SQLite image held in memory.
    ///
    /// The image is copied; changes made through the returned database never
    /// reach `bytes`.
    pub fn open_bytes(&self, bytes: &[u8]) -> Result<Database> {
        let mut image = NamedTempFile::new()?;
        image.write_all(bytes)?;
        image.flush()?;
        let conn = Connection::open(image.path())?;
        debug!(size = bytes.len(), "opened database image");
        Ok(Database {
            conn,
            image: Some(image),
        })
    }

    /// Open a database from a reader yielding a SQLite image.
    pub fn open_reader<R: Read>(&self, mut reader: R) -> Result<Database> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.open_bytes(&bytes)
    }
}

/// An open database.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    // Backing file of databases opened from an image; removed on drop.
    image: Option<NamedTempFile>,
}

impl Database {
    /// Run one or more `;`-separated statements, ignoring any rows.
    pub fn run(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a single statement with positional parameters, ignoring any rows.
    pub fn run_params(&self, sql: &str, values: &[Value]) -> Result<()> {
        let mut stmt = self.prepare(sql)?;
        stmt.run_with(values)
    }

    /// Run every statement in `sql` and collect the rows of those that
    /// return at least one row.
    pub fn exec(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let mut results = Vec::new();
        let mut batch = Batch::new(&self.conn, sql);
        while let Some(mut stmt) = batch.next()? {
            let width = stmt.column_count();
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut values = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                values.push(read_row(row, width)?);
            }
            if !values.is_empty() {
                results.push(QueryResult { columns, values });
            }
        }
        Ok(results)
    }

    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let inner = self.conn.prepare(sql)?;
        Ok(Statement {
            inner,
            cursor: Cursor::Ready,
            current: None,
        })
    }

    /// Prepare `sql` and bind positional values.
    pub fn prepare_with(&self, sql: &str, values: &[Value]) -> Result<Statement<'_>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind(values)?;
        Ok(stmt)
    }

    /// Prepare `sql` and bind named values.
    pub fn prepare_named(&self, sql: &str, params: &Params) -> Result<Statement<'_>> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_named(params)?;
        Ok(stmt)
    }

    /// Rows modified, inserted or deleted by the most recent INSERT, UPDATE
    /// or DELETE.
    pub fn rows_modified(&self) -> i64 {
        self.conn.changes() as i64
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// The current contents of the database as a SQLite image.
    pub fn export(&self) -> Result<Vec<u8>> {
        let target = NamedTempFile::new()?;
        let path = target.path().to_string_lossy().into_owned();
        self.conn.execute("VACUUM INTO ?1", [path.as_str()])?;
        Ok(std::fs::read(target.path())?)
    }

    /// Whether this database was opened from an in-memory image.
    pub fn is_image(&self) -> bool {
        self.image.is_some()
    }

    /// Close the database, releasing all associated resources.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| Error::Engine(err))?;
        debug!("closed database");
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Executes on the next step.
    Ready,
    /// Positioned on a row.
    Active,
    /// No rows left until the statement is reset.
    Done,
}

/// A prepared statement.
///
/// The statement executes on the first [`step`](Statement::step) after being
/// prepared, bound or reset. Rows are read from SQLite one step at a time.
/// Parameters left unbound are `NULL`.
#[derive(Debug)]
pub struct Statement<'db> {
    inner: rusqlite::Statement<'db>,
    cursor: Cursor,
    current: Option<Vec<Value>>,
}

impl Statement<'_> {
    /// Reset the statement and bind positional values.
    pub fn bind(&mut self, values: &[Value]) -> Result<()> {
        self.reset()?;
        let expected = self.inner.parameter_count();
        if values.len() > expected {
            return Err(Error::Engine(rusqlite::Error::InvalidParameterCount(
                values.len(),
                expected,
            )));
        }
        for (idx, value) in values.iter().enumerate() {
            self.inner.raw_bind_parameter(idx + 1, value)?;
        }
        Ok(())
    }

    /// Reset the statement and bind named values.
    pub fn bind_named(&mut self, params: &Params) -> Result<()> {
        self.reset()?;
        for (name, value) in params.prefixed() {
            match self.inner.parameter_index(&name)? {
                Some(idx) => self.inner.raw_bind_parameter(idx, &value)?,
                None => {
                    return Err(Error::Engine(rusqlite::Error::InvalidParameterName(name)));
                }
            }
        }
        Ok(())
    }

    /// Advance to the next row, executing the statement if needed.
    ///
    /// Returns `false` once the rows are exhausted, and keeps returning
    /// `false` until the statement is reset or bound again.
    pub fn step(&mut self) -> Result<bool> {
        self.current = None;
        if self.cursor == Cursor::Done {
            return Ok(false);
        }

        let width = self.inner.column_count();
        let mut rows = self.inner.raw_query();
        let row = match rows.next() {
            Ok(Some(row)) => read_row(row, width),
            Ok(None) => {
                self.cursor = Cursor::Done;
                return Ok(false);
            }
            Err(err) => Err(err),
        };
        match row {
            Ok(values) => {
                // Dropping `Rows` resets the statement; the cursor must stay
                // on this row for the next step.
                std::mem::forget(rows);
                self.cursor = Cursor::Active;
                self.current = Some(values);
                Ok(true)
            }
            Err(err) => {
                drop(rows);
                self.cursor = Cursor::Done;
                Err(err.into())
            }
        }
    }

    /// The current row. [`step`](Statement::step) must have returned `true`.
    pub fn get(&self) -> Result<Vec<Value>> {
        self.current.clone().ok_or(Error::NoCurrentRow)
    }

    /// Bind `values`, execute, and return the first row if there is one.
    pub fn get_with(&mut self, values: &[Value]) -> Result<Option<Vec<Value>>> {
        self.bind(values)?;
        self.first_row()
    }

    /// Bind named `params`, execute, and return the first row if there is one.
    pub fn get_named(&mut self, params: &Params) -> Result<Option<Vec<Value>>> {
        self.bind_named(params)?;
        self.first_row()
    }

    /// The current row keyed by column name.
    pub fn get_as_map(&self) -> Result<HashMap<String, Value>> {
        let row = self.get()?;
        Ok(self.column_names().into_iter().zip(row).collect())
    }

    /// [`get_with`](Statement::get_with), keyed by column name.
    pub fn get_as_map_with(&mut self, values: &[Value]) -> Result<Option<HashMap<String, Value>>> {
        self.bind(values)?;
        self.first_row_as_map()
    }

    /// [`get_named`](Statement::get_named), keyed by column name.
    pub fn get_as_map_named(&mut self, params: &Params) -> Result<Option<HashMap<String, Value>>> {
        self.bind_named(params)?;
        self.first_row_as_map()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.inner
            .column_names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }

    /// Rewind so the statement executes again on the next step, and clear
    /// all bindings.
    pub fn reset(&mut self) -> Result<()> {
        self.rewind();
        for idx in 1..=self.inner.parameter_count() {
            self.inner.raw_bind_parameter(idx, rusqlite::types::Null)?;
        }
        Ok(())
    }

    /// Execute with the current bindings ignoring rows, then reset.
    pub fn run(&mut self) -> Result<()> {
        self.rewind();
        let outcome = self.step();
        self.reset()?;
        outcome.map(|_| ())
    }

    /// Bind `values`, then [`run`](Statement::run).
    pub fn run_with(&mut self, values: &[Value]) -> Result<()> {
        self.bind(values)?;
        self.run()
    }

    /// Bind named `params`, then [`run`](Statement::run).
    pub fn run_named(&mut self, params: &Params) -> Result<()> {
        self.bind_named(params)?;
        self.run()
    }

    /// Release the statement.
    pub fn free(self) -> Result<()> {
        self.inner.finalize()?;
        Ok(())
    }

    // Bindings survive a rewind.
    fn rewind(&mut self) {
        // A fresh `Rows` dropped straight away resets the statement.
        drop(self.inner.raw_query());
        self.cursor = Cursor::Ready;
        self.current = None;
    }

    fn first_row(&mut self) -> Result<Option<Vec<Value>>> {
        if self.step()? {
            self.get().map(Some)
        } else {
            Ok(None)
        }
    }

    fn first_row_as_map(&mut self) -> Result<Option<HashMap<String, Value>>> {
        if self.step()? {
            self.get_as_map().map(Some)
        } else {
            Ok(None)
        }
    }
}

fn read_row(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<Value>> {
    let mut values = Vec::with_capacity(width);
    for idx in 0..width {
        values.push(Value::from(row.get_ref(idx)?));
    }
    Ok(values)
}
