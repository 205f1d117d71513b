//! SQL data handle (SQLite and PostgreSQL via sqlx)
//!
//! The filter is compiled into a `WHERE` clause. Identifiers are always
//! quoted, text literals are bound as parameters, and numeric literals are
//! rendered from their validated decimal value, so no user text is ever
//! spliced into the statement.
//!
//! Every projected column is selected as `CAST(col AS TEXT)` and parsed on
//! our side. That keeps decoding uniform across drivers and column types,
//! and lets exact decimals through without going via `f64`.

use super::{CellValue, DataHandle, ScanRequest};
use crate::query::{FilterPredicate, Literal};
use crate::worker::LocalExecutionError;
use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use std::time::Duration;
use tracing::debug;

/// SQL flavour, picked from the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else {
            None
        }
    }

    fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${}", index),
        }
    }

    /// Quote an identifier, doubling embedded quote characters
    ///
    /// SQLite gets backticks: it reads an unknown double-quoted name as a
    /// string literal instead of failing.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Self::Sqlite => format!("`{}`", name.replace('`', "``")),
            Self::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Quote a possibly schema-qualified table name (`schema.table`)
    pub fn quote_table(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Where a participant's table lives
///
/// Cheap to clone; holds no connection. [`DataSource::open`] creates a
/// request-scoped [`SqlDataHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    url: String,
    table: String,
    dialect: SqlDialect,
}

impl DataSource {
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Result<Self, LocalExecutionError> {
        let url = url.into();
        let table = table.into();
        let dialect = SqlDialect::from_url(&url).ok_or_else(|| {
            LocalExecutionError::Query(format!(
                "unsupported database url '{}' (expected sqlite: or postgres://)",
                url
            ))
        })?;
        if table.trim().is_empty() {
            return Err(LocalExecutionError::Query("table name must not be empty".to_string()));
        }
        Ok(Self { url, table, dialect })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Open a connection pool for one request
    pub async fn open(&self) -> Result<SqlDataHandle, LocalExecutionError> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.url)
            .await
            .map_err(map_sqlx_error)?;

        debug!(table = %self.table, "Opened data handle");
        Ok(SqlDataHandle {
            pool,
            dialect: self.dialect,
            table: self.table.clone(),
        })
    }
}

/// Request-scoped SQL handle
///
/// Call [`SqlDataHandle::close`] when done; dropping the handle (for example
/// when the request is cancelled) also releases the pool.
pub struct SqlDataHandle {
    pool: AnyPool,
    dialect: SqlDialect,
    table: String,
}

impl SqlDataHandle {
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Build the scan statement and its bound text parameters
    pub fn build_select(&self, request: &ScanRequest) -> (String, Vec<String>) {
        build_select(self.dialect, &self.table, request)
    }
}

pub(crate) fn build_select(dialect: SqlDialect, table: &str, request: &ScanRequest) -> (String, Vec<String>) {
    let projection = request
        .columns
        .iter()
        .map(|c| format!("CAST({} AS TEXT)", dialect.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {} FROM {}", projection, dialect.quote_table(table));
    let mut binds = Vec::new();
    if let Some(ref filter) = request.filter {
        let mut builder = WhereBuilder {
            dialect,
            binds: &mut binds,
        };
        sql.push_str(" WHERE ");
        sql.push_str(&builder.predicate(filter));
    }
    (sql, binds)
}

struct WhereBuilder<'a> {
    dialect: SqlDialect,
    binds: &'a mut Vec<String>,
}

impl WhereBuilder<'_> {
    fn predicate(&mut self, predicate: &FilterPredicate) -> String {
        match predicate {
            FilterPredicate::Compare { column, op, value } => {
                let rhs = match value {
                    Literal::Text(text) => {
                        self.binds.push(text.clone());
                        self.dialect.placeholder(self.binds.len())
                    }
                    // Validated finite and in decimal range when the query was built.
                    numeric => numeric
                        .as_decimal()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "NULL".to_string()),
                };
                format!("{} {} {}", self.dialect.quote_ident(column), op.sql(), rhs)
            }
            FilterPredicate::IsNull { column } => {
                format!("{} IS NULL", self.dialect.quote_ident(column))
            }
            FilterPredicate::IsNotNull { column } => {
                format!("{} IS NOT NULL", self.dialect.quote_ident(column))
            }
            FilterPredicate::And(parts) => self.join(parts, " AND "),
            FilterPredicate::Or(parts) => self.join(parts, " OR "),
            FilterPredicate::Not(inner) => format!("NOT ({})", self.predicate(inner)),
        }
    }

    fn join(&mut self, parts: &[FilterPredicate], separator: &str) -> String {
        let rendered: Vec<String> = parts.iter().map(|p| format!("({})", self.predicate(p))).collect();
        rendered.join(separator)
    }
}

/// Classify a sqlx error
fn map_sqlx_error(err: sqlx::Error) -> LocalExecutionError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => LocalExecutionError::ConnectionLost(err.to_string()),
        sqlx::Error::Database(ref db) => {
            let message = db.message().to_string();
            // 42703: undefined_column (PostgreSQL)
            if db.code().as_deref() == Some("42703") || message.contains("no such column") {
                LocalExecutionError::ColumnNotFound(message)
            } else {
                LocalExecutionError::Query(message)
            }
        }
        other => LocalExecutionError::Query(other.to_string()),
    }
}

#[async_trait]
impl DataHandle for SqlDataHandle {
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<Vec<CellValue>>, LocalExecutionError> {
        let (sql, binds) = self.build_select(request);
        debug!(sql = %sql, binds = binds.len(), "Scanning table");

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                (0..request.columns.len())
                    .map(|i| {
                        let value: Option<String> = row.try_get(i).map_err(map_sqlx_error)?;
                        Ok(value.map(CellValue::Text).unwrap_or(CellValue::Null))
                    })
                    .collect::<Result<Vec<CellValue>, LocalExecutionError>>()
            })
            .collect()
    }
}
