//! In-memory data handle
//!
//! Holds a small table in memory and evaluates filters row by row. Used by the
//! in-process transport, by tests, and for local demos.
//!
//! Filters follow SQL three-valued logic: a comparison involving NULL is
//! *unknown*, `NOT unknown` is still unknown, and a row passes only when the
//! whole predicate is true. This keeps the memory handle and the SQL handle in
//! agreement on which rows a filter selects.
//!
//! # Example
//!
//! ```
//! use fedstat::engine::mock::MemoryTable;
//! use fedstat::engine::{DataHandle, ScanRequest};
//!
//! let table = MemoryTable::new(["visit_id", "year"])
//!     .with_row(vec![1.into(), "2020".into()])
//!     .with_row(vec![2.into(), "2021".into()]);
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let rows = rt.block_on(table.scan(&ScanRequest {
//!     columns: vec!["year".to_string()],
//!     filter: None,
//! })).unwrap();
//! assert_eq!(rows.len(), 2);
//! ```

use super::{CellValue, DataHandle, ScanRequest};
use crate::query::{FilterPredicate, Literal};
use crate::worker::LocalExecutionError;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::time::Duration;

/// In-memory table
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,

    /// Simulated scan latency
    delay: Option<Duration>,

    /// Error returned by every scan instead of rows
    failure: Option<LocalExecutionError>,
}

impl MemoryTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append a row (builder style)
    ///
    /// Short rows are padded with NULL, long rows truncated.
    pub fn with_row(mut self, row: Vec<CellValue>) -> Self {
        self.push_row(row);
        self
    }

    pub fn push_row(&mut self, mut row: Vec<CellValue>) {
        row.resize(self.columns.len(), CellValue::Null);
        self.rows.push(row);
    }

    /// Sleep this long before answering each scan
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every scan with `error`
    pub fn failing(mut self, error: LocalExecutionError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, column: &str) -> Result<usize, LocalExecutionError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| LocalExecutionError::ColumnNotFound(column.to_string()))
    }

    /// Evaluate a predicate against one row; `None` is SQL unknown
    fn eval(&self, predicate: &FilterPredicate, row: &[CellValue]) -> Result<Option<bool>, LocalExecutionError> {
        Ok(match predicate {
            FilterPredicate::Compare { column, op, value } => {
                let cell = &row[self.column_index(column)?];
                compare(cell, value).map(|ordering| op.matches(ordering))
            }
            FilterPredicate::IsNull { column } => Some(row[self.column_index(column)?].is_null()),
            FilterPredicate::IsNotNull { column } => Some(!row[self.column_index(column)?].is_null()),
            FilterPredicate::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match self.eval(part, row)? {
                        Some(false) => return Ok(Some(false)),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            FilterPredicate::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match self.eval(part, row)? {
                        Some(true) => return Ok(Some(true)),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            FilterPredicate::Not(inner) => self.eval(inner, row)?.map(|b| !b),
        })
    }
}

/// Order a cell relative to a literal; `None` when not comparable
///
/// Numbers compare numerically, text lexically. Text cells holding numbers
/// compare numerically against numeric literals.
fn compare(cell: &CellValue, literal: &Literal) -> Option<Ordering> {
    match (cell, literal) {
        (CellValue::Null, _) => None,
        (CellValue::Text(s), Literal::Text(t)) => Some(s.as_str().cmp(t.as_str())),
        (cell, literal) => {
            let left = cell.as_decimal()?;
            let right = match literal {
                Literal::Text(t) => super::parse_decimal(t)?,
                other => other.as_decimal()?,
            };
            Some(left.cmp(&right))
        }
    }
}

#[async_trait]
impl DataHandle for MemoryTable {
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<Vec<CellValue>>, LocalExecutionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref error) = self.failure {
            return Err(error.clone());
        }

        let indices = request
            .columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for row in &self.rows {
            if let Some(ref filter) = request.filter {
                if self.eval(filter, row)? != Some(true) {
                    continue;
                }
            }
            out.push(indices.iter().map(|&i| row[i].clone()).collect());
        }
        Ok(out)
    }
}
