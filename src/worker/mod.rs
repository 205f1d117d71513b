//! Local aggregator
//!
//! Runs at a participant site. Given a validated query definition and a data
//! handle it produces a [`PartialAggregate`]: per-group moments, never rows.
//!
//! # Semantics
//!
//! - The filter is applied before grouping (by the data handle)
//! - Every row that passes the filter creates its group, even when its
//!   target value is NULL; such a group simply has a zero count
//! - NULL target values are skipped for every statistic (SQL `COUNT(col)`)
//! - An ungrouped query always yields exactly one group, the empty key
//! - Numeric sums use exact decimal arithmetic; overflow is an error
//!
//! # Example
//!
//! ```
//! use fedstat::engine::mock::MemoryTable;
//! use fedstat::query::{AggregateQueryDefinition, Statistic};
//! use fedstat::stats::GroupKey;
//! use fedstat::worker::LocalAggregator;
//!
//! let table = MemoryTable::new(["visit_id", "year"])
//!     .with_row(vec![1.into(), "2020".into()])
//!     .with_row(vec![2.into(), "2020".into()]);
//! let query = AggregateQueryDefinition::new(
//!     Statistic::Count, "visit_id", None, vec!["year".to_string()],
//! ).unwrap();
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let partial = rt.block_on(LocalAggregator::new("site-a").compute(&query, &table)).unwrap();
//! assert_eq!(partial.groups[&GroupKey::from_values(["2020"])].count, 2);
//! ```

use crate::engine::sql::DataSource;
use crate::engine::{CellValue, DataHandle, ScanRequest};
use crate::query::{AggregateQueryDefinition, Statistic};
use crate::stats::histogram;
use crate::stats::{ArithmeticOverflow, GroupKey, PartialAggregate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure of the local computation at one participant
///
/// Reported to the coordinator as a participant failure; never retried here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalExecutionError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("numeric overflow in group '{group}'")]
    Overflow { group: String },

    #[error("query failed: {0}")]
    Query(String),
}

/// Fieldless classification of a [`LocalExecutionError`], as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalErrorKind {
    SchemaMismatch,
    ColumnNotFound,
    ConnectionLost,
    Overflow,
    Query,
}

impl fmt::Display for LocalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SchemaMismatch => "schema_mismatch",
            Self::ColumnNotFound => "column_not_found",
            Self::ConnectionLost => "connection_lost",
            Self::Overflow => "overflow",
            Self::Query => "query",
        };
        write!(f, "{}", s)
    }
}

impl LocalExecutionError {
    pub fn kind(&self) -> LocalErrorKind {
        match self {
            Self::SchemaMismatch(_) => LocalErrorKind::SchemaMismatch,
            Self::ColumnNotFound(_) => LocalErrorKind::ColumnNotFound,
            Self::ConnectionLost(_) => LocalErrorKind::ConnectionLost,
            Self::Overflow { .. } => LocalErrorKind::Overflow,
            Self::Query(_) => LocalErrorKind::Query,
        }
    }
}

/// A participant's local data
#[derive(Clone)]
pub enum LocalSite {
    /// Long-lived handle, e.g. an in-memory table
    Handle(Arc<dyn DataHandle>),

    /// Database opened for each request and closed right after
    Source(DataSource),
}

impl fmt::Debug for LocalSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(_) => write!(f, "LocalSite::Handle"),
            Self::Source(source) => write!(f, "LocalSite::Source({})", source.table()),
        }
    }
}

/// Computes partial aggregates for one participant
#[derive(Debug, Clone)]
pub struct LocalAggregator {
    participant_id: String,
}

impl LocalAggregator {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Compute this participant's partial aggregate
    ///
    /// Read-only: the handle is only ever scanned.
    ///
    /// # Errors
    ///
    /// Any [`LocalExecutionError`] from the handle, plus
    /// [`LocalExecutionError::SchemaMismatch`] when a numeric statistic meets
    /// a non-numeric target value and [`LocalExecutionError::Overflow`] when a
    /// group's sums leave the decimal range.
    pub async fn compute(
        &self,
        query: &AggregateQueryDefinition,
        handle: &dyn DataHandle,
    ) -> Result<PartialAggregate, LocalExecutionError> {
        let mut columns = Vec::with_capacity(1 + query.group_by_keys().len());
        columns.push(query.target_column().to_string());
        columns.extend(query.group_by_keys().iter().cloned());

        let rows = handle
            .scan(&ScanRequest {
                columns,
                filter: query.filter().cloned(),
            })
            .await?;

        debug!(
            participant_id = %self.participant_id,
            query = %query,
            rows = rows.len(),
            "Scanned local rows"
        );

        let bucket_count = query
            .histogram_boundaries()
            .map(histogram::bucket_count)
            .unwrap_or(0);

        let mut partial = PartialAggregate::new(self.participant_id.clone(), query.statistic_kind());
        if query.group_by_keys().is_empty() {
            partial.group_mut(GroupKey::all(), bucket_count);
        }

        for row in &rows {
            let Some((target, key_cells)) = row.split_first() else {
                return Err(LocalExecutionError::Query(
                    "data handle returned an empty row".to_string(),
                ));
            };
            let key = GroupKey(key_cells.iter().map(CellValue::as_group_value).collect());
            self.accumulate(&mut partial, query, key, target, bucket_count)?;
        }

        Ok(partial)
    }

    /// Compute against a site, scoping any database handle to this call
    ///
    /// For [`LocalSite::Source`] the pool is opened here and closed before
    /// returning, on success and on error alike. If the future is dropped
    /// mid-scan the pool is dropped with it.
    pub async fn compute_at(
        &self,
        query: &AggregateQueryDefinition,
        site: &LocalSite,
    ) -> Result<PartialAggregate, LocalExecutionError> {
        match site {
            LocalSite::Handle(handle) => self.compute(query, handle.as_ref()).await,
            LocalSite::Source(source) => {
                let handle = source.open().await?;
                let result = self.compute(query, &handle).await;
                handle.close().await;
                result
            }
        }
    }

    fn accumulate(
        &self,
        partial: &mut PartialAggregate,
        query: &AggregateQueryDefinition,
        key: GroupKey,
        target: &CellValue,
        bucket_count: usize,
    ) -> Result<(), LocalExecutionError> {
        let overflow = |key: &GroupKey| LocalExecutionError::Overflow {
            group: key.to_string(),
        };

        if target.is_null() {
            partial.group_mut(key, bucket_count);
            return Ok(());
        }

        if !query.statistic().needs_numeric_values() {
            return partial
                .group_mut(key.clone(), bucket_count)
                .record_presence()
                .map_err(|ArithmeticOverflow| overflow(&key));
        }

        let value = target.as_decimal().ok_or_else(|| {
            LocalExecutionError::SchemaMismatch(format!(
                "column '{}' holds non-numeric value '{}'",
                query.target_column(),
                target
            ))
        })?;

        let stats = partial.group_mut(key.clone(), bucket_count);
        match query.statistic() {
            Statistic::StdDev => stats.record_value(value, true),
            Statistic::Histogram { boundaries } => {
                stats.record_bucket(histogram::bucket_index(boundaries, value));
                stats.record_presence()
            }
            _ => stats.record_value(value, false),
        }
        .map_err(|ArithmeticOverflow| overflow(&key))
    }
}
