//! Aggregate query definitions
//!
//! An [`AggregateQueryDefinition`] describes one statistic request: which
//! statistic to compute, over which column, with which filter and grouping.
//! Definitions are validated once, at construction, and are immutable
//! afterwards. Deserialization (from TOML config or from the wire) goes
//! through the same validating constructor, so a definition that exists is
//! always a valid one.
//!
//! # Example
//!
//! ```
//! use fedstat::query::{AggregateQueryDefinition, Statistic};
//!
//! let query = AggregateQueryDefinition::new(
//!     Statistic::Count,
//!     "visit_id",
//!     None,
//!     vec!["year".to_string()],
//! ).unwrap();
//! assert_eq!(query.target_column(), "visit_id");
//! ```

pub mod filter;

pub use filter::{CompareOp, FilterPredicate, Literal};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Query validation failure
///
/// Always a caller error, raised before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid query definition: {reason}")]
pub struct InvalidQueryDefinition {
    pub reason: String,
}

impl InvalidQueryDefinition {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Statistic kind without parameters
///
/// Carried by partial and global aggregates so the merge engine can detect
/// partials produced for a different statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Count,
    Sum,
    Mean,
    StdDev,
    Histogram,
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "COUNT"),
            Self::Sum => write!(f, "SUM"),
            Self::Mean => write!(f, "MEAN"),
            Self::StdDev => write!(f, "STD_DEV"),
            Self::Histogram => write!(f, "HISTOGRAM"),
        }
    }
}

/// Statistic with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statistic {
    Count,
    Sum,
    Mean,
    StdDev,
    Histogram {
        /// Strictly increasing bucket boundaries (at least two)
        boundaries: Vec<Decimal>,
    },
}

impl Statistic {
    pub fn kind(&self) -> StatisticKind {
        match self {
            Self::Count => StatisticKind::Count,
            Self::Sum => StatisticKind::Sum,
            Self::Mean => StatisticKind::Mean,
            Self::StdDev => StatisticKind::StdDev,
            Self::Histogram { .. } => StatisticKind::Histogram,
        }
    }

    /// Whether the target column must hold numeric values
    pub fn needs_numeric_values(&self) -> bool {
        !matches!(self, Self::Count)
    }
}

/// Validated aggregate query definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueryDefinitionRepr", into = "QueryDefinitionRepr")]
pub struct AggregateQueryDefinition {
    statistic: Statistic,
    target_column: String,
    filter: Option<FilterPredicate>,
    group_by_keys: Vec<String>,
}

impl AggregateQueryDefinition {
    /// Build and validate a query definition
    ///
    /// # Errors
    ///
    /// Returns [`InvalidQueryDefinition`] if the target column is empty, a
    /// grouping key is empty or repeated, the filter is malformed, or (for
    /// histograms) fewer than two boundaries are given or they are not
    /// strictly increasing.
    pub fn new(
        statistic: Statistic,
        target_column: impl Into<String>,
        filter: Option<FilterPredicate>,
        group_by_keys: Vec<String>,
    ) -> Result<Self, InvalidQueryDefinition> {
        let target_column = target_column.into();
        if target_column.trim().is_empty() {
            return Err(InvalidQueryDefinition::new("target_column must not be empty"));
        }

        for (i, key) in group_by_keys.iter().enumerate() {
            if key.trim().is_empty() {
                return Err(InvalidQueryDefinition::new(format!(
                    "group_by key {} must not be empty",
                    i
                )));
            }
            if group_by_keys[..i].contains(key) {
                return Err(InvalidQueryDefinition::new(format!(
                    "group_by key '{}' is listed more than once",
                    key
                )));
            }
        }

        if let Statistic::Histogram { ref boundaries } = statistic {
            validate_boundaries(boundaries)?;
        }

        if let Some(ref filter) = filter {
            filter.validate()?;
        }

        Ok(Self {
            statistic,
            target_column,
            filter,
            group_by_keys,
        })
    }

    pub fn statistic(&self) -> &Statistic {
        &self.statistic
    }

    pub fn statistic_kind(&self) -> StatisticKind {
        self.statistic.kind()
    }

    pub fn target_column(&self) -> &str {
        &self.target_column
    }

    pub fn filter(&self) -> Option<&FilterPredicate> {
        self.filter.as_ref()
    }

    pub fn group_by_keys(&self) -> &[String] {
        &self.group_by_keys
    }

    /// Histogram boundaries, if this is a histogram query
    pub fn histogram_boundaries(&self) -> Option<&[Decimal]> {
        match self.statistic {
            Statistic::Histogram { ref boundaries } => Some(boundaries),
            _ => None,
        }
    }

    /// Short human-readable label, e.g. `MEAN(age) BY sex`
    pub fn label(&self) -> String {
        if self.group_by_keys.is_empty() {
            format!("{}({})", self.statistic_kind(), self.target_column)
        } else {
            format!(
                "{}({}) BY {}",
                self.statistic_kind(),
                self.target_column,
                self.group_by_keys.join(", ")
            )
        }
    }
}

fn validate_boundaries(boundaries: &[Decimal]) -> Result<(), InvalidQueryDefinition> {
    if boundaries.len() < 2 {
        return Err(InvalidQueryDefinition::new(format!(
            "histogram needs at least 2 bucket boundaries, got {}",
            boundaries.len()
        )));
    }
    for pair in boundaries.windows(2) {
        if pair[0] >= pair[1] {
            return Err(InvalidQueryDefinition::new(format!(
                "histogram boundaries must be strictly increasing ({} >= {})",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Unvalidated serde shape of a query definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinitionRepr {
    pub statistic: Statistic,
    pub target_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterPredicate>,
    #[serde(default)]
    pub group_by: Vec<String>,
}

impl TryFrom<QueryDefinitionRepr> for AggregateQueryDefinition {
    type Error = InvalidQueryDefinition;

    fn try_from(repr: QueryDefinitionRepr) -> Result<Self, Self::Error> {
        Self::new(repr.statistic, repr.target_column, repr.filter, repr.group_by)
    }
}

impl From<AggregateQueryDefinition> for QueryDefinitionRepr {
    fn from(query: AggregateQueryDefinition) -> Self {
        Self {
            statistic: query.statistic,
            target_column: query.target_column,
            filter: query.filter,
            group_by: query.group_by_keys,
        }
    }
}

impl fmt::Display for AggregateQueryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
