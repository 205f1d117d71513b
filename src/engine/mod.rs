//! Data handle abstraction
//!
//! A data handle is the participant's read-only view of its local table. The
//! local aggregator only ever asks it for one thing: the values of a few
//! columns for every row that passes the query's filter.
//!
//! # Handle Types
//!
//! - **SQL** ([`sql::SqlDataHandle`]): SQLite or PostgreSQL through sqlx; the
//!   filter is pushed down into a `WHERE` clause
//! - **Memory** ([`mock::MemoryTable`]): rows held in memory; the filter is
//!   evaluated in Rust with SQL three-valued logic
//!
//! Handles are scoped to a single request. The participant service opens one
//! before running the local aggregator and closes it right after.

pub mod mock;
pub mod sql;

use crate::query::FilterPredicate;
use crate::worker::LocalExecutionError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// One cell of a scanned row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Null,
    Number(Decimal),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Value as used in a group key (`None` for NULL)
    ///
    /// Numbers, and text that parses as a number, are rendered in canonical
    /// form, so `2020`, `2020.0` and `2.02e3` all land in the same group no
    /// matter which column type a site stores them in.
    pub fn as_group_value(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Number(d) => Some(canonical_number(*d)),
            Self::Text(s) => Some(parse_decimal(s).map(canonical_number).unwrap_or_else(|| s.clone())),
        }
    }

    /// Numeric value of the cell
    ///
    /// Text cells are parsed, since the SQL handle returns every column as
    /// text. `None` for NULL and for text that is not a number.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Null => None,
            Self::Number(d) => Some(*d),
            Self::Text(s) => parse_decimal(s),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Number(d) => write!(f, "{}", d),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        Self::Number(Decimal::from(v))
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        Self::Number(Decimal::from(v))
    }
}

impl From<Decimal> for CellValue {
    fn from(v: Decimal) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

fn canonical_number(d: Decimal) -> String {
    d.normalize().to_string()
}

/// Parse a decimal as rendered by a database (`42`, `-1.50`, `1.5e+20`)
pub fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Column projection plus row filter
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub columns: Vec<String>,
    pub filter: Option<FilterPredicate>,
}

/// Read-only access to a participant's local table
///
/// Dropping the future returned by [`DataHandle::scan`] cancels the scan.
#[async_trait]
pub trait DataHandle: Send + Sync {
    /// Return `request.columns` for every row matching `request.filter`
    ///
    /// Each returned row has exactly `request.columns.len()` cells, in
    /// request order.
    ///
    /// # Errors
    ///
    /// - [`LocalExecutionError::ColumnNotFound`] if a column does not exist
    /// - [`LocalExecutionError::ConnectionLost`] if the backend went away
    /// - [`LocalExecutionError::Query`] for any other backend failure
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<Vec<CellValue>>, LocalExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_forms() {
        assert_eq!(parse_decimal("42"), Some(Decimal::from(42)));
        assert_eq!(parse_decimal(" -1.50 "), Some(Decimal::new(-150, 2)));
        assert_eq!(parse_decimal("1.5e3"), Some(Decimal::from(1500)));
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal(""), None);
    }

    #[test]
    fn test_group_value_normalizes_numbers() {
        assert_eq!(CellValue::Number(Decimal::new(20200, 1)).as_group_value(), Some("2020".to_string()));
        assert_eq!(CellValue::from("male").as_group_value(), Some("male".to_string()));
        assert_eq!(CellValue::Null.as_group_value(), None);
    }

    #[test]
    fn test_group_value_canonicalizes_numeric_text() {
        // INTEGER, REAL and NUMERIC columns rendered as text by the SQL handle
        assert_eq!(CellValue::from("2020").as_group_value(), Some("2020".to_string()));
        assert_eq!(CellValue::from("2020.0").as_group_value(), Some("2020".to_string()));
        assert_eq!(CellValue::from("2020.00").as_group_value(), Some("2020".to_string()));
        assert_eq!(CellValue::from("2.02e3").as_group_value(), Some("2020".to_string()));
        assert_eq!(
            CellValue::from("2020.0").as_group_value(),
            CellValue::from(2020i64).as_group_value()
        );
        assert_eq!(CellValue::from("2020-01").as_group_value(), Some("2020-01".to_string()));
    }

    #[test]
    fn test_as_decimal() {
        assert_eq!(CellValue::from("12.5").as_decimal(), Some(Decimal::new(125, 1)));
        assert_eq!(CellValue::Null.as_decimal(), None);
        assert_eq!(CellValue::from("n/a").as_decimal(), None);
    }
}
