//! Row filter predicates
//!
//! A closed expression tree applied before grouping. The SQL data handle
//! pushes it down into a `WHERE` clause; the in-memory handle evaluates it
//! row by row.

use super::InvalidQueryDefinition;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Apply the operator to an ordering of `left` relative to `right`
    pub fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Le => ordering != Greater,
            Self::Gt => ordering == Greater,
            Self::Ge => ordering != Less,
        }
    }
}

/// Literal operand of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Text(String),
}

// Float literals are checked finite during validation.
impl Eq for Literal {}

impl Literal {
    /// Numeric value of the literal, `None` for text
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Integer(i) => Some(Decimal::from(*i)),
            Self::Float(f) => Decimal::try_from(*f).ok(),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "'{}'", s),
        }
    }
}

/// Filter expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPredicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    IsNull {
        column: String,
    },
    IsNotNull {
        column: String,
    },
    And(Vec<FilterPredicate>),
    Or(Vec<FilterPredicate>),
    Not(Box<FilterPredicate>),
}

impl FilterPredicate {
    /// Structural validation, run once when the query is built
    pub fn validate(&self) -> Result<(), InvalidQueryDefinition> {
        match self {
            Self::Compare { column, value, .. } => {
                check_column(column)?;
                if let Literal::Float(f) = value {
                    if !f.is_finite() {
                        return Err(InvalidQueryDefinition::new(format!(
                            "filter on '{}' compares against a non-finite number",
                            column
                        )));
                    }
                    if Decimal::try_from(*f).is_err() {
                        return Err(InvalidQueryDefinition::new(format!(
                            "filter on '{}' uses a number out of range: {}",
                            column, f
                        )));
                    }
                }
                Ok(())
            }
            Self::IsNull { column } | Self::IsNotNull { column } => check_column(column),
            Self::And(parts) | Self::Or(parts) => {
                if parts.is_empty() {
                    return Err(InvalidQueryDefinition::new(
                        "filter and/or groups must not be empty",
                    ));
                }
                parts.iter().try_for_each(|p| p.validate())
            }
            Self::Not(inner) => inner.validate(),
        }
    }

    /// All columns referenced by the predicate, in first-seen order
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { column, .. } | Self::IsNull { column } | Self::IsNotNull { column } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            Self::And(parts) | Self::Or(parts) => {
                for part in parts {
                    part.collect_columns(out);
                }
            }
            Self::Not(inner) => inner.collect_columns(out),
        }
    }
}

fn check_column(column: &str) -> Result<(), InvalidQueryDefinition> {
    if column.trim().is_empty() {
        Err(InvalidQueryDefinition::new("filter column must not be empty"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_matches() {
        use std::cmp::Ordering::*;
        assert!(CompareOp::Ge.matches(Equal));
        assert!(CompareOp::Ge.matches(Greater));
        assert!(!CompareOp::Lt.matches(Equal));
        assert!(CompareOp::Ne.matches(Less));
    }

    #[test]
    fn test_empty_group_rejected() {
        let filter = FilterPredicate::And(vec![]);
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_non_finite_literal_rejected() {
        let filter = FilterPredicate::Compare {
            column: "bmi".to_string(),
            op: CompareOp::Gt,
            value: Literal::Float(f64::NAN),
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_columns_deduplicated() {
        let filter = FilterPredicate::Or(vec![
            FilterPredicate::IsNull { column: "age".to_string() },
            FilterPredicate::Not(Box::new(FilterPredicate::Compare {
                column: "age".to_string(),
                op: CompareOp::Lt,
                value: Literal::Integer(18),
            })),
            FilterPredicate::IsNotNull { column: "sex".to_string() },
        ]);
        assert_eq!(filter.columns(), vec!["age", "sex"]);
    }

    #[test]
    fn test_toml_shape() {
        #[derive(Deserialize)]
        struct Wrapper {
            filter: FilterPredicate,
        }

        let parsed: Wrapper = ::toml::from_str(
            r#"
            [filter]
            and = [
                { compare = { column = "age", op = "ge", value = 18 } },
                { compare = { column = "sex", op = "eq", value = "female" } },
            ]
            "#,
        )
        .unwrap();

        match parsed.filter {
            FilterPredicate::And(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(
                    parts[0],
                    FilterPredicate::Compare {
                        column: "age".to_string(),
                        op: CompareOp::Ge,
                        value: Literal::Integer(18),
                    }
                );
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }
}
