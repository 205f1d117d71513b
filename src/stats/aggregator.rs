//! Merge engine
//!
//! Combines the partial aggregates of one round into a single global
//! aggregate. The merge is commutative and associative in the partials:
//!
//! - partials are keyed by participant id in a `BTreeMap`, so insertion order
//!   never reaches the result
//! - all sums are exact decimal (or integer) additions
//! - divisions (MEAN, STD_DEV) happen once, after every partial is summed
//!
//! which is what the round coordinator relies on, since it collects results
//! in whatever order participants answer.
//!
//! # Example
//!
//! ```
//! use fedstat::stats::{GroupKey, GlobalValue, PartialAggregate};
//! use fedstat::stats::aggregator::merge;
//! use fedstat::query::StatisticKind;
//!
//! let mut a = PartialAggregate::new("a", StatisticKind::Count);
//! a.group_mut(GroupKey::from_values(["2020"]), 0).count = 10;
//! let mut b = PartialAggregate::new("b", StatisticKind::Count);
//! b.group_mut(GroupKey::from_values(["2020"]), 0).count = 7;
//!
//! let global = merge(StatisticKind::Count, vec![a, b]).unwrap();
//! assert_eq!(global.value(&GroupKey::from_values(["2020"])), Some(&GlobalValue::Count(17)));
//! ```

use super::histogram::bucket_count;
use super::{ArithmeticOverflow, GlobalAggregate, GlobalValue, GroupKey, GroupStats, PartialAggregate};
use crate::query::{AggregateQueryDefinition, StatisticKind};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

/// Protocol-invariant violation while merging
///
/// Always fatal for the round: it means a bug or participants answering a
/// different query than the one dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeConflictError {
    #[error("participant '{participant_id}' returned a {found} partial for a {expected} round")]
    StatisticMismatch {
        participant_id: String,
        expected: StatisticKind,
        found: StatisticKind,
    },

    #[error("participant '{participant_id}' reports {found} histogram buckets for group '{group}', expected {expected}")]
    BucketLayoutMismatch {
        participant_id: String,
        group: String,
        expected: usize,
        found: usize,
    },

    #[error("participant '{0}' contributed more than one partial aggregate")]
    DuplicateParticipant(String),

    #[error("numeric overflow merging group '{group}'")]
    Overflow { group: String },
}

/// Merge the partials of one round
///
/// # Errors
///
/// Returns [`MergeConflictError`] if any partial was computed for a different
/// statistic, histogram layouts disagree, a participant appears twice, or a
/// sum overflows.
pub fn merge(
    statistic_kind: StatisticKind,
    partials: impl IntoIterator<Item = PartialAggregate>,
) -> Result<GlobalAggregate, MergeConflictError> {
    let mut aggregator = StatisticsAggregator::new(statistic_kind);
    for partial in partials {
        aggregator.add_partial(partial)?;
    }
    aggregator.aggregate()
}

/// Merge the partials of one round of `query`
///
/// Like [`merge`], but histogram partials must also match the bucket layout
/// of the query's boundaries.
pub fn merge_for_query(
    query: &AggregateQueryDefinition,
    partials: impl IntoIterator<Item = PartialAggregate>,
) -> Result<GlobalAggregate, MergeConflictError> {
    let mut aggregator = StatisticsAggregator::for_query(query);
    for partial in partials {
        aggregator.add_partial(partial)?;
    }
    aggregator.aggregate()
}

/// Collects the partials of one round and merges them on demand
#[derive(Debug)]
pub struct StatisticsAggregator {
    statistic_kind: StatisticKind,

    /// Partials by participant id
    partials: BTreeMap<String, PartialAggregate>,

    /// Histogram bucket count, fixed by the query or else by the first
    /// non-empty bucket vector seen
    bucket_count: Option<usize>,
}

impl StatisticsAggregator {
    pub fn new(statistic_kind: StatisticKind) -> Self {
        Self {
            statistic_kind,
            partials: BTreeMap::new(),
            bucket_count: None,
        }
    }

    /// Aggregator for `query`, with the histogram layout fixed up front
    pub fn for_query(query: &AggregateQueryDefinition) -> Self {
        Self {
            statistic_kind: query.statistic_kind(),
            partials: BTreeMap::new(),
            bucket_count: query.histogram_boundaries().map(bucket_count),
        }
    }

    /// Add one participant's partial
    ///
    /// The partial is checked against the round's statistic and histogram
    /// layout on arrival, so a conflict is reported no matter which partial
    /// arrived first.
    pub fn add_partial(&mut self, partial: PartialAggregate) -> Result<(), MergeConflictError> {
        if partial.statistic_kind != self.statistic_kind {
            return Err(MergeConflictError::StatisticMismatch {
                participant_id: partial.participant_id,
                expected: self.statistic_kind,
                found: partial.statistic_kind,
            });
        }
        if self.partials.contains_key(&partial.participant_id) {
            return Err(MergeConflictError::DuplicateParticipant(partial.participant_id));
        }

        if self.statistic_kind == StatisticKind::Histogram {
            for (key, stats) in &partial.groups {
                if stats.buckets.is_empty() {
                    if stats.is_zero_weight() {
                        continue;
                    }
                    return Err(MergeConflictError::BucketLayoutMismatch {
                        participant_id: partial.participant_id.clone(),
                        group: key.to_string(),
                        expected: self.bucket_count.unwrap_or(0),
                        found: 0,
                    });
                }
                match self.bucket_count {
                    None => self.bucket_count = Some(stats.buckets.len()),
                    Some(expected) if expected != stats.buckets.len() => {
                        return Err(MergeConflictError::BucketLayoutMismatch {
                            participant_id: partial.participant_id.clone(),
                            group: key.to_string(),
                            expected,
                            found: stats.buckets.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        self.partials.insert(partial.participant_id.clone(), partial);
        Ok(())
    }

    pub fn num_participants(&self) -> usize {
        self.partials.len()
    }

    /// Sorted participant ids
    pub fn participant_ids(&self) -> Vec<String> {
        self.partials.keys().cloned().collect()
    }

    /// Merge everything added so far
    pub fn aggregate(&self) -> Result<GlobalAggregate, MergeConflictError> {
        let mut totals: BTreeMap<GroupKey, GroupStats> = BTreeMap::new();

        for partial in self.partials.values() {
            for (key, stats) in &partial.groups {
                let total = totals
                    .entry(key.clone())
                    .or_insert_with(|| GroupStats::new(self.bucket_count.unwrap_or(0)));
                total
                    .merge(stats)
                    .map_err(|ArithmeticOverflow| MergeConflictError::Overflow {
                        group: key.to_string(),
                    })?;
            }
        }

        let groups = totals
            .into_iter()
            .map(|(key, total)| {
                let value = finalize(self.statistic_kind, &total).map_err(|ArithmeticOverflow| {
                    MergeConflictError::Overflow { group: key.to_string() }
                })?;
                Ok((key, value))
            })
            .collect::<Result<BTreeMap<_, _>, MergeConflictError>>()?;

        Ok(GlobalAggregate {
            statistic_kind: self.statistic_kind,
            groups,
            contributing_participant_count: self.partials.len(),
            contributing_participant_ids: self.participant_ids(),
            excluded_participant_ids: Vec::new(),
            exclusion_reasons: BTreeMap::new(),
        })
    }
}

/// Turn summed moments into the statistic's final value
fn finalize(kind: StatisticKind, total: &GroupStats) -> Result<GlobalValue, ArithmeticOverflow> {
    Ok(match kind {
        StatisticKind::Count => GlobalValue::Count(total.count),
        StatisticKind::Sum => GlobalValue::Sum(total.sum),
        StatisticKind::Mean => GlobalValue::Mean(weighted_mean(total)),
        StatisticKind::StdDev => GlobalValue::StdDev(sample_std_dev(total)?),
        StatisticKind::Histogram => GlobalValue::Histogram(total.buckets.clone()),
    })
}

/// Σsum / Σcount, `None` for a group nobody had values for
fn weighted_mean(total: &GroupStats) -> Option<Decimal> {
    if total.count == 0 {
        return None;
    }
    total.sum.checked_div(Decimal::from(total.count))
}

/// Sample standard deviation from (n, Σx, Σx²)
///
/// Uses `(n·Σx² − (Σx)²) / (n·(n − 1))`, exact in decimal until the final
/// square root. A negative variance from rounding is clamped to zero.
fn sample_std_dev(total: &GroupStats) -> Result<Option<f64>, ArithmeticOverflow> {
    if total.count <= 1 {
        return Ok(None);
    }
    let n = Decimal::from(total.count);

    let exact = n
        .checked_mul(total.sum_of_squares)
        .and_then(|a| total.sum.checked_mul(total.sum).and_then(|b| a.checked_sub(b)))
        .and_then(|numerator| {
            n.checked_mul(n - Decimal::ONE)
                .and_then(|denominator| numerator.checked_div(denominator))
        });

    let variance = match exact {
        Some(v) => v.to_f64().ok_or(ArithmeticOverflow)?,
        None => {
            // Fall back to floating point when the exact terms do not fit.
            let n = total.count as f64;
            let sum = total.sum.to_f64().ok_or(ArithmeticOverflow)?;
            let sum_sq = total.sum_of_squares.to_f64().ok_or(ArithmeticOverflow)?;
            let mean = sum / n;
            (sum_sq - n * mean * mean) / (n - 1.0)
        }
    };

    Ok(Some(variance.max(0.0).sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: &str) -> GroupKey {
        GroupKey::from_values([v])
    }

    fn counts(id: &str, groups: &[(&str, u64)]) -> PartialAggregate {
        let mut partial = PartialAggregate::new(id, StatisticKind::Count);
        for (k, c) in groups {
            partial.group_mut(key(k), 0).count = *c;
        }
        partial
    }

    fn moments(id: &str, kind: StatisticKind, groups: Vec<(&str, Vec<i64>)>) -> PartialAggregate {
        let mut partial = PartialAggregate::new(id, kind);
        for (k, values) in groups {
            let stats = partial.group_mut(key(k), 0);
            for v in values {
                stats.record_value(Decimal::from(v), true).unwrap();
            }
        }
        partial
    }

    /// Every permutation of `items`
    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_count_scenario_two_sites() {
        let a = counts("A", &[("2020", 10), ("2021", 5)]);
        let b = counts("B", &[("2020", 7)]);

        let global = merge(StatisticKind::Count, vec![a, b]).unwrap();
        assert_eq!(global.value(&key("2020")), Some(&GlobalValue::Count(17)));
        assert_eq!(global.value(&key("2021")), Some(&GlobalValue::Count(5)));
        assert_eq!(global.contributing_participant_count, 2);
        assert_eq!(global.contributing_participant_ids, vec!["A", "B"]);
    }

    #[test]
    fn test_sum_equals_arithmetic_sum() {
        let a = moments("a", StatisticKind::Sum, vec![("x", vec![1, 2, 3]), ("y", vec![10])]);
        let b = moments("b", StatisticKind::Sum, vec![("x", vec![4]), ("z", vec![-5])]);
        let c = moments("c", StatisticKind::Sum, vec![("y", vec![7, 8])]);

        let global = merge(StatisticKind::Sum, vec![a, b, c]).unwrap();
        assert_eq!(global.value(&key("x")), Some(&GlobalValue::Sum(Decimal::from(10))));
        assert_eq!(global.value(&key("y")), Some(&GlobalValue::Sum(Decimal::from(25))));
        assert_eq!(global.value(&key("z")), Some(&GlobalValue::Sum(Decimal::from(-5))));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let partials = vec![
            moments("a", StatisticKind::Mean, vec![("m", vec![30, 40]), ("f", vec![50])]),
            moments("b", StatisticKind::Mean, vec![("m", vec![20])]),
            moments("c", StatisticKind::Mean, vec![("f", vec![61, 62, 63]), ("x", vec![])]),
            moments("d", StatisticKind::Mean, vec![("m", vec![1]), ("f", vec![2])]),
        ];

        let reference = merge(StatisticKind::Mean, partials.clone()).unwrap();
        let reference_json = serde_json::to_string(&reference).unwrap();

        for order in permutations(&partials) {
            let global = merge(StatisticKind::Mean, order).unwrap();
            assert_eq!(global, reference);
            assert_eq!(serde_json::to_string(&global).unwrap(), reference_json);
        }
    }

    #[test]
    fn test_mean_is_weighted_not_average_of_averages() {
        // Site a: mean 10 over 1 value; site b: mean 40 over 3 values
        let a = moments("a", StatisticKind::Mean, vec![("g", vec![10])]);
        let b = moments("b", StatisticKind::Mean, vec![("g", vec![40, 40, 40])]);

        let global = merge(StatisticKind::Mean, vec![a, b]).unwrap();
        let expected = Decimal::new(325, 1); // 130 / 4
        assert_eq!(global.value(&key("g")), Some(&GlobalValue::Mean(Some(expected))));
    }

    #[test]
    fn test_mean_zero_weight_site() {
        let mut a = PartialAggregate::new("A", StatisticKind::Mean);
        let male = a.group_mut(key("male"), 0);
        male.count = 4;
        male.sum = Decimal::from(200);

        let mut b = PartialAggregate::new("B", StatisticKind::Mean);
        b.group_mut(key("male"), 0);

        let global = merge(StatisticKind::Mean, vec![a, b]).unwrap();
        assert_eq!(
            global.value(&key("male")),
            Some(&GlobalValue::Mean(Some(Decimal::from(50))))
        );
    }

    #[test]
    fn test_mean_total_zero_count_is_null() {
        let mut a = PartialAggregate::new("A", StatisticKind::Mean);
        a.group_mut(key("empty"), 0);
        let b = PartialAggregate::new("B", StatisticKind::Mean);

        let global = merge(StatisticKind::Mean, vec![a, b]).unwrap();
        assert_eq!(global.value(&key("empty")), Some(&GlobalValue::Mean(None)));
    }

    #[test]
    fn test_std_dev() {
        // 2, 4, 4, 4, 5, 5, 7, 9 -> sample variance 32/7
        let a = moments("a", StatisticKind::StdDev, vec![("g", vec![2, 4, 4, 4])]);
        let b = moments("b", StatisticKind::StdDev, vec![("g", vec![5, 5, 7, 9])]);

        let global = merge(StatisticKind::StdDev, vec![a, b]).unwrap();
        match global.value(&key("g")) {
            Some(GlobalValue::StdDev(Some(s))) => {
                assert!((s - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_std_dev_single_value_is_null() {
        let a = moments("a", StatisticKind::StdDev, vec![("g", vec![5])]);
        let global = merge(StatisticKind::StdDev, vec![a]).unwrap();
        assert_eq!(global.value(&key("g")), Some(&GlobalValue::StdDev(None)));
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = PartialAggregate::new("a", StatisticKind::Histogram);
        a.group_mut(key("g"), 3).buckets = vec![1, 2, 3];
        a.groups.get_mut(&key("g")).unwrap().count = 6;

        let mut b = PartialAggregate::new("b", StatisticKind::Histogram);
        b.group_mut(key("g"), 3).buckets = vec![0, 5, 1];
        b.groups.get_mut(&key("g")).unwrap().count = 6;

        let global = merge(StatisticKind::Histogram, vec![a, b]).unwrap();
        assert_eq!(global.value(&key("g")), Some(&GlobalValue::Histogram(vec![1, 7, 4])));
    }

    #[test]
    fn test_histogram_layout_conflict() {
        let mut a = PartialAggregate::new("a", StatisticKind::Histogram);
        a.group_mut(key("g"), 3).count = 1;
        let mut b = PartialAggregate::new("b", StatisticKind::Histogram);
        b.group_mut(key("g"), 4).count = 1;

        let err = merge(StatisticKind::Histogram, vec![a, b]).unwrap_err();
        assert!(matches!(err, MergeConflictError::BucketLayoutMismatch { .. }));
    }

    #[test]
    fn test_statistic_mismatch_is_fatal() {
        let a = counts("a", &[("x", 1)]);
        let b = moments("b", StatisticKind::Sum, vec![("x", vec![1])]);

        let err = merge(StatisticKind::Count, vec![a, b]).unwrap_err();
        assert_eq!(
            err,
            MergeConflictError::StatisticMismatch {
                participant_id: "b".to_string(),
                expected: StatisticKind::Count,
                found: StatisticKind::Sum,
            }
        );
    }

    #[test]
    fn test_duplicate_participant_rejected() {
        let err = merge(
            StatisticKind::Count,
            vec![counts("a", &[("x", 1)]), counts("a", &[("x", 2)])],
        )
        .unwrap_err();
        assert_eq!(err, MergeConflictError::DuplicateParticipant("a".to_string()));
    }

    #[test]
    fn test_sum_overflow_is_reported() {
        let mut a = PartialAggregate::new("a", StatisticKind::Sum);
        a.group_mut(key("g"), 0).sum = Decimal::MAX;
        let mut b = PartialAggregate::new("b", StatisticKind::Sum);
        b.group_mut(key("g"), 0).sum = Decimal::MAX;

        let err = merge(StatisticKind::Sum, vec![a, b]).unwrap_err();
        assert!(matches!(err, MergeConflictError::Overflow { .. }));
    }

    #[test]
    fn test_empty_merge() {
        let global = merge(StatisticKind::Count, Vec::new()).unwrap();
        assert!(global.groups.is_empty());
        assert_eq!(global.contributing_participant_count, 0);
    }

    fn histogram_query(boundaries: &[i64]) -> AggregateQueryDefinition {
        AggregateQueryDefinition::new(
            crate::query::Statistic::Histogram {
                boundaries: boundaries.iter().map(|b| Decimal::from(*b)).collect(),
            },
            "age",
            None,
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_histogram_layout_checked_against_query() {
        // Two boundaries mean three buckets; a lone partial with four is rejected
        let mut a = PartialAggregate::new("a", StatisticKind::Histogram);
        a.group_mut(key("g"), 4).count = 1;

        let err = merge_for_query(&histogram_query(&[18, 65]), vec![a]).unwrap_err();
        assert_eq!(
            err,
            MergeConflictError::BucketLayoutMismatch {
                participant_id: "a".to_string(),
                group: key("g").to_string(),
                expected: 3,
                found: 4,
            }
        );
    }

    #[test]
    fn test_histogram_matching_query_layout() {
        let mut a = PartialAggregate::new("a", StatisticKind::Histogram);
        a.group_mut(key("g"), 3).buckets = vec![2, 0, 1];
        a.groups.get_mut(&key("g")).unwrap().count = 3;
        let mut b = PartialAggregate::new("b", StatisticKind::Histogram);
        b.group_mut(key("g"), 3).buckets = vec![0, 4, 0];
        b.groups.get_mut(&key("g")).unwrap().count = 4;

        let global = merge_for_query(&histogram_query(&[18, 65]), vec![a, b]).unwrap();
        assert_eq!(global.value(&key("g")), Some(&GlobalValue::Histogram(vec![2, 4, 1])));
    }
}
