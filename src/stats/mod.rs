//! Aggregate statistics
//!
//! Partial and global aggregate types shared by the local aggregator, the
//! wire protocol and the merge engine.
//!
//! A participant never ships rows. For every group it ships only the moments
//! the statistic needs:
//!
//! - **count**: number of non-null target values
//! - **sum**: exact decimal sum (SUM, MEAN, STD_DEV, HISTOGRAM)
//! - **sum_of_squares**: exact decimal sum of squares (STD_DEV)
//! - **buckets**: per-bucket counts (HISTOGRAM)
//!
//! Keeping `(count, sum)` instead of a pre-divided mean is what lets the merge
//! engine compute a weighted mean rather than an average of averages.
//!
//! # Example
//!
//! ```
//! use fedstat::stats::{GroupKey, GroupStats, PartialAggregate};
//! use fedstat::query::StatisticKind;
//! use rust_decimal::Decimal;
//!
//! let mut partial = PartialAggregate::new("site-a", StatisticKind::Mean);
//! let stats = partial.group_mut(GroupKey::from_values(["male"]), 0);
//! stats.record_value(Decimal::from(40), false).unwrap();
//! stats.record_value(Decimal::from(60), false).unwrap();
//!
//! let group = &partial.groups[&GroupKey::from_values(["male"])];
//! assert_eq!(group.count, 2);
//! assert_eq!(group.sum, Decimal::from(100));
//! ```

pub mod aggregator;
pub mod histogram;

use crate::distributed::transport::FailureSignal;
use crate::query::StatisticKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Decimal arithmetic left the representable range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("numeric overflow")]
pub struct ArithmeticOverflow;

/// Values of the group-by columns for one group
///
/// `None` stands for SQL NULL. The empty key is the single group of an
/// ungrouped query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub Vec<Option<String>>);

impl GroupKey {
    /// Key of an ungrouped query
    pub fn all() -> Self {
        Self(Vec::new())
    }

    /// Build a key from non-null values
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(|v| Some(v.into())).collect())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(all)");
        }
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                Some(v) => write!(f, "{}", v)?,
                None => write!(f, "NULL")?,
            }
        }
        Ok(())
    }
}

/// Moments of one group at one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: u64,
    pub sum: Decimal,
    pub sum_of_squares: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<u64>,
}

impl GroupStats {
    /// Empty group with `bucket_count` histogram buckets (0 for other statistics)
    pub fn new(bucket_count: usize) -> Self {
        Self {
            count: 0,
            sum: Decimal::ZERO,
            sum_of_squares: Decimal::ZERO,
            buckets: vec![0; bucket_count],
        }
    }

    /// Count a non-null value without looking at it (COUNT)
    pub fn record_presence(&mut self) -> Result<(), ArithmeticOverflow> {
        self.count = self.count.checked_add(1).ok_or(ArithmeticOverflow)?;
        Ok(())
    }

    /// Accumulate a numeric value
    ///
    /// `with_squares` also accumulates the sum of squares (STD_DEV only, so
    /// that other statistics do not fail on squares they never use).
    pub fn record_value(&mut self, value: Decimal, with_squares: bool) -> Result<(), ArithmeticOverflow> {
        self.record_presence()?;
        self.sum = self.sum.checked_add(value).ok_or(ArithmeticOverflow)?;
        if with_squares {
            let square = value.checked_mul(value).ok_or(ArithmeticOverflow)?;
            self.sum_of_squares = self
                .sum_of_squares
                .checked_add(square)
                .ok_or(ArithmeticOverflow)?;
        }
        Ok(())
    }

    /// Count a value into histogram bucket `index`
    pub fn record_bucket(&mut self, index: usize) {
        if let Some(slot) = self.buckets.get_mut(index) {
            *slot += 1;
        }
    }

    /// A group with no rows contributes nothing to any statistic
    pub fn is_zero_weight(&self) -> bool {
        self.count == 0
    }

    /// Add another group's moments into this one
    ///
    /// Bucket vectors must have equal length; the caller checks layouts.
    pub fn merge(&mut self, other: &GroupStats) -> Result<(), ArithmeticOverflow> {
        self.count = self.count.checked_add(other.count).ok_or(ArithmeticOverflow)?;
        self.sum = self.sum.checked_add(other.sum).ok_or(ArithmeticOverflow)?;
        self.sum_of_squares = self
            .sum_of_squares
            .checked_add(other.sum_of_squares)
            .ok_or(ArithmeticOverflow)?;
        if self.buckets.is_empty() {
            self.buckets = other.buckets.clone();
        } else {
            for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
                *mine = mine.checked_add(*theirs).ok_or(ArithmeticOverflow)?;
            }
        }
        Ok(())
    }
}

/// A participant's local, pre-merge contribution to one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAggregate {
    pub participant_id: String,
    pub statistic_kind: StatisticKind,
    #[serde(with = "group_entries")]
    pub groups: BTreeMap<GroupKey, GroupStats>,
}

impl PartialAggregate {
    pub fn new(participant_id: impl Into<String>, statistic_kind: StatisticKind) -> Self {
        Self {
            participant_id: participant_id.into(),
            statistic_kind,
            groups: BTreeMap::new(),
        }
    }

    /// Get or create the stats for a group
    pub fn group_mut(&mut self, key: GroupKey, bucket_count: usize) -> &mut GroupStats {
        self.groups
            .entry(key)
            .or_insert_with(|| GroupStats::new(bucket_count))
    }

    /// Total number of values counted across all groups
    pub fn total_count(&self) -> u64 {
        self.groups.values().map(|g| g.count).sum()
    }
}

/// Merged value of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalValue {
    Count(u64),
    Sum(Decimal),
    /// Weighted mean; `None` when no participant had a value for the group
    Mean(Option<Decimal>),
    /// Sample standard deviation; `None` with fewer than two values
    StdDev(Option<f64>),
    Histogram(Vec<u64>),
}

impl fmt::Display for GlobalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(c) => write!(f, "{}", c),
            Self::Sum(s) => write!(f, "{}", s),
            Self::Mean(Some(m)) => write!(f, "{}", m.round_dp(6).normalize()),
            Self::StdDev(Some(s)) => write!(f, "{:.6}", s),
            Self::Mean(None) | Self::StdDev(None) => write!(f, "null"),
            Self::Histogram(buckets) => {
                let parts: Vec<String> = buckets.iter().map(|b| b.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Merged, cross-participant result of a round
///
/// Built once by the merge engine and never mutated afterwards. It carries no
/// timestamps or round ids, so identical inputs serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    pub statistic_kind: StatisticKind,
    #[serde(with = "group_entries")]
    pub groups: BTreeMap<GroupKey, GlobalValue>,
    pub contributing_participant_count: usize,
    /// Sorted ids of participants whose partials were merged
    pub contributing_participant_ids: Vec<String>,
    /// Sorted ids of participants left out of this round
    pub excluded_participant_ids: Vec<String>,
    /// Why each excluded participant was left out
    pub exclusion_reasons: BTreeMap<String, FailureSignal>,
}

impl GlobalAggregate {
    /// Copy of this aggregate with the round's exclusions attached
    pub fn with_exclusions(self, exclusions: BTreeMap<String, FailureSignal>) -> Self {
        Self {
            excluded_participant_ids: exclusions.keys().cloned().collect(),
            exclusion_reasons: exclusions,
            ..self
        }
    }

    pub fn value(&self, key: &GroupKey) -> Option<&GlobalValue> {
        self.groups.get(key)
    }
}

/// Serialize a group map as a sequence of `{key, value}` entries
///
/// Group keys are tuples, which JSON cannot use as object keys.
pub(crate) mod group_entries {
    use super::GroupKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct EntryRef<'a, V> {
        key: &'a GroupKey,
        value: &'a V,
    }

    #[derive(Deserialize)]
    struct Entry<V> {
        key: GroupKey,
        value: V,
    }

    pub fn serialize<S, V>(map: &BTreeMap<GroupKey, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_seq(map.iter().map(|(key, value)| EntryRef { key, value }))
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<GroupKey, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        let entries: Vec<Entry<V>> = Vec::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in entries {
            if map.contains_key(&entry.key) {
                return Err(serde::de::Error::custom(format!(
                    "duplicate group key: {}",
                    entry.key
                )));
            }
            map.insert(entry.key, entry.value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_display() {
        assert_eq!(GroupKey::all().to_string(), "(all)");
        assert_eq!(GroupKey::from_values(["2020", "male"]).to_string(), "2020, male");
        assert_eq!(GroupKey(vec![None]).to_string(), "NULL");
    }

    #[test]
    fn test_record_value_tracks_moments() {
        let mut stats = GroupStats::new(0);
        stats.record_value(Decimal::from(3), true).unwrap();
        stats.record_value(Decimal::from(4), true).unwrap();

        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum, Decimal::from(7));
        assert_eq!(stats.sum_of_squares, Decimal::from(25));
    }

    #[test]
    fn test_record_value_overflow_is_reported() {
        let mut stats = GroupStats::new(0);
        stats.record_value(Decimal::MAX, false).unwrap();
        assert_eq!(stats.record_value(Decimal::MAX, false), Err(ArithmeticOverflow));
    }

    #[test]
    fn test_group_stats_merge() {
        let mut a = GroupStats::new(3);
        a.record_value(Decimal::from(1), false).unwrap();
        a.record_bucket(0);

        let mut b = GroupStats::new(3);
        b.record_value(Decimal::from(10), false).unwrap();
        b.record_bucket(2);

        a.merge(&b).unwrap();
        assert_eq!(a.count, 2);
        assert_eq!(a.sum, Decimal::from(11));
        assert_eq!(a.buckets, vec![1, 0, 1]);
    }

    #[test]
    fn test_partial_json_shape() {
        let mut partial = PartialAggregate::new("site-a", StatisticKind::Count);
        partial
            .group_mut(GroupKey::from_values(["2020"]), 0)
            .record_presence()
            .unwrap();

        let json = serde_json::to_string(&partial).unwrap();
        assert!(json.contains(r#""groups":[{"key":["2020"]"#));

        let back: PartialAggregate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, partial);
    }

    #[test]
    fn test_duplicate_group_keys_rejected() {
        let json = r#"{
            "participant_id": "a",
            "statistic_kind": "count",
            "groups": [
                {"key": ["x"], "value": {"count": 1, "sum": "0", "sum_of_squares": "0"}},
                {"key": ["x"], "value": {"count": 2, "sum": "0", "sum_of_squares": "0"}}
            ]
        }"#;
        let result: Result<PartialAggregate, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
