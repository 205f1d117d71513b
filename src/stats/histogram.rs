//! Histogram bucket layout
//!
//! Boundaries `b0 < b1 < ... < b(n-1)` define `n + 1` buckets:
//!
//! ```text
//! bucket 0      v <  b0
//! bucket i      b(i-1) <= v < b(i)      (1 <= i <= n-1)
//! bucket n      v >= b(n-1)
//! ```
//!
//! The two open-ended edge buckets make the layout total: every value lands
//! in exactly one bucket and nothing is dropped at a participant.

use rust_decimal::Decimal;

/// Number of buckets for a boundary list
pub fn bucket_count(boundaries: &[Decimal]) -> usize {
    boundaries.len() + 1
}

/// Bucket index for a value
///
/// `boundaries` must be strictly increasing (checked when the query is built).
pub fn bucket_index(boundaries: &[Decimal], value: Decimal) -> usize {
    boundaries.partition_point(|b| *b <= value)
}

/// Human-readable label for every bucket, in index order
pub fn bucket_labels(boundaries: &[Decimal]) -> Vec<String> {
    let mut labels = Vec::with_capacity(bucket_count(boundaries));
    if let (Some(first), Some(last)) = (boundaries.first(), boundaries.last()) {
        labels.push(format!("< {}", first));
        for pair in boundaries.windows(2) {
            labels.push(format!("[{}, {})", pair[0], pair[1]));
        }
        labels.push(format!(">= {}", last));
    }
    labels
}
