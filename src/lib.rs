//! fedstat - federated aggregate statistics
//!
//! fedstat computes aggregate statistics (count, sum, mean, standard
//! deviation, histograms) over data that stays at the participant sites.
//! Each site returns only per-group partial aggregates; the coordinator
//! merges them into a global result.
//!
//! # Architecture
//!
//! - **Query definitions**: validated statistic, target column, filter, grouping
//! - **Local aggregation**: partials computed against a site's database
//! - **Merge engine**: order-independent, exact decimal merging
//! - **Rounds**: dispatch, deadline, quorum, exclusions
//! - **Sessions**: admission, sampling, sequential multi-query runs

pub mod config;
pub mod distributed;
pub mod engine;
pub mod output;
pub mod query;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use query::{AggregateQueryDefinition, Statistic};
pub use stats::{GlobalAggregate, PartialAggregate};

/// Result type used throughout fedstat
pub type Result<T> = anyhow::Result<T>;
