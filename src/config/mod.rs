//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! # Example
//!
//! ```toml
//! [coordinator]
//! minimum_quorum = 2
//! round_deadline = "30s"
//! fraction_sample = 1.0
//!
//! [[participants]]
//! id = "site-a"
//! endpoint = "10.0.1.10:9999"
//! database_url = "sqlite:///data/site-a.db"
//! table = "visits"
//!
//! [[queries]]
//! name = "mean age by sex"
//! statistic = { kind = "mean" }
//! target_column = "age"
//! group_by = ["sex"]
//! ```

pub mod cli;
pub mod convert;
pub mod toml;
pub mod validator;

use crate::query::{FilterPredicate, Statistic};
use serde::{Deserialize, Serialize};

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub participants: Vec<ParticipantConfig>,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

/// Round and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Minimum number of partials for a round to complete
    #[serde(default = "default_minimum_quorum")]
    pub minimum_quorum: usize,
    /// Round deadline (e.g., "30s")
    #[serde(default = "default_round_deadline")]
    pub round_deadline: String,
    /// Connect timeout for TCP participants
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    /// Participants that must answer a probe before the first round
    #[serde(default = "default_min_participants")]
    pub min_participants: usize,
    /// Delay between admission probes
    #[serde(default = "default_admission_poll")]
    pub admission_poll: String,
    /// Give up admission after this long (unset: wait forever)
    pub admission_timeout: Option<String>,
    /// Fraction of participants sampled per round
    #[serde(default = "default_fraction_sample")]
    pub fraction_sample: f64,
    /// Seed for reproducible sampling
    pub sample_seed: Option<u64>,
}

fn default_minimum_quorum() -> usize {
    1
}

fn default_round_deadline() -> String {
    "30s".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_min_participants() -> usize {
    1
}

fn default_admission_poll() -> String {
    "2s".to_string()
}

fn default_fraction_sample() -> f64 {
    1.0
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            minimum_quorum: default_minimum_quorum(),
            round_deadline: default_round_deadline(),
            connect_timeout: default_connect_timeout(),
            min_participants: default_min_participants(),
            admission_poll: default_admission_poll(),
            admission_timeout: None,
            fraction_sample: default_fraction_sample(),
            sample_seed: None,
        }
    }
}

/// One participant site
///
/// Coordinator mode needs `endpoint`; local mode needs `database_url` and
/// `table`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantConfig {
    pub id: String,
    pub endpoint: Option<String>,
    pub database_url: Option<String>,
    pub table: Option<String>,
}

/// One query, run as its own round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Display name (default: the query's label)
    pub name: Option<String>,
    pub statistic: Statistic,
    pub target_column: String,
    pub filter: Option<FilterPredicate>,
    #[serde(default)]
    pub group_by: Vec<String>,
}
