//! Config to runtime conversion utilities

use super::{Config, CoordinatorSection, QueryConfig};
use crate::distributed::{CoordinatorConfig, NamedQuery, SessionConfig};
use crate::query::AggregateQueryDefinition;
use anyhow::{Context, Result};
use std::time::Duration;

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h")
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, millis) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (n, 60 * 1000)
    } else if let Some(n) = s.strip_suffix("hr").or_else(|| s.strip_suffix('h')) {
        (n, 3600 * 1000)
    } else {
        (s.as_str(), 1000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    let total = num
        .checked_mul(millis)
        .with_context(|| format!("Duration out of range: {}", s))?;
    Ok(Duration::from_millis(total))
}

impl CoordinatorSection {
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            minimum_quorum: self.minimum_quorum,
            round_deadline: parse_duration(&self.round_deadline).context("coordinator.round_deadline")?,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let admission_timeout = match &self.admission_timeout {
            Some(s) => Some(parse_duration(s).context("coordinator.admission_timeout")?),
            None => None,
        };
        Ok(SessionConfig {
            min_participants: self.min_participants,
            admission_poll: parse_duration(&self.admission_poll).context("coordinator.admission_poll")?,
            admission_timeout,
            fraction_sample: self.fraction_sample,
            sample_seed: self.sample_seed,
        })
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        parse_duration(&self.connect_timeout).context("coordinator.connect_timeout")
    }
}

impl QueryConfig {
    /// Build the validated query definition
    pub fn to_definition(&self) -> Result<AggregateQueryDefinition> {
        AggregateQueryDefinition::new(
            self.statistic.clone(),
            self.target_column.clone(),
            self.filter.clone(),
            self.group_by.clone(),
        )
        .with_context(|| format!("Invalid query '{}'", self.display_name()))
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}({})", self.statistic.kind(), self.target_column),
        }
    }
}

impl Config {
    /// Every configured query, validated and named
    pub fn named_queries(&self) -> Result<Vec<NamedQuery>> {
        self.queries
            .iter()
            .map(|q| {
                let query = q.to_definition()?;
                let name = q.name.clone().unwrap_or_else(|| query.label());
                Ok(NamedQuery { name, query })
            })
            .collect()
    }
}
