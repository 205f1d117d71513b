//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(quorum) = cli.minimum_quorum {
        config.coordinator.minimum_quorum = quorum;
    }
    if let Some(ref deadline) = cli.round_deadline {
        config.coordinator.round_deadline = deadline.clone();
    }
    if let Some(fraction) = cli.fraction_sample {
        config.coordinator.fraction_sample = fraction;
    }
    if let Some(seed) = cli.sample_seed {
        config.coordinator.sample_seed = Some(seed);
    }
    if let Some(min) = cli.min_participants {
        config.coordinator.min_participants = min;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompareOp, Literal, StatisticKind};
    use clap::Parser;
    use rust_decimal::Decimal;

    const ROUND: &str = r#"
        [coordinator]
        minimum_quorum = 2
        round_deadline = "500ms"
        sample_seed = 7

        [[participants]]
        id = "site-a"
        endpoint = "127.0.0.1:9999"

        [[participants]]
        id = "site-b"
        database_url = "sqlite://b.db"
        table = "visits"

        [[queries]]
        name = "adult women"
        statistic = { kind = "count" }
        target_column = "id"
        filter = { compare = { column = "age", op = "ge", value = 18 } }

        [[queries]]
        statistic = { kind = "histogram", boundaries = [0, 18, 65] }
        target_column = "age"
        group_by = ["sex"]
    "#;

    #[test]
    fn test_parse_toml_basic() {
        let config = parse_toml_string(ROUND).unwrap();

        assert_eq!(config.coordinator.minimum_quorum, 2);
        assert_eq!(config.coordinator.round_deadline, "500ms");
        assert_eq!(config.coordinator.fraction_sample, 1.0);
        assert_eq!(config.coordinator.sample_seed, Some(7));

        assert_eq!(config.participants.len(), 2);
        assert_eq!(config.participants[0].endpoint.as_deref(), Some("127.0.0.1:9999"));
        assert_eq!(config.participants[1].table.as_deref(), Some("visits"));

        let queries = config.named_queries().unwrap();
        assert_eq!(queries[0].name, "adult women");
        match queries[0].query.filter() {
            Some(FilterPredicate::Compare { column, op, value }) => {
                assert_eq!(column, "age");
                assert_eq!(*op, CompareOp::Ge);
                assert_eq!(*value, Literal::Integer(18));
            }
            other => panic!("unexpected filter {:?}", other),
        }

        assert_eq!(queries[1].query.statistic_kind(), StatisticKind::Histogram);
        assert_eq!(
            queries[1].query.histogram_boundaries().unwrap(),
            &[Decimal::from(0), Decimal::from(18), Decimal::from(65)]
        );
        assert_eq!(queries[1].name, queries[1].query.label());
    }

    #[test]
    fn test_parse_toml_defaults() {
        let config = parse_toml_string("").unwrap();
        assert_eq!(config.coordinator.minimum_quorum, 1);
        assert_eq!(config.coordinator.admission_poll, "2s");
        assert!(config.participants.is_empty());
        assert!(config.queries.is_empty());
    }

    #[test]
    fn test_parse_toml_rejects_unknown_statistic() {
        let bad = r#"
            [[queries]]
            statistic = { kind = "median" }
            target_column = "age"
        "#;
        assert!(parse_toml_string(bad).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = parse_toml_string(ROUND).unwrap();
        let cli = Cli::try_parse_from([
            "fedstat",
            "local",
            "-c",
            "round.toml",
            "--minimum-quorum",
            "1",
            "--fraction-sample",
            "0.5",
        ])
        .unwrap();

        let merged = merge_cli_with_config(&cli, config).unwrap();
        assert_eq!(merged.coordinator.minimum_quorum, 1);
        assert_eq!(merged.coordinator.fraction_sample, 0.5);
        assert_eq!(merged.coordinator.round_deadline, "500ms");
        assert_eq!(merged.coordinator.sample_seed, Some(7));
    }
}
