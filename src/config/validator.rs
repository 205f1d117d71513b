//! Configuration validation

use super::cli::ExecutionMode;
use super::convert::parse_duration;
use super::*;
use anyhow::{Context, Result};
use std::collections::HashSet;

/// Validate complete configuration for the given mode
pub fn validate_config(config: &Config, mode: ExecutionMode) -> Result<()> {
    validate_coordinator(&config.coordinator)?;
    validate_participants(&config.participants, mode)?;

    if config.coordinator.min_participants > config.participants.len() {
        anyhow::bail!(
            "min_participants ({}) exceeds the number of configured participants ({})",
            config.coordinator.min_participants,
            config.participants.len()
        );
    }

    validate_queries(&config.queries)?;

    Ok(())
}

/// Validate round and session settings
pub fn validate_coordinator(section: &CoordinatorSection) -> Result<()> {
    if section.minimum_quorum == 0 {
        anyhow::bail!("minimum_quorum must be at least 1");
    }

    if !(section.fraction_sample > 0.0 && section.fraction_sample <= 1.0) {
        anyhow::bail!("fraction_sample must be in (0, 1], got {}", section.fraction_sample);
    }

    let deadline = parse_duration(&section.round_deadline).context("Invalid round_deadline")?;
    if deadline.is_zero() {
        anyhow::bail!("round_deadline must be greater than zero");
    }
    parse_duration(&section.connect_timeout).context("Invalid connect_timeout")?;

    let poll = parse_duration(&section.admission_poll).context("Invalid admission_poll")?;
    if poll.is_zero() {
        anyhow::bail!("admission_poll must be greater than zero");
    }
    if let Some(ref timeout) = section.admission_timeout {
        parse_duration(timeout).context("Invalid admission_timeout")?;
    }

    Ok(())
}

/// Validate participants: unique ids, and what the mode needs to reach them
pub fn validate_participants(participants: &[ParticipantConfig], mode: ExecutionMode) -> Result<()> {
    if participants.is_empty() {
        anyhow::bail!("At least one participant must be configured");
    }

    let mut seen = HashSet::new();
    for (i, participant) in participants.iter().enumerate() {
        if participant.id.trim().is_empty() {
            anyhow::bail!("Participant {}: id must not be empty", i);
        }
        if !seen.insert(participant.id.as_str()) {
            anyhow::bail!("Duplicate participant id '{}'", participant.id);
        }

        match mode {
            ExecutionMode::Coordinator => {
                if participant.endpoint.is_none() {
                    anyhow::bail!("Participant '{}': endpoint is required in coordinator mode", participant.id);
                }
            }
            ExecutionMode::Local => {
                if participant.database_url.is_none() || participant.table.is_none() {
                    anyhow::bail!(
                        "Participant '{}': database_url and table are required in local mode",
                        participant.id
                    );
                }
            }
            ExecutionMode::Service => {}
        }
    }

    Ok(())
}

/// Build every query definition once so errors surface before any round
pub fn validate_queries(queries: &[QueryConfig]) -> Result<()> {
    if queries.is_empty() {
        anyhow::bail!("At least one query must be configured");
    }
    for query in queries {
        query.to_definition()?;
    }
    Ok(())
}
