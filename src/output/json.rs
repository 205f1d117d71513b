//! JSON output formatting
//!
//! One report per run: run metadata plus one entry per round. Every entry
//! carries the query, the sampled participants, the final state, and either
//! the global aggregate or the abort reason with its exclusions.

use crate::distributed::{FailureSignal, RoundError, RoundOutcome};
use crate::query::AggregateQueryDefinition;
use crate::stats::GlobalAggregate;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Run information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRunInfo {
    pub tool_version: String,
    /// Host the coordinator ran on
    pub coordinator_host: String,
    pub generated_at: String,
}

/// One round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRound {
    pub name: String,
    pub query: AggregateQueryDefinition,
    pub sampled: Vec<String>,
    /// COMPLETE, ABORTED (quorum not met) or FAILED (merge conflict)
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GlobalAggregate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Exclusions of an aborted round (a complete round carries them in `result`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclusion_reasons: BTreeMap<String, FailureSignal>,
}

/// Complete JSON report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub run_info: JsonRunInfo,
    pub rounds: Vec<JsonRound>,
}

impl JsonRound {
    pub fn from_outcome(outcome: &RoundOutcome) -> Self {
        let (state, result, error, exclusion_reasons) = match &outcome.result {
            Ok(global) => ("COMPLETE", Some(global.clone()), None, BTreeMap::new()),
            Err(RoundError::QuorumNotMet(e)) => ("ABORTED", None, Some(e.to_string()), e.exclusions.clone()),
            Err(e) => ("FAILED", None, Some(e.to_string()), BTreeMap::new()),
        };

        Self {
            name: outcome.name.clone(),
            query: outcome.query.clone(),
            sampled: outcome.sampled.clone(),
            state: state.to_string(),
            result,
            error,
            exclusion_reasons,
        }
    }
}

/// Build the report for a finished run
pub fn build_report(outcomes: &[RoundOutcome]) -> JsonReport {
    JsonReport {
        run_info: JsonRunInfo {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            coordinator_host: crate::distributed::node_service::default_participant_id(),
            generated_at: chrono::Utc::now().to_rfc3339(),
        },
        rounds: outcomes.iter().map(JsonRound::from_outcome).collect(),
    }
}

/// Write JSON output to file
pub fn write_json_output(output_path: &Path, report: &JsonReport, pretty: bool) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output: {}", output_path.display()))?;

    if pretty {
        serde_json::to_writer_pretty(file, report)?;
    } else {
        serde_json::to_writer(file, report)?;
    }

    Ok(())
}
