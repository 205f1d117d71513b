//! Human-readable text output

use crate::distributed::{RoundError, RoundOutcome};
use crate::stats::histogram::bucket_labels;
use crate::stats::{GlobalAggregate, GlobalValue};
use std::collections::BTreeMap;
use std::fmt::Write;

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Print one round's outcome to the console
pub fn print_outcome(outcome: &RoundOutcome) {
    print!("{}", render_outcome(outcome));
}

/// Print the closing summary of a run
pub fn print_summary(outcomes: &[RoundOutcome]) {
    let complete = outcomes.iter().filter(|o| o.result.is_ok()).count();
    println!("{}", RULE);
    println!("Rounds: {} complete, {} aborted", complete, outcomes.len() - complete);
    println!("{}", RULE);
}

/// Render one round's outcome
///
/// Shows:
/// - The query and the participants it was dispatched to
/// - One line per group (histograms: one line per bucket)
/// - Contributing and excluded participants, with exclusion reasons
pub fn render_outcome(outcome: &RoundOutcome) -> String {
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "  {}", outcome.name);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Query:    {}", outcome.query);
    let _ = writeln!(out, "Sampled:  {}", list_or_none(&outcome.sampled));
    let _ = writeln!(out);

    match &outcome.result {
        Ok(global) => render_global(&mut out, outcome, global),
        Err(RoundError::QuorumNotMet(e)) => {
            let _ = writeln!(out, "Status:   ABORTED");
            let _ = writeln!(out, "Reason:   {}", e);
            render_exclusions(&mut out, &e.exclusions);
        }
        Err(e) => {
            let _ = writeln!(out, "Status:   FAILED");
            let _ = writeln!(out, "Reason:   {}", e);
        }
    }
    let _ = writeln!(out);

    out
}

fn render_global(out: &mut String, outcome: &RoundOutcome, global: &GlobalAggregate) {
    let _ = writeln!(out, "Status:   COMPLETE");
    let _ = writeln!(out, "Statistic: {}", global.statistic_kind);
    let _ = writeln!(out);

    let labels = outcome.query.histogram_boundaries().map(bucket_labels);

    if global.groups.is_empty() {
        let _ = writeln!(out, "  (no groups)");
    }
    for (key, value) in &global.groups {
        match (value, &labels) {
            (GlobalValue::Histogram(buckets), Some(labels)) => {
                let _ = writeln!(out, "  {}:", key);
                for (label, count) in labels.iter().zip(buckets) {
                    let _ = writeln!(out, "    {:<16} {}", label, count);
                }
            }
            _ => {
                let _ = writeln!(out, "  {:<24} {}", key.to_string(), value);
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Contributing: {} ({})",
        global.contributing_participant_count,
        list_or_none(&global.contributing_participant_ids)
    );
    render_exclusions(out, &global.exclusion_reasons);
}

fn render_exclusions<V: std::fmt::Display>(out: &mut String, exclusions: &BTreeMap<String, V>) {
    if exclusions.is_empty() {
        let _ = writeln!(out, "Excluded:     none");
        return;
    }
    let _ = writeln!(out, "Excluded:     {}", exclusions.len());
    for (id, reason) in exclusions {
        let _ = writeln!(out, "  {}: {}", id, reason);
    }
}

fn list_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}
