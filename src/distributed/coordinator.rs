//! Round coordinator
//!
//! Drives one aggregation round through an explicit state machine:
//!
//! ```text
//! PENDING -> DISPATCHED -> COLLECTING -> MERGING -> COMPLETE
//!                |             |
//!                +-> ABORTED <-+
//! ```
//!
//! - **DISPATCHED**: the query goes out concurrently to every participant in
//!   the snapshot that is not EXCLUDED, one task each in a `JoinSet`
//! - **COLLECTING**: answers are gathered until all dispatched participants
//!   answered or the round deadline passed; stragglers are cancelled and
//!   reported UNREACHABLE
//! - **MERGING**: successful partials go through the merge engine
//! - **ABORTED**: fewer successful answers than `minimum_quorum`
//!
//! The coordinator never mutates the participant registry. It works on the
//! snapshot it is handed and reports every exclusion in its result, so the
//! caller can update the registry afterwards.

use super::registry::ParticipantHandle;
use super::transport::{FailureSignal, Transport};
use crate::query::AggregateQueryDefinition;
use crate::stats::aggregator::{self, MergeConflictError};
use crate::stats::{GlobalAggregate, PartialAggregate};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Round state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Pending,
    Dispatched,
    Collecting,
    Merging,
    Complete,
    Aborted,
}

impl RoundState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RoundState) -> bool {
        use RoundState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Dispatched, Collecting)
                | (Collecting, Merging)
                | (Merging, Complete)
                | (Dispatched, Aborted)
                | (Collecting, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Dispatched => "DISPATCHED",
            Self::Collecting => "COLLECTING",
            Self::Merging => "MERGING",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

/// Too few participants answered for the round to produce a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quorum not met: {successful} successful response(s), {required} required")]
pub struct QuorumNotMetError {
    pub successful: usize,
    pub required: usize,

    /// Participants that returned a partial, sorted
    pub responded: Vec<String>,

    /// Every dispatched participant that did not contribute, and why
    pub exclusions: BTreeMap<String, FailureSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error(transparent)]
    QuorumNotMet(#[from] QuorumNotMetError),

    #[error(transparent)]
    MergeConflict(#[from] MergeConflictError),

    #[error("illegal round transition {from} -> {to}")]
    IllegalTransition { from: RoundState, to: RoundState },
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Minimum number of successful partials for a round to complete (>= 1)
    pub minimum_quorum: usize,

    /// Default round deadline
    pub round_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            minimum_quorum: 1,
            round_deadline: Duration::from_secs(30),
        }
    }
}

/// State of one round, with transition checking and logging
#[derive(Debug)]
struct Round {
    id: u64,
    state: RoundState,
}

impl Round {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: RoundState::Pending,
        }
    }

    fn advance(&mut self, next: RoundState) -> Result<(), RoundError> {
        if !self.state.can_transition_to(next) {
            return Err(RoundError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(round = self.id, from = %self.state, to = %next, "Round transition");
        self.state = next;
        Ok(())
    }
}

/// Round coordinator
pub struct RoundCoordinator {
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    next_round_id: AtomicU64,
}

impl RoundCoordinator {
    pub fn new(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Self {
        Self {
            transport,
            config,
            next_round_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one round with the configured deadline
    pub async fn run(
        &self,
        query: &AggregateQueryDefinition,
        participants: &[ParticipantHandle],
    ) -> Result<GlobalAggregate, RoundError> {
        self.run_round(query, participants, self.config.round_deadline).await
    }

    /// Run one round
    ///
    /// `participants` is a snapshot; EXCLUDED entries are skipped. The query
    /// is already validated, so the round starts dispatching immediately.
    ///
    /// # Errors
    ///
    /// - [`RoundError::QuorumNotMet`] when fewer than `minimum_quorum`
    ///   participants returned a partial before the deadline
    /// - [`RoundError::MergeConflict`] when the partials cannot be merged
    pub async fn run_round(
        &self,
        query: &AggregateQueryDefinition,
        participants: &[ParticipantHandle],
        round_deadline: Duration,
    ) -> Result<GlobalAggregate, RoundError> {
        let mut round = Round::new(self.next_round_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + round_deadline;
        let required = self.config.minimum_quorum;

        let dispatched: Vec<&ParticipantHandle> = participants.iter().filter(|p| p.is_dispatchable()).collect();

        info!(
            round = round.id,
            query = %query,
            participants = dispatched.len(),
            quorum = required,
            "Dispatching round"
        );

        // PENDING -> DISPATCHED
        round.advance(RoundState::Dispatched)?;
        if dispatched.len() < required {
            round.advance(RoundState::Aborted)?;
            warn!(round = round.id, dispatched = dispatched.len(), required, "Not enough participants to reach quorum");
            return Err(QuorumNotMetError {
                successful: 0,
                required,
                responded: Vec::new(),
                exclusions: BTreeMap::new(),
            }
            .into());
        }

        let query = Arc::new(query.clone());
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();
        for participant in dispatched {
            let transport = Arc::clone(&self.transport);
            let query = Arc::clone(&query);
            let participant = participant.clone();
            pending.insert(participant.participant_id.clone());

            tasks.spawn(async move {
                let result = transport.send(&participant, &query).await;
                (participant.participant_id, result)
            });
        }

        // DISPATCHED -> COLLECTING
        round.advance(RoundState::Collecting)?;
        let mut partials: Vec<PartialAggregate> = Vec::new();
        let mut exclusions: BTreeMap<String, FailureSignal> = BTreeMap::new();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    pending.remove(&id);
                    match outcome {
                        Ok(partial) if partial.participant_id != id => {
                            let signal = FailureSignal::protocol(format!(
                                "partial attributed to '{}'",
                                partial.participant_id
                            ));
                            warn!(round = round.id, participant_id = %id, reason = %signal, "Participant excluded");
                            exclusions.insert(id, signal);
                        }
                        Ok(partial) => {
                            debug!(round = round.id, participant_id = %id, "Partial received");
                            partials.push(partial);
                        }
                        Err(signal) => {
                            warn!(round = round.id, participant_id = %id, reason = %signal, "Participant excluded");
                            exclusions.insert(id, signal);
                        }
                    }
                }
                Ok(Some(Err(join_error))) => {
                    // The participant stays pending and is reported below.
                    warn!(round = round.id, error = %join_error, "Participant task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    // Deadline passed: stop waiting and cancel the stragglers.
                    tasks.abort_all();
                    break;
                }
            }
        }

        for id in pending {
            warn!(round = round.id, participant_id = %id, "No response before round deadline");
            exclusions.insert(
                id,
                FailureSignal::unreachable(format!("no response within {:?}", round_deadline)),
            );
        }

        let successful = partials.len();
        if successful < required {
            round.advance(RoundState::Aborted)?;
            warn!(round = round.id, successful, required, "Round aborted: quorum not met");
            let mut responded: Vec<String> = partials.into_iter().map(|p| p.participant_id).collect();
            responded.sort();
            return Err(QuorumNotMetError {
                successful,
                required,
                responded,
                exclusions,
            }
            .into());
        }

        // COLLECTING -> MERGING
        round.advance(RoundState::Merging)?;
        let global = aggregator::merge_for_query(&query, partials).map_err(|e| {
            warn!(round = round.id, error = %e, "Merge conflict");
            RoundError::from(e)
        })?;

        // MERGING -> COMPLETE
        round.advance(RoundState::Complete)?;
        info!(
            round = round.id,
            contributing = global.contributing_participant_count,
            excluded = exclusions.len(),
            "Round complete"
        );

        Ok(global.with_exclusions(exclusions))
    }
}
