//! Federation session
//!
//! Runs a list of queries as sequential rounds against one participant
//! registry:
//!
//! 1. **Admission**: probe participants until at least `min_participants`
//!    answer, polling every `admission_poll`
//! 2. For each query: sample `fraction_sample` of the dispatchable
//!    participants, run a round on that snapshot, then fold the round's
//!    outcome back into the registry
//!
//! A failed round does not stop the session; every query gets its outcome.

use super::coordinator::{RoundCoordinator, RoundError};
use super::registry::{ParticipantHandle, ParticipantStatus, SharedRegistry};
use super::transport::{FailureSignal, Transport};
use crate::query::AggregateQueryDefinition;
use crate::stats::GlobalAggregate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Participants that must answer a probe before the first round
    pub min_participants: usize,

    /// Delay between admission probes
    pub admission_poll: Duration,

    /// Give up admission after this long (`None`: wait forever)
    pub admission_timeout: Option<Duration>,

    /// Share of dispatchable participants sampled per round, in (0, 1]
    pub fraction_sample: f64,

    /// Seed for reproducible sampling
    pub sample_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_participants: 1,
            admission_poll: Duration::from_secs(2),
            admission_timeout: None,
            fraction_sample: 1.0,
            sample_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("only {connected} of {required} required participant(s) answered within {waited:?}")]
    AdmissionTimeout {
        connected: usize,
        required: usize,
        waited: Duration,
    },
}

/// One named query to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    pub name: String,
    pub query: AggregateQueryDefinition,
}

/// What happened to one query
#[derive(Debug)]
pub struct RoundOutcome {
    pub name: String,
    pub query: AggregateQueryDefinition,

    /// Participants the round was dispatched to, sorted
    pub sampled: Vec<String>,

    pub result: Result<GlobalAggregate, RoundError>,
}

/// Federation session
pub struct FederationSession {
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    coordinator: RoundCoordinator,
    config: SessionConfig,
    rng: StdRng,
}

impl FederationSession {
    pub fn new(
        registry: SharedRegistry,
        transport: Arc<dyn Transport>,
        coordinator: RoundCoordinator,
        config: SessionConfig,
    ) -> Self {
        let rng = match config.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            transport,
            coordinator,
            config,
            rng,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Wait until at least `min_participants` answer a probe
    ///
    /// Every participant that answers becomes ACTIVE, every one that does not
    /// becomes UNREACHABLE. Returns the number of ACTIVE participants.
    pub async fn wait_for_admission(&mut self) -> Result<usize, SessionError> {
        let started = Instant::now();
        let required = self.config.min_participants;

        loop {
            let connected = self.probe_all().await;
            if connected >= required {
                info!(connected, required, "Admission complete");
                return Ok(connected);
            }

            let waited = started.elapsed();
            if let Some(limit) = self.config.admission_timeout {
                if waited + self.config.admission_poll > limit {
                    return Err(SessionError::AdmissionTimeout {
                        connected,
                        required,
                        waited,
                    });
                }
            }

            info!(connected, required, "Waiting for participants to connect");
            tokio::time::sleep(self.config.admission_poll).await;
        }
    }

    /// Probe every dispatchable participant once, in parallel
    async fn probe_all(&self) -> usize {
        let candidates = self.registry.read().await.dispatchable();

        let mut probes = JoinSet::new();
        for participant in candidates {
            let transport = Arc::clone(&self.transport);
            let budget = self.config.admission_poll;
            probes.spawn(async move {
                let outcome = match tokio::time::timeout(budget, transport.probe(&participant)).await {
                    Ok(result) => result,
                    Err(_) => Err(FailureSignal::unreachable(format!("probe timed out after {:?}", budget))),
                };
                (participant.participant_id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }

        let mut registry = self.registry.write().await;
        let mut connected = 0;
        for (id, outcome) in results {
            let status = match outcome {
                Ok(()) => {
                    connected += 1;
                    ParticipantStatus::Active
                }
                Err(signal) => {
                    debug!(participant_id = %id, reason = %signal, "Probe failed");
                    ParticipantStatus::Unreachable
                }
            };
            // Ignored: the participant may have been deregistered meanwhile.
            let _ = registry.set_status(&id, status);
        }
        connected
    }

    /// Draw this round's participants from the dispatchable ones
    ///
    /// Takes `ceil(fraction_sample * n)` participants, at least one, and
    /// returns them sorted by id.
    pub fn sample(&mut self, mut eligible: Vec<ParticipantHandle>) -> Vec<ParticipantHandle> {
        if eligible.is_empty() || self.config.fraction_sample >= 1.0 {
            return eligible;
        }

        let wanted = ((eligible.len() as f64) * self.config.fraction_sample).ceil() as usize;
        let wanted = wanted.clamp(1, eligible.len());

        eligible.shuffle(&mut self.rng);
        eligible.truncate(wanted);
        eligible.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        eligible
    }

    /// Run one query as a round and record its outcome in the registry
    pub async fn run_query(&mut self, named: &NamedQuery) -> RoundOutcome {
        let eligible = self.registry.read().await.dispatchable();
        let sampled = self.sample(eligible);
        let sampled_ids: Vec<String> = sampled.iter().map(|p| p.participant_id.clone()).collect();

        info!(query = %named.name, sampled = sampled_ids.len(), "Starting round");
        let result = self.coordinator.run(&named.query, &sampled).await;

        let (successful, failures): (Vec<String>, BTreeMap<String, FailureSignal>) = match result {
            Ok(ref global) => (
                global.contributing_participant_ids.clone(),
                global.exclusion_reasons.clone(),
            ),
            Err(RoundError::QuorumNotMet(ref e)) => (e.responded.clone(), e.exclusions.clone()),
            Err(ref e) => {
                warn!(query = %named.name, error = %e, "Round failed");
                (Vec::new(), BTreeMap::new())
            }
        };
        self.registry.write().await.record_round(&successful, &failures);

        RoundOutcome {
            name: named.name.clone(),
            query: named.query.clone(),
            sampled: sampled_ids,
            result,
        }
    }

    /// Run every query in order
    pub async fn run_all(&mut self, queries: &[NamedQuery]) -> Vec<RoundOutcome> {
        let mut outcomes = Vec::with_capacity(queries.len());
        for named in queries {
            outcomes.push(self.run_query(named).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::coordinator::CoordinatorConfig;
    use crate::distributed::registry::ParticipantRegistry;
    use crate::distributed::transport::InProcessTransport;
    use crate::engine::mock::MemoryTable;
    use crate::query::Statistic;
    use crate::stats::{GlobalValue, GroupKey};
    use crate::worker::LocalSite;

    fn table(rows: i64) -> LocalSite {
        let mut t = MemoryTable::new(["id"]);
        for i in 0..rows {
            t.push_row(vec![i.into()]);
        }
        LocalSite::Handle(Arc::new(t))
    }

    fn registry(ids: &[&str]) -> SharedRegistry {
        let mut registry = ParticipantRegistry::new();
        for id in ids {
            registry.register(*id, "local").unwrap();
        }
        registry.into_shared()
    }

    fn session(transport: InProcessTransport, ids: &[&str], config: SessionConfig, quorum: usize) -> FederationSession {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let coordinator = RoundCoordinator::new(
            Arc::clone(&transport),
            CoordinatorConfig {
                minimum_quorum: quorum,
                round_deadline: Duration::from_millis(300),
            },
        );
        FederationSession::new(registry(ids), transport, coordinator, config)
    }

    fn count(name: &str) -> NamedQuery {
        NamedQuery {
            name: name.to_string(),
            query: AggregateQueryDefinition::new(Statistic::Count, "id", None, vec![]).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_admission_marks_statuses() {
        let transport = InProcessTransport::new().with_site("a", table(1)).with_site("b", table(1));
        let mut session = session(transport, &["a", "b", "c"], SessionConfig::default(), 1);

        let connected = session.wait_for_admission().await.unwrap();
        assert_eq!(connected, 2);

        let registry = session.registry().read().await;
        assert_eq!(registry.get("a").unwrap().status, ParticipantStatus::Active);
        assert_eq!(registry.get("c").unwrap().status, ParticipantStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_admission_timeout() {
        let transport = InProcessTransport::new().with_site("a", table(1));
        let config = SessionConfig {
            min_participants: 2,
            admission_poll: Duration::from_millis(20),
            admission_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut session = session(transport, &["a", "b"], config, 1);

        let err = session.wait_for_admission().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::AdmissionTimeout {
                connected: 1,
                required: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_seeded_sampling_is_reproducible() {
        let ids = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let config = SessionConfig {
            fraction_sample: 0.5,
            sample_seed: Some(42),
            ..Default::default()
        };

        let mut first = session(InProcessTransport::new(), &ids, config.clone(), 1);
        let mut second = session(InProcessTransport::new(), &ids, config, 1);
        let eligible = first.registry().read().await.dispatchable();

        let a = first.sample(eligible.clone());
        let b = second.sample(eligible);
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0].participant_id < w[1].participant_id));
    }

    #[tokio::test]
    async fn test_sampling_keeps_at_least_one() {
        let config = SessionConfig {
            fraction_sample: 0.01,
            sample_seed: Some(1),
            ..Default::default()
        };
        let mut session = session(InProcessTransport::new(), &["a", "b", "c"], config, 1);
        let eligible = session.registry().read().await.dispatchable();
        assert_eq!(session.sample(eligible).len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_rounds_update_registry() {
        let transport = InProcessTransport::new().with_site("a", table(3)).with_site("b", table(4));
        let mut session = session(transport, &["a", "b", "ghost"], SessionConfig::default(), 2);

        let outcomes = session.run_all(&[count("first"), count("second")]).await;
        assert_eq!(outcomes.len(), 2);

        for outcome in &outcomes {
            let global = outcome.result.as_ref().unwrap();
            assert_eq!(global.value(&GroupKey::all()), Some(&GlobalValue::Count(7)));
            assert_eq!(global.excluded_participant_ids, vec!["ghost"]);
        }

        let registry = session.registry().read().await;
        assert_eq!(registry.get("a").unwrap().status, ParticipantStatus::Active);
        assert_eq!(registry.get("ghost").unwrap().status, ParticipantStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_quorum_failure_does_not_stop_session() {
        let transport = InProcessTransport::new().with_site("a", table(3));
        let mut session = session(transport, &["a", "b"], SessionConfig::default(), 2);

        let outcomes = session.run_all(&[count("one"), count("two")]).await;
        assert!(outcomes.iter().all(|o| matches!(o.result, Err(RoundError::QuorumNotMet(_)))));

        let registry = session.registry().read().await;
        assert_eq!(registry.get("a").unwrap().status, ParticipantStatus::Active);
        assert_eq!(registry.get("b").unwrap().status, ParticipantStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_undispatched_participants_keep_status() {
        let mut session = session(InProcessTransport::new(), &["ghost"], SessionConfig::default(), 2);
        session
            .registry()
            .write()
            .await
            .set_status("ghost", ParticipantStatus::Unreachable)
            .unwrap();

        let outcome = session.run_query(&count("short")).await;
        match &outcome.result {
            Err(RoundError::QuorumNotMet(e)) => {
                assert_eq!(e.successful, 0);
                assert!(e.responded.is_empty());
                assert!(e.exclusions.is_empty());
            }
            other => panic!("unexpected result {:?}", other),
        }

        // No request went out, so nothing was learned about the participant
        let registry = session.registry().read().await;
        assert_eq!(registry.get("ghost").unwrap().status, ParticipantStatus::Unreachable);
    }
}
