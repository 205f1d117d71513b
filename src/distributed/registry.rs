//! Participant registry
//!
//! Tracks the known participants and their status. The registry is shared as
//! a [`SharedRegistry`] (`Arc<RwLock<..>>`); every mutation takes the write
//! lock, so there is a single writer at any time. Rounds never touch the
//! registry: they run on a cloned [`ParticipantRegistry::snapshot`] taken at
//! dispatch, and the session applies the round's outcome afterwards with
//! [`ParticipantRegistry::record_round`].

use super::transport::FailureSignal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Registry shared between the session and the operator surface
pub type SharedRegistry = Arc<RwLock<ParticipantRegistry>>;

/// Participant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Known, never heard from
    Registered,
    /// Answered its most recent probe or round
    Active,
    /// Missed its most recent probe or round deadline
    Unreachable,
    /// Left out of every round until re-admitted by an operator
    Excluded,
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Unreachable => "UNREACHABLE",
            Self::Excluded => "EXCLUDED",
        };
        write!(f, "{}", s)
    }
}

/// One participant site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantHandle {
    pub participant_id: String,

    /// `host:port` for TCP participants; free-form for in-process ones
    pub endpoint: String,

    pub status: ParticipantStatus,
}

impl ParticipantHandle {
    pub fn new(participant_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            endpoint: endpoint.into(),
            status: ParticipantStatus::Registered,
        }
    }

    /// Whether rounds dispatch to this participant
    pub fn is_dispatchable(&self) -> bool {
        self.status != ParticipantStatus::Excluded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("participant '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown participant '{0}'")]
    Unknown(String),
}

/// Known participants, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: BTreeMap<String, ParticipantHandle>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn register(&mut self, participant_id: impl Into<String>, endpoint: impl Into<String>) -> Result<(), RegistryError> {
        let handle = ParticipantHandle::new(participant_id, endpoint);
        if self.participants.contains_key(&handle.participant_id) {
            return Err(RegistryError::Duplicate(handle.participant_id));
        }
        self.participants.insert(handle.participant_id.clone(), handle);
        Ok(())
    }

    pub fn deregister(&mut self, participant_id: &str) -> Option<ParticipantHandle> {
        self.participants.remove(participant_id)
    }

    pub fn get(&self, participant_id: &str) -> Option<&ParticipantHandle> {
        self.participants.get(participant_id)
    }

    pub fn set_status(&mut self, participant_id: &str, status: ParticipantStatus) -> Result<(), RegistryError> {
        let handle = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| RegistryError::Unknown(participant_id.to_string()))?;
        if handle.status != status {
            info!(participant_id, from = %handle.status, to = %status, "Participant status changed");
            handle.status = status;
        }
        Ok(())
    }

    /// Leave a participant out of all future rounds
    pub fn exclude(&mut self, participant_id: &str) -> Result<(), RegistryError> {
        self.set_status(participant_id, ParticipantStatus::Excluded)
    }

    /// Copy of every participant, sorted by id
    pub fn snapshot(&self) -> Vec<ParticipantHandle> {
        self.participants.values().cloned().collect()
    }

    /// Copy of every participant rounds may dispatch to, sorted by id
    pub fn dispatchable(&self) -> Vec<ParticipantHandle> {
        self.participants
            .values()
            .filter(|p| p.is_dispatchable())
            .cloned()
            .collect()
    }

    pub fn count_with_status(&self, status: ParticipantStatus) -> usize {
        self.participants.values().filter(|p| p.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Apply one round's outcome
    ///
    /// Participants that returned a partial become ACTIVE, those that never
    /// answered become UNREACHABLE. Participants that answered with an error
    /// are reachable and keep their status. EXCLUDED is never overwritten, and
    /// ids no longer registered are ignored.
    pub fn record_round(&mut self, successful: &[String], failures: &BTreeMap<String, FailureSignal>) {
        let updates = successful
            .iter()
            .map(|id| (id.as_str(), ParticipantStatus::Active))
            .chain(failures.iter().filter_map(|(id, signal)| match signal {
                FailureSignal::Unreachable { .. } => Some((id.as_str(), ParticipantStatus::Unreachable)),
                _ => None,
            }));

        for (id, status) in updates {
            let excluded = self
                .participants
                .get(id)
                .map(|p| p.status == ParticipantStatus::Excluded)
                .unwrap_or(true);
            if !excluded {
                // Presence checked just above.
                let _ = self.set_status(id, status);
            }
        }
    }
}
