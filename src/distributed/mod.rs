//! Federated execution
//!
//! # Architecture
//!
//! fedstat uses a coordinator-participant architecture:
//!
//! - **Coordinator**: dispatches one query per round to the sampled
//!   participants, collects partial aggregates until the deadline, merges them
//! - **Participant service**: runs at each site, computes partial aggregates
//!   against the local database, never ships row data
//! - **Session**: admission, sampling, and sequential rounds over a shared
//!   participant registry
//!
//! # Modules
//!
//! - `protocol`: message definitions and framing
//! - `transport`: how the coordinator reaches participants (TCP or in-process)
//! - `registry`: participant lifecycle
//! - `coordinator`: the round state machine
//! - `session`: admission, sampling, and multi-query runs
//! - `node_service`: participant service

pub mod coordinator;
pub mod node_service;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use coordinator::{CoordinatorConfig, QuorumNotMetError, RoundCoordinator, RoundError, RoundState};
pub use node_service::ParticipantService;
pub use registry::{ParticipantHandle, ParticipantRegistry, ParticipantStatus, SharedRegistry};
pub use session::{FederationSession, NamedQuery, RoundOutcome, SessionConfig};
pub use transport::{FailureSignal, InProcessTransport, TcpTransport, Transport};
