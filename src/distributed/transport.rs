//! Transport shim
//!
//! The round coordinator talks to participants only through the narrow
//! [`Transport`] trait: send a query, get a partial aggregate or a
//! [`FailureSignal`] back. Both calls are cancel-safe; dropping the future
//! abandons the request.
//!
//! # Implementations
//!
//! - [`TcpTransport`]: one TCP connection per request, framed with
//!   [`protocol`](super::protocol)
//! - [`InProcessTransport`]: runs the local aggregator in this process
//!   against each participant's [`LocalSite`]

use super::protocol::*;
use super::registry::ParticipantHandle;
use crate::query::AggregateQueryDefinition;
use crate::stats::PartialAggregate;
use crate::worker::{LocalAggregator, LocalErrorKind, LocalExecutionError, LocalSite};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Why a participant did not contribute to a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureSignal {
    /// No answer: connection refused or dropped, or the round deadline passed
    Unreachable { detail: String },

    /// The participant answered with a local execution failure
    LocalExecution { kind: LocalErrorKind, message: String },

    /// The participant answered with something that breaks the protocol
    Protocol { message: String },
}

impl FailureSignal {
    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::Unreachable { detail: detail.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }
}

impl From<LocalExecutionError> for FailureSignal {
    fn from(err: LocalExecutionError) -> Self {
        Self::LocalExecution {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { detail } => write!(f, "unreachable: {}", detail),
            Self::LocalExecution { kind, message } => write!(f, "local execution failed ({}): {}", kind, message),
            Self::Protocol { message } => write!(f, "protocol error: {}", message),
        }
    }
}

/// Request/response channel to participants
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask a participant for its partial aggregate
    async fn send(
        &self,
        participant: &ParticipantHandle,
        query: &AggregateQueryDefinition,
    ) -> Result<PartialAggregate, FailureSignal>;

    /// Check that a participant is up and speaks our protocol version
    async fn probe(&self, participant: &ParticipantHandle) -> Result<(), FailureSignal>;
}

/// Classify a framing error: I/O means the peer is gone, anything else is a
/// protocol violation
fn classify(err: anyhow::Error) -> FailureSignal {
    let detail = format!("{:#}", err);
    if err.chain().any(|cause| cause.is::<std::io::Error>()) {
        FailureSignal::Unreachable { detail }
    } else {
        FailureSignal::Protocol { message: detail }
    }
}

/// Check a reply came from the participant we asked
fn check_participant(expected: &ParticipantHandle, found: &str) -> Result<(), FailureSignal> {
    if found == expected.participant_id {
        Ok(())
    } else {
        Err(FailureSignal::protocol(format!(
            "expected an answer from '{}', got one from '{}'",
            expected.participant_id, found
        )))
    }
}

/// TCP transport
pub struct TcpTransport {
    connect_timeout: Duration,
    next_request_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            next_request_id: AtomicU64::new(1),
        }
    }

    async fn connect(&self, participant: &ParticipantHandle) -> Result<TcpStream, FailureSignal> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&participant.endpoint)).await {
            Ok(Ok(stream)) => {
                // Ignored: only affects latency, not correctness.
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(FailureSignal::unreachable(format!(
                "failed to connect to {}: {}",
                participant.endpoint, e
            ))),
            Err(_) => Err(FailureSignal::unreachable(format!(
                "connect to {} timed out after {:?}",
                participant.endpoint, self.connect_timeout
            ))),
        }
    }

    /// One request, one response
    async fn exchange(&self, participant: &ParticipantHandle, request: &Message) -> Result<Message, FailureSignal> {
        let mut stream = self.connect(participant).await?;
        write_message(&mut stream, request).await.map_err(classify)?;
        read_message(&mut stream).await.map_err(classify)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Map an `Error` reply to a failure signal
fn error_reply(participant: &ParticipantHandle, err: ErrorMessage) -> FailureSignal {
    if let Err(signal) = check_participant(participant, &err.participant_id) {
        return signal;
    }
    match err.kind {
        Some(kind) => FailureSignal::LocalExecution {
            kind,
            message: err.error,
        },
        None => FailureSignal::protocol(err.error),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        participant: &ParticipantHandle,
        query: &AggregateQueryDefinition,
    ) -> Result<PartialAggregate, FailureSignal> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Message::Query(QueryMessage {
            protocol_version: PROTOCOL_VERSION,
            request_id,
            query: query.clone(),
        });

        debug!(participant_id = %participant.participant_id, request_id, "Sending query");

        match self.exchange(participant, &request).await? {
            Message::Partial(reply) => {
                if reply.request_id != request_id {
                    return Err(FailureSignal::protocol(format!(
                        "reply for request {} while waiting for {}",
                        reply.request_id, request_id
                    )));
                }
                check_participant(participant, &reply.partial.participant_id)?;
                Ok(reply.partial)
            }
            Message::Error(err) => Err(error_reply(participant, err)),
            other => Err(FailureSignal::protocol(format!("unexpected reply to query: {:?}", other))),
        }
    }

    async fn probe(&self, participant: &ParticipantHandle) -> Result<(), FailureSignal> {
        let request = Message::Probe(ProbeMessage {
            protocol_version: PROTOCOL_VERSION,
        });

        match self.exchange(participant, &request).await? {
            Message::ProbeAck(ack) => {
                check_participant(participant, &ack.participant_id)?;
                if ack.protocol_version != PROTOCOL_VERSION {
                    return Err(FailureSignal::protocol(format!(
                        "protocol version mismatch: coordinator={}, participant={}",
                        PROTOCOL_VERSION, ack.protocol_version
                    )));
                }
                Ok(())
            }
            Message::Error(err) => Err(error_reply(participant, err)),
            other => Err(FailureSignal::protocol(format!("unexpected reply to probe: {:?}", other))),
        }
    }
}

/// Runs every participant's local aggregator in this process
///
/// Used by `fedstat local` and by tests. A participant without a registered
/// site is unreachable.
#[derive(Debug, Default, Clone)]
pub struct InProcessTransport {
    sites: HashMap<String, LocalSite>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, participant_id: impl Into<String>, site: LocalSite) -> Self {
        self.add_site(participant_id, site);
        self
    }

    pub fn add_site(&mut self, participant_id: impl Into<String>, site: LocalSite) {
        self.sites.insert(participant_id.into(), site);
    }

    fn site(&self, participant: &ParticipantHandle) -> Result<&LocalSite, FailureSignal> {
        self.sites.get(&participant.participant_id).ok_or_else(|| {
            FailureSignal::unreachable(format!(
                "no local site for participant '{}'",
                participant.participant_id
            ))
        })
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(
        &self,
        participant: &ParticipantHandle,
        query: &AggregateQueryDefinition,
    ) -> Result<PartialAggregate, FailureSignal> {
        let site = self.site(participant)?;
        LocalAggregator::new(participant.participant_id.clone())
            .compute_at(query, site)
            .await
            .map_err(FailureSignal::from)
    }

    async fn probe(&self, participant: &ParticipantHandle) -> Result<(), FailureSignal> {
        self.site(participant).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MemoryTable;
    use crate::query::Statistic;
    use crate::stats::GroupKey;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn count_query() -> AggregateQueryDefinition {
        AggregateQueryDefinition::new(Statistic::Count, "id", None, vec![]).unwrap()
    }

    fn memory_site(rows: i64) -> LocalSite {
        let mut table = MemoryTable::new(["id"]);
        for i in 0..rows {
            table.push_row(vec![i.into()]);
        }
        LocalSite::Handle(Arc::new(table))
    }

    #[tokio::test]
    async fn test_in_process_send() {
        let transport = InProcessTransport::new().with_site("a", memory_site(3));
        let partial = transport
            .send(&ParticipantHandle::new("a", "local"), &count_query())
            .await
            .unwrap();
        assert_eq!(partial.participant_id, "a");
        assert_eq!(partial.groups[&GroupKey::all()].count, 3);
    }

    #[tokio::test]
    async fn test_in_process_unknown_site_is_unreachable() {
        let transport = InProcessTransport::new();
        let handle = ParticipantHandle::new("ghost", "local");
        assert!(matches!(
            transport.probe(&handle).await,
            Err(FailureSignal::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_process_local_failure() {
        let table = MemoryTable::new(["id"]).failing(LocalExecutionError::ConnectionLost("db down".to_string()));
        let transport = InProcessTransport::new().with_site("a", LocalSite::Handle(Arc::new(table)));

        let err = transport
            .send(&ParticipantHandle::new("a", "local"), &count_query())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FailureSignal::LocalExecution {
                kind: LocalErrorKind::ConnectionLost,
                message: "connection lost: db down".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_tcp_refused_is_unreachable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(1));
        let err = transport
            .probe(&ParticipantHandle::new("a", addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, FailureSignal::Unreachable { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_tcp_wrong_participant_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await.unwrap();
            let ack = Message::ProbeAck(ProbeAckMessage {
                protocol_version: PROTOCOL_VERSION,
                participant_id: "impostor".to_string(),
            });
            write_message(&mut stream, &ack).await.unwrap();
        });

        let transport = TcpTransport::default();
        let err = transport
            .probe(&ParticipantHandle::new("a", addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, FailureSignal::Protocol { .. }), "{:?}", err);
    }

    #[test]
    fn test_failure_signal_json_shape() {
        let signal = FailureSignal::LocalExecution {
            kind: LocalErrorKind::SchemaMismatch,
            message: "bad".to_string(),
        };
        let json = serde_json::to_string(&signal).unwrap();
        assert_eq!(
            json,
            r#"{"type":"local_execution","kind":"schema_mismatch","message":"bad"}"#
        );
    }
}
