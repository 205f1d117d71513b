//! Participant service
//!
//! Runs at each participant site. The service:
//! - Listens for connections from the coordinator
//! - Answers probes
//! - Runs the local aggregator for each query, opening the site's database
//!   for that request only
//! - Replies with the partial aggregate or an error
//!
//! Every connection is handled on its own task, so a slow query never blocks
//! probes or other rounds.

use super::protocol::*;
use crate::query::AggregateQueryDefinition;
use crate::worker::{LocalAggregator, LocalSite};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Participant service
pub struct ParticipantService {
    participant_id: String,
    site: LocalSite,
}

impl ParticipantService {
    pub fn new(participant_id: impl Into<String>, site: LocalSite) -> Self {
        Self {
            participant_id: participant_id.into(),
            site,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Bind `0.0.0.0:listen_port` and serve forever
    pub async fn run(self, listen_port: u16) -> Result<()> {
        let addr = format!("0.0.0.0:{}", listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind participant service on {}", addr))?;

        println!("Participant service listening on port {}", listen_port);
        println!("Participant ID: {}", self.participant_id);

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let service = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
            let _ = stream.set_nodelay(true);

            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let mut stream = stream;
                if let Err(e) = service.handle_connection(&mut stream, peer).await {
                    warn!(peer = %peer, error = %format!("{:#}", e), "Connection failed");
                }
            });
        }
    }

    /// Handle one request/response exchange
    pub async fn handle_connection<S>(&self, stream: &mut S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match read_message(stream).await {
            Ok(msg) => msg,
            Err(e) => {
                // Undecodable request (bad frame or invalid query): tell the
                // coordinator why before hanging up.
                let reply = self.protocol_error(format!("{:#}", e));
                // Best effort: the peer may already be gone.
                let _ = write_message(stream, &reply).await;
                return Err(e);
            }
        };

        let reply = match request {
            Message::Probe(probe) => {
                debug!(peer = %peer, "Probe");
                if probe.protocol_version != PROTOCOL_VERSION {
                    self.version_mismatch(probe.protocol_version)
                } else {
                    Message::ProbeAck(ProbeAckMessage {
                        protocol_version: PROTOCOL_VERSION,
                        participant_id: self.participant_id.clone(),
                    })
                }
            }
            Message::Query(query) => {
                if query.protocol_version != PROTOCOL_VERSION {
                    self.version_mismatch(query.protocol_version)
                } else {
                    self.answer_query(query.request_id, &query.query).await
                }
            }
            other => self.protocol_error(format!("unexpected request: {:?}", other)),
        };

        write_message(stream, &reply).await
    }

    async fn answer_query(&self, request_id: u64, query: &AggregateQueryDefinition) -> Message {
        info!(participant_id = %self.participant_id, request_id, query = %query, "Computing partial aggregate");

        match LocalAggregator::new(self.participant_id.clone())
            .compute_at(query, &self.site)
            .await
        {
            Ok(partial) => {
                debug!(request_id, groups = partial.groups.len(), "Partial aggregate ready");
                Message::Partial(PartialMessage { request_id, partial })
            }
            Err(e) => {
                warn!(participant_id = %self.participant_id, request_id, error = %e, "Local execution failed");
                Message::Error(ErrorMessage {
                    participant_id: self.participant_id.clone(),
                    kind: Some(e.kind()),
                    error: e.to_string(),
                })
            }
        }
    }

    fn version_mismatch(&self, theirs: u32) -> Message {
        self.protocol_error(format!(
            "Protocol version mismatch: coordinator={}, participant={}",
            theirs, PROTOCOL_VERSION
        ))
    }

    fn protocol_error(&self, error: String) -> Message {
        Message::Error(ErrorMessage {
            participant_id: self.participant_id.clone(),
            kind: None,
            error,
        })
    }
}

/// Default participant id: the host name
pub fn default_participant_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
