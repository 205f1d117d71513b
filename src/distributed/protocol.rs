//! Coordinator/participant wire protocol
//!
//! Messages are serialized with MessagePack (rmp-serde, named fields so that
//! tagged enums such as [`Statistic`](crate::query::Statistic) survive the
//! trip).
//!
//! # Protocol Version
//!
//! Current version: 1
//!
//! # Message Flow
//!
//! One request and one response per connection:
//!
//! ```text
//! Coordinator                     Participant
//!     |                              |
//!     |-------- PROBE -------------->|      (admission)
//!     |<------- PROBE_ACK -----------|
//!
//!     |-------- QUERY -------------->|      (one round)
//!     |<------- PARTIAL -------------|
//!     |    or                        |
//!     |<------- ERROR ---------------|
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack message]
//! ```
//!
//! Frames larger than [`MAX_MESSAGE_SIZE`] are rejected on both ends.

use crate::query::AggregateQueryDefinition;
use crate::stats::PartialAggregate;
use crate::worker::LocalErrorKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Coordinator and participants must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted message body (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Liveness check (Coordinator → Participant)
    Probe(ProbeMessage),

    /// Liveness answer (Participant → Coordinator)
    ProbeAck(ProbeAckMessage),

    /// Compute a partial aggregate (Coordinator → Participant)
    Query(QueryMessage),

    /// Partial aggregate for a round (Participant → Coordinator)
    Partial(PartialMessage),

    /// Request failed (Participant → Coordinator)
    ///
    /// Sent for local execution failures and for malformed or
    /// version-mismatched requests.
    Error(ErrorMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeAckMessage {
    pub protocol_version: u32,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub protocol_version: u32,

    /// Request sequence number, echoed back in the partial
    pub request_id: u64,

    /// Validated on decode
    pub query: AggregateQueryDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialMessage {
    pub request_id: u64,
    pub partial: PartialAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub participant_id: String,

    /// Local execution failure kind; `None` for protocol-level errors
    pub kind: Option<LocalErrorKind>,

    /// Error description
    pub error: String,
}

/// Serialize a message to a length-prefixed frame
///
/// # Message Format
///
/// ```text
/// [4 bytes: message length (little-endian u32)][N bytes: MessagePack message]
/// ```
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec_named(msg).context("Failed to serialize message")?;

    if msg_bytes.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!(
            "Message too large: {} bytes (max {} bytes)",
            msg_bytes.len(),
            MAX_MESSAGE_SIZE
        );
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from a buffer holding at least one frame
///
/// # Returns
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes (max {} bytes)", msg_len, MAX_MESSAGE_SIZE);
    }
    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one complete message from a stream
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes (max {} bytes)", msg_len, MAX_MESSAGE_SIZE);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write one message to a stream and flush it
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    stream.write_all(&framed).await.context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompareOp, FilterPredicate, Literal, Statistic, StatisticKind};
    use crate::stats::GroupKey;
    use rust_decimal::Decimal;

    fn sample_query() -> AggregateQueryDefinition {
        AggregateQueryDefinition::new(
            Statistic::Histogram {
                boundaries: vec![Decimal::from(0), Decimal::from(18), Decimal::from(65)],
            },
            "age",
            Some(FilterPredicate::Compare {
                column: "sex".to_string(),
                op: CompareOp::Eq,
                value: Literal::Text("female".to_string()),
            }),
            vec!["year".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_serialize_deserialize_query() {
        let msg = Message::Query(QueryMessage {
            protocol_version: PROTOCOL_VERSION,
            request_id: 7,
            query: sample_query(),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed) = deserialize_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        assert_eq!(deserialized, msg);
    }

    #[test]
    fn test_serialize_deserialize_error() {
        let msg = Message::Error(ErrorMessage {
            participant_id: "site-b".to_string(),
            kind: Some(LocalErrorKind::SchemaMismatch),
            error: "column 'age' holds non-numeric value 'n/a'".to_string(),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Error(err) => {
                assert_eq!(err.participant_id, "site-b");
                assert_eq!(err.kind, Some(LocalErrorKind::SchemaMismatch));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_message_framing() {
        let msg = Message::Probe(ProbeMessage {
            protocol_version: PROTOCOL_VERSION,
        });
        let bytes = serialize_message(&msg).unwrap();

        assert!(bytes.len() >= 4);
        let msg_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + msg_len);
    }

    #[test]
    fn test_incomplete_frame_rejected() {
        let msg = Message::Probe(ProbeMessage {
            protocol_version: PROTOCOL_VERSION,
        });
        let bytes = serialize_message(&msg).unwrap();
        assert!(deserialize_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_invalid_query_rejected_on_decode() {
        // Hand-built frame carrying an unvalidated, invalid query definition
        #[derive(Serialize)]
        enum RawMessage {
            Query(RawQuery),
        }
        #[derive(Serialize)]
        struct RawQuery {
            protocol_version: u32,
            request_id: u64,
            query: crate::query::QueryDefinitionRepr,
        }

        let raw = RawMessage::Query(RawQuery {
            protocol_version: PROTOCOL_VERSION,
            request_id: 1,
            query: crate::query::QueryDefinitionRepr {
                statistic: Statistic::Count,
                target_column: String::new(),
                filter: None,
                group_by: vec![],
            },
        });
        let body = rmp_serde::to_vec_named(&raw).unwrap();
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);

        assert!(deserialize_message(&frame).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let mut partial = PartialAggregate::new("site-a", StatisticKind::Count);
        partial
            .group_mut(GroupKey::from_values(["2020"]), 0)
            .record_presence()
            .unwrap();
        let msg = Message::Partial(PartialMessage { request_id: 3, partial });

        write_message(&mut client, &msg).await.unwrap();
        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_closed_stream_is_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_message(&mut server).await.is_err());
    }
}
