//! Wire protocol shared between the relay and a tunnel client.
//!
//! One control-channel WebSocket connection carries two message shapes:
//! JSON [`ControlMessage`]s as text frames, and binary [`StreamFrame`]s
//! tagged by [`Ticket`] that multiplex every in-flight request's reply
//! stream onto that same connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One-use identifier that rendezvous a public request with the tunnel
/// client's reply stream. Wire form is UUID v4 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(Uuid);

impl Ticket {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for Ticket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ticket {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Control messages exchanged as WebSocket text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client -> server: claim a subdomain label.
    #[serde(rename = "createTunnel")]
    CreateTunnel { name: String },
    /// Server -> client: a public request is waiting for a reply stream.
    #[serde(rename = "incomingClient")]
    IncomingClient { ticket: Ticket },
}

/// Opcode for a binary stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamOp {
    /// Carries a chunk of stream payload.
    Data = 0,
    /// Half-closes the sender's side; no more `Data` will follow.
    Eof = 1,
    /// Aborts the stream; the peer should tear down its half too.
    Reset = 2,
}

impl StreamOp {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(StreamOp::Data),
            1 => Ok(StreamOp::Eof),
            2 => Ok(StreamOp::Reset),
            _ => Err(Error::InvalidFrame),
        }
    }
}

/// `opcode(1) + ticket(16)`, payload (if any) follows.
pub const FRAME_HEADER_LEN: usize = 17;

/// A single multiplexed stream frame.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub ticket: Ticket,
    pub op: StreamOp,
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn data(ticket: Ticket, payload: Vec<u8>) -> Self {
        Self { ticket, op: StreamOp::Data, payload }
    }

    pub fn eof(ticket: Ticket) -> Self {
        Self { ticket, op: StreamOp::Eof, payload: Vec::new() }
    }

    pub fn reset(ticket: Ticket) -> Self {
        Self { ticket, op: StreamOp::Reset, payload: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(self.op as u8);
        buf.extend_from_slice(&self.ticket.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(Error::InvalidFrame);
        }
        let op = StreamOp::from_u8(bytes[0])?;
        let mut ticket_bytes = [0u8; 16];
        ticket_bytes.copy_from_slice(&bytes[1..FRAME_HEADER_LEN]);
        let ticket = Ticket::from_bytes(ticket_bytes);
        let payload = bytes[FRAME_HEADER_LEN..].to_vec();
        Ok(Self { ticket, op, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_round_trips_through_text() {
        let t = Ticket::new();
        let parsed: Ticket = t.to_string().parse().unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn ticket_text_form_is_uuid_v4() {
        let t = Ticket::new();
        let parsed = Uuid::parse_str(&t.to_string()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn data_frame_round_trips() {
        let ticket = Ticket::new();
        let frame = StreamFrame::data(ticket, b"hello".to_vec());
        let decoded = StreamFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.ticket, ticket);
        assert_eq!(decoded.op, StreamOp::Data);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn eof_frame_has_no_payload() {
        let ticket = Ticket::new();
        let frame = StreamFrame::eof(ticket);
        let decoded = StreamFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.op, StreamOp::Eof);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(StreamFrame::decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let ticket = Ticket::new();
        let mut bytes = StreamFrame::data(ticket, Vec::new()).encode();
        bytes[0] = 0xFF;
        assert!(StreamFrame::decode(&bytes).is_err());
    }

    #[test]
    fn control_message_json_shape() {
        let msg = ControlMessage::CreateTunnel { name: "alice".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"createTunnel","name":"alice"}"#);
    }
}
