//! Control channel (spec §4.3/§4.6, components C3/C6): one `axum` WebSocket
//! per tunnel client, carrying JSON control frames and binary stream frames
//! multiplexed by ticket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use rtunnel_shared::protocol::{ControlMessage, StreamFrame, Ticket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::tunnel::{ClientHandle, OutboundFrame};
use crate::RelayState;

/// Events fed into an open [`TunnelStream`] as frames for its ticket arrive
/// off the wire.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Eof,
    Reset,
}

/// Bound on how many outbound bytes are queued for the tunnel client's
/// writer task before a sender has to wait (spec §4.3 backpressure).
const WRITE_BUFFER: usize = 64;

/// One rendezvous-established byte stream, multiplexed over its owning
/// [`ClientHandle`]'s WebSocket. Exposes manual async methods rather than
/// `AsyncRead`/`AsyncWrite` — the same shape `h2`'s per-request
/// `SendStream`/`RecvStream` use for a channel-backed, frame-multiplexed
/// transport.
pub struct TunnelStream {
    ticket: Ticket,
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Receiver<StreamEvent>,
    eof: bool,
}

impl TunnelStream {
    /// Returns the stream and the sender its owning `ClientHandle` uses to
    /// feed it frames as they arrive off the wire.
    pub fn new(
        ticket: Ticket,
        outbound: mpsc::Sender<OutboundFrame>,
        buffer: usize,
    ) -> (Self, mpsc::Sender<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                ticket,
                outbound,
                inbound: rx,
                eof: false,
            },
            tx,
        )
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Writes one chunk toward the tunnel client. A no-op for an empty
    /// slice so callers can pass along whatever a read produced without
    /// special-casing zero-length reads.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), RelayError> {
        if data.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(OutboundFrame::Stream(StreamFrame::data(
                self.ticket,
                data.to_vec(),
            )))
            .await
            .map_err(|_| RelayError::Stream("tunnel client writer closed".into()))
    }

    /// Half-closes this stream's write side.
    pub async fn write_eof(&self) -> Result<(), RelayError> {
        self.outbound
            .send(OutboundFrame::Stream(StreamFrame::eof(self.ticket)))
            .await
            .map_err(|_| RelayError::Stream("tunnel client writer closed".into()))
    }

    /// Reads the next chunk from the tunnel client. `Ok(None)` means the
    /// stream reached EOF (clean half-close or the connection going away);
    /// `Err` means the tunnel client reset it.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if self.eof {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(StreamEvent::Data(data)) => Ok(Some(data)),
            Some(StreamEvent::Eof) | None => {
                self.eof = true;
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.eof = true;
                Err(RelayError::Stream("reset by tunnel client".into()))
            }
        }
    }

    /// Reads the whole stream to completion and returns the concatenated
    /// body — used by the forwarder (C4), which always needs the full
    /// reply before it can answer the public caller.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, RelayError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }
}

/// `GET /tunnel`: upgrades to the control-channel WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(WRITE_BUFFER);
    let client = Arc::new(ClientHandle::new(outbound_tx));

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let msg = match frame {
                OutboundFrame::Control(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => Message::Text(json.into()),
                    Err(err) => {
                        warn!(%err, "failed to encode control message");
                        continue;
                    }
                },
                OutboundFrame::Stream(frame) => Message::Binary(frame.encode().into()),
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                if !handle_control_message(&text, &client, &state).await {
                    break;
                }
            }
            Message::Binary(data) => match StreamFrame::decode(&data) {
                Ok(frame) => client.dispatch_frame(frame).await,
                Err(err) => warn!(%err, "malformed stream frame, dropping"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    writer.abort();
    client.fail_all();
    if let Some(name) = client.claimed_name() {
        state.registry.release(&client);
        state.metrics.tunnel_closed();
        info!(%name, "{name} unregistered");
    }
}

/// Returns `false` if the connection must be torn down after this message
/// (spec §4.6's "disconnecting client" outcomes).
async fn handle_control_message(text: &str, client: &Arc<ClientHandle>, state: &RelayState) -> bool {
    let msg: ControlMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "malformed control message, ignoring");
            return true;
        }
    };

    match msg {
        ControlMessage::CreateTunnel { name } => {
            // A connection that already claimed a name keeps it silently
            // (spec §4.2/§4.6) — nothing to log, nothing to re-claim.
            if client.claimed_name().is_some() {
                return true;
            }
            match state.registry.claim(client, &name) {
                Ok(claimed) => {
                    state.metrics.tunnel_opened();
                    info!(name = %claimed, "{claimed} registered successfully");
                    true
                }
                Err(crate::registry::ClaimError::BadName) => {
                    warn!(%name, "{name} -- bad subdomain. disconnecting client.");
                    false
                }
                Err(crate::registry::ClaimError::Taken) => {
                    warn!(%name, "{name} requested but already claimed. disconnecting client.");
                    false
                }
            }
        }
        // The server never receives `incomingClient` — it only ever sends
        // it — so an inbound one is a protocol violation from the client.
        ControlMessage::IncomingClient { .. } => {
            warn!("unexpected incomingClient from tunnel client, ignoring");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ClientHandle;
    use rtunnel_shared::protocol::StreamFrame;

    fn handle() -> (Arc<ClientHandle>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(ClientHandle::new(tx)), rx)
    }

    #[tokio::test]
    async fn ticket_round_trips_through_dispatched_stream() {
        let (client, _outbound_rx) = handle();
        let ticket = Ticket::new();
        let acceptor = client.once(ticket);

        client.dispatch_frame(StreamFrame::data(ticket, b"hello".to_vec())).await;

        let mut stream = acceptor.await.expect("acceptor fires on first frame");
        assert_eq!(stream.read_chunk().await.unwrap(), Some(b"hello".to_vec()));

        client.dispatch_frame(StreamFrame::eof(ticket)).await;
        assert_eq!(stream.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frames_for_one_ticket_arrive_in_order() {
        let (client, _outbound_rx) = handle();
        let ticket = Ticket::new();
        let acceptor = client.once(ticket);

        client.dispatch_frame(StreamFrame::data(ticket, b"a".to_vec())).await;
        client.dispatch_frame(StreamFrame::data(ticket, b"b".to_vec())).await;
        client.dispatch_frame(StreamFrame::data(ticket, b"c".to_vec())).await;

        let mut stream = acceptor.await.unwrap();
        assert_eq!(stream.read_chunk().await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(stream.read_chunk().await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(stream.read_chunk().await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn frame_for_unknown_ticket_is_dropped_not_panicked() {
        let (client, _outbound_rx) = handle();
        client.dispatch_frame(StreamFrame::data(Ticket::new(), b"ghost".to_vec())).await;
        // No acceptor was registered; dispatch_frame must simply drop this
        // rather than panicking or creating an orphan stream.
    }

    #[tokio::test]
    async fn reset_surfaces_as_stream_error() {
        let (client, _outbound_rx) = handle();
        let ticket = Ticket::new();
        let acceptor = client.once(ticket);

        client.dispatch_frame(StreamFrame::reset(ticket)).await;

        let mut stream = acceptor.await.unwrap();
        assert!(stream.read_chunk().await.is_err());
    }

    #[tokio::test]
    async fn write_all_emits_a_data_frame() {
        let (client, mut outbound_rx) = handle();
        let ticket = Ticket::new();
        let acceptor = client.once(ticket);
        client.dispatch_frame(StreamFrame::data(ticket, b"x".to_vec())).await;
        let stream = acceptor.await.unwrap();

        stream.write_all(b"reply").await.unwrap();

        match outbound_rx.recv().await.unwrap() {
            OutboundFrame::Stream(frame) => {
                assert_eq!(frame.ticket, ticket);
                assert_eq!(frame.payload, b"reply");
            }
            OutboundFrame::Control(_) => panic!("expected a stream frame"),
        }
    }
}
