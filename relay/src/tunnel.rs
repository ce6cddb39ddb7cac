//! `ClientConn` (spec §3): one accepted tunnel client's control connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use rtunnel_shared::protocol::{ControlMessage, StreamFrame, StreamOp, Ticket};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::control::{StreamEvent, TunnelStream};
use crate::error::RelayError;

/// Outbound WebSocket payload: either a control-message text frame or a
/// raw stream binary frame, both funneled through the one connection's
/// single writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Control(ControlMessage),
    Stream(StreamFrame),
}

/// Bound on how many inbound byte chunks a single stream buffers before
/// the reader loop has to wait for the consumer to catch up (spec §4.3
/// backpressure requirement).
const STREAM_BUFFER: usize = 64;

/// A tunnel client's persistent control connection.
pub struct ClientHandle {
    id: u64,
    claimed: Mutex<Option<String>>,
    outbound: mpsc::Sender<OutboundFrame>,
    pending: DashMap<Ticket, oneshot::Sender<TunnelStream>>,
    streams: DashMap<Ticket, mpsc::Sender<StreamEvent>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientHandle {
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            claimed: Mutex::new(None),
            outbound,
            pending: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn claimed_name(&self) -> Option<String> {
        self.claimed.lock().unwrap().clone()
    }

    /// Records a claim. Returns `false` if this connection already holds
    /// one (the caller should silently ignore a repeated `createTunnel`
    /// per spec §4.2/§4.6).
    pub fn set_claimed(&self, name: String) -> bool {
        let mut slot = self.claimed.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(name);
        true
    }

    /// Emits a named event to the client (the `emit` operation of C3).
    pub async fn emit(&self, msg: ControlMessage) -> Result<(), RelayError> {
        self.outbound
            .send(OutboundFrame::Control(msg))
            .await
            .map_err(|_| RelayError::Transport("client writer closed".into()))
    }

    /// Registers a one-shot acceptor for `ticket` (the `once` operation of
    /// C3). Dropping the returned receiver without it firing cancels the
    /// rendezvous cleanly — nothing else needs to know.
    pub fn once(&self, ticket: Ticket) -> oneshot::Receiver<TunnelStream> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(ticket, tx);
        rx
    }

    /// Cancels a pending acceptor that nobody answered (e.g. the public
    /// caller disconnected before the tunnel client opened the stream).
    pub fn cancel(&self, ticket: &Ticket) {
        self.pending.remove(ticket);
    }

    fn sender(&self) -> mpsc::Sender<OutboundFrame> {
        self.outbound.clone()
    }

    /// Dispatches one inbound stream frame read off the wire (spec §4.3
    /// tagged rendezvous + ordering). `await`s the feed into the stream's
    /// channel so a lagging consumer applies real backpressure onto this
    /// connection's single reader loop rather than silently losing bytes
    /// once the per-stream buffer fills (spec §4.3/§8).
    pub async fn dispatch_frame(&self, frame: StreamFrame) {
        if let Some((_, tx)) = self.pending.remove(&frame.ticket) {
            let (stream, inbound_tx) =
                TunnelStream::new(frame.ticket, self.sender(), STREAM_BUFFER);
            self.streams.insert(frame.ticket, inbound_tx.clone());
            feed(&inbound_tx, frame.op, frame.payload).await;
            if tx.send(stream).is_err() {
                // Acceptor was cancelled between frame arrival and send;
                // tear the half-open stream back down immediately.
                self.streams.remove(&frame.ticket);
            }
            return;
        }

        // Clone the sender and drop the map entry before awaiting: holding
        // a `DashMap` shard guard across an await point would block any
        // other ticket hashed into the same shard for as long as this send
        // is stalled on backpressure.
        let sender = self.streams.get(&frame.ticket).map(|entry| entry.value().clone());
        if let Some(tx) = sender {
            feed(&tx, frame.op, frame.payload).await;
            return;
        }

        warn!(ticket = %frame.ticket, "stream frame for unknown ticket, dropping");
    }

    /// Called once a stream's owning request is done with it, so the
    /// dispatch table does not grow without bound.
    pub fn forget_stream(&self, ticket: &Ticket) {
        self.streams.remove(ticket);
    }

    /// Transport failure or disconnect: every open stream and every
    /// pending acceptor on this connection is destroyed (spec §4.3
    /// failure requirement, §5 resource cleanup).
    pub fn fail_all(&self) {
        for entry in self.streams.iter() {
            let _ = entry.value().try_send(StreamEvent::Reset);
        }
        self.streams.clear();
        self.pending.clear();
    }
}

async fn feed(tx: &mpsc::Sender<StreamEvent>, op: StreamOp, payload: Vec<u8>) {
    let event = match op {
        StreamOp::Data => StreamEvent::Data(payload),
        StreamOp::Eof => StreamEvent::Eof,
        StreamOp::Reset => StreamEvent::Reset,
    };
    // Waits for room in the bounded channel rather than dropping on a full
    // buffer: a lagging consumer throttles this connection's reader loop
    // (spec §4.3 backpressure) instead of corrupting the stream. If the
    // consumer is gone the send fails immediately rather than blocking —
    // the stream is already torn down, so there is nothing left to feed.
    let _ = tx.send(event).await;
}
