//! Multiplexed stream state and the handles given out to stream users
//!
//! The session task owns all per-stream bookkeeping (a [`StreamEntry`] per
//! live stream); users hold a [`MuxStream`], which splits into independent
//! read and write halves so each direction can be driven by its own task.

use super::frame::MAX_PAYLOAD;
use super::MuxError;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// Both directions open
    Open,
    /// Local side has stopped sending
    HalfClosedLocal,
    /// Remote side has stopped sending
    HalfClosedRemote,
    /// Both directions closed
    Closed,
}

impl StreamState {
    pub(crate) fn close_local(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub(crate) fn close_remote(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self == StreamState::Closed
    }

    /// The local side may still emit data
    pub(crate) fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// The remote side may still deliver data
    pub(crate) fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// Event delivered from the session task to a stream's read half
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Close,
}

/// Command sent from stream handles (and [`super::Session`]) to the
/// session task
pub(crate) enum Command {
    /// Send payload on a stream. Window credit was already acquired.
    Data { stream_id: u32, data: Bytes },
    /// Close the local direction of a stream
    Close { stream_id: u32 },
    /// A write half was dropped without closing; hard-close the stream
    Drop { stream_id: u32 },
    /// Open a new outbound stream (the symmetric client role)
    Open {
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
}

/// Send-side flow control gate, shared between a stream's write half and
/// the session task. Credit is acquired by the writer before data enters
/// the session channel and restored when the peer sends window updates.
#[derive(Debug)]
pub(crate) struct SendGate {
    state: Mutex<GateState>,
    notify: Notify,
}

#[derive(Debug)]
struct GateState {
    window: u32,
    closed: bool,
}

impl SendGate {
    pub(crate) fn new(window: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                window,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Take up to `want` bytes of credit, waiting for the window to open.
    /// A stream has exactly one writer, so `notify_one` permits suffice.
    async fn acquire(&self, want: u32) -> Result<u32, MuxError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(MuxError::StreamClosed);
                }
                if state.window > 0 {
                    let take = want.min(state.window);
                    state.window -= take;
                    return Ok(take);
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn release(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.window = state.window.saturating_add(n);
        drop(state);
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }
}

/// Session-task-side bookkeeping for one live stream
pub(crate) struct StreamEntry {
    pub(crate) state: StreamState,
    pub(crate) recv_window: u32,
    pub(crate) event_tx: mpsc::Sender<StreamEvent>,
    pub(crate) gate: Arc<SendGate>,
}

impl StreamEntry {
    /// Window credit to hand back once half the initial window is consumed
    pub(crate) fn credit_due(&self, initial: u32) -> Option<u32> {
        if self.recv_window < initial / 2 {
            Some(initial - self.recv_window)
        } else {
            None
        }
    }
}

/// One multiplexed stream.
///
/// Splits into a [`StreamRead`] and a [`StreamWrite`] half; drive them from
/// separate tasks when relaying in both directions.
#[derive(Debug)]
pub struct MuxStream {
    read: StreamRead,
    write: StreamWrite,
}

impl MuxStream {
    pub(crate) fn new(read: StreamRead, write: StreamWrite) -> Self {
        Self { read, write }
    }

    /// Stream ID
    pub fn id(&self) -> u32 {
        self.read.id
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (StreamRead, StreamWrite) {
        (self.read, self.write)
    }

    /// Receive the next chunk; `None` means the remote closed its direction
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.read.recv().await
    }

    /// Send a chunk, waiting for flow control credit
    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        self.write.send(data).await
    }

    /// Close the local direction
    pub async fn close(&mut self) {
        self.write.close().await;
    }
}

/// Receiving half of a stream
#[derive(Debug)]
pub struct StreamRead {
    pub(crate) id: u32,
    pub(crate) event_rx: mpsc::Receiver<StreamEvent>,
    pub(crate) done: bool,
}

impl StreamRead {
    /// Stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next data chunk, or `None` once the remote direction is closed
    /// (or the session is gone).
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        match self.event_rx.recv().await {
            Some(StreamEvent::Data(data)) => Some(data),
            Some(StreamEvent::Close) | None => {
                self.done = true;
                None
            }
        }
    }
}

/// Sending half of a stream
#[derive(Debug)]
pub struct StreamWrite {
    pub(crate) id: u32,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) ctrl_tx: mpsc::UnboundedSender<Command>,
    pub(crate) gate: Arc<SendGate>,
    pub(crate) closed: bool,
}

impl StreamWrite {
    /// Stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send data on this stream, chunking to the frame payload limit and
    /// waiting for flow control credit.
    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        let mut data = data;
        while !data.is_empty() {
            let want = data.len().min(MAX_PAYLOAD) as u32;
            let granted = self.gate.acquire(want).await? as usize;
            let chunk = data.split_to(granted);
            self.cmd_tx
                .send(Command::Data {
                    stream_id: self.id,
                    data: chunk,
                })
                .await
                .map_err(|_| MuxError::SessionClosed)?;
        }
        Ok(())
    }

    /// Close this direction. The remote sees EOF after any in-flight data.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .cmd_tx
            .send(Command::Close { stream_id: self.id })
            .await;
    }
}

impl Drop for StreamWrite {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.ctrl_tx.send(Command::Drop { stream_id: self.id });
        }
    }
}
