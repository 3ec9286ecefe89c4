//! Multiplexed session over a single transport
//!
//! A [`Session`] spawns two tasks: a reader that decodes frames off the
//! transport, and the session task that owns the write half and all stream
//! state. Stream handles talk to the session task over channels; every
//! write to the transport is serialized through the session task.

use super::frame::{Frame, FrameType};
use super::stream::{
    Command, MuxStream, SendGate, StreamEntry, StreamEvent, StreamRead, StreamState, StreamWrite,
};
use super::{MuxConfig, MuxError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Accepts peer-opened streams; allocates even IDs
    Server,
    /// Opens streams; allocates odd IDs
    Client,
}

/// Message from the reader task
enum Inbound {
    Frame(Frame),
    /// Clean EOF from the peer
    Closed,
    Failed(std::io::Error),
    Corrupt(MuxError),
}

/// One live multiplexed session.
pub struct Session {
    accept_rx: mpsc::Receiver<MuxStream>,
    ctrl_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    death: Arc<Mutex<Option<MuxError>>>,
}

impl Session {
    /// Run the accepting side of the session (the agent's role).
    pub fn server<S>(io: S, cfg: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(io, cfg, Role::Server)
    }

    /// Run the opening side of the session (the gateway's role).
    pub fn client<S>(io: S, cfg: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(io, cfg, Role::Client)
    }

    /// Wait for the peer to open a stream.
    ///
    /// Errors are session-fatal: the transport died, a keep-alive lapsed,
    /// the peer said GoAway, or the session was closed locally.
    pub async fn accept(&mut self) -> Result<MuxStream, MuxError> {
        match self.accept_rx.recv().await {
            Some(stream) => Ok(stream),
            None => Err(self
                .death
                .lock()
                .unwrap()
                .take()
                .unwrap_or(MuxError::SessionClosed)),
        }
    }

    /// Open a stream to the peer.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        let (reply, reply_rx) = oneshot::channel();
        self.ctrl_tx
            .send(Command::Open { reply })
            .map_err(|_| MuxError::SessionClosed)?;
        reply_rx.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// End the session: streams are torn down, a GoAway is sent, and the
    /// transport is dropped.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn spawn<S>(io: S, cfg: MuxConfig, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let shutdown = CancellationToken::new();

        let (frames_tx, frames_rx) = mpsc::channel(64);
        tokio::spawn(read_frames(read_half, frames_tx, shutdown.clone()));

        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_backlog);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let death = Arc::new(Mutex::new(None));

        let task = SessionTask {
            writer: BufWriter::new(write_half),
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            role,
            streams: HashMap::new(),
            accept_tx,
            cmd_tx,
            ctrl_tx: ctrl_tx.clone(),
            shutdown: shutdown.clone(),
            last_recv: Instant::now(),
            ping_seq: 0,
            dirty: false,
            cfg,
        };

        let reason = Arc::clone(&death);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = task.run(frames_rx, cmd_rx, ctrl_rx, token.clone()).await {
                trace!("session ended: {}", e);
                *reason.lock().unwrap() = Some(e);
            }
            // Whatever ended the session, make sure the reader lets go of
            // the transport too.
            token.cancel();
        });

        Self {
            accept_rx,
            ctrl_tx,
            shutdown,
            task: Some(handle),
            death,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_frames<R>(mut reader: R, tx: mpsc::Sender<Inbound>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(32 * 1024);
    loop {
        match Frame::decode(&mut buf) {
            Ok(Some(frame)) => {
                if tx.send(Inbound::Frame(frame)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Inbound::Corrupt(e)).await;
                return;
            }
        }

        buf.reserve(8 * 1024);
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                let _ = tx.send(Inbound::Closed).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Inbound::Failed(e)).await;
                return;
            }
        }
    }
}

struct SessionTask<S> {
    writer: BufWriter<WriteHalf<S>>,
    role: Role,
    next_stream_id: u32,
    streams: HashMap<u32, StreamEntry>,
    accept_tx: mpsc::Sender<MuxStream>,
    cmd_tx: mpsc::Sender<Command>,
    ctrl_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    last_recv: Instant,
    ping_seq: u64,
    dirty: bool,
    cfg: MuxConfig,
}

impl<S> SessionTask<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(
        mut self,
        mut frames_rx: mpsc::Receiver<Inbound>,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut ctrl_rx: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Result<(), MuxError> {
        let mut keepalive = tokio::time::interval(self.cfg.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                inbound = frames_rx.recv() => {
                    self.last_recv = Instant::now();
                    match inbound {
                        Some(Inbound::Frame(frame)) => {
                            if let Err(e) = self.handle_frame(frame).await {
                                break Err(e);
                            }
                        }
                        Some(Inbound::Closed) | None => break Err(MuxError::ConnectionClosed),
                        Some(Inbound::Failed(e)) => break Err(MuxError::Io(e)),
                        Some(Inbound::Corrupt(e)) => break Err(e),
                    }
                }

                Some(cmd) = ctrl_rx.recv() => {
                    if let Err(e) = self.handle_command(cmd).await {
                        break Err(e);
                    }
                }

                Some(cmd) = cmd_rx.recv() => {
                    if let Err(e) = self.handle_command(cmd).await {
                        break Err(e);
                    }
                }

                _ = keepalive.tick() => {
                    if self.last_recv.elapsed() > self.cfg.keepalive_timeout {
                        break Err(MuxError::KeepAliveTimeout);
                    }
                    let seq = self.ping_seq;
                    self.ping_seq += 1;
                    if let Err(e) = self.write_frame(&Frame::ping(seq)).await {
                        break Err(e);
                    }
                }
            }

            if self.dirty {
                if let Err(e) = self.writer.flush().await {
                    break Err(MuxError::Io(e));
                }
                self.dirty = false;
            }
        };

        // Unblock every stream handle, then tell the peer we are done.
        // Best effort with a short cap: the transport may already be gone.
        for (_, entry) in self.streams.drain() {
            entry.gate.close();
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            let _ = self.writer.write_all(&Frame::go_away().encode()).await;
            let _ = self.writer.flush().await;
        })
        .await;

        result
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        trace!(
            "recv frame {:?} stream {} ({} bytes)",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        match frame.frame_type {
            FrameType::Open => self.handle_open(frame.stream_id).await,
            FrameType::Data => self.handle_data(frame.stream_id, frame.payload).await,
            FrameType::Close => self.handle_close(frame.stream_id).await,
            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if let Some(entry) = self.streams.get(&frame.stream_id) {
                    entry.gate.release(increment);
                }
                Ok(())
            }
            FrameType::Ping => self.write_frame(&Frame::pong(frame.payload)).await,
            FrameType::Pong => Ok(()),
            FrameType::GoAway => Err(MuxError::RemoteGoAway),
        }
    }

    async fn handle_open(&mut self, stream_id: u32) -> Result<(), MuxError> {
        let peer_parity = match self.role {
            Role::Server => 1,
            Role::Client => 0,
        };
        if stream_id % 2 != peer_parity {
            return Err(MuxError::InvalidFrame(format!(
                "peer opened stream {} with our id parity",
                stream_id
            )));
        }
        if self.streams.contains_key(&stream_id) {
            return Err(MuxError::InvalidFrame(format!(
                "stream id {} reused",
                stream_id
            )));
        }

        let stream = self.register(stream_id);
        // The acceptor may already be gone when the session is shutting
        // down; never block past cancellation.
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(MuxError::SessionClosed),
            sent = self.accept_tx.send(stream) => sent.map_err(|_| MuxError::SessionClosed),
        }
    }

    async fn handle_data(&mut self, stream_id: u32, payload: Bytes) -> Result<(), MuxError> {
        enum Verdict {
            Stale,
            Ignored,
            Overrun,
            HandleGone,
            Delivered(Option<u32>),
        }

        let initial = self.cfg.window;
        let len = payload.len() as u32;
        let verdict = match self.streams.get_mut(&stream_id) {
            None => Verdict::Stale,
            Some(entry) if !entry.state.can_recv() => Verdict::Ignored,
            Some(entry) if len > entry.recv_window => Verdict::Overrun,
            Some(entry) => {
                entry.recv_window -= len;
                let delivered = tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    sent = entry.event_tx.send(StreamEvent::Data(payload)) => Some(sent.is_ok()),
                };
                match delivered {
                    // Session is ending; the data has nowhere to go
                    None => Verdict::Ignored,
                    Some(false) => Verdict::HandleGone,
                    Some(true) => {
                        let credit = entry.credit_due(initial);
                        if let Some(increment) = credit {
                            entry.recv_window += increment;
                        }
                        Verdict::Delivered(credit)
                    }
                }
            }
        };

        match verdict {
            // Data for a stream we already forgot: remind the peer.
            Verdict::Stale => self.write_frame(&Frame::close(stream_id)).await,
            Verdict::Ignored => Ok(()),
            Verdict::Overrun => {
                warn!("stream {} overran its receive window", stream_id);
                self.hard_close(stream_id).await
            }
            Verdict::HandleGone => {
                trace!("stream {} handler gone, closing", stream_id);
                self.hard_close(stream_id).await
            }
            Verdict::Delivered(Some(increment)) => {
                self.write_frame(&Frame::window_update(stream_id, increment))
                    .await
            }
            Verdict::Delivered(None) => Ok(()),
        }
    }

    async fn handle_close(&mut self, stream_id: u32) -> Result<(), MuxError> {
        let remove = match self.streams.get_mut(&stream_id) {
            None => return Ok(()),
            Some(entry) => {
                entry.state.close_remote();
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = entry.event_tx.send(StreamEvent::Close) => {}
                }
                entry.state.is_closed()
            }
        };
        if remove {
            if let Some(entry) = self.streams.remove(&stream_id) {
                entry.gate.close();
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), MuxError> {
        match cmd {
            Command::Data { stream_id, data } => {
                let sendable = self
                    .streams
                    .get(&stream_id)
                    .map(|e| e.state.can_send())
                    .unwrap_or(false);
                if sendable {
                    self.write_frame(&Frame::data(stream_id, data)).await
                } else {
                    Ok(())
                }
            }
            Command::Close { stream_id } => {
                let remove = match self.streams.get_mut(&stream_id) {
                    None => return Ok(()),
                    Some(entry) => {
                        if !entry.state.can_send() {
                            return Ok(());
                        }
                        entry.state.close_local();
                        entry.gate.close();
                        entry.state.is_closed()
                    }
                };
                self.write_frame(&Frame::close(stream_id)).await?;
                if remove {
                    self.streams.remove(&stream_id);
                }
                Ok(())
            }
            Command::Drop { stream_id } => {
                let send_close = self
                    .streams
                    .get(&stream_id)
                    .map(|e| e.state.can_send())
                    .unwrap_or(false);
                if let Some(entry) = self.streams.remove(&stream_id) {
                    entry.gate.close();
                }
                if send_close {
                    self.write_frame(&Frame::close(stream_id)).await?;
                }
                Ok(())
            }
            Command::Open { reply } => {
                let stream_id = self.next_stream_id;
                self.next_stream_id += 2;
                let stream = self.register(stream_id);
                self.write_frame(&Frame::open(stream_id)).await?;
                let _ = reply.send(Ok(stream));
                Ok(())
            }
        }
    }

    fn register(&mut self, stream_id: u32) -> MuxStream {
        let (event_tx, event_rx) = mpsc::channel(64);
        let gate = SendGate::new(self.cfg.window);
        self.streams.insert(
            stream_id,
            StreamEntry {
                state: StreamState::Open,
                recv_window: self.cfg.window,
                event_tx,
                gate: Arc::clone(&gate),
            },
        );

        MuxStream::new(
            StreamRead {
                id: stream_id,
                event_rx,
                done: false,
            },
            StreamWrite {
                id: stream_id,
                cmd_tx: self.cmd_tx.clone(),
                ctrl_tx: self.ctrl_tx.clone(),
                gate,
                closed: false,
            },
        )
    }

    /// Drop a stream entirely and tell the peer.
    async fn hard_close(&mut self, stream_id: u32) -> Result<(), MuxError> {
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.gate.close();
            let _ = entry.event_tx.try_send(StreamEvent::Close);
            self.write_frame(&Frame::close(stream_id)).await?;
        }
        Ok(())
    }

    /// Serialize one frame into the write half. A peer that stops reading
    /// stalls this; cancellation still wins so teardown stays bounded.
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), MuxError> {
        trace!(
            "send frame {:?} stream {} ({} bytes)",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        let encoded = frame.encode();
        tokio::select! {
            _ = self.shutdown.cancelled() => return Err(MuxError::SessionClosed),
            written = self.writer.write_all(&encoded) => written.map_err(MuxError::Io)?,
        }
        self.dirty = true;
        Ok(())
    }
}
