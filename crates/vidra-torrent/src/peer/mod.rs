//! Per-peer connection sessions.
//!
//! Each session owns one TCP connection: connect, exchange handshakes, then
//! pump wire messages. The session task is the only writer on its socket, so
//! outbound messages are serialized by construction. Piece bookkeeping lives
//! with the download task; the session merely translates between the wire and
//! [`PeerEvent`]/[`PeerCommand`] channels.

pub mod codec;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, trace, warn};

use crate::bitfield::Bitfield;
use crate::error::{EngineError, Result};
use crate::peer::codec::{Handshake, HandshakeCodec, Message, WireCodec};
use crate::{BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// TCP connect and handshake deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Quiet period after which a keep-alive probe is sent instead of dropping.
const READ_KEEPALIVE_AFTER: Duration = Duration::from_secs(60);
/// Quiet period after which the peer is considered gone.
const IDLE_DROP_AFTER: Duration = Duration::from_secs(120);
/// Outbound keep-alive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Capacity of the per-peer command channel.
const COMMAND_BUFFER: usize = 64;

/// Events a session reports to its download task.
#[derive(Debug)]
pub enum PeerEvent {
    /// The peer sent its full availability bitfield.
    Bitfield {
        /// Remote address of the reporting session.
        addr: SocketAddr,
        /// The peer's availability, sized to the torrent's piece count.
        bitfield: Bitfield,
    },
    /// The peer announced a newly acquired piece.
    Have {
        /// Remote address of the reporting session.
        addr: SocketAddr,
        /// The newly available piece.
        piece_index: PieceIndex,
    },
    /// The peer choked us; in-flight requests will not be served.
    Choked {
        /// Remote address of the reporting session.
        addr: SocketAddr,
    },
    /// The peer unchoked us; requests may be pipelined.
    Unchoked {
        /// Remote address of the reporting session.
        addr: SocketAddr,
    },
    /// A block of piece data arrived.
    Block {
        /// Remote address of the reporting session.
        addr: SocketAddr,
        /// Which block the payload covers.
        block: BlockInfo,
        /// The block payload.
        data: Vec<u8>,
    },
    /// The session ended, cleanly or otherwise.
    Disconnected {
        /// Remote address of the reporting session.
        addr: SocketAddr,
        /// Human-readable cause, for logs and failure accounting.
        reason: String,
    },
}

/// Commands a download task sends to a session.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    /// Declare interest in the peer's pieces.
    Interested,
    /// Withdraw interest.
    NotInterested,
    /// Request a block.
    Request(BlockInfo),
    /// Cancel an earlier request (endgame duplicate suppression).
    Cancel(BlockInfo),
    /// Close the connection.
    Shutdown,
}

/// State and plumbing for one outbound peer connection.
pub struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    local_peer_id: PeerId,
    num_pieces: usize,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_bitfield: Bitfield,
}

type WireSink = SplitSink<Framed<TcpStream, WireCodec>, Message>;

impl PeerSession {
    /// Create an outbound session; the returned sender delivers
    /// [`PeerCommand`]s to it once it runs.
    #[must_use]
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        local_peer_id: PeerId,
        num_pieces: usize,
        events: mpsc::Sender<PeerEvent>,
    ) -> (Self, mpsc::Sender<PeerCommand>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        (
            Self {
                addr,
                info_hash,
                local_peer_id,
                num_pieces,
                events,
                commands,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                peer_bitfield: Bitfield::new(num_pieces),
            },
            command_tx,
        )
    }

    /// Drive the connection until shutdown, EOF, or a protocol error.
    ///
    /// A [`PeerEvent::Disconnected`] is emitted in every case before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Connection, handshake, and protocol violations surface as engine
    /// errors; the download task treats them as recoverable per-peer
    /// failures.
    pub async fn run(mut self) -> Result<()> {
        let result = self.connect_and_drive().await;
        let reason = match &result {
            Ok(()) => "session closed".to_string(),
            Err(err) => err.to_string(),
        };
        let _ = self
            .events
            .send(PeerEvent::Disconnected {
                addr: self.addr,
                reason,
            })
            .await;
        result
    }

    async fn connect_and_drive(&mut self) -> Result<()> {
        trace!(peer = %self.addr, "connecting");
        let socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| timed_out("connect timed out"))??;

        let mut framed = Framed::new(socket, HandshakeCodec);
        framed
            .send(Handshake::new(self.info_hash, self.local_peer_id))
            .await?;

        let remote = timeout(CONNECT_TIMEOUT, framed.next())
            .await
            .map_err(|_| timed_out("handshake timed out"))?
            .ok_or_else(|| EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            )))??;

        if remote.info_hash != self.info_hash {
            debug!(peer = %self.addr, "handshake info-hash mismatch");
            return Err(EngineError::InvalidInfoHash);
        }
        trace!(peer = %self.addr, "handshake complete");

        // switch to the message codec, keeping any bytes the peer pipelined
        // right after its handshake
        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, WireCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let framed = Framed::from_parts(new_parts);

        self.drive(framed).await
    }

    async fn drive(&mut self, framed: Framed<TcpStream, WireCodec>) -> Result<()> {
        let (mut sink, mut stream) = framed.split();
        let mut last_inbound = Instant::now();
        let mut last_outbound = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(message)) => {
                        last_inbound = Instant::now();
                        if !self.handle_message(message).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    if !self.handle_command(&mut sink, command).await? {
                        return Ok(());
                    }
                    last_outbound = Instant::now();
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_inbound) >= IDLE_DROP_AFTER {
                        return Err(timed_out("peer idle past the drop threshold").into());
                    }
                    if now.duration_since(last_inbound) >= READ_KEEPALIVE_AFTER
                        || now.duration_since(last_outbound) >= KEEPALIVE_INTERVAL
                    {
                        sink.send(Message::KeepAlive).await?;
                        last_outbound = now;
                    }
                },
            }
        }
    }

    /// Process one inbound message; returns `false` when the session should
    /// end (event channel gone).
    async fn handle_message(&mut self, message: Message) -> Result<bool> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.peer_choking {
                    self.peer_choking = true;
                    return Ok(self.emit(PeerEvent::Choked { addr: self.addr }).await);
                }
            }
            Message::Unchoke => {
                if self.peer_choking {
                    self.peer_choking = false;
                    return Ok(self.emit(PeerEvent::Unchoked { addr: self.addr }).await);
                }
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                let piece_index = piece_index as PieceIndex;
                self.peer_bitfield.set(piece_index);
                return Ok(self
                    .emit(PeerEvent::Have {
                        addr: self.addr,
                        piece_index,
                    })
                    .await);
            }
            Message::Bitfield(bytes) => {
                let bitfield = Bitfield::from_bytes(&bytes, self.num_pieces)?;
                self.peer_bitfield = bitfield.clone();
                return Ok(self
                    .emit(PeerEvent::Bitfield {
                        addr: self.addr,
                        bitfield,
                    })
                    .await);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                return Ok(self
                    .emit(PeerEvent::Block {
                        addr: self.addr,
                        block,
                        data,
                    })
                    .await);
            }
            // leecher-only: we never unchoke peers, so serve nothing
            Message::Request(block) => {
                debug!(peer = %self.addr, ?block, "ignoring request from peer");
            }
            Message::Cancel(_) => {}
        }
        Ok(true)
    }

    /// Execute one command; returns `false` on shutdown.
    async fn handle_command(&mut self, sink: &mut WireSink, command: PeerCommand) -> Result<bool> {
        match command {
            PeerCommand::Interested => {
                if !self.am_interested {
                    self.am_interested = true;
                    sink.send(Message::Interested).await?;
                }
            }
            PeerCommand::NotInterested => {
                if self.am_interested {
                    self.am_interested = false;
                    sink.send(Message::NotInterested).await?;
                }
            }
            PeerCommand::Request(block) => {
                if self.peer_choking {
                    warn!(peer = %self.addr, ?block, "request while choked; dropping");
                } else {
                    sink.send(Message::Request(block)).await?;
                }
            }
            PeerCommand::Cancel(block) => sink.send(Message::Cancel(block)).await?,
            PeerCommand::Shutdown => {
                let _ = sink.close().await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn emit(&self, event: PeerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

fn timed_out(detail: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, detail)
}
