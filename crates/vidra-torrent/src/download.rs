//! Per-torrent download orchestration.
//!
//! One task owns the piece state, bitfield, and picker; peer sessions talk to
//! it over bounded channels. Selection is rarest-first with the first piece
//! of the primary media file promoted, switching to endgame (duplicate
//! requests plus CANCEL on arrival) once 95% of pieces are verified.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::error::{EngineError, Result};
use crate::metainfo::TorrentMetadata;
use crate::peer::{PeerCommand, PeerEvent, PeerSession};
use crate::picker::PiecePicker;
use crate::piece::{BlockWrite, PieceBuffer};
use crate::storage::{StorageInfo, TorrentStorage};
use crate::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient, generate_peer_id};
use crate::{BlockInfo, PeerId, PieceIndex};

/// Exponential moving average weight for the speed estimate.
const SPEED_EMA_ALPHA: f64 = 0.2;
/// Fallback re-announce interval when the tracker does not provide one.
const DEFAULT_REANNOUNCE: Duration = Duration::from_secs(120);
/// Budget for the best-effort `stopped` announce during shutdown.
const STOPPED_ANNOUNCE_BUDGET: Duration = Duration::from_secs(5);
/// Capacity of the shared peer-event channel.
const EVENT_BUFFER: usize = 256;

/// Tunables for one download session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum peer connections to open.
    pub max_peers: usize,
    /// Maximum peers kept simultaneously interested.
    pub max_active_peers: usize,
    /// Port advertised to trackers for (unused) inbound connections.
    pub announce_port: u16,
    /// Unfulfilled requests kept in flight per peer.
    pub pipeline_depth: usize,
    /// Deadline for a single requested block.
    pub block_timeout: Duration,
    /// Block timeouts tolerated before a peer is dropped.
    pub peer_failure_limit: u32,
    /// Global verification retries per piece before the download fails.
    pub piece_retry_limit: u32,
    /// Completion ratio beyond which endgame mode starts.
    pub endgame_threshold: f64,
    /// How long to tolerate having neither peers nor peer candidates.
    pub no_peers_grace: Duration,
    /// Static peer hints used alongside tracker discovery.
    pub initial_peers: Vec<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_active_peers: 20,
            announce_port: 6881,
            pipeline_depth: 5,
            block_timeout: Duration::from_secs(30),
            peer_failure_limit: 3,
            piece_retry_limit: 3,
            endgame_threshold: 0.95,
            no_peers_grace: Duration::from_secs(60),
            initial_peers: Vec::new(),
        }
    }
}

/// Engine phase reported alongside progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Announcing to trackers for the first time.
    ContactingTrackers,
    /// Peers are known but none has unchoked us yet.
    ConnectingPeers,
    /// Blocks are flowing.
    Downloading,
    /// A completed piece is being hashed.
    Verifying,
    /// Moving verified files into their final location.
    Finalizing,
}

impl DownloadPhase {
    /// Stable uppercase label used in job records and API payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContactingTrackers => "CONTACTING_TRACKERS",
            Self::ConnectingPeers => "CONNECTING_PEERS",
            Self::Downloading => "DOWNLOADING",
            Self::Verifying => "VERIFYING",
            Self::Finalizing => "FINALIZING",
        }
    }
}

impl std::fmt::Display for DownloadPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Point-in-time progress of a download.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Verified payload bytes.
    pub downloaded_bytes: u64,
    /// Total payload bytes.
    pub total_bytes: u64,
    /// Smoothed download speed in bytes per second.
    pub speed_bps: u64,
    /// Estimated seconds until completion, when the speed is non-zero.
    pub eta_seconds: Option<u64>,
    /// Currently connected peers.
    pub connected_peers: u32,
    /// Engine phase.
    pub phase: DownloadPhase,
    /// Bytes of the primary media file verified contiguously from its start.
    pub primary_available_bytes: u64,
}

/// Terminal result of a download session.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// The payload was fully verified and moved into place.
    Completed {
        /// Absolute paths of every downloaded file, in torrent order.
        files: Vec<PathBuf>,
        /// Absolute path of the primary media file.
        primary_file: PathBuf,
        /// Total payload size.
        total_bytes: u64,
    },
    /// The session was cancelled; partials have been deleted.
    Cancelled,
}

/// Caller-side handle to a running session.
pub struct DownloadHandle {
    progress: watch::Receiver<ProgressSnapshot>,
    cancel: mpsc::Sender<()>,
}

impl DownloadHandle {
    /// Watch receiver for progress snapshots.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }

    /// Request cancellation; the session announces `stopped`, closes its
    /// sockets and deletes partial data.
    pub fn cancel(&self) {
        let _ = self.cancel.try_send(());
    }
}

struct PeerState {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Option<Bitfield>,
    unchoked: bool,
    interested_sent: bool,
    inflight: HashMap<BlockInfo, Instant>,
    failures: u32,
}

/// Orchestrates one torrent download to completion.
pub struct DownloadSession {
    metadata: TorrentMetadata,
    storage: TorrentStorage,
    dest_root: PathBuf,
    config: EngineConfig,
    tracker: TrackerClient,
    peer_id: PeerId,
    picker: PiecePicker,
    buffers: HashMap<PieceIndex, PieceBuffer>,
    piece_owner: HashMap<PieceIndex, SocketAddr>,
    contributors: HashMap<PieceIndex, HashSet<SocketAddr>>,
    tainted: HashMap<PieceIndex, HashSet<SocketAddr>>,
    piece_failures: HashMap<PieceIndex, u32>,
    requested: HashSet<BlockInfo>,
    peers: HashMap<SocketAddr, PeerState>,
    known: VecDeque<SocketAddr>,
    banned: HashSet<SocketAddr>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    progress_tx: watch::Sender<ProgressSnapshot>,
    cancel_rx: mpsc::Receiver<()>,
    downloaded_bytes: u64,
    speed_ema: f64,
    last_tick_bytes: u64,
    last_tick: Instant,
    phase: DownloadPhase,
    no_peers_since: Option<Instant>,
}

impl DownloadSession {
    /// Create a session downloading into `temp_root` and finalizing into
    /// `dest_root`.
    ///
    /// # Errors
    ///
    /// Fails if the tracker HTTP client cannot be built.
    pub fn new(
        metadata: TorrentMetadata,
        temp_root: PathBuf,
        dest_root: PathBuf,
        config: EngineConfig,
    ) -> Result<(Self, DownloadHandle)> {
        let peer_id = generate_peer_id();
        let tracker = TrackerClient::new(metadata.info_hash, peer_id, config.announce_port)
            .map_err(EngineError::Tracker)?;

        let info = StorageInfo::new(&metadata);
        let mut picker = PiecePicker::new(info.piece_count);
        // promote the first piece of the primary file for early playback
        let primary_offset = info.files[info.primary_index].torrent_offset;
        picker.set_priority_piece((primary_offset / u64::from(info.piece_len)) as usize);

        let storage = TorrentStorage::new(info, temp_root);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let total_bytes = metadata.total_size();
        let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot {
            downloaded_bytes: 0,
            total_bytes,
            speed_bps: 0,
            eta_seconds: None,
            connected_peers: 0,
            phase: DownloadPhase::ContactingTrackers,
            primary_available_bytes: 0,
        });

        let session = Self {
            metadata,
            storage,
            dest_root,
            config,
            tracker,
            peer_id,
            picker,
            buffers: HashMap::new(),
            piece_owner: HashMap::new(),
            contributors: HashMap::new(),
            tainted: HashMap::new(),
            piece_failures: HashMap::new(),
            requested: HashSet::new(),
            peers: HashMap::new(),
            known: VecDeque::new(),
            banned: HashSet::new(),
            events_tx,
            events_rx,
            progress_tx,
            cancel_rx,
            downloaded_bytes: 0,
            speed_ema: 0.0,
            last_tick_bytes: 0,
            last_tick: Instant::now(),
            phase: DownloadPhase::ContactingTrackers,
            no_peers_since: None,
        };
        let handle = DownloadHandle {
            progress: progress_rx,
            cancel: cancel_tx,
        };
        Ok((session, handle))
    }

    /// Drive the download to a terminal outcome.
    ///
    /// Peer, tracker, and individual block failures are recoverable and
    /// logged; the session itself fails only on a peer drought, a piece
    /// exhausting its verification retries, or disk errors.
    ///
    /// # Errors
    ///
    /// See [`EngineError`]; on error partial data has been deleted and a
    /// best-effort `stopped` announce has been sent.
    pub async fn run(mut self) -> Result<DownloadOutcome> {
        let result = self.run_inner().await;
        match &result {
            Ok(DownloadOutcome::Completed { .. }) => {}
            Ok(DownloadOutcome::Cancelled) | Err(_) => {
                self.announce_stopped().await;
                self.shutdown_peers().await;
                self.storage.remove_partials().await;
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<DownloadOutcome> {
        info!(
            name = %self.metadata.name,
            info_hash = %hex::encode(self.metadata.info_hash),
            pieces = self.metadata.num_pieces(),
            "starting download"
        );

        let announce_interval = self.initial_announce().await;
        let hints = self.config.initial_peers.clone();
        self.add_candidates(hints);
        self.set_phase(DownloadPhase::ConnectingPeers);
        self.connect_more();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reannounce = tokio::time::interval_at(
            tokio::time::Instant::now() + announce_interval,
            announce_interval,
        );
        let mut cancellable = true;

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    // our own sender keeps the channel open, so recv is Some
                    if let Some(event) = event {
                        self.handle_peer_event(event).await?;
                    }
                },
                _ = tick.tick() => {
                    self.expire_requests().await;
                    self.connect_more();
                    self.publish_progress();
                    if let Some(err) = self.peer_drought() {
                        return Err(err);
                    }
                },
                _ = reannounce.tick() => {
                    self.reannounce().await;
                },
                cancel = self.cancel_rx.recv(), if cancellable => {
                    if cancel.is_some() {
                        info!(name = %self.metadata.name, "download cancelled");
                        return Ok(DownloadOutcome::Cancelled);
                    }
                    // handle dropped without cancelling; disable the branch
                    cancellable = false;
                },
            }

            if self.picker.is_complete() {
                return self.finalize().await;
            }
        }
    }

    async fn initial_announce(&mut self) -> Duration {
        let request = AnnounceRequest {
            uploaded: 0,
            downloaded: 0,
            left: self.metadata.total_size(),
            event: Some(AnnounceEvent::Started),
        };
        match self
            .tracker
            .announce_any(&self.metadata.trackers, &request)
            .await
        {
            Ok(response) => {
                debug!(peers = response.peers.len(), "initial announce succeeded");
                self.add_candidates(response.peers);
                response.interval.unwrap_or(DEFAULT_REANNOUNCE)
            }
            Err(err) => {
                // recoverable: the drought timer decides whether this is fatal
                warn!(error = %err, "initial announce failed");
                DEFAULT_REANNOUNCE
            }
        }
    }

    async fn reannounce(&mut self) {
        let request = AnnounceRequest {
            uploaded: 0,
            downloaded: self.downloaded_bytes,
            left: self.remaining_bytes(),
            event: None,
        };
        match self
            .tracker
            .announce_any(&self.metadata.trackers, &request)
            .await
        {
            Ok(response) => self.add_candidates(response.peers),
            Err(err) => warn!(error = %err, "re-announce failed"),
        }
    }

    fn add_candidates(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            if !self.peers.contains_key(&addr)
                && !self.banned.contains(&addr)
                && !self.known.contains(&addr)
            {
                self.known.push_back(addr);
            }
        }
    }

    fn connect_more(&mut self) {
        while self.peers.len() < self.config.max_peers {
            let Some(addr) = self.known.pop_front() else {
                break;
            };
            if self.peers.contains_key(&addr) || self.banned.contains(&addr) {
                continue;
            }
            let (session, commands) = PeerSession::outbound(
                addr,
                self.metadata.info_hash,
                self.peer_id,
                self.metadata.num_pieces(),
                self.events_tx.clone(),
            );
            tokio::spawn(async move {
                if let Err(err) = session.run().await {
                    debug!(peer = %addr, error = %err, "peer session ended with error");
                }
            });
            self.peers.insert(
                addr,
                PeerState {
                    commands,
                    bitfield: None,
                    unchoked: false,
                    interested_sent: false,
                    inflight: HashMap::new(),
                    failures: 0,
                },
            );
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Bitfield { addr, bitfield } => {
                self.picker.peer_connected(&bitfield);
                if let Some(state) = self.peers.get_mut(&addr) {
                    state.bitfield = Some(bitfield);
                }
                self.consider_interest(addr).await;
            }
            PeerEvent::Have { addr, piece_index } => {
                self.picker.peer_has(piece_index);
                if let Some(state) = self.peers.get_mut(&addr) {
                    match &mut state.bitfield {
                        Some(bitfield) => bitfield.set(piece_index),
                        None => {
                            let mut bitfield = Bitfield::new(self.metadata.num_pieces());
                            bitfield.set(piece_index);
                            state.bitfield = Some(bitfield);
                        }
                    }
                }
                self.consider_interest(addr).await;
            }
            PeerEvent::Choked { addr } => {
                if let Some(state) = self.peers.get_mut(&addr) {
                    state.unchoked = false;
                    // choked peers do not serve outstanding requests
                    for (block, _) in state.inflight.drain() {
                        self.requested.remove(&block);
                    }
                }
            }
            PeerEvent::Unchoked { addr } => {
                if self.phase == DownloadPhase::ConnectingPeers {
                    self.set_phase(DownloadPhase::Downloading);
                }
                if let Some(state) = self.peers.get_mut(&addr) {
                    state.unchoked = true;
                }
                self.fill_pipeline(addr).await;
            }
            PeerEvent::Block { addr, block, data } => {
                self.handle_block(addr, block, data).await?;
                self.fill_pipeline(addr).await;
            }
            PeerEvent::Disconnected { addr, reason } => {
                debug!(peer = %addr, reason, "peer disconnected");
                self.cleanup_peer(addr);
                self.promote_waiting_peers().await;
            }
        }
        Ok(())
    }

    /// Send INTERESTED when a peer has pieces we miss and the active-peer
    /// budget allows it.
    async fn consider_interest(&mut self, addr: SocketAddr) {
        let active = self
            .peers
            .values()
            .filter(|state| state.interested_sent)
            .count();
        let Some(state) = self.peers.get_mut(&addr) else {
            return;
        };
        if state.interested_sent || active >= self.config.max_active_peers {
            return;
        }
        let interesting = state
            .bitfield
            .as_ref()
            .is_some_and(|bitfield| self.picker.own().is_interesting(bitfield));
        if interesting {
            state.interested_sent = true;
            let sender = state.commands.clone();
            let _ = sender.send(PeerCommand::Interested).await;
        }
    }

    /// After a slot frees up, promote a waiting peer into the active set.
    async fn promote_waiting_peers(&mut self) {
        let candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, state)| !state.interested_sent && state.bitfield.is_some())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in candidates {
            self.consider_interest(addr).await;
        }
    }

    fn cleanup_peer(&mut self, addr: SocketAddr) {
        let Some(state) = self.peers.remove(&addr) else {
            return;
        };
        if let Some(bitfield) = &state.bitfield {
            self.picker.peer_disconnected(bitfield);
        }
        for block in state.inflight.keys() {
            self.requested.remove(block);
        }
        // orphan this peer's pieces so others can adopt the partial buffers
        let orphaned: Vec<PieceIndex> = self
            .piece_owner
            .iter()
            .filter(|(_, owner)| **owner == addr)
            .map(|(piece, _)| *piece)
            .collect();
        for piece in orphaned {
            self.piece_owner.remove(&piece);
        }
    }

    async fn fill_pipeline(&mut self, addr: SocketAddr) {
        loop {
            let Some(state) = self.peers.get(&addr) else {
                return;
            };
            if !state.unchoked
                || !state.interested_sent
                || state.inflight.len() >= self.config.pipeline_depth
            {
                return;
            }
            let Some(block) = self.next_block_for(addr) else {
                return;
            };

            let sender = self.peers.get(&addr).map(|state| state.commands.clone());
            let Some(sender) = sender else { return };
            if sender.send(PeerCommand::Request(block)).await.is_err() {
                return;
            }
            if let Some(state) = self.peers.get_mut(&addr) {
                state.inflight.insert(block, Instant::now());
            }
            if !self.in_endgame() {
                self.requested.insert(block);
            }
        }
    }

    fn next_block_for(&mut self, addr: SocketAddr) -> Option<BlockInfo> {
        let peer_bitfield = self.peers.get(&addr)?.bitfield.clone()?;

        if self.in_endgame() {
            return self.next_endgame_block(addr, &peer_bitfield);
        }

        // continue pieces already assigned to this peer
        for (&piece, owner) in &self.piece_owner {
            if *owner != addr {
                continue;
            }
            if let Some(buffer) = self.buffers.get(&piece) {
                if let Some(block) = buffer
                    .missing_blocks()
                    .find(|block| !self.requested.contains(block))
                {
                    return Some(block);
                }
            }
        }

        // adopt orphaned partial buffers the peer can serve
        let orphan = self.buffers.keys().copied().find(|piece| {
            !self.piece_owner.contains_key(piece)
                && peer_bitfield.has(*piece)
                && !self.is_tainted(*piece, addr)
        });
        if let Some(piece) = orphan {
            self.piece_owner.insert(piece, addr);
            return self.buffers[&piece]
                .missing_blocks()
                .find(|block| !self.requested.contains(block));
        }

        // open a new piece
        let tainted = &self.tainted;
        let piece = self.picker.pick(&peer_bitfield, |piece| {
            tainted
                .get(&piece)
                .is_some_and(|peers| peers.contains(&addr))
        })?;
        let length = self.storage.info().piece_len(piece).ok()?;
        let expected = self.metadata.piece_hash(piece).ok()?;
        self.picker.mark_assigned(piece);
        self.piece_owner.insert(piece, addr);
        let buffer = PieceBuffer::new(piece, length, expected);
        let first = buffer.next_block_request();
        self.buffers.insert(piece, buffer);
        first
    }

    /// Endgame: request any outstanding block from every peer that has the
    /// piece, deduplicating only within a single peer's pipeline.
    fn next_endgame_block(&mut self, addr: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockInfo> {
        let peer_inflight: HashSet<BlockInfo> = self
            .peers
            .get(&addr)
            .map(|state| state.inflight.keys().copied().collect())
            .unwrap_or_default();

        let candidates: Vec<PieceIndex> = (0..self.metadata.num_pieces())
            .filter(|&piece| {
                !self.picker.own().has(piece)
                    && peer_bitfield.has(piece)
                    && !self.is_tainted(piece, addr)
            })
            .collect();

        for piece in candidates {
            if !self.buffers.contains_key(&piece) {
                let length = self.storage.info().piece_len(piece).ok()?;
                let expected = self.metadata.piece_hash(piece).ok()?;
                self.picker.mark_assigned(piece);
                self.buffers.insert(piece, PieceBuffer::new(piece, length, expected));
            }
            if let Some(block) = self.buffers[&piece]
                .missing_blocks()
                .find(|block| !peer_inflight.contains(block))
            {
                return Some(block);
            }
        }
        None
    }

    async fn handle_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let expected = self
            .peers
            .get_mut(&addr)
            .map(|state| state.inflight.remove(&block).is_some())
            .unwrap_or(false);
        if !expected {
            debug!(peer = %addr, ?block, "dropping unrequested block");
            return Ok(());
        }
        self.requested.remove(&block);

        // during endgame, cancel the duplicates now racing this block
        if self.in_endgame() {
            let mut duplicates = Vec::new();
            for (other, state) in &mut self.peers {
                if *other != addr && state.inflight.remove(&block).is_some() {
                    duplicates.push(state.commands.clone());
                }
            }
            for sender in duplicates {
                let _ = sender.send(PeerCommand::Cancel(block)).await;
            }
        }

        let piece = block.piece_index as PieceIndex;
        let Some(buffer) = self.buffers.get_mut(&piece) else {
            // the piece completed via another peer already
            return Ok(());
        };
        match buffer.write_block(block.offset, &data) {
            BlockWrite::Rejected => {
                warn!(peer = %addr, ?block, "peer sent out-of-range block");
                return Ok(());
            }
            BlockWrite::Accepted | BlockWrite::Duplicate => {
                self.contributors.entry(piece).or_default().insert(addr);
            }
        }

        if self.buffers.get(&piece).is_some_and(PieceBuffer::is_filled) {
            self.verify_piece(piece).await?;
        }
        Ok(())
    }

    async fn verify_piece(&mut self, piece: PieceIndex) -> Result<()> {
        let Some(buffer) = self.buffers.remove(&piece) else {
            return Ok(());
        };
        let previous_phase = self.phase;
        self.set_phase(DownloadPhase::Verifying);

        // SHA-1 is CPU-bound; keep it off the event loop
        let (buffer, ok) = tokio::task::spawn_blocking(move || {
            let mut buffer = buffer;
            let ok = buffer.verify();
            (buffer, ok)
        })
        .await
        .map_err(|err| EngineError::Io(std::io::Error::other(err)))?;

        if ok {
            let bytes = buffer.into_bytes();
            self.storage.write_piece(piece, &bytes).await?;
            self.downloaded_bytes += bytes.len() as u64;
            self.picker.mark_received(piece);
            self.piece_owner.remove(&piece);
            self.contributors.remove(&piece);
            self.set_phase(if self.picker.is_complete() {
                DownloadPhase::Finalizing
            } else {
                previous_phase
            });
            self.publish_progress();
            debug!(piece, "piece verified");
            Ok(())
        } else {
            let failures = self.piece_failures.entry(piece).or_insert(0);
            *failures += 1;
            warn!(piece, attempt = *failures, "piece failed verification");
            if *failures >= self.config.piece_retry_limit {
                return Err(EngineError::PieceVerification {
                    index: piece,
                    attempts: *failures,
                });
            }
            // avoid the peers that fed the corrupt piece next time around
            let implicated = self.contributors.remove(&piece).unwrap_or_default();
            self.tainted.entry(piece).or_default().extend(implicated);
            self.piece_owner.remove(&piece);
            self.picker.unassign(piece);
            self.set_phase(previous_phase);
            drop(buffer);
            Ok(())
        }
    }

    async fn expire_requests(&mut self) {
        let now = Instant::now();
        let mut drops: Vec<SocketAddr> = Vec::new();

        for (addr, state) in &mut self.peers {
            let expired: Vec<BlockInfo> = state
                .inflight
                .iter()
                .filter(|(_, since)| now.duration_since(**since) >= self.config.block_timeout)
                .map(|(block, _)| *block)
                .collect();
            if expired.is_empty() {
                continue;
            }
            for block in &expired {
                state.inflight.remove(block);
                self.requested.remove(block);
            }
            state.failures += expired.len() as u32;
            warn!(peer = %addr, expired = expired.len(), failures = state.failures, "block requests timed out");
            if state.failures >= self.config.peer_failure_limit {
                drops.push(*addr);
            }
        }

        for addr in drops {
            info!(peer = %addr, "dropping peer after repeated timeouts");
            self.banned.insert(addr);
            if let Some(state) = self.peers.get(&addr) {
                let _ = state.commands.send(PeerCommand::Shutdown).await;
            }
            self.cleanup_peer(addr);
        }
    }

    fn peer_drought(&mut self) -> Option<EngineError> {
        if self.peers.is_empty() && self.known.is_empty() {
            match self.no_peers_since {
                None => {
                    self.no_peers_since = Some(Instant::now());
                    None
                }
                Some(since) if since.elapsed() >= self.config.no_peers_grace => {
                    Some(EngineError::NoPeers {
                        detail: format!(
                            "no peers connected or known for {}s",
                            since.elapsed().as_secs()
                        ),
                    })
                }
                Some(_) => None,
            }
        } else {
            self.no_peers_since = None;
            None
        }
    }

    fn in_endgame(&self) -> bool {
        self.picker.completion_ratio() >= self.config.endgame_threshold
    }

    fn remaining_bytes(&self) -> u64 {
        self.metadata.total_size() - self.downloaded_bytes
    }

    fn set_phase(&mut self, phase: DownloadPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "phase transition");
            self.phase = phase;
        }
    }

    fn publish_progress(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        if elapsed >= 1.0 {
            let delta = (self.downloaded_bytes - self.last_tick_bytes) as f64;
            self.speed_ema = ema_update(self.speed_ema, delta / elapsed);
            self.last_tick = now;
            self.last_tick_bytes = self.downloaded_bytes;
        }

        let speed_bps = self.speed_ema.max(0.0) as u64;
        let eta_seconds = if speed_bps > 0 && self.remaining_bytes() > 0 {
            Some(self.remaining_bytes() / speed_bps)
        } else {
            None
        };
        let info = self.storage.info();
        let snapshot = ProgressSnapshot {
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.metadata.total_size(),
            speed_bps,
            eta_seconds,
            connected_peers: self.peers.len() as u32,
            phase: self.phase,
            primary_available_bytes: info
                .contiguous_file_bytes(info.primary_index, self.picker.own()),
        };
        let _ = self.progress_tx.send(snapshot);
    }

    async fn finalize(&mut self) -> Result<DownloadOutcome> {
        self.set_phase(DownloadPhase::Finalizing);
        self.publish_progress();

        let request = AnnounceRequest {
            uploaded: 0,
            downloaded: self.downloaded_bytes,
            left: 0,
            event: Some(AnnounceEvent::Completed),
        };
        if let Err(err) = self
            .tracker
            .announce_any(&self.metadata.trackers, &request)
            .await
        {
            warn!(error = %err, "completed announce failed");
        }

        let files = self.storage.finalize_into(&self.dest_root).await?;
        let primary_file = files[self.storage.info().primary_index].clone();

        self.announce_stopped().await;
        self.shutdown_peers().await;
        self.publish_progress();
        info!(name = %self.metadata.name, "download complete");
        Ok(DownloadOutcome::Completed {
            files,
            primary_file,
            total_bytes: self.metadata.total_size(),
        })
    }

    async fn announce_stopped(&self) {
        let request = AnnounceRequest {
            uploaded: 0,
            downloaded: self.downloaded_bytes,
            left: self.remaining_bytes(),
            event: Some(AnnounceEvent::Stopped),
        };
        let announce = self.tracker.announce_any(&self.metadata.trackers, &request);
        if timeout(STOPPED_ANNOUNCE_BUDGET, announce).await.is_err() {
            debug!("stopped announce exceeded its budget");
        }
    }

    async fn shutdown_peers(&mut self) {
        for state in self.peers.values() {
            let _ = state.commands.try_send(PeerCommand::Shutdown);
        }
        self.peers.clear();
    }

    fn is_tainted(&self, piece: PieceIndex, addr: SocketAddr) -> bool {
        self.tainted
            .get(&piece)
            .is_some_and(|peers| peers.contains(&addr))
    }
}

fn ema_update(previous: f64, sample: f64) -> f64 {
    if previous == 0.0 {
        sample
    } else {
        SPEED_EMA_ALPHA * sample + (1.0 - SPEED_EMA_ALPHA) * previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_labels_are_stable() {
        assert_eq!(
            DownloadPhase::ContactingTrackers.as_str(),
            "CONTACTING_TRACKERS"
        );
        assert_eq!(DownloadPhase::ConnectingPeers.as_str(), "CONNECTING_PEERS");
        assert_eq!(DownloadPhase::Downloading.as_str(), "DOWNLOADING");
        assert_eq!(DownloadPhase::Verifying.as_str(), "VERIFYING");
        assert_eq!(DownloadPhase::Finalizing.as_str(), "FINALIZING");
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.max_active_peers, 20);
        assert_eq!(config.pipeline_depth, 5);
        assert_eq!(config.block_timeout, Duration::from_secs(30));
        assert_eq!(config.peer_failure_limit, 3);
        assert_eq!(config.piece_retry_limit, 3);
        assert!((config.endgame_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.no_peers_grace, Duration::from_secs(60));
    }

    #[test]
    fn ema_warms_up_with_first_sample() {
        assert!((ema_update(0.0, 100.0) - 100.0).abs() < f64::EPSILON);
        let smoothed = ema_update(100.0, 200.0);
        assert!((smoothed - 120.0).abs() < f64::EPSILON);
    }
}
