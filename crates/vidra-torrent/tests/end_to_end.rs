//! End-to-end engine tests against an in-process seeder speaking the real
//! wire protocol over loopback TCP.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use vidra_torrent::bencode::{self, Value};
use vidra_torrent::bitfield::Bitfield;
use vidra_torrent::error::EngineError;
use vidra_torrent::peer::codec::{Handshake, HandshakeCodec, Message, WireCodec};
use vidra_torrent::peer::PeerSession;
use vidra_torrent::{
    DownloadOutcome, DownloadSession, EngineConfig, Sha1Hash, TorrentMetadata,
};

const PIECE_LEN: u32 = 32 * 1024;

/// Build a deterministic payload plus a `.torrent` document describing it.
fn build_torrent(total: usize) -> (Vec<u8>, TorrentMetadata) {
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let mut pieces = Vec::new();
    for chunk in payload.chunks(PIECE_LEN as usize) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::Bytes(b"feature.mp4".to_vec()));
    info.insert(b"piece length".to_vec(), Value::Int(i64::from(PIECE_LEN)));
    info.insert(b"length".to_vec(), Value::Int(total as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
    let mut doc = BTreeMap::new();
    doc.insert(b"info".to_vec(), Value::Dict(info));

    let metadata = TorrentMetadata::from_bytes(&bencode::encode(&Value::Dict(doc)))
        .expect("generated torrent parses");
    (payload, metadata)
}

/// Serve one leecher: handshake, bitfield, then answer requests until EOF.
async fn run_seeder(listener: TcpListener, info_hash: Sha1Hash, payload: Vec<u8>) {
    let (socket, _) = listener.accept().await.expect("accept");
    let mut handshaking = Framed::new(socket, HandshakeCodec);

    let _client = handshaking
        .next()
        .await
        .expect("client handshake")
        .expect("valid handshake");
    handshaking
        .send(Handshake::new(info_hash, *b"-SEED00-aaaaaaaaaaaa"))
        .await
        .expect("send handshake");

    let parts = handshaking.into_parts();
    let mut new_parts = FramedParts::new(parts.io, WireCodec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    let mut framed = Framed::from_parts(new_parts);

    let num_pieces = payload.len().div_ceil(PIECE_LEN as usize);
    let mut bitfield = Bitfield::new(num_pieces);
    for index in 0..num_pieces {
        bitfield.set(index);
    }
    framed
        .send(Message::Bitfield(bitfield.to_bytes()))
        .await
        .expect("send bitfield");

    while let Some(message) = framed.next().await {
        match message.expect("wire message") {
            Message::Interested => framed.send(Message::Unchoke).await.expect("unchoke"),
            Message::Request(block) => {
                let start = block.piece_index as usize * PIECE_LEN as usize
                    + block.offset as usize;
                let data = payload[start..start + block.len as usize].to_vec();
                framed
                    .send(Message::Piece {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await
                    .expect("send piece");
            }
            _ => {}
        }
    }
}

fn test_config(seeder: SocketAddr) -> EngineConfig {
    EngineConfig {
        initial_peers: vec![seeder],
        no_peers_grace: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn downloads_and_finalizes_from_a_single_seeder() {
    let (payload, metadata) = build_torrent(2 * PIECE_LEN as usize + PIECE_LEN as usize / 2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    let seeder = tokio::spawn(run_seeder(listener, metadata.info_hash, payload.clone()));

    let temp = tempfile::tempdir().unwrap();
    let library = tempfile::tempdir().unwrap();
    let (session, handle) = DownloadSession::new(
        metadata,
        temp.path().join("job"),
        library.path().to_path_buf(),
        test_config(seeder_addr),
    )
    .unwrap();

    let outcome = timeout(Duration::from_secs(60), session.run())
        .await
        .expect("download should finish promptly")
        .expect("download should succeed");

    match outcome {
        DownloadOutcome::Completed {
            files,
            primary_file,
            total_bytes,
        } => {
            assert_eq!(total_bytes, payload.len() as u64);
            assert_eq!(files.len(), 1);
            assert_eq!(primary_file, files[0]);
            let written = std::fs::read(&primary_file).unwrap();
            assert_eq!(written, payload);
        }
        DownloadOutcome::Cancelled => panic!("download should not report cancellation"),
    }

    let progress = handle.progress();
    let snapshot = progress.borrow();
    assert_eq!(snapshot.downloaded_bytes, snapshot.total_bytes);
    assert_eq!(snapshot.primary_available_bytes, snapshot.total_bytes);

    seeder.abort();
}

#[tokio::test]
async fn handshake_info_hash_mismatch_drops_the_peer() {
    let (payload, metadata) = build_torrent(PIECE_LEN as usize);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    // the seeder advertises a foreign info-hash
    let mut wrong_hash = metadata.info_hash;
    wrong_hash[0] ^= 0xff;
    let seeder = tokio::spawn(run_seeder(listener, wrong_hash, payload));

    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (session, _commands) = PeerSession::outbound(
        seeder_addr,
        metadata.info_hash,
        *b"-HT0100-bbbbbbbbbbbb",
        metadata.num_pieces(),
        events_tx,
    );

    let result = timeout(Duration::from_secs(10), session.run())
        .await
        .expect("session should end promptly");
    assert!(matches!(result, Err(EngineError::InvalidInfoHash)));

    // the disconnect event carries the cause for failure accounting
    let event = events_rx.recv().await.expect("disconnect event");
    match event {
        vidra_torrent::peer::PeerEvent::Disconnected { reason, .. } => {
            assert!(reason.contains("info-hash"), "unexpected reason: {reason}");
        }
        other => panic!("expected disconnect, got {other:?}"),
    }

    seeder.abort();
}

#[tokio::test]
async fn cancellation_deletes_partials() {
    let (_, metadata) = build_torrent(PIECE_LEN as usize);
    let temp = tempfile::tempdir().unwrap();
    let library = tempfile::tempdir().unwrap();
    let scratch = temp.path().join("job");

    let (session, handle) = DownloadSession::new(
        metadata,
        scratch.clone(),
        library.path().to_path_buf(),
        EngineConfig {
            no_peers_grace: Duration::from_secs(30),
            ..EngineConfig::default()
        },
    )
    .unwrap();

    handle.cancel();
    let outcome = timeout(Duration::from_secs(10), session.run())
        .await
        .expect("cancel should end the session")
        .expect("cancellation is not an error");
    assert!(matches!(outcome, DownloadOutcome::Cancelled));
    assert!(!scratch.exists(), "partials must be removed on cancel");
}

#[tokio::test]
async fn peer_drought_fails_the_download() {
    let (_, metadata) = build_torrent(PIECE_LEN as usize);
    let temp = tempfile::tempdir().unwrap();
    let library = tempfile::tempdir().unwrap();

    let (session, _handle) = DownloadSession::new(
        metadata,
        temp.path().join("job"),
        library.path().to_path_buf(),
        EngineConfig {
            no_peers_grace: Duration::from_secs(2),
            ..EngineConfig::default()
        },
    )
    .unwrap();

    let result = timeout(Duration::from_secs(30), session.run())
        .await
        .expect("drought should end the session");
    assert!(matches!(result, Err(EngineError::NoPeers { .. })));
}
