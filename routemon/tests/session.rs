use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use bgp_wire::{
    Afi, BgpHeader, BgpType, Nlri, NotificationPacket, OpenPacket, Safi, UpdatePacket,
    BGP_HEADER_LEN,
};
use routemon::bmf::BmfType;
use routemon::bmf::StateChange;
use routemon::config::{Config, PeerStanza};
use routemon::context::{LastAction, Shutdown};
use routemon::peer::fsm::{Event, FsmState};
use routemon::peer::{peer_task, PeerContext};
use routemon::queue::{Publication, QueueOptions};
use routemon::session::Registry;

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; BGP_HEADER_LEN as usize];
    stream.read_exact(&mut header).await.unwrap();
    let length = u16::from_be_bytes([header[16], header[17]]) as usize;
    let mut frame = header.to_vec();
    if length > header.len() {
        let mut rest = vec![0u8; length - header.len()];
        stream.read_exact(&mut rest).await.unwrap();
        frame.extend_from_slice(&rest);
    }
    frame
}

fn announce_update() -> BytesMut {
    let mut update = UpdatePacket::new();
    let mut attrs = Vec::new();
    attrs.extend_from_slice(&[0x40, 1, 1, 0]);
    attrs.extend_from_slice(&[0x40, 2, 4, 2, 1, 0xfd, 0xe9]);
    attrs.extend_from_slice(&[0x40, 3, 4, 192, 0, 2, 1]);
    update.attrs = attrs;
    update.announced = vec![Nlri::new(Afi::Ip, Safi::Unicast, 24, vec![10, 0, 0])];
    update.into()
}

/// Scripted remote speaker: OPEN and KEEPALIVE exchange, one UPDATE, then
/// a Cease notification.
async fn scripted_peer(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let open = read_frame(&mut stream).await;
    assert_eq!(open[18], BgpType::Open as u8);

    let our_open = OpenPacket::new(65001, 180, &"192.0.2.1".parse().unwrap(), Vec::new());
    let bytes: BytesMut = our_open.into();
    stream.write_all(&bytes).await.unwrap();

    loop {
        let frame = read_frame(&mut stream).await;
        if frame[18] == BgpType::Keepalive as u8 {
            break;
        }
    }
    let keepalive: BytesMut = BgpHeader::new(BgpType::Keepalive, BGP_HEADER_LEN).into();
    stream.write_all(&keepalive).await.unwrap();

    stream.write_all(&announce_update()).await.unwrap();

    let notification: BytesMut = NotificationPacket::new(6, 2, Vec::new()).into();
    stream.write_all(&notification).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn session_establishes_then_resets_on_notification() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = tokio::spawn(scripted_peer(listener));

    let stanza = PeerStanza {
        name: "scripted".into(),
        remote_addr: "127.0.0.1".into(),
        remote_port: port as i64,
        remote_as: 65001,
        local_as: 65002,
        ..Default::default()
    };
    let mut config = Config::default();
    config.peers.push(stanza.clone());
    let config = Arc::new(config);

    let registry = Registry::new(&config.global);
    let peer_pub = Publication::new("peer", QueueOptions::default());
    let reader = peer_pub.add_reader();
    let shutdown = Shutdown::new();

    let ctx = PeerContext {
        registry: registry.clone(),
        config: config.clone(),
        stanza,
        writer: peer_pub.add_writer(),
        shutdown: shutdown.clone(),
        last_action: LastAction::new(),
    };
    let task = tokio::spawn(peer_task(ctx));

    // Watch the peer publication until the session has gone up and come
    // back down.
    let mut changes: Vec<StateChange> = Vec::new();
    let mut update_seen = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    'watch: loop {
        let batch = tokio::time::timeout_at(deadline, reader.read())
            .await
            .expect("handshake timed out")
            .expect("publication open");
        for bmf in batch {
            match bmf.typ {
                BmfType::FsmStateChange => {
                    let change = StateChange::decode(&bmf.payload).unwrap();
                    changes.push(change);
                    if change.old_state == FsmState::Established
                        && change.new_state == FsmState::Idle
                    {
                        break 'watch;
                    }
                }
                BmfType::MsgFromPeer => {
                    if bmf.payload[18] == BgpType::Update as u8 {
                        update_seen = true;
                    }
                }
                _ => {}
            }
        }
    }

    // The establishment transition carries the keepalive event as its
    // reason.
    assert!(changes.iter().any(|c| {
        c.old_state == FsmState::OpenConfirm
            && c.new_state == FsmState::Established
            && c.reason == Event::KeepaliveMsg
    }));
    assert!(update_seen, "the announced update must reach the queue");

    // The reset was peer-initiated.
    let down = changes.last().unwrap();
    assert_eq!(down.reason, Event::NotificationMsg);

    // The replacement session carries the down count forward.
    let mut carried = false;
    for _ in 0..100 {
        if registry
            .iter()
            .iter()
            .any(|s| s.stats.down_count.load(Ordering::SeqCst) == 1)
        {
            carried = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(carried, "down count must survive the session rebuild");

    shutdown.signal();
    let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
    let _ = peer.await;
}
