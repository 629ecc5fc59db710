pub mod dump;

use std::sync::Arc;

use tracing::{info, warn};

use bgp_wire::{BgpType, NlriDirection, UpdatePacket};

use crate::bmf::{Bmf, BmfType, Label, StateChange};
use crate::config::LabelAction;
use crate::context::{LastAction, Shutdown};
use crate::queue::{QueueReader, QueueWriter};
use crate::session::{Registry, Session};

pub struct LabelContext {
    pub registry: Arc<Registry>,
    pub peer_reader: QueueReader,
    pub mrt_reader: QueueReader,
    pub labeled_writer: QueueWriter,
    pub shutdown: Shutdown,
    pub last_action: LastAction,
}

/// The labeling role: read the peer and MRT publications in arrival
/// order, fold each update into the owning session's RIB, stamp the
/// per-NLRI labels, and forward to the labeled publication.
pub async fn label_task(ctx: LabelContext) {
    info!("labeling task started");
    let mut peer_open = true;
    let mut mrt_open = true;
    while peer_open || mrt_open {
        tokio::select! {
            batch = ctx.peer_reader.read(), if peer_open => {
                match batch {
                    Some(batch) => {
                        for bmf in batch {
                            process_bmf(&ctx, bmf).await;
                        }
                    }
                    None => peer_open = false,
                }
            }
            batch = ctx.mrt_reader.read(), if mrt_open => {
                match batch {
                    Some(batch) => {
                        for bmf in batch {
                            process_bmf(&ctx, bmf).await;
                        }
                    }
                    None => mrt_open = false,
                }
            }
        }
    }
    info!("labeling task exiting");
}

async fn process_bmf(ctx: &LabelContext, bmf: Arc<Bmf>) {
    ctx.last_action.touch();
    match bmf.typ {
        BmfType::MsgFromPeer | BmfType::TableTransfer => {
            let mut out = (*bmf).clone();
            if let Some(session) = ctx.registry.get(bmf.session_id) {
                let action = session.config.label_action;
                if action != LabelAction::NoAction {
                    apply_update(&session, &mut out, action);
                }
            }
            // Table transfers feed the RIB only; the dump path emits them
            // to subscribers on its own schedule.
            if out.typ != BmfType::TableTransfer {
                ctx.labeled_writer.write(out).await;
            }
        }
        BmfType::FsmStateChange => {
            if let Some(change) = StateChange::decode(&bmf.payload) {
                if change.is_session_down() {
                    if let Some(session) = ctx.registry.get(bmf.session_id) {
                        if session.take_rib().is_some() {
                            info!("destroyed the rib table for session {}", bmf.session_id);
                        }
                    }
                }
            }
            ctx.labeled_writer.write((*bmf).clone()).await;
        }
        _ => {
            ctx.labeled_writer.write((*bmf).clone()).await;
        }
    }
}

/// Apply one raw BGP message to the session's RIB. Non-update messages
/// pass through untouched; a parse failure is logged and the envelope is
/// still forwarded, unlabeled.
fn apply_update(session: &Session, bmf: &mut Bmf, action: LabelAction) {
    let Ok(header) = bgp_wire::BgpHeader::decode(&bmf.payload) else {
        warn!("session {}: undecodable message in queue", session.id);
        return;
    };
    if header.typ != BgpType::Update {
        return;
    }
    let as4 = session.as4();
    let update = match UpdatePacket::parse_packet(&bmf.payload, as4) {
        Ok((_, update)) => update,
        Err(err) => {
            warn!("session {}: update not parseable: {}", session.id, err);
            return;
        }
    };
    let Some(rib) = session.rib() else {
        return;
    };

    let canonical = update.canonical_attrs();
    let as_path = update.as_path(as4).ok().flatten();
    let origin = update.origin();
    let next_hop = update.next_hop_bytes();

    let mut labels = Vec::new();
    for (direction, nlri) in update.nlri_wire_order() {
        let label = match direction {
            NlriDirection::Withdraw => rib.withdraw(nlri),
            NlriDirection::Announce => {
                match rib.intern_attrs(
                    canonical.clone(),
                    as_path.clone(),
                    origin,
                    next_hop.clone(),
                ) {
                    Ok(entry) => match rib.announce(nlri, entry) {
                        Ok(label) => label,
                        Err(err) => {
                            warn!("session {}: rib insert failed: {}", session.id, err);
                            Label::Null
                        }
                    },
                    Err(err) => {
                        warn!("session {}: attribute intern failed: {}", session.id, err);
                        Label::Null
                    }
                }
            }
        };
        session.count_label(label);
        labels.push(label);
    }

    if action == LabelAction::Label && bmf.typ == BmfType::MsgFromPeer {
        bmf.typ = BmfType::MsgLabeled;
        bmf.labels = labels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, LabelAction, ResolvedPeer};
    use crate::peer::fsm::{Event, FsmState};
    use crate::queue::{Publication, QueueOptions};
    use crate::session::Direction;
    use bgp_wire::{Afi, Nlri, Safi};
    use bytes::{BufMut, BytesMut};
    use std::net::{IpAddr, Ipv4Addr};

    fn attrs_with_path(asns: &[u16], next_hop: [u8; 4]) -> Vec<u8> {
        let mut attrs = BytesMut::new();
        attrs.put_slice(&[0x40, 1, 1, 0]); // ORIGIN igp
        attrs.put_u8(0x40); // AS_PATH
        attrs.put_u8(2);
        attrs.put_u8(2 + 2 * asns.len() as u8);
        attrs.put_u8(2); // AS_SEQUENCE
        attrs.put_u8(asns.len() as u8);
        for asn in asns {
            attrs.put_u16(*asn);
        }
        attrs.put_slice(&[0x40, 3, 4]); // NEXT_HOP
        attrs.put_slice(&next_hop);
        attrs.to_vec()
    }

    fn announce_update(asns: &[u16], prefix: [u8; 3], plen: u8) -> Vec<u8> {
        let mut update = UpdatePacket::new();
        update.attrs = attrs_with_path(asns, [10, 0, 0, 1]);
        update.announced = vec![Nlri::new(Afi::Ip, Safi::Unicast, plen, prefix.to_vec())];
        let bytes: BytesMut = update.into();
        bytes.to_vec()
    }

    fn withdraw_update(prefix: [u8; 3], plen: u8) -> Vec<u8> {
        let mut update = UpdatePacket::new();
        update.withdrawn = vec![Nlri::new(Afi::Ip, Safi::Unicast, plen, prefix.to_vec())];
        let bytes: BytesMut = update.into();
        bytes.to_vec()
    }

    struct Harness {
        registry: Arc<Registry>,
        peer_pub: Arc<Publication>,
        mrt_pub: Arc<Publication>,
        labeled: Arc<Publication>,
        session_id: u32,
    }

    fn harness(action: LabelAction) -> Harness {
        let registry = Registry::new(&GlobalConfig::default());
        let config = ResolvedPeer::mrt_synthetic(
            65001,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            action,
        );
        let session = registry
            .create(Direction::Live, config, FsmState::Established, 0, 0)
            .unwrap();
        Harness {
            registry,
            peer_pub: Publication::new("peer", QueueOptions::default()),
            mrt_pub: Publication::new("mrt", QueueOptions::default()),
            labeled: Publication::new("labeled", QueueOptions::default()),
            session_id: session.id,
        }
    }

    fn spawn_labeler(h: &Harness) -> tokio::task::JoinHandle<()> {
        let ctx = LabelContext {
            registry: h.registry.clone(),
            peer_reader: h.peer_pub.add_reader(),
            mrt_reader: h.mrt_pub.add_reader(),
            labeled_writer: h.labeled.add_writer(),
            shutdown: Shutdown::new(),
            last_action: LastAction::new(),
        };
        tokio::spawn(label_task(ctx))
    }

    async fn drain_labels(reader: &QueueReader, count: usize) -> Vec<Vec<Label>> {
        let mut out = Vec::new();
        while out.len() < count {
            let batch = reader.read().await.expect("labeled publication open");
            for bmf in batch {
                out.push(bmf.labels.clone());
            }
        }
        out
    }

    #[tokio::test]
    async fn announce_duplicate_dpath_withdraw_sequence() {
        let h = harness(LabelAction::Label);
        let labeled_reader = h.labeled.add_reader();
        let _task = spawn_labeler(&h);
        let writer = h.peer_pub.add_writer();

        for payload in [
            announce_update(&[65001], [10, 0, 0], 24),
            announce_update(&[65001], [10, 0, 0], 24),
            announce_update(&[65001, 65003], [10, 0, 0], 24),
            withdraw_update([10, 0, 0], 24),
            withdraw_update([10, 0, 0], 24),
        ] {
            writer
                .write(Bmf::with_payload(h.session_id, BmfType::MsgFromPeer, payload))
                .await;
        }

        let labels = drain_labels(&labeled_reader, 5).await;
        assert_eq!(labels[0], vec![Label::NewAnnounce]);
        assert_eq!(labels[1], vec![Label::DuplicateAnnounce]);
        assert_eq!(labels[2], vec![Label::DifferentPath]);
        assert_eq!(labels[3], vec![Label::Withdraw]);
        assert_eq!(labels[4], vec![Label::DuplicateWithdraw]);

        let session = h.registry.get(h.session_id).unwrap();
        use std::sync::atomic::Ordering;
        assert_eq!(session.stats.announce_new.load(Ordering::Relaxed), 1);
        assert_eq!(session.stats.announce_duplicate.load(Ordering::Relaxed), 1);
        assert_eq!(session.stats.different_path.load(Ordering::Relaxed), 1);
        assert_eq!(session.stats.withdraw_new.load(Ordering::Relaxed), 1);
        assert_eq!(session.stats.withdraw_duplicate.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn store_rib_only_keeps_message_unlabeled() {
        let h = harness(LabelAction::StoreRibOnly);
        let labeled_reader = h.labeled.add_reader();
        let _task = spawn_labeler(&h);
        let writer = h.peer_pub.add_writer();

        writer
            .write(Bmf::with_payload(
                h.session_id,
                BmfType::MsgFromPeer,
                announce_update(&[65001], [10, 0, 0], 24),
            ))
            .await;

        let batch = labeled_reader.read().await.unwrap();
        assert_eq!(batch[0].typ, BmfType::MsgFromPeer);
        assert!(batch[0].labels.is_empty());
        // The RIB was still updated.
        let session = h.registry.get(h.session_id).unwrap();
        assert_eq!(session.rib().unwrap().prefix_count(), 1);
    }

    #[tokio::test]
    async fn table_transfer_updates_rib_but_is_not_forwarded() {
        let h = harness(LabelAction::Label);
        let labeled_reader = h.labeled.add_reader();
        let _task = spawn_labeler(&h);
        let writer = h.mrt_pub.add_writer();

        writer
            .write(Bmf::with_payload(
                h.session_id,
                BmfType::TableTransfer,
                announce_update(&[65001], [10, 0, 0], 24),
            ))
            .await;
        // Wait until the table transfer has reached the RIB, then send a
        // live update; its duplicate label proves the transfer landed.
        let session = h.registry.get(h.session_id).unwrap();
        for _ in 0..200 {
            if session
                .rib_if_present()
                .is_some_and(|rib| rib.prefix_count() == 1)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let peer_writer = h.peer_pub.add_writer();
        peer_writer
            .write(Bmf::with_payload(
                h.session_id,
                BmfType::MsgFromPeer,
                announce_update(&[65001], [10, 0, 0], 24),
            ))
            .await;

        let batch = labeled_reader.read().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].typ, BmfType::MsgLabeled);
        assert_eq!(batch[0].labels, vec![Label::DuplicateAnnounce]);
    }

    #[tokio::test]
    async fn session_down_destroys_rib() {
        let h = harness(LabelAction::Label);
        let labeled_reader = h.labeled.add_reader();
        let _task = spawn_labeler(&h);
        let writer = h.peer_pub.add_writer();

        writer
            .write(Bmf::with_payload(
                h.session_id,
                BmfType::MsgFromPeer,
                announce_update(&[65001], [10, 0, 0], 24),
            ))
            .await;
        let change = StateChange::new(FsmState::Established, FsmState::Idle, Event::HoldTimerExpires);
        writer
            .write(Bmf::with_payload(
                h.session_id,
                BmfType::FsmStateChange,
                change.encode(),
            ))
            .await;

        // Both messages come through: the labeled update and the record.
        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.extend(labeled_reader.read().await.unwrap());
        }
        assert_eq!(seen[1].typ, BmfType::FsmStateChange);

        let session = h.registry.get(h.session_id).unwrap();
        assert!(session.rib_if_present().is_none());
    }
}
