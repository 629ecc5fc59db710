use std::time::Instant;

use bytes::{BufMut, BytesMut};
use tracing::{info, warn};

use bgp_wire::{walk_attrs, Afi, BgpHeader, BgpType, Safi, ATTR_MP_REACH_NLRI, BGP_HEADER_LEN};

use crate::bmf::{Bmf, BmfType};
use crate::context::{LastAction, Shutdown};
use crate::queue::QueueWriter;
use crate::rib::PrefixKey;
use crate::session::Registry;

/// Rebuild one UPDATE for a dump: the node's canonical attributes with
/// its prefixes re-attached, IPv4 unicast ones as plain NLRI and the rest
/// inside the MP_REACH_NLRI attribute.
fn build_dump_update(attrs: &[u8], prefixes: &[PrefixKey]) -> Option<Vec<u8>> {
    if prefixes.is_empty() {
        return None;
    }
    let (plain, multi): (Vec<&PrefixKey>, Vec<&PrefixKey>) = prefixes
        .iter()
        .partition(|p| p.afi == Afi::Ip && p.safi == Safi::Unicast);

    let refs = walk_attrs(attrs).ok()?;
    let mut attr_buf = BytesMut::new();
    for r in refs.iter() {
        if r.code == ATTR_MP_REACH_NLRI && !multi.is_empty() {
            let value = &attrs[r.value.clone()];
            let mut mp = BytesMut::new();
            mp.put(value);
            for prefix in multi.iter() {
                mp.put_u8(prefix.plen);
                mp.put(&prefix.prefix[..]);
            }
            let flags = attrs[r.attr.start] & !0x10;
            if mp.len() > 255 {
                attr_buf.put_u8(flags | 0x10);
                attr_buf.put_u8(ATTR_MP_REACH_NLRI);
                attr_buf.put_u16(mp.len() as u16);
            } else {
                attr_buf.put_u8(flags);
                attr_buf.put_u8(ATTR_MP_REACH_NLRI);
                attr_buf.put_u8(mp.len() as u8);
            }
            attr_buf.put(&mp[..]);
        } else {
            attr_buf.put(&attrs[r.attr.clone()]);
        }
    }

    let mut buf = BytesMut::new();
    let header: BytesMut = BgpHeader::new(BgpType::Update, BGP_HEADER_LEN).into();
    buf.put(&header[..]);
    buf.put_u16(0u16);
    buf.put_u16(attr_buf.len() as u16);
    buf.put(&attr_buf[..]);
    for prefix in plain.iter() {
        buf.put_u8(prefix.plen);
        buf.put(&prefix.prefix[..]);
    }

    const LENGTH_POS: std::ops::Range<usize> = 16..18;
    let length: u16 = buf.len() as u16;
    buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());
    Some(buf.to_vec())
}

async fn emit_table_stop(writer: &QueueWriter, session_id: u32, count: u32) {
    let mut bmf = Bmf::new(session_id, BmfType::TableStop);
    bmf.append(&count.to_be_bytes());
    writer.write(bmf).await;
}

/// Stream one session's Adj-RIB-In to the labeled publication as a paced
/// snapshot: table-start, one table-transfer per attribute node, then
/// table-stop carrying the message count. The walk takes one bucket read
/// lock at a time so labeling can progress on other buckets; it rechecks
/// the session's existence and the shutdown flag at every bucket boundary
/// and always ends with table-stop.
pub async fn send_rib_table(
    registry: &Registry,
    session_id: u32,
    writer: &QueueWriter,
    transfer_seconds: u64,
    shutdown: &Shutdown,
    last_action: &LastAction,
) -> u32 {
    let start = Instant::now();
    writer.write(Bmf::new(session_id, BmfType::TableStart)).await;

    let rib = registry.get(session_id).and_then(|s| s.rib_if_present());
    let Some(rib) = rib else {
        warn!("failed to send the rib table of session {}", session_id);
        emit_table_stop(writer, session_id, 0).await;
        return 0;
    };

    let buckets = rib.attr_bucket_count();
    let transfer_seconds = transfer_seconds.max(1);
    let mut indexes_per_second = buckets / transfer_seconds as usize;
    if indexes_per_second < 1 {
        indexes_per_second = 1;
        warn!(
            "session {}: indexes per second in table transfer is too low, set it to 1",
            session_id
        );
    }

    let mut sent: u32 = 0;
    let mut index_counter = 0usize;
    let mut blocks = 0u64;
    for i in 0..buckets {
        if index_counter == indexes_per_second {
            index_counter = 0;
            blocks += 1;
            last_action.touch();
            if shutdown.is_set() {
                emit_table_stop(writer, session_id, sent).await;
                return sent;
            }
            let desired = start + std::time::Duration::from_secs(blocks);
            let now = Instant::now();
            if desired > now {
                let ahead = desired - now;
                if ahead.as_secs() >= 2 {
                    tokio::time::sleep(ahead).await;
                    last_action.touch();
                }
            } else if (now - desired).as_secs() > 2 {
                warn!(
                    "session {}: table transfer running {}s behind schedule at bucket {}/{}",
                    session_id,
                    (now - desired).as_secs(),
                    i,
                    buckets
                );
            }
        }

        if !registry.exists(session_id) {
            info!("session {} closed while sending its rib", session_id);
            emit_table_stop(writer, session_id, sent).await;
            return sent;
        }

        for (attrs, prefixes) in rib.attr_bucket_snapshot(i) {
            let Some(update) = build_dump_update(&attrs, &prefixes) else {
                continue;
            };
            writer
                .write(Bmf::with_payload(session_id, BmfType::TableTransfer, update))
                .await;
            sent += 1;
        }
        index_counter += 1;
    }

    emit_table_stop(writer, session_id, sent).await;

    let elapsed = start.elapsed().as_secs();
    if elapsed > transfer_seconds {
        warn!("session {}: table transfer sending too slow", session_id);
    } else if elapsed < transfer_seconds {
        info!("session {}: table transfer finished early", session_id);
    }
    info!("successfully sent rib table of session {}", session_id);
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, LabelAction, ResolvedPeer};
    use crate::peer::fsm::FsmState;
    use crate::queue::{Publication, QueueOptions};
    use crate::session::Direction;
    use bgp_wire::{Nlri, UpdatePacket};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn seeded_registry() -> (Arc<Registry>, u32) {
        let registry = Registry::new(&GlobalConfig::default());
        let config = ResolvedPeer::mrt_synthetic(
            65001,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            LabelAction::Label,
        );
        let session = registry
            .create(Direction::Live, config, FsmState::Established, 0, 0)
            .unwrap();
        let rib = session.rib().unwrap();
        for third in 0..3u8 {
            let nlri = Nlri::new(Afi::Ip, Safi::Unicast, 24, vec![10, 0, third]);
            let entry = rib
                .intern_attrs(vec![0x40, 1, 1, 0], None, Some(0), None)
                .unwrap();
            rib.announce(&nlri, entry).unwrap();
        }
        (registry, session.id)
    }

    #[tokio::test]
    async fn dump_emits_start_transfers_stop() {
        let (registry, session_id) = seeded_registry();
        let publication = Publication::new("labeled", QueueOptions::default());
        let writer = publication.add_writer();
        let reader = publication.add_reader();

        let sent = send_rib_table(
            &registry,
            session_id,
            &writer,
            1,
            &Shutdown::new(),
            &LastAction::new(),
        )
        .await;
        assert_eq!(sent, 1);

        let mut messages = Vec::new();
        while messages.last().map(|b: &Arc<Bmf>| b.typ) != Some(BmfType::TableStop) {
            messages.extend(reader.read().await.unwrap());
        }
        assert_eq!(messages.first().unwrap().typ, BmfType::TableStart);
        let transfers: Vec<_> = messages
            .iter()
            .filter(|b| b.typ == BmfType::TableTransfer)
            .collect();
        assert_eq!(transfers.len(), 1);

        // The single attribute node carries all three prefixes.
        let (_, update) = UpdatePacket::parse_packet(&transfers[0].payload, false).unwrap();
        assert_eq!(update.announced.len(), 3);

        let stop = messages.last().unwrap();
        assert_eq!(stop.payload, 1u32.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn dump_of_missing_session_still_emits_stop() {
        let registry = Registry::new(&GlobalConfig::default());
        let publication = Publication::new("labeled", QueueOptions::default());
        let writer = publication.add_writer();
        let reader = publication.add_reader();

        let sent = send_rib_table(
            &registry,
            42,
            &writer,
            1,
            &Shutdown::new(),
            &LastAction::new(),
        )
        .await;
        assert_eq!(sent, 0);

        let mut messages = Vec::new();
        while messages.len() < 2 {
            messages.extend(reader.read().await.unwrap());
        }
        assert_eq!(messages[0].typ, BmfType::TableStart);
        assert_eq!(messages[1].typ, BmfType::TableStop);
    }
}
