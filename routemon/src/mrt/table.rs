use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{info, warn};

use bgp_wire::{
    walk_attrs, AsPath, WireError, ATTR_AS_PATH, BGP_HEADER_LEN,
};

use crate::bmf::{Bmf, BmfType};
use crate::context::LastAction;
use crate::peer::fsm::{Event, FsmState};
use crate::peer::AS_TRANS;
use crate::queue::QueueWriter;
use crate::session::Session;

/// Synthesized updates accumulated for one peer of an MRT table dump,
/// held back until a live session confirms the peer's AS-number width.
#[derive(Debug)]
pub struct TableBuffer {
    pub session: Arc<Session>,
    pub messages: Vec<Vec<u8>>,
    pub sent: bool,
}

impl TableBuffer {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            messages: Vec::new(),
            sent: false,
        }
    }
}

/// Rewrite the AS_PATH attribute of a synthesized UPDATE from the 4-octet
/// encoding MRT mandates down to 2-octet, for sessions negotiated at
/// width 2. AS numbers beyond 16 bits become AS_TRANS.
pub fn as_path_to_2_octet(update: &[u8]) -> Result<Vec<u8>, WireError> {
    let header_len = BGP_HEADER_LEN as usize;
    if update.len() < header_len + 4 {
        return Err(WireError::Truncated);
    }
    let withdraw_len =
        u16::from_be_bytes([update[header_len], update[header_len + 1]]) as usize;
    let attr_len_pos = header_len + 2 + withdraw_len;
    if update.len() < attr_len_pos + 2 {
        return Err(WireError::Truncated);
    }
    let attr_len = u16::from_be_bytes([update[attr_len_pos], update[attr_len_pos + 1]]) as usize;
    let attr_start = attr_len_pos + 2;
    if update.len() < attr_start + attr_len {
        return Err(WireError::Truncated);
    }
    let attrs = &update[attr_start..attr_start + attr_len];

    let mut attr_buf = BytesMut::new();
    for r in walk_attrs(attrs)? {
        if r.code != ATTR_AS_PATH {
            attr_buf.put(&attrs[r.attr.clone()]);
            continue;
        }
        let path = AsPath::parse_value(&attrs[r.value.clone()], true)?;
        let mut value = BytesMut::new();
        for seg in path.segs.iter() {
            value.put_u8(seg.typ);
            value.put_u8(seg.asn.len() as u8);
            for asn in seg.asn.iter() {
                let short = if *asn > u16::MAX as u32 {
                    AS_TRANS
                } else {
                    *asn as u16
                };
                value.put_u16(short);
            }
        }
        let flags = attrs[r.attr.start] & !0x10;
        if value.len() > 255 {
            attr_buf.put_u8(flags | 0x10);
            attr_buf.put_u8(ATTR_AS_PATH);
            attr_buf.put_u16(value.len() as u16);
        } else {
            attr_buf.put_u8(flags);
            attr_buf.put_u8(ATTR_AS_PATH);
            attr_buf.put_u8(value.len() as u8);
        }
        attr_buf.put(&value[..]);
    }

    let mut out = BytesMut::new();
    out.put(&update[..attr_len_pos]);
    out.put_u16(attr_buf.len() as u16);
    out.put(&attr_buf[..]);
    out.put(&update[attr_start + attr_len..]);

    const LENGTH_POS: std::ops::Range<usize> = 16..18;
    let length: u16 = out.len() as u16;
    out[LENGTH_POS].copy_from_slice(&length.to_be_bytes());
    Ok(out.to_vec())
}

/// Write one peer's accumulated table to the MRT publication as
/// table-transfer messages, chunked to a quarter of the publication's
/// capacity between yields.
pub async fn write_table_to_queue(
    buffer: &mut TableBuffer,
    writer: &QueueWriter,
    last_action: &LastAction,
) {
    let chunk = (writer.publication().capacity() / 4).max(1);
    let session = &buffer.session;
    let two_octet = session.as_width() == 2;

    let mut written = 0usize;
    for message in buffer.messages.drain(..) {
        let payload = if two_octet {
            match as_path_to_2_octet(&message) {
                Ok(converted) => converted,
                Err(err) => {
                    warn!(
                        "session {}: dropping table entry: {}",
                        session.id, err
                    );
                    continue;
                }
            }
        } else {
            message
        };
        writer
            .write(Bmf::with_payload(session.id, BmfType::TableTransfer, payload))
            .await;
        written += 1;
        if written % chunk == 0 {
            last_action.touch();
            tokio::task::yield_now().await;
        }
    }
    buffer.sent = true;
    info!(
        "session {}: table of {} messages sent to the MRT queue",
        session.id, written
    );
}

/// A peer that never saw its live confirmation: clear the RIB and park the
/// synthetic session back in Error.
pub fn expire_table(buffer: &mut TableBuffer) {
    let session = &buffer.session;
    info!(
        "no live confirmation for session {}, deleting its table",
        session.id
    );
    session.set_state(FsmState::Error, Event::ManualStop);
    session.take_rib();
    buffer.messages.clear();
    buffer.sent = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_wire::{synthesize_update, Afi, Safi, UpdatePacket};

    fn synthesized() -> Vec<u8> {
        // ORIGIN igp + AS_PATH (4-octet) [70000 65001] + MP_REACH in MRT
        // shape (nhlen 4, nexthop 192.0.2.1).
        let mut attrs: Vec<u8> = vec![0x40, 1, 1, 0];
        attrs.extend_from_slice(&[0x40, 2, 10, 2, 2]);
        attrs.extend_from_slice(&70000u32.to_be_bytes());
        attrs.extend_from_slice(&65001u32.to_be_bytes());
        attrs.extend_from_slice(&[0x80, 14, 5, 4, 192, 0, 2, 1]);
        synthesize_update(Afi::Ip, Safi::Unicast, 24, &[203, 0, 113, 0], &attrs)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn conversion_maps_wide_asn_to_as_trans() {
        let converted = as_path_to_2_octet(&synthesized()).unwrap();
        let (_, packet) = UpdatePacket::parse_packet(&converted, false).unwrap();
        let path = packet.as_path(false).unwrap().unwrap();
        assert_eq!(path.segs[0].asn, vec![AS_TRANS as u32, 65001]);
    }

    #[test]
    fn conversion_preserves_other_attributes() {
        let converted = as_path_to_2_octet(&synthesized()).unwrap();
        let (_, packet) = UpdatePacket::parse_packet(&converted, false).unwrap();
        assert_eq!(packet.origin(), Some(0));
        let mp = packet.mp_reach.unwrap();
        assert_eq!(mp.next_hop, vec![192, 0, 2, 1]);
        assert_eq!(mp.nlri.len(), 1);
        assert_eq!(mp.nlri[0].plen, 24);
    }
}
