use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use nom_derive::*;

use crate::{
    walk_attrs, Afi, BgpHeader, BgpType, Safi, WireError, ATTR_MP_REACH_NLRI, BGP_HEADER_LEN,
};

pub const MRT_HEADER_LEN: usize = 12;
pub const MRT_TABLE_DUMP_V2: u16 = 13;

/// TABLE_DUMP_V2 subtypes, RFC 6396 section 4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableDumpSubtype {
    PeerIndexTable,
    RibIpv4Unicast,
    RibIpv4Multicast,
    RibIpv6Unicast,
    RibIpv6Multicast,
    RibGeneric,
    Unknown(u16),
}

impl From<u16> for TableDumpSubtype {
    fn from(val: u16) -> Self {
        use TableDumpSubtype::*;
        match val {
            1 => PeerIndexTable,
            2 => RibIpv4Unicast,
            3 => RibIpv4Multicast,
            4 => RibIpv6Unicast,
            5 => RibIpv6Multicast,
            6 => RibGeneric,
            v => Unknown(v),
        }
    }
}

impl TableDumpSubtype {
    /// The (AFI, SAFI) a subtype-specific RIB record maps to.
    pub fn afi_safi(&self) -> Option<(Afi, Safi)> {
        use TableDumpSubtype::*;
        match self {
            RibIpv4Unicast => Some((Afi::Ip, Safi::Unicast)),
            RibIpv4Multicast => Some((Afi::Ip, Safi::Multicast)),
            RibIpv6Unicast => Some((Afi::Ip6, Safi::Unicast)),
            RibIpv6Multicast => Some((Afi::Ip6, Safi::Multicast)),
            _ => None,
        }
    }

    pub fn max_prefix_octets(&self) -> usize {
        use TableDumpSubtype::*;
        match self {
            RibIpv4Unicast | RibIpv4Multicast => 4,
            RibIpv6Unicast | RibIpv6Multicast => 16,
            _ => 0,
        }
    }
}

#[derive(Debug, PartialEq, Clone, NomBE)]
pub struct MrtHeader {
    pub timestamp: u32,
    pub typ: u16,
    pub subtype: u16,
    pub length: u32,
}

impl MrtHeader {
    pub fn decode(input: &[u8]) -> Result<MrtHeader, WireError> {
        let (_, header) = MrtHeader::parse(input).map_err(WireError::from)?;
        Ok(header)
    }
}

/// One peer from a PEER_INDEX_TABLE.
#[derive(Debug, Clone, PartialEq)]
pub struct MrtPeer {
    pub peer_type: u8,
    pub bgp_id: [u8; 4],
    pub addr: IpAddr,
    pub asn: u32,
    /// The index table carried a 4-octet AS for this peer.
    pub as4: bool,
}

const PEER_TYPE_IPV6: u8 = 0x01;
const PEER_TYPE_AS4: u8 = 0x02;

/// PEER_INDEX_TABLE, RFC 6396 section 4.3.1.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerIndexTable {
    pub collector_id: [u8; 4],
    pub peers: Vec<MrtPeer>,
}

impl PeerIndexTable {
    pub fn collector_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self.collector_id))
    }

    pub fn parse(input: &[u8]) -> Result<PeerIndexTable, WireError> {
        let mut pos = 0usize;
        let need = |pos: usize, n: usize| {
            if input.len() - pos < n {
                Err(WireError::Truncated)
            } else {
                Ok(())
            }
        };

        need(pos, 4)?;
        let mut collector_id = [0u8; 4];
        collector_id.copy_from_slice(&input[pos..pos + 4]);
        pos += 4;

        // View name: length-prefixed, content skipped.
        need(pos, 2)?;
        let view_len = u16::from_be_bytes([input[pos], input[pos + 1]]) as usize;
        pos += 2;
        need(pos, view_len)?;
        pos += view_len;

        need(pos, 2)?;
        let peer_count = u16::from_be_bytes([input[pos], input[pos + 1]]) as usize;
        pos += 2;

        let mut peers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            need(pos, 5)?;
            let peer_type = input[pos];
            pos += 1;
            let mut bgp_id = [0u8; 4];
            bgp_id.copy_from_slice(&input[pos..pos + 4]);
            pos += 4;

            let addr = if peer_type & PEER_TYPE_IPV6 != 0 {
                need(pos, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&input[pos..pos + 16]);
                pos += 16;
                IpAddr::V6(Ipv6Addr::from(octets))
            } else {
                need(pos, 4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&input[pos..pos + 4]);
                pos += 4;
                IpAddr::V4(Ipv4Addr::from(octets))
            };

            let as4 = peer_type & PEER_TYPE_AS4 != 0;
            let asn = if as4 {
                need(pos, 4)?;
                let asn = u32::from_be_bytes([
                    input[pos],
                    input[pos + 1],
                    input[pos + 2],
                    input[pos + 3],
                ]);
                pos += 4;
                asn
            } else {
                need(pos, 2)?;
                let asn = u16::from_be_bytes([input[pos], input[pos + 1]]) as u32;
                pos += 2;
                asn
            };

            peers.push(MrtPeer {
                peer_type,
                bgp_id,
                addr,
                asn,
                as4,
            });
        }
        Ok(PeerIndexTable {
            collector_id,
            peers,
        })
    }
}

/// One RIB entry of a subtype-specific record.
#[derive(Debug, Clone, PartialEq)]
pub struct RibEntry {
    pub peer_index: u16,
    pub originated: u32,
    pub attrs: Vec<u8>,
}

/// A subtype-specific RIB record (RIB_IPV4_UNICAST and friends),
/// RFC 6396 section 4.3.2.
#[derive(Debug, Clone, PartialEq)]
pub struct RibAfiEntries {
    pub subtype: TableDumpSubtype,
    pub sequence: u32,
    pub plen: u8,
    pub prefix: Vec<u8>,
    pub entries: Vec<RibEntry>,
}

impl RibAfiEntries {
    pub fn parse(input: &[u8], subtype: TableDumpSubtype) -> Result<RibAfiEntries, WireError> {
        let max_octets = subtype.max_prefix_octets();
        if max_octets == 0 {
            return Err(WireError::MrtSubtype(match subtype {
                TableDumpSubtype::Unknown(v) => v,
                _ => 0,
            }));
        }
        let mut pos = 0usize;
        let need = |pos: usize, n: usize| {
            if input.len() - pos < n {
                Err(WireError::Truncated)
            } else {
                Ok(())
            }
        };

        need(pos, 5)?;
        let sequence =
            u32::from_be_bytes([input[pos], input[pos + 1], input[pos + 2], input[pos + 3]]);
        pos += 4;
        let plen = input[pos];
        pos += 1;
        if plen as usize > max_octets * 8 {
            return Err(WireError::InvalidNetworkField);
        }
        let psize = crate::nlri_psize(plen);
        need(pos, psize)?;
        let prefix = input[pos..pos + psize].to_vec();
        pos += psize;

        need(pos, 2)?;
        let entry_count = u16::from_be_bytes([input[pos], input[pos + 1]]) as usize;
        pos += 2;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            need(pos, 8)?;
            let peer_index = u16::from_be_bytes([input[pos], input[pos + 1]]);
            pos += 2;
            let originated =
                u32::from_be_bytes([input[pos], input[pos + 1], input[pos + 2], input[pos + 3]]);
            pos += 4;
            let attr_len = u16::from_be_bytes([input[pos], input[pos + 1]]) as usize;
            pos += 2;
            need(pos, attr_len)?;
            entries.push(RibEntry {
                peer_index,
                originated,
                attrs: input[pos..pos + attr_len].to_vec(),
            });
            pos += attr_len;
        }
        Ok(RibAfiEntries {
            subtype,
            sequence,
            plen,
            prefix,
            entries,
        })
    }
}

/// Synthesize one standard BGP UPDATE from an MRT RIB entry.
///
/// The MRT encoding of MP_REACH_NLRI carries only (next-hop length,
/// next-hop); the AFI, SAFI, Reserved octet and the NLRI are re-inserted
/// here per RFC 4760. All other attributes are carried verbatim. An entry
/// with no MP_REACH_NLRI attribute gets the prefix as plain IPv4 NLRI; for
/// IPv6 that shape is unrepresentable and is an error.
pub fn synthesize_update(
    afi: Afi,
    safi: Safi,
    plen: u8,
    prefix: &[u8],
    attrs: &[u8],
) -> Result<BytesMut, WireError> {
    let refs = walk_attrs(attrs)?;

    let mut attr_buf = BytesMut::new();
    let mut have_mp_reach = false;
    for r in refs.iter() {
        if r.code == ATTR_MP_REACH_NLRI {
            have_mp_reach = true;
            let value = &attrs[r.value.clone()];
            if value.is_empty() || value.len() < 1 + value[0] as usize {
                return Err(WireError::AttributeLength(r.value.start));
            }
            let nhlen = value[0];
            let next_hop = &value[1..1 + nhlen as usize];

            let mut mp = BytesMut::new();
            let afi_val: u16 = afi.into();
            mp.put_u16(afi_val);
            mp.put_u8(safi.into());
            mp.put_u8(nhlen);
            mp.put(next_hop);
            mp.put_u8(0); // Reserved.
            mp.put_u8(plen);
            mp.put(&prefix[..crate::nlri_psize(plen)]);

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
    if !have_mp_reach && afi != Afi::Ip {
        return Err(WireError::InvalidNetworkField);
    }

    let mut buf = BytesMut::new();
    let header: BytesMut = BgpHeader::new(BgpType::Update, BGP_HEADER_LEN).into();
    buf.put(&header[..]);
    buf.put_u16(0u16); // No withdrawn routes.
    buf.put_u16(attr_buf.len() as u16);
    buf.put(&attr_buf[..]);
    if !have_mp_reach {
        buf.put_u8(plen);
        buf.put(&prefix[..crate::nlri_psize(plen)]);
    }

    const LENGTH_POS: std::ops::Range<usize> = 16..18;
    let length: u16 = buf.len() as u16;
    buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());

    Ok(buf)
}
