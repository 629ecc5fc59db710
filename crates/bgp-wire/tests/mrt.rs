use bgp_wire::*;
use hex_literal::hex;

#[test]
fn parse_mrt_header() {
    const HEADER: &[u8] = &hex!("66 a0 00 00 00 0d 00 02 00 00 00 20");
    let header = MrtHeader::decode(HEADER).unwrap();
    assert_eq!(header.typ, MRT_TABLE_DUMP_V2);
    assert_eq!(
        TableDumpSubtype::from(header.subtype),
        TableDumpSubtype::RibIpv4Unicast
    );
    assert_eq!(header.length, 32);
}

#[test]
fn subtype_mappings() {
    assert_eq!(
        TableDumpSubtype::RibIpv4Unicast.afi_safi(),
        Some((Afi::Ip, Safi::Unicast))
    );
    assert_eq!(
        TableDumpSubtype::RibIpv6Unicast.afi_safi(),
        Some((Afi::Ip6, Safi::Unicast))
    );
    assert_eq!(
        TableDumpSubtype::RibIpv4Multicast.afi_safi(),
        Some((Afi::Ip, Safi::Multicast))
    );
    assert_eq!(TableDumpSubtype::PeerIndexTable.afi_safi(), None);
    assert_eq!(TableDumpSubtype::from(9), TableDumpSubtype::Unknown(9));
}

#[test]
fn parse_peer_index_table() {
    // Collector 198.51.100.1, empty view name, one peer: type 0x02
    // (IPv4 address, 4-octet AS), BGP id 10.0.0.1, address 192.0.2.1,
    // AS 65010.
    const BODY: &[u8] = &hex!(
        "
c6 33 64 01
00 00
00 01
02 0a 00 00 01 c0 00 02 01 00 00 fd f2
"
    );
    let table = PeerIndexTable::parse(BODY).unwrap();
    assert_eq!(table.collector_addr().to_string(), "198.51.100.1");
    assert_eq!(table.peers.len(), 1);
    let peer = &table.peers[0];
    assert_eq!(peer.addr.to_string(), "192.0.2.1");
    assert_eq!(peer.asn, 65010);
    assert!(peer.as4);
}

#[test]
fn parse_peer_index_table_mixed_widths() {
    // Two peers: an IPv6 one with a 4-octet AS, an IPv4 one with a
    // 2-octet AS.
    const BODY: &[u8] = &hex!(
        "
c6 33 64 01
00 04 74 65 73 74
00 02
03 0a 00 00 01 20 01 0d b8 00 00 00 00 00 00 00 00 00 00 00 01 00 01 00 00
00 0a 00 00 02 c0 00 02 02 fd f2
"
    );
    let table = PeerIndexTable::parse(BODY).unwrap();
    assert_eq!(table.peers.len(), 2);
    assert_eq!(table.peers[0].addr.to_string(), "2001:db8::1");
    assert_eq!(table.peers[0].asn, 65536);
    assert!(table.peers[0].as4);
    assert_eq!(table.peers[1].addr.to_string(), "192.0.2.2");
    assert_eq!(table.peers[1].asn, 65010);
    assert!(!table.peers[1].as4);
}

fn rib_entry_attrs() -> Vec<u8> {
    // ORIGIN igp, AS_PATH [65010] in the mandatory 4-octet encoding,
    // MP_REACH_NLRI in the abbreviated MRT shape: next-hop length and
    // next-hop only.
    hex!(
        "
40 01 01 00
40 02 06 02 01 00 00 fd f2
80 0e 05 04 c0 00 02 01
"
    )
    .to_vec()
}

#[test]
fn parse_rib_ipv4_unicast_record() {
    let attrs = rib_entry_attrs();
    let mut body = hex!("00 00 00 01 18 cb 00 71 00 01 00 00 00 00 00 00").to_vec();
    body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    body.extend_from_slice(&attrs);

    let record = RibAfiEntries::parse(&body, TableDumpSubtype::RibIpv4Unicast).unwrap();
    assert_eq!(record.sequence, 1);
    assert_eq!(record.plen, 24);
    assert_eq!(record.prefix, vec![0xcb, 0x00, 0x71]);
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].peer_index, 0);
    assert_eq!(record.entries[0].attrs, attrs);
}

#[test]
fn synthesized_update_reshapes_mp_reach() {
    let update = synthesize_update(
        Afi::Ip,
        Safi::Unicast,
        24,
        &[203, 0, 113, 0],
        &rib_entry_attrs(),
    )
    .unwrap();

    // The MP_REACH_NLRI attribute must now be in its RFC 4760 shape.
    let (_, packet) = UpdatePacket::parse_packet(&update, true).unwrap();
    let mp = packet.mp_reach.as_ref().unwrap();
    assert_eq!(mp.afi, Afi::Ip);
    assert_eq!(mp.safi, Safi::Unicast);
    assert_eq!(mp.next_hop, vec![192, 0, 2, 1]);
    assert_eq!(mp.nlri.len(), 1);
    assert_eq!(mp.nlri[0].to_string(), "203.0.113.0/24");

    // Exact value bytes: AFI, SAFI, NH_LEN, NH, Reserved, NLRI.
    let range = packet.offsets.mp_reach.clone().unwrap();
    assert_eq!(
        &packet.attrs[range],
        &hex!("00 01 01 04 c0 00 02 01 00 18 cb 00 71")
    );

    // The other attributes are carried verbatim.
    assert_eq!(packet.origin(), Some(0));
    let path = packet.as_path(true).unwrap().unwrap();
    assert_eq!(path.segs[0].asn, vec![65010]);
}

#[test]
fn synthesized_ipv4_without_mp_reach_uses_plain_nlri() {
    // NEXT_HOP instead of MP_REACH_NLRI.
    let attrs = hex!(
        "
40 01 01 00
40 02 06 02 01 00 00 fd f2
40 03 04 c0 00 02 01
"
    );
    let update = synthesize_update(Afi::Ip, Safi::Unicast, 24, &[203, 0, 113, 0], &attrs).unwrap();
    let (_, packet) = UpdatePacket::parse_packet(&update, true).unwrap();
    assert!(packet.mp_reach.is_none());
    assert_eq!(packet.announced.len(), 1);
    assert_eq!(packet.announced[0].to_string(), "203.0.113.0/24");
}

#[test]
fn synthesized_ipv6_without_mp_reach_is_an_error() {
    let attrs = hex!("40 01 01 00");
    let result = synthesize_update(
        Afi::Ip6,
        Safi::Unicast,
        64,
        &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0],
        &attrs,
    );
    assert!(result.is_err());
}

#[test]
fn synthesized_update_reparses_to_the_mrt_prefix() {
    // Round trip: the prefix and family survive synthesis.
    let update = synthesize_update(
        Afi::Ip6,
        Safi::Unicast,
        48,
        &[0x20, 0x01, 0x0d, 0xb8, 0x00, 0x01],
        &hex!("80 0e 11 10 20 01 0d b8 00 00 00 00 00 00 00 00 00 00 00 02"),
    )
    .unwrap();
    let (_, packet) = UpdatePacket::parse_packet(&update, true).unwrap();
    let mp = packet.mp_reach.as_ref().unwrap();
    assert_eq!(mp.afi, Afi::Ip6);
    assert_eq!(mp.nlri[0].to_string(), "2001:db8:1::/48");
    assert_eq!(mp.next_hop.len(), 16);
}
