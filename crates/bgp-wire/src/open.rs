use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::combinator::complete;
use nom::multi::many0;
use nom_derive::*;

use crate::{
    parse_cap_param, emit_cap_params, BgpHeader, BgpType, CapAs4, CapabilityPacket, WireError,
    BGP_VERSION,
};

#[derive(Debug, PartialEq, NomBE)]
pub struct OpenPacket {
    pub header: BgpHeader,
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: [u8; 4],
    pub opt_param_len: u8,
    #[nom(Ignore)]
    pub caps: Vec<CapabilityPacket>,
}

impl OpenPacket {
    pub fn new(
        asn: u16,
        hold_time: u16,
        router_id: &Ipv4Addr,
        caps: Vec<CapabilityPacket>,
    ) -> OpenPacket {
        OpenPacket {
            header: BgpHeader::new(BgpType::Open, 0),
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_id: router_id.octets(),
            opt_param_len: 0,
            caps,
        }
    }

    /// The peer's AS number: the 4-octet capability value when present,
    /// else the 2-octet field from the message body.
    pub fn peer_asn(&self) -> u32 {
        for cap in self.caps.iter() {
            if let CapabilityPacket::As4(CapAs4 { asn }) = cap {
                return *asn;
            }
        }
        self.asn as u32
    }

    pub fn router_id(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bgp_id[0], self.bgp_id[1], self.bgp_id[2], self.bgp_id[3])
    }

    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], OpenPacket), WireError> {
        let (input, mut packet) = OpenPacket::parse(input)?;
        if input.len() < packet.opt_param_len as usize {
            return Err(WireError::Truncated);
        }
        let (opts, input) = input.split_at(packet.opt_param_len as usize);
        let (_, caps) = many0(complete(parse_cap_param))(opts)?;
        packet.caps = caps.into_iter().flatten().collect();
        Ok((input, packet))
    }
}

impl From<OpenPacket> for BytesMut {
    fn from(open: OpenPacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = open.header.into();
        buf.put(&header[..]);
        buf.put_u8(open.version);
        buf.put_u16(open.asn);
        buf.put_u16(open.hold_time);
        buf.put(&open.bgp_id[..]);

        let mut opt_buf = BytesMut::new();
        emit_cap_params(&open.caps, &mut opt_buf);
        buf.put_u8(opt_buf.len() as u8);
        buf.put(&opt_buf[..]);

        const LENGTH_POS: std::ops::Range<usize> = 16..18;
        let length: u16 = buf.len() as u16;
        buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());

        buf
    }
}

impl fmt::Display for OpenPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Open Message:")?;
        writeln!(f, " AS: {} HoldTime: {}", self.asn, self.hold_time)?;
        for cap in self.caps.iter() {
            writeln!(f, " {}", cap)?;
        }
        Ok(())
    }
}
