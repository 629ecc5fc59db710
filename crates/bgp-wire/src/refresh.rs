use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::number::complete::be_u8;
use nom_derive::*;

use crate::{Afi, BgpHeader, BgpType, Safi, WireError, BGP_HEADER_LEN};

/// ROUTE-REFRESH message, RFC 2918. The pre-standard Cisco flavor shares
/// the body; only the capability code announcing it differs.
#[derive(Debug, Clone, PartialEq, NomBE)]
pub struct RouteRefreshPacket {
    pub header: BgpHeader,
    #[nom(Ignore)]
    pub afi: Afi,
    #[nom(Ignore)]
    pub safi: Safi,
}

impl RouteRefreshPacket {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self {
            header: BgpHeader::new(BgpType::RouteRefresh, BGP_HEADER_LEN + 4),
            afi,
            safi,
        }
    }

    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], RouteRefreshPacket), WireError> {
        let (input, mut packet) = RouteRefreshPacket::parse(input)?;
        if packet.header.length != BGP_HEADER_LEN + 4 {
            return Err(WireError::HeaderLength(packet.header.length));
        }
        let (input, afi) = Afi::parse(input)?;
        let (input, _res) = be_u8(input)?;
        let (input, safi) = Safi::parse(input)?;
        packet.afi = afi;
        packet.safi = safi;
        Ok((input, packet))
    }
}

impl From<RouteRefreshPacket> for BytesMut {
    fn from(refresh: RouteRefreshPacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = refresh.header.into();
        buf.put(&header[..]);
        let afi: u16 = refresh.afi.into();
        buf.put_u16(afi);
        buf.put_u8(0);
        buf.put_u8(refresh.safi.into());

        const LENGTH_POS: std::ops::Range<usize> = 16..18;
        let length: u16 = buf.len() as u16;
        buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());

        buf
    }
}

impl fmt::Display for RouteRefreshPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route Refresh: {}/{}", self.afi, self.safi)
    }
}
