use bytes::{BufMut, BytesMut};
use nom_derive::*;

use crate::{
    NotificationPacket, OpenPacket, RouteRefreshPacket, UpdatePacket, WireError,
};

pub const BGP_PACKET_LEN: usize = 4096;
pub const BGP_HEADER_LEN: u16 = 19;
pub const BGP_VERSION: u8 = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, NomBE)]
pub enum BgpType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
    Max = 6,
}

impl BgpType {
    pub fn from_u8(typ: u8) -> Option<Self> {
        match typ {
            1 => Some(Self::Open),
            2 => Some(Self::Update),
            3 => Some(Self::Notification),
            4 => Some(Self::Keepalive),
            5 => Some(Self::RouteRefresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, NomBE)]
pub struct BgpHeader {
    pub marker: [u8; 16],
    pub length: u16,
    pub typ: BgpType,
}

impl BgpHeader {
    pub fn new(typ: BgpType, length: u16) -> Self {
        Self {
            marker: [0xffu8; 16],
            length,
            typ,
        }
    }

    /// Decode and validate the 19-octet header. Errors carry the
    /// notification subcode mandated by RFC 4271 section 6.1.
    pub fn decode(input: &[u8]) -> Result<BgpHeader, WireError> {
        if input.len() < BGP_HEADER_LEN as usize {
            return Err(WireError::Truncated);
        }
        if input[0..16].iter().any(|b| *b != 0xff) {
            return Err(WireError::HeaderMarker);
        }
        let length = u16::from_be_bytes([input[16], input[17]]);
        if length < BGP_HEADER_LEN || length as usize > BGP_PACKET_LEN {
            return Err(WireError::HeaderLength(length));
        }
        let Some(typ) = BgpType::from_u8(input[18]) else {
            return Err(WireError::HeaderType(input[18]));
        };
        Ok(BgpHeader {
            marker: [0xffu8; 16],
            length,
            typ,
        })
    }
}

impl From<BgpHeader> for BytesMut {
    fn from(header: BgpHeader) -> Self {
        let mut buf = BytesMut::new();
        buf.put(&header.marker[..]);
        buf.put_u16(header.length);
        buf.put_u8(header.typ as u8);
        buf
    }
}

/// Total message length from an (at least partially) buffered header,
/// 0 if fewer than 18 octets are available.
pub fn peek_bgp_length(input: &[u8]) -> usize {
    if let Some(len) = input.get(16..18) {
        u16::from_be_bytes([len[0], len[1]]) as usize
    } else {
        0
    }
}

#[derive(Debug)]
pub enum BgpPacket {
    Open(Box<OpenPacket>),
    Keepalive(BgpHeader),
    Notification(NotificationPacket),
    Update(Box<UpdatePacket>),
    RouteRefresh(RouteRefreshPacket),
}

impl BgpPacket {
    /// Parse one whole message. `as4` selects 2- vs 4-octet AS_PATH
    /// decoding for UPDATE messages.
    pub fn parse_packet(input: &[u8], as4: bool) -> Result<(&[u8], BgpPacket), WireError> {
        let header = BgpHeader::decode(input)?;
        if input.len() < header.length as usize {
            return Err(WireError::Truncated);
        }
        match header.typ {
            BgpType::Open => {
                let (input, packet) = OpenPacket::parse_packet(input)?;
                Ok((input, BgpPacket::Open(Box::new(packet))))
            }
            BgpType::Update => {
                let (input, packet) = UpdatePacket::parse_packet(input, as4)?;
                Ok((input, BgpPacket::Update(Box::new(packet))))
            }
            BgpType::Notification => {
                let (input, packet) = NotificationPacket::parse_packet(input)?;
                Ok((input, BgpPacket::Notification(packet)))
            }
            BgpType::Keepalive => {
                if header.length != BGP_HEADER_LEN {
                    return Err(WireError::HeaderLength(header.length));
                }
                Ok((&input[header.length as usize..], BgpPacket::Keepalive(header)))
            }
            BgpType::RouteRefresh => {
                let (input, packet) = RouteRefreshPacket::parse_packet(input)?;
                Ok((input, BgpPacket::RouteRefresh(packet)))
            }
            BgpType::Max => Err(WireError::HeaderType(header.typ as u8)),
        }
    }
}
