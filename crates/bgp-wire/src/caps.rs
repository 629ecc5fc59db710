use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::error::{make_error, ErrorKind};
use nom::multi::many0;
use nom::combinator::complete;
use nom::number::complete::be_u32;
use nom::IResult;
use nom_derive::*;

use crate::{Afi, Safi};

/// Optional parameter type carrying capabilities, RFC 5492.
pub const OPT_PARAM_CAPABILITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapCode {
    MultiProtocol,
    RouteRefresh,
    As4,
    RouteRefreshCisco,
    Unknown(u8),
}

impl From<u8> for CapCode {
    fn from(code: u8) -> Self {
        use CapCode::*;
        match code {
            1 => MultiProtocol,
            2 => RouteRefresh,
            65 => As4,
            128 => RouteRefreshCisco,
            v => Unknown(v),
        }
    }
}

impl From<CapCode> for u8 {
    fn from(code: CapCode) -> Self {
        use CapCode::*;
        match code {
            MultiProtocol => 1,
            RouteRefresh => 2,
            As4 => 65,
            RouteRefreshCisco => 128,
            Unknown(v) => v,
        }
    }
}

#[derive(Debug, Default, PartialEq, NomBE, Clone)]
pub struct CapabilityHeader {
    pub code: u8,
    pub length: u8,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct CapMultiProtocol {
    pub afi: Afi,
    pub safi: Safi,
}

impl CapMultiProtocol {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, afi) = Afi::parse(input)?;
        let (input, _res) = nom::number::complete::be_u8(input)?;
        let (input, safi) = Safi::parse(input)?;
        Ok((input, Self { afi, safi }))
    }
}

impl fmt::Display for CapMultiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiProtocol: {}/{}", self.afi, self.safi)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct CapAs4 {
    pub asn: u32,
}

impl CapAs4 {
    pub fn new(asn: u32) -> Self {
        Self { asn }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Hash)]
pub struct CapRefresh {
    pub cisco: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct CapUnknown {
    pub code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum CapabilityPacket {
    MultiProtocol(CapMultiProtocol),
    RouteRefresh(CapRefresh),
    As4(CapAs4),
    Unknown(CapUnknown),
}

impl CapabilityPacket {
    pub fn parse_cap(input: &[u8]) -> IResult<&[u8], CapabilityPacket> {
        let (input, header) = CapabilityHeader::parse(input)?;
        if input.len() < header.length as usize {
            return Err(nom::Err::Error(make_error(input, ErrorKind::LengthValue)));
        }
        let (cap, input) = input.split_at(header.length as usize);
        let packet = match CapCode::from(header.code) {
            CapCode::MultiProtocol => {
                let (_, mp) = CapMultiProtocol::parse(cap)?;
                CapabilityPacket::MultiProtocol(mp)
            }
            CapCode::RouteRefresh => {
                CapabilityPacket::RouteRefresh(CapRefresh { cisco: false })
            }
            CapCode::RouteRefreshCisco => {
                CapabilityPacket::RouteRefresh(CapRefresh { cisco: true })
            }
            CapCode::As4 => {
                let (_, asn) = be_u32(cap)?;
                CapabilityPacket::As4(CapAs4 { asn })
            }
            CapCode::Unknown(code) => CapabilityPacket::Unknown(CapUnknown {
                code,
                data: cap.to_vec(),
            }),
        };
        Ok((input, packet))
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::MultiProtocol(_) => CapCode::MultiProtocol.into(),
            Self::RouteRefresh(m) => {
                if m.cisco {
                    CapCode::RouteRefreshCisco.into()
                } else {
                    CapCode::RouteRefresh.into()
                }
            }
            Self::As4(_) => CapCode::As4.into(),
            Self::Unknown(m) => m.code,
        }
    }

    /// Value octets as they appear on the wire, used when a capability must
    /// be echoed back in notification data.
    pub fn value_bytes(&self) -> Vec<u8> {
        match self {
            Self::MultiProtocol(m) => {
                let afi: u16 = m.afi.into();
                let safi: u8 = m.safi.into();
                let mut v = afi.to_be_bytes().to_vec();
                v.push(0);
                v.push(safi);
                v
            }
            Self::RouteRefresh(_) => Vec::new(),
            Self::As4(m) => m.asn.to_be_bytes().to_vec(),
            Self::Unknown(m) => m.data.clone(),
        }
    }

    /// Emit this capability as code, length, value.
    pub fn encode(&self, buf: &mut BytesMut) {
        let value = self.value_bytes();
        buf.put_u8(self.code());
        buf.put_u8(value.len() as u8);
        buf.put(&value[..]);
    }
}

impl fmt::Display for CapabilityPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiProtocol(v) => write!(f, "{}", v),
            Self::RouteRefresh(v) => {
                if v.cisco {
                    write!(f, "Route Refresh (Cisco)")
                } else {
                    write!(f, "Route Refresh")
                }
            }
            Self::As4(v) => write!(f, "4 Octet AS: {}", v.asn),
            Self::Unknown(v) => write!(f, "Unknown capability {}", v.code),
        }
    }
}

/// Parse one optional parameter; capability parameters may hold several
/// capabilities back to back.
pub fn parse_cap_param(input: &[u8]) -> IResult<&[u8], Vec<CapabilityPacket>> {
    let (input, header) = CapabilityHeader::parse(input)?;
    if header.code != OPT_PARAM_CAPABILITY {
        let (input, _skipped) = take(header.length as usize)(input)?;
        return Ok((input, Vec::new()));
    }
    if input.len() < header.length as usize {
        return Err(nom::Err::Error(make_error(input, ErrorKind::LengthValue)));
    }
    let (opts, input) = input.split_at(header.length as usize);
    let (_, caps) = many0(complete(CapabilityPacket::parse_cap))(opts)?;
    Ok((input, caps))
}

/// Emit a capability list as optional parameters, one parameter per
/// capability.
pub fn emit_cap_params(caps: &[CapabilityPacket], buf: &mut BytesMut) {
    for cap in caps.iter() {
        let mut cap_buf = BytesMut::new();
        cap.encode(&mut cap_buf);
        buf.put_u8(OPT_PARAM_CAPABILITY);
        buf.put_u8(cap_buf.len() as u8);
        buf.put(&cap_buf[..]);
    }
}
