use nom::number::complete::{be_u16, be_u8};
use nom::IResult;
use serde::Serialize;
use strum_macros::Display;

#[derive(Debug, Default, PartialEq, Eq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Display)]
pub enum Afi {
    #[default]
    #[strum(serialize = "IPv4")]
    Ip,
    #[strum(serialize = "IPv6")]
    Ip6,
    #[strum(to_string = "Unknown({0})")]
    Unknown(u16),
}

#[derive(Debug, Default, PartialEq, Eq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Display)]
pub enum Safi {
    #[default]
    Unicast,
    Multicast,
    #[strum(to_string = "Unknown({0})")]
    Unknown(u8),
}

#[derive(Debug, Default, PartialEq, Eq, Ord, PartialOrd, Clone, Copy, Hash, Serialize)]
pub struct AfiSafi {
    pub afi: Afi,
    pub safi: Safi,
}

impl AfiSafi {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }
}

impl From<Afi> for u16 {
    fn from(afi: Afi) -> Self {
        use Afi::*;
        match afi {
            Ip => 1,
            Ip6 => 2,
            Unknown(v) => v,
        }
    }
}

impl From<u16> for Afi {
    fn from(val: u16) -> Self {
        use Afi::*;
        match val {
            1 => Ip,
            2 => Ip6,
            v => Unknown(v),
        }
    }
}

impl From<Safi> for u8 {
    fn from(safi: Safi) -> Self {
        use Safi::*;
        match safi {
            Unicast => 1,
            Multicast => 2,
            Unknown(v) => v,
        }
    }
}

impl From<u8> for Safi {
    fn from(val: u8) -> Self {
        use Safi::*;
        match val {
            1 => Unicast,
            2 => Multicast,
            v => Unknown(v),
        }
    }
}

impl Afi {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, afi) = be_u16(input)?;
        Ok((input, afi.into()))
    }

    /// Maximum prefix length in bits for this address family.
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            Afi::Ip => 32,
            Afi::Ip6 => 128,
            Afi::Unknown(_) => 0,
        }
    }
}

impl Safi {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, safi) = be_u8(input)?;
        Ok((input, safi.into()))
    }
}
