use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::{Afi, Safi, WireError};

/// Number of octets needed to carry `plen` prefix bits.
pub fn nlri_psize(plen: u8) -> usize {
    (plen as usize + 7) / 8
}

/// One NLRI as carried in an UPDATE, tagged with the address family it was
/// decoded under so it can be labeled independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nlri {
    pub afi: Afi,
    pub safi: Safi,
    pub plen: u8,
    pub prefix: Vec<u8>,
}

impl Nlri {
    pub fn new(afi: Afi, safi: Safi, plen: u8, prefix: Vec<u8>) -> Self {
        Self {
            afi,
            safi,
            plen,
            prefix,
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self.afi {
            Afi::Ip6 => {
                let mut octets = [0u8; 16];
                octets[..self.prefix.len().min(16)]
                    .copy_from_slice(&self.prefix[..self.prefix.len().min(16)]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => {
                let mut octets = [0u8; 4];
                octets[..self.prefix.len().min(4)]
                    .copy_from_slice(&self.prefix[..self.prefix.len().min(4)]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
        }
    }

    pub fn to_ipnet(&self) -> Option<IpNet> {
        match self.addr() {
            IpAddr::V4(addr) => Ipv4Net::new(addr, self.plen).ok().map(IpNet::V4),
            IpAddr::V6(addr) => Ipv6Net::new(addr, self.plen).ok().map(IpNet::V6),
        }
    }

    pub fn emit(&self, buf: &mut BytesMut) {
        buf.put_u8(self.plen);
        buf.put(&self.prefix[..nlri_psize(self.plen)]);
    }
}

impl fmt::Display for Nlri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.plen)
    }
}

/// Parse a run of (length, prefix) pairs covering exactly `input`.
pub fn parse_nlri_list(input: &[u8], afi: Afi, safi: Safi) -> Result<Vec<Nlri>, WireError> {
    let mut nlris = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let plen = rest[0];
        if plen > afi.max_prefix_len() {
            return Err(WireError::InvalidNetworkField);
        }
        let psize = nlri_psize(plen);
        if rest.len() < 1 + psize {
            return Err(WireError::InvalidNetworkField);
        }
        nlris.push(Nlri::new(afi, safi, plen, rest[1..1 + psize].to_vec()));
        rest = &rest[1 + psize..];
    }
    Ok(nlris)
}
