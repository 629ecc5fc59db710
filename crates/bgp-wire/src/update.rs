use std::fmt;

use bytes::{BufMut, BytesMut};
use nom_derive::*;

use crate::{
    canonical_attrs, walk_attrs, Afi, AsPath, AttrOffsets, AttrRef, BgpHeader, BgpType, MpReach,
    MpUnreach, Nlri, Safi, WireError, ATTR_MP_REACH_NLRI, ATTR_MP_UNREACH_NLRI, BGP_HEADER_LEN,
};

/// Which side of the RIB an NLRI touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlriDirection {
    Announce,
    Withdraw,
}

#[derive(NomBE)]
pub struct UpdatePacket {
    pub header: BgpHeader,
    /// IPv4 unicast withdrawn routes.
    #[nom(Ignore)]
    pub withdrawn: Vec<Nlri>,
    /// IPv4 unicast NLRI.
    #[nom(Ignore)]
    pub announced: Vec<Nlri>,
    /// Raw path-attribute region, exactly as received.
    #[nom(Ignore)]
    pub attrs: Vec<u8>,
    #[nom(Ignore)]
    pub attr_refs: Vec<AttrRef>,
    #[nom(Ignore)]
    pub offsets: AttrOffsets,
    #[nom(Ignore)]
    pub mp_reach: Option<MpReach>,
    #[nom(Ignore)]
    pub mp_unreach: Option<MpUnreach>,
}

impl Default for UpdatePacket {
    fn default() -> Self {
        Self {
            header: BgpHeader::new(BgpType::Update, BGP_HEADER_LEN + 4),
            withdrawn: Vec::new(),
            announced: Vec::new(),
            attrs: Vec::new(),
            attr_refs: Vec::new(),
            offsets: AttrOffsets::default(),
            mp_reach: None,
            mp_unreach: None,
        }
    }
}

impl UpdatePacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_packet(input: &[u8], as4: bool) -> Result<(&[u8], UpdatePacket), WireError> {
        let (body, mut packet) = UpdatePacket::parse(input)?;
        let total = packet.header.length as usize;
        if total < BGP_HEADER_LEN as usize {
            return Err(WireError::HeaderLength(packet.header.length));
        }
        if input.len() < total {
            return Err(WireError::Truncated);
        }
        let mut body = &body[..total - BGP_HEADER_LEN as usize];
        let rest = &input[total..];

        if body.len() < 2 {
            return Err(WireError::MalformedAttributeList);
        }
        let withdraw_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        body = &body[2..];
        if body.len() < withdraw_len {
            return Err(WireError::MalformedAttributeList);
        }
        packet.withdrawn =
            crate::parse_nlri_list(&body[..withdraw_len], Afi::Ip, Safi::Unicast)?;
        body = &body[withdraw_len..];

        if body.len() < 2 {
            return Err(WireError::MalformedAttributeList);
        }
        let attr_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        body = &body[2..];
        if body.len() < attr_len {
            return Err(WireError::MalformedAttributeList);
        }
        packet.attrs = body[..attr_len].to_vec();
        body = &body[attr_len..];

        packet.attr_refs = walk_attrs(&packet.attrs)?;
        packet.offsets = AttrOffsets::from_refs(&packet.attr_refs);

        // Validate AS_PATH under the negotiated width up front so a
        // malformed path is caught where the message can still be refused.
        if let Some(range) = packet.offsets.as_path.clone() {
            AsPath::parse_value(&packet.attrs[range], as4)?;
        }
        if let Some(range) = packet.offsets.mp_reach.clone() {
            packet.mp_reach = Some(MpReach::parse_value(&packet.attrs[range])?);
        }
        if let Some(range) = packet.offsets.mp_unreach.clone() {
            packet.mp_unreach = Some(MpUnreach::parse_value(&packet.attrs[range])?);
        }

        packet.announced = crate::parse_nlri_list(body, Afi::Ip, Safi::Unicast)?;
        Ok((rest, packet))
    }

    /// The AS_PATH of this update, if present.
    pub fn as_path(&self, as4: bool) -> Result<Option<AsPath>, WireError> {
        match self.offsets.as_path.clone() {
            Some(range) => Ok(Some(AsPath::parse_value(&self.attrs[range], as4)?)),
            None => Ok(None),
        }
    }

    pub fn origin(&self) -> Option<u8> {
        self.offsets
            .origin
            .clone()
            .and_then(|r| self.attrs.get(r.start).copied())
    }

    /// Next-hop octets: the NEXT_HOP attribute for IPv4 unicast, the
    /// MP_REACH_NLRI next-hop blob otherwise.
    pub fn next_hop_bytes(&self) -> Option<Vec<u8>> {
        if let Some(range) = self.offsets.next_hop.clone() {
            return Some(self.attrs[range].to_vec());
        }
        self.mp_reach.as_ref().map(|mp| mp.next_hop.clone())
    }

    /// Canonical attribute byte string used as the attribute-table key.
    pub fn canonical_attrs(&self) -> Vec<u8> {
        canonical_attrs(&self.attrs, &self.attr_refs)
    }

    /// Every NLRI of this update in on-wire order: withdrawn routes first,
    /// then the MP attributes at their positions in the attribute list,
    /// then the IPv4 unicast NLRI.
    pub fn nlri_wire_order(&self) -> Vec<(NlriDirection, &Nlri)> {
        let mut out: Vec<(NlriDirection, &Nlri)> = Vec::new();
        for nlri in self.withdrawn.iter() {
            out.push((NlriDirection::Withdraw, nlri));
        }
        for r in self.attr_refs.iter() {
            match r.code {
                ATTR_MP_UNREACH_NLRI => {
                    if let Some(mp) = self.mp_unreach.as_ref() {
                        for nlri in mp.nlri.iter() {
                            out.push((NlriDirection::Withdraw, nlri));
                        }
                    }
                }
                ATTR_MP_REACH_NLRI => {
                    if let Some(mp) = self.mp_reach.as_ref() {
                        for nlri in mp.nlri.iter() {
                            out.push((NlriDirection::Announce, nlri));
                        }
                    }
                }
                _ => {}
            }
        }
        for nlri in self.announced.iter() {
            out.push((NlriDirection::Announce, nlri));
        }
        out
    }

    /// True when the update announces or withdraws nothing at all.
    pub fn is_empty(&self) -> bool {
        self.withdrawn.is_empty()
            && self.announced.is_empty()
            && self.mp_reach.as_ref().map_or(true, |mp| mp.nlri.is_empty())
            && self
                .mp_unreach
                .as_ref()
                .map_or(true, |mp| mp.nlri.is_empty())
    }
}

impl From<UpdatePacket> for BytesMut {
    fn from(update: UpdatePacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = update.header.clone().into();
        buf.put(&header[..]);

        let withdraw_len_pos = buf.len();
        buf.put_u16(0u16); // Placeholder.
        for nlri in update.withdrawn.iter() {
            nlri.emit(&mut buf);
        }
        let withdraw_len = (buf.len() - withdraw_len_pos - 2) as u16;
        let withdraw_pos = withdraw_len_pos..withdraw_len_pos + 2;
        buf[withdraw_pos].copy_from_slice(&withdraw_len.to_be_bytes());

        buf.put_u16(update.attrs.len() as u16);
        buf.put(&update.attrs[..]);

        for nlri in update.announced.iter() {
            nlri.emit(&mut buf);
        }

        const LENGTH_POS: std::ops::Range<usize> = 16..18;
        let length: u16 = buf.len() as u16;
        buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());

        buf
    }
}

impl fmt::Debug for UpdatePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self)
    }
}

impl fmt::Display for UpdatePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Update Message:")?;
        if !self.announced.is_empty() {
            writeln!(f, " IPv4 Updates:")?;
            for nlri in self.announced.iter() {
                writeln!(f, "  {}", nlri)?;
            }
        }
        if !self.withdrawn.is_empty() {
            writeln!(f, " IPv4 Withdraw:")?;
            for nlri in self.withdrawn.iter() {
                writeln!(f, "  {}", nlri)?;
            }
        }
        if let Some(mp) = &self.mp_reach {
            writeln!(f, " MP Updates ({}/{}):", mp.afi, mp.safi)?;
            for nlri in mp.nlri.iter() {
                writeln!(f, "  {}", nlri)?;
            }
        }
        if let Some(mp) = &self.mp_unreach {
            writeln!(f, " MP Withdraw ({}/{}):", mp.afi, mp.safi)?;
            for nlri in mp.nlri.iter() {
                writeln!(f, "  {}", nlri)?;
            }
        }
        Ok(())
    }
}
