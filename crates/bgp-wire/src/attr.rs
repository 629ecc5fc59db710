use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use nom::multi::count;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;
use nom_derive::*;

use crate::{parse_nlri_list, Afi, Nlri, Safi, WireError};

pub const ATTR_ORIGIN: u8 = 1;
pub const ATTR_AS_PATH: u8 = 2;
pub const ATTR_NEXT_HOP: u8 = 3;
pub const ATTR_MP_REACH_NLRI: u8 = 14;
pub const ATTR_MP_UNREACH_NLRI: u8 = 15;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u8 {
        const OPTIONAL = 0x80;
        const TRANSITIVE = 0x40;
        const PARTIAL = 0x20;
        const EXTENDED = 0x10;
    }
}

/// One attribute located inside a raw attribute region.
#[derive(Debug, Clone)]
pub struct AttrRef {
    pub flags: AttrFlags,
    pub code: u8,
    /// Whole attribute including its header.
    pub attr: Range<usize>,
    /// Value octets only.
    pub value: Range<usize>,
}

/// Walk a raw path-attribute region, yielding one `AttrRef` per attribute.
/// Every length is bounds-checked against the region before the attribute
/// is yielded.
pub fn walk_attrs(attrs: &[u8]) -> Result<Vec<AttrRef>, WireError> {
    let mut refs = Vec::new();
    let mut pos = 0usize;
    while pos < attrs.len() {
        if attrs.len() - pos < 2 {
            return Err(WireError::MalformedAttributeList);
        }
        let flags = AttrFlags::from_bits_retain(attrs[pos]);
        let code = attrs[pos + 1];
        let (hdr_len, len) = if flags.contains(AttrFlags::EXTENDED) {
            if attrs.len() - pos < 4 {
                return Err(WireError::AttributeLength(pos));
            }
            (4, u16::from_be_bytes([attrs[pos + 2], attrs[pos + 3]]) as usize)
        } else {
            if attrs.len() - pos < 3 {
                return Err(WireError::AttributeLength(pos));
            }
            (3, attrs[pos + 2] as usize)
        };
        if attrs.len() - pos - hdr_len < len {
            return Err(WireError::AttributeLength(pos));
        }
        refs.push(AttrRef {
            flags,
            code,
            attr: pos..pos + hdr_len + len,
            value: pos + hdr_len..pos + hdr_len + len,
        });
        pos += hdr_len + len;
    }
    Ok(refs)
}

/// Offsets into the raw attribute region for the attributes the labeling
/// path needs without re-walking the whole list.
#[derive(Debug, Clone, Default)]
pub struct AttrOffsets {
    pub origin: Option<Range<usize>>,
    pub as_path: Option<Range<usize>>,
    pub next_hop: Option<Range<usize>>,
    pub mp_reach: Option<Range<usize>>,
    pub mp_unreach: Option<Range<usize>>,
}

impl AttrOffsets {
    pub fn from_refs(refs: &[AttrRef]) -> Self {
        let mut offsets = Self::default();
        for r in refs.iter() {
            match r.code {
                ATTR_ORIGIN => offsets.origin = Some(r.value.clone()),
                ATTR_AS_PATH => offsets.as_path = Some(r.value.clone()),
                ATTR_NEXT_HOP => offsets.next_hop = Some(r.value.clone()),
                ATTR_MP_REACH_NLRI => offsets.mp_reach = Some(r.value.clone()),
                ATTR_MP_UNREACH_NLRI => offsets.mp_unreach = Some(r.value.clone()),
                _ => {}
            }
        }
        offsets
    }
}

/// Re-emit one attribute with its length field in minimal form and the
/// extended-length and partial bits normalized.
fn emit_canonical(attrs: &[u8], r: &AttrRef, out: &mut BytesMut) {
    let value = &attrs[r.value.clone()];
    let mut flags = r.flags & !(AttrFlags::PARTIAL | AttrFlags::EXTENDED);
    if value.len() > 255 {
        flags |= AttrFlags::EXTENDED;
    }
    out.put_u8(flags.bits());
    out.put_u8(r.code);
    if value.len() > 255 {
        out.put_u16(value.len() as u16);
    } else {
        out.put_u8(value.len() as u8);
    }
    out.put(value);
}

/// Canonical form of an attribute region for attribute-table keying:
/// every attribute re-emitted with normalized flag bits, MP_REACH_NLRI
/// reduced to its next-hop (the per-message NLRI list must not make
/// otherwise-identical paths distinct), MP_UNREACH_NLRI dropped entirely.
pub fn canonical_attrs(attrs: &[u8], refs: &[AttrRef]) -> Vec<u8> {
    let mut out = BytesMut::new();
    for r in refs.iter() {
        match r.code {
            ATTR_MP_UNREACH_NLRI => {}
            ATTR_MP_REACH_NLRI => {
                let value = &attrs[r.value.clone()];
                // afi(2) + safi(1) + nhlen(1) + nexthop(nhlen) + reserved(1)
                if value.len() >= 4 {
                    let nhlen = value[3] as usize;
                    let keep = (4 + nhlen + 1).min(value.len());
                    out.put_u8((r.flags & !(AttrFlags::PARTIAL | AttrFlags::EXTENDED)).bits());
                    out.put_u8(r.code);
                    out.put_u8(keep as u8);
                    out.put(&value[..keep]);
                }
            }
            _ => emit_canonical(attrs, r, &mut out),
        }
    }
    out.to_vec()
}

pub const AS_SET: u8 = 1;
pub const AS_SEQ: u8 = 2;
pub const AS_CONFED_SEQ: u8 = 3;
pub const AS_CONFED_SET: u8 = 4;

#[derive(Debug, NomBE)]
pub struct AsSegmentHeader {
    pub typ: u8,
    pub length: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AsSegment {
    pub typ: u8,
    pub asn: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AsPath {
    pub segs: Vec<AsSegment>,
}

fn parse_as2_segment(input: &[u8]) -> IResult<&[u8], AsSegment> {
    let (input, header) = AsSegmentHeader::parse(input)?;
    let (input, asns) = count(be_u16, header.length as usize)(input)?;
    let segment = AsSegment {
        typ: header.typ,
        asn: asns.into_iter().map(u32::from).collect(),
    };
    Ok((input, segment))
}

fn parse_as4_segment(input: &[u8]) -> IResult<&[u8], AsSegment> {
    let (input, header) = AsSegmentHeader::parse(input)?;
    let (input, asns) = count(be_u32, header.length as usize)(input)?;
    let segment = AsSegment {
        typ: header.typ,
        asn: asns,
    };
    Ok((input, segment))
}

impl AsPath {
    /// Parse an AS_PATH attribute value under the session's negotiated
    /// AS-number width.
    pub fn parse_value(value: &[u8], as4: bool) -> Result<AsPath, WireError> {
        let mut segs = Vec::new();
        let mut rest = value;
        while !rest.is_empty() {
            let (next, seg) = if as4 {
                parse_as4_segment(rest).map_err(|_| WireError::MalformedAsPath)?
            } else {
                parse_as2_segment(rest).map_err(|_| WireError::MalformedAsPath)?
            };
            segs.push(seg);
            rest = next;
        }
        Ok(AsPath { segs })
    }
}

pub fn asn_to_string(val: u32) -> String {
    if val > 65535 {
        let hval: u32 = (val & 0xFFFF0000) >> 16;
        let lval: u32 = val & 0x0000FFFF;
        hval.to_string() + "." + &lval.to_string()
    } else {
        val.to_string()
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in self.segs.iter() {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            let v = seg
                .asn
                .iter()
                .map(|x| asn_to_string(*x))
                .collect::<Vec<String>>()
                .join(" ");
            match seg.typ {
                AS_SET => write!(f, "{{{v}}}")?,
                AS_CONFED_SEQ => write!(f, "({v})")?,
                AS_CONFED_SET => write!(f, "[{v}]")?,
                _ => write!(f, "{v}")?,
            }
        }
        Ok(())
    }
}

/// MP_REACH_NLRI, RFC 4760. The next-hop stays a raw length-delimited byte
/// string: it may be one v4 address, one v6 address, or a v6 address plus
/// its link-local companion, and interpretation belongs to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MpReach {
    pub afi: Afi,
    pub safi: Safi,
    pub next_hop: Vec<u8>,
    pub nlri: Vec<Nlri>,
}

impl MpReach {
    pub fn parse_value(value: &[u8]) -> Result<MpReach, WireError> {
        let (value, afi) = Afi::parse(value)?;
        let (value, safi) = Safi::parse(value)?;
        let (value, nhlen) = be_u8(value)?;
        if value.len() < nhlen as usize + 1 {
            return Err(WireError::Truncated);
        }
        let next_hop = value[..nhlen as usize].to_vec();
        // One reserved octet between next-hop and NLRI.
        let nlri = parse_nlri_list(&value[nhlen as usize + 1..], afi, safi)?;
        Ok(MpReach {
            afi,
            safi,
            next_hop,
            nlri,
        })
    }

    /// Emit the attribute in its standard shape (value part only).
    pub fn emit_value(&self, buf: &mut BytesMut) {
        let afi: u16 = self.afi.into();
        buf.put_u16(afi);
        buf.put_u8(self.safi.into());
        buf.put_u8(self.next_hop.len() as u8);
        buf.put(&self.next_hop[..]);
        buf.put_u8(0);
        for nlri in self.nlri.iter() {
            nlri.emit(buf);
        }
    }
}

/// MP_UNREACH_NLRI, RFC 4760.
#[derive(Debug, Clone, PartialEq)]
pub struct MpUnreach {
    pub afi: Afi,
    pub safi: Safi,
    pub nlri: Vec<Nlri>,
}

impl MpUnreach {
    pub fn parse_value(value: &[u8]) -> Result<MpUnreach, WireError> {
        let (value, afi) = Afi::parse(value)?;
        let (value, safi) = Safi::parse(value)?;
        let nlri = parse_nlri_list(value, afi, safi)?;
        Ok(MpUnreach { afi, safi, nlri })
    }
}
