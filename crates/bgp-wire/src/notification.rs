use std::fmt::Display;

use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom_derive::*;

use crate::{BgpHeader, BgpType, WireError, BGP_HEADER_LEN};

#[derive(Debug, Clone, NomBE)]
pub struct NotificationPacket {
    pub header: BgpHeader,
    pub code: u8,
    pub sub_code: u8,
    #[nom(Ignore)]
    pub data: Vec<u8>,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NotifyCode {
    MsgHeaderError = 1,
    OpenMsgError = 2,
    UpdateMsgError = 3,
    HoldTimerExpired = 4,
    FsmError = 5,
    Cease = 6,
}

impl From<NotifyCode> for u8 {
    fn from(code: NotifyCode) -> Self {
        code as u8
    }
}

impl Display for NotifyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use NotifyCode::*;
        match self {
            MsgHeaderError => write!(f, "Message Header Error"),
            OpenMsgError => write!(f, "OPEN Message Error"),
            UpdateMsgError => write!(f, "UPDATE Message Error"),
            HoldTimerExpired => write!(f, "Hold Timer Expired"),
            FsmError => write!(f, "FSM Error"),
            Cease => write!(f, "Cease"),
        }
    }
}

/// OPEN message error subcodes, RFC 4271 and RFC 5492.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpenError {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7,
}

impl From<OpenError> for u8 {
    fn from(error: OpenError) -> Self {
        error as u8
    }
}

impl NotificationPacket {
    pub fn new(code: u8, sub_code: u8, data: Vec<u8>) -> Self {
        Self {
            header: BgpHeader::new(
                BgpType::Notification,
                BGP_HEADER_LEN + 2 + data.len() as u16,
            ),
            code,
            sub_code,
            data,
        }
    }

    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], NotificationPacket), WireError> {
        let (input, mut packet) = NotificationPacket::parse(input)?;
        if packet.header.length < BGP_HEADER_LEN + 2 {
            return Err(WireError::HeaderLength(packet.header.length));
        }
        let len = packet.header.length - BGP_HEADER_LEN - 2;
        let (input, data) = take(len as usize)(input)?;
        packet.data = data.to_vec();
        Ok((input, packet))
    }
}

impl From<NotificationPacket> for BytesMut {
    fn from(notification: NotificationPacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = notification.header.into();
        buf.put(&header[..]);
        buf.put_u8(notification.code);
        buf.put_u8(notification.sub_code);
        buf.put(&notification.data[..]);

        const LENGTH_POS: std::ops::Range<usize> = 16..18;
        let length: u16 = buf.len() as u16;
        buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());

        buf
    }
}

impl Display for NotificationPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Notification ({}, {})", self.code, self.sub_code)
    }
}
