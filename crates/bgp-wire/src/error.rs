use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("connection not synchronized: bad marker")]
    HeaderMarker,

    #[error("bad message length {0}")]
    HeaderLength(u16),

    #[error("bad message type {0}")]
    HeaderType(u8),

    #[error("truncated message")]
    Truncated,

    #[error("malformed attribute list")]
    MalformedAttributeList,

    #[error("attribute length error at offset {0}")]
    AttributeLength(usize),

    #[error("malformed AS_PATH")]
    MalformedAsPath,

    #[error("invalid network field")]
    InvalidNetworkField,

    #[error("unexpected MRT type {0}")]
    MrtType(u16),

    #[error("unexpected MRT subtype {0}")]
    MrtSubtype(u16),

    #[error("parse error: {0}")]
    Nom(String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for WireError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => WireError::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                WireError::Nom(format!("{:?}", e.code))
            }
        }
    }
}

impl WireError {
    /// Notification (code, subcode) this error maps to when it must be
    /// reported to the peer, per RFC 4271 section 6.
    pub fn notify_codes(&self) -> (u8, u8) {
        use WireError::*;
        match self {
            HeaderMarker => (1, 1),
            HeaderLength(_) => (1, 2),
            HeaderType(_) => (1, 3),
            MalformedAttributeList => (3, 1),
            AttributeLength(_) => (3, 5),
            MalformedAsPath => (3, 11),
            InvalidNetworkField => (3, 10),
            _ => (1, 0),
        }
    }
}
