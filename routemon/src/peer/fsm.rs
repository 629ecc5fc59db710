/// BGP finite state machine states, RFC 4271 section 8.2, plus the two
/// monitor-specific states: `Error` for parked synthetic sessions and
/// `MrtEstablished` for MRT-backed sessions confirmed by live traffic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FsmState {
    Error = 0,
    Idle = 1,
    Connect = 2,
    Active = 3,
    OpenSent = 4,
    OpenConfirm = 5,
    Established = 6,
    MrtEstablished = 7,
}

impl FsmState {
    pub fn from_u8(val: u8) -> Option<Self> {
        use FsmState::*;
        match val {
            0 => Some(Error),
            1 => Some(Idle),
            2 => Some(Connect),
            3 => Some(Active),
            4 => Some(OpenSent),
            5 => Some(OpenConfirm),
            6 => Some(Established),
            7 => Some(MrtEstablished),
            _ => None,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Idle => "Idle",
            Self::Connect => "Connect",
            Self::Active => "Active",
            Self::OpenSent => "OpenSent",
            Self::OpenConfirm => "OpenConfirm",
            Self::Established => "Established",
            Self::MrtEstablished => "MrtEstablished",
        }
    }

    pub fn is_established(&self) -> bool {
        *self == FsmState::Established
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// FSM events, RFC 4271 section 8.1. The discriminants are the event codes
/// recorded in state-change records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    None = 0,
    // Administrative events.
    ManualStart = 1,
    ManualStop = 2,
    AutomaticStart = 3,
    AutomaticStop = 8,
    // Timer events.
    ConnectRetryTimerExpires = 10,
    HoldTimerExpires = 11,
    KeepaliveTimerExpires = 12,
    DelayOpenTimerExpires = 13,
    IdleHoldTimerExpires = 14,
    // TCP connection events.
    TcpConnectionValid = 15,
    TcpCrInvalid = 16,
    TcpCrAcked = 17,
    TcpConnectionConfirmed = 18,
    TcpConnectionFails = 19,
    // BGP message events.
    BgpOpen = 20,
    BgpOpenDelayOpenTimer = 21,
    BgpHeaderErr = 22,
    BgpOpenMsgErr = 23,
    BgpUnsupportedCapability = 24,
    BgpFsmErr = 25,
    OpenCollisionDump = 26,
    NotificationVerErr = 27,
    NotificationMsg = 28,
    KeepaliveMsg = 29,
    UpdateMsg = 30,
    UpdateMsgErr = 31,
    // Monitor-specific events.
    RouteRefreshTimerExpires = 64,
    RouteRefreshMsg = 65,
}

impl Event {
    pub fn from_u8(val: u8) -> Option<Self> {
        use Event::*;
        match val {
            0 => Some(None),
            1 => Some(ManualStart),
            2 => Some(ManualStop),
            3 => Some(AutomaticStart),
            8 => Some(AutomaticStop),
            10 => Some(ConnectRetryTimerExpires),
            11 => Some(HoldTimerExpires),
            12 => Some(KeepaliveTimerExpires),
            13 => Some(DelayOpenTimerExpires),
            14 => Some(IdleHoldTimerExpires),
            15 => Some(TcpConnectionValid),
            16 => Some(TcpCrInvalid),
            17 => Some(TcpCrAcked),
            18 => Some(TcpConnectionConfirmed),
            19 => Some(TcpConnectionFails),
            20 => Some(BgpOpen),
            21 => Some(BgpOpenDelayOpenTimer),
            22 => Some(BgpHeaderErr),
            23 => Some(BgpOpenMsgErr),
            24 => Some(BgpUnsupportedCapability),
            25 => Some(BgpFsmErr),
            26 => Some(OpenCollisionDump),
            27 => Some(NotificationVerErr),
            28 => Some(NotificationMsg),
            29 => Some(KeepaliveMsg),
            30 => Some(UpdateMsg),
            31 => Some(UpdateMsgErr),
            64 => Some(RouteRefreshTimerExpires),
            65 => Some(RouteRefreshMsg),
            _ => Option::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for code in 0..=7u8 {
            let state = FsmState::from_u8(code).unwrap();
            assert_eq!(state as u8, code);
        }
        assert!(FsmState::from_u8(8).is_none());
    }

    #[test]
    fn event_codes_roundtrip() {
        let events = [
            Event::ManualStart,
            Event::ConnectRetryTimerExpires,
            Event::TcpConnectionConfirmed,
            Event::BgpOpen,
            Event::UpdateMsg,
            Event::RouteRefreshMsg,
        ];
        for event in events {
            assert_eq!(Event::from_u8(event as u8), Some(event));
        }
    }
}
