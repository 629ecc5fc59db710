use bytes::{BufMut, BytesMut};

use crate::peer::fsm::{Event, FsmState};

/// Message type tags carried through the publication fabric. The numeric
/// values are the northbound contract with the serializer.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmfType {
    MsgFromPeer = 1,
    MsgToPeer = 2,
    MsgLabeled = 3,
    TableStart = 4,
    TableTransfer = 5,
    TableStop = 6,
    FsmStateChange = 7,
    ChainsStatus = 8,
    QueuesStatus = 9,
    SessionStatus = 10,
    MrtStatus = 11,
    MonitorStart = 12,
    MonitorStop = 13,
}

/// The change-label attached to each NLRI of a labeled update, in wire
/// order. Numeric values are part of the northbound contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Null = 0,
    Withdraw = 1,
    DuplicateWithdraw = 2,
    NewAnnounce = 3,
    DuplicateAnnounce = 4,
    DifferentPath = 5,
    SamePath = 6,
}

/// The envelope every message travels in between modules.
#[derive(Debug, Clone)]
pub struct Bmf {
    pub session_id: u32,
    /// Wall-clock seconds.
    pub timestamp: u32,
    /// Sub-second precision, microseconds.
    pub precision: u32,
    pub typ: BmfType,
    pub payload: Vec<u8>,
    /// Per-NLRI labels, present only on labeled messages; order matches the
    /// on-wire NLRI order of the payload.
    pub labels: Vec<Label>,
}

impl Bmf {
    pub fn new(session_id: u32, typ: BmfType) -> Self {
        let now = chrono::Utc::now();
        Self {
            session_id,
            timestamp: now.timestamp() as u32,
            precision: now.timestamp_subsec_micros(),
            typ,
            payload: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_payload(session_id: u32, typ: BmfType, payload: Vec<u8>) -> Self {
        let mut bmf = Self::new(session_id, typ);
        bmf.payload = payload;
        bmf
    }

    pub fn append(&mut self, data: &[u8]) {
        self.payload.extend_from_slice(data);
    }
}

/// FSM transition record riding in a state-change BMF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old_state: FsmState,
    pub new_state: FsmState,
    pub reason: Event,
}

impl StateChange {
    pub fn new(old_state: FsmState, new_state: FsmState, reason: Event) -> Self {
        Self {
            old_state,
            new_state,
            reason,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.old_state as u32);
        buf.put_u32(self.new_state as u32);
        buf.put_u32(self.reason as u32);
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Option<StateChange> {
        if payload.len() < 12 {
            return None;
        }
        let old = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let new = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let reason = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        Some(StateChange {
            old_state: FsmState::from_u8(old as u8)?,
            new_state: FsmState::from_u8(new as u8)?,
            reason: Event::from_u8(reason as u8).unwrap_or(Event::None),
        })
    }

    /// A transition that obliges readers to tear down the session's RIB:
    /// the session went to Idle from anywhere but Connect.
    pub fn is_session_down(&self) -> bool {
        self.new_state == FsmState::Idle && self.old_state != FsmState::Connect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_roundtrip() {
        let change = StateChange::new(
            FsmState::OpenConfirm,
            FsmState::Established,
            Event::KeepaliveMsg,
        );
        let decoded = StateChange::decode(&change.encode()).unwrap();
        assert_eq!(decoded, change);
        assert!(!decoded.is_session_down());
    }

    #[test]
    fn session_down_detection() {
        let down = StateChange::new(FsmState::Established, FsmState::Idle, Event::HoldTimerExpires);
        assert!(down.is_session_down());

        let retry = StateChange::new(FsmState::Connect, FsmState::Idle, Event::TcpConnectionFails);
        assert!(!retry.is_session_down());
    }
}
