use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::info;

use bgp_wire::CapabilityPacket;

use crate::bmf::Label;
use crate::config::{GlobalConfig, LabelAction, ResolvedPeer};
use crate::context::unix_now;
use crate::peer::fsm::{Event, FsmState};
use crate::rib::Rib;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Live,
    MrtSynthetic,
}

/// Lifetime counters of one session, updated lock-free by the owning
/// session task and the labeler, sampled by the status task.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub messages_rcvd: AtomicU64,
    pub announce_new: AtomicU64,
    pub announce_duplicate: AtomicU64,
    pub same_path: AtomicU64,
    pub different_path: AtomicU64,
    pub withdraw_new: AtomicU64,
    pub withdraw_duplicate: AtomicU64,
    pub down_count: AtomicU32,
    pub last_down_time: AtomicI64,
    pub establish_time: AtomicI64,
    pub last_route_refresh: AtomicI64,
    pub connect_retry_count: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u32,
    pub peer: String,
    pub remote_as: u32,
    pub state: String,
    pub messages_rcvd: u64,
    pub announce_new: u64,
    pub announce_duplicate: u64,
    pub same_path: u64,
    pub different_path: u64,
    pub withdraw_new: u64,
    pub withdraw_duplicate: u64,
    pub down_count: u32,
    pub last_down_time: i64,
    pub establish_time: i64,
    pub prefix_count: usize,
    pub attr_count: usize,
}

/// One logical BGP peering, live or MRT-synthetic.
#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub direction: Direction,
    /// Configuration snapshot taken at construction; reread only when the
    /// owning task builds a replacement session.
    pub config: ResolvedPeer,
    state: AtomicU8,
    reason: AtomicU8,
    /// Negotiated AS-number width: 0 unknown, else 2 or 4. Monotone
    /// non-decreasing for the session's lifetime.
    as_width: AtomicU8,
    pub stats: SessionStats,
    pub caps_recv: Mutex<Vec<CapabilityPacket>>,
    /// Operator request for a route refresh on the next Established pass.
    pub refresh_requested: AtomicBool,
    rib: Mutex<Option<Arc<Rib>>>,
    prefix_buckets: usize,
    attr_buckets: usize,
    max_collisions: usize,
}

impl Session {
    pub fn state(&self) -> FsmState {
        FsmState::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(FsmState::Error)
    }

    /// Record a transition, maintaining the establishment bookkeeping:
    /// a reset out of Established counts as a session down, entering
    /// Established stamps the establish time and clears the last down
    /// time.
    pub fn set_state(&self, new: FsmState, reason: Event) -> FsmState {
        let old = self.state();
        if old == FsmState::Established && new == FsmState::Idle {
            self.stats.down_count.fetch_add(1, Ordering::SeqCst);
            self.stats.last_down_time.store(unix_now(), Ordering::SeqCst);
        }
        if new != old {
            self.state.store(new as u8, Ordering::SeqCst);
            self.reason.store(reason as u8, Ordering::SeqCst);
        }
        self.stats.messages_rcvd.store(0, Ordering::SeqCst);
        // MRT-backed sessions count as up from their confirmation onward.
        if new == FsmState::Established || new == FsmState::MrtEstablished {
            self.stats.establish_time.store(unix_now(), Ordering::SeqCst);
            self.stats.last_route_refresh.store(unix_now(), Ordering::SeqCst);
            self.stats.last_down_time.store(0, Ordering::SeqCst);
        } else {
            self.stats.establish_time.store(0, Ordering::SeqCst);
            self.stats.last_route_refresh.store(0, Ordering::SeqCst);
        }
        old
    }

    /// AS-number width in octets; 0 while still unknown (fresh synthetic
    /// sessions). Never decreases.
    pub fn as_width(&self) -> u8 {
        self.as_width.load(Ordering::SeqCst)
    }

    pub fn set_as_width(&self, width: u8) {
        self.as_width.fetch_max(width, Ordering::SeqCst);
    }

    pub fn as4(&self) -> bool {
        self.as_width() == 4
    }

    /// The session's RIB, created on first use unless labeling is
    /// disabled for this peer.
    pub fn rib(&self) -> Option<Arc<Rib>> {
        if self.config.label_action == LabelAction::NoAction {
            return None;
        }
        let mut rib = self.rib.lock().unwrap();
        Some(
            rib.get_or_insert_with(|| {
                Arc::new(Rib::new(
                    self.prefix_buckets,
                    self.attr_buckets,
                    self.max_collisions,
                ))
            })
            .clone(),
        )
    }

    /// Current RIB without creating one.
    pub fn rib_if_present(&self) -> Option<Arc<Rib>> {
        self.rib.lock().unwrap().clone()
    }

    /// Destroy the RIB; subsequent lookups start from empty tables.
    pub fn take_rib(&self) -> Option<Arc<Rib>> {
        self.rib.lock().unwrap().take()
    }

    pub fn count_label(&self, label: Label) {
        let counter = match label {
            Label::NewAnnounce => &self.stats.announce_new,
            Label::DuplicateAnnounce => &self.stats.announce_duplicate,
            Label::SamePath => &self.stats.same_path,
            Label::DifferentPath => &self.stats.different_path,
            Label::Withdraw => &self.stats.withdraw_new,
            Label::DuplicateWithdraw => &self.stats.withdraw_duplicate,
            Label::Null => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_string(&self) -> String {
        format!(
            "AS{}:{} -> AS{}:{}",
            self.config.remote_as,
            self.config.remote_addr,
            self.config.local_as,
            self.config.local_addr
        )
    }

    pub fn status(&self) -> SessionStatus {
        let (prefix_count, attr_count) = match self.rib_if_present() {
            Some(rib) => (rib.prefix_count(), rib.attr_count()),
            None => (0, 0),
        };
        SessionStatus {
            session_id: self.id,
            peer: self.session_string(),
            remote_as: self.config.remote_as,
            state: self.state().to_str().to_string(),
            messages_rcvd: self.stats.messages_rcvd.load(Ordering::Relaxed),
            announce_new: self.stats.announce_new.load(Ordering::Relaxed),
            announce_duplicate: self.stats.announce_duplicate.load(Ordering::Relaxed),
            same_path: self.stats.same_path.load(Ordering::Relaxed),
            different_path: self.stats.different_path.load(Ordering::Relaxed),
            withdraw_new: self.stats.withdraw_new.load(Ordering::Relaxed),
            withdraw_duplicate: self.stats.withdraw_duplicate.load(Ordering::Relaxed),
            down_count: self.stats.down_count.load(Ordering::Relaxed),
            last_down_time: self.stats.last_down_time.load(Ordering::Relaxed),
            establish_time: self.stats.establish_time.load(Ordering::Relaxed),
            prefix_count,
            attr_count,
        }
    }
}

/// Dense array of sessions, first free slot wins; the slot index is the
/// session id.
#[derive(Debug)]
pub struct Registry {
    sessions: Mutex<Vec<Option<Arc<Session>>>>,
    prefix_buckets: usize,
    attr_buckets: usize,
    max_collisions: usize,
}

impl Registry {
    pub fn new(global: &GlobalConfig) -> Arc<Registry> {
        Arc::new(Registry {
            sessions: Mutex::new(vec![None; global.max_sessions]),
            prefix_buckets: global.prefix_buckets,
            attr_buckets: global.attr_buckets,
            max_collisions: global.max_bucket_collisions,
        })
    }

    fn build(
        &self,
        id: u32,
        direction: Direction,
        config: ResolvedPeer,
        state: FsmState,
        down_count: u32,
        last_down_time: i64,
    ) -> Arc<Session> {
        let session = Session {
            id,
            direction,
            config,
            state: AtomicU8::new(state as u8),
            reason: AtomicU8::new(Event::None as u8),
            as_width: AtomicU8::new(match direction {
                Direction::Live => 2,
                Direction::MrtSynthetic => 0,
            }),
            stats: SessionStats::default(),
            caps_recv: Mutex::new(Vec::new()),
            refresh_requested: AtomicBool::new(false),
            rib: Mutex::new(None),
            prefix_buckets: self.prefix_buckets,
            attr_buckets: self.attr_buckets,
            max_collisions: self.max_collisions,
        };
        session.stats.down_count.store(down_count, Ordering::SeqCst);
        session
            .stats
            .last_down_time
            .store(last_down_time, Ordering::SeqCst);
        let session = Arc::new(session);
        // Sessions that label or store carry their tables from the start;
        // the labeler rebuilds them on demand after a teardown.
        let _ = session.rib();
        session
    }

    /// Allocate a session in the first free slot. Historical counters are
    /// carried over from the previous incarnation on reset.
    pub fn create(
        &self,
        direction: Direction,
        config: ResolvedPeer,
        state: FsmState,
        down_count: u32,
        last_down_time: i64,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(slot) = sessions.iter().position(|s| s.is_none()) else {
            return Err(anyhow!("session array full"));
        };
        let session = self.build(
            slot as u32,
            direction,
            config,
            state,
            down_count,
            last_down_time,
        );
        sessions[slot] = Some(session.clone());
        Ok(session)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id as usize).and_then(|s| s.clone())
    }

    pub fn exists(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&self, id: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(slot) = sessions.get_mut(id as usize) {
            *slot = None;
        }
    }

    pub fn iter(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.iter().flatten().cloned().collect()
    }

    /// A live UPDATE arrived for the peer (remote AS, remote IP): that
    /// arrival fixes the AS-number width, so every synthetic session held
    /// for the pair moves to MrtEstablished and its table buffers may
    /// drain. Returns how many sessions were promoted.
    pub fn confirm_mrt(&self, remote_as: u32, remote_addr: IpAddr, as_width: u8) -> usize {
        let held: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .flatten()
                .filter(|s| {
                    s.direction == Direction::MrtSynthetic
                        && s.config.remote_as == remote_as
                        && s.config.remote_addr == remote_addr
                        && s.state() != FsmState::MrtEstablished
                })
                .cloned()
                .collect()
        };
        for session in held.iter() {
            session.set_as_width(as_width);
            session.set_state(FsmState::MrtEstablished, Event::UpdateMsg);
            info!(
                "live update confirmed synthetic session {} ({}) at width {}",
                session.id,
                session.session_string(),
                session.as_width()
            );
        }
        held.len()
    }

    /// Find or atomically create the synthetic session for an MRT peer.
    /// Fresh synthetic sessions are parked in Error with AS-width unknown
    /// and consume no network resources.
    pub fn find_or_create_mrt(
        &self,
        remote_as: u32,
        remote_addr: IpAddr,
        collector_addr: IpAddr,
        label_action: LabelAction,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter().flatten().find(|s| {
            s.direction == Direction::MrtSynthetic
                && s.config.remote_as == remote_as
                && s.config.remote_addr == remote_addr
                && s.config.local_addr == collector_addr
        }) {
            return Ok(session.clone());
        }
        let Some(slot) = sessions.iter().position(|s| s.is_none()) else {
            return Err(anyhow!("session array full"));
        };
        let config =
            ResolvedPeer::mrt_synthetic(remote_as, remote_addr, collector_addr, label_action);
        let session = self.build(
            slot as u32,
            Direction::MrtSynthetic,
            config,
            FsmState::Error,
            0,
            0,
        );
        sessions[slot] = Some(session.clone());
        info!(
            "created synthetic session {} for {}",
            slot,
            session.session_string()
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registry() -> Arc<Registry> {
        Registry::new(&GlobalConfig::default())
    }

    fn peer_config() -> ResolvedPeer {
        ResolvedPeer::mrt_synthetic(
            65001,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            LabelAction::Label,
        )
    }

    #[test]
    fn establish_bookkeeping() {
        let registry = registry();
        let session = registry
            .create(Direction::Live, peer_config(), FsmState::Idle, 0, 0)
            .unwrap();

        session.set_state(FsmState::Established, Event::KeepaliveMsg);
        assert!(session.stats.establish_time.load(Ordering::SeqCst) > 0);
        assert_eq!(session.stats.last_down_time.load(Ordering::SeqCst), 0);

        session.set_state(FsmState::Idle, Event::HoldTimerExpires);
        assert_eq!(session.stats.down_count.load(Ordering::SeqCst), 1);
        assert!(session.stats.last_down_time.load(Ordering::SeqCst) > 0);
        assert_eq!(session.stats.establish_time.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn as_width_is_monotone() {
        let registry = registry();
        let session = registry
            .create(Direction::Live, peer_config(), FsmState::Idle, 0, 0)
            .unwrap();
        assert_eq!(session.as_width(), 2);
        session.set_as_width(4);
        assert_eq!(session.as_width(), 4);
        session.set_as_width(2);
        assert_eq!(session.as_width(), 4);
    }

    #[test]
    fn mrt_sessions_dedup_on_key() {
        let registry = registry();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let coll = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        let first = registry
            .find_or_create_mrt(65010, addr, coll, LabelAction::Label)
            .unwrap();
        assert_eq!(first.state(), FsmState::Error);
        assert_eq!(first.as_width(), 0);
        let second = registry
            .find_or_create_mrt(65010, addr, coll, LabelAction::Label)
            .unwrap();
        assert_eq!(first.id, second.id);
        let other = registry
            .find_or_create_mrt(65011, addr, coll, LabelAction::Label)
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn mrt_confirmation_promotes_width() {
        let registry = registry();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let coll = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        let session = registry
            .find_or_create_mrt(65010, addr, coll, LabelAction::Label)
            .unwrap();
        assert_eq!(registry.confirm_mrt(65010, addr, 4), 1);
        assert_eq!(session.state(), FsmState::MrtEstablished);
        assert_eq!(session.as_width(), 4);
        // Confirmed sessions count as up.
        assert!(session.stats.establish_time.load(Ordering::SeqCst) > 0);
        // Already confirmed, or no such peer: nothing to promote.
        assert_eq!(registry.confirm_mrt(65010, addr, 4), 0);
        assert_eq!(registry.confirm_mrt(65099, addr, 4), 0);
    }

    #[test]
    fn slot_reuse_after_removal() {
        let registry = registry();
        let first = registry
            .create(Direction::Live, peer_config(), FsmState::Idle, 0, 0)
            .unwrap();
        let id = first.id;
        registry.remove(id);
        assert!(!registry.exists(id));
        let second = registry
            .create(Direction::Live, peer_config(), FsmState::Idle, 2, 77)
            .unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.stats.down_count.load(Ordering::SeqCst), 2);
    }
}
