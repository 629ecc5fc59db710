pub mod fsm;
pub mod timer;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use bgp_wire::{
    Afi, BgpHeader, BgpPacket, CapAs4, CapMultiProtocol, CapRefresh, CapUnknown, CapabilityPacket,
    NotifyCode, OpenError, OpenPacket, RouteRefreshPacket, Safi, BGP_HEADER_LEN, BGP_PACKET_LEN,
};

use crate::bmf::{Bmf, BmfType, StateChange};
use crate::config::{Config, PeerStanza, ResolvedPeer, RuleAction};
use crate::context::{LastAction, Shutdown};
use crate::queue::QueueWriter;
use crate::session::{Direction, Registry, Session};

use fsm::{Event, FsmState};
use timer::{connect_retry_backoff, jitter, SessionTimers};

/// AS_TRANS, RFC 6793: the 2-octet stand-in for a 4-octet local AS.
pub const AS_TRANS: u16 = 23456;

pub struct PeerContext {
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
    pub stanza: PeerStanza,
    pub writer: QueueWriter,
    pub shutdown: Shutdown,
    pub last_action: LastAction,
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Reset,
}

/// Drive one configured peering for the life of the process: resolve the
/// configuration, run a session incarnation until it resets, then rebuild
/// the session (carrying the historical counters) and try again.
pub async fn peer_task(ctx: PeerContext) {
    let mut retry_count: u32 = 0;
    let mut down_count: u32 = 0;
    let mut last_down_time: i64 = 0;

    loop {
        if ctx.shutdown.is_set() {
            return;
        }
        ctx.last_action.touch();

        // Configuration is reread on every attempt so operator edits take
        // effect at the next reset.
        let resolved = match ctx.config.resolve_peer(&ctx.stanza) {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("peer {}: {:#}; disabled", ctx.stanza.name, err);
                return;
            }
        };
        if !resolved.enabled {
            if !sleep_checked(&ctx, 30).await {
                return;
            }
            continue;
        }

        let session = match ctx.registry.create(
            Direction::Live,
            resolved,
            FsmState::Idle,
            down_count,
            last_down_time,
        ) {
            Ok(session) => session,
            Err(err) => {
                error!("peer {}: {:#}", ctx.stanza.name, err);
                if !sleep_checked(&ctx, 30).await {
                    return;
                }
                continue;
            }
        };
        session
            .stats
            .connect_retry_count
            .store(retry_count, Ordering::SeqCst);

        let exit = run_session(&ctx, &session, retry_count).await;

        retry_count = session.stats.connect_retry_count.load(Ordering::SeqCst);
        down_count = session.stats.down_count.load(Ordering::SeqCst);
        last_down_time = session.stats.last_down_time.load(Ordering::SeqCst);
        ctx.registry.remove(session.id);

        if exit == Exit::Shutdown {
            return;
        }
    }
}

/// Sleep in shutdown-sized slices; false once shutdown is requested.
async fn sleep_checked(ctx: &PeerContext, seconds: u64) -> bool {
    for _ in 0..seconds.max(1) {
        if ctx.shutdown.is_set() {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    !ctx.shutdown.is_set()
}

async fn transition(ctx: &PeerContext, session: &Session, new: FsmState, reason: Event) {
    let old = session.set_state(new, reason);
    debug!(
        "session {} ({}): {} -> {} ({:?})",
        session.id,
        session.session_string(),
        old,
        new,
        reason
    );
    let change = StateChange::new(old, new, reason);
    let bmf = Bmf::with_payload(session.id, BmfType::FsmStateChange, change.encode());
    ctx.writer.write(bmf).await;
}

async fn publish_to_peer(ctx: &PeerContext, session: &Session, payload: &[u8]) {
    let bmf = Bmf::with_payload(session.id, BmfType::MsgToPeer, payload.to_vec());
    ctx.writer.write(bmf).await;
}

async fn send_frame(
    ctx: &PeerContext,
    session: &Session,
    stream: &mut TcpStream,
    bytes: BytesMut,
) -> std::io::Result<()> {
    stream.write_all(&bytes).await?;
    publish_to_peer(ctx, session, &bytes).await;
    Ok(())
}

async fn send_notification(
    ctx: &PeerContext,
    session: &Session,
    stream: &mut TcpStream,
    code: u8,
    sub_code: u8,
    data: Vec<u8>,
) {
    let notification = bgp_wire::NotificationPacket::new(code, sub_code, data);
    let bytes: BytesMut = notification.into();
    if let Err(err) = send_frame(ctx, session, stream, bytes).await {
        debug!("session {}: notification not sent: {}", session.id, err);
    }
}

/// Reset policy: zero the timers, release the negotiated capabilities,
/// bump the retry count, go to Idle, and let the caller rebuild the
/// session struct.
async fn reset_session(
    ctx: &PeerContext,
    session: &Session,
    timers: &mut SessionTimers,
    reason: Event,
) {
    timers.zero_all();
    session.caps_recv.lock().unwrap().clear();
    session
        .stats
        .connect_retry_count
        .fetch_add(1, Ordering::SeqCst);
    info!(
        "session {} ({}) reset: {:?}",
        session.id,
        session.session_string(),
        reason
    );
    transition(ctx, session, FsmState::Idle, reason).await;
}

fn announce_caps(config: &ResolvedPeer) -> Vec<CapabilityPacket> {
    if config.announce.is_empty() {
        return vec![
            CapabilityPacket::MultiProtocol(CapMultiProtocol::new(Afi::Ip, Safi::Unicast)),
            CapabilityPacket::RouteRefresh(CapRefresh::default()),
            CapabilityPacket::As4(CapAs4::new(config.local_as)),
        ];
    }
    config
        .announce
        .iter()
        .map(|cap| match cap.code {
            1 if cap.value.len() == 4 => {
                let afi = Afi::from(u16::from_be_bytes([cap.value[0], cap.value[1]]));
                CapabilityPacket::MultiProtocol(CapMultiProtocol::new(afi, Safi::from(cap.value[3])))
            }
            2 => CapabilityPacket::RouteRefresh(CapRefresh { cisco: false }),
            128 => CapabilityPacket::RouteRefresh(CapRefresh { cisco: true }),
            65 => {
                let asn = if cap.value.len() == 4 {
                    u32::from_be_bytes([cap.value[0], cap.value[1], cap.value[2], cap.value[3]])
                } else {
                    config.local_as
                };
                CapabilityPacket::As4(CapAs4::new(asn))
            }
            code => CapabilityPacket::Unknown(CapUnknown {
                code,
                data: cap.value.clone(),
            }),
        })
        .collect()
}

/// Match one advertised capability against the receive rules: an exact
/// value match is more specific than a code-wildcard and wins.
fn rule_for<'a>(
    config: &'a ResolvedPeer,
    cap: &CapabilityPacket,
) -> Option<&'a crate::config::CapabilityRule> {
    let value = cap.value_bytes();
    let code = cap.code();
    config
        .receive
        .iter()
        .find(|r| r.code == code && r.value.as_deref() == Some(&value[..]))
        .or_else(|| {
            config
                .receive
                .iter()
                .find(|r| r.code == code && r.value.is_none())
        })
}

struct OpenFailure {
    code: u8,
    sub_code: u8,
    data: Vec<u8>,
    event: Event,
}

/// Validate a received OPEN against the session's configuration,
/// RFC 4271 section 6.2 plus the per-peer capability policy.
fn check_open(session: &Session, open: &OpenPacket) -> Result<(), OpenFailure> {
    let config = &session.config;
    if open.version != config.bgp_version {
        return Err(OpenFailure {
            code: NotifyCode::OpenMsgError.into(),
            sub_code: OpenError::UnsupportedVersionNumber.into(),
            data: (config.bgp_version as u16).to_be_bytes().to_vec(),
            event: Event::BgpOpenMsgErr,
        });
    }
    if open.peer_asn() != config.remote_as {
        return Err(OpenFailure {
            code: NotifyCode::OpenMsgError.into(),
            sub_code: OpenError::BadPeerAs.into(),
            data: Vec::new(),
            event: Event::BgpOpenMsgErr,
        });
    }
    if open.bgp_id == [0, 0, 0, 0]
        || config
            .remote_bgp_id
            .is_some_and(|id| id.octets() != open.bgp_id)
    {
        return Err(OpenFailure {
            code: NotifyCode::OpenMsgError.into(),
            sub_code: OpenError::BadBgpIdentifier.into(),
            data: Vec::new(),
            event: Event::BgpOpenMsgErr,
        });
    }
    if open.hold_time == 1 || open.hold_time == 2 {
        return Err(OpenFailure {
            code: NotifyCode::OpenMsgError.into(),
            sub_code: OpenError::UnacceptableHoldTime.into(),
            data: Vec::new(),
            event: Event::BgpOpenMsgErr,
        });
    }

    // Refused capabilities are echoed back in the notification data;
    // missing Required ones likewise.
    let mut rejected = BytesMut::new();
    for cap in open.caps.iter() {
        if let Some(rule) = rule_for(config, cap) {
            if rule.action == RuleAction::Refuse {
                cap.encode(&mut rejected);
            }
        }
    }
    for rule in config.receive.iter() {
        if rule.action != RuleAction::Require {
            continue;
        }
        let satisfied = open.caps.iter().any(|cap| {
            cap.code() == rule.code
                && rule
                    .value
                    .as_ref()
                    .map_or(true, |v| *v == cap.value_bytes())
        });
        if !satisfied {
            rejected.extend_from_slice(&[rule.code, rule.value.as_ref().map_or(0, |v| v.len() as u8)]);
            if let Some(value) = &rule.value {
                rejected.extend_from_slice(value);
            }
        }
    }
    if !rejected.is_empty() {
        return Err(OpenFailure {
            code: NotifyCode::OpenMsgError.into(),
            sub_code: OpenError::UnsupportedCapability.into(),
            data: rejected.to_vec(),
            event: Event::BgpUnsupportedCapability,
        });
    }
    Ok(())
}

/// Register the peer's capabilities after a successful OPEN check. The
/// AS width becomes 4 only when both sides carried the 4-octet-AS
/// capability.
fn register_caps(session: &Session, open: &OpenPacket, announced: &[CapabilityPacket]) {
    let peer_as4 = open
        .caps
        .iter()
        .any(|c| matches!(c, CapabilityPacket::As4(_)));
    let we_as4 = announced
        .iter()
        .any(|c| matches!(c, CapabilityPacket::As4(_)));
    if peer_as4 && we_as4 {
        session.set_as_width(4);
    }
    *session.caps_recv.lock().unwrap() = open.caps.clone();
}

fn peer_supports_refresh(session: &Session) -> bool {
    session
        .caps_recv
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, CapabilityPacket::RouteRefresh(_)))
}

/// The (AFI, SAFI) pairs both sides advertised multiprotocol support for;
/// plain IPv4 unicast when neither side spoke up.
fn negotiated_afi_safi(session: &Session, announced: &[CapabilityPacket]) -> Vec<(Afi, Safi)> {
    let ours: Vec<(Afi, Safi)> = announced
        .iter()
        .filter_map(|c| match c {
            CapabilityPacket::MultiProtocol(mp) => Some((mp.afi, mp.safi)),
            _ => None,
        })
        .collect();
    let caps = session.caps_recv.lock().unwrap();
    let theirs: Vec<(Afi, Safi)> = caps
        .iter()
        .filter_map(|c| match c {
            CapabilityPacket::MultiProtocol(mp) => Some((mp.afi, mp.safi)),
            _ => None,
        })
        .collect();
    let common: Vec<(Afi, Safi)> = ours
        .iter()
        .filter(|pair| theirs.contains(pair))
        .copied()
        .collect();
    if common.is_empty() {
        vec![(Afi::Ip, Safi::Unicast)]
    } else {
        common
    }
}

#[cfg(target_os = "linux")]
fn set_md5_key(fd: std::os::fd::RawFd, peer: &SocketAddr, key: &str) -> std::io::Result<()> {
    const TCP_MD5SIG_MAXKEYLEN: usize = 80;
    #[repr(C)]
    struct TcpMd5Sig {
        addr: libc::sockaddr_storage,
        flags: u8,
        prefixlen: u8,
        keylen: u16,
        ifindex: u32,
        key: [u8; TCP_MD5SIG_MAXKEYLEN],
    }
    if key.len() > TCP_MD5SIG_MAXKEYLEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "md5 key too long",
        ));
    }
    let mut sig: TcpMd5Sig = unsafe { std::mem::zeroed() };
    match peer {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut sig.addr as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut sig.addr as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
        }
    }
    sig.keylen = key.len() as u16;
    sig.key[..key.len()].copy_from_slice(key.as_bytes());
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MD5SIG,
            &sig as *const TcpMd5Sig as *const libc::c_void,
            std::mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_md5_key(_fd: i32, _peer: &SocketAddr, _key: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "TCP MD5 signatures are not available on this platform",
    ))
}

async fn connect_peer(config: &ResolvedPeer) -> std::io::Result<TcpStream> {
    let remote = SocketAddr::new(config.remote_addr, config.remote_port);
    let socket = match config.remote_addr {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::new(config.local_addr, config.local_port))?;
    if let Some(key) = &config.md5_password {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            set_md5_key(socket.as_raw_fd(), &remote, key)?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            warn!("md5 password configured but unsupported on this platform");
            let _ = key;
        }
    }
    tokio::time::timeout(Duration::from_secs(30), socket.connect(remote))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
}

async fn send_open(
    ctx: &PeerContext,
    session: &Session,
    stream: &mut TcpStream,
    announced: &[CapabilityPacket],
) -> std::io::Result<()> {
    let config = &session.config;
    let asn = if config.local_as > u16::MAX as u32 {
        AS_TRANS
    } else {
        config.local_as as u16
    };
    let open = OpenPacket::new(
        asn,
        config.hold_time,
        &config.local_bgp_id,
        announced.to_vec(),
    );
    let bytes: BytesMut = open.into();
    send_frame(ctx, session, stream, bytes).await
}

async fn send_keepalive(
    ctx: &PeerContext,
    session: &Session,
    stream: &mut TcpStream,
) -> std::io::Result<()> {
    let header = BgpHeader::new(bgp_wire::BgpType::Keepalive, BGP_HEADER_LEN);
    let bytes: BytesMut = header.into();
    send_frame(ctx, session, stream, bytes).await
}

/// One session incarnation: Idle -> Connect -> OpenSent -> OpenConfirm ->
/// Established, back to Idle on any failure.
async fn run_session(ctx: &PeerContext, session: &Arc<Session>, retry_count: u32) -> Exit {
    let mut timers = SessionTimers::new(session.config.hold_time);
    let announced = announce_caps(&session.config);

    transition(ctx, session, FsmState::Connect, Event::AutomaticStart).await;

    let delay = jitter(connect_retry_backoff(retry_count));
    if delay > 0 {
        debug!("session {}: connect retry delay {}s", session.id, delay);
        if !sleep_checked(ctx, delay).await {
            return Exit::Shutdown;
        }
    }

    let mut stream = match connect_peer(&session.config).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                "session {} ({}): tcp connection error: {}",
                session.id,
                session.session_string(),
                err
            );
            reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
            return Exit::Reset;
        }
    };
    info!("session {} ({}): tcp connection ok", session.id, session.session_string());

    timers.restart_large_hold();
    transition(ctx, session, FsmState::OpenSent, Event::TcpConnectionConfirmed).await;
    if send_open(ctx, session, &mut stream, &announced).await.is_err() {
        reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
        return Exit::Reset;
    }

    let mut buf = BytesMut::with_capacity(BGP_PACKET_LEN * 2);
    loop {
        ctx.last_action.touch();
        if ctx.shutdown.is_set() {
            send_notification(ctx, session, &mut stream, NotifyCode::Cease.into(), 2, Vec::new())
                .await;
            reset_session(ctx, session, &mut timers, Event::ManualStop).await;
            return Exit::Shutdown;
        }

        match timers.expired() {
            Event::KeepaliveTimerExpires => {
                timers.restart_keepalive();
                if send_keepalive(ctx, session, &mut stream).await.is_err() {
                    reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
                    return Exit::Reset;
                }
            }
            Event::HoldTimerExpires => {
                send_notification(
                    ctx,
                    session,
                    &mut stream,
                    NotifyCode::HoldTimerExpired.into(),
                    0,
                    Vec::new(),
                )
                .await;
                reset_session(ctx, session, &mut timers, Event::HoldTimerExpires).await;
                return Exit::Reset;
            }
            _ => {}
        }

        if session.state() == FsmState::Established
            && session.refresh_requested.swap(false, Ordering::SeqCst)
        {
            if peer_supports_refresh(session) {
                for (afi, safi) in negotiated_afi_safi(session, &announced) {
                    let refresh = RouteRefreshPacket::new(afi, safi);
                    let bytes: BytesMut = refresh.into();
                    if send_frame(ctx, session, &mut stream, bytes).await.is_err() {
                        reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
                        return Exit::Reset;
                    }
                }
                session
                    .stats
                    .last_route_refresh
                    .store(crate::context::unix_now(), Ordering::SeqCst);
            } else {
                debug!(
                    "session {}: refresh requested but peer lacks the capability",
                    session.id
                );
            }
        }

        let read = tokio::time::timeout(timers.read_timeout(), stream.read_buf(&mut buf)).await;
        match read {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => {
                info!("session {} ({}): peer closed", session.id, session.session_string());
                reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
                return Exit::Reset;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!("session {}: read error: {}", session.id, err);
                reset_session(ctx, session, &mut timers, Event::TcpConnectionFails).await;
                return Exit::Reset;
            }
        }

        while buf.len() >= BGP_HEADER_LEN as usize {
            let header = match BgpHeader::decode(&buf) {
                Ok(header) => header,
                Err(err) => {
                    let (code, sub_code) = err.notify_codes();
                    send_notification(ctx, session, &mut stream, code, sub_code, Vec::new()).await;
                    reset_session(ctx, session, &mut timers, Event::BgpHeaderErr).await;
                    return Exit::Reset;
                }
            };
            if buf.len() < header.length as usize {
                break;
            }
            let frame = buf.split_to(header.length as usize).to_vec();
            if let Some(exit) =
                handle_message(ctx, session, &mut timers, &mut stream, &announced, frame).await
            {
                return exit;
            }
        }
        buf.reserve(BGP_PACKET_LEN);
    }
}

/// React to one framed message according to the current state. Every
/// received message is published to the peer stream before the FSM acts
/// on it.
async fn handle_message(
    ctx: &PeerContext,
    session: &Arc<Session>,
    timers: &mut SessionTimers,
    stream: &mut TcpStream,
    announced: &[CapabilityPacket],
    frame: Vec<u8>,
) -> Option<Exit> {
    let bmf = Bmf::with_payload(session.id, BmfType::MsgFromPeer, frame.clone());
    ctx.writer.write(bmf).await;
    session.stats.messages_rcvd.fetch_add(1, Ordering::Relaxed);

    let state = session.state();
    let packet = match BgpPacket::parse_packet(&frame, session.as4()) {
        Ok((_, packet)) => packet,
        Err(err) => {
            let (event, (code, sub_code)) = match state {
                FsmState::OpenSent => (Event::BgpOpenMsgErr, (NotifyCode::OpenMsgError.into(), 0)),
                FsmState::Established => (Event::UpdateMsgErr, err.notify_codes()),
                _ => (Event::BgpHeaderErr, err.notify_codes()),
            };
            warn!("session {}: parse failure: {}", session.id, err);
            send_notification(ctx, session, stream, code, sub_code, Vec::new()).await;
            reset_session(ctx, session, timers, event).await;
            return Some(Exit::Reset);
        }
    };

    match (state, packet) {
        (FsmState::OpenSent, BgpPacket::Open(open)) => {
            if let Err(failure) = check_open(session, &open) {
                send_notification(
                    ctx,
                    session,
                    stream,
                    failure.code,
                    failure.sub_code,
                    failure.data,
                )
                .await;
                reset_session(ctx, session, timers, failure.event).await;
                return Some(Exit::Reset);
            }
            register_caps(session, &open, announced);
            timers.negotiate(session.config.hold_time, open.hold_time);
            transition(ctx, session, FsmState::OpenConfirm, Event::BgpOpen).await;
            if send_keepalive(ctx, session, stream).await.is_err() {
                reset_session(ctx, session, timers, Event::TcpConnectionFails).await;
                return Some(Exit::Reset);
            }
        }
        (FsmState::OpenConfirm, BgpPacket::Keepalive(_)) => {
            timers.restart_hold();
            transition(ctx, session, FsmState::Established, Event::KeepaliveMsg).await;
            info!(
                "session {} is established, holdtime: {}, keepalivetime: {}",
                session.id, timers.hold_interval, timers.keepalive_interval
            );
        }
        (FsmState::Established, BgpPacket::Update(_)) => {
            timers.restart_hold();
            // Success at least once: the linear backoff starts over.
            session.stats.connect_retry_count.store(0, Ordering::SeqCst);
            // A live update for this peer is what confirms any synthetic
            // session an MRT table dump is holding back.
            ctx.registry.confirm_mrt(
                session.config.remote_as,
                session.config.remote_addr,
                session.as_width(),
            );
        }
        (FsmState::Established, BgpPacket::Keepalive(_)) => {
            timers.restart_hold();
        }
        (FsmState::Established, BgpPacket::RouteRefresh(refresh)) => {
            // A monitor has nothing to readvertise; the request is noted.
            info!("session {}: route refresh request {}", session.id, refresh);
        }
        (_, BgpPacket::Notification(notification)) => {
            info!(
                "session {} ({}): received {}",
                session.id,
                session.session_string(),
                notification
            );
            let event = if notification.code == u8::from(NotifyCode::OpenMsgError)
                && notification.sub_code == u8::from(OpenError::UnsupportedVersionNumber)
            {
                Event::NotificationVerErr
            } else {
                Event::NotificationMsg
            };
            reset_session(ctx, session, timers, event).await;
            return Some(Exit::Reset);
        }
        (_, _packet) => {
            // Anything else is out of place in this state.
            send_notification(
                ctx,
                session,
                stream,
                NotifyCode::FsmError.into(),
                0,
                Vec::new(),
            )
            .await;
            reset_session(ctx, session, timers, Event::BgpFsmErr).await;
            return Some(Exit::Reset);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapabilityRule, GlobalConfig, LabelAction};
    use std::net::Ipv4Addr;

    fn session_with_rules(rules: Vec<CapabilityRule>) -> Arc<Session> {
        let registry = Registry::new(&GlobalConfig::default());
        let mut config = ResolvedPeer::mrt_synthetic(
            65001,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            LabelAction::Label,
        );
        config.receive = rules;
        registry
            .create(Direction::Live, config, FsmState::OpenSent, 0, 0)
            .unwrap()
    }

    fn open_with(caps: Vec<CapabilityPacket>) -> OpenPacket {
        OpenPacket::new(65001, 180, &Ipv4Addr::new(10, 0, 0, 1), caps)
    }

    #[test]
    fn open_version_mismatch_is_subcode_1() {
        let session = session_with_rules(Vec::new());
        let mut open = open_with(Vec::new());
        open.version = 3;
        let failure = check_open(&session, &open).unwrap_err();
        assert_eq!(failure.code, 2);
        assert_eq!(failure.sub_code, 1);
        assert_eq!(failure.data, vec![0, 4]);
    }

    #[test]
    fn open_as_mismatch_is_subcode_2() {
        let session = session_with_rules(Vec::new());
        let mut open = open_with(Vec::new());
        open.asn = 64999;
        let failure = check_open(&session, &open).unwrap_err();
        assert_eq!(failure.sub_code, 2);
    }

    #[test]
    fn open_unacceptable_hold_time_is_subcode_6() {
        let session = session_with_rules(Vec::new());
        let mut open = open_with(Vec::new());
        open.hold_time = 1;
        let failure = check_open(&session, &open).unwrap_err();
        assert_eq!(failure.sub_code, 6);
    }

    #[test]
    fn missing_required_capability_is_subcode_7() {
        let session = session_with_rules(vec![CapabilityRule {
            action: RuleAction::Require,
            code: 65,
            value: None,
        }]);
        let open = open_with(Vec::new());
        let failure = check_open(&session, &open).unwrap_err();
        assert_eq!(failure.sub_code, 7);
        assert_eq!(failure.data, vec![65, 0]);
    }

    #[test]
    fn value_exact_rule_wins_over_wildcard() {
        let session = session_with_rules(vec![
            CapabilityRule {
                action: RuleAction::Refuse,
                code: 1,
                value: None,
            },
            CapabilityRule {
                action: RuleAction::Allow,
                code: 1,
                value: Some(vec![0, 1, 0, 1]),
            },
        ]);
        // IPv4 unicast matches the exact Allow rule despite the wildcard
        // Refuse.
        let open = open_with(vec![CapabilityPacket::MultiProtocol(
            CapMultiProtocol::new(Afi::Ip, Safi::Unicast),
        )]);
        assert!(check_open(&session, &open).is_ok());

        // IPv6 unicast only matches the wildcard Refuse.
        let open = open_with(vec![CapabilityPacket::MultiProtocol(
            CapMultiProtocol::new(Afi::Ip6, Safi::Unicast),
        )]);
        let failure = check_open(&session, &open).unwrap_err();
        assert_eq!(failure.sub_code, 7);
    }

    #[test]
    fn as_width_promotion_needs_both_sides() {
        let session = session_with_rules(Vec::new());
        let announced = vec![CapabilityPacket::As4(CapAs4::new(65002))];
        let open = open_with(vec![CapabilityPacket::As4(CapAs4::new(65001))]);
        register_caps(&session, &open, &announced);
        assert_eq!(session.as_width(), 4);

        let session = session_with_rules(Vec::new());
        let open = open_with(vec![CapabilityPacket::As4(CapAs4::new(65001))]);
        register_caps(&session, &open, &[]);
        assert_eq!(session.as_width(), 2);
    }

    #[test]
    fn announce_defaults_cover_mp_refresh_as4() {
        let config = ResolvedPeer::mrt_synthetic(
            65001,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            LabelAction::Label,
        );
        let caps = announce_caps(&config);
        assert_eq!(caps.len(), 3);
        assert!(caps
            .iter()
            .any(|c| matches!(c, CapabilityPacket::MultiProtocol(_))));
        assert!(caps.iter().any(|c| matches!(c, CapabilityPacket::As4(_))));
    }
}
