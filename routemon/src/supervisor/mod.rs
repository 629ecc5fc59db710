use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::bmf::{Bmf, BmfType};
use crate::context::{unix_now, LastAction, Shutdown};
use crate::queue::{Publication, QueueWriter};
use crate::session::{Direction, Registry};

/// One supervised module: a name and its liveness beacon.
#[derive(Debug, Clone)]
pub struct ModuleHealth {
    pub name: &'static str,
    pub last_action: LastAction,
}

impl ModuleHealth {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            last_action: LastAction::new(),
        }
    }
}

pub struct Supervisor {
    pub modules: Vec<ModuleHealth>,
    pub shutdown: Shutdown,
    pub interval: u64,
    pub dead_interval: i64,
}

/// Wake periodically and flag any module whose last action is older than
/// the dead interval.
pub async fn supervisor_task(supervisor: Supervisor) {
    info!("supervisor started over {} modules", supervisor.modules.len());
    loop {
        for _ in 0..supervisor.interval.max(1) {
            if supervisor.shutdown.is_set() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let now = unix_now();
        for module in supervisor.modules.iter() {
            let age = now - module.last_action.get();
            if age > supervisor.dead_interval {
                warn!(
                    "module {} has not reported for {}s (dead interval {}s)",
                    module.name, age, supervisor.dead_interval
                );
            }
        }
    }
}

pub struct PeriodicContext {
    pub registry: Arc<Registry>,
    pub writer: QueueWriter,
    pub shutdown: Shutdown,
    pub last_action: LastAction,
    pub rib_dump_interval: u64,
    pub rib_dump_seconds: u64,
    pub route_refresh_interval: u64,
}

/// Operator-scheduled work: periodic route-refresh requests on sessions
/// configured for them, and periodic RIB snapshots to subscribers.
pub async fn periodic_task(ctx: PeriodicContext) {
    let mut elapsed: u64 = 0;
    loop {
        if ctx.shutdown.is_set() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        elapsed += 1;
        ctx.last_action.touch();

        if ctx.route_refresh_interval > 0 && elapsed % ctx.route_refresh_interval == 0 {
            for session in ctx.registry.iter() {
                if session.config.route_refresh_action {
                    session
                        .refresh_requested
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }

        if ctx.rib_dump_interval > 0 && elapsed % ctx.rib_dump_interval == 0 {
            for session in ctx.registry.iter() {
                if ctx.shutdown.is_set() {
                    return;
                }
                if session.rib_if_present().is_none() {
                    continue;
                }
                crate::label::dump::send_rib_table(
                    &ctx.registry,
                    session.id,
                    &ctx.writer,
                    ctx.rib_dump_seconds,
                    &ctx.shutdown,
                    &ctx.last_action,
                )
                .await;
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct MrtStatus {
    synthetic_sessions: usize,
    established: usize,
    parked: usize,
}

pub struct StatusContext {
    pub registry: Arc<Registry>,
    pub publications: Vec<Arc<Publication>>,
    pub writer: QueueWriter,
    pub shutdown: Shutdown,
    pub last_action: LastAction,
    pub interval: u64,
}

/// Sample per-session and per-queue counters on a periodic tick and
/// enqueue them as status records.
pub async fn status_task(ctx: StatusContext) {
    loop {
        for _ in 0..ctx.interval.max(1) {
            if ctx.shutdown.is_set() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        ctx.last_action.touch();

        for session in ctx.registry.iter() {
            let status = session.status();
            if let Ok(payload) = serde_json::to_vec(&status) {
                ctx.writer
                    .write(Bmf::with_payload(
                        session.id,
                        BmfType::SessionStatus,
                        payload,
                    ))
                    .await;
            }
        }

        let stats: Vec<_> = ctx.publications.iter().map(|p| p.stats()).collect();
        if let Ok(payload) = serde_json::to_vec(&stats) {
            ctx.writer
                .write(Bmf::with_payload(0, BmfType::QueuesStatus, payload))
                .await;
        }

        let synthetic: Vec<_> = ctx
            .registry
            .iter()
            .into_iter()
            .filter(|s| s.direction == Direction::MrtSynthetic)
            .collect();
        let mrt_status = MrtStatus {
            synthetic_sessions: synthetic.len(),
            established: synthetic
                .iter()
                .filter(|s| s.state() == crate::peer::fsm::FsmState::MrtEstablished)
                .count(),
            parked: synthetic
                .iter()
                .filter(|s| s.state() == crate::peer::fsm::FsmState::Error)
                .count(),
        };
        if let Ok(payload) = serde_json::to_vec(&mrt_status) {
            ctx.writer
                .write(Bmf::with_payload(0, BmfType::MrtStatus, payload))
                .await;
        }
    }
}
