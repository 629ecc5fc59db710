use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use routemon::bmf::{Bmf, BmfType};
use routemon::config::Config;
use routemon::context::{Shutdown, Task};
use routemon::label::{label_task, LabelContext};
use routemon::mrt::{mrt_bind, mrt_listener, MrtContext};
use routemon::peer::{peer_task, PeerContext};
use routemon::queue::Publication;
use routemon::session::Registry;
use routemon::supervisor::{
    periodic_task, status_task, supervisor_task, ModuleHealth, PeriodicContext, StatusContext,
    Supervisor,
};

#[derive(Parser)]
#[command(author, version, about = "Passive BGP route monitor", long_about = None)]
struct Arg {
    #[arg(short, long, help = "Configuration file", default_value = "routemon.yaml")]
    config: PathBuf,
}

fn tracing_set() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let arg = Arg::parse();
    tracing_set();

    let config = Arc::new(Config::load(&arg.config)?);
    let registry = Registry::new(&config.global);

    let peer_pub = Publication::new("peer", config.queues.peer.clone());
    let mrt_pub = Publication::new("mrt", config.queues.mrt.clone());
    let labeled_pub = Publication::new("labeled", config.queues.labeled.clone());

    // Per-module shutdown flags, signalled in reverse-dependency order.
    let peer_shutdown = Shutdown::new();
    let mrt_shutdown = Shutdown::new();
    let label_shutdown = Shutdown::new();
    let status_shutdown = Shutdown::new();
    let supervisor_shutdown = Shutdown::new();

    let label_health = ModuleHealth::new("labeling");
    let mrt_health = ModuleHealth::new("mrt");
    let status_health = ModuleHealth::new("status");
    let peers_health = ModuleHealth::new("peering");

    peer_pub
        .add_writer()
        .write(Bmf::new(0, BmfType::MonitorStart))
        .await;

    if config.peers.len() > config.global.max_peers {
        warn!(
            "{} peers configured, capacity is {}; extras are ignored",
            config.peers.len(),
            config.global.max_peers
        );
    }
    if config.peer_groups.len() > config.global.max_peer_groups {
        warn!(
            "{} peer-groups configured, capacity is {}",
            config.peer_groups.len(),
            config.global.max_peer_groups
        );
    }

    // Peer session tasks, one per configured peer. A peer that cannot
    // resolve is logged and skipped, never fatal.
    let mut peer_tasks = Vec::new();
    for stanza in config.peers.iter().take(config.global.max_peers) {
        match config.resolve_peer(stanza) {
            Ok(resolved) if !resolved.enabled => {
                info!("peer {} is disabled", resolved.peer_name);
            }
            Ok(_) => {
                let ctx = PeerContext {
                    registry: registry.clone(),
                    config: config.clone(),
                    stanza: stanza.clone(),
                    writer: peer_pub.add_writer(),
                    shutdown: peer_shutdown.clone(),
                    last_action: peers_health.last_action.clone(),
                };
                peer_tasks.push(Task::spawn(peer_task(ctx)));
            }
            Err(err) => {
                warn!("peer {} skipped: {:#}", stanza.name, err);
            }
        }
    }
    info!("started {} peering tasks", peer_tasks.len());

    // MRT listener. A bind failure is fatal to startup.
    let mrt_task = if config.mrt.enabled {
        let listen: SocketAddr = format!("{}:{}", config.mrt.listen_addr, config.mrt.listen_port)
            .parse()
            .context("mrt listen address")?;
        let listener = match mrt_bind(listen) {
            Ok(listener) => listener,
            Err(err) => {
                error!("{:#}", err);
                return Err(err);
            }
        };
        let label_action = if config.mrt.label_action.is_empty() {
            routemon::config::LabelAction::Label
        } else {
            match config.mrt.label_action.as_str() {
                "no-action" => routemon::config::LabelAction::NoAction,
                "store-rib-only" => routemon::config::LabelAction::StoreRibOnly,
                _ => routemon::config::LabelAction::Label,
            }
        };
        let ctx = Arc::new(MrtContext {
            registry: registry.clone(),
            publication: mrt_pub.clone(),
            shutdown: mrt_shutdown.clone(),
            last_action: mrt_health.last_action.clone(),
            label_action,
        });
        Some(Task::spawn(mrt_listener(ctx, listener)))
    } else {
        None
    };

    // Labeling task.
    let label_ctx = LabelContext {
        registry: registry.clone(),
        peer_reader: peer_pub.add_reader(),
        mrt_reader: mrt_pub.add_reader(),
        labeled_writer: labeled_pub.add_writer(),
        shutdown: label_shutdown.clone(),
        last_action: label_health.last_action.clone(),
    };
    let label_task_handle = Task::spawn(label_task(label_ctx));

    // Status sampler.
    let status_ctx = StatusContext {
        registry: registry.clone(),
        publications: vec![peer_pub.clone(), mrt_pub.clone(), labeled_pub.clone()],
        writer: labeled_pub.add_writer(),
        shutdown: status_shutdown.clone(),
        last_action: status_health.last_action.clone(),
        interval: config.global.status_interval,
    };
    let status_task_handle = Task::spawn(status_task(status_ctx));

    // Operator-scheduled refreshes and RIB snapshots.
    let periodic_ctx = PeriodicContext {
        registry: registry.clone(),
        writer: labeled_pub.add_writer(),
        shutdown: status_shutdown.clone(),
        last_action: status_health.last_action.clone(),
        rib_dump_interval: config.global.rib_dump_interval,
        rib_dump_seconds: config.global.rib_dump_seconds,
        route_refresh_interval: config.global.route_refresh_interval,
    };
    let periodic_task_handle = Task::spawn(periodic_task(periodic_ctx));

    // Supervisor.
    let supervisor = Supervisor {
        modules: vec![
            peers_health.clone(),
            mrt_health.clone(),
            label_health.clone(),
            status_health.clone(),
        ],
        shutdown: supervisor_shutdown.clone(),
        interval: config.global.supervisor_interval,
        dead_interval: config.global.dead_interval,
    };
    let supervisor_task_handle = Task::spawn(supervisor_task(supervisor));

    info!("routemon started");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    // Producers first: peers and MRT stop writing, then their
    // publications are closed so the labeler can drain and exit, then the
    // labeled side comes down.
    peer_pub
        .add_writer()
        .write(Bmf::new(0, BmfType::MonitorStop))
        .await;
    peer_shutdown.signal();
    mrt_shutdown.signal();
    for task in peer_tasks {
        task.join().await;
    }
    if let Some(task) = mrt_task {
        task.join().await;
    }
    peer_pub.shutdown();
    mrt_pub.shutdown();
    label_task_handle.join().await;
    labeled_pub.shutdown();
    status_shutdown.signal();
    supervisor_shutdown.signal();
    status_task_handle.join().await;
    periodic_task_handle.join().await;
    supervisor_task_handle.join().await;

    info!("routemon stopped");
    Ok(())
}
