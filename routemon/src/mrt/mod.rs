pub mod table;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use bgp_wire::{
    MrtHeader, PeerIndexTable, RibAfiEntries, TableDumpSubtype, synthesize_update,
    MRT_HEADER_LEN, MRT_TABLE_DUMP_V2,
};

use crate::config::LabelAction;
use crate::context::{LastAction, Shutdown, Task};
use crate::peer::fsm::FsmState;
use crate::queue::Publication;
use crate::session::Registry;

use table::{expire_table, write_table_to_queue, TableBuffer};

/// How long the drain phase waits between polls for live confirmation,
/// and how many polls it makes before giving up on a peer.
pub const TABLE_TRANSFER_SLEEP: u64 = 30;
pub const TABLE_WAIT_LOOPS: u32 = 6;

pub struct MrtContext {
    pub registry: Arc<Registry>,
    pub publication: Arc<Publication>,
    pub shutdown: Shutdown,
    pub last_action: LastAction,
    pub label_action: LabelAction,
}

/// Bind the collector-facing listener; failure here is fatal to startup.
pub fn mrt_bind(listen: SocketAddr) -> Result<TcpListener> {
    let domain = match listen {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&listen.into())?;
        socket.listen(128)?;
        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        TcpListener::from_std(std_listener)
    };
    let listener = bind().with_context(|| format!("binding MRT listener on {}", listen))?;
    info!("MRT listener on {}", listen);
    Ok(listener)
}

/// Accept collector connections; one task per connection.
pub async fn mrt_listener(ctx: Arc<MrtContext>, listener: TcpListener) {
    loop {
        if ctx.shutdown.is_set() {
            return;
        }
        ctx.last_action.touch();
        let accepted =
            tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        match accepted {
            Err(_elapsed) => continue,
            Ok(Ok((stream, addr))) => {
                info!("MRT connection from {}", addr);
                let ctx = ctx.clone();
                let mut connection = Task::spawn(async move {
                    mrt_connection(ctx, stream, addr).await;
                });
                // Connections outlive the accept loop; the shutdown flag
                // stops them.
                connection.detach();
            }
            Ok(Err(err)) => {
                error!("MRT accept error: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn read_mrt_message(
    stream: &mut TcpStream,
    ctx: &MrtContext,
) -> Result<Option<(MrtHeader, Vec<u8>)>> {
    let mut header_buf = [0u8; MRT_HEADER_LEN];
    let mut filled = 0usize;
    while filled < header_buf.len() {
        if ctx.shutdown.is_set() {
            return Ok(None);
        }
        let read = tokio::time::timeout(
            Duration::from_secs(1),
            stream.read(&mut header_buf[filled..]),
        )
        .await;
        match read {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => {
                if filled == 0 {
                    return Ok(None);
                }
                anyhow::bail!("connection closed mid-header");
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(err)) => return Err(err).context("MRT header read"),
        }
    }
    let header = MrtHeader::decode(&header_buf)?;
    // A TABLE_DUMP_V2 record is bounded in practice; a length beyond this
    // means a desynchronized or hostile stream.
    const MAX_MRT_MESSAGE: u32 = 16 * 1024 * 1024;
    if header.length > MAX_MRT_MESSAGE {
        anyhow::bail!("MRT message of {} bytes refused", header.length);
    }
    let mut body = vec![0u8; header.length as usize];
    let mut filled = 0usize;
    while filled < body.len() {
        if ctx.shutdown.is_set() {
            return Ok(None);
        }
        let read =
            tokio::time::timeout(Duration::from_secs(1), stream.read(&mut body[filled..])).await;
        match read {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => anyhow::bail!("connection closed mid-message"),
            Ok(Ok(n)) => filled += n,
            Ok(Err(err)) => return Err(err).context("MRT body read"),
        }
    }
    Ok(Some((header, body)))
}

/// Drive one TABLE_DUMP_V2 conversation: the peer index table, then RIB
/// records until end of stream, then the paced drain.
async fn mrt_connection(ctx: Arc<MrtContext>, mut stream: TcpStream, addr: SocketAddr) {
    match mrt_process_table(&ctx, &mut stream).await {
        Ok(()) => info!("MRT connection {} finished", addr),
        Err(err) => warn!("MRT connection {}: {:#}", addr, err),
    }
}

async fn mrt_process_table(ctx: &MrtContext, stream: &mut TcpStream) -> Result<()> {
    let Some((header, body)) = read_mrt_message(stream, ctx).await? else {
        return Ok(());
    };
    if header.typ != MRT_TABLE_DUMP_V2 {
        anyhow::bail!("MRT stream opened with type {} rather than TABLE_DUMP_V2", header.typ);
    }
    if TableDumpSubtype::from(header.subtype) != TableDumpSubtype::PeerIndexTable {
        anyhow::bail!(
            "TABLE_DUMP_V2 initiated with subtype {} rather than PEER_INDEX_TABLE",
            header.subtype
        );
    }
    let index = PeerIndexTable::parse(&body)?;
    let collector = index.collector_addr();
    info!(
        "PEER_INDEX_TABLE from collector {} with {} peers",
        collector,
        index.peers.len()
    );

    let mut buffers: Vec<TableBuffer> = Vec::with_capacity(index.peers.len());
    for peer in index.peers.iter() {
        let session = ctx
            .registry
            .find_or_create_mrt(peer.asn, peer.addr, collector, ctx.label_action)?;
        buffers.push(TableBuffer::new(session));
    }

    let mut message_count: u64 = 0;
    loop {
        if ctx.shutdown.is_set() {
            break;
        }
        ctx.last_action.touch();
        let Some((header, body)) = read_mrt_message(stream, ctx).await? else {
            break;
        };
        if header.typ != MRT_TABLE_DUMP_V2 {
            anyhow::bail!(
                "MRT message of type {} on a TABLE_DUMP_V2 stream",
                header.typ
            );
        }
        let subtype = TableDumpSubtype::from(header.subtype);
        match subtype {
            TableDumpSubtype::PeerIndexTable => {
                anyhow::bail!("only one PEER_INDEX_TABLE is expected per stream");
            }
            TableDumpSubtype::RibIpv4Multicast | TableDumpSubtype::RibIpv6Multicast => {
                // Parsed for validity, content unsupported.
                let _ = RibAfiEntries::parse(&body, subtype)?;
                warn!("unsupported table dump subtype RIB_IPV(4|6)_MULTICAST");
            }
            TableDumpSubtype::RibIpv4Unicast | TableDumpSubtype::RibIpv6Unicast => {
                let record = RibAfiEntries::parse(&body, subtype)?;
                if record.entries.len() > index.peers.len() {
                    anyhow::bail!("RIB record has more entries than the table has peers");
                }
                let (afi, safi) = subtype.afi_safi().unwrap();
                for entry in record.entries.iter() {
                    let Some(buffer) = buffers.get_mut(entry.peer_index as usize) else {
                        anyhow::bail!("RIB entry references unknown peer index {}", entry.peer_index);
                    };
                    match synthesize_update(afi, safi, record.plen, &record.prefix, &entry.attrs)
                    {
                        Ok(update) => {
                            buffer.messages.push(update.to_vec());
                            message_count += 1;
                        }
                        Err(err) => {
                            warn!(
                                "sequence {}: dropping RIB entry for peer {}: {}",
                                record.sequence, entry.peer_index, err
                            );
                        }
                    }
                }
            }
            TableDumpSubtype::RibGeneric => {
                // One record only; the stream continues.
                warn!("RIB_GENERIC record skipped");
            }
            TableDumpSubtype::Unknown(value) => {
                anyhow::bail!("invalid subtype {} for a TABLE_DUMP_V2 stream", value);
            }
        }
    }
    info!("MRT stream done, {} updates synthesized", message_count);

    drain_tables(ctx, &mut buffers).await;
    Ok(())
}

/// Hold each peer's buffer until its synthetic session is confirmed by
/// live traffic (MrtEstablished fixes the AS-number width), then emit it
/// at a controlled rate. Peers that never confirm are expired.
async fn drain_tables(ctx: &MrtContext, buffers: &mut [TableBuffer]) {
    let writer = ctx.publication.add_writer();
    let mut waited = 0u32;
    while waited < TABLE_WAIT_LOOPS && !ctx.shutdown.is_set() {
        ctx.last_action.touch();
        if buffers.iter().all(|b| b.sent) {
            break;
        }
        for buffer in buffers.iter_mut().filter(|b| !b.sent) {
            if ctx.shutdown.is_set() {
                return;
            }
            if buffer.session.state() == FsmState::MrtEstablished {
                info!(
                    "live session confirmed for session {} (AS width {})",
                    buffer.session.id,
                    buffer.session.as_width()
                );
                write_table_to_queue(buffer, &writer, &ctx.last_action).await;
            }
        }
        waited += 1;
        if waited < TABLE_WAIT_LOOPS {
            for _ in 0..TABLE_TRANSFER_SLEEP {
                if ctx.shutdown.is_set() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    for buffer in buffers.iter_mut().filter(|b| !b.sent) {
        expire_table(buffer);
    }
}
