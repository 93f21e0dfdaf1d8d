//! TCP listener: one task and one `ServerSession` per connection

use crate::session::{ServerContext, ServerSession};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wxpush_protocol::TcpPacket;
use wxpush_transport::{FramingError, TcpFramer, write_packet};

/// How long open connections get to finish after shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    max_frame_size: usize,
    shutdown_timeout: Duration,
}

impl TcpServer {
    pub fn new(listener: TcpListener, ctx: Arc<ServerContext>, max_frame_size: usize) -> Self {
        Self {
            listener,
            ctx,
            max_frame_size,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown. Then stop listening and give open
    /// connections up to the shutdown timeout to finish the packets they have
    /// received before aborting them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let Self {
            listener,
            ctx,
            max_frame_size,
            shutdown_timeout,
        } = self;
        info!("TCP server listening on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };
                    debug!("New connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }

                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let (reader, writer) = stream.into_split();
                        ctx.metrics.active_sessions.inc();
                        let served = serve_connection(
                            reader,
                            writer,
                            addr,
                            ctx.clone(),
                            max_frame_size,
                            shutdown,
                        )
                        .await;
                        match served {
                            Ok(()) => info!(peer = %addr, "Connection closed"),
                            Err(e) => warn!(peer = %addr, "Connection closed: {}", e),
                        }
                        ctx.metrics.active_sessions.dec();
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        info!(open = connections.len(), "TCP server stopping");
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
            warn!(
                open = connections.len(),
                "Connections still open after {:?}, aborting", shutdown_timeout
            );
            connections.shutdown().await;
        }
        Ok(())
    }
}

async fn reply<W>(
    session: &mut ServerSession,
    writer: &mut W,
    ctx: &ServerContext,
    packet: TcpPacket,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for reply in session.handle(packet).await? {
        let size = write_packet(writer, &reply).await?;
        ctx.metrics.packet_sent(reply.packet_type(), size);
    }
    Ok(())
}

/// Run a session over any byte stream until the peer disconnects or shutdown
/// is signalled. On shutdown, packets already received in full are handled
/// and answered before the connection closes.
pub async fn serve_connection<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = TcpFramer::with_max_frame_size(max_frame_size);
    let mut session = ServerSession::new(ctx.clone(), peer);
    let mut dropped = 0;

    loop {
        let read = if *shutdown.borrow() {
            None
        } else {
            tokio::select! {
                read = framer.read_packet(&mut reader) => Some(read),
                _ = shutdown.changed() => None,
            }
        };
        let Some(read) = read else {
            while let Some(packet) = framer.next_packet()? {
                ctx.metrics.packets_received.inc();
                reply(&mut session, &mut writer, &ctx, packet).await?;
            }
            debug!(peer = %peer, "Closing connection for shutdown");
            return Ok(());
        };

        let packet = match read {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(e @ (FramingError::UnknownPacketType(_) | FramingError::BadHeader(_))) => {
                ctx.metrics.malformed_packets.inc();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if framer.dropped() > dropped {
            ctx.metrics.malformed_packets.inc_by(framer.dropped() - dropped);
            dropped = framer.dropped();
        }
        ctx.metrics.packets_received.inc();

        reply(&mut session, &mut writer, &ctx, packet).await?;
    }
}
