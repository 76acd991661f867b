use crate::dhcp::handler::Handler;
use crate::dhcp::packet::DhcpPacket;
use crate::dhcp::subnet::SubnetTable;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// UDP listener. One receive loop; each packet is handed to its own worker
/// task, so handlers for different clients run in parallel.
pub struct DhcpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    subnets: Arc<RwLock<Arc<SubnetTable>>>,
    shutdown_grace: Duration,
}

impl DhcpServer {
    pub fn new(
        bind_address: &str,
        port: u16,
        handler: Handler,
        subnets: SubnetTable,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        let socket = bind_socket(bind_address, port)?;
        info!("DHCP server listening on {}:{}", bind_address, port);

        Ok(Self {
            socket: Arc::new(socket),
            handler: Arc::new(handler),
            subnets: Arc::new(RwLock::new(Arc::new(subnets))),
            shutdown_grace,
        })
    }

    /// Atomically replace the subnet map. Workers that already captured the
    /// previous table finish against it.
    pub async fn reload_subnets(&self, table: SubnetTable) {
        let count = table.len();
        *self.subnets.write().await = Arc::new(table);
        info!("subnet map reloaded: {} subnets", count);
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; 1500];
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((size, src)) => {
                            let data = buf[..size].to_vec();
                            let handler = Arc::clone(&self.handler);
                            let socket = Arc::clone(&self.socket);
                            let table = Arc::clone(&*self.subnets.read().await);
                            workers.spawn(async move {
                                process_packet(handler, socket, table, data, src).await;
                            });
                            // reap finished workers as we go
                            while workers.try_join_next().is_some() {}
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
            }
        }

        info!("listener stopped, draining {} workers", workers.len());
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if timeout(self.shutdown_grace, drain).await.is_err() {
            warn!("shutdown grace elapsed, aborting remaining workers");
            workers.abort_all();
        }

        Ok(())
    }
}

fn bind_socket(bind_address: &str, port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind_address}"))?;

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;

    Ok(UdpSocket::from_std(socket.into())?)
}

async fn process_packet(
    handler: Arc<Handler>,
    socket: Arc<UdpSocket>,
    table: Arc<SubnetTable>,
    data: Vec<u8>,
    src: SocketAddr,
) {
    let packet = match DhcpPacket::parse(&data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("unparseable packet from {}: {}", src, e);
            return;
        }
    };

    let subnet = match table.resolve(packet.giaddr, packet.ciaddr) {
        Ok(subnet) => subnet,
        Err(_) => {
            warn!(
                "no configured subnet for packet from {} (giaddr {}, ciaddr {})",
                src, packet.giaddr, packet.ciaddr
            );
            return;
        }
    };

    match handler.handle(&packet, subnet).await {
        Ok(Some(reply)) => {
            let dest = reply_destination(&packet);
            let bytes = reply.to_bytes();
            if let Err(e) = socket.send_to(&bytes, dest).await {
                error!("failed to send reply to {}: {}", dest, e);
            } else {
                debug!("reply sent to {}", dest);
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!("error handling packet from {}: {}", src, e);
        }
    }
}

/// Where a reply goes: back through the relay when one forwarded the
/// request, to the broadcast address for clients that do not have an
/// address yet, unicast otherwise.
fn reply_destination(request: &DhcpPacket) -> SocketAddr {
    if !request.giaddr.is_unspecified() {
        return SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT);
    }
    if request.is_broadcast() || request.ciaddr.is_unspecified() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT);
    }
    SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relayed_request_returns_through_relay() {
        let mut request = DhcpPacket::new();
        request.giaddr = Ipv4Addr::new(10, 0, 0, 1);
        let dest = reply_destination(&request);
        assert_eq!(dest, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 67));
    }

    #[test]
    fn fresh_client_gets_broadcast() {
        let request = DhcpPacket::new();
        let dest = reply_destination(&request);
        assert_eq!(dest, SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 68));
    }

    #[test]
    fn broadcast_flag_forces_broadcast() {
        let mut request = DhcpPacket::new();
        request.flags = 0x8000;
        request.ciaddr = Ipv4Addr::new(192, 168, 1, 9);
        let dest = reply_destination(&request);
        assert_eq!(dest, SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 68));
    }

    #[test]
    fn renewing_client_gets_unicast() {
        let mut request = DhcpPacket::new();
        request.ciaddr = Ipv4Addr::new(192, 168, 1, 9);
        let dest = reply_destination(&request);
        assert_eq!(dest, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)), 68));
    }
}
