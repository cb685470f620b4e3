// Network transport: one command record per UDP datagram
//
// Bring-up follows the addressing mode resolved at startup. Every failure is
// logged and degrades; the node keeps running even if it cannot listen.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use tracing::{debug, error, info};

use super::{CommandChannel, ConnectionInfo, Frame};
use crate::config::{AddressingMode, BUFFER_SIZE, NodeConfig};

// Documentation-range address used only for a routing table lookup; nothing is sent
const ROUTE_PROBE: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9));

#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub addressing: AddressingMode,
    pub static_ip: Ipv4Addr,
    pub port: u16,
}

impl From<&NodeConfig> for NetworkConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            addressing: config.addressing,
            static_ip: config.static_ip,
            port: config.port,
        }
    }
}

pub struct UdpChannel {
    socket: Option<UdpSocket>,
    connection: ConnectionInfo,
}

impl UdpChannel {
    /// Bind a non-blocking socket on `addr`
    pub fn bind(addr: SocketAddr, connection: ConnectionInfo) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            connection,
        })
    }

    /// A channel with no socket; never receives
    pub fn detached(connection: ConnectionInfo) -> Self {
        Self {
            socket: None,
            connection,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl CommandChannel for UdpChannel {
    fn try_receive(&mut self) -> io::Result<Option<Frame>> {
        let Some(socket) = &self.socket else {
            return Ok(None);
        };

        // Datagrams longer than the buffer are truncated by the socket
        let mut buf = [0u8; BUFFER_SIZE];
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => Ok(None),
            Ok((n, peer)) => {
                debug!("Datagram of {} bytes from {}", n, peer);
                Ok(Some(buf[..n].to_vec()))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn connection(&self) -> ConnectionInfo {
        self.connection
    }
}

/// Bring up the network transport and start listening on the command port
pub fn bring_up(config: &NetworkConfig) -> UdpChannel {
    match config.addressing {
        AddressingMode::Dynamic => match discover_local_ip() {
            Ok(ip) => {
                info!("Network OK");
                let wildcard = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
                bind_or_detach(wildcard, ConnectionInfo::network(AddressingMode::Dynamic, ip))
            }
            Err(e) => {
                error!("Network no link: {}", e);
                info!("Falling back to static address {}", config.static_ip);
                bind_static(config)
            }
        },
        AddressingMode::Static => {
            if let Err(e) = discover_local_ip() {
                error!("Network no link: {}", e);
            }
            let channel = bind_static(config);
            info!("Network OK");
            channel
        }
    }
}

fn bind_static(config: &NetworkConfig) -> UdpChannel {
    let connection =
        ConnectionInfo::network(AddressingMode::Static, IpAddr::V4(config.static_ip));
    let addr = SocketAddr::from((config.static_ip, config.port));

    match UdpChannel::bind(addr, connection) {
        Ok(channel) => channel,
        Err(e) => {
            error!("Static address {} unavailable: {}", config.static_ip, e);
            let wildcard = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
            bind_or_detach(wildcard, connection)
        }
    }
}

fn bind_or_detach(addr: SocketAddr, connection: ConnectionInfo) -> UdpChannel {
    UdpChannel::bind(addr, connection).unwrap_or_else(|e| {
        error!("Cannot listen on {}: {}", addr, e);
        UdpChannel::detached(connection)
    })
}

/// Address the host would use for outbound traffic
fn discover_local_ip() -> io::Result<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(ROUTE_PROBE)?;
    let ip = probe.local_addr()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no routable interface",
        ));
    }
    Ok(ip)
}
