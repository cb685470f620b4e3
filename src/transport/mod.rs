// Command transports: serial line or UDP datagram, chosen once at boot
//
// Both transports sit behind `CommandChannel`, so the control loop only ever asks
// "did a complete new command arrive".

pub mod serial;
pub mod udp;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::AddressingMode;

pub use serial::{SerialChannel, SerialLink};
pub use udp::{NetworkConfig, UdpChannel};

/// Raw bytes of one received command, at most `BUFFER_SIZE` long
pub type Frame = Vec<u8>;

/// A source of inbound command frames
pub trait CommandChannel {
    /// Non-blocking: `Ok(None)` when no complete new frame is waiting
    fn try_receive(&mut self) -> io::Result<Option<Frame>>;

    /// Transport and address, for logging and the status display
    fn connection(&self) -> ConnectionInfo;
}

/// Transport chosen at boot, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Serial,
    Network(AddressingMode),
}

impl TransportMode {
    /// Short label shown on the display
    pub fn label(&self) -> &'static str {
        match self {
            TransportMode::Serial => "USB",
            TransportMode::Network(AddressingMode::Dynamic) => "DHCP",
            TransportMode::Network(AddressingMode::Static) => "STATIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub mode: TransportMode,
    pub address: Option<IpAddr>,
}

impl ConnectionInfo {
    pub fn serial() -> Self {
        Self {
            mode: TransportMode::Serial,
            address: None,
        }
    }

    pub fn network(addressing: AddressingMode, address: IpAddr) -> Self {
        Self {
            mode: TransportMode::Network(addressing),
            address: Some(address),
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{} {}", self.mode.label(), address),
            None => f.write_str(self.mode.label()),
        }
    }
}

/// The transport selected at boot
pub enum ActiveTransport<S, N> {
    Serial(S),
    Network(N),
}

impl<S: CommandChannel, N: CommandChannel> CommandChannel for ActiveTransport<S, N> {
    fn try_receive(&mut self) -> io::Result<Option<Frame>> {
        match self {
            ActiveTransport::Serial(channel) => channel.try_receive(),
            ActiveTransport::Network(channel) => channel.try_receive(),
        }
    }

    fn connection(&self) -> ConnectionInfo {
        match self {
            ActiveTransport::Serial(channel) => channel.connection(),
            ActiveTransport::Network(channel) => channel.connection(),
        }
    }
}

/// One-time boot decision between serial and network input
pub struct TransportSelector {
    window: Duration,
}

impl TransportSelector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Use serial if it has input waiting within the detection window;
    /// otherwise run `bring_up` for the network. `bring_up` is never called
    /// once serial is chosen.
    pub fn select<S, N, F>(
        &self,
        serial: Option<SerialChannel<S>>,
        bring_up: F,
    ) -> ActiveTransport<SerialChannel<S>, N>
    where
        S: SerialLink,
        F: FnOnce() -> N,
    {
        if let Some(mut channel) = serial {
            if channel.input_waiting(self.window) {
                info!("Serial input detected, using serial transport");
                return ActiveTransport::Serial(channel);
            }
            debug!("No serial input within {:?}", self.window);
        }

        ActiveTransport::Network(bring_up())
    }
}
