// Build-time defaults, command-line overrides, resolved node configuration
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

// Control loop frequency
pub const LOOP_HZ: u64 = 200;

// Maximum inbound payload; longer input is truncated before decode
pub const BUFFER_SIZE: usize = 256;

// Network transport
pub const LOCAL_PORT: u16 = 8888;
pub const STATIC_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 111);

// Serial transport
pub const SERIAL_DEVICE: &str = "/dev/ttyACM0";
pub const BAUD_RATE: u32 = 115_200;
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);

// How long boot waits for bytes on the serial input before choosing the network
pub const SERIAL_DETECT_WINDOW: Duration = Duration::from_millis(10);

// Status display refresh interval
pub const DISPLAY_REFRESH: Duration = Duration::from_millis(1000);

// Motor actions waiting behind the one in flight
pub const ACTION_QUEUE_DEPTH: usize = 4;

/// How the network transport acquires its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AddressingMode {
    /// Use the address the host network already assigned, fall back to static
    Dynamic,
    /// Bind the fixed static address
    Static,
}

/// Ethersweep actuator node
#[derive(Parser, Debug)]
#[command(name = "ethersweep-runtime")]
#[command(version)]
#[command(about = "Networked stepper actuator control loop")]
pub struct Args {
    /// Serial device probed at boot for a directly attached controller
    #[arg(long, default_value = SERIAL_DEVICE)]
    pub serial_device: String,

    /// Serial baud rate
    #[arg(long, default_value_t = BAUD_RATE)]
    pub baud: u32,

    /// Network addressing mode
    #[arg(long, value_enum, default_value_t = AddressingMode::Dynamic)]
    pub addressing: AddressingMode,

    /// Static address used directly (static mode) or as fallback (dynamic mode)
    #[arg(long, default_value_t = STATIC_IP)]
    pub static_ip: Ipv4Addr,

    /// UDP port commands are received on
    #[arg(long, default_value_t = LOCAL_PORT)]
    pub port: u16,

    /// Display refresh interval in milliseconds
    #[arg(long, default_value_t = DISPLAY_REFRESH.as_millis() as u64)]
    pub display_refresh_ms: u64,

    /// Control loop frequency in Hz
    #[arg(long, default_value_t = LOOP_HZ)]
    pub loop_hz: u64,
}

/// Configuration resolved once at startup and fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub serial_device: String,
    pub baud: u32,
    pub serial_detect_window: Duration,
    pub addressing: AddressingMode,
    pub static_ip: Ipv4Addr,
    pub port: u16,
    pub display_refresh: Duration,
    pub loop_period: Duration,
    pub action_queue_depth: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            serial_device: SERIAL_DEVICE.to_string(),
            baud: BAUD_RATE,
            serial_detect_window: SERIAL_DETECT_WINDOW,
            addressing: AddressingMode::Dynamic,
            static_ip: STATIC_IP,
            port: LOCAL_PORT,
            display_refresh: DISPLAY_REFRESH,
            loop_period: Duration::from_millis(1000 / LOOP_HZ),
            action_queue_depth: ACTION_QUEUE_DEPTH,
        }
    }
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        // A zero rate would make the interval panic
        let loop_hz = args.loop_hz.clamp(1, 1000);
        Self {
            serial_device: args.serial_device,
            baud: args.baud,
            addressing: args.addressing,
            static_ip: args.static_ip,
            port: args.port,
            display_refresh: Duration::from_millis(args.display_refresh_ms),
            loop_period: Duration::from_millis(1000 / loop_hz),
            ..Self::default()
        }
    }
}
