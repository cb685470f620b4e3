// Keyboard jog: A/D step, J ramp, H home, P power cycle, R/F step size, Q quit
//
// Usage: cargo run --example jog -- [node-address]
// Example: cargo run --example jog -- 192.168.1.111:8888
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use serde_json::json;
use std::net::UdpSocket;
use std::time::Duration;
use tracing::info;

const STEP_SIZES: [u32; 3] = [50, 200, 1600]; // pulses per key press
const SPEED: u32 = 800; // pulses/s
const RAMP_SLOPE: u32 = 100;
const HOME_SEARCH: u32 = 20_000;
const DEFAULT_NODE: &str = "192.168.1.111:8888";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let node = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_NODE.to_string());
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(&node)?;

    info!("Sending to {}", node);
    info!("Controls: A/D=step, J=ramp, H=home, P=power cycle, R/F=step size, Q=quit");
    print_step_size(0);

    enable_raw_mode()?;
    let result = run_jog(&socket);
    disable_raw_mode()?;

    result
}

fn run_jog(socket: &UdpSocket) -> Result<(), Box<dyn std::error::Error>> {
    let mut size_idx: usize = 0;
    let mut forward = true;

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }

        let cmd = match code {
            KeyCode::Char('a') => {
                forward = false;
                command(0, STEP_SIZES[size_idx], 0, forward)
            }
            KeyCode::Char('d') => {
                forward = true;
                command(0, STEP_SIZES[size_idx], 0, forward)
            }
            KeyCode::Char('j') => command(2, STEP_SIZES[size_idx], RAMP_SLOPE, forward),
            KeyCode::Char('h') => command(1, HOME_SEARCH, 0, false),
            KeyCode::Char('p') => command(3, 0, 0, false),

            KeyCode::Char('r') => {
                size_idx = (size_idx + 1).min(STEP_SIZES.len() - 1);
                print_step_size(size_idx);
                continue;
            }
            KeyCode::Char('f') => {
                size_idx = size_idx.saturating_sub(1);
                print_step_size(size_idx);
                continue;
            }

            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        socket.send(cmd.to_string().as_bytes())?;
    }

    Ok(())
}

fn command(mode: u8, steps: u32, slope: u32, direction: bool) -> serde_json::Value {
    json!({
        "mode": mode,
        "steps": steps,
        "speed": SPEED,
        "slope": slope,
        "direction": direction,
        "stepMode": 1,
        "hold": false
    })
}

fn print_step_size(idx: usize) {
    info!("Step size: {} pulses", STEP_SIZES[idx]);
}
