// Serial transport: newline-terminated records over a serial link

use std::collections::VecDeque;
use std::io::{self, Read};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, warn};

use super::{CommandChannel, ConnectionInfo, Frame};
use crate::config::{BUFFER_SIZE, SERIAL_READ_TIMEOUT};

/// Bytes pulled from the link per read
const READ_CHUNK: usize = 64;

/// Upper bound on reads per tick so a chatty link cannot stall the loop
const MAX_READS_PER_TICK: usize = 8;

/// Poll interval of the boot probe
const PROBE_POLL: Duration = Duration::from_millis(1);

/// The byte-level operations the channel needs from a serial port
pub trait SerialLink {
    /// Bytes already received and waiting to be read
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read waiting bytes into `buf`, returning how many were read
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }
}

/// Frames serial input into lines
pub struct SerialChannel<S> {
    link: S,
    line: Vec<u8>,
    frames: VecDeque<Frame>,
}

impl SerialChannel<Box<dyn SerialPort>> {
    /// Open a serial device
    pub fn open(device: &str, baud: u32) -> serialport::Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(SERIAL_READ_TIMEOUT)
            .open()?;
        Ok(Self::new(port))
    }
}

impl<S: SerialLink> SerialChannel<S> {
    pub fn new(link: S) -> Self {
        Self {
            link,
            line: Vec::with_capacity(BUFFER_SIZE),
            frames: VecDeque::new(),
        }
    }

    /// Boot probe: true if any byte shows up within `window`. Does not consume input.
    pub fn input_waiting(&mut self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            match self.link.bytes_available() {
                Ok(0) => {}
                Ok(_) => return true,
                Err(e) => {
                    warn!("Serial probe failed: {}", e);
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(PROBE_POLL);
        }
    }

    /// Pull whatever is waiting on the link into the line assembler
    fn drain_link(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..MAX_READS_PER_TICK {
            let available = self.link.bytes_available()?;
            if available == 0 {
                break;
            }
            let n = self.link.read_available(&mut chunk[..available.min(READ_CHUNK)])?;
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                self.push_byte(byte);
            }
        }
        Ok(())
    }

    fn push_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            let mut line = std::mem::replace(&mut self.line, Vec::with_capacity(BUFFER_SIZE));
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                debug!("Serial line of {} bytes", line.len());
                self.frames.push_back(line);
            }
        } else if self.line.len() < BUFFER_SIZE {
            self.line.push(byte);
        }
        // Bytes past BUFFER_SIZE are dropped until the newline
    }

    pub fn link_mut(&mut self) -> &mut S {
        &mut self.link
    }
}

impl<S: SerialLink> CommandChannel for SerialChannel<S> {
    fn try_receive(&mut self) -> io::Result<Option<Frame>> {
        if self.frames.is_empty() {
            self.drain_link()?;
        }
        Ok(self.frames.pop_front())
    }

    fn connection(&self) -> ConnectionInfo {
        ConnectionInfo::serial()
    }
}
