//! Relay module
//!
//! The two directions of the bridge. Each flow owns its own buffer; the only
//! state they share is the [`BridgeSlot`].
//!
//! - serial -> socket: driven by serial events. Data is dropped when no
//!   client is installed, and overflow events flush the receive side.
//! - socket -> serial: blocks on the client socket and writes whatever
//!   arrives straight to the serial port.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::config::{TcpServerConfig, UartConfig};
use crate::slot::{BridgeSlot, Connection};
use crate::uart::{SerialEvent, SerialPort};

/// Buffering and retry limits shared by both flows
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    /// Capacity of each direction's buffer
    pub buffer_size: usize,
    /// Consecutive zero-length writes after which a client is dead
    pub max_zero_writes: u32,
    /// Wait for the next serial event
    pub event_poll: Duration,
    /// Wait for a single serial read
    pub read_timeout: Duration,
    /// Sleep of the socket -> serial flow while the slot is empty
    pub idle_poll: Duration,
}

impl RelayPolicy {
    pub fn new(tcp: &TcpServerConfig, uart: &UartConfig) -> Self {
        Self {
            buffer_size: tcp.buffer_size,
            max_zero_writes: tcp.max_zero_writes,
            event_poll: Duration::from_millis(uart.event_poll_ms),
            read_timeout: Duration::from_millis(uart.read_timeout_ms),
            idle_poll: Duration::from_millis(tcp.idle_poll_ms),
        }
    }
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self::new(&TcpServerConfig::default(), &UartConfig::default())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn trace_bytes(direction: &str, data: &[u8]) {
    if log::log_enabled!(log::Level::Trace) {
        let hex_str: String = data.iter().map(|b| format!("{:02X} ", b)).collect();
        trace!("{}: {} bytes (hex): {}", direction, data.len(), hex_str);
    }
}

/// Run the serial -> socket flow until `running` is cleared
pub fn serial_to_socket<S, C>(serial: &S, slot: &BridgeSlot<C>, policy: &RelayPolicy, running: &AtomicBool)
where
    S: SerialPort + ?Sized,
    C: Connection,
{
    let mut buffer = vec![0u8; policy.buffer_size];
    info!("Serial -> socket flow started");

    while running.load(Ordering::Acquire) {
        if let Some(event) = serial.next_event(policy.event_poll) {
            handle_serial_event(serial, slot, policy, event, &mut buffer);
        }
    }

    info!("Serial -> socket flow stopped");
}

/// React to one serial driver event
pub fn handle_serial_event<S, C>(
    serial: &S,
    slot: &BridgeSlot<C>,
    policy: &RelayPolicy,
    event: SerialEvent,
    buffer: &mut [u8],
) where
    S: SerialPort + ?Sized,
    C: Connection,
{
    match event {
        SerialEvent::DataAvailable(size) => match slot.current() {
            None => {
                debug!("No client, dropping {} serial bytes", size);
                serial.flush_input();
            }
            Some(lease) => {
                if !forward(serial, lease.conn.as_ref(), size, buffer, policy) && slot.release(lease.generation) {
                    warn!("Client stopped accepting data, slot cleared");
                }
            }
        },
        SerialEvent::HardwareOverflow | SerialEvent::SoftwareBufferFull => {
            warn!("Serial receive overflow ({:?}), input flushed", event);
            serial.flush_input();
            serial.reset_events();
        }
        SerialEvent::ParityError | SerialEvent::FramingError => {
            debug!("Serial line error: {:?}", event);
        }
    }
}

/// Move `size` announced bytes from the serial port to the client.
/// Returns false once the client has to be considered dead.
fn forward<S, C>(serial: &S, conn: &C, mut remaining: usize, buffer: &mut [u8], policy: &RelayPolicy) -> bool
where
    S: SerialPort + ?Sized,
    C: Connection,
{
    while remaining > 0 {
        let want = remaining.min(buffer.len());
        let len = match serial.read(&mut buffer[..want], policy.read_timeout) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) => {
                warn!("Serial read failed: {}", e);
                return true;
            }
        };
        remaining = remaining.saturating_sub(len);

        trace_bytes("UART -> TCP", &buffer[..len]);
        if !send_all(conn, &buffer[..len], policy.max_zero_writes) {
            return false;
        }
    }

    true
}

fn send_all<C: Connection>(conn: &C, mut data: &[u8], max_zero_writes: u32) -> bool {
    let mut zero_writes = 0;

    while !data.is_empty() {
        match conn.send(data) {
            Ok(0) => zero_writes += 1,
            Ok(n) => {
                data = &data[n..];
                zero_writes = 0;
            }
            Err(e) if is_transient(&e) => zero_writes += 1,
            Err(e) => {
                warn!("Socket write failed: {}", e);
                return false;
            }
        }

        if zero_writes >= max_zero_writes {
            warn!("{} zero-length socket writes in a row", zero_writes);
            return false;
        }
    }

    true
}

/// Run the socket -> serial flow until `running` is cleared
pub fn socket_to_serial<S, C>(serial: &S, slot: &BridgeSlot<C>, policy: &RelayPolicy, running: &AtomicBool)
where
    S: SerialPort + ?Sized,
    C: Connection,
{
    let mut buffer = vec![0u8; policy.buffer_size];
    info!("Socket -> serial flow started");

    while running.load(Ordering::Acquire) {
        let Some(lease) = slot.current() else {
            thread::sleep(policy.idle_poll);
            continue;
        };

        match lease.conn.recv(&mut buffer) {
            Ok(0) => {
                if slot.release(lease.generation) {
                    info!("Client closed the connection");
                }
            }
            Ok(n) => {
                trace_bytes("TCP -> UART", &buffer[..n]);
                if let Err(e) = serial.write(&buffer[..n]) {
                    error!("Error sending data to UART: {}", e);
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                if slot.release(lease.generation) {
                    warn!("Error reading from client: {}, slot cleared", e);
                }
            }
        }
    }

    info!("Socket -> serial flow stopped");
}
