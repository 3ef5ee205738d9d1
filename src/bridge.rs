//! Bridge module
//!
//! This module provides the UART <-> TCP bridge engine: a listener that admits
//! a single client into the [`BridgeSlot`] and the two relay flows that move
//! bytes between that client and the serial port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{TcpServerConfig, UartConfig};
use crate::error::{Error, Result};
use crate::relay::{self, RelayPolicy};
use crate::slot::{BridgeSlot, Connection};
use crate::uart::SerialPort;
use crate::wifi::NetworkEvent;

#[cfg(target_os = "espidf")]
const FLOW_STACK_SIZE: usize = 6 * 1024;
#[cfg(not(target_os = "espidf"))]
const FLOW_STACK_SIZE: usize = 64 * 1024;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

struct Listening {
    local: SocketAddr,
    accept: JoinHandle<()>,
}

/// Bridge Engine
///
/// Owns the listener, the client slot and the serial port shared by the relay flows.
pub struct BridgeEngine<S: SerialPort + 'static> {
    tcp: TcpServerConfig,
    uart: UartConfig,
    serial: Arc<S>,
    slot: Arc<BridgeSlot<TcpStream>>,
    running: Arc<AtomicBool>,
    listening: Mutex<Option<Listening>>,
}

impl<S: SerialPort + 'static> BridgeEngine<S> {
    pub fn new(tcp: TcpServerConfig, uart: UartConfig, serial: Arc<S>) -> Self {
        Self {
            tcp,
            uart,
            serial,
            slot: Arc::new(BridgeSlot::new()),
            running: Arc::new(AtomicBool::new(false)),
            listening: Mutex::new(None),
        }
    }

    /// The client slot shared with the relay flows
    pub fn slot(&self) -> Arc<BridgeSlot<TcpStream>> {
        Arc::clone(&self.slot)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind the listener, configure the serial port and spawn the accept loop
    /// and both relay flows. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(Error::General("Bridge already running".to_string()));
        }

        let bind_address = format!("{}:{}", self.tcp.bind_address, self.tcp.port);
        let listener = TcpListener::bind(&bind_address)
            .map_err(|e| Error::TcpError(format!("Failed to bind to {}: {}", bind_address, e)))?;
        apply_backlog(&listener, self.tcp.backlog);

        let local = listener
            .local_addr()
            .map_err(|e| Error::TcpError(format!("Failed to read listener address: {}", e)))?;

        self.serial.configure(self.uart.baudrate)?;
        self.running.store(true, Ordering::Release);

        let policy = RelayPolicy::new(&self.tcp, &self.uart);

        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);
        let accept = spawn_flow("bridge_accept", move || {
            accept_loop(listener, slot.as_ref(), running.as_ref())
        })?;
        *self.listening.lock().unwrap_or_else(PoisonError::into_inner) = Some(Listening { local, accept });

        let serial = Arc::clone(&self.serial);
        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);
        let u2w_policy = policy.clone();
        spawn_flow("u2w", move || {
            relay::serial_to_socket(serial.as_ref(), slot.as_ref(), &u2w_policy, running.as_ref())
        })?;

        let serial = Arc::clone(&self.serial);
        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);
        spawn_flow("w2u", move || {
            relay::socket_to_serial(serial.as_ref(), slot.as_ref(), &policy, running.as_ref())
        })?;

        info!("Bridge listening on {}", local);
        Ok(local)
    }

    /// Evict the client whenever the network goes down
    pub fn watch_network(&self, events: Receiver<NetworkEvent>) -> Result<()> {
        let slot = Arc::clone(&self.slot);
        spawn_flow("bridge_net", move || {
            for event in events {
                match event {
                    NetworkEvent::Down => {
                        if slot.evict() {
                            warn!("Network down, client evicted");
                        }
                    }
                    NetworkEvent::Up(mode) => debug!("Network up ({:?})", mode),
                }
            }
        })?;
        Ok(())
    }

    /// Stop relaying, drop the client and close the listener. Returns once the
    /// port is free again; the relay flows exit at their next poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.slot.evict();

        let listening = self.listening.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Listening { local, accept }) = listening {
            // The accept loop only sees the flag once a connection wakes it.
            match TcpStream::connect_timeout(&wake_address(local), WAKE_TIMEOUT) {
                Ok(_) => {
                    if accept.join().is_err() {
                        error!("Accept loop panicked");
                    }
                }
                Err(e) => warn!("Failed to wake accept loop on {}: {}", local, e),
            }
        }

        info!("Bridge stopped");
    }
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    } else {
        local
    }
}

fn spawn_flow<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(FLOW_STACK_SIZE)
        .spawn(body)
        .map_err(|e| Error::General(format!("Failed to spawn {}: {}", name, e)))
}

fn accept_loop(listener: TcpListener, slot: &BridgeSlot<TcpStream>, running: &AtomicBool) {
    for stream in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }

        match stream {
            Ok(stream) => admit(stream, slot),
            Err(e) => error!("Connection failed: {}", e),
        }
    }

    info!("Accept loop stopped");
}

fn admit(stream: TcpStream, slot: &BridgeSlot<TcpStream>) {
    let peer = stream.peer();

    if slot.is_occupied() {
        info!("Refusing {:?}, a client is already connected", peer);
        stream.close();
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to disable Nagle for {:?}: {}", peer, e);
    }

    match slot.try_install(stream) {
        Ok(generation) => info!("Client {:?} connected (generation {})", peer, generation),
        Err(stream) => {
            info!("Refusing {:?}, a client is already connected", peer);
            stream.close();
        }
    }
}

#[cfg(target_os = "espidf")]
fn apply_backlog(listener: &TcpListener, backlog: i32) {
    use std::os::fd::AsRawFd;

    if unsafe { esp_idf_sys::lwip_listen(listener.as_raw_fd(), backlog) } != 0 {
        warn!("Failed to set listen backlog to {}", backlog);
    }
}

#[cfg(not(target_os = "espidf"))]
fn apply_backlog(_listener: &TcpListener, backlog: i32) {
    debug!("Listen backlog {} left to the host stack", backlog);
}
