//! Bridge slot module
//!
//! This module provides the single admitted client connection shared by the
//! accept loop and both relay flows.
//!
//! Every install/clear happens under one mutex. Each installed connection gets
//! a new generation number; a flow that saw a failure clears the slot only if
//! it still holds the generation it leased, so a stale flow can never clear a
//! newer client.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

/// A client connection the bridge can relay through
pub trait Connection: Send + Sync + 'static {
    /// Send bytes, returning how many were accepted
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Receive bytes; `Ok(0)` means the peer closed
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Shut the connection down in both directions, waking any blocked I/O
    fn close(&self);

    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

impl Connection for TcpStream {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(data)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn close(&self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            debug!("Shutdown of client socket failed: {}", e);
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// A flow's view of the installed client
pub struct Lease<C> {
    pub conn: Arc<C>,
    pub generation: u64,
}

struct SlotState<C> {
    client: Option<Arc<C>>,
    generation: u64,
}

/// Bridge Slot
///
/// Holds at most one client connection.
pub struct BridgeSlot<C: Connection> {
    state: Mutex<SlotState<C>>,
}

impl<C: Connection> Default for BridgeSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> BridgeSlot<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                client: None,
                generation: 0,
            }),
        }
    }

    // A panicking flow must not take the slot down with it; the state is
    // always consistent between statements.
    fn lock(&self) -> MutexGuard<'_, SlotState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `conn` if the slot is empty and return its generation.
    /// An occupied slot hands the connection back for the caller to refuse.
    pub fn try_install(&self, conn: C) -> Result<u64, C> {
        let mut state = self.lock();
        if state.client.is_some() {
            return Err(conn);
        }

        state.generation += 1;
        state.client = Some(Arc::new(conn));
        debug!("Slot filled, generation {}", state.generation);
        Ok(state.generation)
    }

    /// The installed client, if any
    pub fn current(&self) -> Option<Lease<C>> {
        let state = self.lock();
        state.client.as_ref().map(|conn| Lease {
            conn: Arc::clone(conn),
            generation: state.generation,
        })
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().client.is_some()
    }

    /// Generation of the most recently installed client
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Clear the slot if it still holds `generation`, closing the connection.
    /// Returns whether this call did the clearing.
    pub fn release(&self, generation: u64) -> bool {
        let conn = {
            let mut state = self.lock();
            if state.generation != generation {
                return false;
            }
            match state.client.take() {
                Some(conn) => conn,
                None => return false,
            }
        };

        Self::disconnect(&conn, generation);
        true
    }

    /// Clear the slot whatever it holds
    pub fn evict(&self) -> bool {
        let (conn, generation) = {
            let mut state = self.lock();
            match state.client.take() {
                Some(conn) => (conn, state.generation),
                None => return false,
            }
        };

        Self::disconnect(&conn, generation);
        true
    }

    fn disconnect(conn: &C, generation: u64) {
        conn.close();
        match conn.peer() {
            Some(peer) => info!("Client {} released (generation {})", peer, generation),
            None => info!("Client released (generation {})", generation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Stub {
        closed: AtomicBool,
    }

    impl Connection for Stub {
        fn send(&self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }

        fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn second_install_is_handed_back() {
        let slot = BridgeSlot::new();
        assert_eq!(slot.try_install(Stub::default()).ok(), Some(1));

        let rejected = slot.try_install(Stub::default());
        assert!(rejected.is_err());
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn release_closes_the_connection_once() {
        let slot = BridgeSlot::new();
        let generation = slot.try_install(Stub::default()).ok().unwrap();
        let lease = slot.current().unwrap();

        assert!(slot.release(generation));
        assert!(lease.conn.closed.load(Ordering::SeqCst));
        assert!(!slot.release(generation));
        assert!(!slot.is_occupied());
    }

    #[test]
    fn stale_generation_leaves_new_client_alone() {
        let slot = BridgeSlot::new();
        let old = slot.try_install(Stub::default()).ok().unwrap();
        assert!(slot.evict());

        let new = slot.try_install(Stub::default()).ok().unwrap();
        assert_ne!(old, new);
        assert!(!slot.release(old));
        assert!(slot.is_occupied());
    }

    #[test]
    fn evict_on_empty_slot_is_a_no_op() {
        let slot: BridgeSlot<Stub> = BridgeSlot::new();
        assert!(!slot.evict());
        assert!(slot.current().is_none());
    }
}
