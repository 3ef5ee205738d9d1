//! Bridge engine driven through real loopback sockets and an in-memory serial port.

#![cfg(not(target_os = "espidf"))]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use espbridge::bridge::BridgeEngine;
use espbridge::config::{TcpServerConfig, UartConfig};
use espbridge::uart::MemorySerial;
use espbridge::wifi::{LinkMode, NetworkEvent, NetworkNotifier};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_bridge() -> (BridgeEngine<MemorySerial>, Arc<MemorySerial>, SocketAddr) {
    let tcp = TcpServerConfig {
        bind_address: "127.0.0.1",
        port: 0,
        idle_poll_ms: 5,
        ..TcpServerConfig::default()
    };
    let uart = UartConfig {
        event_poll_ms: 5,
        ..UartConfig::default()
    };
    let serial = Arc::new(MemorySerial::new());
    let engine = BridgeEngine::new(tcp, uart, Arc::clone(&serial));
    let addr = engine.start().unwrap();
    (engine, serial, addr)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn connect(engine: &BridgeEngine<MemorySerial>, addr: SocketAddr) -> TcpStream {
    let generation = engine.slot().generation();
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    wait_until(|| engine.slot().generation() > generation);
    stream
}

fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).unwrap();
    data
}

fn assert_closed(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected a closed connection, got {} bytes", n),
        Err(e) => assert!(
            !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "connection still open"
        ),
    }
}

#[test]
fn start_configures_the_serial_port() {
    let (engine, serial, _addr) = start_bridge();
    assert_eq!(serial.baudrate(), Some(115_200));
    assert!(engine.is_running());
    assert!(engine.start().is_err());
    engine.stop();
}

#[test]
fn second_client_is_refused_while_first_stays() {
    let (engine, serial, addr) = start_bridge();
    let _first = connect(&engine, addr);
    assert!(engine.slot().current().unwrap().conn.nodelay().unwrap());

    // Serial traffic must not leak to the refused client.
    serial.receive(b"for the first client only");
    let mut second = TcpStream::connect(addr).unwrap();
    second.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut received = Vec::new();
    match second.read_to_end(&mut received) {
        Ok(_) => {}
        Err(e) => assert!(
            !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "refused client still open"
        ),
    }
    assert!(received.is_empty());

    assert!(engine.slot().is_occupied());
    assert_eq!(engine.slot().generation(), 1);
    engine.stop();
}

#[test]
fn bytes_flow_both_ways_in_order() {
    let (engine, serial, addr) = start_bridge();
    let mut client = connect(&engine, addr);

    let upstream: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&upstream).unwrap();
    wait_until(|| serial.written().len() == upstream.len());
    assert_eq!(serial.written(), upstream);
    assert!(serial.writes().iter().all(|w| w.len() <= 1024));

    let downstream: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
    for part in downstream.chunks(700) {
        serial.receive(part);
    }
    assert_eq!(read_exactly(&mut client, downstream.len()), downstream);

    engine.stop();
}

#[test]
fn serial_data_without_client_is_dropped() {
    let (engine, serial, addr) = start_bridge();

    serial.receive(b"nobody is listening");
    wait_until(|| serial.pending_input() == 0);

    let mut client = connect(&engine, addr);
    serial.receive(b"late");
    assert_eq!(read_exactly(&mut client, 4), b"late");

    engine.stop();
}

#[test]
fn disconnect_frees_the_slot_for_the_next_client() {
    let (engine, serial, addr) = start_bridge();

    let first = connect(&engine, addr);
    drop(first);
    wait_until(|| !engine.slot().is_occupied());

    let mut second = connect(&engine, addr);
    assert_eq!(engine.slot().generation(), 2);
    serial.receive(b"hi");
    assert_eq!(read_exactly(&mut second, 2), b"hi");

    engine.stop();
}

#[test]
fn network_down_evicts_the_client() {
    let (engine, _serial, addr) = start_bridge();
    let notifier = NetworkNotifier::new();
    engine.watch_network(notifier.subscribe()).unwrap();

    let mut client = connect(&engine, addr);
    notifier.notify(NetworkEvent::Up(LinkMode::Station));
    assert!(engine.slot().is_occupied());

    notifier.notify(NetworkEvent::Down);
    wait_until(|| !engine.slot().is_occupied());
    assert_closed(&mut client);

    let _next = connect(&engine, addr);
    assert_eq!(engine.slot().generation(), 2);
    engine.stop();
}

#[test]
fn stop_evicts_and_halts_relaying() {
    let (engine, serial, addr) = start_bridge();
    let mut client = connect(&engine, addr);

    engine.stop();
    assert!(!engine.is_running());
    assert!(!engine.slot().is_occupied());
    assert_closed(&mut client);

    // Give the flows time to observe the flag before feeding more data.
    thread::sleep(Duration::from_millis(50));
    serial.receive(b"after stop");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(serial.pending_input(), b"after stop".len());
}

#[test]
fn stop_releases_the_port() {
    let (engine, _serial, addr) = start_bridge();
    let _client = connect(&engine, addr);

    engine.stop();

    let tcp = TcpServerConfig {
        bind_address: "127.0.0.1",
        port: addr.port(),
        ..TcpServerConfig::default()
    };
    let restarted = BridgeEngine::new(tcp, UartConfig::default(), Arc::new(MemorySerial::new()));
    assert_eq!(restarted.start().unwrap(), addr);
    restarted.stop();
}
