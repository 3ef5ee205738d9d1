//! Connectivity manager scenarios against the simulated radio.

#![cfg(not(target_os = "espidf"))]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use espbridge::config::WiFiConfig;
use espbridge::storage::{CredentialStore, MemoryStore, PASSWORD_KEY, SSID_KEY};
use espbridge::wifi::{self, ConnectionState, LinkMode, NetworkEvent, RadioEvent, SimRadio, WiFiManager};

const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03];

fn config(max_retries: u32) -> WiFiConfig {
    WiFiConfig {
        max_retries,
        ..WiFiConfig::default()
    }
}

#[test]
fn exhausted_retries_fall_back_to_provisioning() {
    let (tx, rx) = wifi::radio_channel();
    let radio = SimRadio::new(tx, MAC);
    let mut manager = WiFiManager::new(radio, rx, Arc::new(MemoryStore::new()), config(3));
    let events = manager.subscribe();

    assert!(!manager.connect_station());
    assert_eq!(manager.radio().log().connect_attempts, 4);
    assert_eq!(manager.state(), ConnectionState::Failed);

    manager.start_access_point().unwrap();
    assert_eq!(manager.state(), ConnectionState::ProvisioningAP);

    let ap = manager.radio().log().access_point.clone().unwrap();
    assert_eq!(ap.ssid.as_str(), "UART aabbcc");
    assert_eq!(ap.password.as_str(), "UART aabbcc");
    assert_eq!(ap.channel, 1);

    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen, vec![NetworkEvent::Up(LinkMode::AccessPoint)]);
}

#[test]
fn stored_credentials_are_preferred() {
    let store = Arc::new(MemoryStore::new());
    store.write(SSID_KEY, b"workshop\0").unwrap();
    store.write(PASSWORD_KEY, b"solder-fumes").unwrap();

    let (tx, rx) = wifi::radio_channel();
    let radio = SimRadio::new(tx, MAC).with_outcomes([true]);
    let mut manager = WiFiManager::new(radio, rx, store, config(5));

    assert!(manager.connect_station());
    let station = manager.radio().log().station.clone().unwrap();
    assert_eq!(station.ssid.as_str(), "workshop");
    assert_eq!(station.password.as_str(), "solder-fumes");
}

#[test]
fn supervision_falls_back_after_link_loss() {
    let (tx, rx) = wifi::radio_channel();
    let stack = tx.clone();
    let radio = SimRadio::new(tx, MAC).with_outcomes([true]);
    let mut manager = WiFiManager::new(radio, rx, Arc::new(MemoryStore::new()), config(2));
    let events = manager.subscribe();

    assert!(manager.connect_station());
    thread::spawn(move || manager.supervise());

    stack.send(RadioEvent::StaDisconnected).unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(events.recv_timeout(timeout), Ok(NetworkEvent::Up(LinkMode::Station)));
    assert_eq!(events.recv_timeout(timeout), Ok(NetworkEvent::Down));
    assert_eq!(events.recv_timeout(timeout), Ok(NetworkEvent::Up(LinkMode::AccessPoint)));
}
