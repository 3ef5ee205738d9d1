#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // If using the `binstart` feature of `esp-idf-sys`, always keep this module imported

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{error, info};

    use espbridge::{
        bridge::BridgeEngine,
        config::create_config,
        http, ota,
        storage::{CredentialStore, StorageManager},
        uart::UartManager,
        wifi::{self, EspRadio, WiFiManager},
    };

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("{} {} starting up...", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = create_config();

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    ota::mark_running_slot_valid();

    let store: Arc<dyn CredentialStore> = Arc::new(StorageManager::new(nvs.clone())?);

    let (radio_tx, radio_rx) = wifi::radio_channel();
    let radio = EspRadio::new(peripherals.modem, sysloop, nvs, radio_tx)?;
    let mut wifi = WiFiManager::new(radio, radio_rx, Arc::clone(&store), config.wifi.clone());

    let serial = Arc::new(UartManager::new(
        peripherals.uart1,
        peripherals.pins.gpio21,
        peripherals.pins.gpio20,
        &config.uart,
    )?);
    let bridge = BridgeEngine::new(config.tcp_server.clone(), config.uart.clone(), serial);
    bridge.watch_network(wifi.subscribe())?;

    let http_config = config.http.clone();
    let http_store = Arc::clone(&store);
    http::spawn_lifecycle(
        move || http::start_endpoints(&http_config, Arc::clone(&http_store)),
        wifi.subscribe(),
    )?;

    if !wifi.connect_station() {
        if let Err(e) = wifi.start_access_point() {
            error!("Failed to start provisioning access point: {}", e);
        }
    }

    // A dead bridge leaves the HTTP endpoints usable for recovery.
    match bridge.start() {
        Ok(addr) => info!("Bridge ready on {}, UART at {} baud", addr, config.uart.baudrate),
        Err(e) => error!("Bridge failed to start: {}", e),
    }

    wifi.supervise();
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("espbridge only runs on the ESP-IDF target; use `cargo test` on the host");
    std::process::exit(1);
}
