//! HTTP module
//!
//! Maintenance endpoints served next to the bridge: liveness, device info,
//! credential provisioning, firmware upgrade and reset. The server only runs
//! while some network is up; [`EndpointLifecycle`] follows the
//! [`NetworkEvent`]s and creates or drops it accordingly.

use core::fmt::Write as _;
use std::sync::mpsc::Receiver;
use std::thread;

use log::{error, info};

use crate::error::{Error, Result};
use crate::wifi::NetworkEvent;

/// Body of `GET /ping`
pub const PING_REPLY: &str = "pong!\n";

const RESET_REASONS: [&str; 12] = [
    "unknown",
    "power-on",
    "external pin",
    "esp_restart",
    "exception/panic",
    "interrupt watchdog",
    "task watchdog",
    "other watchdogs",
    "exiting deep sleep mode",
    "brownout reset",
    "reset over SDIO",
    "fast reboot",
];

/// Human readable label for an ESP-IDF reset reason code
pub fn reset_reason_label(code: u32) -> &'static str {
    RESET_REASONS.get(code as usize).copied().unwrap_or("unknown")
}

/// Body of `GET /info`
pub fn device_info(reset_reason: &str, slot: &str, name: &str, version: &str) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Reset: {}", reset_reason);
    let _ = writeln!(body, "Slot: {}", slot);
    let _ = writeln!(body, "Firmware: {} {}", name, version);
    body
}

/// Check a provisioning request body: non-empty UTF-8 of at most `max_len` bytes
pub fn validate_credential(body: &[u8], max_len: usize) -> Result<&str> {
    if body.is_empty() {
        return Err(Error::General("Value is empty".to_string()));
    }
    if body.len() > max_len {
        return Err(Error::General(format!(
            "Value is {} bytes, at most {} allowed",
            body.len(),
            max_len
        )));
    }
    core::str::from_utf8(body).map_err(|_| Error::General("Value is not valid UTF-8".to_string()))
}

/// Runs an endpoint server while the network is up
pub struct EndpointLifecycle<S, F>
where
    F: FnMut() -> Result<S>,
{
    factory: F,
    server: Option<S>,
}

impl<S, F> EndpointLifecycle<S, F>
where
    F: FnMut() -> Result<S>,
{
    pub fn new(factory: F) -> Self {
        Self { factory, server: None }
    }

    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    /// Start the server on `Up`, drop it on `Down`. Repeated events are no-ops.
    pub fn handle(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Up(mode) => {
                if self.server.is_some() {
                    return;
                }
                match (self.factory)() {
                    Ok(server) => {
                        info!("HTTP endpoints started ({:?})", mode);
                        self.server = Some(server);
                    }
                    Err(e) => error!("Failed to start HTTP endpoints: {}", e),
                }
            }
            NetworkEvent::Down => {
                if self.server.take().is_some() {
                    info!("HTTP endpoints stopped");
                }
            }
        }
    }
}

/// Follow `events` on a dedicated thread. The server is created on that
/// thread, so only the factory has to be `Send`.
pub fn spawn_lifecycle<S, F>(factory: F, events: Receiver<NetworkEvent>) -> Result<()>
where
    S: 'static,
    F: FnMut() -> Result<S> + Send + 'static,
{
    thread::Builder::new()
        .name("http_lifecycle".to_string())
        .spawn(move || {
            let mut lifecycle = EndpointLifecycle::new(factory);
            for event in events {
                lifecycle.handle(event);
            }
        })
        .map(|_| ())
        .map_err(|e| Error::General(format!("Failed to spawn HTTP lifecycle: {}", e)))
}

#[cfg(target_os = "espidf")]
pub use esp::start_endpoints;

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::Arc;
    use std::time::Duration;

    use embedded_svc::http::{Headers, Method};
    use embedded_svc::io::{Read, Write};
    use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
    use esp_idf_svc::ota::EspOta;
    use log::{error, info, warn};

    use super::{device_info, reset_reason_label, validate_credential, PING_REPLY};
    use crate::config::HttpConfig;
    use crate::error::{Error, Result};
    use crate::ota::{self, EspImage};
    use crate::storage::{CredentialStore, PASSWORD_KEY, SSID_KEY};

    type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

    /// Create the server with every maintenance endpoint registered
    pub fn start_endpoints(
        config: &HttpConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<EspHttpServer<'static>> {
        let server_config = Configuration {
            stack_size: config.stack_size,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&server_config)?;
        let restart_delay = Duration::from_millis(config.restart_delay_ms);

        server.fn_handler::<anyhow::Error, _>("/ping", Method::Get, |req| {
            req.into_ok_response()?.write_all(PING_REPLY.as_bytes())?;
            Ok(())
        })?;

        server.fn_handler::<anyhow::Error, _>("/info", Method::Get, |req| {
            let reason = unsafe { esp_idf_sys::esp_reset_reason() } as u32;
            let body = device_info(
                reset_reason_label(reason),
                &ota::running_slot_label(),
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            );
            req.into_ok_response()?.write_all(body.as_bytes())?;
            Ok(())
        })?;

        for (path, key, max_len) in [
            ("/ssid", SSID_KEY, config.max_ssid_len),
            ("/password", PASSWORD_KEY, config.max_password_len),
        ] {
            let store = Arc::clone(&store);
            server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |mut req| {
                let len = req.content_len().unwrap_or(0) as usize;
                if len == 0 || len > max_len {
                    return reply(req, 400, "Invalid length\n");
                }

                let mut body = vec![0u8; len];
                req.read_exact(&mut body)
                    .map_err(|e| Error::General(format!("Failed to read body: {:?}", e)))?;

                if let Err(e) = validate_credential(&body, max_len) {
                    warn!("Rejected {} update: {}", key, e);
                    return reply(req, 400, "Invalid value\n");
                }

                match store.write(key, &body) {
                    Ok(()) => {
                        info!("Stored new {}", key);
                        reply(req, 200, "")
                    }
                    Err(e) => {
                        error!("Failed to store {}: {}", key, e);
                        reply(req, 500, "Store failed\n")
                    }
                }
            })?;
        }

        let chunk_size = config.ota_chunk_size;
        server.fn_handler::<anyhow::Error, _>("/upgrade", Method::Post, move |mut req| {
            let total = req.content_len().unwrap_or(0) as usize;
            info!("Firmware upgrade of {} bytes requested", total);

            let result = upgrade(&mut req, total, chunk_size);
            match result {
                Ok(_) => {
                    reply(req, 200, "")?;
                    ota::schedule_restart(restart_delay, ota::restart)?;
                    Ok(())
                }
                Err(e) => {
                    error!("Firmware upgrade failed: {}", e);
                    reply(req, 500, "Upgrade failed\n")
                }
            }
        })?;

        server.fn_handler::<anyhow::Error, _>("/reset", Method::Post, move |req| {
            reply(req, 200, "")?;
            ota::schedule_restart(restart_delay, ota::restart)?;
            Ok(())
        })?;

        Ok(server)
    }

    fn upgrade(req: &mut HttpRequest<'_, '_>, total: usize, chunk_size: usize) -> Result<usize> {
        let mut esp_ota = EspOta::new()?;
        let update = esp_ota.initiate_update()?;
        let mut chunk = vec![0u8; chunk_size];

        ota::stream_image(
            EspImage(update),
            total,
            |buf| {
                req.read(buf)
                    .map_err(|e| Error::OtaError(format!("Failed to receive image: {:?}", e)))
            },
            &mut chunk,
        )
    }

    fn reply(req: HttpRequest<'_, '_>, status: u16, body: &str) -> anyhow::Result<()> {
        req.into_status_response(status)?.write_all(body.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::LinkMode;
    use std::rc::Rc;
    use std::cell::Cell;

    struct Server {
        live: Rc<Cell<u32>>,
    }

    impl Drop for Server {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    #[test]
    fn reset_reasons_follow_the_esp_idf_table() {
        assert_eq!(reset_reason_label(1), "power-on");
        assert_eq!(reset_reason_label(3), "esp_restart");
        assert_eq!(reset_reason_label(11), "fast reboot");
        assert_eq!(reset_reason_label(12), "unknown");
        assert_eq!(reset_reason_label(u32::MAX), "unknown");
    }

    #[test]
    fn info_lists_reason_slot_and_firmware() {
        let body = device_info("power-on", "ota_0", "espbridge", "0.1.0");
        assert_eq!(body, "Reset: power-on\nSlot: ota_0\nFirmware: espbridge 0.1.0\n");
    }

    #[test]
    fn credentials_are_bounded() {
        assert_eq!(validate_credential(b"home", 32).unwrap(), "home");
        assert!(validate_credential(b"", 32).is_err());
        assert!(validate_credential(&[b'a'; 33], 32).is_err());
        assert!(validate_credential(&[b'a'; 32], 32).is_ok());
        assert!(validate_credential(&[0xff, 0xfe], 32).is_err());
    }

    #[test]
    fn lifecycle_follows_network_events() {
        let live = Rc::new(Cell::new(0));
        let starts = Rc::new(Cell::new(0));
        let mut lifecycle = EndpointLifecycle::new(|| {
            live.set(live.get() + 1);
            starts.set(starts.get() + 1);
            Ok(Server { live: Rc::clone(&live) })
        });

        lifecycle.handle(NetworkEvent::Up(LinkMode::Station));
        lifecycle.handle(NetworkEvent::Up(LinkMode::Station));
        assert!(lifecycle.is_serving());
        assert_eq!(starts.get(), 1);
        assert_eq!(live.get(), 1);

        lifecycle.handle(NetworkEvent::Down);
        lifecycle.handle(NetworkEvent::Down);
        assert!(!lifecycle.is_serving());
        assert_eq!(live.get(), 0);

        lifecycle.handle(NetworkEvent::Up(LinkMode::AccessPoint));
        assert_eq!(starts.get(), 2);
        assert_eq!(live.get(), 1);
    }

    #[test]
    fn failed_start_is_retried_on_next_up() {
        let mut attempts = 0;
        let mut lifecycle = EndpointLifecycle::new(|| {
            attempts += 1;
            if attempts == 1 {
                Err(Error::General("no sockets".to_string()))
            } else {
                Ok(())
            }
        });

        lifecycle.handle(NetworkEvent::Up(LinkMode::Station));
        assert!(!lifecycle.is_serving());
        lifecycle.handle(NetworkEvent::Up(LinkMode::Station));
        assert!(lifecycle.is_serving());
    }
}
