use heapless::String;

/// WiFi configuration
#[derive(Debug, Clone)]
pub struct WiFiConfig {
    /// Build-time default SSID for station mode
    pub station_ssid: String<32>,
    /// Build-time default password for station mode
    pub station_password: String<64>,
    /// Reconnect attempts after the initial one before giving up on station mode
    pub max_retries: u32,
    /// Prefix of the access point SSID, followed by three MAC bytes in hex
    pub ap_ssid_prefix: &'static str,
    /// WiFi channel for access point mode
    pub ap_channel: u8,
    /// Maximum number of stations for access point mode
    pub ap_max_connections: u16,
}

impl Default for WiFiConfig {
    fn default() -> Self {
        Self {
            station_ssid: String::try_from(option_env!("WIFI_SSID").unwrap_or("")).unwrap_or_default(),
            station_password: String::try_from(option_env!("WIFI_PASS").unwrap_or("")).unwrap_or_default(),
            max_retries: 5,
            ap_ssid_prefix: "UART ",
            ap_channel: 1,
            ap_max_connections: 3,
        }
    }
}

/// TCP bridge configuration
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Bind address for the bridge listener
    pub bind_address: &'static str,
    /// Port for the bridge listener
    pub port: u16,
    /// Pending connections queued by the network stack
    pub backlog: i32,
    /// Relay buffer capacity, per direction
    pub buffer_size: usize,
    /// Zero-length socket writes tolerated before the client is declared dead
    pub max_zero_writes: u32,
    /// Sleep of the socket -> serial flow while no client is installed
    pub idle_poll_ms: u64,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0",
            port: 8888,
            backlog: 2,
            buffer_size: 1024,
            max_zero_writes: 5,
            idle_poll_ms: 100,
        }
    }
}

/// UART configuration
#[derive(Debug, Clone)]
pub struct UartConfig {
    /// Baud rate, frames are always 8N1 without flow control
    pub baudrate: u32,
    /// Driver receive ring buffer size
    pub rx_buffer_size: usize,
    /// Depth of the driver event queue
    pub event_queue_len: usize,
    /// How long the serial -> socket flow waits for an event before re-checking the slot
    pub event_poll_ms: u64,
    /// Timeout of a single serial read
    pub read_timeout_ms: u64,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            rx_buffer_size: 2048,
            event_queue_len: 16,
            event_poll_ms: 100,
            read_timeout_ms: 20,
        }
    }
}

/// HTTP endpoint configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Stack size of the HTTP server task
    pub stack_size: usize,
    /// Delay between answering a reset/upgrade request and restarting
    pub restart_delay_ms: u64,
    /// Longest SSID accepted by the provisioning endpoint
    pub max_ssid_len: usize,
    /// Longest passphrase accepted by the provisioning endpoint
    pub max_password_len: usize,
    /// Chunk size used when streaming a firmware image
    pub ota_chunk_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            stack_size: 10 * 1024,
            restart_delay_ms: 1000,
            max_ssid_len: 32,
            max_password_len: 64,
            ota_chunk_size: 1024,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// WiFi configuration
    pub wifi: WiFiConfig,
    /// TCP bridge configuration
    pub tcp_server: TcpServerConfig,
    /// UART configuration
    pub uart: UartConfig,
    /// HTTP endpoint configuration
    pub http: HttpConfig,
}

/// Create a new application configuration with default values
pub fn create_config() -> AppConfig {
    AppConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_bridge_wire_contract() {
        let config = create_config();
        assert_eq!(config.tcp_server.port, 8888);
        assert_eq!(config.tcp_server.backlog, 2);
        assert_eq!(config.tcp_server.max_zero_writes, 5);
        assert_eq!(config.uart.baudrate, 115_200);
        assert_eq!(config.wifi.ap_ssid_prefix, "UART ");
    }
}
