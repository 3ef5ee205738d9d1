use std::fmt;
use std::io;
use std::error::Error as StdError;

/// Custom error type for the firmware
#[derive(Debug)]
pub enum Error {
    /// I/O errors
    Io(io::Error),
    /// ESP-IDF specific errors
    EspError(String),
    /// WiFi configuration errors
    WiFiError(String),
    /// TCP bridge errors
    TcpError(String),
    /// UART errors
    UartError(String),
    /// Credential store errors
    StorageError(String),
    /// Firmware upgrade errors
    OtaError(String),
    /// General errors
    General(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::EspError(msg) => write!(f, "ESP-IDF error: {}", msg),
            Error::WiFiError(msg) => write!(f, "WiFi error: {}", msg),
            Error::TcpError(msg) => write!(f, "TCP error: {}", msg),
            Error::UartError(msg) => write!(f, "UART error: {}", msg),
            Error::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Error::OtaError(msg) => write!(f, "OTA error: {}", msg),
            Error::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(target_os = "espidf")]
impl From<esp_idf_sys::EspError> for Error {
    fn from(err: esp_idf_sys::EspError) -> Self {
        Error::EspError(err.to_string())
    }
}

/// Result type for the firmware
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "I/O error: peer gone");
    }

    #[test]
    fn message_variants_are_prefixed() {
        assert_eq!(
            Error::OtaError("no partition".into()).to_string(),
            "OTA error: no partition"
        );
        assert!(Error::StorageError("x".into()).source().is_none());
    }
}
