//! Storage module
//!
//! This module provides the credential store: named binary blobs kept in
//! non-volatile storage (NVS) across reboots, and the loading of station
//! credentials with a fallback to the build-time defaults.

use heapless::String;
use log::{info, warn};

use crate::config::WiFiConfig;
use crate::error::Result;

/// Key of the stored station SSID
pub const SSID_KEY: &str = "ssid";
/// Key of the stored station passphrase
pub const PASSWORD_KEY: &str = "password";

/// Persistent named-blob storage
pub trait CredentialStore: Send + Sync {
    /// Read a value. Missing keys and read failures both yield `None`.
    fn read(&self, key: &str) -> Option<Vec<u8>>;

    /// Write a value, replacing any previous one.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).write(key, value)
    }
}

/// Station credentials handed to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String<32>,
    pub password: String<64>,
}

impl Credentials {
    /// Load credentials from the store, falling back to the configured
    /// defaults for every field that is absent or unusable.
    pub fn load(store: &dyn CredentialStore, defaults: &WiFiConfig) -> Self {
        let ssid = stored_string::<32>(store, SSID_KEY).unwrap_or_else(|| {
            info!("No stored SSID, using build-time default");
            defaults.station_ssid.clone()
        });
        let password = stored_string::<64>(store, PASSWORD_KEY).unwrap_or_else(|| {
            info!("No stored password, using build-time default");
            defaults.station_password.clone()
        });

        Self { ssid, password }
    }
}

fn stored_string<const N: usize>(store: &dyn CredentialStore, key: &str) -> Option<String<N>> {
    let raw = store.read(key)?;
    // Blobs written by older firmware may carry the C string terminator.
    let raw = match raw.iter().position(|&b| b == 0) {
        Some(end) => &raw[..end],
        None => &raw[..],
    };
    let text = match core::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => {
            warn!("Stored {} is not valid UTF-8, ignoring it", key);
            return None;
        }
    };
    match String::try_from(text) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Stored {} is longer than {} bytes, ignoring it", key, N);
            None
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::StorageManager;

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::Mutex;

    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
    use log::{debug, error, info, warn};

    use super::CredentialStore;
    use crate::error::{Error, Result};

    /// NVS namespace holding the credential blobs
    const NAMESPACE: &str = "wuapp";

    /// Largest blob we ever expect to read back
    const MAX_BLOB_LEN: usize = 128;

    /// Storage manager backed by the default NVS partition
    pub struct StorageManager {
        /// NVS handle
        nvs: Mutex<EspNvs<NvsDefault>>,
    }

    impl StorageManager {
        /// Open the credential namespace on the default partition
        pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
            let nvs = EspNvs::new(partition, NAMESPACE, true)
                .map_err(|e| Error::StorageError(format!("Failed to open NVS namespace: {}", e)))?;

            Ok(Self { nvs: Mutex::new(nvs) })
        }
    }

    impl CredentialStore for StorageManager {
        fn read(&self, key: &str) -> Option<Vec<u8>> {
            let nvs = match self.nvs.lock() {
                Ok(nvs) => nvs,
                Err(_) => {
                    warn!("NVS handle poisoned, treating {} as absent", key);
                    return None;
                }
            };

            let mut buf = [0u8; MAX_BLOB_LEN];
            match nvs.get_blob(key, &mut buf) {
                Ok(Some(value)) => {
                    debug!("Read {} bytes for {} from flash", value.len(), key);
                    Some(value.to_vec())
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("Error reading {} from NVS: {}", key, e);
                    None
                }
            }
        }

        fn write(&self, key: &str, value: &[u8]) -> Result<()> {
            let mut nvs = self
                .nvs
                .lock()
                .map_err(|_| Error::StorageError("Failed to lock NVS handle".to_string()))?;

            match nvs.set_blob(key, value) {
                Ok(()) => {
                    info!("{} saved to flash ({} bytes)", key, value.len());
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to save {} to NVS: {}", key, e);
                    Err(Error::StorageError(format!("Failed to save {} to NVS: {}", key, e)))
                }
            }
        }
    }
}

/// In-memory store used on host builds
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<std::collections::HashMap<std::string::String, Vec<u8>>>,
}

#[cfg(not(target_os = "espidf"))]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(not(target_os = "espidf"))]
impl CredentialStore for MemoryStore {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| crate::error::Error::StorageError("Failed to lock store".to_string()))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
