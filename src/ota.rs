//! OTA module
//!
//! Streams a firmware image into the inactive slot and schedules the restart
//! that boots it. An image is only committed when every byte was received and
//! written; any failure aborts the update and leaves the running slot in charge.

use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{Error, Result};

/// A firmware update in progress
pub trait FirmwareUpdate {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Validate the written image and select it for the next boot
    fn complete(self) -> Result<()>;

    /// Discard everything written so far
    fn abort(self) -> Result<()>;
}

/// Copy `total_len` bytes produced by `read` into `update`, then commit it.
///
/// `read` fills the given buffer and returns how many bytes it produced; zero
/// before `total_len` is reached means the sender gave up. Returns the number
/// of bytes written.
pub fn stream_image<U, F>(mut update: U, total_len: usize, mut read: F, chunk: &mut [u8]) -> Result<usize>
where
    U: FirmwareUpdate,
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    if total_len == 0 {
        abort_quietly(update);
        return Err(Error::OtaError("Firmware image is empty".to_string()));
    }
    if chunk.is_empty() {
        abort_quietly(update);
        return Err(Error::OtaError("OTA chunk buffer is empty".to_string()));
    }

    let mut written = 0;
    while written < total_len {
        let want = (total_len - written).min(chunk.len());
        let len = match read(&mut chunk[..want]) {
            Ok(0) => {
                abort_quietly(update);
                return Err(Error::OtaError(format!(
                    "Image truncated after {} of {} bytes",
                    written, total_len
                )));
            }
            Ok(len) => len.min(want),
            Err(e) => {
                abort_quietly(update);
                return Err(e);
            }
        };

        if let Err(e) = update.write(&chunk[..len]) {
            abort_quietly(update);
            return Err(e);
        }
        written += len;
    }

    update.complete()?;
    info!("Firmware image of {} bytes written", written);
    Ok(written)
}

fn abort_quietly<U: FirmwareUpdate>(update: U) {
    if let Err(e) = update.abort() {
        warn!("Failed to abort OTA update: {}", e);
    }
}

/// Run `action` after `delay` on its own thread, so the caller can finish
/// answering the request that asked for the restart.
pub fn schedule_restart<F>(delay: Duration, action: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    info!("Restart scheduled in {:?}", delay);
    thread::Builder::new()
        .name("restart".to_string())
        .spawn(move || {
            thread::sleep(delay);
            action();
        })
        .map(|_| ())
        .map_err(|e| {
            error!("Failed to schedule restart: {}", e);
            Error::General(format!("Failed to spawn restart thread: {}", e))
        })
}

#[cfg(target_os = "espidf")]
pub use esp::{mark_running_slot_valid, restart, running_slot_label, EspImage};

#[cfg(target_os = "espidf")]
mod esp {
    use embedded_svc::io::Write;
    use esp_idf_svc::ota::{EspOta, EspOtaUpdate};
    use log::{info, warn};

    use super::FirmwareUpdate;
    use crate::error::{Error, Result};

    /// Update of the inactive OTA slot
    pub struct EspImage<'a>(pub EspOtaUpdate<'a>);

    impl FirmwareUpdate for EspImage<'_> {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.0
                .write_all(data)
                .map_err(|e| Error::OtaError(format!("Failed to write OTA data: {:?}", e)))
        }

        fn complete(self) -> Result<()> {
            self.0
                .complete()
                .map_err(|e| Error::OtaError(format!("Failed to finalize OTA image: {:?}", e)))
        }

        fn abort(self) -> Result<()> {
            self.0
                .abort()
                .map_err(|e| Error::OtaError(format!("Failed to abort OTA update: {:?}", e)))
        }
    }

    /// Confirm the running image so the bootloader keeps it
    pub fn mark_running_slot_valid() {
        match EspOta::new() {
            Ok(mut ota) => {
                if let Err(e) = ota.mark_running_slot_valid() {
                    warn!("Failed to mark running OTA slot valid: {:?}", e);
                }
            }
            Err(e) => warn!("OTA unavailable: {:?}", e),
        }
    }

    /// Partition label of the running image
    pub fn running_slot_label() -> String {
        EspOta::new()
            .and_then(|ota| ota.get_running_slot())
            .map(|slot| slot.label.as_str().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn restart() {
        info!("Restarting");
        esp_idf_hal::reset::restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Completed,
        Aborted,
    }

    #[derive(Default)]
    struct Recorder {
        data: Vec<u8>,
        fail_write: bool,
        outcome: Option<mpsc::Sender<(Outcome, Vec<u8>)>>,
    }

    impl Recorder {
        fn new(tx: mpsc::Sender<(Outcome, Vec<u8>)>) -> Self {
            Self {
                outcome: Some(tx),
                ..Self::default()
            }
        }

        fn finish(self, outcome: Outcome) {
            if let Some(tx) = self.outcome {
                tx.send((outcome, self.data)).unwrap();
            }
        }
    }

    impl FirmwareUpdate for Recorder {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            if self.fail_write {
                return Err(Error::OtaError("flash write failed".to_string()));
            }
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn complete(self) -> Result<()> {
            self.finish(Outcome::Completed);
            Ok(())
        }

        fn abort(self) -> Result<()> {
            self.finish(Outcome::Aborted);
            Ok(())
        }
    }

    fn source(image: &[u8]) -> impl FnMut(&mut [u8]) -> Result<usize> + '_ {
        let mut offset = 0;
        move |buf| {
            let n = buf.len().min(image.len() - offset);
            buf[..n].copy_from_slice(&image[offset..offset + n]);
            offset += n;
            Ok(n)
        }
    }

    #[test]
    fn full_image_is_committed() {
        let (tx, rx) = mpsc::channel();
        let image: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let mut chunk = [0u8; 1024];

        let written = stream_image(Recorder::new(tx), image.len(), source(&image), &mut chunk).unwrap();

        assert_eq!(written, 3000);
        let (outcome, data) = rx.recv().unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(data, image);
    }

    #[test]
    fn truncated_image_is_aborted() {
        let (tx, rx) = mpsc::channel();
        let image = [7u8; 100];
        let mut chunk = [0u8; 32];

        let result = stream_image(Recorder::new(tx), 200, source(&image), &mut chunk);

        assert!(matches!(result, Err(Error::OtaError(_))));
        assert_eq!(rx.recv().unwrap().0, Outcome::Aborted);
    }

    #[test]
    fn read_error_aborts() {
        let (tx, rx) = mpsc::channel();
        let mut chunk = [0u8; 32];

        let result = stream_image(Recorder::new(tx), 10, |_| Err(Error::General("socket".to_string())), &mut chunk);

        assert!(result.is_err());
        assert_eq!(rx.recv().unwrap().0, Outcome::Aborted);
    }

    #[test]
    fn write_error_aborts() {
        let (tx, rx) = mpsc::channel();
        let mut update = Recorder::new(tx);
        update.fail_write = true;
        let image = [1u8; 10];
        let mut chunk = [0u8; 32];

        assert!(stream_image(update, image.len(), source(&image), &mut chunk).is_err());
        assert_eq!(rx.recv().unwrap().0, Outcome::Aborted);
    }

    #[test]
    fn empty_image_is_rejected() {
        let (tx, rx) = mpsc::channel();
        let mut chunk = [0u8; 32];

        assert!(stream_image(Recorder::new(tx), 0, source(&[]), &mut chunk).is_err());
        assert_eq!(rx.recv().unwrap().0, Outcome::Aborted);
    }

    #[test]
    fn restart_runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let flag = Arc::clone(&fired);

        schedule_restart(Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
