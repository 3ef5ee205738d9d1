//! UART module
//!
//! This module provides the serial side of the bridge: the driver event model
//! consumed by the serial -> socket flow and the byte interface used by both
//! relay flows.

use std::time::Duration;

use crate::error::Result;

/// Event reported by the serial driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEvent {
    /// This many bytes are waiting in the receive buffer
    DataAvailable(usize),
    /// The hardware FIFO overflowed, bytes were lost
    HardwareOverflow,
    /// The driver ring buffer is full, bytes were lost
    SoftwareBufferFull,
    ParityError,
    FramingError,
}

/// Byte-oriented serial port with an event channel
pub trait SerialPort: Send + Sync {
    /// Apply the line settings: given baud rate, 8 data bits, no parity, 1 stop bit, no flow control
    fn configure(&self, baudrate: u32) -> Result<()>;

    /// Wait up to `timeout` for the next driver event
    fn next_event(&self, timeout: Duration) -> Option<SerialEvent>;

    /// Read up to `buf.len()` received bytes, waiting at most `timeout`
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Queue bytes for transmission
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Discard everything in the receive buffer
    fn flush_input(&self);

    /// Discard every queued driver event
    fn reset_events(&self);
}

impl<T: SerialPort + ?Sized> SerialPort for std::sync::Arc<T> {
    fn configure(&self, baudrate: u32) -> Result<()> {
        (**self).configure(baudrate)
    }

    fn next_event(&self, timeout: Duration) -> Option<SerialEvent> {
        (**self).next_event(timeout)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn flush_input(&self) {
        (**self).flush_input()
    }

    fn reset_events(&self) {
        (**self).reset_events()
    }
}

#[cfg(target_os = "espidf")]
pub use esp::UartManager;

#[cfg(target_os = "espidf")]
mod esp {
    use std::time::Duration;

    use esp_idf_hal::delay::TickType;
    use esp_idf_hal::gpio;
    use esp_idf_hal::peripheral::Peripheral;
    use esp_idf_hal::prelude::*;
    use esp_idf_hal::uart::{config, Uart, UartDriver, UartEventPayload};
    use log::{info, trace, warn};

    use super::{SerialEvent, SerialPort};
    use crate::config::UartConfig;
    use crate::error::{Error, Result};

    /// UART Manager
    ///
    /// Owns one UART controller with the driver's event queue enabled.
    pub struct UartManager {
        uart: UartDriver<'static>,
    }

    impl UartManager {
        /// Install the driver on `uart` and route it to the given pins
        pub fn new<U: Uart>(
            uart: impl Peripheral<P = U> + 'static,
            tx_pin: impl Peripheral<P = impl gpio::OutputPin> + 'static,
            rx_pin: impl Peripheral<P = impl gpio::InputPin> + 'static,
            config: &UartConfig,
        ) -> Result<Self> {
            let uart_config = config::Config::new()
                .baudrate(Hertz(config.baudrate))
                .rx_fifo_size(config.rx_buffer_size)
                .queue_size(config.event_queue_len);

            let uart = UartDriver::new(
                uart,
                tx_pin,
                rx_pin,
                Option::<gpio::Gpio0>::None, // RTS pin (not used)
                Option::<gpio::Gpio1>::None, // CTS pin (not used)
                &uart_config,
            )
            .map_err(|e| Error::UartError(format!("Failed to create UART driver: {}", e)))?;

            info!("UART{} driver installed", U::port());
            Ok(Self { uart })
        }
    }

    impl SerialPort for UartManager {
        fn configure(&self, baudrate: u32) -> Result<()> {
            self.uart
                .change_baudrate(Hertz(baudrate))
                .map_err(|e| Error::UartError(format!("Failed to set baudrate: {}", e)))?;

            info!("UART configured at {} 8N1", baudrate);
            Ok(())
        }

        fn next_event(&self, timeout: Duration) -> Option<SerialEvent> {
            let (event, _) = self.uart.event_queue()?.recv_front(TickType::from(timeout).ticks())?;

            match event.payload() {
                UartEventPayload::Data { size, .. } => Some(SerialEvent::DataAvailable(size)),
                UartEventPayload::RxFifoOverflow => Some(SerialEvent::HardwareOverflow),
                UartEventPayload::RxBufferFull => Some(SerialEvent::SoftwareBufferFull),
                UartEventPayload::ParityError => Some(SerialEvent::ParityError),
                UartEventPayload::FrameError => Some(SerialEvent::FramingError),
                _ => {
                    trace!("Ignoring UART event");
                    None
                }
            }
        }

        fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.uart
                .read(buf, TickType::from(timeout).ticks())
                .map_err(|e| Error::UartError(format!("Failed to read from UART: {}", e)))
        }

        fn write(&self, data: &[u8]) -> Result<usize> {
            self.uart
                .write(data)
                .map_err(|e| Error::UartError(format!("Failed to write to UART: {}", e)))
        }

        fn flush_input(&self) {
            if let Err(e) = self.uart.clear_rx() {
                warn!("Failed to flush UART input: {}", e);
            }
        }

        fn reset_events(&self) {
            if let Some(queue) = self.uart.event_queue() {
                while queue.recv_front(0).is_some() {}
            }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use sim::MemorySerial;

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::collections::VecDeque;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{SerialEvent, SerialPort};
    use crate::error::{Error, Result};

    /// Host-side serial port: the remote device is played by the test
    pub struct MemorySerial {
        rx: Mutex<VecDeque<u8>>,
        events_tx: Sender<SerialEvent>,
        events_rx: Mutex<Receiver<SerialEvent>>,
        written: Mutex<Vec<Vec<u8>>>,
        baudrate: Mutex<Option<u32>>,
    }

    impl Default for MemorySerial {
        fn default() -> Self {
            let (events_tx, events_rx) = mpsc::channel();
            Self {
                rx: Mutex::new(VecDeque::new()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                written: Mutex::new(Vec::new()),
                baudrate: Mutex::new(None),
            }
        }
    }

    impl MemorySerial {
        pub fn new() -> Self {
            Self::default()
        }

        /// Bytes arriving from the device, announced with a data event
        pub fn receive(&self, data: &[u8]) {
            self.buffer(data);
            self.raise(SerialEvent::DataAvailable(data.len()));
        }

        /// Bytes landing in the receive buffer without an event
        pub fn buffer(&self, data: &[u8]) {
            if let Ok(mut rx) = self.rx.lock() {
                rx.extend(data.iter().copied());
            }
        }

        pub fn raise(&self, event: SerialEvent) {
            let _ = self.events_tx.send(event);
        }

        /// Every write issued to the device, in order
        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.written.lock().map(|w| w.clone()).unwrap_or_default()
        }

        /// Concatenation of [`MemorySerial::writes`]
        pub fn written(&self) -> Vec<u8> {
            self.writes().concat()
        }

        pub fn pending_input(&self) -> usize {
            self.rx.lock().map(|rx| rx.len()).unwrap_or(0)
        }

        pub fn baudrate(&self) -> Option<u32> {
            self.baudrate.lock().ok().and_then(|b| *b)
        }
    }

    impl SerialPort for MemorySerial {
        fn configure(&self, baudrate: u32) -> Result<()> {
            let mut current = self
                .baudrate
                .lock()
                .map_err(|_| Error::UartError("Failed to lock UART".to_string()))?;
            *current = Some(baudrate);
            Ok(())
        }

        fn next_event(&self, timeout: Duration) -> Option<SerialEvent> {
            self.events_rx.lock().ok()?.recv_timeout(timeout).ok()
        }

        fn read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut rx = self
                .rx
                .lock()
                .map_err(|_| Error::UartError("Failed to lock UART".to_string()))?;
            let n = buf.len().min(rx.len());
            for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write(&self, data: &[u8]) -> Result<usize> {
            let mut written = self
                .written
                .lock()
                .map_err(|_| Error::UartError("Failed to lock UART".to_string()))?;
            written.push(data.to_vec());
            Ok(data.len())
        }

        fn flush_input(&self) {
            if let Ok(mut rx) = self.rx.lock() {
                rx.clear();
            }
        }

        fn reset_events(&self) {
            if let Ok(events) = self.events_rx.lock() {
                while events.try_recv().is_ok() {}
            }
        }
    }
}
