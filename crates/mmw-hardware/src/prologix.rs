//! Prologix GPIB-USB controller.
//!
//! One [`Prologix`] owns the serial line to the adapter. Every instrument on the
//! GPIB bus talks through a [`GpibDevice`] handle that shares the controller by
//! `Arc`. There must be exactly one `Prologix` per physical serial port.
//!
//! Two locks live on the controller:
//!
//! - the **hardware lock** wraps the transport itself. [`Prologix::lock`] hands
//!   out a [`BusExchange`] guard and nothing else can touch the wire until it is
//!   dropped, so a device handle holds it from address selection through the
//!   end of its read.
//! - the **address lock** guards the cached `current_address`. The `++addr`
//!   command is only sent when the target differs from the cache.
//!
//! The cache assumes this process is the only one switching addresses on the
//! adapter. Call [`Prologix::invalidate_address`] if that stops being true.
//!
//! # Protocol
//!
//! - `++mode 1` controller mode, `++auto 0` no read-after-write
//! - `++addr <n>` select the listener/talker
//! - `++read eoi` read from the addressed device until EOI
//! - `++clr` selected device clear
//! - all other lines are passed to the addressed device unchanged

use mmw_core::serial::{drain_serial_buffer, open_serial_async, DynSerial};
use mmw_core::AppResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

// =============================================================================
// Settings
// =============================================================================

/// Serial settings for the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Serial device path.
    #[serde(default = "default_port")]
    pub port: String,
    /// Line rate; the adapter ignores it on USB but the OS still wants one.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Upper bound on a single read.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Quiet window that ends a flush of stale input.
    #[serde(default = "default_flush_timeout", with = "humantime_serde")]
    pub flush_timeout: Duration,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    19_200
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_flush_timeout() -> Duration {
    Duration::from_millis(20)
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

impl BusSettings {
    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("bus.port must not be empty".to_string());
        }
        if self.baud_rate == 0 {
            return Err("bus.baud_rate must be positive".to_string());
        }
        if self.read_timeout.is_zero() {
            return Err("bus.read_timeout must be positive".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Read outcome
// =============================================================================

/// Why a buffered read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The end-of-line byte arrived (and is included in the bytes).
    Eol,
    /// `max_size` bytes were collected.
    MaxSize,
    /// Time ran out; the bytes are whatever arrived before that.
    Timeout,
}

/// Bytes collected by a bus read and how the read ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRead {
    /// Received bytes, terminator included.
    pub bytes: Vec<u8>,
    /// Termination reason.
    pub end: ReadEnd,
}

impl BusRead {
    /// `true` when the read gave up on time.
    pub fn timed_out(&self) -> bool {
        self.end == ReadEnd::Timeout
    }

    /// Lossy UTF-8 view of the bytes.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

// =============================================================================
// Prologix
// =============================================================================

/// The bus controller.
pub struct Prologix {
    port_name: String,
    hardware: Mutex<DynSerial>,
    current_address: Mutex<Option<u8>>,
    read_timeout: Duration,
    flush_window: Duration,
}

impl std::fmt::Debug for Prologix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prologix")
            .field("port_name", &self.port_name)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl Prologix {
    /// Open the serial port and put the adapter into controller mode.
    ///
    /// # Errors
    ///
    /// `DaqError::TransportOpen` if the port cannot be opened. There is no
    /// retry; callers are expected to stop.
    pub async fn open(settings: &BusSettings) -> AppResult<Arc<Self>> {
        let port = open_serial_async(&settings.port, settings.baud_rate).await?;
        info!("Prologix serial port {} opened", settings.port);
        Self::with_port(settings.port.clone(), Box::new(port), settings).await
    }

    /// Run the adapter start-up sequence over an already-open transport.
    pub async fn with_port(
        port_name: impl Into<String>,
        port: DynSerial,
        settings: &BusSettings,
    ) -> AppResult<Arc<Self>> {
        let bus = Self {
            port_name: port_name.into(),
            hardware: Mutex::new(port),
            current_address: Mutex::new(None),
            read_timeout: settings.read_timeout,
            flush_window: settings.flush_timeout,
        };

        {
            let mut exchange = bus.lock().await;
            exchange.write(b"++mode 1\n").await?;
            exchange.write(b"++auto 0\n").await?;
            exchange.flush().await;
        }
        bus.invalidate_address().await;

        debug!("Prologix init complete on {}", bus.port_name);
        Ok(Arc::new(bus))
    }

    /// Serial device path or label this controller was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Default timeout used by device reads.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Take the hardware lock.
    pub async fn lock(&self) -> BusExchange<'_> {
        BusExchange {
            bus: self,
            port: self.hardware.lock().await,
        }
    }

    /// Send raw bytes to the adapter. No reply is expected.
    pub async fn write(&self, bytes: &[u8]) -> AppResult<()> {
        self.lock().await.write(bytes).await
    }

    /// Discard pending input.
    pub async fn flush(&self) -> usize {
        self.lock().await.flush().await
    }

    /// Cached address, `None` when unknown.
    pub async fn current_address(&self) -> Option<u8> {
        *self.current_address.lock().await
    }

    /// Forget the cached address so the next exchange re-sends `++addr`.
    pub async fn invalidate_address(&self) {
        *self.current_address.lock().await = None;
    }

    /// Handle for the instrument at `address`.
    pub fn device(self: &Arc<Self>, address: u8) -> GpibDevice {
        GpibDevice {
            address,
            controller: Arc::clone(self),
        }
    }
}

// =============================================================================
// BusExchange
// =============================================================================

/// Exclusive access to the wire for the lifetime of the guard.
pub struct BusExchange<'a> {
    bus: &'a Prologix,
    port: MutexGuard<'a, DynSerial>,
}

impl BusExchange<'_> {
    /// Send raw bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Point the adapter at `address`, skipping the command if it already is.
    pub async fn select_address(&mut self, address: u8) -> AppResult<()> {
        let bus = self.bus;
        let mut current = bus.current_address.lock().await;
        if *current != Some(address) {
            self.write(format!("++addr {}\n", address).as_bytes())
                .await?;
            *current = Some(address);
            debug!("Prologix addressed GPIB {}", address);
        }
        Ok(())
    }

    /// Ask the addressed device to talk until EOI, then collect the reply.
    pub async fn read(
        &mut self,
        eol: Option<u8>,
        max_size: Option<usize>,
        timeout: Duration,
    ) -> AppResult<BusRead> {
        self.write(b"++read eoi\n").await?;
        self.read_buffered(eol, max_size, timeout).await
    }

    /// Collect bytes already on their way without asking for more.
    ///
    /// Stops at `eol`, at `max_size` bytes, or when `timeout` has elapsed.
    /// A timeout is logged and reported through [`BusRead::end`].
    pub async fn read_buffered(
        &mut self,
        eol: Option<u8>,
        max_size: Option<usize>,
        timeout: Duration,
    ) -> AppResult<BusRead> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut bytes = Vec::new();

        let end = loop {
            if max_size.is_some_and(|max| bytes.len() >= max) {
                break ReadEnd::MaxSize;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break ReadEnd::Timeout;
            }
            match tokio::time::timeout(remaining, self.port.read_u8()).await {
                Ok(Ok(byte)) => {
                    bytes.push(byte);
                    if Some(byte) == eol {
                        break ReadEnd::Eol;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break ReadEnd::Timeout,
            }
        };

        if end == ReadEnd::Timeout {
            let address = *self.bus.current_address.lock().await;
            match bytes.last() {
                Some(last) => warn!(
                    "Read timed out on GPIB address {:?} after {} bytes. Perhaps the end of line character should be ASCII {}",
                    address,
                    bytes.len(),
                    last
                ),
                None => warn!(
                    "Read timed out on GPIB address {:?}. Is the device connected and powered on?",
                    address
                ),
            }
        }

        Ok(BusRead { bytes, end })
    }

    /// Collect whatever else arrives within the flush window.
    ///
    /// Unlike [`read_buffered`](Self::read_buffered) running out of time is the
    /// normal way this ends, so nothing is logged for it.
    pub async fn read_trailing(&mut self) -> AppResult<Vec<u8>> {
        let window = self.bus.flush_window;
        let mut trailing = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match tokio::time::timeout(window, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => trailing.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(trailing)
    }

    /// Discard stale input.
    pub async fn flush(&mut self) -> usize {
        let window = self.bus.flush_window;
        drain_serial_buffer(&mut *self.port, window).await
    }

    /// Selected device clear.
    pub async fn clear(&mut self) -> AppResult<()> {
        self.write(b"++clr\n").await
    }
}

// =============================================================================
// GpibDevice
// =============================================================================

/// Per-address handle onto a shared [`Prologix`].
///
/// Every operation takes the hardware lock for its whole exchange, selects
/// this address, discards stale input and then talks.
#[derive(Debug, Clone)]
pub struct GpibDevice {
    address: u8,
    controller: Arc<Prologix>,
}

impl GpibDevice {
    /// GPIB address of this handle.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The shared controller.
    pub fn controller(&self) -> &Arc<Prologix> {
        &self.controller
    }

    /// Send a message to this device.
    pub async fn write(&self, message: &[u8]) -> AppResult<()> {
        let mut bus = self.controller.lock().await;
        self.write_locked(&mut bus, message).await
    }

    /// Read a reply using the controller's default timeout.
    pub async fn read(&self, eol: Option<u8>, max_size: Option<usize>) -> AppResult<BusRead> {
        self.read_with_timeout(eol, max_size, self.controller.read_timeout)
            .await
    }

    /// Read a reply with an explicit timeout.
    pub async fn read_with_timeout(
        &self,
        eol: Option<u8>,
        max_size: Option<usize>,
        timeout: Duration,
    ) -> AppResult<BusRead> {
        let mut bus = self.controller.lock().await;
        self.read_locked(&mut bus, eol, max_size, timeout).await
    }

    /// Write then read without releasing the hardware lock in between.
    pub async fn query(
        &self,
        message: &[u8],
        eol: Option<u8>,
        max_size: Option<usize>,
    ) -> AppResult<BusRead> {
        let mut bus = self.controller.lock().await;
        self.write_locked(&mut bus, message).await?;
        self.read_locked(&mut bus, eol, max_size, self.controller.read_timeout)
            .await
    }

    /// Write then read a binary reply of `size` bytes.
    ///
    /// Bytes that keep arriving after the first `size` are appended rather
    /// than left for the next exchange to discard, so the caller sees an
    /// over-long reply for what it is.
    pub async fn query_sized(&self, message: &[u8], size: usize) -> AppResult<BusRead> {
        let mut bus = self.controller.lock().await;
        self.write_locked(&mut bus, message).await?;
        let mut read = self
            .read_locked(&mut bus, None, Some(size), self.controller.read_timeout)
            .await?;
        if read.end == ReadEnd::MaxSize {
            let trailing = bus.read_trailing().await?;
            if !trailing.is_empty() {
                warn!(
                    "GPIB {} sent {} bytes past the {} expected",
                    self.address,
                    trailing.len(),
                    size
                );
                read.bytes.extend(trailing);
            }
        }
        Ok(read)
    }

    /// Selected device clear (`++clr`).
    pub async fn clear(&self) -> AppResult<()> {
        let mut bus = self.controller.lock().await;
        bus.select_address(self.address).await?;
        bus.flush().await;
        bus.clear().await
    }

    /// Discard stale input for this device.
    pub async fn flush(&self) -> AppResult<usize> {
        let mut bus = self.controller.lock().await;
        bus.select_address(self.address).await?;
        Ok(bus.flush().await)
    }

    /// Collect bytes this device has already sent, without issuing `++read eoi`.
    ///
    /// Only meaningful while nothing else is using the adapter: the bytes in
    /// the OS buffer are attributed to this address whoever triggered them.
    /// Another process sharing the serial port makes the result unreliable.
    pub async fn read_pending(
        &self,
        eol: Option<u8>,
        max_size: Option<usize>,
    ) -> AppResult<BusRead> {
        let mut bus = self.controller.lock().await;
        bus.select_address(self.address).await?;
        bus.read_buffered(eol, max_size, self.controller.read_timeout)
            .await
    }

    async fn write_locked(&self, bus: &mut BusExchange<'_>, message: &[u8]) -> AppResult<()> {
        bus.select_address(self.address).await?;
        bus.flush().await;
        bus.write(message).await
    }

    async fn read_locked(
        &self,
        bus: &mut BusExchange<'_>,
        eol: Option<u8>,
        max_size: Option<usize>,
        timeout: Duration,
    ) -> AppResult<BusRead> {
        bus.select_address(self.address).await?;
        bus.flush().await;
        bus.read(eol, max_size, timeout).await
    }
}
