//! USB-TMC instruments driven through their character device (`/dev/usbtmcN`).
//!
//! The kernel driver frames messages, so a single `read` returns one reply.

use mmw_core::serial::{wrap_shared_unbuffered, DynSerial, SharedPortUnbuffered};
use mmw_core::{AppResult, DaqError, DriverError, DriverErrorKind};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// An open USB-TMC device file.
#[derive(Clone)]
pub struct UsbDevice {
    path: String,
    port: SharedPortUnbuffered,
    timeout: Duration,
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl UsbDevice {
    /// Open the device file read/write and check that it identifies itself.
    ///
    /// # Errors
    ///
    /// `TransportOpen` if the file cannot be opened, a driver initialization
    /// error if `*IDN?` comes back empty.
    pub async fn open(path: &Path, timeout: Duration) -> AppResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|source| DaqError::TransportOpen {
                resource: path.display().to_string(),
                source,
            })?;
        Self::from_port(path.display().to_string(), Box::new(file), timeout).await
    }

    /// Wrap an already-open transport and check that it identifies itself.
    pub async fn from_port(
        path: impl Into<String>,
        port: DynSerial,
        timeout: Duration,
    ) -> AppResult<Self> {
        let device = Self {
            path: path.into(),
            port: wrap_shared_unbuffered(port),
            timeout,
        };

        let identity = device.query(b"*IDN?\n").await?;
        if identity.is_empty() {
            let _ = device.close().await;
            return Err(DriverError::new(
                "usbtmc",
                DriverErrorKind::Initialization,
                format!("connection to {} failed: no reply to *IDN?", device.path),
            )
            .into());
        }
        info!("Successfully connected to {} ({})", device.path, identity);
        Ok(device)
    }

    /// Device file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write bytes and flush them to the device.
    pub async fn write(&self, bytes: &[u8]) -> AppResult<()> {
        let mut port = self.port.lock().await;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    /// Read one reply. An expired timeout yields whatever arrived, possibly nothing.
    pub async fn read(&self) -> AppResult<Vec<u8>> {
        let mut port = self.port.lock().await;
        self.read_locked(&mut port).await
    }

    /// Write, flush, read and trim, under one lock.
    pub async fn query(&self, bytes: &[u8]) -> AppResult<String> {
        let mut port = self.port.lock().await;
        port.write_all(bytes).await?;
        port.flush().await?;
        let reply = self.read_locked(&mut port).await?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    /// Flush and shut the transport down.
    pub async fn close(&self) -> AppResult<()> {
        let mut port = self.port.lock().await;
        port.shutdown().await?;
        debug!("Closed {}", self.path);
        Ok(())
    }

    async fn read_locked(&self, port: &mut DynSerial) -> AppResult<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK];
        match tokio::time::timeout(self.timeout, port.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Read timed out on {}", self.path);
                Ok(Vec::new())
            }
        }
    }
}
