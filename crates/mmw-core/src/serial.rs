//! Async byte-channel plumbing shared by the bus controller and USB devices.
//!
//! Both transports on the bench are plain byte pipes: the Prologix adapter is a
//! serial line and the synthesizer is a USB-TMC character device. Everything
//! above this module talks to them through [`DynSerial`].
//!
//! # Feature Flag
//!
//! [`open_serial_async`] requires the `serial` feature (on by default).

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async byte-channel I/O.
///
/// Implemented for anything `AsyncRead + AsyncWrite + Unpin + Send`, which covers
/// `tokio_serial::SerialStream`, `tokio::fs::File`, `tokio::io::DuplexStream`
/// and the mock ports in `mmw-hardware`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

// =============================================================================
// Type Aliases
// =============================================================================

/// Type-erased boxed transport.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Shared transport without buffering.
///
/// Reads are byte-at-a-time on the Prologix path so no `BufReader` sits in
/// front of the port; a flush then only has the OS buffer to discard.
pub type SharedPortUnbuffered = Arc<Mutex<DynSerial>>;

/// Wrap a transport for sharing.
pub fn wrap_shared_unbuffered(port: DynSerial) -> SharedPortUnbuffered {
    Arc::new(Mutex::new(port))
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port 8N1 without flow control on a blocking thread.
///
/// # Errors
///
/// [`DaqError::TransportOpen`](crate::error::DaqError::TransportOpen) if the
/// port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> crate::error::AppResult<tokio_serial::SerialStream> {
    use crate::error::DaqError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DaqError::Instrument(format!("serial open task failed: {}", e)))?;

    opened.map_err(|e| DaqError::TransportOpen {
        resource: port_path.to_string(),
        source: e.into(),
    })
}

/// Read and discard whatever input is pending, stopping at the first quiet
/// `window` or when the port reports EOF.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match tokio::time::timeout(window, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(e)) => {
                tracing::warn!("I/O error while draining input: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    if total_discarded > 0 {
        tracing::debug!("Discarded {} stale bytes", total_discarded);
    }
    total_discarded
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn shared_port_reads_through_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = wrap_shared_unbuffered(Box::new(device));

        host.write_all(b"++ver\n").await.unwrap();

        let mut guard = port.lock().await;
        let mut buf = [0u8; 6];
        guard.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"++ver\n");
    }

    #[tokio::test]
    async fn drain_discards_pending_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale reply 1234").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(20)).await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let next = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(next.is_err(), "nothing should remain after a drain");
    }

    #[tokio::test]
    async fn drain_on_quiet_port_returns_zero() {
        let (_host, mut device) = tokio::io::duplex(64);
        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(5)).await;
        assert_eq!(discarded, 0);
    }
}
