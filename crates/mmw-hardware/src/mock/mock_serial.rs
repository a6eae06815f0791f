//! Channel-backed mock transport for scripted exchanges.
//!
//! [`MockSerialPort`] goes to the code under test; [`MockDeviceHarness`] stays
//! in the test and plays the instrument: it asserts on what was written and
//! feeds back replies.
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let opening = tokio::spawn(UsbDevice::from_port("synth", Box::new(port), timeout));
//! harness.expect_and_respond(b"*IDN?\n", b"PE11S390\n").await;
//! let synth = opening.await??;
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long the harness waits for an expected write before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side: implements `AsyncRead + AsyncWrite`.
#[derive(Debug)]
pub struct MockSerialPort {
    written: UnboundedSender<Vec<u8>>,
    replies: UnboundedReceiver<Vec<u8>>,
    unread: VecDeque<u8>,
}

/// Test side: inspects writes, sends replies.
#[derive(Debug)]
pub struct MockDeviceHarness {
    written: UnboundedReceiver<Vec<u8>>,
    replies: UnboundedSender<Vec<u8>>,
    pending: Vec<u8>,
}

/// A connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();

    (
        MockSerialPort {
            written: written_tx,
            replies: replies_rx,
            unread: VecDeque::new(),
        },
        MockDeviceHarness {
            written: written_rx,
            replies: replies_tx,
            pending: Vec::new(),
        },
    )
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.unread.len());
        let chunk: Vec<u8> = self.unread.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.unread.is_empty() {
            match self.replies.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.unread.extend(chunk),
                // Harness dropped: end of file.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.fill(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.written.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[allow(clippy::panic)]
impl MockDeviceHarness {
    /// Queue bytes for the client to read.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.replies
            .send(data.to_vec())
            .map_err(|_| "client port disconnected")
    }

    /// Wait until the client has written exactly `expected` next.
    ///
    /// # Panics
    ///
    /// On mismatch, on disconnect, or when nothing arrives within two seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.pending.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.written.recv()).await {
                Ok(Some(chunk)) => self.pending.extend_from_slice(&chunk),
                Ok(None) => panic!("client port closed while expecting a write"),
                Err(_) => panic!(
                    "timed out waiting for {:?}; have {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.pending)
                ),
            }
        }

        let actual: Vec<u8> = self.pending.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "expected write {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    /// [`expect_write`](Self::expect_write) then [`send_response`](Self::send_response).
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{}", e);
        }
    }

    /// Everything written so far that has not been matched, collected for a short while.
    pub async fn drain_writes(&mut self) -> Vec<u8> {
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), self.written.recv()).await
        {
            self.pending.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_reply() {
        let (mut port, mut harness) = new();

        let client = tokio::spawn(async move {
            port.write_all(b"POWE:RF?;\n").await.unwrap();
            let mut buf = [0u8; 2];
            port.read_exact(&mut buf).await.unwrap();
            buf
        });

        harness.expect_and_respond(b"POWE:RF?;\n", b"1\n").await;
        assert_eq!(&client.await.unwrap(), b"1\n");
    }

    #[tokio::test]
    async fn split_writes_are_reassembled() {
        let (mut port, mut harness) = new();
        port.write_all(b"FREQ:").await.unwrap();
        port.write_all(b"SET 12;\n").await.unwrap();
        harness.expect_write(b"FREQ:SET 12;\n").await;
    }

    #[tokio::test]
    async fn drain_collects_unmatched_bytes() {
        let (mut port, mut harness) = new();
        port.write_all(b"A\nB\n").await.unwrap();
        assert_eq!(harness.drain_writes().await, b"A\nB\n".to_vec());
    }
}
