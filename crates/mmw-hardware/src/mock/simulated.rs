//! In-memory instruments that answer synchronously.
//!
//! [`SimulatedBus`] behaves like a Prologix adapter with instruments attached:
//! it tracks `++addr`, hands each device line to the instrument at the current
//! address, and releases that instrument's pending reply on `++read eoi`.
//! [`SimulatedUsb`] is the same idea for a directly attached USB-TMC device:
//! a reply becomes readable as soon as the command line is written.
//!
//! Replies are produced inside `poll_write`, so a read that follows never
//! waits on another task. That keeps them usable under a paused tokio clock.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Something that reacts to command lines (terminator stripped).
///
/// Returning `Some(bytes)` queues a reply.
pub trait SimulatedInstrument: Send {
    /// Handle one command line.
    fn handle(&mut self, command: &str) -> Option<Vec<u8>>;
}

impl<F> SimulatedInstrument for F
where
    F: FnMut(&str) -> Option<Vec<u8>> + Send,
{
    fn handle(&mut self, command: &str) -> Option<Vec<u8>> {
        self(command)
    }
}

#[derive(Default)]
struct LinkState {
    address: Option<u8>,
    instruments: HashMap<u8, Box<dyn SimulatedInstrument>>,
    queued: HashMap<u8, Vec<u8>>,
    partial_line: Vec<u8>,
    readable: VecDeque<u8>,
    transcript: Vec<String>,
    reader: Option<Waker>,
}

impl LinkState {
    fn push_readable(&mut self, bytes: &[u8]) {
        self.readable.extend(bytes);
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }
}

/// Shared state behind either simulated link.
#[derive(Clone, Default)]
struct Link {
    state: Arc<Mutex<LinkState>>,
}

impl Link {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        // A poisoned lock only happens after a test already panicked.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transcript(&self) -> Vec<String> {
        self.state().transcript.clone()
    }

    fn count_lines(&self, prefix: &str) -> usize {
        self.state()
            .transcript
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

/// A simulated Prologix adapter with instruments attached by GPIB address.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    link: Link,
}

impl SimulatedBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instrument at `address`, replacing any previous one.
    pub fn attach(&self, address: u8, instrument: impl SimulatedInstrument + 'static) {
        self.link
            .state()
            .instruments
            .insert(address, Box::new(instrument));
    }

    /// A transport end to hand to [`Prologix::with_port`](crate::prologix::Prologix::with_port).
    pub fn port(&self) -> SimulatedPort {
        SimulatedPort {
            link: self.link.clone(),
            mode: Mode::Prologix,
        }
    }

    /// Every complete line written so far, terminators stripped.
    pub fn transcript(&self) -> Vec<String> {
        self.link.transcript()
    }

    /// Number of written lines that start with `prefix`.
    pub fn count_lines(&self, prefix: &str) -> usize {
        self.link.count_lines(prefix)
    }
}

/// A simulated USB-TMC instrument.
#[derive(Clone, Default)]
pub struct SimulatedUsb {
    link: Link,
}

impl SimulatedUsb {
    /// Device backed by `instrument`.
    pub fn new(instrument: impl SimulatedInstrument + 'static) -> Self {
        let sim = Self::default();
        sim.link
            .state()
            .instruments
            .insert(0, Box::new(instrument));
        sim
    }

    /// A transport end to hand to [`UsbDevice::from_port`](crate::usb::UsbDevice::from_port).
    pub fn port(&self) -> SimulatedPort {
        SimulatedPort {
            link: self.link.clone(),
            mode: Mode::Direct,
        }
    }

    /// Every complete line written so far, terminators stripped.
    pub fn transcript(&self) -> Vec<String> {
        self.link.transcript()
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Prologix,
    Direct,
}

/// Transport end of a simulated link.
pub struct SimulatedPort {
    link: Link,
    mode: Mode,
}

impl SimulatedPort {
    fn dispatch(&self, state: &mut LinkState, line: String) {
        match self.mode {
            Mode::Direct => {
                let reply = state
                    .instruments
                    .get_mut(&0)
                    .and_then(|instrument| instrument.handle(&line));
                if let Some(reply) = reply {
                    state.push_readable(&reply);
                }
            }
            Mode::Prologix => {
                if let Some(rest) = line.strip_prefix("++addr ") {
                    state.address = rest.trim().parse().ok();
                } else if line == "++read eoi" {
                    if let Some(reply) = state.address.and_then(|a| state.queued.remove(&a)) {
                        state.push_readable(&reply);
                    }
                } else if !line.starts_with("++") {
                    if let Some(address) = state.address {
                        let reply = state
                            .instruments
                            .get_mut(&address)
                            .and_then(|instrument| instrument.handle(&line));
                        if let Some(reply) = reply {
                            state.queued.insert(address, reply);
                        }
                    }
                }
            }
        }
        state.transcript.push(line);
    }
}

impl AsyncWrite for SimulatedPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let link = self.link.clone();
        let mut state = link.state();
        for &byte in buf {
            if byte == b'\n' {
                let raw = std::mem::take(&mut state.partial_line);
                let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
                self.dispatch(&mut state, line);
            } else {
                state.partial_line.push(byte);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for SimulatedPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.link.state();
        if state.readable.is_empty() {
            state.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(state.readable.len());
        let chunk: Vec<u8> = state.readable.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}
