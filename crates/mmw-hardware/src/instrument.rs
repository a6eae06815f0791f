//! The generic instrument layer.
//!
//! An [`Instrument`] is one physical device, reached either through a GPIB
//! handle on the shared Prologix controller or through its own USB-TMC device
//! file. Drivers build [`Command`]s and hand them to [`Instrument::execute`],
//! which logs, transmits and normalizes the reply in one place.

use crate::prologix::{GpibDevice, Prologix};
use crate::usb::UsbDevice;
use async_trait::async_trait;
use mmw_core::{AppResult, DaqError, Reply};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Commands
// =============================================================================

/// A unit of work for an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// One or more lines sent in order, no reply expected.
    Write(Vec<String>),
    /// One line whose reply is read back and normalized.
    Query(String),
}

impl Command {
    /// A single write line.
    pub fn write(line: impl Into<String>) -> Self {
        Command::Write(vec![line.into()])
    }

    /// Several write lines sent back to back.
    pub fn write_all<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command::Write(lines.into_iter().map(Into::into).collect())
    }

    /// A query line.
    pub fn query(line: impl Into<String>) -> Self {
        Command::Query(line.into())
    }

    /// The lines this command puts on the wire, without terminators.
    pub fn lines(&self) -> Vec<&str> {
        match self {
            Command::Write(lines) => lines.iter().map(String::as_str).collect(),
            Command::Query(line) => vec![line.as_str()],
        }
    }
}

// =============================================================================
// Resource / backing
// =============================================================================

/// How an instrument is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Through the Prologix adapter.
    Gpib,
    /// Through a USB-TMC device file.
    Usb,
}

/// Where an unopened instrument will connect.
#[derive(Debug, Clone)]
pub enum Resource {
    /// A GPIB address on a shared controller.
    Gpib {
        /// The bus controller.
        controller: Arc<Prologix>,
        /// Primary address, 0..=30.
        address: u8,
    },
    /// A USB-TMC device file.
    Usb {
        /// e.g. `/dev/usbtmc0`.
        path: PathBuf,
        /// Read timeout.
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
enum Backing {
    Gpib(GpibDevice),
    Usb(UsbDevice),
}

// =============================================================================
// Instrument
// =============================================================================

/// One physical device.
///
/// Constructed unopened. [`open`](Self::open) is idempotent and creates the
/// connection lazily; [`close`](Self::close) releases a USB file handle and is
/// a no-op for GPIB.
#[derive(Debug)]
pub struct Instrument {
    name: String,
    resource: Resource,
    backing: Option<Backing>,
}

impl Instrument {
    /// An instrument at `address` on `controller`. Named after its address.
    pub fn gpib(controller: Arc<Prologix>, address: u8) -> Self {
        Self {
            name: address.to_string(),
            resource: Resource::Gpib {
                controller,
                address,
            },
            backing: None,
        }
    }

    /// An instrument behind a USB-TMC device file. Named after the path.
    pub fn usb(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            resource: Resource::Usb { path, timeout },
            backing: None,
        }
    }

    /// An instrument around an already-open USB device.
    pub fn from_usb_device(device: UsbDevice, timeout: Duration) -> Self {
        Self {
            name: device.path().to_string(),
            resource: Resource::Usb {
                path: PathBuf::from(device.path()),
                timeout,
            },
            backing: Some(Backing::Usb(device)),
        }
    }

    /// Replace the display name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Display name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// GPIB or USB.
    pub fn kind(&self) -> ConnectionKind {
        match self.resource {
            Resource::Gpib { .. } => ConnectionKind::Gpib,
            Resource::Usb { .. } => ConnectionKind::Usb,
        }
    }

    /// Where this instrument connects.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// `true` once [`open`](Self::open) has succeeded.
    pub fn is_open(&self) -> bool {
        self.backing.is_some()
    }

    /// Create the backing connection if there is none yet.
    pub async fn open(&mut self) -> AppResult<()> {
        if self.backing.is_some() {
            return Ok(());
        }
        let backing = match &self.resource {
            Resource::Gpib {
                controller,
                address,
            } => Backing::Gpib(controller.device(*address)),
            Resource::Usb { path, timeout } => {
                Backing::Usb(UsbDevice::open(path, *timeout).await?)
            }
        };
        self.backing = Some(backing);
        info!("Opened {}", self.name);
        Ok(())
    }

    /// Release the connection. GPIB handles hold nothing and stay usable.
    pub async fn close(&mut self) -> AppResult<()> {
        if let Some(Backing::Usb(device)) = &self.backing {
            device.close().await?;
            self.backing = None;
            info!("Closed {}", self.name);
        }
        Ok(())
    }

    fn backing(&self) -> AppResult<&Backing> {
        self.backing
            .as_ref()
            .ok_or_else(|| DaqError::NotOpen(self.name.clone()))
    }

    /// Send one command line.
    pub async fn write(&self, command: &str) -> AppResult<()> {
        let line = terminated(command);
        match self.backing()? {
            Backing::Gpib(device) => device.write(line.as_bytes()).await,
            Backing::Usb(device) => device.write(line.as_bytes()).await,
        }
    }

    /// Read one reply as text.
    pub async fn read(&self) -> AppResult<String> {
        match self.backing()? {
            Backing::Gpib(device) => Ok(device.read(Some(b'\n'), None).await?.text()),
            Backing::Usb(device) => Ok(String::from_utf8_lossy(&device.read().await?).into_owned()),
        }
    }

    /// Read a binary reply. On GPIB the read ends only at `max_size` bytes or
    /// at the timeout, never at a newline byte.
    pub async fn read_raw(&self, max_size: Option<usize>) -> AppResult<Vec<u8>> {
        match self.backing()? {
            Backing::Gpib(device) => Ok(device.read(None, max_size).await?.bytes),
            Backing::Usb(device) => {
                let mut bytes = device.read().await?;
                if let Some(max) = max_size {
                    bytes.truncate(max);
                }
                Ok(bytes)
            }
        }
    }

    /// Send one line and read a binary reply expected to be `expected` bytes
    /// long, holding the bus for the whole exchange.
    ///
    /// The reply is returned whole: shorter on timeout, longer if the device
    /// kept talking. Checking the length is up to the caller.
    pub async fn query_raw(&self, command: &str, expected: usize) -> AppResult<Vec<u8>> {
        let line = terminated(command);
        debug!("Querying to {} --> {}", self.name, command);
        let bytes = match self.backing()? {
            Backing::Gpib(device) => device.query_sized(line.as_bytes(), expected).await?.bytes,
            Backing::Usb(device) => {
                device.write(line.as_bytes()).await?;
                device.read().await?
            }
        };
        debug!("Received from {} <-- {} bytes", self.name, bytes.len());
        Ok(bytes)
    }

    /// Send one line and read its reply as text.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        let line = terminated(command);
        match self.backing()? {
            Backing::Gpib(device) => Ok(device
                .query(line.as_bytes(), Some(b'\n'), None)
                .await?
                .text()),
            Backing::Usb(device) => device.query(line.as_bytes()).await,
        }
    }

    /// `*RST`.
    pub async fn reset(&self) -> AppResult<()> {
        self.send(&Command::write("*RST")).await
    }

    /// Transmit a command. Queries return their normalized reply.
    pub async fn execute(&self, command: &Command) -> AppResult<Option<Reply>> {
        match command {
            Command::Write(lines) => {
                for line in lines {
                    debug!("Writing to {} --> {}", self.name, line);
                    self.write(line).await?;
                }
                Ok(None)
            }
            Command::Query(line) => {
                debug!("Querying to {} --> {}", self.name, line);
                let raw = self.query(line).await?;
                let reply = Reply::parse(&raw);
                debug!("Received from {} <-- {}", self.name, reply);
                Ok(Some(reply))
            }
        }
    }

    /// Execute a write-only command.
    pub async fn send(&self, command: &Command) -> AppResult<()> {
        self.execute(command).await.map(|_| ())
    }

    /// Execute a query and return its reply.
    pub async fn ask(&self, command: &Command) -> AppResult<Reply> {
        self.execute(command)
            .await?
            .ok_or_else(|| DaqError::Instrument(format!("{}: command expects no reply", self.name)))
    }

    /// Execute a query whose reply must be numeric.
    pub async fn ask_number(&self, command: &Command) -> AppResult<f64> {
        let reply = self.ask(command).await?;
        reply.as_f64().ok_or_else(|| {
            DaqError::Decode(format!(
                "{}: expected a number for {:?}, got {:?}",
                self.name,
                command.lines(),
                reply.to_string()
            ))
        })
    }

    /// Execute a query whose reply must be a setting index.
    pub async fn ask_index(&self, command: &Command) -> AppResult<usize> {
        let reply = self.ask(command).await?;
        reply
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                DaqError::Decode(format!(
                    "{}: expected an index for {:?}, got {:?}",
                    self.name,
                    command.lines(),
                    reply.to_string()
                ))
            })
    }
}

fn terminated(command: &str) -> String {
    let body = command.strip_suffix('\n').unwrap_or(command);
    format!("{}\n", body)
}

// =============================================================================
// Driver trait
// =============================================================================

/// Behaviour shared by every instrument model.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// The underlying instrument.
    fn instrument(&self) -> &Instrument;

    /// Mutable access for lifecycle changes.
    fn instrument_mut(&mut self) -> &mut Instrument;

    /// Display name.
    fn name(&self) -> &str {
        self.instrument().name()
    }

    /// Open the connection (idempotent).
    async fn open(&mut self) -> AppResult<()> {
        self.instrument_mut().open().await
    }

    /// Release the connection.
    async fn close(&mut self) -> AppResult<()> {
        self.instrument_mut().close().await
    }

    /// Start-up commands, run once per session.
    async fn initialize_instrument(&self) -> AppResult<()> {
        Ok(())
    }

    /// Return the instrument to its power-on defaults.
    async fn reset(&self) -> AppResult<()> {
        self.instrument().reset().await
    }

    /// Transmit a built command.
    async fn execute(&self, command: &Command) -> AppResult<Option<Reply>> {
        self.instrument().execute(command).await
    }
}
