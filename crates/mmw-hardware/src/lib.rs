//! Connection management for the bench.
//!
//! - [`prologix`]: the shared GPIB controller and per-address device handles
//! - [`usb`]: USB-TMC device files
//! - [`instrument`]: the [`Instrument`] type, [`Command`] and [`InstrumentDriver`]
//! - [`tables`]: index/value setting tables
//! - [`mock`]: simulated transports for tests

pub mod instrument;
pub mod mock;
pub mod prologix;
pub mod tables;
pub mod usb;

pub use instrument::{Command, ConnectionKind, Instrument, InstrumentDriver, Resource};
pub use prologix::{BusExchange, BusRead, BusSettings, GpibDevice, Prologix, ReadEnd};
pub use tables::SettingTable;
pub use usb::UsbDevice;
