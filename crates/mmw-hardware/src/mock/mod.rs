//! Mock transports for exercising drivers without hardware.

pub mod mock_serial;
pub mod simulated;

pub use simulated::{SimulatedBus, SimulatedInstrument, SimulatedPort, SimulatedUsb};
