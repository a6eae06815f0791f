//! Agilent E3633A single-output DC power supply, GPIB through the shared
//! Prologix controller.

use async_trait::async_trait;
use mmw_core::{AppResult, DaqError};
use mmw_hardware::{Command, Instrument, InstrumentDriver, Prologix};
use std::sync::Arc;
use tracing::instrument;

/// Highest voltage of the 20 V range.
pub const MAX_VOLTS: f64 = 20.0;

/// Builders for the SCPI commands the driver sends.
pub mod commands {
    use super::*;

    /// `APPL <v>,0`
    pub fn set_voltage(volts: f64) -> Command {
        Command::write(format!("APPL {},0", volts))
    }

    /// `SOUR:CURR:PROT:STAT 0`
    pub fn disable_current_protection() -> Command {
        Command::write("SOUR:CURR:PROT:STAT 0")
    }
}

/// Agilent E3633A driver.
#[derive(Debug)]
pub struct AgilentE3633aDriver {
    instrument: Instrument,
}

impl AgilentE3633aDriver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Driver for the supply at `address` on `controller`.
    pub fn on_bus(controller: Arc<Prologix>, address: u8) -> Self {
        Self::new(Instrument::gpib(controller, address).with_name("Agilent E3633A"))
    }

    /// Set the output voltage.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        if !(volts.is_finite() && (0.0..=MAX_VOLTS).contains(&volts)) {
            return Err(DaqError::InvalidParameter(format!(
                "{} V outside 0..{}",
                volts, MAX_VOLTS
            )));
        }
        self.instrument.send(&commands::set_voltage(volts)).await
    }

    /// Turn over-current protection off.
    pub async fn disable_current_protection(&self) -> AppResult<()> {
        self.instrument
            .send(&commands::disable_current_protection())
            .await
    }
}

#[async_trait]
impl InstrumentDriver for AgilentE3633aDriver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    async fn initialize_instrument(&self) -> AppResult<()> {
        self.disable_current_protection().await?;
        self.set_voltage(0.0).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mmw_hardware::mock::SimulatedBus;
    use mmw_hardware::BusSettings;
    use std::time::Duration;

    const ADDRESS: u8 = 6;

    async fn supply(sim: &SimulatedBus) -> AgilentE3633aDriver {
        let settings = BusSettings {
            read_timeout: Duration::from_millis(100),
            flush_timeout: Duration::from_millis(1),
            ..BusSettings::default()
        };
        let bus = Prologix::with_port("sim", Box::new(sim.port()), &settings)
            .await
            .unwrap();
        let mut driver = AgilentE3633aDriver::on_bus(bus, ADDRESS);
        driver.open().await.unwrap();
        driver
    }

    #[test]
    fn voltage_pins_current_to_zero() {
        assert_eq!(commands::set_voltage(8.0), Command::write("APPL 8,0"));
        assert_eq!(commands::set_voltage(2.5), Command::write("APPL 2.5,0"));
    }

    #[tokio::test]
    async fn initialization_drops_protection_then_zeroes() {
        let sim = SimulatedBus::new();
        sim.attach(ADDRESS, |_: &str| None);
        let psu = supply(&sim).await;
        psu.initialize_instrument().await.unwrap();
        psu.set_voltage(8.0).await.unwrap();
        assert!(psu.set_voltage(21.0).await.is_err());

        let lines: Vec<String> = sim
            .transcript()
            .into_iter()
            .filter(|l| !l.starts_with("++"))
            .collect();
        assert_eq!(lines, vec!["SOUR:CURR:PROT:STAT 0", "APPL 0,0", "APPL 8,0"]);
    }
}
