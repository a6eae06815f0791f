//! Agilent E3631A triple-output DC power supply.
//!
//! GPIB through the shared Prologix controller. Three rails: +6 V, +25 V and
//! -25 V. Voltages are given as magnitudes; the -25 V rail is sent negated.

use async_trait::async_trait;
use mmw_core::{AppResult, DaqError};
use mmw_hardware::{Command, Instrument, InstrumentDriver, Prologix};
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

/// One of the three outputs (`APPL <rail>,...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rail {
    /// 0 to +6 V.
    Positive6,
    /// 0 to +25 V.
    Positive25,
    /// 0 to -25 V.
    Negative25,
}

impl Rail {
    /// All rails in front-panel order.
    pub const ALL: [Rail; 3] = [Rail::Positive6, Rail::Positive25, Rail::Negative25];

    /// SCPI mnemonic.
    pub fn as_str(self) -> &'static str {
        match self {
            Rail::Positive6 => "P6V",
            Rail::Positive25 => "P25V",
            Rail::Negative25 => "N25V",
        }
    }

    /// Largest magnitude the rail accepts, in volts.
    pub fn limit(self) -> f64 {
        match self {
            Rail::Positive6 => 6.0,
            Rail::Positive25 | Rail::Negative25 => 25.0,
        }
    }

    fn signed(self, magnitude: f64) -> f64 {
        match self {
            Rail::Negative25 if magnitude > 0.0 => -magnitude,
            _ => magnitude,
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builders for the SCPI commands the driver sends.
pub mod commands {
    use super::*;

    /// `APPL <rail>,<v>` with the negative rail's magnitude negated.
    pub fn set_voltage(rail: Rail, volts: f64) -> Command {
        Command::write(format!("APPL {},{}", rail.as_str(), rail.signed(volts)))
    }

    /// `APPL` for all three rails in one transaction.
    pub fn set_voltages(p6: f64, p25: f64, n25: f64) -> Command {
        Command::write_all(
            Rail::ALL
                .into_iter()
                .zip([p6, p25, n25])
                .map(|(rail, volts)| format!("APPL {},{}", rail.as_str(), rail.signed(volts))),
        )
    }

    /// `OUTP:STAT <0|1>`
    pub fn set_output(on: bool) -> Command {
        Command::write(format!("OUTP:STAT {}", u8::from(on)))
    }
}

fn check_magnitude(rail: Rail, volts: f64) -> AppResult<()> {
    if volts.is_finite() && (0.0..=rail.limit()).contains(&volts) {
        Ok(())
    } else {
        Err(DaqError::InvalidParameter(format!(
            "{} V outside 0..{} on {}",
            volts,
            rail.limit(),
            rail
        )))
    }
}

/// Agilent E3631A driver.
#[derive(Debug)]
pub struct AgilentE3631aDriver {
    instrument: Instrument,
}

impl AgilentE3631aDriver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Driver for the supply at `address` on `controller`.
    pub fn on_bus(controller: Arc<Prologix>, address: u8) -> Self {
        Self::new(Instrument::gpib(controller, address).with_name("Agilent E3631A"))
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.instrument.send(&command).await
    }

    /// Set one rail, `volts` being the magnitude.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&self, rail: Rail, volts: f64) -> AppResult<()> {
        check_magnitude(rail, volts)?;
        self.send(commands::set_voltage(rail, volts)).await
    }

    /// Set all three rails.
    #[instrument(skip(self), err)]
    pub async fn set_voltages(&self, p6: f64, p25: f64, n25: f64) -> AppResult<()> {
        for (rail, volts) in Rail::ALL.into_iter().zip([p6, p25, n25]) {
            check_magnitude(rail, volts)?;
        }
        self.send(commands::set_voltages(p6, p25, n25)).await
    }

    /// Outputs enabled.
    pub async fn output(&self) -> AppResult<bool> {
        Ok(self
            .instrument
            .ask_index(&Command::query("OUTP:STAT?"))
            .await?
            == 1)
    }

    /// Enable or disable all outputs.
    pub async fn set_output(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_output(on)).await
    }
}

#[async_trait]
impl InstrumentDriver for AgilentE3631aDriver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    /// Outputs off, then every rail to 0 V.
    async fn initialize_instrument(&self) -> AppResult<()> {
        self.set_output(false).await?;
        self.set_voltages(0.0, 0.0, 0.0).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mmw_hardware::mock::SimulatedBus;
    use mmw_hardware::BusSettings;
    use std::time::Duration;

    const ADDRESS: u8 = 5;

    async fn supply(sim: &SimulatedBus) -> AgilentE3631aDriver {
        let settings = BusSettings {
            read_timeout: Duration::from_millis(100),
            flush_timeout: Duration::from_millis(1),
            ..BusSettings::default()
        };
        let bus = Prologix::with_port("sim", Box::new(sim.port()), &settings)
            .await
            .unwrap();
        let mut driver = AgilentE3631aDriver::on_bus(bus, ADDRESS);
        driver.open().await.unwrap();
        driver
    }

    fn device_lines(sim: &SimulatedBus) -> Vec<String> {
        sim.transcript()
            .into_iter()
            .filter(|l| !l.starts_with("++"))
            .collect()
    }

    #[test]
    fn negative_rail_is_negated() {
        assert_eq!(
            commands::set_voltage(Rail::Negative25, 12.0),
            Command::write("APPL N25V,-12")
        );
        assert_eq!(
            commands::set_voltages(1.5, 5.0, 5.0).lines(),
            vec!["APPL P6V,1.5", "APPL P25V,5", "APPL N25V,-5"]
        );
        assert_eq!(
            commands::set_voltage(Rail::Negative25, 0.0),
            Command::write("APPL N25V,0")
        );
        assert_eq!(commands::set_output(true), Command::write("OUTP:STAT 1"));
    }

    #[tokio::test]
    async fn initialization_switches_off_and_zeroes() {
        let sim = SimulatedBus::new();
        sim.attach(ADDRESS, |_: &str| None);
        let psu = supply(&sim).await;
        assert_eq!(psu.name(), "Agilent E3631A");
        psu.initialize_instrument().await.unwrap();
        assert_eq!(
            device_lines(&sim),
            vec!["OUTP:STAT 0", "APPL P6V,0", "APPL P25V,0", "APPL N25V,0"]
        );
    }

    #[tokio::test]
    async fn output_state_is_read_back() {
        let sim = SimulatedBus::new();
        sim.attach(ADDRESS, |cmd: &str| match cmd {
            "OUTP:STAT?" => Some(b"1\n".to_vec()),
            _ => None,
        });
        let psu = supply(&sim).await;
        assert!(psu.output().await.unwrap());
    }

    #[tokio::test]
    async fn over_range_voltage_sends_nothing() {
        let sim = SimulatedBus::new();
        sim.attach(ADDRESS, |_: &str| None);
        let psu = supply(&sim).await;
        assert!(matches!(
            psu.set_voltage(Rail::Positive6, 7.0).await,
            Err(DaqError::InvalidParameter(_))
        ));
        assert!(matches!(
            psu.set_voltages(0.0, 5.0, -5.0).await,
            Err(DaqError::InvalidParameter(_))
        ));
        assert!(device_lines(&sim).is_empty());
    }
}
