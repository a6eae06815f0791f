//! Pasternack PE11S390 series frequency synthesizer.
//!
//! Attached directly over USB-TMC. Every command ends in `;` and query
//! replies carry the same suffix, which [`mmw_core::Reply`] strips.
//!
//! The synthesizer feeds the multiplier chain, so the bench sets it in GHz
//! well below the mm-wave output frequency. `initialize_instrument` turns the
//! RF output off.

use async_trait::async_trait;
use mmw_core::{AppResult, DaqError};
use mmw_hardware::{Command, Instrument, InstrumentDriver};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument};

/// Device file the synthesizer enumerates as on the bench.
pub const DEFAULT_PATH: &str = "/dev/usbtmc0";

/// Lowest frequency accepted, exclusive, in GHz.
pub const MIN_FREQUENCY_GHZ: f64 = 9.9;

/// Highest frequency accepted, exclusive, in GHz.
pub const MAX_FREQUENCY_GHZ: f64 = 20.1;

/// Builders for the PE11S390 command set.
pub mod commands {
    use super::*;

    /// `POWE:RF <0|1>;`
    pub fn set_output(on: bool) -> Command {
        Command::write(format!("POWE:RF {};", u8::from(on)))
    }

    /// `POWE:RF?;`
    pub fn output() -> Command {
        Command::query("POWE:RF?;")
    }

    /// `FREQ:SET <ghz>;`
    pub fn set_frequency(ghz: f64) -> Command {
        Command::write(format!("FREQ:SET {};", ghz))
    }

    /// `FREQ:RETACT?;`
    pub fn frequency() -> Command {
        Command::query("FREQ:RETACT?;")
    }

    /// `POWE:SET <dbm>;`
    pub fn set_power(dbm: f64) -> Command {
        Command::write(format!("POWE:SET {};", dbm))
    }

    /// `POWE:SET?;`
    pub fn power() -> Command {
        Command::query("POWE:SET?;")
    }
}

/// PE11S390 driver.
#[derive(Debug)]
pub struct Pe11s390Driver {
    instrument: Instrument,
}

impl Pe11s390Driver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Driver for the synthesizer behind `path`.
    pub fn usb(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new(Instrument::usb(path, timeout).with_name("Pasternack PE11S390"))
    }

    /// RF output enabled.
    pub async fn output(&self) -> AppResult<bool> {
        Ok(self.instrument.ask_index(&commands::output()).await? == 1)
    }

    /// Enable or disable the RF output.
    #[instrument(skip(self), err)]
    pub async fn set_output(&self, on: bool) -> AppResult<()> {
        self.instrument.send(&commands::set_output(on)).await?;
        info!("{}: RF output {}", self.name(), if on { "on" } else { "off" });
        Ok(())
    }

    /// Output frequency in GHz.
    pub async fn frequency(&self) -> AppResult<f64> {
        self.instrument.ask_number(&commands::frequency()).await
    }

    /// Set the output frequency in GHz.
    ///
    /// # Errors
    ///
    /// [`DaqError::InvalidParameter`] unless 9.9 < `ghz` < 20.1. Nothing is sent.
    #[instrument(skip(self), err)]
    pub async fn set_frequency(&self, ghz: f64) -> AppResult<()> {
        if !(ghz > MIN_FREQUENCY_GHZ && ghz < MAX_FREQUENCY_GHZ) {
            return Err(DaqError::InvalidParameter(format!(
                "{}: {} GHz outside {}..{} GHz",
                self.name(),
                ghz,
                MIN_FREQUENCY_GHZ,
                MAX_FREQUENCY_GHZ
            )));
        }
        self.instrument.send(&commands::set_frequency(ghz)).await
    }

    /// Output power setting in dBm.
    pub async fn power(&self) -> AppResult<f64> {
        self.instrument.ask_number(&commands::power()).await
    }

    /// Set the output power in dBm.
    #[instrument(skip(self), err)]
    pub async fn set_power(&self, dbm: f64) -> AppResult<()> {
        self.instrument.send(&commands::set_power(dbm)).await
    }
}

#[async_trait]
impl InstrumentDriver for Pe11s390Driver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    async fn initialize_instrument(&self) -> AppResult<()> {
        self.set_output(false).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mmw_hardware::mock::SimulatedUsb;
    use mmw_hardware::UsbDevice;

    const TIMEOUT: Duration = Duration::from_millis(50);

    /// Synthesizer that remembers what it was set to.
    fn synthesizer() -> SimulatedUsb {
        let mut frequency = 10.0_f64;
        let mut power = 0.0_f64;
        let mut rf = 0u8;
        SimulatedUsb::new(move |cmd: &str| {
            if cmd == "*IDN?" {
                return Some(b"Pasternack,PE11S390\n".to_vec());
            }
            if let Some(v) = cmd.strip_prefix("FREQ:SET ").and_then(|v| v.strip_suffix(';')) {
                frequency = v.parse().ok()?;
                return None;
            }
            if let Some(v) = cmd.strip_prefix("POWE:SET ").and_then(|v| v.strip_suffix(';')) {
                power = v.parse().ok()?;
                return None;
            }
            if let Some(v) = cmd.strip_prefix("POWE:RF ").and_then(|v| v.strip_suffix(';')) {
                rf = v.parse().ok()?;
                return None;
            }
            match cmd {
                "FREQ:RETACT?;" => Some(format!("{};\n", frequency).into_bytes()),
                "POWE:SET?;" => Some(format!("{};\n", power).into_bytes()),
                "POWE:RF?;" => Some(format!("{};\n", rf).into_bytes()),
                _ => None,
            }
        })
    }

    async fn driver(sim: &SimulatedUsb) -> Pe11s390Driver {
        let device = UsbDevice::from_port(DEFAULT_PATH, Box::new(sim.port()), TIMEOUT)
            .await
            .unwrap();
        Pe11s390Driver::new(
            Instrument::from_usb_device(device, TIMEOUT).with_name("Pasternack PE11S390"),
        )
    }

    #[test]
    fn commands_end_in_semicolon() {
        assert_eq!(commands::set_frequency(13.9), Command::write("FREQ:SET 13.9;"));
        assert_eq!(commands::set_output(true), Command::write("POWE:RF 1;"));
        assert_eq!(commands::set_power(15.0), Command::write("POWE:SET 15;"));
    }

    #[tokio::test]
    async fn initialization_turns_output_off() {
        let sim = synthesizer();
        let synth = driver(&sim).await;
        synth.set_output(true).await.unwrap();
        assert!(synth.output().await.unwrap());
        synth.initialize_instrument().await.unwrap();
        assert!(!synth.output().await.unwrap());
    }

    #[tokio::test]
    async fn frequency_and_power_read_back() {
        let sim = synthesizer();
        let synth = driver(&sim).await;
        synth.set_frequency(13.888).await.unwrap();
        synth.set_power(15.0).await.unwrap();
        assert_eq!(synth.frequency().await.unwrap(), 13.888);
        assert_eq!(synth.power().await.unwrap(), 15.0);
    }

    #[tokio::test]
    async fn out_of_band_frequency_is_rejected() {
        let sim = synthesizer();
        let synth = driver(&sim).await;
        for ghz in [9.9, 20.1, 250.0] {
            assert!(matches!(
                synth.set_frequency(ghz).await,
                Err(DaqError::InvalidParameter(_))
            ));
        }
        assert!(!sim.transcript().iter().any(|l| l.starts_with("FREQ:SET")));
    }
}
