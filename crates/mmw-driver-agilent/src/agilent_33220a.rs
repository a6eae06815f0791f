//! Agilent 33220A 20 MHz function / arbitrary waveform generator.
//!
//! Drives the chopper that provides the lock-in reference. GPIB through the
//! shared Prologix controller, SCPI command set, default address 10.
//!
//! Amplitude is set as a high level with the low level pinned to 0 V, so the
//! square wave swings between 0 and the requested amplitude.

use async_trait::async_trait;
use mmw_core::{AppResult, DaqError};
use mmw_hardware::{Command, Instrument, InstrumentDriver, Prologix};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

/// Default GPIB address on the bench.
pub const DEFAULT_ADDRESS: u8 = 10;

/// Output waveform (`FUNC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    /// Sine.
    Sine,
    /// Square.
    Square,
    /// Ramp.
    Ramp,
    /// Pulse.
    Pulse,
    /// Noise.
    Noise,
    /// DC level.
    Dc,
}

impl Waveform {
    /// SCPI mnemonic.
    pub fn as_str(self) -> &'static str {
        match self {
            Waveform::Sine => "SIN",
            Waveform::Square => "SQU",
            Waveform::Ramp => "RAMP",
            Waveform::Pulse => "PULS",
            Waveform::Noise => "NOIS",
            Waveform::Dc => "DC",
        }
    }
}

/// Amplitude unit (`VOLT:UNIT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageUnit {
    /// Volts peak to peak.
    Vpp,
    /// Volts rms.
    Vrms,
}

impl VoltageUnit {
    /// SCPI mnemonic.
    pub fn as_str(self) -> &'static str {
        match self {
            VoltageUnit::Vpp => "VPP",
            VoltageUnit::Vrms => "VRMS",
        }
    }
}

/// Frequency sweep spacing (`SWE:SPAC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSpacing {
    /// Linear.
    Linear,
    /// Logarithmic.
    Logarithmic,
}

impl SweepSpacing {
    /// SCPI mnemonic.
    pub fn as_str(self) -> &'static str {
        match self {
            SweepSpacing::Linear => "LIN",
            SweepSpacing::Logarithmic => "LOG",
        }
    }
}

/// Sweep trigger source (`TRIG:SOUR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Free running.
    Immediate,
    /// Rear-panel trigger input.
    External,
    /// Software trigger, see [`Agilent33220aDriver::send_trigger`].
    Bus,
}

impl TriggerSource {
    /// SCPI mnemonic.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Immediate => "IMM",
            TriggerSource::External => "EXT",
            TriggerSource::Bus => "BUS",
        }
    }
}

macro_rules! parse_mnemonic {
    ($ty:ident: $($variant:ident),+) => {
        impl FromStr for $ty {
            type Err = DaqError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                [$($ty::$variant),+]
                    .into_iter()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| {
                        DaqError::Decode(format!("unknown {} '{}'", stringify!($ty), s))
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

parse_mnemonic!(Waveform: Sine, Square, Ramp, Pulse, Noise, Dc);
parse_mnemonic!(VoltageUnit: Vpp, Vrms);
parse_mnemonic!(SweepSpacing: Linear, Logarithmic);
parse_mnemonic!(TriggerSource: Immediate, External, Bus);

/// Builders for the SCPI commands the driver sends.
pub mod commands {
    use super::*;

    /// `FUNC <shape>`
    pub fn set_waveform(waveform: Waveform) -> Command {
        Command::write(format!("FUNC {}", waveform.as_str()))
    }

    /// `FREQ <hz>`
    pub fn set_frequency(hz: f64) -> Command {
        Command::write(format!("FREQ {}", hz))
    }

    /// `VOLT:HIGH <v>` then `VOLT:LOW 0`
    pub fn set_amplitude(volts: f64) -> Command {
        Command::write_all([format!("VOLT:HIGH {}", volts), "VOLT:LOW 0".to_string()])
    }

    /// `VOLT:UNIT <unit>`
    pub fn set_voltage_unit(unit: VoltageUnit) -> Command {
        Command::write(format!("VOLT:UNIT {}", unit.as_str()))
    }

    /// `OUTP <0|1>`
    pub fn set_output(on: bool) -> Command {
        Command::write(format!("OUTP {}", u8::from(on)))
    }

    /// `FREQ:STAR <hz>`
    pub fn set_sweep_start(hz: f64) -> Command {
        Command::write(format!("FREQ:STAR {}", hz))
    }

    /// `FREQ:STOP <hz>`
    pub fn set_sweep_stop(hz: f64) -> Command {
        Command::write(format!("FREQ:STOP {}", hz))
    }

    /// `SWE:TIME <s>`
    pub fn set_sweep_time(seconds: f64) -> Command {
        Command::write(format!("SWE:TIME {}", seconds))
    }

    /// `SWE:SPAC <spacing>`
    pub fn set_sweep_spacing(spacing: SweepSpacing) -> Command {
        Command::write(format!("SWE:SPAC {}", spacing.as_str()))
    }

    /// `SWE:STAT <0|1>`
    pub fn set_sweep_state(on: bool) -> Command {
        Command::write(format!("SWE:STAT {}", u8::from(on)))
    }

    /// `TRIG:SOUR <source>`
    pub fn set_trigger_source(source: TriggerSource) -> Command {
        Command::write(format!("TRIG:SOUR {}", source.as_str()))
    }
}

/// Agilent 33220A driver.
#[derive(Debug)]
pub struct Agilent33220aDriver {
    instrument: Instrument,
}

impl Agilent33220aDriver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Driver for the generator at `address` on `controller`.
    pub fn on_bus(controller: Arc<Prologix>, address: u8) -> Self {
        Self::new(Instrument::gpib(controller, address).with_name("Agilent 33220A"))
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.instrument.send(&command).await
    }

    async fn number(&self, query: &str) -> AppResult<f64> {
        self.instrument.ask_number(&Command::query(query)).await
    }

    async fn mnemonic<T: FromStr<Err = DaqError>>(&self, query: &str) -> AppResult<T> {
        self.instrument
            .ask(&Command::query(query))
            .await?
            .to_string()
            .parse()
    }

    async fn flag(&self, query: &str) -> AppResult<bool> {
        Ok(self.instrument.ask_index(&Command::query(query)).await? == 1)
    }

    /// Output waveform.
    pub async fn waveform(&self) -> AppResult<Waveform> {
        self.mnemonic("FUNC?").await
    }

    /// Select the output waveform.
    pub async fn set_waveform(&self, waveform: Waveform) -> AppResult<()> {
        self.send(commands::set_waveform(waveform)).await
    }

    /// Output frequency in Hz.
    pub async fn frequency(&self) -> AppResult<f64> {
        self.number("FREQ?").await
    }

    /// Set the output frequency in Hz.
    #[instrument(skip(self), err)]
    pub async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        if !(hz > 0.0 && hz <= 20e6) {
            return Err(DaqError::InvalidParameter(format!(
                "frequency {} Hz outside 0..20 MHz",
                hz
            )));
        }
        self.send(commands::set_frequency(hz)).await
    }

    /// Amplitude in the current voltage unit.
    pub async fn amplitude(&self) -> AppResult<f64> {
        self.number("VOLT?").await
    }

    /// Swing the output between 0 V and `volts`.
    #[instrument(skip(self), err)]
    pub async fn set_amplitude(&self, volts: f64) -> AppResult<()> {
        if !(volts > 0.0 && volts <= 10.0) {
            return Err(DaqError::InvalidParameter(format!(
                "amplitude {} V outside 0..10",
                volts
            )));
        }
        self.send(commands::set_amplitude(volts)).await
    }

    /// Amplitude unit.
    pub async fn voltage_unit(&self) -> AppResult<VoltageUnit> {
        self.mnemonic("VOLT:UNIT?").await
    }

    /// Set the amplitude unit.
    pub async fn set_voltage_unit(&self, unit: VoltageUnit) -> AppResult<()> {
        self.send(commands::set_voltage_unit(unit)).await
    }

    /// Output enabled.
    pub async fn output(&self) -> AppResult<bool> {
        self.flag("OUTP?").await
    }

    /// Enable or disable the output.
    pub async fn set_output(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_output(on)).await
    }

    /// Sweep start frequency in Hz.
    pub async fn sweep_start(&self) -> AppResult<f64> {
        self.number("FREQ:STAR?").await
    }

    /// Set the sweep start frequency in Hz.
    pub async fn set_sweep_start(&self, hz: f64) -> AppResult<()> {
        self.send(commands::set_sweep_start(hz)).await
    }

    /// Sweep stop frequency in Hz.
    pub async fn sweep_stop(&self) -> AppResult<f64> {
        self.number("FREQ:STOP?").await
    }

    /// Set the sweep stop frequency in Hz.
    pub async fn set_sweep_stop(&self, hz: f64) -> AppResult<()> {
        self.send(commands::set_sweep_stop(hz)).await
    }

    /// Sweep time in seconds.
    pub async fn sweep_time(&self) -> AppResult<f64> {
        self.number("SWE:TIME?").await
    }

    /// Set the sweep time in seconds.
    pub async fn set_sweep_time(&self, seconds: f64) -> AppResult<()> {
        self.send(commands::set_sweep_time(seconds)).await
    }

    /// Sweep spacing.
    pub async fn sweep_spacing(&self) -> AppResult<SweepSpacing> {
        self.mnemonic("SWE:SPAC?").await
    }

    /// Set the sweep spacing.
    pub async fn set_sweep_spacing(&self, spacing: SweepSpacing) -> AppResult<()> {
        self.send(commands::set_sweep_spacing(spacing)).await
    }

    /// Frequency sweep enabled.
    pub async fn sweep_state(&self) -> AppResult<bool> {
        self.flag("SWE:STAT?").await
    }

    /// Enable or disable the frequency sweep.
    pub async fn set_sweep_state(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_sweep_state(on)).await
    }

    /// Sweep trigger source.
    pub async fn trigger_source(&self) -> AppResult<TriggerSource> {
        self.mnemonic("TRIG:SOUR?").await
    }

    /// Set the sweep trigger source.
    pub async fn set_trigger_source(&self, source: TriggerSource) -> AppResult<()> {
        self.send(commands::set_trigger_source(source)).await
    }

    /// Software trigger (`*TRG`), effective with [`TriggerSource::Bus`].
    pub async fn send_trigger(&self) -> AppResult<()> {
        self.send(Command::write("*TRG")).await
    }
}

#[async_trait]
impl InstrumentDriver for Agilent33220aDriver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mmw_hardware::mock::SimulatedBus;
    use mmw_hardware::BusSettings;
    use std::time::Duration;

    async fn generator(sim: &SimulatedBus) -> Agilent33220aDriver {
        let settings = BusSettings {
            read_timeout: Duration::from_millis(100),
            flush_timeout: Duration::from_millis(1),
            ..BusSettings::default()
        };
        let bus = Prologix::with_port("sim", Box::new(sim.port()), &settings)
            .await
            .unwrap();
        let mut driver = Agilent33220aDriver::on_bus(bus, DEFAULT_ADDRESS);
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
    fn amplitude_is_two_lines() {
        assert_eq!(
            commands::set_amplitude(5.0).lines(),
            vec!["VOLT:HIGH 5", "VOLT:LOW 0"]
        );
    }

    #[test]
    fn amplitude_unit_uses_the_volt_subsystem() {
        assert_eq!(
            commands::set_voltage_unit(VoltageUnit::Vrms),
            Command::write("VOLT:UNIT VRMS")
        );
    }

    #[test]
    fn mnemonics_parse_case_insensitively() {
        assert_eq!("squ".parse::<Waveform>().unwrap(), Waveform::Square);
        assert_eq!("LOG".parse::<SweepSpacing>().unwrap(), SweepSpacing::Logarithmic);
        assert!("TRI".parse::<Waveform>().is_err());
    }

    #[tokio::test]
    async fn chopper_setup_sequence() {
        let sim = SimulatedBus::new();
        sim.attach(DEFAULT_ADDRESS, |_: &str| None);
        let fg = generator(&sim).await;
        assert_eq!(fg.name(), "Agilent 33220A");

        fg.set_waveform(Waveform::Square).await.unwrap();
        fg.set_amplitude(5.0).await.unwrap();
        fg.set_frequency(5000.0).await.unwrap();
        fg.set_output(true).await.unwrap();

        assert_eq!(
            device_lines(&sim),
            vec!["FUNC SQU", "VOLT:HIGH 5", "VOLT:LOW 0", "FREQ 5000", "OUTP 1"]
        );
    }

    #[tokio::test]
    async fn queries_decode_replies() {
        let sim = SimulatedBus::new();
        sim.attach(DEFAULT_ADDRESS, |cmd: &str| match cmd {
            "FUNC?" => Some(b"SQU\n".to_vec()),
            "FREQ?" => Some(b"+5.000000000000E+03\n".to_vec()),
            "OUTP?" => Some(b"1\n".to_vec()),
            "TRIG:SOUR?" => Some(b"BUS\n".to_vec()),
            _ => None,
        });
        let fg = generator(&sim).await;
        assert_eq!(fg.waveform().await.unwrap(), Waveform::Square);
        assert_eq!(fg.frequency().await.unwrap(), 5000.0);
        assert!(fg.output().await.unwrap());
        assert_eq!(fg.trigger_source().await.unwrap(), TriggerSource::Bus);
    }

    #[tokio::test]
    async fn rejects_out_of_range_frequency() {
        let sim = SimulatedBus::new();
        sim.attach(DEFAULT_ADDRESS, |_: &str| None);
        let fg = generator(&sim).await;
        assert!(matches!(
            fg.set_frequency(0.0).await,
            Err(DaqError::InvalidParameter(_))
        ));
        assert!(device_lines(&sim).is_empty());
    }
}
