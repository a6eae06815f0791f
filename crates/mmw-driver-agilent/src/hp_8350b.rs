//! HP 8350B sweep oscillator.
//!
//! GPIB through the shared Prologix controller. HP-IB two-letter codes, each
//! numeric argument followed by a unit code (`GZ`, `MZ`, `KZ`, `HZ` for
//! frequency, `SC`, `MS` for time). `OP xx` queries return base units.

use async_trait::async_trait;
use mmw_core::{AppResult, DaqError};
use mmw_hardware::{Command, Instrument, InstrumentDriver, Prologix};
use std::sync::Arc;
use tracing::instrument;

/// Frequency unit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyUnit {
    /// `GZ`
    GHz,
    /// `MZ`
    MHz,
    /// `KZ`
    KHz,
    /// `HZ`
    Hz,
}

impl FrequencyUnit {
    /// HP-IB unit code.
    pub fn code(self) -> &'static str {
        match self {
            FrequencyUnit::GHz => "GZ",
            FrequencyUnit::MHz => "MZ",
            FrequencyUnit::KHz => "KZ",
            FrequencyUnit::Hz => "HZ",
        }
    }
}

/// Sweep time unit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// `SC`
    Seconds,
    /// `MS`
    Milliseconds,
}

impl TimeUnit {
    /// HP-IB unit code.
    pub fn code(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "SC",
            TimeUnit::Milliseconds => "MS",
        }
    }
}

/// A frequency with the unit it is sent in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frequency {
    /// Magnitude.
    pub value: f64,
    /// Unit.
    pub unit: FrequencyUnit,
}

impl Frequency {
    /// `value` GHz.
    pub fn ghz(value: f64) -> Self {
        Self {
            value,
            unit: FrequencyUnit::GHz,
        }
    }

    /// `value` MHz.
    pub fn mhz(value: f64) -> Self {
        Self {
            value,
            unit: FrequencyUnit::MHz,
        }
    }

    fn wire(self) -> String {
        format!("{}{}", self.value, self.unit.code())
    }
}

/// Builders for the HP-IB codes the driver sends.
pub mod commands {
    use super::*;

    /// `FA <f>` then `FB <f>`
    pub fn start_stop_sweep(start: Frequency, stop: Frequency) -> Command {
        Command::write_all([format!("FA {}", start.wire()), format!("FB {}", stop.wire())])
    }

    /// `CF <f>` then `DF <f>`
    pub fn center_sweep(center: Frequency, width: Frequency) -> Command {
        Command::write_all([format!("CF {}", center.wire()), format!("DF {}", width.wire())])
    }

    /// `CW <f>`
    pub fn continuous_wave(frequency: Frequency) -> Command {
        Command::write(format!("CW {}", frequency.wire()))
    }

    /// `ST <t><unit>`
    pub fn set_sweep_time(time: f64, unit: TimeUnit) -> Command {
        Command::write(format!("ST {}{}", time, unit.code()))
    }

    /// `PL <dbm>`
    pub fn set_power_level(dbm: f64) -> Command {
        Command::write(format!("PL {}", dbm))
    }

    /// `T1`
    pub fn trigger_internal() -> Command {
        Command::write("T1")
    }

    /// `T3`
    pub fn trigger_external() -> Command {
        Command::write("T3")
    }

    /// `T1` then `T4`, so arming single mode does not fire the previous mode.
    pub fn trigger_single_mode() -> Command {
        Command::write_all(["T1", "T4"])
    }

    /// `T4`
    pub fn single_trigger() -> Command {
        Command::write("T4")
    }

    /// `OP <code>`
    pub fn output(code: &str) -> Command {
        Command::query(format!("OP {}", code))
    }
}

/// HP 8350B driver.
#[derive(Debug)]
pub struct Hp8350bDriver {
    instrument: Instrument,
}

impl Hp8350bDriver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Driver for the sweeper at `address` on `controller`.
    pub fn on_bus(controller: Arc<Prologix>, address: u8) -> Self {
        Self::new(Instrument::gpib(controller, address).with_name("HP 8350B"))
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.instrument.send(&command).await
    }

    async fn output(&self, code: &str) -> AppResult<f64> {
        self.instrument.ask_number(&commands::output(code)).await
    }

    /// Sweep from `start` to `stop`.
    #[instrument(skip(self), err)]
    pub async fn start_stop_sweep(&self, start: Frequency, stop: Frequency) -> AppResult<()> {
        self.send(commands::start_stop_sweep(start, stop)).await
    }

    /// Sweep `width` around `center`.
    #[instrument(skip(self), err)]
    pub async fn center_sweep(&self, center: Frequency, width: Frequency) -> AppResult<()> {
        self.send(commands::center_sweep(center, width)).await
    }

    /// Hold a single frequency.
    #[instrument(skip(self), err)]
    pub async fn continuous_wave(&self, frequency: Frequency) -> AppResult<()> {
        self.send(commands::continuous_wave(frequency)).await
    }

    /// Start frequency in Hz.
    pub async fn frequency_start(&self) -> AppResult<f64> {
        self.output("FA").await
    }

    /// Stop frequency in Hz.
    pub async fn frequency_stop(&self) -> AppResult<f64> {
        self.output("FB").await
    }

    /// Centre frequency in Hz.
    pub async fn frequency_center(&self) -> AppResult<f64> {
        self.output("CF").await
    }

    /// Sweep width in Hz.
    pub async fn frequency_width(&self) -> AppResult<f64> {
        self.output("DF").await
    }

    /// CW frequency in Hz.
    pub async fn continuous_wave_frequency(&self) -> AppResult<f64> {
        self.output("CW").await
    }

    /// Time per sweep.
    pub async fn set_sweep_time(&self, time: f64, unit: TimeUnit) -> AppResult<()> {
        if time <= 0.0 {
            return Err(DaqError::InvalidParameter(format!(
                "sweep time {} must be positive",
                time
            )));
        }
        self.send(commands::set_sweep_time(time, unit)).await
    }

    /// Sweep time in seconds.
    pub async fn sweep_time(&self) -> AppResult<f64> {
        self.output("ST").await
    }

    /// Output power in dBm.
    pub async fn set_power_level(&self, dbm: f64) -> AppResult<()> {
        self.send(commands::set_power_level(dbm)).await
    }

    /// Output power in dBm.
    pub async fn power_level(&self) -> AppResult<f64> {
        self.output("PL").await
    }

    /// Sweeps triggered by the internal clock.
    pub async fn set_trigger_internal(&self) -> AppResult<()> {
        self.send(commands::trigger_internal()).await
    }

    /// Sweeps triggered externally.
    pub async fn set_trigger_external(&self) -> AppResult<()> {
        self.send(commands::trigger_external()).await
    }

    /// Sweeps triggered by [`single_trigger`](Self::single_trigger) only.
    pub async fn set_trigger_single(&self) -> AppResult<()> {
        self.send(commands::trigger_single_mode()).await
    }

    /// Fire one sweep in single mode.
    pub async fn single_trigger(&self) -> AppResult<()> {
        self.send(commands::single_trigger()).await
    }

    /// Reset the current sweep.
    pub async fn reset_sweep(&self) -> AppResult<()> {
        self.send(Command::write("RS")).await
    }

    /// Take a new sweep.
    pub async fn take_sweep(&self) -> AppResult<()> {
        self.send(Command::write("TS")).await
    }
}

#[async_trait]
impl InstrumentDriver for Hp8350bDriver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    async fn initialize_instrument(&self) -> AppResult<()> {
        self.send(Command::write("REN")).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mmw_hardware::mock::SimulatedBus;
    use mmw_hardware::BusSettings;
    use std::time::Duration;

    async fn sweeper(sim: &SimulatedBus, address: u8) -> Hp8350bDriver {
        let settings = BusSettings {
            read_timeout: Duration::from_millis(100),
            flush_timeout: Duration::from_millis(1),
            ..BusSettings::default()
        };
        let bus = Prologix::with_port("sim", Box::new(sim.port()), &settings)
            .await
            .unwrap();
        let mut driver = Hp8350bDriver::on_bus(bus, address);
        driver.open().await.unwrap();
        driver
    }

    #[test]
    fn sweep_commands_carry_units() {
        assert_eq!(
            commands::start_stop_sweep(Frequency::ghz(11.0), Frequency::ghz(13.0)).lines(),
            vec!["FA 11GZ", "FB 13GZ"]
        );
        assert_eq!(
            commands::center_sweep(Frequency::ghz(12.0), Frequency::mhz(500.0)).lines(),
            vec!["CF 12GZ", "DF 500MZ"]
        );
        assert_eq!(
            commands::set_sweep_time(0.01, TimeUnit::Seconds),
            Command::write("ST 0.01SC")
        );
    }

    #[tokio::test]
    async fn initialization_enables_remote() {
        let sim = SimulatedBus::new();
        sim.attach(19, |_: &str| None);
        let hp = sweeper(&sim, 19).await;
        hp.initialize_instrument().await.unwrap();
        hp.set_trigger_single().await.unwrap();
        let lines: Vec<String> = sim
            .transcript()
            .into_iter()
            .filter(|l| !l.starts_with("++"))
            .collect();
        assert_eq!(lines, vec!["REN", "T1", "T4"]);
    }

    #[tokio::test]
    async fn output_queries_return_base_units() {
        let sim = SimulatedBus::new();
        sim.attach(19, |cmd: &str| match cmd {
            "OP CW" => Some(b"12000000000\n".to_vec()),
            "OP PL" => Some(b"5.5\n".to_vec()),
            _ => None,
        });
        let hp = sweeper(&sim, 19).await;
        assert_eq!(hp.continuous_wave_frequency().await.unwrap(), 12e9);
        assert_eq!(hp.power_level().await.unwrap(), 5.5);
    }
}
