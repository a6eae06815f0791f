//! Bench configuration using Figment.
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults (the settings the bench normally runs with)
//! 2. an optional TOML file, `bench.toml` by convention
//! 3. environment variables prefixed with `MMW_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use mmw_experiment::config::BenchConfig;
//!
//! let config = BenchConfig::load(Some("bench.toml".as_ref()))?;
//! println!("Prologix on {}", config.bus.port);
//! # Ok::<(), mmw_core::DaqError>(())
//! ```
//!
//! Example override: `MMW_SWEEP__TIME_CONSTANT_MS=100`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use mmw_core::{AppResult, DaqError};
use mmw_hardware::BusSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest primary GPIB address.
const MAX_GPIB_ADDRESS: u8 = 30;

/// Longest SR830 time constant, 30 ks.
const MAX_TIME_CONSTANT_MS: f64 = 3e7;

/// Top-level bench configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BenchConfig {
    /// Prologix serial settings.
    #[serde(default)]
    pub bus: BusSettings,
    /// Where each instrument lives.
    #[serde(default)]
    pub instruments: InstrumentSettings,
    /// Measurement settings applied at the start of a sweep.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Instrument addresses and device files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// SR830 GPIB address.
    pub lock_in_address: u8,
    /// Agilent 33220A GPIB address.
    pub function_generator_address: u8,
    /// PE11S390 USB-TMC device file.
    pub synthesizer_path: PathBuf,
    /// Read timeout on the synthesizer device file.
    #[serde(with = "humantime_serde")]
    pub usb_timeout: Duration,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            lock_in_address: mmw_driver_srs::sr830::DEFAULT_ADDRESS,
            function_generator_address: mmw_driver_agilent::agilent_33220a::DEFAULT_ADDRESS,
            synthesizer_path: PathBuf::from(mmw_driver_pasternack::pe11s390::DEFAULT_PATH),
            usb_timeout: Duration::from_secs(1),
        }
    }
}

/// Settings pushed to every instrument once, before the first sweep step.
///
/// Saved alongside every sweep so a file describes how it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Requested lock-in time constant in ms. Also sets the per-step settle time.
    pub time_constant_ms: f64,
    /// Requested lock-in full-scale sensitivity in volts.
    pub sensitivity_volts: f64,
    /// Requested low-pass slope in dB/octave.
    pub slope_db_per_octave: f64,
    /// Wait after configuring, before the first step.
    #[serde(with = "humantime_serde")]
    pub load_time: Duration,
    /// Extra wait per step for the lock-in to re-acquire the reference.
    #[serde(with = "humantime_serde")]
    pub lock_in_time: Duration,
    /// Chopper square wave high level in volts.
    pub chopper_amplitude_volts: f64,
    /// Chopper frequency in kHz.
    pub chopper_frequency_khz: f64,
    /// Synthesizer output power in dBm.
    pub power_dbm: f64,
    /// Source frequency at the multiplier chain output, in GHz.
    pub synthesizer_frequency_ghz: f64,
    /// Product of all frequency multipliers between synthesizer and sample.
    pub frequency_multiplier: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            time_constant_ms: 10.0,
            sensitivity_volts: 0.01,
            slope_db_per_octave: 12.0,
            load_time: Duration::from_secs(5),
            lock_in_time: Duration::from_secs(1),
            chopper_amplitude_volts: 5.0,
            chopper_frequency_khz: 5.0,
            power_dbm: 15.0,
            synthesizer_frequency_ghz: 250.0,
            frequency_multiplier: 18.0,
        }
    }
}

impl SweepConfig {
    /// Wait between applying a value and sampling: five time constants plus
    /// the lock-in re-acquisition time.
    ///
    /// # Errors
    ///
    /// `DaqError::Configuration` when the wait cannot be represented, which
    /// [`validate`](Self::validate) rules out.
    pub fn settle_time(&self) -> AppResult<Duration> {
        let filter = Duration::try_from_secs_f64(self.time_constant_ms * 5.0 / 1000.0)
            .map_err(|e| {
                DaqError::Configuration(format!(
                    "time constant {} ms gives no usable settle time: {}",
                    self.time_constant_ms, e
                ))
            })?;
        filter.checked_add(self.lock_in_time).ok_or_else(|| {
            DaqError::Configuration("settle time overflows".to_string())
        })
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("sweep.sensitivity_volts", self.sensitivity_volts),
            ("sweep.slope_db_per_octave", self.slope_db_per_octave),
            ("sweep.chopper_amplitude_volts", self.chopper_amplitude_volts),
            ("sweep.chopper_frequency_khz", self.chopper_frequency_khz),
            ("sweep.power_dbm", self.power_dbm),
            ("sweep.synthesizer_frequency_ghz", self.synthesizer_frequency_ghz),
            ("sweep.frequency_multiplier", self.frequency_multiplier),
        ] {
            if !value.is_finite() {
                return Err(format!("{} must be finite, got {}", name, value));
            }
        }
        if !(self.time_constant_ms > 0.0 && self.time_constant_ms <= MAX_TIME_CONSTANT_MS) {
            return Err(format!(
                "sweep.time_constant_ms must be in (0, {}], got {}",
                MAX_TIME_CONSTANT_MS, self.time_constant_ms
            ));
        }
        if !(self.sensitivity_volts > 0.0) {
            return Err(format!(
                "sweep.sensitivity_volts must be positive, got {}",
                self.sensitivity_volts
            ));
        }
        if !(self.frequency_multiplier > 0.0) {
            return Err(format!(
                "sweep.frequency_multiplier must be positive, got {}",
                self.frequency_multiplier
            ));
        }
        if !(self.chopper_frequency_khz > 0.0) {
            return Err(format!(
                "sweep.chopper_frequency_khz must be positive, got {}",
                self.chopper_frequency_khz
            ));
        }
        self.settle_time().map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl BenchConfig {
    /// Defaults, then `path` if given, then `MMW_` environment variables.
    ///
    /// # Errors
    ///
    /// `DaqError::Config` if a source cannot be parsed, `DaqError::Configuration`
    /// if the merged values fail [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(BenchConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("MMW_").split("__")))
    }

    /// Extract and validate from an assembled figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: BenchConfig = figment.extract()?;
        config.validate().map_err(DaqError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        self.bus.validate()?;

        for (name, address) in [
            ("instruments.lock_in_address", self.instruments.lock_in_address),
            (
                "instruments.function_generator_address",
                self.instruments.function_generator_address,
            ),
        ] {
            if address > MAX_GPIB_ADDRESS {
                return Err(format!(
                    "{} {} outside 0..={}",
                    name, address, MAX_GPIB_ADDRESS
                ));
            }
        }
        if self.instruments.lock_in_address == self.instruments.function_generator_address {
            return Err(format!(
                "lock-in and function generator share GPIB address {}",
                self.instruments.lock_in_address
            ));
        }

        self.sweep.validate()
    }
}
