//! Bench-level orchestration for the mm-wave transmission bench.
//!
//! - [`config`]: figment-loaded [`BenchConfig`]
//! - [`session`]: the [`Session`] owning every instrument
//! - [`sweep`]: paced single-parameter sweeps
//! - [`monitor`]: fixed-interval sampling over time
//! - [`analysis`]: magnitude, phase and reference normalization
//! - [`storage`]: sweep files on disk

pub mod analysis;
pub mod config;
pub mod monitor;
pub mod session;
pub mod storage;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use analysis::{response, subtract_reference, Response};
pub use config::{BenchConfig, InstrumentSettings, SweepConfig};
pub use monitor::monitor;
pub use session::Session;
pub use storage::{load_sweep, save_sweep};
pub use sweep::{
    configure, frequency_steps, sweep, ParameterSetter, SweepResult, SweepRow, SweptParameter,
};
