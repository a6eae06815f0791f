//! Paced single-parameter sweeps.
//!
//! # Protocol
//!
//! ```text
//! initialize ─▶ configure ─▶ wait load_time ─▶ for each value:
//!                                                 apply value
//!                                                 wait 5 × τ + lock_in_time
//!                                                 SNAP? X,Y
//!                                                 record (value, X, Y)
//!            ─▶ close session ─▶ save (optional)
//! ```
//!
//! A sweep makes one pass with no retries. Any instrument fault ends it with
//! [`DaqError::SweepAborted`]; rows collected up to that point are dropped.
//! The session is closed on every path.

use crate::config::SweepConfig;
use crate::session::Session;
use crate::storage::save_sweep;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mmw_core::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

// =============================================================================
// Results
// =============================================================================

/// One sampled step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRow {
    /// Swept value as applied.
    pub value: f64,
    /// In-phase output, volts.
    pub x: f64,
    /// Quadrature output, volts.
    pub y: f64,
}

impl SweepRow {
    /// `√(x² + y²)`.
    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// `atan2(y, x)` in degrees.
    pub fn phase_degrees(&self) -> f64 {
        self.y.atan2(self.x).to_degrees()
    }
}

/// A completed sweep: one row per requested value, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    /// Name of the swept parameter.
    pub parameter: String,
    /// Settings the instruments were configured with.
    pub config: SweepConfig,
    /// When the first step started.
    pub started_at: DateTime<Utc>,
    /// Sampled rows.
    pub rows: Vec<SweepRow>,
}

impl SweepResult {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// `true` when nothing was swept.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The swept values, in order.
    pub fn values(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.value).collect()
    }
}

// =============================================================================
// Swept parameters
// =============================================================================

/// Something a sweep can step through.
///
/// Implemented by [`SweptParameter`] for the bench's usual knobs; callers can
/// implement it for anything else reachable through the session.
#[async_trait]
pub trait ParameterSetter: Send + Sync {
    /// Name recorded with the result.
    fn name(&self) -> String;

    /// Move the bench to `value`.
    async fn apply(&self, session: &Session, value: f64) -> AppResult<()>;
}

/// The bench parameters a sweep usually steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweptParameter {
    /// Source frequency after the multiplier chain, GHz.
    SourceFrequency,
    /// Synthesizer power, dBm.
    SourcePower,
    /// Chopper frequency, kHz.
    ChopperFrequency,
    /// Chopper amplitude, V.
    ChopperAmplitude,
    /// Lock-in reference phase, degrees.
    ReferencePhase,
}

impl SweptParameter {
    /// Every variant, in CLI order.
    pub const ALL: [SweptParameter; 5] = [
        SweptParameter::SourceFrequency,
        SweptParameter::SourcePower,
        SweptParameter::ChopperFrequency,
        SweptParameter::ChopperAmplitude,
        SweptParameter::ReferencePhase,
    ];

    /// Short name accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            SweptParameter::SourceFrequency => "frequency",
            SweptParameter::SourcePower => "power",
            SweptParameter::ChopperFrequency => "chopper-frequency",
            SweptParameter::ChopperAmplitude => "chopper-amplitude",
            SweptParameter::ReferencePhase => "phase",
        }
    }

    /// Column name with unit, used as the saved parameter name.
    pub fn label(self) -> &'static str {
        match self {
            SweptParameter::SourceFrequency => "source_frequency_ghz",
            SweptParameter::SourcePower => "source_power_dbm",
            SweptParameter::ChopperFrequency => "chopper_frequency_khz",
            SweptParameter::ChopperAmplitude => "chopper_amplitude_volts",
            SweptParameter::ReferencePhase => "reference_phase_deg",
        }
    }
}

impl fmt::Display for SweptParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweptParameter {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted || p.label() == wanted)
            .ok_or_else(|| DaqError::InvalidParameter(format!("unknown swept parameter '{}'", s)))
    }
}

#[async_trait]
impl ParameterSetter for SweptParameter {
    fn name(&self) -> String {
        self.label().to_string()
    }

    async fn apply(&self, session: &Session, value: f64) -> AppResult<()> {
        match self {
            SweptParameter::SourceFrequency => session.set_source_frequency(value).await,
            SweptParameter::SourcePower => session.set_source_power(value).await,
            SweptParameter::ChopperFrequency => session.set_chopper_frequency(value).await,
            SweptParameter::ChopperAmplitude => session.set_chopper_amplitude(value).await,
            SweptParameter::ReferencePhase => session.lock_in().set_reference_phase(value).await,
        }
    }
}

// =============================================================================
// Value lists
// =============================================================================

/// Longest list [`frequency_steps`] builds.
pub const MAX_STEPS: usize = 1_000_000;

/// `start, start + step, …` up to and including `stop`.
///
/// Values are computed as `start + i × step` so long lists do not drift, and
/// `stop` is kept when floating-point error lands it a hair past the end.
///
/// # Errors
///
/// [`DaqError::InvalidParameter`] unless `step` is positive and finite, both
/// ends are finite, and the list has at most [`MAX_STEPS`] values.
pub fn frequency_steps(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if !(step > 0.0 && step.is_finite()) {
        return Err(DaqError::InvalidParameter(format!(
            "step must be positive, got {}",
            step
        )));
    }
    if !(start.is_finite() && stop.is_finite()) {
        return Err(DaqError::InvalidParameter(format!(
            "sweep bounds must be finite, got {}..{}",
            start, stop
        )));
    }
    if stop < start {
        return Ok(Vec::new());
    }
    let tolerance = step * 1e-9;
    let intervals = ((stop - start + tolerance) / step).floor();
    if !(intervals < MAX_STEPS as f64) {
        return Err(DaqError::InvalidParameter(format!(
            "{}..{} in steps of {} is more than {} values",
            start, stop, step, MAX_STEPS
        )));
    }
    let count = intervals as usize + 1;
    Ok((0..count).map(|i| start + i as f64 * step).collect())
}

// =============================================================================
// Orchestration
// =============================================================================

/// Push `config` to every instrument once.
///
/// Order: multiplier, synthesizer frequency/power/output, chopper
/// amplitude/frequency/output, lock-in time constant/sensitivity/slope.
pub async fn configure(session: &mut Session, config: &SweepConfig) -> AppResult<()> {
    session.set_frequency_multiplier(config.frequency_multiplier)?;

    session
        .set_source_frequency(config.synthesizer_frequency_ghz)
        .await?;
    session.set_source_power(config.power_dbm).await?;
    session.set_source_enabled(true).await?;

    session
        .set_chopper_amplitude(config.chopper_amplitude_volts)
        .await?;
    session
        .set_chopper_frequency(config.chopper_frequency_khz)
        .await?;
    session.set_chopper_enabled(true).await?;

    let time_constant = session.set_time_constant(config.time_constant_ms).await?;
    let sensitivity = session.set_sensitivity(config.sensitivity_volts).await?;
    let slope = session.set_low_pass_slope(config.slope_db_per_octave).await?;

    info!(
        "Sweep configured: τ = {} ms, sensitivity = {} V, slope = {} dB/oct",
        time_constant, sensitivity, slope
    );
    Ok(())
}

/// Initialize and configure the bench, step `parameter` through `values`, then
/// close the session and optionally save the result to `save_path`.
///
/// # Errors
///
/// - `DaqError::Configuration` if `config` fails validation; nothing is sent.
/// - `DaqError::SweepAborted` if a step fails.
/// - Any initialization or configuration error as-is.
///
/// A failed save is logged and the result is still returned, so the rows can
/// be saved again by the caller.
pub async fn sweep<P>(
    session: &mut Session,
    parameter: &P,
    values: &[f64],
    config: &SweepConfig,
    save_path: Option<&Path>,
) -> AppResult<SweepResult>
where
    P: ParameterSetter + ?Sized,
{
    config.validate().map_err(DaqError::Configuration)?;
    let settle = config.settle_time()?;

    let outcome = run_sweep(session, parameter, values, config, settle).await;
    if let Err(e) = session.close().await {
        warn!("Teardown after sweep failed: {}", e);
    }
    let result = outcome?;

    if let Some(path) = save_path {
        save_or_log(path, &result);
    }
    Ok(result)
}

/// Save `result`, logging instead of failing so completed rows are never lost.
pub(crate) fn save_or_log(path: &Path, result: &SweepResult) {
    match save_sweep(path, result) {
        Ok(()) => info!("Saved {} rows to {}", result.len(), path.display()),
        Err(e) => error!("{} rows were not saved: {}", result.len(), e),
    }
}

async fn run_sweep<P>(
    session: &mut Session,
    parameter: &P,
    values: &[f64],
    config: &SweepConfig,
    settle: Duration,
) -> AppResult<SweepResult>
where
    P: ParameterSetter + ?Sized,
{
    session.initialize().await?;
    configure(session, config).await?;

    info!("Waiting {:?} for instruments to settle", config.load_time);
    tokio::time::sleep(config.load_time).await;

    let name = parameter.name();
    let started_at = Utc::now();
    let mut rows = Vec::with_capacity(values.len());

    for (step, &value) in values.iter().enumerate() {
        info!("At sweep value {} ({}/{})", value, step + 1, values.len());
        let row = sample_step(session, parameter, value, settle)
            .await
            .map_err(|source| DaqError::SweepAborted {
                step,
                value,
                source: Box::new(source),
            })?;
        rows.push(row);
    }

    Ok(SweepResult {
        parameter: name,
        config: config.clone(),
        started_at,
        rows,
    })
}

async fn sample_step<P>(
    session: &Session,
    parameter: &P,
    value: f64,
    settle: Duration,
) -> AppResult<SweepRow>
where
    P: ParameterSetter + ?Sized,
{
    parameter.apply(session, value).await?;
    tokio::time::sleep(settle).await;
    let (x, y) = session.snap_xy().await?;
    Ok(SweepRow { value, x, y })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::testing::{bench, device_lines, SimulatedBench};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fast_config() -> SweepConfig {
        SweepConfig {
            time_constant_ms: 100.0,
            lock_in_time: Duration::ZERO,
            load_time: Duration::from_secs(5),
            ..SweepConfig::default()
        }
    }

    #[test]
    fn frequency_steps_include_end_point() {
        assert_eq!(
            frequency_steps(225.0, 275.0, 25.0).unwrap(),
            vec![225.0, 250.0, 275.0]
        );
        let fine = frequency_steps(12.5, 16.5, 0.05).unwrap();
        assert_eq!(fine.len(), 81);
        assert!((fine[80] - 16.5).abs() < 1e-9);
    }

    #[test]
    fn frequency_steps_edge_cases() {
        assert_eq!(frequency_steps(5.0, 5.0, 1.0).unwrap(), vec![5.0]);
        assert!(frequency_steps(5.0, 4.0, 1.0).unwrap().is_empty());
        assert!(frequency_steps(0.0, 1.0, 0.0).is_err());
        assert!(frequency_steps(0.0, 1.0, -0.1).is_err());
    }

    #[test]
    fn frequency_steps_refuse_unbounded_lists() {
        for (start, stop, step) in [
            (0.0, f64::INFINITY, 1.0),
            (f64::NEG_INFINITY, 0.0, 1.0),
            (f64::NAN, 1.0, 1.0),
            (0.0, 1e300, 1.0),
            (0.0, 1.0, 1e-9),
        ] {
            let err = frequency_steps(start, stop, step).unwrap_err();
            assert!(matches!(err, DaqError::InvalidParameter(_)));
        }
        assert_eq!(
            frequency_steps(0.0, (MAX_STEPS - 1) as f64, 1.0).unwrap().len(),
            MAX_STEPS
        );
    }

    #[test]
    fn parameter_names_parse() {
        for p in SweptParameter::ALL {
            assert_eq!(p.as_str().parse::<SweptParameter>().unwrap(), p);
            assert_eq!(p.label().parse::<SweptParameter>().unwrap(), p);
        }
        assert!("voltage".parse::<SweptParameter>().is_err());
    }

    #[test]
    fn row_magnitude_and_phase() {
        let row = SweepRow {
            value: 1.0,
            x: 3.0,
            y: 4.0,
        };
        assert_eq!(row.magnitude(), 5.0);
        let quadrature = SweepRow {
            value: 1.0,
            x: 0.0,
            y: 2.0,
        };
        assert!((quadrature.phase_degrees() - 90.0).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_returns_one_row_per_value_in_order() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let values = [225.0, 250.0, 275.0];

        let result = sweep(
            &mut session,
            &SweptParameter::SourceFrequency,
            &values,
            &fast_config(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.values(), values.to_vec());
        assert_eq!(result.parameter, "source_frequency_ghz");
        for row in &result.rows {
            // The simulated lock-in reports the synthesizer frequency as X.
            assert!((row.x - row.value / 18.0).abs() < 1e-9);
            assert!((row.y + row.value / 36.0).abs() < 1e-9);
        }
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn each_step_waits_five_time_constants() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let config = fast_config();

        let start = tokio::time::Instant::now();
        sweep(
            &mut session,
            &SweptParameter::SourceFrequency,
            &[225.0, 250.0, 275.0],
            &config,
            None,
        )
        .await
        .unwrap();
        let elapsed = start.elapsed();

        // load_time + 3 × (5 × 100 ms + 0), plus the bus flush windows.
        let paced = config.load_time + Duration::from_millis(1500);
        assert!(elapsed >= paced, "elapsed {:?}", elapsed);
        assert!(elapsed < paced + Duration::from_millis(500), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn each_step_is_logged() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        sweep(
            &mut session,
            &SweptParameter::SourcePower,
            &[3.0, 6.0],
            &fast_config(),
            None,
        )
        .await
        .unwrap();

        assert!(logs_contain("At sweep value 3 (1/2)"));
        assert!(logs_contain("At sweep value 6 (2/2)"));
        assert!(logs_contain("Sweep configured"));
    }

    #[tokio::test(start_paused = true)]
    async fn configure_pushes_every_setting_once() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        sweep(
            &mut session,
            &SweptParameter::ChopperFrequency,
            &[],
            &fast_config(),
            None,
        )
        .await
        .unwrap();

        let lock_in = device_lines(&sim.bus, 8);
        let tail: Vec<&str> = lock_in.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["OFLT 8", "SENS 20", "OFSL 1"]);

        let generator = device_lines(&sim.bus, 10);
        let tail: Vec<&str> = generator.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["VOLT:HIGH 5", "VOLT:LOW 0", "FREQ 5000", "OUTP 1"]);

        let usb = sim.usb.transcript();
        let set: Vec<&str> = usb
            .iter()
            .map(String::as_str)
            .filter(|l| l.starts_with("FREQ:SET") || l.starts_with("POWE:"))
            .collect();
        let frequency = format!("FREQ:SET {};", 250.0 / 18.0);
        assert_eq!(
            set,
            vec!["POWE:RF 0;", frequency.as_str(), "POWE:SET 15;", "POWE:RF 1;"]
        );
        assert_eq!(sim.snap_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_sweep_fault_aborts_and_still_closes() {
        let sim = SimulatedBench::failing_after(Some(1));
        let mut session = bench(&sim).await;

        let err = sweep(
            &mut session,
            &SweptParameter::SourceFrequency,
            &[225.0, 250.0, 275.0],
            &fast_config(),
            None,
        )
        .await
        .unwrap_err();

        match err {
            DaqError::SweepAborted { step, value, .. } => {
                assert_eq!(step, 1);
                assert_eq!(value, 250.0);
            }
            other => panic!("expected SweepAborted, got {:?}", other),
        }
        assert_eq!(sim.snap_count(), 2);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_band_value_aborts_before_sampling() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;

        // 400 GHz / 18 is above the synthesizer's range.
        let err = sweep(
            &mut session,
            &SweptParameter::SourceFrequency,
            &[250.0, 400.0],
            &fast_config(),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DaqError::SweepAborted { step: 1, .. }));
        assert_eq!(sim.snap_count(), 1);
    }

    #[tokio::test]
    async fn invalid_config_sends_nothing() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let config = SweepConfig {
            time_constant_ms: 0.0,
            ..SweepConfig::default()
        };

        let err = sweep(&mut session, &SweptParameter::SourcePower, &[1.0], &config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(device_lines(&sim.bus, 8).is_empty());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn infinite_time_constant_is_rejected_before_anything_is_sent() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let config = SweepConfig {
            time_constant_ms: f64::INFINITY,
            ..SweepConfig::default()
        };

        let err = sweep(&mut session, &SweptParameter::SourcePower, &[1.0], &config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(device_lines(&sim.bus, 8).is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_save_still_returns_rows() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("sweep.csv");

        let result = sweep(
            &mut session,
            &SweptParameter::SourcePower,
            &[3.0, 6.0],
            &fast_config(),
            Some(&path),
        )
        .await
        .unwrap();

        assert_eq!(result.values(), vec![3.0, 6.0]);
        assert!(!path.exists());
        assert!(logs_contain("2 rows were not saved"));
    }

    struct PhaseByTen;

    #[async_trait]
    impl ParameterSetter for PhaseByTen {
        fn name(&self) -> String {
            "phase_tenths".into()
        }

        async fn apply(&self, session: &Session, value: f64) -> AppResult<()> {
            session.lock_in().set_reference_phase(value / 10.0).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caller_supplied_setter_is_used() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let result = sweep(&mut session, &PhaseByTen, &[100.0, 200.0], &fast_config(), None)
            .await
            .unwrap();

        assert_eq!(result.parameter, "phase_tenths");
        let phases: Vec<String> = device_lines(&sim.bus, 8)
            .into_iter()
            .filter(|l| l.starts_with("PHAS "))
            .collect();
        assert_eq!(phases, vec!["PHAS 10", "PHAS 20"]);
    }
}
