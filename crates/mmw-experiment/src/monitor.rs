//! Time-series monitoring: sample `(X, Y)` at a fixed interval with every
//! setting held.
//!
//! A monitor is a sweep over elapsed time. It shares the sweep's lifecycle
//! (initialize, configure, wait `load_time`, sample, close, save) and its
//! result type, with the row `value` holding seconds since the first sample.

use crate::config::SweepConfig;
use crate::session::Session;
use crate::sweep::{configure, save_or_log, SweepResult, SweepRow};
use chrono::Utc;
use mmw_core::{AppResult, DaqError};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Parameter name recorded for monitor results.
pub const ELAPSED_PARAMETER: &str = "elapsed_s";

/// Sample every `interval` until `duration` has passed, counting the sample
/// at zero and the one landing exactly on `duration`.
///
/// Samples are scheduled against the start time, so a slow exchange does not
/// push later samples back.
///
/// # Errors
///
/// - `DaqError::InvalidParameter` for a zero `interval`, or for more samples
///   than fit in a `u32`.
/// - `DaqError::Configuration` if `config` fails validation.
/// - `DaqError::SweepAborted` if a sample fails; `value` is its elapsed time.
///
/// A failed save is logged and the result is still returned.
pub async fn monitor(
    session: &mut Session,
    config: &SweepConfig,
    interval: Duration,
    duration: Duration,
    save_path: Option<&Path>,
) -> AppResult<SweepResult> {
    if interval.is_zero() {
        return Err(DaqError::InvalidParameter(
            "monitor interval must be positive".into(),
        ));
    }
    config.validate().map_err(DaqError::Configuration)?;
    let samples = sample_count(interval, duration)?;

    let outcome = run_monitor(session, config, interval, duration, samples).await;
    if let Err(e) = session.close().await {
        warn!("Teardown after monitor failed: {}", e);
    }
    let result = outcome?;

    if let Some(path) = save_path {
        save_or_log(path, &result);
    }
    Ok(result)
}

/// Samples at `0, interval, 2 × interval, …` up to and including `duration`.
fn sample_count(interval: Duration, duration: Duration) -> AppResult<u32> {
    u32::try_from(duration.as_nanos() / interval.as_nanos())
        .ok()
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| {
            DaqError::InvalidParameter(format!(
                "{:?} every {:?} is too many samples",
                duration, interval
            ))
        })
}

async fn run_monitor(
    session: &mut Session,
    config: &SweepConfig,
    interval: Duration,
    duration: Duration,
    samples: u32,
) -> AppResult<SweepResult> {
    session.initialize().await?;
    configure(session, config).await?;
    tokio::time::sleep(config.load_time).await;

    info!(
        "Monitoring for {:?}: {} samples every {:?}",
        duration, samples, interval
    );

    let started_at = Utc::now();
    let start = Instant::now();
    let mut rows = Vec::with_capacity(samples as usize);

    for step in 0..samples {
        let due = start.checked_add(interval * step).ok_or_else(|| {
            DaqError::InvalidParameter(format!("sample {} is too far in the future", step))
        })?;
        tokio::time::sleep_until(due).await;
        let elapsed = start.elapsed().as_secs_f64();
        let (x, y) = session
            .snap_xy()
            .await
            .map_err(|source| DaqError::SweepAborted {
                step: step as usize,
                value: elapsed,
                source: Box::new(source),
            })?;
        rows.push(SweepRow {
            value: elapsed,
            x,
            y,
        });
    }

    Ok(SweepResult {
        parameter: ELAPSED_PARAMETER.to_string(),
        config: config.clone(),
        started_at,
        rows,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::storage::load_sweep;
    use crate::testing::{bench, SimulatedBench};

    fn quick() -> SweepConfig {
        SweepConfig {
            load_time: Duration::from_secs(1),
            ..SweepConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_on_the_interval_grid() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;

        let result = monitor(
            &mut session,
            &quick(),
            Duration::from_secs(30),
            Duration::from_secs(90),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.parameter, ELAPSED_PARAMETER);
        assert_eq!(result.len(), 4);
        for (k, row) in result.rows.iter().enumerate() {
            let expected = 30.0 * k as f64;
            assert!(
                row.value >= expected && row.value < expected + 0.5,
                "sample {} at {}",
                k,
                row.value
            );
        }
        assert_eq!(sim.snap_count(), 4);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn result_is_saved_when_asked() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.csv");

        let result = monitor(
            &mut session,
            &quick(),
            Duration::from_secs(10),
            Duration::from_secs(10),
            Some(&path),
        )
        .await
        .unwrap();

        let loaded = load_sweep(&path).unwrap();
        assert_eq!(loaded.rows, result.rows);
        assert_eq!(loaded.parameter, ELAPSED_PARAMETER);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sample_aborts() {
        let sim = SimulatedBench::failing_after(Some(2));
        let mut session = bench(&sim).await;

        let err = monitor(
            &mut session,
            &quick(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DaqError::SweepAborted { step: 2, .. }));
        assert!(session.is_closed());
    }

    #[test]
    fn sample_count_includes_both_ends() {
        let count = sample_count(Duration::from_secs(30), Duration::from_secs(90)).unwrap();
        assert_eq!(count, 4);
        assert_eq!(
            sample_count(Duration::from_secs(30), Duration::from_secs(89)).unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn too_many_samples_are_rejected_before_anything_is_sent() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let err = monitor(
            &mut session,
            &quick(),
            Duration::from_nanos(1),
            Duration::from_secs(3600),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DaqError::InvalidParameter(_)));
        assert!(crate::testing::device_lines(&sim.bus, 8).is_empty());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let sim = SimulatedBench::new();
        let mut session = bench(&sim).await;
        let err = monitor(
            &mut session,
            &quick(),
            Duration::ZERO,
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DaqError::InvalidParameter(_)));
    }
}
