//! Sweep files.
//!
//! A sweep file is plain CSV preceded by a metadata block. Every metadata line
//! starts with `# ` and together they hold pretty-printed JSON:
//!
//! ```text
//! # {
//! #   "parameter": "source_frequency_ghz",
//! #   "recorded_at": "2026-03-02T14:07:11.532Z",
//! #   "points": 3,
//! #   "settings": { "time_constant_ms": 100.0, ... }
//! # }
//! value,x,y
//! 225.0,0.0012,-0.0004
//! ...
//! ```
//!
//! Any CSV reader that skips `#` comments reads the table directly.

use crate::config::SweepConfig;
use crate::sweep::{SweepResult, SweepRow};
use chrono::{DateTime, Utc};
use mmw_core::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

const METADATA_PREFIX: &str = "# ";

#[derive(Debug, Serialize, Deserialize)]
struct SweepMetadata {
    parameter: String,
    recorded_at: DateTime<Utc>,
    points: usize,
    settings: SweepConfig,
}

fn persist_error(path: &Path, e: impl std::fmt::Display) -> DaqError {
    DaqError::Persist(format!("{}: {}", path.display(), e))
}

/// Write `result` to `path`, replacing any existing file.
pub fn save_sweep(path: &Path, result: &SweepResult) -> AppResult<()> {
    let metadata = SweepMetadata {
        parameter: result.parameter.clone(),
        recorded_at: result.started_at,
        points: result.rows.len(),
        settings: result.config.clone(),
    };
    let json = serde_json::to_string_pretty(&metadata).map_err(|e| persist_error(path, e))?;

    let file = File::create(path).map_err(|e| persist_error(path, e))?;
    let mut out = BufWriter::new(file);
    for line in json.lines() {
        writeln!(out, "{}{}", METADATA_PREFIX, line).map_err(|e| persist_error(path, e))?;
    }

    let mut writer = csv::Writer::from_writer(out);
    if result.rows.is_empty() {
        writer
            .write_record(["value", "x", "y"])
            .map_err(|e| persist_error(path, e))?;
    }
    for row in &result.rows {
        writer.serialize(row).map_err(|e| persist_error(path, e))?;
    }
    writer.flush().map_err(|e| persist_error(path, e))?;

    debug!("Wrote {} rows to {}", result.rows.len(), path.display());
    Ok(())
}

/// Read a file written by [`save_sweep`].
///
/// # Errors
///
/// `DaqError::Persist` when the file is missing, the metadata is not valid
/// JSON, a row does not parse, or the row count disagrees with the metadata.
pub fn load_sweep(path: &Path) -> AppResult<SweepResult> {
    let file = File::open(path).map_err(|e| persist_error(path, e))?;
    let mut json = String::new();
    let mut table = String::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| persist_error(path, e))?;
        match line.strip_prefix(METADATA_PREFIX) {
            Some(meta) if table.is_empty() => {
                json.push_str(meta);
                json.push('\n');
            }
            _ => {
                table.push_str(&line);
                table.push('\n');
            }
        }
    }

    let metadata: SweepMetadata =
        serde_json::from_str(&json).map_err(|e| persist_error(path, format!("metadata: {}", e)))?;

    let mut reader = csv::Reader::from_reader(table.as_bytes());
    let rows = reader
        .deserialize::<SweepRow>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| persist_error(path, e))?;

    if rows.len() != metadata.points {
        return Err(persist_error(
            path,
            format!("metadata lists {} points, table has {}", metadata.points, rows.len()),
        ));
    }

    Ok(SweepResult {
        parameter: metadata.parameter,
        config: metadata.settings,
        started_at: metadata.recorded_at,
        rows,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn sample() -> SweepResult {
        SweepResult {
            parameter: "source_frequency_ghz".into(),
            config: SweepConfig {
                time_constant_ms: 100.0,
                lock_in_time: Duration::ZERO,
                ..SweepConfig::default()
            },
            started_at: Utc::now(),
            rows: vec![
                SweepRow {
                    value: 225.0,
                    x: 1.25e-3,
                    y: -4.0e-4,
                },
                SweepRow {
                    value: 250.0,
                    x: 2.5e-3,
                    y: 1.0e-4,
                },
            ],
        }
    }

    #[test]
    fn saved_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        let result = sample();

        save_sweep(&path, &result).unwrap();
        let loaded = load_sweep(&path).unwrap();

        assert_eq!(loaded, result);
    }

    #[test]
    fn file_layout_is_commented_json_then_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        save_sweep(&path, &sample()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# {");
        assert!(text.contains("#   \"parameter\": \"source_frequency_ghz\""));
        assert!(text.contains("\"lock_in_time\": \"0s\""));
        assert!(text.contains("\"frequency_multiplier\": 18.0"));

        let header = lines.iter().position(|l| !l.starts_with("# ")).unwrap();
        assert_eq!(lines[header], "value,x,y");
        assert_eq!(lines.len(), header + 3);
        assert!(lines[header + 1].starts_with("225.0,"));
    }

    #[test]
    fn empty_result_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let result = SweepResult {
            rows: Vec::new(),
            ..sample()
        };
        save_sweep(&path, &result).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("value,x,y\n"));
        assert!(load_sweep(&path).unwrap().is_empty());
    }

    #[test]
    fn truncated_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        save_sweep(&path, &sample()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let trimmed: Vec<&str> = text.lines().collect();
        std::fs::write(&path, trimmed[..trimmed.len() - 1].join("\n")).unwrap();

        let err = load_sweep(&path).unwrap_err();
        assert!(matches!(err, DaqError::Persist(_)));
        assert!(err.to_string().contains("2 points"));
    }

    #[test]
    fn missing_file_is_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_sweep(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, DaqError::Persist(_)));
    }
}
