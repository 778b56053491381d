//! Prediction-record export in the selector's per-sample format.
//!
//! One JSON file per sample, keyed by the image's file stem. The exported
//! probability vector is renormalized at write time: serialization round-trips
//! truncate raw model output, and the selector requires a distribution that
//! sums to 1.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsio;

/// Errors raised while exporting or loading prediction records.
#[derive(Debug, Error)]
pub enum PredictionExportError {
    #[error("Got {filenames} filenames but {predictions} prediction vectors")]
    LengthMismatch { filenames: usize, predictions: usize },
    #[error("Prediction vector for {file_name} has {actual} entries; expected {expected}")]
    WrongVectorLength {
        file_name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Prediction vector for {file_name} has a negative entry at index {index}")]
    NegativeEntry { file_name: String, index: usize },
    /// Zero or non-finite probability mass; renormalization cannot fix this.
    #[error("Degenerate prediction distribution for {file_name}: sum = {sum}")]
    DegenerateDistribution { file_name: String, sum: f64 },
    #[error("Failed to write prediction record {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed prediction record {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A class prediction for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPrediction {
    /// Argmax class index (ties broken by lowest index).
    pub category_id: usize,
    /// Renormalized distribution over the class vocabulary.
    pub probabilities: Vec<f64>,
}

/// Per-sample prediction record consumed by the selector's scoring strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Original image file name.
    pub file_name: String,
    /// Round that produced this record. Records are overwritten each round;
    /// the index keeps the provenance inspectable.
    pub round_index: u32,
    pub predictions: Vec<CategoryPrediction>,
}

/// Summary of an export pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub written: usize,
}

/// Write one prediction record per `(filename, vector)` pair into `out_dir`.
///
/// Existing records for the same stems are silently overwritten; each round's
/// predictions supersede the prior round's. A degenerate vector aborts the
/// export before its record is written.
pub fn export(
    out_dir: &Path,
    round_index: u32,
    filenames: &[String],
    vectors: &[Vec<f64>],
    num_classes: usize,
) -> Result<ExportSummary, PredictionExportError> {
    if filenames.len() != vectors.len() {
        return Err(PredictionExportError::LengthMismatch {
            filenames: filenames.len(),
            predictions: vectors.len(),
        });
    }
    std::fs::create_dir_all(out_dir).map_err(|source| PredictionExportError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let mut summary = ExportSummary::default();
    for (file_name, vector) in filenames.iter().zip(vectors) {
        let record = build_record(file_name, round_index, vector, num_classes)?;
        let path = record_path(out_dir, file_name);
        fsio::write_json_atomic(&path, &record)
            .map_err(|source| PredictionExportError::Io { path, source })?;
        summary.written += 1;
    }

    tracing::info!(
        written = summary.written,
        round_index,
        "Exported prediction records to {}",
        out_dir.display()
    );
    Ok(summary)
}

/// Validate and renormalize one prediction vector into a record.
pub fn build_record(
    file_name: &str,
    round_index: u32,
    vector: &[f64],
    num_classes: usize,
) -> Result<PredictionRecord, PredictionExportError> {
    if vector.len() != num_classes {
        return Err(PredictionExportError::WrongVectorLength {
            file_name: file_name.to_string(),
            expected: num_classes,
            actual: vector.len(),
        });
    }
    if let Some(index) = vector.iter().position(|&p| p < 0.0) {
        return Err(PredictionExportError::NegativeEntry {
            file_name: file_name.to_string(),
            index,
        });
    }
    let sum: f64 = vector.iter().sum();
    if !sum.is_finite() || sum == 0.0 {
        return Err(PredictionExportError::DegenerateDistribution {
            file_name: file_name.to_string(),
            sum,
        });
    }

    Ok(PredictionRecord {
        file_name: file_name.to_string(),
        round_index,
        predictions: vec![CategoryPrediction {
            category_id: argmax(vector),
            probabilities: vector.iter().map(|p| p / sum).collect(),
        }],
    })
}

/// Record path for a sample: `<stem>.json` inside `out_dir`.
pub fn record_path(out_dir: &Path, file_name: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);
    out_dir.join(format!("{stem}.json"))
}

/// Whether `dir` holds any prediction records.
pub fn round_has_predictions(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry.path().extension().and_then(|ext| ext.to_str()) == Some("json")
    })
}

/// Load every prediction record in `dir`, sorted by file name.
pub fn load_records(dir: &Path) -> Result<Vec<PredictionRecord>, PredictionExportError> {
    let entries = std::fs::read_dir(dir).map_err(|source| PredictionExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(&path).map_err(|source| PredictionExportError::Io {
            path: path.clone(),
            source,
        })?;
        let record: PredictionRecord =
            serde_json::from_slice(&bytes).map_err(|source| PredictionExportError::Json {
                path: path.clone(),
                source,
            })?;
        records.push(record);
    }
    Ok(records)
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0usize;
    let mut best_val = f64::NEG_INFINITY;
    for (idx, &val) in values.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best = idx;
        }
    }
    best
}
