//! Metadata schema and per-sample sidecar files for the selector datasource.
//!
//! The selector reads custom per-sample metadata through two artifacts: a
//! schema file declaring each field, and one sidecar JSON per image. Both
//! shapes are fixed external formats and must not drift.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsio;

/// File name of the schema artifact.
pub const SCHEMA_FILE_NAME: &str = "schema.json";

/// Errors raised while writing metadata artifacts.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to write metadata file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read metadata entries {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed metadata entries {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Value type of a declared metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDataType {
    #[serde(rename = "CATEGORICAL_STRING")]
    CategoricalString,
    #[serde(rename = "NUMERIC_FLOAT")]
    NumericFloat,
    #[serde(rename = "NUMERIC_INT")]
    NumericInt,
}

/// One declared field in the metadata schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub path: String,
    #[serde(rename = "defaultValue")]
    pub default_value: serde_json::Value,
    #[serde(rename = "valueDataType")]
    pub value_data_type: ValueDataType,
}

/// Per-sample experiment metadata attached to each microscopy image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    #[serde(rename = "dose_Gy")]
    pub dose_gy: f64,
    pub particle_type: String,
    pub hr_post_exposure: i64,
}

/// Sidecar record for one image, as the selector datasource expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub file_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: TrackMetadata,
}

impl SampleMetadata {
    /// Sidecar for an image addressed as `<prefix>/<stem>.jpg` in the bucket.
    pub fn for_image(bucket_prefix: &str, stem: &str, metadata: TrackMetadata) -> Self {
        Self {
            file_name: format!("{bucket_prefix}/{stem}.jpg"),
            kind: "image".to_string(),
            metadata,
        }
    }

    /// Stem of the image this sidecar describes.
    pub fn stem(&self) -> &str {
        let name = self
            .file_name
            .rsplit('/')
            .next()
            .unwrap_or(self.file_name.as_str());
        name.strip_suffix(".jpg").unwrap_or(name)
    }
}

/// The schema declared for particle-track sidecars.
pub fn default_schema() -> Vec<SchemaField> {
    vec![
        SchemaField {
            name: "Filename".to_string(),
            path: "file_name".to_string(),
            default_value: serde_json::Value::from("undefined"),
            value_data_type: ValueDataType::CategoricalString,
        },
        SchemaField {
            name: "Type".to_string(),
            path: "type".to_string(),
            default_value: serde_json::Value::from("undefined"),
            value_data_type: ValueDataType::CategoricalString,
        },
        SchemaField {
            name: "Dose (Gy)".to_string(),
            path: "dose_Gy".to_string(),
            default_value: serde_json::Value::from(0.0),
            value_data_type: ValueDataType::NumericFloat,
        },
        SchemaField {
            name: "Particle Type".to_string(),
            path: "particle_type".to_string(),
            default_value: serde_json::Value::from("nothing"),
            value_data_type: ValueDataType::CategoricalString,
        },
        SchemaField {
            name: "Hours Post Exposure".to_string(),
            path: "hr_post_exposure".to_string(),
            default_value: serde_json::Value::from(0),
            value_data_type: ValueDataType::NumericInt,
        },
    ]
}

/// Write the schema artifact into `dir`.
pub fn write_schema(dir: &Path) -> Result<PathBuf, MetadataError> {
    let path = dir.join(SCHEMA_FILE_NAME);
    fsio::write_json_atomic(&path, &default_schema()).map_err(|source| MetadataError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Write one `<stem>.json` sidecar per entry into `dir`.
pub fn write_sidecars(dir: &Path, entries: &[SampleMetadata]) -> Result<usize, MetadataError> {
    std::fs::create_dir_all(dir).map_err(|source| MetadataError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let path = dir.join(format!("{}.json", entry.stem()));
        fsio::write_json_atomic(&path, entry)
            .map_err(|source| MetadataError::Io { path, source })?;
    }
    tracing::info!(
        sidecars = entries.len(),
        "Wrote metadata sidecars to {}",
        dir.display()
    );
    Ok(entries.len())
}

/// Load sidecar entries from a JSON array file.
pub fn read_entries(path: &Path) -> Result<Vec<SampleMetadata>, MetadataError> {
    let bytes = std::fs::read(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| MetadataError::Json {
        path: path.to_path_buf(),
        source,
    })
}
