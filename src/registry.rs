//! Sample registry and dataset manifests.
//!
//! A [`Manifest`] is an ordered snapshot of samples defining a dataset
//! partition. The cumulative labeled registry is itself a manifest whose
//! entries carry labels; presence of a label is the sole signal that a sample
//! has been annotated.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsio;

/// Errors raised by manifest persistence and label merging.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to access manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed manifest {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Unknown class label {label:?} for {path}")]
    UnknownClassLabel { label: String, path: String },
}

/// One image and its labeling status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Unique identifier: absolute or root-relative file path.
    pub path: String,
    /// Class name; `None` means the sample is still unlabeled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Sample {
    /// An unlabeled pool entry.
    pub fn unlabeled(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: None,
        }
    }

    /// A labeled entry, as produced by an annotation import.
    pub fn labeled(path: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: Some(label.into()),
        }
    }

    /// Base name of the sample path.
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// Outcome of a labeled-sample merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Entries whose label was overwritten.
    pub updated: usize,
    /// Entries newly appended to the registry.
    pub appended: usize,
}

/// Ordered collection of samples representing one dataset partition snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    samples: Vec<Sample>,
}

impl Manifest {
    /// An empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from samples, preserving input order.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Paths of all labeled entries.
    pub fn labeled_paths(&self) -> BTreeSet<&str> {
        self.samples
            .iter()
            .filter(|sample| sample.label.is_some())
            .map(|sample| sample.path.as_str())
            .collect()
    }

    /// Entries that carry a label, in manifest order.
    pub fn labeled(&self) -> Vec<&Sample> {
        self.samples
            .iter()
            .filter(|sample| sample.label.is_some())
            .collect()
    }

    /// Load a manifest from a JSON array of sample records.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let bytes = std::fs::read(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let samples: Vec<Sample> =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { samples })
    }

    /// Load a manifest, or return an empty one if the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, RegistryError> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Persist the manifest atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        fsio::write_json_atomic(path, &self.samples).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge newly labeled samples into the registry.
    ///
    /// Last write wins per path, both against existing entries and for
    /// duplicate paths within `incoming`. Appended entries keep input order.
    /// Every incoming label is validated against `classes` before any mutation,
    /// so a rejected batch leaves the registry untouched.
    pub fn merge_labeled(
        &mut self,
        incoming: &[Sample],
        classes: &[String],
    ) -> Result<MergeSummary, RegistryError> {
        for sample in incoming {
            let Some(label) = sample.label.as_deref() else {
                continue;
            };
            if !classes.iter().any(|class| class == label) {
                return Err(RegistryError::UnknownClassLabel {
                    label: label.to_string(),
                    path: sample.path.clone(),
                });
            }
        }

        let mut summary = MergeSummary::default();
        for sample in incoming {
            if sample.label.is_none() {
                continue;
            }
            match self
                .samples
                .iter_mut()
                .find(|existing| existing.path == sample.path)
            {
                Some(existing) => {
                    if existing.label != sample.label {
                        existing.label = sample.label.clone();
                    }
                    summary.updated += 1;
                }
                None => {
                    self.samples.push(sample.clone());
                    summary.appended += 1;
                }
            }
        }
        Ok(summary)
    }
}

/// Pool entries whose path is not in the labeled set, in pool order.
pub fn unlabeled_remainder<'a>(pool: &'a Manifest, registry: &Manifest) -> Vec<&'a Sample> {
    let labeled = registry.labeled_paths();
    pool.samples()
        .iter()
        .filter(|sample| !labeled.contains(sample.path.as_str()))
        .collect()
}
