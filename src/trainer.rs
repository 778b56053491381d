//! External trainer interface.
//!
//! Training and inference are delegated to an external capability; this module
//! fixes the contract (fit over labeled samples, predict over the unlabeled
//! remainder) and provides [`CommandTrainer`], a subprocess bridge for
//! deployments whose trainer is a separate executable.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use crate::dataset::TrackDataset;
use crate::registry::{Manifest, Sample};

/// Errors propagated from the external trainer.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// Fatal: no partial-epoch recovery is attempted.
    #[error("Training failed: {0}")]
    TrainingFailed(String),
    #[error("Inference failed: {0}")]
    PredictionFailed(String),
    #[error("Trainer I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed trainer output {path}: {source}")]
    MalformedOutput {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A per-sample class-probability vector produced by an inference pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub file_name: String,
    pub probabilities: Vec<f64>,
}

/// Opaque reference to trained weights, checksummed at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub sha256: String,
}

impl ModelArtifact {
    /// Record a weights file, computing its checksum.
    pub fn register(path: &Path) -> Result<Self, TrainerError> {
        Ok(Self {
            path: path.to_path_buf(),
            sha256: sha256_file(path)?,
        })
    }
}

/// The external training capability, reduced to its workflow contract.
pub trait Trainer {
    /// Train on the labeled samples; returns the produced weights artifact.
    fn fit(
        &mut self,
        dataset: &TrackDataset,
        labeled: &[Sample],
    ) -> Result<ModelArtifact, TrainerError>;

    /// Run inference over unlabeled samples, one probability vector each.
    fn predict(
        &self,
        dataset: &TrackDataset,
        unlabeled: &[Sample],
    ) -> Result<Vec<Prediction>, TrainerError>;
}

/// Subprocess bridge to an external trainer executable.
///
/// The executable is invoked as `<program> fit --data-dir D --classes C
/// --labeled M.json --out W` and `<program> predict --data-dir D --classes C
/// --manifest M.json --weights W --out P.json`, where manifests are JSON
/// sample arrays and the prediction output is a JSON array of
/// `{file_name, probabilities}` objects.
pub struct CommandTrainer {
    program: PathBuf,
    model_dir: PathBuf,
    latest_weights: Option<PathBuf>,
}

impl CommandTrainer {
    pub fn new(program: PathBuf, model_dir: PathBuf) -> Self {
        Self {
            program,
            model_dir,
            latest_weights: None,
        }
    }

    fn write_manifest_handoff(
        &self,
        samples: &[Sample],
    ) -> Result<tempfile::NamedTempFile, TrainerError> {
        let file = tempfile::NamedTempFile::new().map_err(|source| TrainerError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        Manifest::from_samples(samples.to_vec())
            .save(file.path())
            .map_err(|err| TrainerError::Io {
                path: file.path().to_path_buf(),
                source: std::io::Error::other(err.to_string()),
            })?;
        Ok(file)
    }

    fn run(&self, command: &mut Command, failure: fn(String) -> TrainerError) -> Result<(), TrainerError> {
        let output = command.output().map_err(|source| TrainerError::Io {
            path: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Trainer for CommandTrainer {
    fn fit(
        &mut self,
        dataset: &TrackDataset,
        labeled: &[Sample],
    ) -> Result<ModelArtifact, TrainerError> {
        if labeled.is_empty() {
            return Err(TrainerError::TrainingFailed(
                "no labeled samples to train on".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.model_dir).map_err(|source| TrainerError::Io {
            path: self.model_dir.clone(),
            source,
        })?;
        let manifest = self.write_manifest_handoff(labeled)?;
        let weights_out = self
            .model_dir
            .join(weights_file_name(now_utc()).map_err(|err| {
                TrainerError::TrainingFailed(format!("weights filename: {err}"))
            })?);

        let mut command = Command::new(&self.program);
        command
            .arg("fit")
            .arg("--data-dir")
            .arg(dataset.data_dir())
            .arg("--classes")
            .arg(dataset.classes().join(","))
            .arg("--labeled")
            .arg(manifest.path())
            .arg("--out")
            .arg(&weights_out);
        self.run(&mut command, TrainerError::TrainingFailed)?;

        let artifact = ModelArtifact::register(&weights_out)?;
        tracing::info!(
            weights = %artifact.path.display(),
            sha256 = %artifact.sha256,
            "Registered trained model artifact"
        );
        self.latest_weights = Some(artifact.path.clone());
        Ok(artifact)
    }

    fn predict(
        &self,
        dataset: &TrackDataset,
        unlabeled: &[Sample],
    ) -> Result<Vec<Prediction>, TrainerError> {
        let Some(weights) = self.latest_weights.as_ref() else {
            return Err(TrainerError::PredictionFailed(
                "no trained weights available; run fit first".to_string(),
            ));
        };
        let manifest = self.write_manifest_handoff(unlabeled)?;
        let out = tempfile::NamedTempFile::new().map_err(|source| TrainerError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

        let mut command = Command::new(&self.program);
        command
            .arg("predict")
            .arg("--data-dir")
            .arg(dataset.data_dir())
            .arg("--classes")
            .arg(dataset.classes().join(","))
            .arg("--manifest")
            .arg(manifest.path())
            .arg("--weights")
            .arg(weights)
            .arg("--out")
            .arg(out.path());
        self.run(&mut command, TrainerError::PredictionFailed)?;

        let bytes = std::fs::read(out.path()).map_err(|source| TrainerError::Io {
            path: out.path().to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| TrainerError::MalformedOutput {
            path: out.path().to_path_buf(),
            source,
        })
    }
}

/// Timestamped weights file name, one per training run.
fn weights_file_name(now: OffsetDateTime) -> Result<String, time::error::Format> {
    const STAMP_FORMAT: &[FormatItem<'_>] =
        format_description!("[year][month][day][hour][minute][second]");
    Ok(format!("{}_weights.bin", now.format(STAMP_FORMAT)?))
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn sha256_file(path: &Path) -> Result<String, TrainerError> {
    let mut file = std::fs::File::open(path).map_err(|source| TrainerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(|source| TrainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
