//! Dataset assembly for training and inference passes.
//!
//! A [`TrackDataset`] pairs the class vocabulary with the directory holding
//! relocated training images; trainers consume it together with the sample
//! lists drawn from the registry. Each round's labeled set is also snapshotted
//! to its own manifest so the labeling history stays auditable.

use std::path::{Path, PathBuf};

use crate::annotations::LabeledFile;
use crate::config::PipelineConfig;
use crate::registry::{Manifest, RegistryError, Sample};

/// Class vocabulary + image root consumed by the external trainer.
#[derive(Debug, Clone)]
pub struct TrackDataset {
    classes: Vec<String>,
    data_dir: PathBuf,
}

impl TrackDataset {
    pub fn new(classes: Vec<String>, data_dir: PathBuf) -> Self {
        Self { classes, data_dir }
    }

    /// Dataset over the relocated training images of a pipeline deployment.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.classes.clone(), config.train_data_dir())
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Directory holding the images referenced by sample paths.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Category index for a class name.
    pub fn class_index(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|class| class == label)
    }

    /// One-hot target vector for a class name.
    pub fn one_hot(&self, label: &str) -> Option<Vec<f32>> {
        let index = self.class_index(label)?;
        let mut encoded = vec![0.0; self.classes.len()];
        encoded[index] = 1.0;
        Some(encoded)
    }

    /// Absolute path of an image inside the dataset directory.
    pub fn image_path(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Turn annotation-export pairs into labeled samples rooted in this dataset.
    pub fn labeled_from_annotations(&self, labeled: &[LabeledFile]) -> Vec<Sample> {
        labeled
            .iter()
            .map(|entry| {
                Sample::labeled(
                    self.image_path(&entry.file_name).to_string_lossy(),
                    entry.label.clone(),
                )
            })
            .collect()
    }
}

/// Path of the labeled-set snapshot written for one round.
pub fn round_manifest_path(data_dir: &Path, round_index: u32) -> PathBuf {
    data_dir.join(format!("round-{round_index}_train.json"))
}

/// Snapshot the currently labeled samples as this round's training manifest.
///
/// A new file per round, never a rewrite of a prior one.
pub fn snapshot_labeled(
    data_dir: &Path,
    round_index: u32,
    labeled: &[&Sample],
) -> Result<PathBuf, RegistryError> {
    let path = round_manifest_path(data_dir, round_index);
    let samples: Vec<Sample> = labeled.iter().map(|&sample| sample.clone()).collect();
    Manifest::from_samples(samples).save(&path)?;
    Ok(path)
}
