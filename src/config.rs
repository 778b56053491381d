//! Pipeline configuration.
//!
//! Every component receives an explicit [`PipelineConfig`] at construction;
//! nothing discovers a project root ambiently. The defaults mirror the
//! particle-track labeling deployment this crate was built for.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::partition;

/// Tolerance for the balance-target distribution sum.
const TARGET_SUM_TOLERANCE: f64 = 1e-6;

/// Errors raised while loading or validating a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid val_fraction {0}; expected a value in (0, 1)")]
    InvalidValFraction(f64),
    #[error("Class vocabulary is empty")]
    NoClasses,
    #[error("Duplicate class name: {0}")]
    DuplicateClass(String),
    #[error("samples_per_round must be positive")]
    NoSamplesPerRound,
    #[error("Balance targets sum to {0}; expected 1.0")]
    BalanceTargetSum(f64),
}

/// Configuration for one active-learning pipeline deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root directory holding the raw pool and all derived artifacts.
    pub data_dir: PathBuf,
    /// Closed class vocabulary, in category-index order.
    pub classes: Vec<String>,
    /// Probability of assigning a pool item to the validation set.
    pub val_fraction: f64,
    /// Seed string for the deterministic partition draw.
    pub seed: String,
    /// Number of samples requested from the selector per round.
    pub samples_per_round: usize,
    /// Stop after this many rounds (`None` = run until the pool is exhausted).
    pub max_rounds: Option<u32>,
    /// Scoring task name registered with the external selector.
    pub task_name: String,
    /// Metadata key balanced during cold-start selection.
    pub balance_key: String,
    /// Target distribution for the balance strategy, by category value.
    pub balance_targets: BTreeMap<String, f64>,
    /// Override for the prediction-record directory.
    pub predictions_dir: Option<PathBuf>,
    /// Override for the model-weights directory.
    pub model_dir: Option<PathBuf>,
    /// Override for the annotation-export directory.
    pub annotations_dir: Option<PathBuf>,
    /// External trainer executable implementing the fit/predict contract.
    pub trainer_command: Option<PathBuf>,
    /// Seconds between selector run-status polls.
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            classes: vec!["track".to_string(), "no track".to_string()],
            val_fraction: 0.01,
            seed: "tracklab-partition-v1".to_string(),
            samples_per_round: 50,
            max_rounds: None,
            task_name: "track-classification".to_string(),
            balance_key: "particle_type".to_string(),
            balance_targets: BTreeMap::from([
                ("Fe".to_string(), 0.5),
                ("X-ray".to_string(), 0.5),
            ]),
            predictions_dir: None,
            model_dir: None,
            annotations_dir: None,
            trainer_command: None,
            poll_interval_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a TOML file and validate it.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(ConfigError::InvalidValFraction(self.val_fraction));
        }
        if self.classes.is_empty() {
            return Err(ConfigError::NoClasses);
        }
        let mut seen = std::collections::BTreeSet::new();
        for class in &self.classes {
            if !seen.insert(class.as_str()) {
                return Err(ConfigError::DuplicateClass(class.clone()));
            }
        }
        if self.samples_per_round == 0 {
            return Err(ConfigError::NoSamplesPerRound);
        }
        let sum: f64 = self.balance_targets.values().sum();
        if (sum - 1.0).abs() > TARGET_SUM_TOLERANCE {
            return Err(ConfigError::BalanceTargetSum(sum));
        }
        Ok(())
    }

    /// Category index for a class name, if it is in the vocabulary.
    pub fn class_index(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|class| class == label)
    }

    /// Directory holding relocated training images.
    pub fn train_data_dir(&self) -> PathBuf {
        partition::train_data_dir(&self.data_dir)
    }

    /// Directory holding relocated validation images.
    pub fn val_data_dir(&self) -> PathBuf {
        partition::val_data_dir(&self.data_dir)
    }

    /// Path of the full training-pool manifest.
    pub fn full_train_manifest(&self) -> PathBuf {
        self.data_dir.join(partition::FULL_TRAIN_MANIFEST)
    }

    /// Path of the validation manifest.
    pub fn val_manifest(&self) -> PathBuf {
        self.data_dir.join(partition::VAL_MANIFEST)
    }

    /// Path of the cumulative labeled-sample registry.
    pub fn labeled_manifest(&self) -> PathBuf {
        self.data_dir.join("labeled.json")
    }

    /// Directory where annotation exports appear, one file per round.
    pub fn annotations_dir(&self) -> PathBuf {
        self.annotations_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ls_annotations"))
    }

    /// Annotation export consumed by the given round.
    pub fn annotation_file(&self, round_index: u32) -> PathBuf {
        self.annotations_dir()
            .join(format!("annotation-{round_index}.json"))
    }

    /// Directory receiving per-sample prediction records.
    pub fn predictions_dir(&self) -> PathBuf {
        self.predictions_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("predictions"))
    }

    /// Directory receiving trained model weights.
    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("model_weights"))
    }

    /// Interval between selector run-status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_val_fraction_outside_unit_interval() {
        let mut config = PipelineConfig::default();
        config.val_fraction = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValFraction(_))
        ));
    }

    #[test]
    fn rejects_duplicate_classes() {
        let mut config = PipelineConfig::default();
        config.classes = vec!["track".to_string(), "track".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateClass(_))
        ));
    }

    #[test]
    fn rejects_balance_targets_not_summing_to_one() {
        let mut config = PipelineConfig::default();
        config.balance_targets.insert("proton".to_string(), 0.25);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BalanceTargetSum(_))
        ));
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/srv/tracks"
val_fraction = 0.05
samples_per_round = 25
"#,
        )
        .unwrap();
        let config = PipelineConfig::from_toml_path(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/tracks"));
        assert_eq!(config.val_fraction, 0.05);
        assert_eq!(config.samples_per_round, 25);
        assert_eq!(config.classes, vec!["track", "no track"]);
        assert_eq!(
            config.annotation_file(2),
            PathBuf::from("/srv/tracks/ls_annotations/annotation-2.json")
        );
    }

    #[test]
    fn class_index_follows_vocabulary_order() {
        let config = PipelineConfig::default();
        assert_eq!(config.class_index("track"), Some(0));
        assert_eq!(config.class_index("no track"), Some(1));
        assert_eq!(config.class_index("maybe"), None);
    }
}
