//! Raw-pool partitioning into train/validation sets.
//!
//! Each eligible image gets an independent deterministic draw keyed on the
//! seed and its file stem, so the assignment is reproducible and does not
//! depend on enumeration order. Image + metadata pairs are physically
//! relocated and the surviving paths are written out as ordered manifests.

use std::fs;
use std::path::{Path, PathBuf};

use blake3::Hasher;
use thiserror::Error;

use crate::fsio;
use crate::registry::Sample;

/// Subdirectory receiving training pairs.
pub const TRAIN_SET_DIR: &str = "train_set";
/// Subdirectory receiving validation pairs.
pub const VAL_SET_DIR: &str = "val_set";
/// Image subdirectory inside each split.
pub const DATA_SUBDIR: &str = "data";
/// Metadata-sidecar subdirectory inside each split.
pub const METADATA_SUBDIR: &str = "metadata";
/// Manifest enumerating the full training pool.
pub const FULL_TRAIN_MANIFEST: &str = "full_train.json";
/// Manifest enumerating the validation holdout.
pub const VAL_MANIFEST: &str = "val.json";

const IMAGE_EXTENSION: &str = "jpg";
const METADATA_EXTENSION: &str = "json";

/// Errors raised while partitioning a raw pool.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// An eligible image has no metadata sidecar; the pool is unusable as-is.
    #[error("Missing companion metadata for {image}: expected {metadata}")]
    MissingCompanionFile { image: PathBuf, metadata: PathBuf },
    #[error("Invalid val_fraction {0}; expected a value in (0, 1)")]
    InvalidValFraction(f64),
    #[error("Filesystem operation failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Options for [`partition_pool`].
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Probability of assigning an item to the validation set.
    pub val_fraction: f64,
    /// Seed string keyed into every per-item draw.
    pub seed: String,
}

/// Counts from a partition run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    /// Pairs relocated this run.
    pub moved_train: usize,
    /// Pairs relocated to the validation holdout this run.
    pub moved_val: usize,
    /// Total entries in the written training-pool manifest.
    pub train_total: usize,
    /// Total entries in the written validation manifest.
    pub val_total: usize,
}

/// Split assignment for a single pool item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Train,
    Val,
}

/// Directory of relocated training images under `data_dir`.
pub fn train_data_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(TRAIN_SET_DIR).join(DATA_SUBDIR)
}

/// Directory of training metadata sidecars under `data_dir`.
pub fn train_metadata_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(TRAIN_SET_DIR).join(METADATA_SUBDIR)
}

/// Directory of relocated validation images under `data_dir`.
pub fn val_data_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(VAL_SET_DIR).join(DATA_SUBDIR)
}

/// Directory of validation metadata sidecars under `data_dir`.
pub fn val_metadata_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(VAL_SET_DIR).join(METADATA_SUBDIR)
}

/// Map a seed + item key to a unit-interval float.
///
/// Keyed hashing keeps the draw independent per item and stable across runs
/// and enumeration orders for a fixed seed.
pub fn unit_draw(seed: &str, stem: &str) -> f64 {
    let mut hasher = Hasher::new();
    hasher.update(seed.as_bytes());
    hasher.update(b"\0");
    hasher.update(stem.as_bytes());
    let hash = hasher.finalize();
    let bytes: [u8; 8] = hash.as_bytes()[0..8]
        .try_into()
        .expect("slice length verified");
    let value = u64::from_le_bytes(bytes);
    (value as f64) / (u64::MAX as f64)
}

/// Assign an item to train or validation.
pub fn assign(seed: &str, stem: &str, val_fraction: f64) -> Assignment {
    if unit_draw(seed, stem) < val_fraction {
        Assignment::Val
    } else {
        Assignment::Train
    }
}

/// Split the raw pool under `data_dir` and write both partition manifests.
///
/// Every eligible image must have a `<stem>.json` sidecar; companions are
/// verified before anything is relocated so a failure leaves the pool
/// untouched. Re-running on an already-partitioned directory finds zero
/// eligible files and rewrites the manifests from the relocated sets, which
/// makes the operation idempotent.
pub fn partition_pool(
    data_dir: &Path,
    options: &PartitionOptions,
) -> Result<PartitionSummary, PartitionError> {
    if !(options.val_fraction > 0.0 && options.val_fraction < 1.0) {
        return Err(PartitionError::InvalidValFraction(options.val_fraction));
    }

    let eligible = eligible_images(data_dir)?;
    for (image, stem) in &eligible {
        let metadata = data_dir.join(format!("{stem}.{METADATA_EXTENSION}"));
        if !metadata.is_file() {
            return Err(PartitionError::MissingCompanionFile {
                image: image.clone(),
                metadata,
            });
        }
    }

    let train_data = train_data_dir(data_dir);
    let train_metadata = train_metadata_dir(data_dir);
    let val_data = val_data_dir(data_dir);
    let val_metadata = val_metadata_dir(data_dir);
    for dir in [&train_data, &train_metadata, &val_data, &val_metadata] {
        fs::create_dir_all(dir).map_err(|source| PartitionError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    let mut summary = PartitionSummary::default();
    for (image, stem) in &eligible {
        let metadata = data_dir.join(format!("{stem}.{METADATA_EXTENSION}"));
        let (data_dest, metadata_dest) = match assign(&options.seed, stem, options.val_fraction) {
            Assignment::Train => {
                summary.moved_train += 1;
                (&train_data, &train_metadata)
            }
            Assignment::Val => {
                summary.moved_val += 1;
                (&val_data, &val_metadata)
            }
        };
        move_into(image, data_dest)?;
        move_into(&metadata, metadata_dest)?;
    }

    let train_samples = enumerate_images(&train_data)?;
    let val_samples = enumerate_images(&val_data)?;
    summary.train_total = train_samples.len();
    summary.val_total = val_samples.len();

    write_manifest(&data_dir.join(FULL_TRAIN_MANIFEST), &train_samples)?;
    write_manifest(&data_dir.join(VAL_MANIFEST), &val_samples)?;

    tracing::info!(
        moved_train = summary.moved_train,
        moved_val = summary.moved_val,
        train_total = summary.train_total,
        val_total = summary.val_total,
        "Partitioned raw pool at {}",
        data_dir.display()
    );
    Ok(summary)
}

/// Images sitting directly in `dir`, sorted by name, paired with their stems.
fn eligible_images(dir: &Path) -> Result<Vec<(PathBuf, String)>, PartitionError> {
    let entries = fs::read_dir(dir).map_err(|source| PartitionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PartitionError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(IMAGE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        images.push((path.clone(), stem.to_string()));
    }
    images.sort();
    Ok(images)
}

fn move_into(file: &Path, dest_dir: &Path) -> Result<(), PartitionError> {
    let file_name = file.file_name().ok_or_else(|| PartitionError::Io {
        path: file.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "file has no name"),
    })?;
    let dest = dest_dir.join(file_name);
    fs::rename(file, &dest).map_err(|source| PartitionError::Io {
        path: file.to_path_buf(),
        source,
    })
}

fn enumerate_images(dir: &Path) -> Result<Vec<Sample>, PartitionError> {
    let images = eligible_images(dir)?;
    Ok(images
        .into_iter()
        .map(|(path, _)| Sample::unlabeled(path.to_string_lossy().into_owned()))
        .collect())
}

fn write_manifest(path: &Path, samples: &[Sample]) -> Result<(), PartitionError> {
    fsio::write_json_atomic(path, &samples).map_err(|source| PartitionError::Io {
        path: path.to_path_buf(),
        source,
    })
}
