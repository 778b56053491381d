//! Round controller for the select → label → train → predict loop.
//!
//! One round walks `SELECTING → AWAITING_LABELS → TRAINING → PREDICTING →
//! EXPORTED`; the loop repeats until the unlabeled pool is exhausted, the
//! configured round limit is reached, or a fatal error surfaces. All failures
//! halt the controller; none of the external collaborators is retried
//! automatically. Registry and manifests are only mutated between rounds.

use std::path::PathBuf;

use thiserror::Error;

use crate::annotations::{self, AnnotationError};
use crate::config::PipelineConfig;
use crate::dataset::{self, TrackDataset};
use crate::partition::{self, PartitionError, PartitionOptions};
use crate::predictions::{self, PredictionExportError};
use crate::registry::{self, Manifest, MergeSummary, RegistryError, Sample};
use crate::selection::SelectionRequest;
use crate::selector::{
    CancelToken, Clock, PollPolicy, Selector, SelectorError, poll_to_completion,
};
use crate::trainer::{ModelArtifact, Trainer, TrainerError};

/// Errors that terminate the round loop.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Trainer(#[from] TrainerError),
    #[error(transparent)]
    Export(#[from] PredictionExportError),
    /// Workflow ordering bug: uncertainty selection needs a prior inference pass.
    #[error("Uncertainty selection for round {round_index} requires prediction records in {dir}")]
    MissingPriorPredictions { round_index: u32, dir: PathBuf },
    #[error("Waiting for annotation export {path} was canceled by the operator")]
    AnnotationWaitCanceled { path: PathBuf },
}

/// Controller phase within the labeling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Init,
    Partitioned,
    Selecting,
    AwaitingLabels,
    Training,
    Predicting,
    Exported,
    Terminated,
}

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every pool sample is labeled.
    PoolExhausted,
    /// The operator-supplied round limit was reached.
    MaxRoundsReached,
}

/// Artifacts and counts from one completed round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round_index: u32,
    /// Annotation export consumed this round.
    pub annotation_source: PathBuf,
    pub selected: usize,
    pub merged: MergeSummary,
    pub labeled_total: usize,
    pub exported: usize,
    pub artifact: ModelArtifact,
}

/// Drives the active-learning loop over injected collaborators.
pub struct RoundController<'a> {
    config: &'a PipelineConfig,
    selector: &'a dyn Selector,
    trainer: &'a mut dyn Trainer,
    clock: &'a dyn Clock,
    poll_policy: PollPolicy,
    cancel: CancelToken,
    state: RoundState,
    round_index: u32,
    pool: Manifest,
    registry: Manifest,
}

impl<'a> RoundController<'a> {
    /// Build a controller, resuming from on-disk manifests when present.
    ///
    /// The round index continues after the last round whose labeled-set
    /// snapshot exists, so a restarted controller does not rewrite history.
    pub fn new(
        config: &'a PipelineConfig,
        selector: &'a dyn Selector,
        trainer: &'a mut dyn Trainer,
        clock: &'a dyn Clock,
        poll_policy: PollPolicy,
        cancel: CancelToken,
    ) -> Result<Self, RoundError> {
        let pool_path = config.full_train_manifest();
        let (state, pool) = if pool_path.is_file() {
            (RoundState::Partitioned, Manifest::load(&pool_path)?)
        } else {
            (RoundState::Init, Manifest::new())
        };
        let registry = Manifest::load_or_default(&config.labeled_manifest())?;
        let round_index = next_round_index(config);
        Ok(Self {
            config,
            selector,
            trainer,
            clock,
            poll_policy,
            cancel,
            state,
            round_index,
            pool,
            registry,
        })
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn round_index(&self) -> u32 {
        self.round_index
    }

    pub fn registry(&self) -> &Manifest {
        &self.registry
    }

    /// Token that aborts polling and annotation waits when canceled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Split the raw pool if it has not been partitioned yet.
    pub fn ensure_partitioned(&mut self) -> Result<(), RoundError> {
        if self.state != RoundState::Init {
            return Ok(());
        }
        partition::partition_pool(
            &self.config.data_dir,
            &PartitionOptions {
                val_fraction: self.config.val_fraction,
                seed: self.config.seed.clone(),
            },
        )?;
        self.pool = Manifest::load(&self.config.full_train_manifest())?;
        self.state = RoundState::Partitioned;
        Ok(())
    }

    /// Run rounds until a terminal condition is reached.
    pub fn run(&mut self) -> Result<StopReason, RoundError> {
        self.ensure_partitioned()?;
        loop {
            if let Some(max_rounds) = self.config.max_rounds {
                if self.round_index >= max_rounds {
                    tracing::info!(max_rounds, "Round limit reached; stopping");
                    self.state = RoundState::Terminated;
                    return Ok(StopReason::MaxRoundsReached);
                }
            }
            if registry::unlabeled_remainder(&self.pool, &self.registry).is_empty() {
                tracing::info!("Unlabeled pool is empty; stopping");
                self.state = RoundState::Terminated;
                return Ok(StopReason::PoolExhausted);
            }
            let report = match self.run_round() {
                Ok(report) => report,
                Err(err) => {
                    self.state = RoundState::Terminated;
                    return Err(err);
                }
            };
            tracing::info!(
                round_index = report.round_index,
                selected = report.selected,
                labeled_total = report.labeled_total,
                exported = report.exported,
                "Round completed"
            );
        }
    }

    /// Drive one full round. The pool must already be partitioned.
    pub fn run_round(&mut self) -> Result<RoundReport, RoundError> {
        let unlabeled = clone_samples(&registry::unlabeled_remainder(&self.pool, &self.registry));

        self.state = RoundState::Selecting;
        let request = self.build_request(unlabeled.len())?;
        let handle = self.selector.schedule(&request)?;
        poll_to_completion(
            self.selector,
            &handle,
            &self.poll_policy,
            self.clock,
            &self.cancel,
        )?;
        let batch = self.selector.export_batch(&handle)?;
        tracing::info!(
            round_index = self.round_index,
            selected = batch.len(),
            "Selection run completed; handing batch to the labeling tool"
        );

        self.state = RoundState::AwaitingLabels;
        let annotation_path = self.await_annotation_export()?;

        self.state = RoundState::Training;
        let labeled_files = annotations::read_annotation_file(&annotation_path)?;
        let track_dataset = TrackDataset::from_config(self.config);
        let incoming = track_dataset.labeled_from_annotations(&labeled_files);
        let merged = self
            .registry
            .merge_labeled(&incoming, &self.config.classes)?;
        self.registry.save(&self.config.labeled_manifest())?;
        dataset::snapshot_labeled(
            &self.config.data_dir,
            self.round_index,
            &self.registry.labeled(),
        )?;
        let labeled_samples = clone_samples(&self.registry.labeled());
        let artifact = self.trainer.fit(&track_dataset, &labeled_samples)?;

        self.state = RoundState::Predicting;
        let remaining = clone_samples(&registry::unlabeled_remainder(&self.pool, &self.registry));
        let predicted = self.trainer.predict(&track_dataset, &remaining)?;

        self.state = RoundState::Exported;
        let filenames: Vec<String> = predicted.iter().map(|p| p.file_name.clone()).collect();
        let vectors: Vec<Vec<f64>> = predicted.into_iter().map(|p| p.probabilities).collect();
        let summary = predictions::export(
            &self.config.predictions_dir(),
            self.round_index,
            &filenames,
            &vectors,
            self.config.classes.len(),
        )?;

        let report = RoundReport {
            round_index: self.round_index,
            annotation_source: annotation_path,
            selected: batch.len(),
            merged,
            labeled_total: labeled_samples.len(),
            exported: summary.written,
            artifact,
        };
        self.round_index += 1;
        Ok(report)
    }

    /// Selection request for the current round, clamped to the remainder.
    fn build_request(&self, available: usize) -> Result<SelectionRequest, RoundError> {
        let request = if self.round_index == 0 {
            SelectionRequest::cold_start(
                self.config.samples_per_round,
                &self.config.balance_key,
                &self.config.balance_targets,
            )
        } else {
            let dir = self.config.predictions_dir();
            if !predictions::round_has_predictions(&dir) {
                return Err(RoundError::MissingPriorPredictions {
                    round_index: self.round_index,
                    dir,
                });
            }
            SelectionRequest::uncertainty(self.config.samples_per_round, &self.config.task_name)
        };
        Ok(request.clamp_to_available(available))
    }

    /// Block until this round's annotation export appears.
    ///
    /// Labeling is human-speed; there is no timeout, only the cancellation
    /// token.
    fn await_annotation_export(&self) -> Result<PathBuf, RoundError> {
        let path = self.config.annotation_file(self.round_index);
        if !path.is_file() {
            tracing::info!("Waiting for annotation export at {}", path.display());
        }
        while !path.is_file() {
            if self.cancel.is_canceled() {
                return Err(RoundError::AnnotationWaitCanceled { path });
            }
            self.clock.sleep(self.poll_policy.interval);
        }
        Ok(path)
    }
}

/// First round index without a labeled-set snapshot on disk.
fn next_round_index(config: &PipelineConfig) -> u32 {
    let mut index = 0u32;
    while dataset::round_manifest_path(&config.data_dir, index).is_file() {
        index += 1;
    }
    index
}

fn clone_samples(samples: &[&Sample]) -> Vec<Sample> {
    samples.iter().map(|&sample| sample.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{RunHandle, RunInfo, RunState, SelectedSample};
    use crate::trainer::Prediction;
    use std::cell::RefCell;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    struct ImmediateSelector {
        batch: Vec<SelectedSample>,
        requests: RefCell<Vec<SelectionRequest>>,
    }

    impl ImmediateSelector {
        fn new(batch: Vec<SelectedSample>) -> Self {
            Self {
                batch,
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl Selector for ImmediateSelector {
        fn schedule(&self, request: &SelectionRequest) -> Result<RunHandle, SelectorError> {
            self.requests.borrow_mut().push(request.clone());
            Ok(RunHandle {
                run_id: format!("run-{}", self.requests.borrow().len()),
            })
        }

        fn poll(&self, _handle: &RunHandle) -> Result<RunInfo, SelectorError> {
            Ok(RunInfo {
                state: RunState::Completed,
                message: "done".to_string(),
            })
        }

        fn export_batch(
            &self,
            _handle: &RunHandle,
        ) -> Result<Vec<SelectedSample>, SelectorError> {
            Ok(self.batch.clone())
        }
    }

    struct UniformTrainer;

    impl Trainer for UniformTrainer {
        fn fit(
            &mut self,
            _dataset: &TrackDataset,
            labeled: &[Sample],
        ) -> Result<ModelArtifact, TrainerError> {
            assert!(!labeled.is_empty());
            Ok(ModelArtifact {
                path: PathBuf::from("weights.bin"),
                sha256: "0".repeat(64),
            })
        }

        fn predict(
            &self,
            dataset: &TrackDataset,
            unlabeled: &[Sample],
        ) -> Result<Vec<Prediction>, TrainerError> {
            Ok(unlabeled
                .iter()
                .map(|sample| Prediction {
                    file_name: sample.file_name().to_string(),
                    probabilities: vec![0.6; dataset.num_classes()],
                })
                .collect())
        }
    }

    struct NoopClock;

    impl Clock for NoopClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) {}
    }

    /// Cancels its token on the first sleep, to unstick blocking waits.
    struct CancelingClock {
        cancel: CancelToken,
    }

    impl Clock for CancelingClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) {
            self.cancel.cancel();
        }
    }

    fn test_config(data_dir: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.data_dir = data_dir.to_path_buf();
        config.samples_per_round = 2;
        config.max_rounds = Some(1);
        config
    }

    fn seed_pool_manifest(config: &PipelineConfig, names: &[&str]) -> Manifest {
        let train_dir = config.train_data_dir();
        std::fs::create_dir_all(&train_dir).unwrap();
        let samples: Vec<Sample> = names
            .iter()
            .map(|name| {
                let path = train_dir.join(name);
                std::fs::write(&path, b"\xFF\xD8\xFF").unwrap();
                Sample::unlabeled(path.to_string_lossy())
            })
            .collect();
        let manifest = Manifest::from_samples(samples);
        manifest.save(&config.full_train_manifest()).unwrap();
        manifest
    }

    fn write_annotation(config: &PipelineConfig, round: u32, entries: &[(&str, &str)]) {
        let dir = config.annotations_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let body: Vec<serde_json::Value> = entries
            .iter()
            .map(|(name, label)| {
                serde_json::json!({
                    "image": format!("/data/local-files/?d=train_set%2Fdata%2F{name}"),
                    "choice": label,
                })
            })
            .collect();
        std::fs::write(
            config.annotation_file(round),
            serde_json::to_vec(&body).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn first_round_runs_cold_start_and_exports_predictions() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        seed_pool_manifest(&config, &["img_001.jpg", "img_002.jpg", "img_003.jpg"]);
        write_annotation(&config, 0, &[("img_001.jpg", "track"), ("img_002.jpg", "no track")]);

        let selector = ImmediateSelector::new(vec![]);
        let mut trainer = UniformTrainer;
        let clock = NoopClock;
        let mut controller = RoundController::new(
            &config,
            &selector,
            &mut trainer,
            &clock,
            PollPolicy::default(),
            CancelToken::new(),
        )
        .unwrap();
        assert_eq!(controller.state(), RoundState::Partitioned);

        let stop = controller.run().unwrap();
        assert_eq!(stop, StopReason::MaxRoundsReached);
        assert_eq!(controller.round_index(), 1);

        // Cold-start request was clamped to the pool size.
        let requests = selector.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].strategies.len(), 2);

        // Registry persisted with both labels; snapshot written for round 0.
        let registry = Manifest::load(&config.labeled_manifest()).unwrap();
        assert_eq!(registry.labeled().len(), 2);
        assert!(dataset::round_manifest_path(&config.data_dir, 0).is_file());

        // Prediction record for the single unlabeled remainder sample.
        let records = predictions::load_records(&config.predictions_dir()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "img_003.jpg");
        assert_eq!(records[0].round_index, 0);
        let sum: f64 = records[0].predictions[0].probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn uncertainty_round_without_prior_predictions_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_rounds = Some(2);
        seed_pool_manifest(&config, &["img_001.jpg", "img_002.jpg"]);
        // A round-0 snapshot on disk resumes the controller at round 1.
        dataset::snapshot_labeled(&config.data_dir, 0, &[&Sample::labeled(
            config
                .train_data_dir()
                .join("img_001.jpg")
                .to_string_lossy(),
            "track",
        )])
        .unwrap();

        let selector = ImmediateSelector::new(vec![]);
        let mut trainer = UniformTrainer;
        let clock = NoopClock;
        let mut controller = RoundController::new(
            &config,
            &selector,
            &mut trainer,
            &clock,
            PollPolicy::default(),
            CancelToken::new(),
        )
        .unwrap();
        assert_eq!(controller.round_index(), 1);

        let err = controller.run_round().unwrap_err();
        assert!(matches!(err, RoundError::MissingPriorPredictions { .. }));
    }

    #[test]
    fn annotation_wait_honors_cancellation() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        seed_pool_manifest(&config, &["img_001.jpg"]);
        // No annotation file: the controller blocks after selection.

        let selector = ImmediateSelector::new(vec![]);
        let mut trainer = UniformTrainer;
        let cancel = CancelToken::new();
        let clock = CancelingClock {
            cancel: cancel.clone(),
        };
        let mut controller = RoundController::new(
            &config,
            &selector,
            &mut trainer,
            &clock,
            PollPolicy::default(),
            cancel,
        )
        .unwrap();

        let err = controller.run_round().unwrap_err();
        assert!(matches!(err, RoundError::AnnotationWaitCanceled { .. }));
        assert_eq!(controller.state(), RoundState::AwaitingLabels);
    }

    #[test]
    fn unknown_label_halts_the_round_before_training() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        seed_pool_manifest(&config, &["img_001.jpg"]);
        write_annotation(&config, 0, &[("img_001.jpg", "maybe")]);

        let selector = ImmediateSelector::new(vec![]);
        let mut trainer = UniformTrainer;
        let clock = NoopClock;
        let mut controller = RoundController::new(
            &config,
            &selector,
            &mut trainer,
            &clock,
            PollPolicy::default(),
            CancelToken::new(),
        )
        .unwrap();

        let err = controller.run_round().unwrap_err();
        assert!(matches!(
            err,
            RoundError::Registry(RegistryError::UnknownClassLabel { .. })
        ));
        // No partial registry was written.
        assert!(!config.labeled_manifest().exists());
    }

    #[test]
    fn empty_pool_terminates_immediately() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        Manifest::new().save(&config.full_train_manifest()).unwrap();

        let selector = ImmediateSelector::new(vec![]);
        let mut trainer = UniformTrainer;
        let clock = NoopClock;
        let mut controller = RoundController::new(
            &config,
            &selector,
            &mut trainer,
            &clock,
            PollPolicy::default(),
            CancelToken::new(),
        )
        .unwrap();

        let stop = controller.run().unwrap();
        assert_eq!(stop, StopReason::PoolExhausted);
        assert_eq!(controller.state(), RoundState::Terminated);
    }
}
