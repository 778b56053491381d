//! End-to-end labeling rounds over a real partitioned pool, with in-process
//! selector and trainer collaborators.

use std::cell::RefCell;
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracklab::config::PipelineConfig;
use tracklab::dataset::{self, TrackDataset};
use tracklab::partition::{PartitionOptions, partition_pool};
use tracklab::predictions;
use tracklab::registry::{Manifest, Sample};
use tracklab::round::{RoundController, StopReason};
use tracklab::selection::{SelectionRequest, StrategyInput};
use tracklab::selector::{
    CancelToken, Clock, PollPolicy, RunHandle, RunInfo, RunState, SelectedSample, Selector,
    SelectorError,
};
use tracklab::trainer::{ModelArtifact, Prediction, Trainer, TrainerError};

struct RecordingSelector {
    requests: RefCell<Vec<SelectionRequest>>,
}

impl RecordingSelector {
    fn new() -> Self {
        Self {
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl Selector for RecordingSelector {
    fn schedule(&self, request: &SelectionRequest) -> Result<RunHandle, SelectorError> {
        request.validate()?;
        self.requests.borrow_mut().push(request.clone());
        Ok(RunHandle {
            run_id: format!("run-{}", self.requests.borrow().len()),
        })
    }

    fn poll(&self, _handle: &RunHandle) -> Result<RunInfo, SelectorError> {
        Ok(RunInfo {
            state: RunState::Completed,
            message: "selection done".to_string(),
        })
    }

    fn export_batch(&self, _handle: &RunHandle) -> Result<Vec<SelectedSample>, SelectorError> {
        Ok(Vec::new())
    }
}

struct CountingTrainer {
    fits: usize,
}

impl Trainer for CountingTrainer {
    fn fit(
        &mut self,
        _dataset: &TrackDataset,
        labeled: &[Sample],
    ) -> Result<ModelArtifact, TrainerError> {
        assert!(!labeled.is_empty(), "fit got an empty labeled set");
        self.fits += 1;
        Ok(ModelArtifact {
            path: format!("weights-{}.bin", self.fits).into(),
            sha256: "f".repeat(64),
        })
    }

    fn predict(
        &self,
        dataset: &TrackDataset,
        unlabeled: &[Sample],
    ) -> Result<Vec<Prediction>, TrainerError> {
        // Truncated vectors: the exporter must renormalize them.
        Ok(unlabeled
            .iter()
            .map(|sample| Prediction {
                file_name: sample.file_name().to_string(),
                probabilities: vec![0.2; dataset.num_classes()],
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

struct Harness {
    _temp: TempDir,
    config: PipelineConfig,
    train_names: Vec<String>,
}

impl Harness {
    /// Seed a raw pool with sidecars and partition it for real.
    fn new(pool_size: usize) -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let data_dir = temp.path().join("pool");
        std::fs::create_dir_all(&data_dir).expect("create pool dir");
        for idx in 0..pool_size {
            std::fs::write(
                data_dir.join(format!("img_{idx:03}.jpg")),
                b"\xFF\xD8\xFF\xE0",
            )
            .expect("write image");
            std::fs::write(data_dir.join(format!("img_{idx:03}.json")), b"{}")
                .expect("write sidecar");
        }
        partition_pool(
            &data_dir,
            &PartitionOptions {
                val_fraction: 0.05,
                seed: "round-loop-test".to_string(),
            },
        )
        .expect("partition pool");

        let mut config = PipelineConfig::default();
        config.data_dir = data_dir;
        config.samples_per_round = 3;
        config.max_rounds = Some(2);

        let pool = Manifest::load(&config.full_train_manifest()).expect("load pool manifest");
        let train_names: Vec<String> = pool
            .samples()
            .iter()
            .map(|sample| sample.file_name().to_string())
            .collect();

        Self {
            _temp: temp,
            config,
            train_names,
        }
    }

    fn write_annotation(&self, round: u32, entries: &[(&str, &str)]) {
        let dir = self.config.annotations_dir();
        std::fs::create_dir_all(&dir).expect("create annotations dir");
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
            self.config.annotation_file(round),
            serde_json::to_vec_pretty(&body).expect("serialize annotation"),
        )
        .expect("write annotation export");
    }
}

#[test]
fn two_rounds_label_train_and_export_predictions() {
    let harness = Harness::new(40);
    let names = &harness.train_names;
    assert!(names.len() >= 7, "pool too small for two rounds");

    // Labels arrive for rounds 0 and 1 before the loop starts; the controller
    // picks each file up when it reaches the corresponding round.
    harness.write_annotation(
        0,
        &[
            (&names[0], "track"),
            (&names[1], "no track"),
            (&names[2], "track"),
        ],
    );
    harness.write_annotation(
        1,
        &[
            (&names[3], "no track"),
            (&names[4], "track"),
            (&names[5], "no track"),
        ],
    );

    let selector = RecordingSelector::new();
    let mut trainer = CountingTrainer { fits: 0 };
    let clock = NoopClock;
    let mut controller = RoundController::new(
        &harness.config,
        &selector,
        &mut trainer,
        &clock,
        PollPolicy::default(),
        CancelToken::new(),
    )
    .expect("build controller");

    let stop = controller.run().expect("round loop");
    assert_eq!(stop, StopReason::MaxRoundsReached);
    assert_eq!(controller.round_index(), 2);

    // Round 0 was a cold start (balance + diversity); round 1 weighted by
    // uncertainty scores.
    let requests = selector.requests.borrow();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].strategies.len(), 2);
    assert_eq!(requests[1].strategies.len(), 1);
    assert!(matches!(
        requests[1].strategies[0].input,
        StrategyInput::Scores { .. }
    ));

    // Cumulative registry holds all six labels; per-round snapshots exist.
    let registry = Manifest::load(&harness.config.labeled_manifest()).expect("load registry");
    assert_eq!(registry.labeled().len(), 6);
    let round0 = Manifest::load(&dataset::round_manifest_path(&harness.config.data_dir, 0))
        .expect("round 0 snapshot");
    let round1 = Manifest::load(&dataset::round_manifest_path(&harness.config.data_dir, 1))
        .expect("round 1 snapshot");
    assert_eq!(round0.len(), 3);
    assert_eq!(round1.len(), 6);

    // The trainer ran once per round.
    assert_eq!(trainer.fits, 2);

    // Round 1 overwrote the remainder's records; every distribution sums to 1.
    let records =
        predictions::load_records(&harness.config.predictions_dir()).expect("load records");
    assert_eq!(records.len(), names.len() - 3);
    let latest: Vec<_> = records
        .iter()
        .filter(|record| record.round_index == 1)
        .collect();
    assert_eq!(latest.len(), names.len() - 6);
    for record in &records {
        let sum: f64 = record.predictions[0].probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "record {} sum {sum}", record.file_name);
        assert_eq!(record.predictions[0].category_id, 0);
    }

    // No temp files were left behind by atomic writes.
    assert_no_temp_files(&harness.config.data_dir);
}

#[test]
fn labeling_everything_exhausts_the_pool() {
    let harness = Harness::new(8);
    let names = &harness.train_names;
    let entries: Vec<(&str, &str)> = names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            (
                name.as_str(),
                if idx % 2 == 0 { "track" } else { "no track" },
            )
        })
        .collect();
    harness.write_annotation(0, &entries);

    let selector = RecordingSelector::new();
    let mut trainer = CountingTrainer { fits: 0 };
    let clock = NoopClock;
    let mut controller = RoundController::new(
        &harness.config,
        &selector,
        &mut trainer,
        &clock,
        PollPolicy::default(),
        CancelToken::new(),
    )
    .expect("build controller");

    let stop = controller.run().expect("round loop");
    assert_eq!(stop, StopReason::PoolExhausted);
    assert_eq!(controller.round_index(), 1);
    assert_eq!(trainer.fits, 1);

    // Nothing was left unlabeled, so the export pass wrote no records.
    let registry = Manifest::load(&harness.config.labeled_manifest()).expect("load registry");
    assert_eq!(registry.labeled().len(), names.len());
}

fn assert_no_temp_files(dir: &Path) {
    for entry in std::fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            assert_no_temp_files(&path);
        } else {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(
                !name.starts_with(".tmp"),
                "leftover temp file: {}",
                path.display()
            );
        }
    }
}
