//! Selection-request construction for the external selector.
//!
//! Strategies are modeled as tagged variants and serialized to the selector's
//! wire shape only at this boundary. Two request shapes are used by the
//! workflow: a balance + diversity request for the cold-start round and an
//! uncertainty-weighted request once predictions exist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Score name used for uncertainty-weighted selection.
pub const UNCERTAINTY_ENTROPY_SCORE: &str = "uncertainty_entropy";

/// Errors raised by request validation.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Selection request has more than one strategy over the {0} input")]
    DuplicateInputSource(&'static str),
    #[error("Selection request asks for zero samples")]
    EmptyRequest,
}

/// Input source a scoring strategy reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StrategyInput {
    /// A declared per-sample metadata field.
    #[serde(rename = "METADATA")]
    Metadata { key: String },
    /// The selector's own embedding space.
    #[serde(rename = "EMBEDDINGS")]
    Embeddings,
    /// Per-sample scores uploaded for a named task.
    #[serde(rename = "SCORES")]
    Scores { task: String, score: String },
}

impl StrategyInput {
    fn source_name(&self) -> &'static str {
        match self {
            StrategyInput::Metadata { .. } => "METADATA",
            StrategyInput::Embeddings => "EMBEDDINGS",
            StrategyInput::Scores { .. } => "SCORES",
        }
    }
}

/// How the selector combines an input into its sampling objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StrategyKind {
    /// Match an explicit target distribution over a categorical input.
    #[serde(rename = "BALANCE")]
    Balance { target: BTreeMap<String, f64> },
    /// Spread selected samples across the input space.
    #[serde(rename = "DIVERSITY")]
    Diversity,
    /// Weight selection probability by the input score.
    #[serde(rename = "WEIGHTS")]
    Weights,
}

/// One scoring strategy: an input source paired with a strategy kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub input: StrategyInput,
    #[serde(rename = "strategy")]
    pub kind: StrategyKind,
}

/// The configuration sent to the external selector for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub n_samples: usize,
    pub strategies: Vec<Strategy>,
}

impl SelectionRequest {
    /// Cold-start request: balance a metadata key and diversify embeddings.
    ///
    /// Used for the first round, before any model exists. Strategy order is
    /// fixed for reproducible request payloads.
    pub fn cold_start(
        n_samples: usize,
        balance_key: &str,
        targets: &BTreeMap<String, f64>,
    ) -> Self {
        Self {
            n_samples,
            strategies: vec![
                Strategy {
                    input: StrategyInput::Metadata {
                        key: balance_key.to_string(),
                    },
                    kind: StrategyKind::Balance {
                        target: targets.clone(),
                    },
                },
                Strategy {
                    input: StrategyInput::Embeddings,
                    kind: StrategyKind::Diversity,
                },
            ],
        }
    }

    /// Uncertainty-weighted request for rounds that have prior predictions.
    pub fn uncertainty(n_samples: usize, task: &str) -> Self {
        Self {
            n_samples,
            strategies: vec![Strategy {
                input: StrategyInput::Scores {
                    task: task.to_string(),
                    score: UNCERTAINTY_ENTROPY_SCORE.to_string(),
                },
                kind: StrategyKind::Weights,
            }],
        }
    }

    /// Clamp the batch size to the number of currently unlabeled samples.
    ///
    /// A partial final batch is an expected end-of-dataset condition, so this
    /// degrades with a warning instead of failing.
    pub fn clamp_to_available(mut self, available: usize) -> Self {
        if self.n_samples > available {
            tracing::warn!(
                requested = self.n_samples,
                available,
                "Clamping selection batch to the unlabeled remainder"
            );
            self.n_samples = available;
        }
        self
    }

    /// Check request invariants before submission.
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.n_samples == 0 {
            return Err(SelectionError::EmptyRequest);
        }
        let mut seen = Vec::new();
        for strategy in &self.strategies {
            let source = strategy.input.source_name();
            if seen.contains(&source) {
                return Err(SelectionError::DuplicateInputSource(source));
            }
            seen.push(source);
        }
        Ok(())
    }
}
