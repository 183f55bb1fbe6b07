//! Contracts of the collaborators the selection core calls.
//!
//! The core only sees [`EvaluationService`] and [`MetricService`]. The
//! submodules hold the reference implementations shipped with the crate:
//! [`kernel::KernelRidge`] fits a kernel ridge regression per fold and
//! [`metrics::RankingMetrics`] scores the predictions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::data::model::{GroundTruth, Orientation, ValidityMask};
use crate::selection::mask::FeatureWeights;

pub mod kernel;
pub mod metrics;

/// Errors raised by a service. The core passes them on untouched.
pub type ServiceError = anyhow::Error;

// ---------------------------------------------------------------------------
// Prior – which descriptors the model is fitted on
// ---------------------------------------------------------------------------

/// Prior identifier passed to the evaluation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prior {
    /// No descriptors: every entity is only similar to itself.
    Identity,
    /// Guest-molecule descriptors (guests are the matrix rows).
    Guest,
    /// Host-structure descriptors (hosts are the matrix rows).
    Host,
    /// Skinny rows: guest descriptors followed by host descriptors.
    Paired,
}

impl Prior {
    /// The descriptor family of the row entities for an orientation.
    pub fn for_rows(orientation: Orientation) -> Self {
        match orientation {
            Orientation::GuestsAsRows => Prior::Guest,
            Orientation::HostsAsRows => Prior::Host,
        }
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Prior::Identity => "identity",
            Prior::Guest => "guest",
            Prior::Host => "host",
            Prior::Paired => "paired",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ScoringMethod
// ---------------------------------------------------------------------------

/// How the metric service computes top-k accuracies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    /// A row is a hit when its true best column is among the k best predicted.
    #[default]
    TopK,
    /// Overlap between the true top-k and predicted top-k columns, over k.
    TopKInTopK,
}

impl fmt::Display for ScoringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringMethod::TopK => f.write_str("top_k"),
            ScoringMethod::TopKInTopK => f.write_str("top_k_in_top_k"),
        }
    }
}

impl FromStr for ScoringMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top_k" => Ok(ScoringMethod::TopK),
            "top_k_in_top_k" => Ok(ScoringMethod::TopKInTopK),
            other => Err(format!(
                "unknown scoring method '{other}' (expected top_k or top_k_in_top_k)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation service
// ---------------------------------------------------------------------------

/// One evaluation: cross-validated predictions for `ground_truth` using the
/// `prior` descriptors restricted to `weights`.
#[derive(Debug, Clone, Copy)]
pub struct EvalRequest<'a> {
    pub ground_truth: &'a GroundTruth,
    pub prior: Prior,
    pub validity: &'a ValidityMask,
    /// Features to use and their weights; `None` means every feature at 1.0.
    pub weights: Option<&'a FeatureWeights>,
    /// Shuffle rows before splitting into folds.
    pub shuffle: bool,
    /// Scale applied to the descriptors before the kernel is computed.
    pub norm_factor: Option<f64>,
    /// Services should give up with [`crate::error::DeadlineReached`] past this.
    pub deadline: Option<Instant>,
}

impl<'a> EvalRequest<'a> {
    pub fn new(ground_truth: &'a GroundTruth, prior: Prior, validity: &'a ValidityMask) -> Self {
        Self {
            ground_truth,
            prior,
            validity,
            weights: None,
            shuffle: true,
            norm_factor: None,
            deadline: None,
        }
    }

    pub fn with_weights(mut self, weights: &'a FeatureWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_norm_factor(mut self, norm_factor: Option<f64>) -> Self {
        self.norm_factor = norm_factor;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Predicted, true and mask matrices of identical layout.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub predicted: GroundTruth,
    pub truth: GroundTruth,
    pub mask: ValidityMask,
}

pub trait EvaluationService: Send + Sync {
    fn run(&self, request: &EvalRequest<'_>) -> Result<Predictions, ServiceError>;
}

// ---------------------------------------------------------------------------
// Metric service
// ---------------------------------------------------------------------------

/// Named metrics of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub rmse_scores: f64,
    pub spearman_scores: f64,
    pub top_1_accuracy: f64,
    pub top_3_accuracy: f64,
    pub top_5_accuracy: f64,
    /// Accuracy for k = 1..=20.
    pub top_20_accuracies: Vec<f64>,
    /// Service-specific scalars beyond the fixed set.
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
}

impl MetricsBundle {
    /// Look up a scalar metric by name.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match name {
            "rmse_scores" => Some(self.rmse_scores),
            "spearman_scores" => Some(self.spearman_scores),
            "top_1_accuracy" => Some(self.top_1_accuracy),
            "top_3_accuracy" => Some(self.top_3_accuracy),
            "top_5_accuracy" => Some(self.top_5_accuracy),
            other => self.extra.get(other).copied(),
        }
    }
}

/// Optional knobs of a metric computation.
#[derive(Debug, Clone, Default)]
pub struct MetricOptions {
    /// Log the full bundle at info level.
    pub verbose: bool,
    /// Tag for log lines (usually the tested prior).
    pub meta: Option<String>,
    /// Persist the bundle as JSON.
    pub to_write: Option<PathBuf>,
}

pub trait MetricService: Send + Sync {
    fn compute(
        &self,
        predictions: &Predictions,
        method: ScoringMethod,
        options: &MetricOptions,
    ) -> Result<MetricsBundle, ServiceError>;
}
