//! Deterministic stand-ins for the evaluation and metric services.
//!
//! [`StubEvaluation`] looks up the requested feature subset in a table and
//! smuggles the stored `(rmse, top_1)` pair through a 1x2 prediction matrix;
//! [`StubMetrics`] reads it back out. Both count their calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ndarray::array;

use crate::data::model::{EnergyDataset, GroundTruth, LabeledMatrix};
use crate::service::{
    EvalRequest, EvaluationService, MetricOptions, MetricService, MetricsBundle, Predictions,
    Prior, ScoringMethod, ServiceError,
};

/// Table key of a request: `identity`, or the sorted feature keys joined by `+`.
pub fn subset_key(request: &EvalRequest<'_>) -> String {
    match (request.prior, request.weights) {
        (Prior::Identity, _) => "identity".to_string(),
        (_, None) => "*".to_string(),
        (_, Some(weights)) => weights.keys().collect::<Vec<_>>().join("+"),
    }
}

#[derive(Default)]
pub struct StubEvaluation {
    outcomes: HashMap<String, (f64, f64)>,
    default: (f64, f64),
    fail_on: Option<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

impl StubEvaluation {
    /// Subsets scored by `top_1` alone; rmse is `1 - top_1`.
    pub fn scored(entries: &[(&str, f64)]) -> Self {
        Self {
            outcomes: entries
                .iter()
                .map(|(k, s)| (k.to_string(), (1.0 - s, *s)))
                .collect(),
            ..Default::default()
        }
    }

    /// Subsets with explicit `(rmse, top_1)`.
    pub fn with_outcomes(entries: &[(&str, (f64, f64))]) -> Self {
        Self {
            outcomes: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, key: &str) -> Self {
        self.fail_on = Some(key.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subset keys in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl EvaluationService for StubEvaluation {
    fn run(&self, request: &EvalRequest<'_>) -> Result<Predictions, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = subset_key(request);
        self.requests.lock().unwrap().push(key.clone());

        if self.fail_on.as_deref() == Some(key.as_str()) {
            anyhow::bail!("fit diverged for {key}");
        }

        let (rmse, top_1) = self.outcomes.get(&key).copied().unwrap_or(self.default);
        let predicted = GroundTruth::new(
            vec!["stub".into()],
            vec!["rmse".into(), "top_1".into()],
            array![[rmse, top_1]],
        )?;
        let mask = predicted.observed();
        Ok(Predictions {
            truth: predicted.clone(),
            predicted,
            mask,
        })
    }
}

#[derive(Default)]
pub struct StubMetrics {
    calls: AtomicUsize,
}

impl StubMetrics {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetricService for StubMetrics {
    fn compute(
        &self,
        predictions: &Predictions,
        _method: ScoringMethod,
        _options: &MetricOptions,
    ) -> Result<MetricsBundle, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rmse = predictions.predicted.values[[0, 0]];
        let top_1 = predictions.predicted.values[[0, 1]];
        Ok(MetricsBundle {
            rmse_scores: rmse,
            spearman_scores: top_1,
            top_1_accuracy: top_1,
            top_3_accuracy: top_1,
            top_5_accuracy: top_1,
            top_20_accuracies: vec![top_1; 20],
            ..Default::default()
        })
    }
}

/// A small guests × hosts dataset with one missing entry.
pub fn tiny_dataset() -> EnergyDataset {
    let gt = LabeledMatrix::new(
        vec!["g1".into(), "g2".into(), "g3".into()],
        vec!["h1".into(), "h2".into()],
        array![[-10.0, -4.0], [-3.0, f64::NAN], [-8.0, -9.0]],
    )
    .unwrap();
    EnergyDataset::from_observed(gt)
}
