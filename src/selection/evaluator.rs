use std::time::{Duration, Instant};

use crate::catalog::FeatureCatalog;
use crate::data::model::EnergyDataset;
use crate::error::{DeadlineReached, Result, SelectionError};
use crate::service::{
    EvalRequest, EvaluationService, MetricOptions, MetricService, Prior, ScoringMethod,
    ServiceError,
};

use super::mask::{invert_if_backward, Direction, FeatureWeights, SelectionMask};

/// Which scalar of the metrics bundle a selection maximises.
#[derive(Debug, Clone, PartialEq)]
pub struct Scoring {
    /// Name of a scalar in the bundle, e.g. `top_1_accuracy`.
    pub metric: String,
    pub method: ScoringMethod,
}

impl Scoring {
    pub fn new(metric: impl Into<String>, method: ScoringMethod) -> Self {
        Self {
            metric: metric.into(),
            method,
        }
    }
}

/// Scores one candidate feature on top of a base subset.
///
/// Holds everything that stays fixed for a selection run; each
/// [`evaluate`](Self::evaluate) call is one model fit plus one metric
/// computation.
pub struct CandidateEvaluator<'a> {
    evaluation: &'a dyn EvaluationService,
    metrics: &'a dyn MetricService,
    catalog: &'a FeatureCatalog,
    prior: Prior,
    scoring: Scoring,
    deadline: Option<Duration>,
    shuffle: bool,
}

impl<'a> CandidateEvaluator<'a> {
    pub fn new(
        evaluation: &'a dyn EvaluationService,
        metrics: &'a dyn MetricService,
        catalog: &'a FeatureCatalog,
        prior: Prior,
        scoring: Scoring,
    ) -> Self {
        Self {
            evaluation,
            metrics,
            catalog,
            prior,
            scoring,
            deadline: None,
            shuffle: true,
        }
    }

    /// Bound each evaluation; overruns fail with `DeadlineExceeded`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        self.catalog
    }

    pub fn scoring(&self) -> &Scoring {
        &self.scoring
    }

    /// Score `candidate` added to `base`.
    ///
    /// `base` must cover the catalog and `candidate` must not be in it yet.
    /// With [`Direction::Backward`] the complement of the grown subset is what
    /// gets fitted.
    pub fn evaluate(
        &self,
        dataset: &EnergyDataset,
        base: &SelectionMask,
        candidate: usize,
        direction: Direction,
    ) -> Result<f64> {
        base.check_against(self.catalog)?;
        if candidate >= base.len() {
            return Err(SelectionError::InvalidCandidate {
                index: candidate,
                reason: "index outside the catalog",
            });
        }
        if base.is_selected(candidate) {
            return Err(SelectionError::InvalidCandidate {
                index: candidate,
                reason: "already selected",
            });
        }

        let trial = invert_if_backward(base.with_flipped(candidate), direction);
        let weights = FeatureWeights::from_mask(self.catalog, &trial)?;
        self.score_weights(dataset, &weights)
    }

    /// Fit with exactly `weights` and return the configured scalar metric.
    pub fn score_weights(&self, dataset: &EnergyDataset, weights: &FeatureWeights) -> Result<f64> {
        let started = Instant::now();
        let request = EvalRequest::new(dataset.ground_truth(), self.prior, dataset.validity())
            .with_weights(weights)
            .with_shuffle(self.shuffle)
            .with_deadline(self.deadline.and_then(|limit| started.checked_add(limit)));

        let predictions = self
            .evaluation
            .run(&request)
            .map_err(|e| self.service_error(e))?;

        if let Some(limit) = self.deadline {
            if started.elapsed() > limit {
                return Err(SelectionError::DeadlineExceeded { limit });
            }
        }

        let bundle = self
            .metrics
            .compute(&predictions, self.scoring.method, &MetricOptions::default())
            .map_err(|e| self.service_error(e))?;

        bundle
            .scalar(&self.scoring.metric)
            .ok_or_else(|| SelectionError::MissingMetric {
                name: self.scoring.metric.clone(),
            })
    }

    fn service_error(&self, err: ServiceError) -> SelectionError {
        match self.deadline {
            Some(limit) if err.is::<DeadlineReached>() => SelectionError::DeadlineExceeded { limit },
            _ => SelectionError::ServiceFailure(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Predictions;
    use crate::testing::{tiny_dataset, StubEvaluation, StubMetrics};

    fn catalog() -> FeatureCatalog {
        FeatureCatalog::new(["A", "B", "C"]).unwrap()
    }

    fn top_1() -> Scoring {
        Scoring::new("top_1_accuracy", ScoringMethod::TopK)
    }

    #[test]
    fn forward_scores_base_plus_candidate() {
        let eval = StubEvaluation::scored(&[("A+C", 0.8)]);
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1());

        let base = SelectionMask::with_selected(3, &[0]);
        let score = evaluator
            .evaluate(&tiny_dataset(), &base, 2, Direction::Forward)
            .unwrap();

        assert_eq!(score, 0.8);
        assert_eq!(eval.requests(), vec!["A+C"]);
        assert_eq!(base, SelectionMask::with_selected(3, &[0]));
    }

    #[test]
    fn backward_scores_complement() {
        let eval = StubEvaluation::scored(&[("B", 0.6)]);
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1());

        let base = SelectionMask::with_selected(3, &[0]);
        let score = evaluator
            .evaluate(&tiny_dataset(), &base, 2, Direction::Backward)
            .unwrap();

        assert_eq!(score, 0.6);
        assert_eq!(eval.requests(), vec!["B"]);
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let eval = StubEvaluation::scored(&[("B", 0.9)]);
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1());
        let base = SelectionMask::empty(3);
        let data = tiny_dataset();

        let first = evaluator.evaluate(&data, &base, 1, Direction::Forward).unwrap();
        let second = evaluator.evaluate(&data, &base, 1, Direction::Forward).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn selected_or_out_of_range_candidates_are_rejected() {
        let eval = StubEvaluation::default();
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1());
        let base = SelectionMask::with_selected(3, &[1]);
        let data = tiny_dataset();

        assert!(matches!(
            evaluator.evaluate(&data, &base, 1, Direction::Forward),
            Err(SelectionError::InvalidCandidate { index: 1, .. })
        ));
        assert!(matches!(
            evaluator.evaluate(&data, &base, 3, Direction::Forward),
            Err(SelectionError::InvalidCandidate { index: 3, .. })
        ));
        assert!(matches!(
            evaluator.evaluate(&data, &SelectionMask::empty(2), 0, Direction::Forward),
            Err(SelectionError::InvalidShape(_))
        ));
        assert_eq!(eval.calls(), 0);
    }

    #[test]
    fn unknown_metric_is_missing_metric() {
        let eval = StubEvaluation::default();
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let scoring = Scoring::new("top_20_accuracy", ScoringMethod::TopK);
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, scoring);

        let err = evaluator
            .evaluate(&tiny_dataset(), &SelectionMask::empty(3), 0, Direction::Forward)
            .unwrap_err();
        assert!(matches!(err, SelectionError::MissingMetric { name } if name == "top_20_accuracy"));
    }

    #[test]
    fn service_failure_is_passed_through_verbatim() {
        let eval = StubEvaluation::default().failing_on("C");
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1());

        let err = evaluator
            .evaluate(&tiny_dataset(), &SelectionMask::empty(3), 2, Direction::Forward)
            .unwrap_err();
        assert!(matches!(err, SelectionError::ServiceFailure(_)));
        assert_eq!(err.to_string(), "fit diverged for C");
        assert_eq!(metrics.calls(), 0);
    }

    struct Slow {
        cooperative: bool,
    }

    impl EvaluationService for Slow {
        fn run(&self, request: &EvalRequest<'_>) -> std::result::Result<Predictions, ServiceError> {
            if self.cooperative && request.deadline.is_some() {
                return Err(DeadlineReached.into());
            }
            std::thread::sleep(Duration::from_millis(20));
            StubEvaluation::default().run(request)
        }
    }

    #[test]
    fn deadline_overrun_is_a_distinct_error() {
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let data = tiny_dataset();
        let base = SelectionMask::empty(3);

        for cooperative in [true, false] {
            let eval = Slow { cooperative };
            let evaluator =
                CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1())
                    .with_deadline(Some(Duration::from_millis(1)));
            let err = evaluator
                .evaluate(&data, &base, 0, Direction::Forward)
                .unwrap_err();
            assert!(matches!(err, SelectionError::DeadlineExceeded { .. }));
        }
        assert_eq!(metrics.calls(), 0);
    }

    #[test]
    fn unreachable_deadline_does_not_overflow() {
        let eval = StubEvaluation::scored(&[("A", 0.7)]);
        let metrics = StubMetrics::default();
        let catalog = catalog();
        let evaluator = CandidateEvaluator::new(&eval, &metrics, &catalog, Prior::Host, top_1())
            .with_deadline(Some(Duration::MAX));

        let score = evaluator
            .evaluate(&tiny_dataset(), &SelectionMask::empty(3), 0, Direction::Forward)
            .unwrap();
        assert_eq!(score, 0.7);
    }
}
