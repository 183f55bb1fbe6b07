//! Greedy sequential feature selection.
//!
//! Each step scores every untried catalog feature on top of the features
//! chosen so far and keeps the best one:
//!
//! ```text
//! Init (mask all false) ──► Iterate (step < budget) ──► Done (step == budget)
//!                             │   score candidates
//!                             │   pick max (lowest index on ties)
//!                             └── flip it in the mask
//! ```
//!
//! The cost is `budget × |candidates|` model fits, which is why scoring can
//! optionally fan out over a rayon pool.

use rayon::prelude::*;

use crate::data::model::EnergyDataset;
use crate::error::{Result, SelectionError};

use super::evaluator::CandidateEvaluator;
use super::mask::{Direction, SelectionMask};

/// Scores of every candidate tried in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub step: usize,
    /// (feature key, score) in catalog order.
    pub scores: Vec<(String, f64)>,
}

/// Result of a selection run.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    /// Feature keys in the order they were chosen.
    pub chosen: Vec<String>,
    /// Best score of each step.
    pub scores: Vec<f64>,
    /// Final mask, `chosen.len()` entries set.
    pub mask: SelectionMask,
    pub records: Vec<ScoreRecord>,
}

pub struct GreedySelector<'a> {
    evaluator: CandidateEvaluator<'a>,
    parallel: bool,
    dry_run: bool,
}

impl<'a> GreedySelector<'a> {
    pub fn new(evaluator: CandidateEvaluator<'a>) -> Self {
        Self {
            evaluator,
            parallel: false,
            dry_run: false,
        }
    }

    /// Score the candidates of a step concurrently.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Stop after the first step.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn evaluator(&self) -> &CandidateEvaluator<'a> {
        &self.evaluator
    }

    /// Choose `budget` features greedily.
    pub fn select(
        &self,
        dataset: &EnergyDataset,
        budget: usize,
        direction: Direction,
    ) -> Result<SelectionOutcome> {
        let catalog = self.evaluator.catalog();
        if budget > catalog.len() {
            return Err(SelectionError::ExhaustedCandidates {
                budget,
                available: catalog.len(),
            });
        }

        let steps = if self.dry_run { budget.min(1) } else { budget };
        let mut mask = SelectionMask::empty(catalog.len());
        let mut outcome = SelectionOutcome {
            chosen: Vec::with_capacity(steps),
            scores: Vec::with_capacity(steps),
            mask: mask.clone(),
            records: Vec::with_capacity(steps),
        };

        for step in 0..steps {
            let candidates = mask.candidate_indices();
            let scored = self.score_candidates(dataset, &mask, &candidates, direction)?;
            let (best, best_score) =
                pick_best(&scored).ok_or(SelectionError::ExhaustedCandidates {
                    budget,
                    available: catalog.len(),
                })?;

            let record = ScoreRecord {
                step,
                scores: scored
                    .iter()
                    .map(|&(i, s)| (catalog.key(i).unwrap_or_default().to_string(), s))
                    .collect(),
            };
            log::debug!("step {step} scores: {:?}", record.scores);

            let key = catalog.key(best).unwrap_or_default().to_string();
            log::info!(
                "step {}/{}: chose '{}' ({} = {:.4})",
                step + 1,
                steps,
                key,
                self.evaluator.scoring().metric,
                best_score
            );

            mask.select(best);
            outcome.chosen.push(key);
            outcome.scores.push(best_score);
            outcome.records.push(record);
        }

        if self.dry_run && budget > steps {
            log::info!("dry run: stopped after {steps} of {budget} steps");
        }

        outcome.mask = mask;
        Ok(outcome)
    }

    /// (candidate index, score) for every candidate, in catalog order.
    fn score_candidates(
        &self,
        dataset: &EnergyDataset,
        mask: &SelectionMask,
        candidates: &[usize],
        direction: Direction,
    ) -> Result<Vec<(usize, f64)>> {
        let score = |&i: &usize| {
            self.evaluator
                .evaluate(dataset, mask, i, direction)
                .map(|s| (i, s))
        };
        if self.parallel {
            candidates.par_iter().map(score).collect()
        } else {
            candidates.iter().map(score).collect()
        }
    }
}

/// Highest score, first in order on ties. `NaN` only wins when nothing else
/// is available.
fn pick_best(scored: &[(usize, f64)]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for &(i, s) in scored {
        let better = match best {
            None => true,
            Some((_, b)) => (b.is_nan() && !s.is_nan()) || s > b,
        };
        if better {
            best = Some((i, s));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FeatureCatalog;
    use crate::selection::evaluator::Scoring;
    use crate::service::{Prior, ScoringMethod};
    use crate::testing::{tiny_dataset, StubEvaluation, StubMetrics};

    fn abc() -> FeatureCatalog {
        FeatureCatalog::new(["A", "B", "C"]).unwrap()
    }

    fn selector<'a>(
        eval: &'a StubEvaluation,
        metrics: &'a StubMetrics,
        catalog: &'a FeatureCatalog,
    ) -> GreedySelector<'a> {
        let scoring = Scoring::new("top_1_accuracy", ScoringMethod::TopK);
        GreedySelector::new(CandidateEvaluator::new(
            eval,
            metrics,
            catalog,
            Prior::Host,
            scoring,
        ))
    }

    fn scenario() -> StubEvaluation {
        StubEvaluation::scored(&[
            ("A", 0.5),
            ("B", 0.9),
            ("C", 0.3),
            ("A+B", 0.95),
            ("B+C", 0.7),
        ])
    }

    #[test]
    fn picks_b_then_a() {
        let eval = scenario();
        let metrics = StubMetrics::default();
        let catalog = abc();
        let outcome = selector(&eval, &metrics, &catalog)
            .select(&tiny_dataset(), 2, Direction::Forward)
            .unwrap();

        assert_eq!(outcome.chosen, vec!["B", "A"]);
        assert_eq!(outcome.scores, vec![0.9, 0.95]);
        assert_eq!(outcome.mask.selected_indices(), vec![0, 1]);
        assert_eq!(eval.calls(), 3 + 2);
        assert_eq!(outcome.records[1].scores.len(), 2);
    }

    #[test]
    fn scores_match_fresh_evaluations_of_each_prefix() {
        let eval = scenario();
        let metrics = StubMetrics::default();
        let catalog = abc();
        let sel = selector(&eval, &metrics, &catalog);
        let data = tiny_dataset();
        let outcome = sel.select(&data, 3, Direction::Forward).unwrap();

        assert_eq!(outcome.chosen.len(), 3);
        let mut prefix = SelectionMask::empty(catalog.len());
        for (key, &score) in outcome.chosen.iter().zip(&outcome.scores) {
            let idx = catalog.position(key).unwrap();
            let fresh = sel
                .evaluator()
                .evaluate(&data, &prefix, idx, Direction::Forward)
                .unwrap();
            assert_eq!(fresh, score);
            prefix.select(idx);
        }
    }

    #[test]
    fn ties_go_to_lower_catalog_index() {
        let eval = StubEvaluation::scored(&[("A", 0.2), ("B", 0.7), ("C", 0.7)]);
        let metrics = StubMetrics::default();
        let catalog = abc();
        let outcome = selector(&eval, &metrics, &catalog)
            .select(&tiny_dataset(), 1, Direction::Forward)
            .unwrap();
        assert_eq!(outcome.chosen, vec!["B"]);
    }

    #[test]
    fn zero_budget_calls_nothing() {
        let eval = scenario();
        let metrics = StubMetrics::default();
        let catalog = abc();
        let outcome = selector(&eval, &metrics, &catalog)
            .select(&tiny_dataset(), 0, Direction::Forward)
            .unwrap();
        assert!(outcome.chosen.is_empty());
        assert!(outcome.scores.is_empty());
        assert_eq!(eval.calls(), 0);
        assert_eq!(metrics.calls(), 0);
    }

    #[test]
    fn full_budget_succeeds_and_larger_fails() {
        let eval = scenario();
        let metrics = StubMetrics::default();
        let catalog = abc();
        let sel = selector(&eval, &metrics, &catalog);

        let outcome = sel.select(&tiny_dataset(), 3, Direction::Forward).unwrap();
        assert_eq!(outcome.mask.count(), 3);

        let calls_before = eval.calls();
        let err = sel.select(&tiny_dataset(), 4, Direction::Forward).unwrap_err();
        assert!(matches!(
            err,
            SelectionError::ExhaustedCandidates {
                budget: 4,
                available: 3
            }
        ));
        assert_eq!(eval.calls(), calls_before);
    }

    #[test]
    fn backward_keeps_forward_bookkeeping() {
        // Complements: picking A evaluates {B, C}, picking B evaluates {A, C}, ...
        let eval = StubEvaluation::scored(&[("B+C", 0.1), ("A+C", 0.8), ("A+B", 0.4), ("C", 0.6)]);
        let metrics = StubMetrics::default();
        let catalog = abc();
        let outcome = selector(&eval, &metrics, &catalog)
            .select(&tiny_dataset(), 2, Direction::Backward)
            .unwrap();
        assert_eq!(outcome.chosen, vec!["B", "A"]);
        assert_eq!(outcome.scores, vec![0.8, 0.6]);
    }

    #[test]
    fn parallel_matches_sequential() {
        let catalog = FeatureCatalog::new(["A", "B", "C", "D", "E"]).unwrap();
        let table = [
            ("A", 0.3),
            ("B", 0.6),
            ("C", 0.6),
            ("D", 0.1),
            ("B+E", 0.9),
            ("A+B", 0.9),
        ];
        let metrics = StubMetrics::default();
        let seq_eval = StubEvaluation::scored(&table);
        let par_eval = StubEvaluation::scored(&table);

        let seq = selector(&seq_eval, &metrics, &catalog)
            .select(&tiny_dataset(), 2, Direction::Forward)
            .unwrap();
        let par = selector(&par_eval, &metrics, &catalog)
            .parallel(true)
            .select(&tiny_dataset(), 2, Direction::Forward)
            .unwrap();

        assert_eq!(seq.chosen, vec!["B", "A"]);
        assert_eq!(par.chosen, seq.chosen);
        assert_eq!(par.scores, seq.scores);
        assert_eq!(par.records, seq.records);
    }

    #[test]
    fn dry_run_stops_after_one_step() {
        let eval = scenario();
        let metrics = StubMetrics::default();
        let catalog = abc();
        let outcome = selector(&eval, &metrics, &catalog)
            .dry_run(true)
            .select(&tiny_dataset(), 3, Direction::Forward)
            .unwrap();
        assert_eq!(outcome.chosen, vec!["B"]);
        assert_eq!(eval.calls(), 3);
    }

    #[test]
    fn failing_candidate_aborts_the_step() {
        let eval = scenario().failing_on("C");
        let metrics = StubMetrics::default();
        let catalog = abc();
        let err = selector(&eval, &metrics, &catalog)
            .select(&tiny_dataset(), 2, Direction::Forward)
            .unwrap_err();
        assert!(matches!(err, SelectionError::ServiceFailure(_)));
    }

    #[test]
    fn nan_scores_lose_to_numbers() {
        assert_eq!(pick_best(&[(0, f64::NAN), (1, 0.2)]), Some((1, 0.2)));
        let only_nan = pick_best(&[(3, f64::NAN)]).unwrap();
        assert_eq!(only_nan.0, 3);
        assert_eq!(pick_best(&[]), None);
    }
}
