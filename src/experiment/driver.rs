use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::catalog::FeatureCatalog;
use crate::config::{Config, SelectionConfig};
use crate::data::model::{EnergyDataset, Orientation};
use crate::data::persist::save_matrix;
use crate::render::MatrixPlotter;
use crate::selection::{CandidateEvaluator, FeatureWeights, GreedySelector, SelectionOutcome};
use crate::service::{
    EvalRequest, EvaluationService, MetricOptions, MetricService, MetricsBundle, Predictions,
    Prior, ScoringMethod,
};

use super::report::{ExperimentResult, IDENTITY};

/// Colour range of prediction heatmaps, in energy units.
pub const PLOT_RANGE: (f64, f64) = (-30.0, 5.0);

/// Label of the all-features top-k accuracy plot.
pub const TOP_K_CURVE: &str = "top_k_curve";

// ---------------------------------------------------------------------------
// Settings and plans
// ---------------------------------------------------------------------------

/// Knobs shared by every experiment of a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub shuffle: bool,
    /// Descriptor scale of the all-features sweep run.
    pub norm_factor: f64,
    pub output_dir: PathBuf,
    pub plot: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shuffle: config.model.shuffle,
            norm_factor: config.model.norm_factor,
            output_dir: config.output.directory.clone(),
            plot: config.output.plot,
        }
    }
}

/// Row layout of a cross-validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One entity family as rows, the other as columns.
    Wide(Orientation),
    /// One row per (guest, host) pair, scored back in the wide layout.
    Skinny,
}

impl Layout {
    pub fn prior(&self) -> Prior {
        match self {
            Layout::Wide(orientation) => Prior::for_rows(*orientation),
            Layout::Skinny => Prior::Paired,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidationPlan {
    pub layout: Layout,
    /// Keep only the leading `(rows, cols)` block of the wide matrix.
    pub downsample: Option<(usize, usize)>,
    pub method: ScoringMethod,
    pub save_predictions: bool,
    /// Write the metrics bundle as JSON to the output directory.
    pub write_metrics: bool,
    /// Log this many rows with the largest squared error.
    pub inspect: Option<usize>,
}

impl CrossValidationPlan {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            downsample: None,
            method: ScoringMethod::TopK,
            save_predictions: false,
            write_metrics: false,
            inspect: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrossValidationOutcome {
    pub metrics: MetricsBundle,
    /// Predictions in the wide layout.
    pub predictions: Predictions,
    /// (row label, mean squared error) of the inspected rows, worst first.
    pub worst_rows: Vec<(String, f64)>,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Ranked per-feature results plus the identity baseline.
    pub result: ExperimentResult,
    pub report_lines: Vec<String>,
    /// All catalog features together; not part of the report.
    pub combined: MetricsBundle,
}

#[derive(Debug, Clone)]
pub struct GreedyRunOutcome {
    pub selection: SelectionOutcome,
    /// Metrics of a fit on the chosen features alone; `None` when nothing
    /// was chosen.
    pub final_metrics: Option<MetricsBundle>,
}

// ---------------------------------------------------------------------------
// ExperimentDriver
// ---------------------------------------------------------------------------

/// Runs the three experiment modes against a pair of services.
pub struct ExperimentDriver<'a> {
    evaluation: &'a dyn EvaluationService,
    metrics: &'a dyn MetricService,
    plotter: &'a dyn MatrixPlotter,
    settings: DriverSettings,
}

impl<'a> ExperimentDriver<'a> {
    pub fn new(
        evaluation: &'a dyn EvaluationService,
        metrics: &'a dyn MetricService,
        plotter: &'a dyn MatrixPlotter,
        settings: DriverSettings,
    ) -> Self {
        Self {
            evaluation,
            metrics,
            plotter,
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// One cross-validated fit with the layout's row prior.
    ///
    /// `dataset` is stored with guests as rows.
    pub fn cross_validate(
        &self,
        dataset: &EnergyDataset,
        plan: &CrossValidationPlan,
    ) -> Result<CrossValidationOutcome> {
        let wide = match plan.layout {
            Layout::Wide(orientation) => dataset.oriented(orientation),
            Layout::Skinny => dataset.clone(),
        };
        let wide = match plan.downsample {
            Some(shape) => wide.downsampled(shape)?,
            None => wide,
        };
        let prior = plan.layout.prior();
        log::info!(
            "cross-validating {} prior on {:?} matrix ({} observations)",
            prior,
            wide.shape(),
            wide.observation_count()
        );

        let predictions = match plan.layout {
            Layout::Wide(_) => {
                let request = EvalRequest::new(wide.ground_truth(), prior, wide.validity())
                    .with_shuffle(self.settings.shuffle);
                self.evaluation.run(&request)?
            }
            Layout::Skinny => {
                let skinny = wide.skinny();
                let request = EvalRequest::new(skinny.ground_truth(), prior, skinny.validity())
                    .with_shuffle(false);
                let out = self.evaluation.run(&request)?;
                Predictions {
                    predicted: out
                        .predicted
                        .unmake_skinny(f64::NAN)
                        .context("restoring the wide layout of skinny predictions")?,
                    truth: wide.ground_truth().clone(),
                    mask: wide.validity().clone(),
                }
            }
        };

        let options = MetricOptions {
            verbose: true,
            meta: Some(prior.to_string()),
            to_write: plan
                .write_metrics
                .then(|| self.settings.output_dir.join(format!("{prior}_metrics.json"))),
        };
        let metrics = self.metrics.compute(&predictions, plan.method, &options)?;

        if plan.save_predictions {
            let path = self.settings.output_dir.join(format!("{prior}_predictions.csv"));
            save_matrix(&predictions.predicted, &path)?;
        }
        if self.settings.plot {
            let (vmin, vmax) = PLOT_RANGE;
            self.plotter.plot(
                &predictions.predicted,
                &format!("{prior}_predicted"),
                Some(vmin),
                Some(vmax),
            )?;
        }

        let worst_rows = match plan.inspect {
            Some(n) => {
                let worst = worst_rows(&predictions, n);
                for (label, mse) in &worst {
                    log::info!("[{prior}] poorly predicted row '{label}': mse {mse:.4}");
                }
                worst
            }
            None => Vec::new(),
        };

        Ok(CrossValidationOutcome {
            metrics,
            predictions,
            worst_rows,
        })
    }

    /// Score each feature on its own plus the identity baseline, rank and
    /// report them, then fit every catalog feature together.
    pub fn sweep_priors(
        &self,
        dataset: &EnergyDataset,
        prior: Prior,
        catalog: &FeatureCatalog,
        features: &[String],
        method: ScoringMethod,
        report_path: Option<&Path>,
    ) -> Result<SweepOutcome> {
        let mut result = ExperimentResult::new();

        for feature in features {
            let weights = FeatureWeights::uniform([feature.as_str()]);
            let request = EvalRequest::new(dataset.ground_truth(), prior, dataset.validity())
                .with_weights(&weights)
                .with_shuffle(self.settings.shuffle);
            let bundle = self
                .evaluate(&request, method, feature)
                .with_context(|| format!("sweeping feature '{feature}'"))?;
            result.push(feature.clone(), bundle);
        }

        let baseline = EvalRequest::new(dataset.ground_truth(), Prior::Identity, dataset.validity())
            .with_shuffle(self.settings.shuffle);
        let bundle = self
            .evaluate(&baseline, method, IDENTITY)
            .context("identity baseline")?;
        result.push(IDENTITY, bundle);

        result.rank();
        let report_lines = result.format_report();
        for line in &report_lines {
            log::info!("{line}");
        }
        if let Some(path) = report_path {
            result.save_report(path)?;
        }

        let combined = self.all_features(dataset, prior, catalog, method)?;
        Ok(SweepOutcome {
            result,
            report_lines,
            combined,
        })
    }

    fn all_features(
        &self,
        dataset: &EnergyDataset,
        prior: Prior,
        catalog: &FeatureCatalog,
        method: ScoringMethod,
    ) -> Result<MetricsBundle> {
        let weights = FeatureWeights::uniform(catalog.iter());
        let request = EvalRequest::new(dataset.ground_truth(), prior, dataset.validity())
            .with_weights(&weights)
            .with_shuffle(self.settings.shuffle)
            .with_norm_factor(Some(self.settings.norm_factor));
        let predictions = self.evaluation.run(&request).context("all-features run")?;
        let options = MetricOptions {
            verbose: true,
            meta: Some("all features".to_string()),
            to_write: None,
        };
        let bundle = self.metrics.compute(&predictions, method, &options)?;

        if self.settings.plot {
            let (vmin, vmax) = PLOT_RANGE;
            self.plotter
                .plot(&predictions.predicted, "full_pred", Some(vmin), Some(vmax))?;
            self.plotter
                .plot(&predictions.truth, "full_true", Some(vmin), Some(vmax))?;
            self.plotter
                .plot_curve(&bundle.top_20_accuracies, TOP_K_CURVE)?;
        }
        log::info!("all features top-k curve: {:?}", bundle.top_20_accuracies);
        Ok(bundle)
    }

    /// Greedy selection, then a fit on the chosen features alone.
    pub fn greedy_selection(
        &self,
        dataset: &EnergyDataset,
        catalog: &FeatureCatalog,
        prior: Prior,
        selection: &SelectionConfig,
    ) -> Result<GreedyRunOutcome> {
        let evaluator = CandidateEvaluator::new(
            self.evaluation,
            self.metrics,
            catalog,
            prior,
            selection.scoring(),
        )
        .with_deadline(selection.deadline())
        .with_shuffle(self.settings.shuffle);

        log::info!(
            "greedy {} selection of {} from {} {} features by {}",
            selection.direction,
            selection.budget,
            catalog.len(),
            prior,
            selection.metric
        );
        let outcome = GreedySelector::new(evaluator)
            .parallel(selection.parallel)
            .dry_run(selection.dry_run)
            .select(dataset, selection.budget, selection.direction)?;

        let final_metrics = if outcome.chosen.is_empty() {
            None
        } else {
            let weights = FeatureWeights::uniform(outcome.chosen.iter().map(String::as_str));
            let request = EvalRequest::new(dataset.ground_truth(), prior, dataset.validity())
                .with_weights(&weights)
                .with_shuffle(self.settings.shuffle);
            Some(
                self.evaluate(&request, selection.method, "selected")
                    .context("final fit on the selected features")?,
            )
        };

        log::info!("selected features: {:?}", outcome.chosen);
        Ok(GreedyRunOutcome {
            selection: outcome,
            final_metrics,
        })
    }

    fn evaluate(
        &self,
        request: &EvalRequest<'_>,
        method: ScoringMethod,
        tag: &str,
    ) -> Result<MetricsBundle> {
        let predictions = self.evaluation.run(request)?;
        let options = MetricOptions {
            verbose: false,
            meta: Some(tag.to_string()),
            to_write: None,
        };
        let bundle = self.metrics.compute(&predictions, method, &options)?;
        log::debug!("[{tag}] {bundle:?}");
        Ok(bundle)
    }
}

/// The `n` rows with the largest mean squared error over valid entries.
fn worst_rows(predictions: &Predictions, n: usize) -> Vec<(String, f64)> {
    let mut rows: Vec<(String, f64)> = predictions
        .truth
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, label)| {
            let errors: Vec<f64> = (0..predictions.truth.columns.len())
                .filter(|&j| predictions.mask.values[[i, j]])
                .map(|j| predictions.predicted.values[[i, j]] - predictions.truth.values[[i, j]])
                .filter(|d| d.is_finite())
                .map(|d| d * d)
                .collect();
            (!errors.is_empty())
                .then(|| (label.clone(), errors.iter().sum::<f64>() / errors.len() as f64))
        })
        .collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1));
    rows.truncate(n);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{GroundTruth, LabeledMatrix, PriorTable};
    use crate::render::NoopPlotter;
    use crate::selection::Direction;
    use crate::service::kernel::{KernelConfig, KernelRidge};
    use crate::service::metrics::RankingMetrics;
    use crate::testing::{tiny_dataset, StubEvaluation, StubMetrics};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlotter {
        labels: Mutex<Vec<String>>,
    }

    impl MatrixPlotter for RecordingPlotter {
        fn plot(&self, _: &GroundTruth, label: &str, vmin: Option<f64>, vmax: Option<f64>) -> Result<()> {
            assert_eq!((vmin, vmax), (Some(PLOT_RANGE.0), Some(PLOT_RANGE.1)));
            self.labels.lock().unwrap().push(label.to_string());
            Ok(())
        }

        fn plot_curve(&self, values: &[f64], label: &str) -> Result<()> {
            assert_eq!(values.len(), 20);
            self.labels.lock().unwrap().push(label.to_string());
            Ok(())
        }
    }

    fn quiet() -> DriverSettings {
        DriverSettings {
            plot: false,
            ..DriverSettings::default()
        }
    }

    fn names(n: usize, prefix: &str) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    /// 8 guests x 4 hosts with energies driven by one guest and one host
    /// descriptor.
    fn kernel_setup() -> (EnergyDataset, KernelRidge) {
        let guests = PriorTable::new(
            names(8, "g"),
            vec!["volume".into()],
            ndarray::Array2::from_shape_fn((8, 1), |(i, _)| i as f64),
        )
        .unwrap();
        let hosts = PriorTable::new(
            names(4, "h"),
            vec!["ring".into()],
            ndarray::Array2::from_shape_fn((4, 1), |(j, _)| (j * 2) as f64),
        )
        .unwrap();
        let mut values = ndarray::Array2::from_shape_fn((8, 4), |(i, j)| {
            -(i as f64) - 0.5 * j as f64
        });
        values[[2, 1]] = f64::NAN;
        let truth = LabeledMatrix::new(names(8, "g"), names(4, "h"), values).unwrap();

        let service = KernelRidge::new(KernelConfig {
            folds: 4,
            ..KernelConfig::default()
        })
        .with_guest_priors(guests)
        .with_host_priors(hosts);
        (EnergyDataset::from_observed(truth), service)
    }

    #[test]
    fn wide_cross_validation_in_both_orientations() {
        let (data, service) = kernel_setup();
        let plotter = RecordingPlotter::default();
        let settings = DriverSettings {
            plot: true,
            ..DriverSettings::default()
        };
        let driver = ExperimentDriver::new(&service, &RankingMetrics, &plotter, settings);

        let mut plan = CrossValidationPlan::new(Layout::Wide(Orientation::GuestsAsRows));
        plan.inspect = Some(3);
        let out = driver.cross_validate(&data, &plan).unwrap();
        assert_eq!(out.predictions.predicted.shape(), (8, 4));
        assert_eq!(out.worst_rows.len(), 3);
        assert!(out.worst_rows.windows(2).all(|w| w[0].1 >= w[1].1));

        let plan = CrossValidationPlan::new(Layout::Wide(Orientation::HostsAsRows));
        let out = driver.cross_validate(&data, &plan).unwrap();
        assert_eq!(out.predictions.predicted.shape(), (4, 8));
        assert!(out.metrics.rmse_scores.is_finite());

        assert_eq!(
            *plotter.labels.lock().unwrap(),
            vec!["guest_predicted", "host_predicted"]
        );
    }

    #[test]
    fn skinny_predictions_are_scored_in_the_wide_layout() {
        let (data, service) = kernel_setup();
        let driver = ExperimentDriver::new(&service, &RankingMetrics, &NoopPlotter, quiet());

        let mut plan = CrossValidationPlan::new(Layout::Skinny);
        plan.downsample = Some((6, 3));
        let out = driver.cross_validate(&data, &plan).unwrap();

        assert_eq!(out.predictions.predicted.shape(), (6, 3));
        assert!(out.predictions.predicted.same_layout(&out.predictions.truth));
        assert!(!out.predictions.mask.values[[2, 1]]);
        assert!(out.metrics.top_1_accuracy >= 0.0);
    }

    #[test]
    fn predictions_are_saved_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let (data, service) = kernel_setup();
        let settings = DriverSettings {
            output_dir: dir.path().to_path_buf(),
            ..quiet()
        };
        let driver = ExperimentDriver::new(&service, &RankingMetrics, &NoopPlotter, settings);

        let mut plan = CrossValidationPlan::new(Layout::Wide(Orientation::GuestsAsRows));
        plan.save_predictions = true;
        driver.cross_validate(&data, &plan).unwrap();

        let saved = crate::data::loader::load_table(&dir.path().join("guest_predictions.csv")).unwrap();
        assert_eq!(saved.shape(), (8, 4));
    }

    #[test]
    fn metrics_are_written_as_json_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let (data, service) = kernel_setup();
        let settings = DriverSettings {
            output_dir: dir.path().to_path_buf(),
            ..quiet()
        };
        let driver = ExperimentDriver::new(&service, &RankingMetrics, &NoopPlotter, settings);

        let mut plan = CrossValidationPlan::new(Layout::Wide(Orientation::HostsAsRows));
        plan.write_metrics = true;
        let out = driver.cross_validate(&data, &plan).unwrap();

        let path = dir.path().join("host_metrics.json");
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["top_1_accuracy"], out.metrics.top_1_accuracy);
        assert_eq!(
            written["top_20_accuracies"].as_array().map(Vec::len),
            Some(20)
        );
        assert!(!dir.path().join("guest_metrics.json").exists());
    }

    #[test]
    fn oversized_downsample_fails() {
        let (data, service) = kernel_setup();
        let driver = ExperimentDriver::new(&service, &RankingMetrics, &NoopPlotter, quiet());
        let mut plan = CrossValidationPlan::new(Layout::Wide(Orientation::GuestsAsRows));
        plan.downsample = Some((100, 30));
        assert!(driver.cross_validate(&data, &plan).is_err());
    }

    fn sweep_stub() -> StubEvaluation {
        StubEvaluation::with_outcomes(&[
            ("p1", (0.40, 0.70)),
            ("p2", (0.30, 0.70)),
            ("p3", (0.50, 0.90)),
            ("identity", (0.45, 0.60)),
            ("p1+p2+p3", (0.20, 0.95)),
        ])
    }

    fn p123() -> (FeatureCatalog, Vec<String>) {
        let catalog = FeatureCatalog::new(["p1", "p2", "p3"]).unwrap();
        let features = catalog.keys().to_vec();
        (catalog, features)
    }

    #[test]
    fn sweep_ranks_features_against_identity() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.tsv");
        let eval = sweep_stub();
        let metrics = StubMetrics::default();
        let plotter = RecordingPlotter::default();
        let settings = DriverSettings {
            plot: true,
            ..DriverSettings::default()
        };
        let driver = ExperimentDriver::new(&eval, &metrics, &plotter, settings);
        let (catalog, features) = p123();

        let out = driver
            .sweep_priors(
                &tiny_dataset(),
                Prior::Guest,
                &catalog,
                &features,
                ScoringMethod::TopK,
                Some(&report),
            )
            .unwrap();

        assert_eq!(
            out.result.identifiers().collect::<Vec<_>>(),
            vec!["p3", "p2", "p1", IDENTITY]
        );
        assert_eq!(out.report_lines.len(), 5);
        assert_eq!(out.combined.top_1_accuracy, 0.95);
        assert!(out.result.get("p1+p2+p3").is_none());
        assert!(report.exists());
        assert_eq!(eval.requests().last().map(String::as_str), Some("p1+p2+p3"));
        assert_eq!(
            *plotter.labels.lock().unwrap(),
            vec!["full_pred", "full_true", TOP_K_CURVE]
        );
    }

    #[test]
    fn failing_sweep_writes_no_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.tsv");
        let eval = sweep_stub().failing_on("p2");
        let metrics = StubMetrics::default();
        let driver = ExperimentDriver::new(&eval, &metrics, &NoopPlotter, quiet());
        let (catalog, features) = p123();

        let err = driver
            .sweep_priors(
                &tiny_dataset(),
                Prior::Guest,
                &catalog,
                &features,
                ScoringMethod::TopK,
                Some(&report),
            )
            .unwrap_err();
        assert!(format!("{err:#}").contains("fit diverged for p2"));
        assert!(!report.exists());
    }

    #[test]
    fn greedy_run_refits_on_chosen_features_only() {
        let eval = StubEvaluation::scored(&[
            ("A", 0.5),
            ("B", 0.9),
            ("C", 0.3),
            ("A+B", 0.95),
            ("B+C", 0.7),
        ]);
        let metrics = StubMetrics::default();
        let driver = ExperimentDriver::new(&eval, &metrics, &NoopPlotter, quiet());
        let catalog = FeatureCatalog::new(["A", "B", "C"]).unwrap();
        let selection = SelectionConfig {
            budget: 2,
            ..SelectionConfig::default()
        };

        let out = driver
            .greedy_selection(&tiny_dataset(), &catalog, Prior::Guest, &selection)
            .unwrap();

        assert_eq!(out.selection.chosen, vec!["B", "A"]);
        assert_eq!(out.final_metrics.unwrap().top_1_accuracy, 0.95);
        assert_eq!(eval.calls(), 3 + 2 + 1);
        assert_eq!(eval.requests().last().map(String::as_str), Some("A+B"));
    }

    #[test]
    fn greedy_run_with_backward_direction_and_zero_budget() {
        let eval = StubEvaluation::default();
        let metrics = StubMetrics::default();
        let driver = ExperimentDriver::new(&eval, &metrics, &NoopPlotter, quiet());
        let catalog = FeatureCatalog::new(["A", "B"]).unwrap();
        let selection = SelectionConfig {
            budget: 0,
            direction: Direction::Backward,
            ..SelectionConfig::default()
        };

        let out = driver
            .greedy_selection(&tiny_dataset(), &catalog, Prior::Guest, &selection)
            .unwrap();
        assert!(out.selection.chosen.is_empty());
        assert!(out.final_metrics.is_none());
        assert_eq!(eval.calls(), 0);
    }

    #[test]
    fn greedy_run_surfaces_selection_errors() {
        let eval = StubEvaluation::default();
        let metrics = StubMetrics::default();
        let driver = ExperimentDriver::new(&eval, &metrics, &NoopPlotter, quiet());
        let catalog = FeatureCatalog::new(["A"]).unwrap();
        let selection = SelectionConfig {
            budget: 2,
            ..SelectionConfig::default()
        };

        let err = driver
            .greedy_selection(&tiny_dataset(), &catalog, Prior::Guest, &selection)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::SelectionError>(),
            Some(crate::error::SelectionError::ExhaustedCandidates { .. })
        ));
    }
}
