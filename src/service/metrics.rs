//! Reference metric service.
//!
//! Energies are "lower is better": for every row the best column is the one
//! with the lowest energy. Only entries that are valid in the mask and finite
//! in both matrices take part in any metric.

use std::fs;

use anyhow::{bail, Context, Result};

use super::{MetricOptions, MetricService, MetricsBundle, Predictions, ScoringMethod, ServiceError};

/// Largest k reported in `top_20_accuracies`.
pub const MAX_TOP_K: usize = 20;

/// RMSE, per-row Spearman and top-k accuracies.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankingMetrics;

impl MetricService for RankingMetrics {
    fn compute(
        &self,
        predictions: &Predictions,
        method: ScoringMethod,
        options: &MetricOptions,
    ) -> Result<MetricsBundle, ServiceError> {
        let Predictions {
            predicted,
            truth,
            mask,
        } = predictions;
        if !(predicted.same_layout(truth) && predicted.same_layout(mask)) {
            bail!(
                "predictions {:?}, truth {:?} and mask {:?} are not congruent",
                predicted.shape(),
                truth.shape(),
                mask.shape()
            );
        }

        let rows: Vec<Vec<(f64, f64)>> = (0..truth.rows.len())
            .map(|i| {
                (0..truth.columns.len())
                    .filter_map(|j| {
                        let (p, t) = (predicted.values[[i, j]], truth.values[[i, j]]);
                        (mask.values[[i, j]] && p.is_finite() && t.is_finite()).then_some((p, t))
                    })
                    .collect()
            })
            .collect();

        let rmse = rmse(rows.iter().flatten());
        let top_k: Vec<f64> = (1..=MAX_TOP_K)
            .map(|k| top_k_accuracy(&rows, k, method))
            .collect();

        let mut bundle = MetricsBundle {
            rmse_scores: rmse,
            spearman_scores: mean_spearman(&rows),
            top_1_accuracy: top_k[0],
            top_3_accuracy: top_k[2],
            top_5_accuracy: top_k[4],
            top_20_accuracies: top_k,
            ..Default::default()
        };
        bundle.extra.insert("neg_rmse_scores".into(), -rmse);

        let tag = options.meta.as_deref().unwrap_or("metrics");
        if options.verbose {
            log::info!(
                "[{tag}] rmse {:.4}  spearman {:.4}  top-1 {:.3}  top-3 {:.3}  top-5 {:.3}",
                bundle.rmse_scores,
                bundle.spearman_scores,
                bundle.top_1_accuracy,
                bundle.top_3_accuracy,
                bundle.top_5_accuracy
            );
        }

        if let Some(path) = &options.to_write {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create {}", parent.display()))?;
            }
            let json = serde_json::to_string_pretty(&bundle)?;
            fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))?;
            log::info!("[{tag}] metrics written to {}", path.display());
        }

        Ok(bundle)
    }
}

// ---------------------------------------------------------------------------
// Individual metrics over (predicted, true) pairs
// ---------------------------------------------------------------------------

fn rmse<'a>(pairs: impl Iterator<Item = &'a (f64, f64)>) -> f64 {
    let (sum, n) = pairs.fold((0.0, 0usize), |(s, n), (p, t)| (s + (p - t).powi(2), n + 1));
    if n == 0 {
        f64::NAN
    } else {
        (sum / n as f64).sqrt()
    }
}

/// Mean Spearman correlation over rows with at least two valid entries.
fn mean_spearman(rows: &[Vec<(f64, f64)>]) -> f64 {
    let scores: Vec<f64> = rows
        .iter()
        .filter(|row| row.len() >= 2)
        .map(|row| {
            let p: Vec<f64> = row.iter().map(|&(p, _)| p).collect();
            let t: Vec<f64> = row.iter().map(|&(_, t)| t).collect();
            spearman_correlation(&p, &t)
        })
        .collect();
    if scores.is_empty() {
        f64::NAN
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

pub fn spearman_correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.is_empty() {
        return 0.0;
    }
    pearson_correlation(&ranks(x), &ranks(y))
}

fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        cov += (a - mean_x) * (b - mean_y);
        var_x += (a - mean_x).powi(2);
        var_y += (b - mean_y).powi(2);
    }

    if var_x < 1e-12 || var_y < 1e-12 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

/// 1-based ranks, ties share their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let order = ascending(values);
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let shared = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = shared;
        }
        start = end;
    }
    ranks
}

/// Positions sorted by value, stable on ties.
fn ascending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

/// Fraction of rows (with any valid entry) scoring a hit at `k`.
///
/// `TopK`: the truly best column is among the `k` best predicted columns.
/// `TopKInTopK`: overlap of the true and predicted `k` best columns, over `k`.
/// `k` is clamped to the number of valid entries in the row.
fn top_k_accuracy(rows: &[Vec<(f64, f64)>], k: usize, method: ScoringMethod) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    for row in rows.iter().filter(|r| !r.is_empty()) {
        let k = k.min(row.len());
        let p: Vec<f64> = row.iter().map(|&(p, _)| p).collect();
        let t: Vec<f64> = row.iter().map(|&(_, t)| t).collect();
        let predicted_best = &ascending(&p)[..k];
        let true_order = ascending(&t);

        total += match method {
            ScoringMethod::TopK => {
                if predicted_best.contains(&true_order[0]) {
                    1.0
                } else {
                    0.0
                }
            }
            ScoringMethod::TopKInTopK => {
                let hits = true_order[..k]
                    .iter()
                    .filter(|c| predicted_best.contains(c))
                    .count();
                hits as f64 / k as f64
            }
        };
        counted += 1;
    }
    if counted == 0 {
        f64::NAN
    } else {
        total / counted as f64
    }
}
