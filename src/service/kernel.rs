//! Reference evaluation service: k-fold kernel ridge regression.
//!
//! Rows of the ground-truth matrix are the samples, its columns are the
//! outputs. Each fold is fitted on the remaining rows and predicts every
//! column of the held-out rows:
//!
//! ```text
//! descriptors ──standardise, weight──► X ──RBF──► K
//! (K_train + λI) A = Y_train - μ        (Cholesky, one factorisation per fold)
//! Ŷ_test = K_test,train A + μ
//! ```
//!
//! The `identity` prior uses the identity kernel, so held-out rows fall back
//! to the training column means.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::model::{split_pair_label, GroundTruth, PriorTable};
use crate::error::DeadlineReached;
use crate::selection::mask::FeatureWeights;

use super::{EvalRequest, EvaluationService, Predictions, Prior, ServiceError};

/// Hyper-parameters of the reference regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of cross-validation folds (clamped to the number of rows).
    pub folds: usize,
    /// Ridge added to the kernel diagonal.
    pub ridge: f64,
    /// RBF width; `None` uses 1 / number of features.
    pub gamma: Option<f64>,
    /// Seed of the row shuffle.
    pub seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            folds: 10,
            ridge: 1e-3,
            gamma: None,
            seed: 0,
        }
    }
}

/// One train/test split of the row indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// K-fold kernel ridge regression over prior descriptors.
#[derive(Debug, Clone, Default)]
pub struct KernelRidge {
    config: KernelConfig,
    guest_priors: Option<PriorTable>,
    host_priors: Option<PriorTable>,
}

impl KernelRidge {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            guest_priors: None,
            host_priors: None,
        }
    }

    pub fn with_guest_priors(mut self, table: PriorTable) -> Self {
        self.guest_priors = Some(table);
        self
    }

    pub fn with_host_priors(mut self, table: PriorTable) -> Self {
        self.host_priors = Some(table);
        self
    }

    pub fn guest_priors(&self) -> Option<&PriorTable> {
        self.guest_priors.as_ref()
    }

    pub fn host_priors(&self) -> Option<&PriorTable> {
        self.host_priors.as_ref()
    }

    /// Split `n` rows into `k` contiguous folds of a (optionally shuffled)
    /// permutation; the last fold takes the remainder.
    pub fn folds(&self, n: usize, shuffle: bool) -> Vec<Fold> {
        let k = self.config.folds.clamp(2, n.max(2)).min(n);
        let mut order: Vec<usize> = (0..n).collect();
        if shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            order.shuffle(&mut rng);
        }

        let fold_size = n / k.max(1);
        (0..k)
            .map(|i| {
                let start = i * fold_size;
                let end = if i == k - 1 { n } else { start + fold_size };
                Fold {
                    test: order[start..end].to_vec(),
                    train: order[..start]
                        .iter()
                        .chain(&order[end..])
                        .copied()
                        .collect(),
                }
            })
            .collect()
    }

    /// Descriptor matrix aligned with the ground-truth rows; `None` for the
    /// identity prior.
    fn descriptors(&self, request: &EvalRequest<'_>) -> Result<Option<Array2<f64>>> {
        let rows = &request.ground_truth.rows;
        let norm = request.norm_factor.unwrap_or(1.0);

        let x = match request.prior {
            Prior::Identity => return Ok(None),
            Prior::Guest => {
                let table = self.table(Prior::Guest)?;
                let cols = weighted_columns(table, request.weights, true)?;
                gather(table, &standardised(table, &cols, norm), rows.iter().map(String::as_str))?
            }
            Prior::Host => {
                let table = self.table(Prior::Host)?;
                let cols = weighted_columns(table, request.weights, true)?;
                gather(table, &standardised(table, &cols, norm), rows.iter().map(String::as_str))?
            }
            Prior::Paired => {
                let guests = self.table(Prior::Guest)?;
                let hosts = self.table(Prior::Host)?;
                let guest_cols = weighted_columns(guests, request.weights, false)?;
                let host_cols = weighted_columns(hosts, request.weights, false)?;
                if let Some(weights) = request.weights {
                    if let Some(unknown) = weights.keys().find(|k| {
                        guests.column_position(k).is_none() && hosts.column_position(k).is_none()
                    }) {
                        bail!("unknown feature '{unknown}' for the paired prior");
                    }
                }

                let mut guest_labels = Vec::with_capacity(rows.len());
                let mut host_labels = Vec::with_capacity(rows.len());
                for label in rows {
                    let (g, h) = split_pair_label(label)
                        .with_context(|| format!("'{label}' is not a guest/host pair"))?;
                    guest_labels.push(g);
                    host_labels.push(h);
                }
                let g = gather(guests, &standardised(guests, &guest_cols, norm), guest_labels.into_iter())?;
                let h = gather(hosts, &standardised(hosts, &host_cols, norm), host_labels.into_iter())?;
                ndarray::concatenate(Axis(1), &[g.view(), h.view()])?
            }
        };
        Ok(Some(x))
    }

    fn table(&self, prior: Prior) -> Result<&PriorTable> {
        let table = match prior {
            Prior::Guest => self.guest_priors.as_ref(),
            Prior::Host => self.host_priors.as_ref(),
            _ => None,
        };
        table.with_context(|| format!("no {prior} prior table loaded"))
    }

    fn gamma(&self, n_features: usize) -> f64 {
        self.config
            .gamma
            .unwrap_or_else(|| 1.0 / n_features.max(1) as f64)
    }
}

impl EvaluationService for KernelRidge {
    fn run(&self, request: &EvalRequest<'_>) -> Result<Predictions, ServiceError> {
        let truth = request.ground_truth;
        if !truth.same_layout(request.validity) {
            bail!(
                "ground truth {:?} and validity mask {:?} are not congruent",
                truth.shape(),
                request.validity.shape()
            );
        }
        let (n, m) = truth.shape();
        if n < 2 {
            bail!("cross-validation needs at least two rows, found {n}");
        }

        let x = self.descriptors(request)?;
        let gamma = x.as_ref().map(|x| self.gamma(x.ncols())).unwrap_or(0.0);
        let folds = self.folds(n, request.shuffle);
        if folds.len() < self.config.folds {
            log::warn!(
                "only {} rows: using {} folds instead of {}",
                n,
                folds.len(),
                self.config.folds
            );
        }

        let mut predicted = Array2::from_elem((n, m), f64::NAN);
        for (i, fold) in folds.iter().enumerate() {
            check_deadline(request.deadline)?;
            let (k_train, k_cross) = match &x {
                Some(x) => (
                    rbf(x, &fold.train, &fold.train, gamma),
                    rbf(x, &fold.test, &fold.train, gamma),
                ),
                None => (
                    Array2::eye(fold.train.len()),
                    Array2::zeros((fold.test.len(), fold.train.len())),
                ),
            };
            let block = fit_fold(&k_train, &k_cross, truth, request, &fold.train, self.config.ridge)
                .with_context(|| format!("fold {i} ({} prior)", request.prior))?;
            for (r, &row) in fold.test.iter().enumerate() {
                predicted.row_mut(row).assign(&block.row(r));
            }
            log::debug!("fold {}/{} fitted on {} rows", i + 1, folds.len(), fold.train.len());
        }

        Ok(Predictions {
            predicted: GroundTruth::new(truth.rows.clone(), truth.columns.clone(), predicted)?,
            truth: truth.clone(),
            mask: request.validity.clone(),
        })
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(DeadlineReached.into()),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Descriptor preparation
// ---------------------------------------------------------------------------

/// (column position, weight) pairs of `table` to use. Without weights every
/// column counts at 1.0. `strict` rejects weight keys the table lacks.
fn weighted_columns(
    table: &PriorTable,
    weights: Option<&FeatureWeights>,
    strict: bool,
) -> Result<Vec<(usize, f64)>> {
    let Some(weights) = weights else {
        return Ok((0..table.columns.len()).map(|j| (j, 1.0)).collect());
    };
    let mut cols = Vec::with_capacity(weights.len());
    for (key, w) in weights.iter() {
        match table.column_position(key) {
            Some(j) => cols.push((j, w)),
            None if strict => bail!("unknown feature '{key}'"),
            None => {}
        }
    }
    Ok(cols)
}

/// Z-score the chosen columns over every entity of the table, then scale by
/// `sqrt(weight) * norm`. Missing descriptor values become the column mean.
fn standardised(table: &PriorTable, cols: &[(usize, f64)], norm: f64) -> Array2<f64> {
    let mut out = Array2::zeros((table.rows.len(), cols.len()));
    for (c, &(j, w)) in cols.iter().enumerate() {
        let column = table.values.column(j);
        let finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
        let var = if finite.len() > 1 {
            finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64
        } else {
            0.0
        };
        let std = if var > 0.0 { var.sqrt() } else { 1.0 };
        let scale = w.sqrt() * norm;

        for (r, &v) in column.iter().enumerate() {
            out[[r, c]] = if v.is_finite() {
                (v - mean) / std * scale
            } else {
                0.0
            };
        }
    }
    out
}

/// Pick the rows of `block` (laid out like `table`) for each label.
fn gather<'s>(
    table: &PriorTable,
    block: &Array2<f64>,
    labels: impl Iterator<Item = &'s str>,
) -> Result<Array2<f64>> {
    let index = table.row_index();
    let picked: Vec<usize> = labels
        .map(|label| {
            index
                .get(label)
                .copied()
                .with_context(|| format!("no descriptors for '{label}'"))
        })
        .collect::<Result<_>>()?;
    Ok(block.select(Axis(0), &picked))
}

// ---------------------------------------------------------------------------
// Kernel and solver
// ---------------------------------------------------------------------------

/// `exp(-gamma * |x_a - x_b|^2)` between the given rows of `x`.
fn rbf(x: &Array2<f64>, a: &[usize], b: &[usize], gamma: f64) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| {
        let d2: f64 = x
            .row(a[i])
            .iter()
            .zip(x.row(b[j]).iter())
            .map(|(p, q)| (p - q).powi(2))
            .sum();
        (-gamma * d2).exp()
    })
}

/// Predictions for the held-out rows of one fold.
fn fit_fold(
    k_train: &Array2<f64>,
    k_cross: &Array2<f64>,
    truth: &GroundTruth,
    request: &EvalRequest<'_>,
    train: &[usize],
    ridge: f64,
) -> Result<Array2<f64>> {
    let m = truth.columns.len();
    let observed = |r: usize, c: usize| {
        request.validity.values[[r, c]] && truth.values[[r, c]].is_finite()
    };

    let mut sum = 0.0;
    let mut count = 0usize;
    for &r in train {
        for c in 0..m {
            if observed(r, c) {
                sum += truth.values[[r, c]];
                count += 1;
            }
        }
    }
    if count == 0 {
        log::warn!("fold has no observed training entries; predicting zeros");
    }
    let global_mean = if count > 0 { sum / count as f64 } else { 0.0 };

    let means: Array1<f64> = (0..m)
        .map(|c| {
            let vals: Vec<f64> = train
                .iter()
                .filter(|&&r| observed(r, c))
                .map(|&r| truth.values[[r, c]])
                .collect();
            if vals.is_empty() {
                global_mean
            } else {
                vals.iter().sum::<f64>() / vals.len() as f64
            }
        })
        .collect();

    let y = Array2::from_shape_fn((train.len(), m), |(t, c)| {
        let r = train[t];
        if observed(r, c) {
            truth.values[[r, c]] - means[c]
        } else {
            0.0
        }
    });

    let mut a = k_train.clone();
    a.diag_mut().mapv_inplace(|d| d + ridge);
    let l = cholesky(&a)?;

    let mut alpha = Array2::zeros((train.len(), m));
    for c in 0..m {
        alpha.column_mut(c).assign(&cho_solve(&l, y.column(c)));
    }

    Ok(k_cross.dot(&alpha) + &means)
}

/// Lower-triangular `L` with `L Lᵀ = a`.
fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    bail!("kernel matrix is not positive definite (pivot {i}); increase the ridge");
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Solve `L Lᵀ x = b` by forward then backward substitution.
fn cho_solve(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();

    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * z[j];
        }
        z[i] = (b[i] - sum) / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (z[i] - sum) / l[[i, i]];
    }
    x
}
