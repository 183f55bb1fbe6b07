use std::collections::HashMap;
use std::fmt;

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

/// Separator between the guest and host halves of a skinny row label.
/// U+001F never occurs in SMILES strings or framework codes.
pub const PAIR_SEPARATOR: char = '\u{1f}';

/// Column name of the single value column of a skinny matrix.
pub const SKINNY_COLUMN: &str = "energy";

// ---------------------------------------------------------------------------
// LabeledMatrix – a dense 2-D table with row and column labels
// ---------------------------------------------------------------------------

/// A dense matrix whose rows and columns carry string labels, the Rust
/// counterpart of a labelled DataFrame.
#[derive(Debug, Clone)]
pub struct LabeledMatrix<T> {
    /// Row labels, one per matrix row.
    pub rows: Vec<String>,
    /// Column labels, one per matrix column.
    pub columns: Vec<String>,
    pub values: Array2<T>,
}

/// Observed energies; `NaN` marks a missing entry.
pub type GroundTruth = LabeledMatrix<f64>;

/// `true` marks an entry that is a real observation eligible for scoring.
pub type ValidityMask = LabeledMatrix<bool>;

/// Precomputed descriptors: entities as rows, named features as columns.
pub type PriorTable = LabeledMatrix<f64>;

impl<T: Clone> LabeledMatrix<T> {
    /// Wrap `values`, checking the labels agree with its shape.
    pub fn new(rows: Vec<String>, columns: Vec<String>, values: Array2<T>) -> Result<Self> {
        if values.dim() != (rows.len(), columns.len()) {
            return Err(SelectionError::InvalidShape(format!(
                "{} row labels and {} column labels for a {:?} matrix",
                rows.len(),
                columns.len(),
                values.dim()
            )));
        }
        Ok(Self {
            rows,
            columns,
            values,
        })
    }

    /// (rows, columns).
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    /// Swap rows and columns together with their labels.
    pub fn transpose(&self) -> Self {
        Self {
            rows: self.columns.clone(),
            columns: self.rows.clone(),
            values: self.values.t().to_owned(),
        }
    }

    /// Keep the leading `n_rows × n_cols` block.
    pub fn downsample(&self, n_rows: usize, n_cols: usize) -> Result<Self> {
        let (rows, cols) = self.shape();
        if n_rows > rows || n_cols > cols {
            return Err(SelectionError::InvalidShape(format!(
                "cannot take a {n_rows}x{n_cols} block from a {rows}x{cols} matrix"
            )));
        }
        Ok(Self {
            rows: self.rows[..n_rows].to_vec(),
            columns: self.columns[..n_cols].to_vec(),
            values: self.values.slice(s![..n_rows, ..n_cols]).to_owned(),
        })
    }

    /// Whether `other` has the same shape and the same labels in the same order.
    pub fn same_layout<U>(&self, other: &LabeledMatrix<U>) -> bool {
        self.rows == other.rows && self.columns == other.columns
    }

    /// Build a matrix of another element type with this layout.
    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> LabeledMatrix<U> {
        LabeledMatrix {
            rows: self.rows.clone(),
            columns: self.columns.clone(),
            values: self.values.map(f),
        }
    }

    /// Lookup table from row label to row position.
    pub fn row_index(&self) -> HashMap<&str, usize> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.as_str(), i))
            .collect()
    }

    /// Position of a column label.
    pub fn column_position(&self, label: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == label)
    }

    /// Flatten to one row per (row, column) pair with a single value column.
    pub fn make_skinny(&self) -> Self {
        let (rows, cols) = self.shape();
        let mut labels = Vec::with_capacity(rows * cols);
        let mut flat = Vec::with_capacity(rows * cols);
        for (i, row) in self.rows.iter().enumerate() {
            for (j, col) in self.columns.iter().enumerate() {
                labels.push(pair_label(row, col));
                flat.push(self.values[[i, j]].clone());
            }
        }
        let values = Array2::from_shape_fn((flat.len(), 1), |(k, _)| flat[k].clone());
        Self {
            rows: labels,
            columns: vec![SKINNY_COLUMN.to_string()],
            values,
        }
    }

    /// Inverse of [`make_skinny`](Self::make_skinny). Rows and columns come
    /// back in first-appearance order; pairs absent from the skinny matrix are
    /// filled with `fill`.
    pub fn unmake_skinny(&self, fill: T) -> Result<Self> {
        if self.columns.len() != 1 {
            return Err(SelectionError::InvalidShape(format!(
                "skinny matrix must have exactly one column, found {}",
                self.columns.len()
            )));
        }

        let mut row_labels: Vec<String> = Vec::new();
        let mut col_labels: Vec<String> = Vec::new();
        let mut row_pos: HashMap<&str, usize> = HashMap::new();
        let mut col_pos: HashMap<&str, usize> = HashMap::new();
        let mut cells = Vec::with_capacity(self.rows.len());

        for label in &self.rows {
            let (row, col) = split_pair_label(label).ok_or_else(|| {
                SelectionError::InvalidShape(format!("'{label}' is not a pair label"))
            })?;
            let r = *row_pos.entry(row).or_insert_with(|| {
                row_labels.push(row.to_string());
                row_labels.len() - 1
            });
            let c = *col_pos.entry(col).or_insert_with(|| {
                col_labels.push(col.to_string());
                col_labels.len() - 1
            });
            cells.push((r, c));
        }

        let mut values = Array2::from_elem((row_labels.len(), col_labels.len()), fill);
        let mut seen = Array2::from_elem(values.dim(), false);
        for (k, &(r, c)) in cells.iter().enumerate() {
            if seen[[r, c]] {
                return Err(SelectionError::InvalidShape(format!(
                    "pair '{}' appears twice",
                    self.rows[k].replace(PAIR_SEPARATOR, " / ")
                )));
            }
            seen[[r, c]] = true;
            values[[r, c]] = self.values[[k, 0]].clone();
        }

        Ok(Self {
            rows: row_labels,
            columns: col_labels,
            values,
        })
    }
}

impl LabeledMatrix<f64> {
    /// Mask of finite entries.
    pub fn observed(&self) -> ValidityMask {
        self.map(|v| v.is_finite())
    }
}

impl LabeledMatrix<bool> {
    /// Number of `true` entries.
    pub fn count(&self) -> usize {
        self.values.iter().filter(|&&v| v).count()
    }
}

/// Join a (row, column) pair into a skinny row label.
pub fn pair_label(row: &str, col: &str) -> String {
    format!("{row}{PAIR_SEPARATOR}{col}")
}

/// Split a skinny row label back into its (row, column) halves.
pub fn split_pair_label(label: &str) -> Option<(&str, &str)> {
    label.split_once(PAIR_SEPARATOR)
}

// ---------------------------------------------------------------------------
// Orientation / EnergyType
// ---------------------------------------------------------------------------

/// Which entity family indexes the rows of the ground-truth matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Guest molecules as rows (the layout energies are stored in).
    #[default]
    GuestsAsRows,
    /// Host structures as rows: the transposed matrix.
    HostsAsRows,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::GuestsAsRows => write!(f, "guests as rows"),
            Orientation::HostsAsRows => write!(f, "hosts as rows"),
        }
    }
}

/// Which energy matrix an experiment runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyType {
    #[default]
    Binding,
    Templating,
}

impl fmt::Display for EnergyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyType::Binding => write!(f, "binding"),
            EnergyType::Templating => write!(f, "templating"),
        }
    }
}

// ---------------------------------------------------------------------------
// EnergyDataset – ground truth plus the mask that says what to score
// ---------------------------------------------------------------------------

/// A ground-truth matrix together with its congruent validity mask.
#[derive(Debug, Clone)]
pub struct EnergyDataset {
    ground_truth: GroundTruth,
    validity: ValidityMask,
}

impl EnergyDataset {
    /// Pair a ground truth with an explicit mask; both must share labels.
    pub fn new(ground_truth: GroundTruth, validity: ValidityMask) -> Result<Self> {
        if !ground_truth.same_layout(&validity) {
            return Err(SelectionError::InvalidShape(format!(
                "ground truth is {:?} but validity mask is {:?} (or their labels differ)",
                ground_truth.shape(),
                validity.shape()
            )));
        }
        Ok(Self {
            ground_truth,
            validity,
        })
    }

    /// Every finite ground-truth entry counts as an observation.
    pub fn from_observed(ground_truth: GroundTruth) -> Self {
        let validity = ground_truth.observed();
        Self {
            ground_truth,
            validity,
        }
    }

    pub fn ground_truth(&self) -> &GroundTruth {
        &self.ground_truth
    }

    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    pub fn shape(&self) -> (usize, usize) {
        self.ground_truth.shape()
    }

    /// Number of entries eligible for scoring.
    pub fn observation_count(&self) -> usize {
        self.validity.count()
    }

    /// Re-orient a dataset stored with guests as rows.
    pub fn oriented(&self, orientation: Orientation) -> Self {
        match orientation {
            Orientation::GuestsAsRows => self.clone(),
            Orientation::HostsAsRows => Self {
                ground_truth: self.ground_truth.transpose(),
                validity: self.validity.transpose(),
            },
        }
    }

    /// Keep the leading `(rows, cols)` block of both matrices.
    pub fn downsampled(&self, (rows, cols): (usize, usize)) -> Result<Self> {
        Ok(Self {
            ground_truth: self.ground_truth.downsample(rows, cols)?,
            validity: self.validity.downsample(rows, cols)?,
        })
    }

    /// One row per (row entity, column entity) pair.
    pub fn skinny(&self) -> Self {
        Self {
            ground_truth: self.ground_truth.make_skinny(),
            validity: self.validity.make_skinny(),
        }
    }
}
