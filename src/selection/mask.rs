use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::FeatureCatalog;
use crate::error::{Result, SelectionError};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Selection direction.
///
/// `Backward` does not shrink from the full set: it scores the *complement* of
/// the grown subset (see [`invert_if_backward`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            other => Err(format!(
                "unknown direction '{other}' (expected forward or backward)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// SelectionMask – one bool per catalog entry
// ---------------------------------------------------------------------------

/// Which catalog features are currently in the active subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionMask {
    bits: Vec<bool>,
}

impl SelectionMask {
    /// All features excluded.
    pub fn empty(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    /// Mask with exactly the given positions set.
    pub fn with_selected(len: usize, selected: &[usize]) -> Self {
        let mut mask = Self::empty(len);
        for &i in selected {
            mask.bits[i] = true;
        }
        mask
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Include a feature.
    pub fn select(&mut self, index: usize) {
        self.bits[index] = true;
    }

    /// Copy with one more feature included; `self` is left untouched.
    pub fn with_flipped(&self, index: usize) -> Self {
        let mut trial = self.clone();
        trial.bits[index] = true;
        trial
    }

    /// Number of included features.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Positions of included features, in catalog order.
    pub fn selected_indices(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, &b)| b)
            .map(|(i, _)| i)
            .collect()
    }

    /// Positions still available as candidates, in catalog order.
    pub fn candidate_indices(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, &b)| !b)
            .map(|(i, _)| i)
            .collect()
    }

    fn invert(mut self) -> Self {
        for bit in &mut self.bits {
            *bit = !*bit;
        }
        self
    }

    /// Fail with `InvalidShape` unless the mask has one entry per catalog key.
    pub fn check_against(&self, catalog: &FeatureCatalog) -> Result<()> {
        if self.len() != catalog.len() {
            return Err(SelectionError::InvalidShape(format!(
                "selection mask has {} entries but the catalog has {} features",
                self.len(),
                catalog.len()
            )));
        }
        Ok(())
    }
}

/// The mask actually handed to the evaluation service.
///
/// Forward: the mask itself. Backward: its logical complement, so every
/// feature *not* yet chosen becomes the active subset. This mirrors how the
/// experiments were historically run and is kept deliberately.
pub fn invert_if_backward(mask: SelectionMask, direction: Direction) -> SelectionMask {
    match direction {
        Direction::Forward => mask,
        Direction::Backward => mask.invert(),
    }
}

// ---------------------------------------------------------------------------
// FeatureWeights – the prior map passed to the evaluation service
// ---------------------------------------------------------------------------

/// Included feature key → positive weight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureWeights {
    weights: BTreeMap<String, f64>,
}

impl FeatureWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature. Zero, negative and non-finite weights are refused.
    pub fn insert(&mut self, key: impl Into<String>, weight: f64) -> Result<()> {
        let key = key.into();
        if !(weight.is_finite() && weight > 0.0) {
            return Err(SelectionError::InvalidShape(format!(
                "feature '{key}' has non-positive weight {weight}"
            )));
        }
        self.weights.insert(key, weight);
        Ok(())
    }

    /// Weight 1.0 for every given key.
    pub fn uniform<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            weights: keys.into_iter().map(|k| (k.into(), 1.0)).collect(),
        }
    }

    /// Weight 1.0 for every feature the mask includes.
    pub fn from_mask(catalog: &FeatureCatalog, mask: &SelectionMask) -> Result<Self> {
        mask.check_against(catalog)?;
        Ok(Self::uniform(
            mask.selected_indices()
                .into_iter()
                .filter_map(|i| catalog.key(i)),
        ))
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.weights.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// (key, weight) pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, &w)| (k.as_str(), w))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }
}
