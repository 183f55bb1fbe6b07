//! Candidate feature catalogs.
//!
//! A [`FeatureCatalog`] is the ordered list of prior names a selection run may
//! draw from. Catalog order is significant: it is the tie-break order of the
//! greedy selector. The built-in catalogs below are process-wide statics
//! initialised on first use and only ever handed out by reference.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::data::model::PriorTable;
use crate::error::{Result, SelectionError};

/// Individually tested guest-molecule descriptors.
pub static GUEST_PRIORS: Lazy<FeatureCatalog> = Lazy::new(|| {
    FeatureCatalog::from_static(&[
        "mol_weights",
        "volume",
        "normalized_num_rotatable_bonds",
        "formal_charge",
        "asphericity",
        "inertial_shape_factor",
        "spherocity",
        "eccentricity",
        "gyration_radius",
        "pmi1",
        "pmi2",
        "pmi3",
        "npr1",
        "npr2",
        "free_sas",
        "bertz_ct",
    ])
});

/// 0-D persistent-homology descriptors of host frameworks, for the unit cell
/// and the supercell.
pub static HOST_PRIORS: Lazy<FeatureCatalog> = Lazy::new(|| {
    let mut keys = Vec::with_capacity(18);
    for cell in ["cell", "supercell"] {
        for rank in 1..=3 {
            for stat in ["birth", "death", "persistence"] {
                keys.push(format!("{cell}_{stat}-of-top-{rank}-0D-feature"));
            }
        }
    }
    FeatureCatalog::from_unique(keys)
});

// ---------------------------------------------------------------------------
// FeatureCatalog
// ---------------------------------------------------------------------------

/// An ordered set of uniquely keyed candidate features.
#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    keys: Vec<String>,
    index: HashMap<String, usize>,
}

impl FeatureCatalog {
    /// Build a catalog, rejecting duplicate keys.
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self {
            keys: Vec::new(),
            index: HashMap::new(),
        };
        for key in keys {
            let key = key.into();
            if catalog.index.contains_key(&key) {
                return Err(SelectionError::DuplicateFeature { key });
            }
            catalog.index.insert(key.clone(), catalog.keys.len());
            catalog.keys.push(key);
        }
        Ok(catalog)
    }

    /// Every feature column of a prior table, in column order.
    pub fn from_prior_table(table: &PriorTable) -> Result<Self> {
        Self::new(table.columns.iter().cloned())
    }

    fn from_static(keys: &[&str]) -> Self {
        Self::from_unique(keys.iter().map(|k| k.to_string()).collect())
    }

    fn from_unique(keys: Vec<String>) -> Self {
        let index = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        Self { keys, index }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key at a catalog position.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.keys.get(index).map(String::as_str)
    }

    /// Catalog position of a key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}
