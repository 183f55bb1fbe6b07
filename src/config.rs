//! Experiment configuration from `prior-select.toml`.
//!
//! Every section and field is optional; a missing file yields the defaults.
//!
//! ```toml
//! [data]
//! binding = "data/binding.parquet"
//! guest-priors = "data/guest_priors.csv"
//! host-priors = "data/host_priors.csv"
//! energy = "binding"
//!
//! [model]
//! folds = 10
//! ridge = 1e-3
//!
//! [selection]
//! budget = 5
//! direction = "forward"
//! metric = "top_1_accuracy"
//! catalog = "builtin"
//!
//! [output]
//! directory = "results"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::model::{EnergyType, Orientation};
use crate::selection::{Direction, Scoring};
use crate::service::kernel::KernelConfig;
use crate::service::ScoringMethod;

/// File looked up when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "prior-select.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// File this configuration came from (for display).
    #[serde(skip)]
    pub source: Option<PathBuf>,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub selection: SelectionConfig,
    pub sweep: SweepConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Read `path`, or fall back to the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.selection.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// [data]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DataConfig {
    /// Binding-energy matrix, guests as rows.
    pub binding: Option<PathBuf>,
    /// Templating-energy matrix, guests as rows.
    pub templating: Option<PathBuf>,
    /// Explicit validity mask; derived from the ground truth when absent.
    pub mask: Option<PathBuf>,
    pub guest_priors: Option<PathBuf>,
    pub host_priors: Option<PathBuf>,
    pub energy: EnergyType,
    pub orientation: Orientation,
    /// Keep only the leading `[rows, cols]` block.
    pub downsample: Option<(usize, usize)>,
}

impl DataConfig {
    /// Ground-truth path for the configured energy type.
    pub fn ground_truth_path(&self) -> Result<&Path> {
        let path = match self.energy {
            EnergyType::Binding => self.binding.as_deref(),
            EnergyType::Templating => self.templating.as_deref(),
        };
        path.with_context(|| format!("no [data] {} path configured", self.energy))
    }
}

// ---------------------------------------------------------------------------
// [model]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModelConfig {
    pub folds: usize,
    pub ridge: f64,
    pub gamma: Option<f64>,
    pub shuffle: bool,
    pub seed: u64,
    /// Descriptor scale of the all-features run of a sweep.
    pub norm_factor: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let kernel = KernelConfig::default();
        Self {
            folds: kernel.folds,
            ridge: kernel.ridge,
            gamma: kernel.gamma,
            shuffle: true,
            seed: kernel.seed,
            norm_factor: 0.1,
        }
    }
}

impl ModelConfig {
    pub fn kernel(&self) -> KernelConfig {
        KernelConfig {
            folds: self.folds,
            ridge: self.ridge,
            gamma: self.gamma,
            seed: self.seed,
        }
    }
}

// ---------------------------------------------------------------------------
// [selection]
// ---------------------------------------------------------------------------

/// Where the candidate features of a selection run come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    /// Every column of the row family's prior table.
    #[default]
    Table,
    /// The built-in descriptor list of the row family.
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SelectionConfig {
    pub budget: usize,
    pub direction: Direction,
    pub metric: String,
    pub method: ScoringMethod,
    pub parallel: bool,
    pub dry_run: bool,
    /// Per-evaluation time limit in seconds.
    pub deadline_secs: Option<f64>,
    pub catalog: CatalogSource,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            budget: 5,
            direction: Direction::Forward,
            metric: "top_1_accuracy".to_string(),
            method: ScoringMethod::TopK,
            parallel: false,
            dry_run: false,
            deadline_secs: None,
            catalog: CatalogSource::Table,
        }
    }
}

impl SelectionConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// Rejects a `deadline-secs` that is not a representable positive duration.
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.deadline_secs {
            if secs.is_nan() || secs <= 0.0 {
                bail!("[selection] deadline-secs must be positive, got {secs}");
            }
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("[selection] deadline-secs = {secs} is out of range"))?;
        }
        Ok(())
    }

    pub fn scoring(&self) -> Scoring {
        Scoring::new(self.metric.clone(), self.method)
    }
}

// ---------------------------------------------------------------------------
// [sweep] / [output]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SweepConfig {
    /// Features to test one by one; the row family's catalog when absent.
    pub features: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub plot: bool,
    pub write_report: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("results"),
            plot: true,
            write_report: true,
        }
    }
}
