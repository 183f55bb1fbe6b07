//! Experiment modes: single-prior cross-validation, prior sweeps and greedy
//! selection runs, plus the sweep report.

pub mod driver;
pub mod report;

pub use driver::{
    CrossValidationOutcome, CrossValidationPlan, DriverSettings, ExperimentDriver,
    GreedyRunOutcome, Layout, SweepOutcome,
};
pub use report::ExperimentResult;
