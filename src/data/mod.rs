//! Data layer: labelled matrices, loading and persistence.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → LabeledMatrix<f64>
//!   └──────────┘
//!        │
//!        ▼
//!   ┌───────────────┐
//!   │ EnergyDataset  │  ground truth + validity mask, re-oriented / downsampled / skinny
//!   └───────────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ persist   │  prediction matrices → .csv / .parquet
//!   └──────────┘
//! ```

pub mod loader;
pub mod model;
pub mod persist;
