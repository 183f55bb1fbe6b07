//! Greedy feature selection over a [`FeatureCatalog`](crate::catalog::FeatureCatalog).
//!
//! ```text
//! GreedySelector ──per candidate──► CandidateEvaluator ──► EvaluationService
//!        ▲                                 │                     │
//!        └──────── best score ◄────────────┴──── MetricService ◄─┘
//! ```

pub mod evaluator;
pub mod greedy;
pub mod mask;

pub use evaluator::{CandidateEvaluator, Scoring};
pub use greedy::{GreedySelector, ScoreRecord, SelectionOutcome};
pub use mask::{invert_if_backward, Direction, FeatureWeights, SelectionMask};
