use std::time::Duration;

// ---------------------------------------------------------------------------
// SelectionError – failures of the selection core and the data model
// ---------------------------------------------------------------------------

/// Errors raised by the data model, the candidate evaluator and the greedy
/// selector. Nothing in the core recovers from these: every variant aborts the
/// current experiment run.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// Ground truth and validity mask disagree, a mask does not match its
    /// catalog, or a reshape asks for more data than exists.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Selection budget {budget} exceeds the {available} available features")]
    ExhaustedCandidates { budget: usize, available: usize },

    /// The evaluation or metric service failed. Display and source are the
    /// service's own so the original diagnostic reaches the caller untouched.
    #[error(transparent)]
    ServiceFailure(anyhow::Error),

    #[error("Metric '{name}' is missing from the metrics bundle")]
    MissingMetric { name: String },

    #[error("Evaluation exceeded its deadline of {limit:?}")]
    DeadlineExceeded { limit: Duration },

    #[error("Candidate {index} cannot be evaluated: {reason}")]
    InvalidCandidate { index: usize, reason: &'static str },

    #[error("Duplicate feature key '{key}' in catalog")]
    DuplicateFeature { key: String },
}

/// Marker error a service returns when it abandons work because the request
/// deadline passed. The evaluator maps it to [`SelectionError::DeadlineExceeded`].
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("deadline reached before the evaluation finished")]
pub struct DeadlineReached;

pub type Result<T, E = SelectionError> = std::result::Result<T, E>;
