//! Error types for Trueno-AB
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use thiserror::Error;

use crate::pipeline::{PipelineState, Stage};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-AB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed dataset, configuration or probability outside (0,1)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sample cannot support the requested statistic (single row, single arm)
    #[error("Degenerate sample: {0}\nEach arm needs at least two observations")]
    DegenerateSample(String),

    /// Numeric solver ran out of iterations
    #[error("Solver did not converge after {iterations} iterations (residual {residual:e})\nRaise max_solver_iterations or check the inputs")]
    NonConvergence {
        /// Iterations performed before giving up
        iterations: usize,
        /// Remaining relative bracket width
        residual: f64,
    },

    /// Quantity is mathematically undefined (e.g. infinite sample size)
    #[error("Undefined: {0}")]
    Undefined(String),

    /// A pipeline stage failed; no verdict was produced
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// Stage that aborted the run
        stage: Stage,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Orchestrator state machine was driven out of order (critical bug)
    #[error("Invalid pipeline transition: {from:?} -> {to:?}. Please report this issue.")]
    InvalidTransition {
        /// State the run was in
        from: PipelineState,
        /// State that was requested
        to: PipelineState,
    },

    /// Arrow error during ingestion
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// JSON error (configuration or report parsing)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap this error with the pipeline stage it occurred in.
    ///
    /// Already-tagged errors are returned unchanged so the innermost stage wins.
    #[must_use]
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            tagged @ Self::Stage { .. } => tagged,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage that failed, if this error came out of the pipeline.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
