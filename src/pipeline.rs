//! Analysis pipeline: balance check, optional correction, verdict
//!
//! ```text
//! Loaded ──> BalanceChecked ──┬──> Corrected ──┬──> Verdicted
//!                             └──> Skipped ────┘
//! ```
//!
//! Every run walks this state machine once. A failing stage aborts the run
//! with an error tagged by [`Stage`]; no partial verdict is ever returned.
//! A successful run yields exactly one [`TestVerdict`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::balance::{BalanceDiagnostic, BalanceOutcome};
use crate::comparator::{compare_population, TestVerdict};
use crate::config::{AnalysisConfig, CorrectionPolicy};
use crate::correction::{BiasCorrector, Correction};
use crate::dataset::{ExperimentDataset, Population};
use crate::{Error, Result};

/// Pipeline stage that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Covariate balance diagnostic
    Balance,
    /// Bias correction
    Correction,
    /// Metric comparison
    Comparison,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Balance => "balance",
            Self::Correction => "correction",
            Self::Comparison => "comparison",
        })
    }
}

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Dataset accepted
    Loaded,
    /// Balance diagnostic done
    BalanceChecked,
    /// Synthetic rows appended
    Corrected,
    /// Correction not needed or disabled
    Skipped,
    /// Verdict produced (terminal)
    Verdicted,
}

impl PipelineState {
    /// True if `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Loaded, Self::BalanceChecked)
                | (Self::BalanceChecked, Self::Corrected | Self::Skipped)
                | (Self::Corrected | Self::Skipped, Self::Verdicted)
        )
    }

    /// True for the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Verdicted)
    }
}

/// State machine of one run, with its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    history: Vec<PipelineState>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    /// A run in the `Loaded` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![PipelineState::Loaded],
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineState::Loaded)
    }

    /// States visited so far, `Loaded` first.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `next` may not follow the current state.
    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        debug!(?from, to = ?next, "pipeline transition");
        self.history.push(next);
        Ok(())
    }

    fn into_history(self) -> Vec<PipelineState> {
        self.history
    }
}

/// Why the correction stage was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Fewer than two arms, balance does not apply
    NotApplicable,
    /// Nothing was flagged
    Balanced,
    /// Correction disabled by configuration
    Disabled,
}

/// Record of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    /// Configuration the run used
    pub config: AnalysisConfig,
    /// States visited, `Loaded` through `Verdicted`
    pub history: Vec<PipelineState>,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Balance diagnostic result
    pub balance: BalanceOutcome,
    /// Set when the correction stage was skipped
    pub skip_reason: Option<SkipReason>,
    /// Plan, corrected dataset and summary, when corrected
    pub correction: Option<Correction>,
    /// The verdict, on the corrected dataset when there is one
    pub verdict: TestVerdict,
}

impl AnalysisOutcome {
    /// Final state (always `Verdicted` for a returned outcome).
    #[must_use]
    pub fn final_state(&self) -> PipelineState {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineState::Loaded)
    }

    /// True if the verdict was computed on a corrected dataset.
    #[must_use]
    pub const fn was_corrected(&self) -> bool {
        self.correction.is_some()
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// End-to-end analysis of one experiment.
///
/// # Examples
///
/// ```rust
/// use trueno_ab::config::AnalysisConfig;
/// use trueno_ab::dataset::{Arm, ExperimentDataset, ExperimentRecord};
/// use trueno_ab::pipeline::{AnalysisPipeline, PipelineState};
///
/// let records = (0..200)
///     .map(|i| {
///         let arm = if i % 2 == 0 { Arm::Test } else { Arm::Control };
///         ExperimentRecord::builder(i.to_string(), arm, i % 7 == 0)
///             .covariate("device", if i % 4 < 2 { "Web" } else { "Mobile" })
///             .build()
///     })
///     .collect();
/// let dataset = ExperimentDataset::new(records)?;
///
/// let outcome = AnalysisPipeline::new(AnalysisConfig::default())?.run(&dataset)?;
/// assert_eq!(outcome.final_state(), PipelineState::Verdicted);
/// assert!(!outcome.was_corrected());
/// # Ok::<(), trueno_ab::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    config: AnalysisConfig,
    diagnostic: BalanceDiagnostic,
    corrector: BiasCorrector,
}

impl AnalysisPipeline {
    /// Build the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the configuration does not validate.
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        let diagnostic = BalanceDiagnostic::new(&config)?;
        let corrector = BiasCorrector::new(&config)?;
        Ok(Self {
            config,
            diagnostic,
            corrector,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run every stage over `dataset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stage` naming the failing stage and wrapping its
    /// error (for example `DegenerateSample` from the comparison).
    #[instrument(skip_all, fields(rows = dataset.len(), seed = self.config.seed))]
    pub fn run(&self, dataset: &ExperimentDataset) -> Result<AnalysisOutcome> {
        let started_at = Utc::now();
        let mut run = PipelineRun::new();

        let balance = self
            .diagnostic
            .run(dataset)
            .map_err(|e| e.at_stage(Stage::Balance))?;
        run.advance(PipelineState::BalanceChecked)?;

        let (correction, skip_reason) = match (&balance, self.config.correction) {
            (BalanceOutcome::NotApplicable { .. }, _) => (None, Some(SkipReason::NotApplicable)),
            (BalanceOutcome::Report(report), _) if report.is_balanced() => {
                (None, Some(SkipReason::Balanced))
            }
            (BalanceOutcome::Report(_), CorrectionPolicy::Never) => (None, Some(SkipReason::Disabled)),
            (BalanceOutcome::Report(report), CorrectionPolicy::Auto) => {
                let correction = self
                    .corrector
                    .correct(report, dataset)
                    .map_err(|e| e.at_stage(Stage::Correction))?;
                (Some(correction), None)
            }
        };

        let verdict = if let Some(correction) = &correction {
            run.advance(PipelineState::Corrected)?;
            compare_population(&correction.dataset, self.config.alpha)
        } else {
            run.advance(PipelineState::Skipped)?;
            compare_population(dataset, self.config.alpha)
        }
        .map_err(|e| e.at_stage(Stage::Comparison))?;
        run.advance(PipelineState::Verdicted)?;

        info!(
            decision = ?verdict.decision,
            p_value = verdict.p_value,
            corrected = correction.is_some(),
            "analysis complete"
        );

        Ok(AnalysisOutcome {
            config: self.config.clone(),
            history: run.into_history(),
            started_at,
            finished_at: Utc::now(),
            balance,
            skip_reason,
            correction,
            verdict,
        })
    }
}
