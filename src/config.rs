//! Analysis configuration
//!
//! Every knob has a default, so `AnalysisConfig::default()` reproduces the
//! conventional setup (alpha 0.05, power 0.8, seed 42). Configurations can
//! also be built fluently or parsed from JSON:
//!
//! ```rust
//! use trueno_ab::config::{AnalysisConfig, ReferenceArm};
//!
//! let config = AnalysisConfig::builder()
//!     .alpha(0.01)
//!     .seed(7)
//!     .reference_arm(ReferenceArm::Test)
//!     .build()?;
//! assert_eq!(config.seed, 7);
//!
//! let parsed = AnalysisConfig::from_json(r#"{ "alpha": 0.01, "seed": 7, "reference_arm": "test" }"#)?;
//! assert_eq!(parsed, config);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

use serde::{Deserialize, Serialize};

use crate::dataset::{Arm, Population};
use crate::{Error, Result};

/// Default significance level
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Default target power
pub const DEFAULT_POWER: f64 = 0.8;

/// Default deviation-score flag threshold (50% off an even balanced split)
pub const DEFAULT_IMBALANCE_THRESHOLD: f64 = 0.5;

/// Default minimum weighted Gini decrease for a classifier split
pub const DEFAULT_MIN_IMPURITY_DECREASE: f64 = 0.001;

/// Which arm is trusted as correctly randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceArm {
    /// The larger arm (test on ties)
    #[default]
    Larger,
    /// Always the test arm
    Test,
    /// Always the control arm
    Control,
}

impl ReferenceArm {
    /// Resolve to a concrete arm for `population`.
    #[must_use]
    pub fn resolve(self, population: &impl Population) -> Arm {
        match self {
            Self::Test => Arm::Test,
            Self::Control => Arm::Control,
            Self::Larger => {
                if population.arm_size(Arm::Control) > population.arm_size(Arm::Test) {
                    Arm::Control
                } else {
                    Arm::Test
                }
            }
        }
    }
}

/// Whether the pipeline corrects flagged imbalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPolicy {
    /// Correct whenever the diagnostic flags something
    #[default]
    Auto,
    /// Never correct; compare the raw arms
    Never,
}

/// Configuration shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Significance level for tests and power planning
    pub alpha: f64,
    /// Target power for sample size planning
    pub power: f64,
    /// Deviation score above which a cell is flagged
    pub imbalance_threshold: f64,
    /// Minimum weighted Gini decrease for a classifier split
    pub min_impurity_decrease: f64,
    /// Maximum classifier depth
    pub max_tree_depth: usize,
    /// Seed of the resampling generator
    pub seed: u64,
    /// Arm whose prevalences are the correction target
    pub reference_arm: ReferenceArm,
    /// Correction policy
    pub correction: CorrectionPolicy,
    /// Maximum full passes over the flagged entries
    pub max_correction_sweeps: usize,
    /// Iteration budget of the power solver
    pub max_solver_iterations: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            power: DEFAULT_POWER,
            imbalance_threshold: DEFAULT_IMBALANCE_THRESHOLD,
            min_impurity_decrease: DEFAULT_MIN_IMPURITY_DECREASE,
            max_tree_depth: 8,
            seed: 42,
            reference_arm: ReferenceArm::Larger,
            correction: CorrectionPolicy::Auto,
            max_correction_sweeps: 16,
            max_solver_iterations: 200,
        }
    }
}

impl AnalysisConfig {
    /// Create a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `Json` on malformed JSON and `InvalidInput` on invalid values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field is in range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(Error::InvalidInput(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if !(self.power > self.alpha && self.power < 1.0) {
            return Err(Error::InvalidInput(format!(
                "power must be in (alpha, 1), got {}",
                self.power
            )));
        }
        if !(0.0..1.0).contains(&self.imbalance_threshold) {
            return Err(Error::InvalidInput(format!(
                "imbalance_threshold must be in [0, 1), got {}",
                self.imbalance_threshold
            )));
        }
        if !(self.min_impurity_decrease >= 0.0 && self.min_impurity_decrease.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "min_impurity_decrease must be a finite non-negative number, got {}",
                self.min_impurity_decrease
            )));
        }
        if self.max_tree_depth == 0 {
            return Err(Error::InvalidInput("max_tree_depth must be at least 1".to_string()));
        }
        if self.max_correction_sweeps == 0 {
            return Err(Error::InvalidInput(
                "max_correction_sweeps must be at least 1".to_string(),
            ));
        }
        if self.max_solver_iterations == 0 {
            return Err(Error::InvalidInput(
                "max_solver_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for `AnalysisConfig`.
#[derive(Debug, Default)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    /// Set the significance level.
    #[must_use]
    pub const fn alpha(mut self, alpha: f64) -> Self {
        self.config.alpha = alpha;
        self
    }

    /// Set the target power.
    #[must_use]
    pub const fn power(mut self, power: f64) -> Self {
        self.config.power = power;
        self
    }

    /// Set the deviation-score flag threshold.
    #[must_use]
    pub const fn imbalance_threshold(mut self, threshold: f64) -> Self {
        self.config.imbalance_threshold = threshold;
        self
    }

    /// Set the classifier's minimum impurity decrease.
    #[must_use]
    pub const fn min_impurity_decrease(mut self, decrease: f64) -> Self {
        self.config.min_impurity_decrease = decrease;
        self
    }

    /// Set the classifier's maximum depth.
    #[must_use]
    pub const fn max_tree_depth(mut self, depth: usize) -> Self {
        self.config.max_tree_depth = depth;
        self
    }

    /// Set the resampling seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the reference arm.
    #[must_use]
    pub const fn reference_arm(mut self, arm: ReferenceArm) -> Self {
        self.config.reference_arm = arm;
        self
    }

    /// Set the correction policy.
    #[must_use]
    pub const fn correction(mut self, policy: CorrectionPolicy) -> Self {
        self.config.correction = policy;
        self
    }

    /// Set the maximum number of correction sweeps.
    #[must_use]
    pub const fn max_correction_sweeps(mut self, sweeps: usize) -> Self {
        self.config.max_correction_sweeps = sweeps;
        self
    }

    /// Set the power solver's iteration budget.
    #[must_use]
    pub const fn max_solver_iterations(mut self, iterations: usize) -> Self {
        self.config.max_solver_iterations = iterations;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a field is out of range.
    pub fn build(self) -> Result<AnalysisConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
