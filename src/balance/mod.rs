//! Covariate balance diagnostic
//!
//! Checks the core A/B-test assumption: assignment is independent of every
//! recorded covariate. Two layers run on the same one-hot feature space:
//!
//! ```text
//! Population ──> FeatureSpace ──┬──> marginal cells (prevalence, chi-square)
//!                               └──> split tree (balanced Gini, min gain)
//!                                          │
//!                     ImbalanceReport <────┘ (flags ranked by deviation)
//! ```
//!
//! The family-wise level `alpha` is halved between the layers. A cell is
//! flagged by the marginal layer when its chi-square p-value is below
//! `alpha / (2·m)` over `m` cells. A classifier split flags its level when the
//! matching side deviates from an even split by more than the threshold AND
//! the split's own 2×2 test clears `alpha / (2·m·k)` over `k` searched nodes.
//!
//! The deviation score of a cell with per-arm prevalences `p_t`, `p_c` is
//! `|p_t − p_c| / (p_t + p_c)`: the relative deviation of the class-balanced
//! test share from an even split. It ignores unequal arm sizes, so a 46/54
//! experiment scores 0 for every perfectly randomized level.
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::balance::{BalanceDiagnostic, BalanceOutcome};
//! use trueno_ab::config::AnalysisConfig;
//! use trueno_ab::dataset::{Arm, ExperimentDataset, ExperimentRecord};
//!
//! let records = (0..100)
//!     .map(|i| {
//!         let arm = if i % 2 == 0 { Arm::Test } else { Arm::Control };
//!         ExperimentRecord::builder(i.to_string(), arm, false)
//!             .covariate("device", if i % 4 < 2 { "Web" } else { "Mobile" })
//!             .build()
//!     })
//!     .collect();
//! let dataset = ExperimentDataset::new(records)?;
//!
//! let diagnostic = BalanceDiagnostic::new(&AnalysisConfig::default())?;
//! let BalanceOutcome::Report(report) = diagnostic.run(&dataset)? else {
//!     unreachable!("both arms are present");
//! };
//! assert!(report.is_balanced());
//! # Ok::<(), trueno_ab::Error>(())
//! ```

mod features;
mod marginal;
mod tree;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::AnalysisConfig;
use crate::dataset::{Arm, CovariateValue, Population};
use crate::Result;

use features::FeatureSpace;
pub use tree::SplitSummary;

/// Relative deviation of the balanced test share from an even split.
///
/// Returns 0 when neither arm carries the level.
#[must_use]
pub fn deviation_score(test_proportion: f64, control_proportion: f64) -> f64 {
    let sum = test_proportion + control_proportion;
    if sum <= 0.0 {
        return 0.0;
    }
    (test_proportion - control_proportion).abs() / sum
}

/// Which layer raised a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionLayer {
    /// Cell chi-square rejected at the Bonferroni level
    Marginal,
    /// Material, significant split in the assignment classifier
    Classifier,
}

/// Balance statistics of one (covariate, value) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceEntry {
    /// Covariate name
    pub covariate: String,
    /// Covariate level
    pub value: CovariateValue,
    /// Share of the test arm carrying the level
    pub test_proportion: f64,
    /// Share of the control arm carrying the level
    pub control_proportion: f64,
    /// `|p_t − p_c| / (p_t + p_c)`
    pub deviation: f64,
    /// Pearson chi-square statistic (0 when undefined)
    pub chi_square: f64,
    /// Chi-square p-value (1 when undefined)
    pub p_value: f64,
    /// True if the chi-square test rejected at the marginal layer's
    /// Bonferroni level
    pub marginal_flag: bool,
}

/// A flagged cell, as consumed by the bias corrector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedEntry {
    /// Covariate name
    pub covariate: String,
    /// Covariate level
    pub value: CovariateValue,
    /// Marginal deviation score, the ranking key
    pub deviation: f64,
    /// Layers that raised the flag
    pub layers: Vec<DetectionLayer>,
}

/// Result of the balance diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceReport {
    /// Records in the test arm
    pub test_size: usize,
    /// Records in the control arm
    pub control_size: usize,
    /// Flag threshold on the deviation score
    pub threshold: f64,
    /// Every cell, ordered by covariate then value
    pub entries: Vec<ImbalanceEntry>,
    /// Flagged cells, descending deviation (ties: covariate, then value)
    pub flagged: Vec<FlaggedEntry>,
    /// Retained classifier splits in pre-order, for an external renderer
    pub splits: Vec<SplitSummary>,
}

impl ImbalanceReport {
    /// Look up the cell of `covariate` = `value`.
    #[must_use]
    pub fn get(&self, covariate: &str, value: &CovariateValue) -> Option<&ImbalanceEntry> {
        self.entries
            .binary_search_by(|e| {
                e.covariate
                    .as_str()
                    .cmp(covariate)
                    .then_with(|| e.value.cmp(value))
            })
            .ok()
            .map(|i| &self.entries[i])
    }

    /// True if nothing was flagged.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.flagged.is_empty()
    }

    /// True if `covariate` = `value` was flagged.
    #[must_use]
    pub fn is_flagged(&self, covariate: &str, value: &CovariateValue) -> bool {
        self.flagged
            .iter()
            .any(|f| f.covariate == covariate && &f.value == value)
    }

    /// Overall raw test share `n_test / n`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn test_share(&self) -> f64 {
        let n = self.test_size + self.control_size;
        if n == 0 {
            return 0.0;
        }
        self.test_size as f64 / n as f64
    }
}

/// Outcome of running the diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BalanceOutcome {
    /// Both arms present; report attached
    Report(ImbalanceReport),
    /// Fewer than two arms present, balance is meaningless
    NotApplicable {
        /// Arms that do have records
        arms_present: Vec<Arm>,
    },
}

impl BalanceOutcome {
    /// The report, if the diagnostic applied.
    #[must_use]
    pub const fn report(&self) -> Option<&ImbalanceReport> {
        match self {
            Self::Report(report) => Some(report),
            Self::NotApplicable { .. } => None,
        }
    }
}

/// Covariate balance diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct BalanceDiagnostic {
    alpha: f64,
    threshold: f64,
    tree: tree::TreeParams,
}

impl BalanceDiagnostic {
    /// Build a diagnostic from the analysis configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the configuration does not validate.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            alpha: config.alpha,
            threshold: config.imbalance_threshold,
            tree: tree::TreeParams {
                min_impurity_decrease: config.min_impurity_decrease,
                max_depth: config.max_tree_depth,
            },
        })
    }

    /// Run both layers over `population`.
    ///
    /// # Errors
    ///
    /// Returns an error only if a statistical distribution cannot be built.
    #[instrument(skip_all, fields(rows = population.len(), covariates = population.covariate_names().len()))]
    pub fn run(&self, population: &impl Population) -> Result<BalanceOutcome> {
        let arms_present = population.arms_present();
        if arms_present.len() < 2 {
            info!(?arms_present, "single arm, balance check not applicable");
            return Ok(BalanceOutcome::NotApplicable { arms_present });
        }

        let space = FeatureSpace::encode(population);
        let chi2 = marginal::chi_square_1df()?;
        let layer_alpha = self.alpha / 2.0;
        let entries = marginal::check(&space, &chi2, layer_alpha);
        let tree::GrownTree { splits, searched_nodes } = tree::grow(&space, self.tree, &chi2);
        #[allow(clippy::cast_precision_loss)]
        let split_alpha = layer_alpha / (space.n_features().max(1) * searched_nodes.max(1)) as f64;
        debug!(
            cells = entries.len(),
            splits = splits.len(),
            searched_nodes,
            split_alpha,
            "balance layers complete"
        );

        let flagged = self.rank_flags(&entries, &splits, split_alpha);
        let [test_size, control_size] = space.arm_totals();
        info!(flagged = flagged.len(), "balance check complete");

        Ok(BalanceOutcome::Report(ImbalanceReport {
            test_size,
            control_size,
            threshold: self.threshold,
            entries,
            flagged,
            splits,
        }))
    }

    fn rank_flags(
        &self,
        entries: &[ImbalanceEntry],
        splits: &[SplitSummary],
        split_alpha: f64,
    ) -> Vec<FlaggedEntry> {
        let mut flagged: Vec<FlaggedEntry> = entries
            .iter()
            .filter(|e| e.marginal_flag)
            .map(|e| FlaggedEntry {
                covariate: e.covariate.clone(),
                value: e.value.clone(),
                deviation: e.deviation,
                layers: vec![DetectionLayer::Marginal],
            })
            .collect();

        let significant = splits
            .iter()
            .filter(|s| s.matching_deviation() > self.threshold && s.p_value < split_alpha);
        for split in significant {
            if let Some(existing) = flagged
                .iter_mut()
                .find(|f| f.covariate == split.covariate && f.value == split.value)
            {
                if !existing.layers.contains(&DetectionLayer::Classifier) {
                    existing.layers.push(DetectionLayer::Classifier);
                }
                continue;
            }
            let deviation = entries
                .iter()
                .find(|e| e.covariate == split.covariate && e.value == split.value)
                .map_or_else(|| split.matching_deviation(), |e| e.deviation);
            flagged.push(FlaggedEntry {
                covariate: split.covariate.clone(),
                value: split.value.clone(),
                deviation,
                layers: vec![DetectionLayer::Classifier],
            });
        }

        flagged.sort_by(|a, b| {
            b.deviation
                .partial_cmp(&a.deviation)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.covariate.cmp(&b.covariate))
                .then_with(|| a.value.cmp(&b.value))
        });
        flagged
    }
}
