//! Bias corrector: seeded synthetic oversampling of the deficient arm
//!
//! For each flagged (covariate, value), the deficient arm receives copies of
//! donor rows (reference arm, same value) until its prevalence matches the
//! reference arm's. Rows are only ever appended; originals are never touched.
//!
//! ```text
//! delta = round((t · N − c) / (1 − t))
//! ```
//!
//! where `t` is the reference prevalence, `N` the current deficient-arm size
//! and `c` the current deficient-arm count. Appending `delta` rows makes
//! `(c + delta) / (N + delta) = t`.
//!
//! Entries are processed serially in report order (descending deviation).
//! Appending rows for a later entry dilutes earlier ones, so full sweeps are
//! repeated until a sweep appends nothing. Each sweep reads the dataset the
//! previous steps grew; this loop is never parallelized.
//!
//! Known limitation: each covariate is corrected marginally. Joint balance
//! across correlated covariates is not guaranteed.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::balance::ImbalanceReport;
use crate::config::{AnalysisConfig, ReferenceArm};
use crate::dataset::{Arm, CorrectedDataset, CovariateValue, ExperimentDataset, Population};
use crate::{Error, Result};

/// One planned correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionStep {
    /// Covariate name
    pub covariate: String,
    /// Covariate level
    pub value: CovariateValue,
    /// Reference-arm prevalence to reach
    pub target_proportion: f64,
    /// Rows to append to the deficient arm, computed on the original data
    /// (≤ 0 means no action)
    pub required_delta: i64,
    /// Arm the synthetic rows are drawn from
    pub donor_arm: Arm,
}

/// Corrections to apply, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasCorrectionPlan {
    /// Arm trusted as correctly randomized (also the donor)
    pub reference_arm: Arm,
    /// Arm receiving synthetic rows
    pub deficient_arm: Arm,
    /// Steps in processing order
    pub steps: Vec<CorrectionStep>,
}

impl BiasCorrectionPlan {
    /// True if no step requires rows.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.required_delta <= 0)
    }
}

/// Non-fatal: fewer distinct donors than rows requested.
///
/// Sampling is with replacement, so the correction proceeds with duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientDonorPool {
    /// Covariate name
    pub covariate: String,
    /// Covariate level
    pub value: CovariateValue,
    /// Rows requested in one draw
    pub requested: usize,
    /// Distinct donor rows available
    pub available: usize,
}

/// What a step ended up doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedStep {
    /// Covariate name
    pub covariate: String,
    /// Covariate level
    pub value: CovariateValue,
    /// Synthetic rows appended over all sweeps
    pub appended: usize,
    /// Final reference-arm prevalence
    pub reference_proportion: f64,
    /// Final deficient-arm prevalence
    pub deficient_proportion: f64,
}

impl AppliedStep {
    /// Remaining prevalence gap.
    #[must_use]
    pub fn residual(&self) -> f64 {
        (self.reference_proportion - self.deficient_proportion).abs()
    }
}

/// Summary of an applied plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSummary {
    /// Per-step outcome, plan order
    pub steps: Vec<AppliedStep>,
    /// Donor-pool shortfalls (one per step at most)
    pub warnings: Vec<InsufficientDonorPool>,
    /// Sweeps executed
    pub sweeps: usize,
    /// True if the last sweep appended nothing and every step's shortfall
    /// is within rounding of its target
    pub converged: bool,
    /// Largest remaining prevalence gap over all steps
    pub max_residual: f64,
}

/// Plan, corrected dataset and summary of one correction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correction {
    /// The plan that was applied
    pub plan: BiasCorrectionPlan,
    /// Original rows followed by synthetic rows
    pub dataset: CorrectedDataset,
    /// What happened
    pub summary: CorrectionSummary,
}

/// Rows to append so that `(count + delta) / (size + delta) = target`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn required_delta(target: f64, size: usize, count: usize) -> i64 {
    if target >= 1.0 {
        return 0;
    }
    ((target * size as f64 - count as f64) / (1.0 - target)).round() as i64
}

/// Bias corrector.
#[derive(Debug, Clone, Copy)]
pub struct BiasCorrector {
    seed: u64,
    reference: ReferenceArm,
    max_sweeps: usize,
}

impl BiasCorrector {
    /// Build a corrector from the analysis configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the configuration does not validate.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            seed: config.seed,
            reference: config.reference_arm,
            max_sweeps: config.max_correction_sweeps,
        })
    }

    /// Plan the correction of every flagged entry of `report`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `dataset` lacks one of the arms.
    pub fn plan(&self, report: &ImbalanceReport, dataset: &ExperimentDataset) -> Result<BiasCorrectionPlan> {
        if dataset.arms_present().len() < 2 {
            return Err(Error::InvalidInput(
                "bias correction needs records in both arms".to_string(),
            ));
        }
        let reference_arm = self.reference.resolve(dataset);
        let deficient_arm = reference_arm.opposite();
        let deficient_size = dataset.arm_size(deficient_arm);

        let steps = report
            .flagged
            .iter()
            .map(|flag| {
                let target_proportion = dataset.prevalence(&flag.covariate, &flag.value, reference_arm);
                let count = dataset.count(&flag.covariate, &flag.value, deficient_arm);
                CorrectionStep {
                    covariate: flag.covariate.clone(),
                    value: flag.value.clone(),
                    target_proportion,
                    required_delta: required_delta(target_proportion, deficient_size, count),
                    donor_arm: reference_arm,
                }
            })
            .collect();

        Ok(BiasCorrectionPlan {
            reference_arm,
            deficient_arm,
            steps,
        })
    }

    /// Apply `plan` to `dataset` with this corrector's seed.
    ///
    /// Same seed and inputs give an identical corrected dataset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the plan's arms are inconsistent.
    #[instrument(skip_all, fields(steps = plan.steps.len(), seed = self.seed))]
    pub fn apply(
        &self,
        plan: &BiasCorrectionPlan,
        dataset: &ExperimentDataset,
    ) -> Result<(CorrectedDataset, CorrectionSummary)> {
        if plan.reference_arm == plan.deficient_arm
            || plan.steps.iter().any(|s| s.donor_arm != plan.reference_arm)
        {
            return Err(Error::InvalidInput(
                "plan must draw from the reference arm into the other arm".to_string(),
            ));
        }

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let mut corrected = CorrectedDataset::from_original(dataset);
        let deficient = plan.deficient_arm;
        let records = dataset.as_slice();

        // Donor pools index the original rows; the reference arm never grows
        let pools: Vec<Vec<usize>> = plan
            .steps
            .iter()
            .map(|step| {
                records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.arm() == plan.reference_arm && r.matches(&step.covariate, &step.value))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let mut size = dataset.arm_size(deficient);
        let mut counts: Vec<usize> = plan
            .steps
            .iter()
            .map(|s| dataset.count(&s.covariate, &s.value, deficient))
            .collect();
        let mut appended = vec![0usize; plan.steps.len()];
        let mut warnings: Vec<InsufficientDonorPool> = Vec::new();

        let mut sweeps = 0;
        let mut quiet = false;
        while sweeps < self.max_sweeps {
            sweeps += 1;
            let mut appended_this_sweep = 0usize;

            for (i, step) in plan.steps.iter().enumerate() {
                if step.target_proportion >= 1.0 {
                    if sweeps == 1 {
                        warn!(covariate = %step.covariate, value = %step.value, "target proportion is 1, step skipped");
                    }
                    continue;
                }
                let delta = required_delta(step.target_proportion, size, counts[i]);
                if delta <= 0 {
                    continue;
                }
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let delta = delta as usize;

                let pool = &pools[i];
                if delta > pool.len() && !warnings.iter().any(|w| w.covariate == step.covariate && w.value == step.value) {
                    warn!(
                        covariate = %step.covariate,
                        value = %step.value,
                        requested = delta,
                        available = pool.len(),
                        "donor pool smaller than draw, sampling with replacement"
                    );
                    warnings.push(InsufficientDonorPool {
                        covariate: step.covariate.clone(),
                        value: step.value.clone(),
                        requested: delta,
                        available: pool.len(),
                    });
                }
                if pool.is_empty() {
                    continue;
                }

                for _ in 0..delta {
                    let donor = &records[pool[rng.gen_range(0..pool.len())]];
                    let copy = donor.reassigned(deficient);
                    for (j, other) in plan.steps.iter().enumerate() {
                        if copy.matches(&other.covariate, &other.value) {
                            counts[j] += 1;
                        }
                    }
                    corrected.push_synthetic(copy);
                }
                size += delta;
                appended[i] += delta;
                appended_this_sweep += delta;
                debug!(sweep = sweeps, covariate = %step.covariate, value = %step.value, delta, "appended synthetic rows");
            }

            if appended_this_sweep == 0 {
                quiet = true;
                break;
            }
        }
        if !quiet {
            warn!(sweeps, "correction stopped at the sweep limit before settling");
        }

        #[allow(clippy::cast_precision_loss)]
        let steps: Vec<AppliedStep> = plan
            .steps
            .iter()
            .zip(counts.iter().zip(&appended))
            .map(|(step, (&count, &rows))| AppliedStep {
                covariate: step.covariate.clone(),
                value: step.value.clone(),
                appended: rows,
                reference_proportion: step.target_proportion,
                deficient_proportion: if size == 0 { 0.0 } else { count as f64 / size as f64 },
            })
            .collect();
        let max_residual = steps.iter().map(AppliedStep::residual).fold(0.0, f64::max);

        // A quiet sweep also happens when a step has no donors to draw from
        #[allow(clippy::cast_precision_loss)]
        let tolerance = if size == 0 { 0.0 } else { 0.5 / size as f64 } + 1e-12;
        let settled = steps
            .iter()
            .all(|s| s.reference_proportion - s.deficient_proportion <= tolerance);
        let converged = quiet && settled;
        if quiet && !settled {
            warn!(max_residual, "correction left a prevalence gap it could not close");
        }

        info!(
            synthetic = corrected.synthetic_count(),
            sweeps,
            max_residual,
            "bias correction applied"
        );

        Ok((
            corrected,
            CorrectionSummary {
                steps,
                warnings,
                sweeps,
                converged,
                max_residual,
            },
        ))
    }

    /// Plan and apply in one call.
    ///
    /// # Errors
    ///
    /// Same as [`BiasCorrector::plan`] and [`BiasCorrector::apply`].
    pub fn correct(&self, report: &ImbalanceReport, dataset: &ExperimentDataset) -> Result<Correction> {
        let plan = self.plan(report, dataset)?;
        let (corrected, summary) = self.apply(&plan, dataset)?;
        Ok(Correction {
            plan,
            dataset: corrected,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{BalanceDiagnostic, BalanceOutcome};
    use crate::dataset::ExperimentRecord;

    /// 1000 test rows (20% Uruguay), 1000 control rows (2% Uruguay).
    fn skewed() -> ExperimentDataset {
        let mut records = Vec::new();
        for i in 0..2000 {
            let (arm, k) = if i < 1000 { (Arm::Test, i) } else { (Arm::Control, i - 1000) };
            let uruguay = match arm {
                Arm::Test => k < 200,
                Arm::Control => k < 20,
            };
            records.push(
                ExperimentRecord::builder(i.to_string(), arm, k % 10 == 0)
                    .covariate("country", if uruguay { "Uruguay" } else { "Chile" })
                    .covariate("device", if k % 2 == 0 { "Web" } else { "Mobile" })
                    .build(),
            );
        }
        ExperimentDataset::new(records).unwrap()
    }

    fn report(dataset: &ExperimentDataset) -> ImbalanceReport {
        match BalanceDiagnostic::new(&AnalysisConfig::default()).unwrap().run(dataset).unwrap() {
            BalanceOutcome::Report(report) => report,
            BalanceOutcome::NotApplicable { .. } => panic!("both arms present"),
        }
    }

    fn corrector(seed: u64) -> BiasCorrector {
        let config = AnalysisConfig::builder()
            .seed(seed)
            .reference_arm(ReferenceArm::Test)
            .build()
            .unwrap();
        BiasCorrector::new(&config).unwrap()
    }

    #[test]
    fn test_required_delta_reaches_target() {
        // (20 + d) / (1000 + d) = 0.2 → d = 225
        assert_eq!(required_delta(0.2, 1000, 20), 225);
        assert_eq!(required_delta(0.2, 1000, 300), -125);
        assert_eq!(required_delta(1.0, 1000, 20), 0);
    }

    #[test]
    fn test_plan_targets_reference_prevalence() {
        let dataset = skewed();
        let plan = corrector(1).plan(&report(&dataset), &dataset).unwrap();

        assert_eq!(plan.reference_arm, Arm::Test);
        assert_eq!(plan.deficient_arm, Arm::Control);
        let step = &plan.steps[0];
        assert_eq!(step.value, CovariateValue::from("Uruguay"));
        assert!((step.target_proportion - 0.2).abs() < 1e-12);
        assert_eq!(step.required_delta, 225);
        assert_eq!(step.donor_arm, Arm::Test);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_apply_balances_and_keeps_originals() {
        let dataset = skewed();
        let correction = corrector(7).correct(&report(&dataset), &dataset).unwrap();
        let corrected = &correction.dataset;

        let uruguay = CovariateValue::from("Uruguay");
        let gap = (corrected.prevalence("country", &uruguay, Arm::Test)
            - corrected.prevalence("country", &uruguay, Arm::Control))
        .abs();
        assert!(gap < 1e-3, "gap {gap}");
        assert!(correction.summary.converged);
        assert!(correction.summary.max_residual < 1e-3);

        assert_eq!(corrected.original_len(), dataset.len());
        for (row, original) in corrected.original_rows().iter().zip(dataset.as_slice()) {
            assert!(!row.is_synthetic);
            assert_eq!(&row.record, original);
        }
        for row in &corrected.rows()[corrected.original_len()..] {
            assert!(row.is_synthetic);
            assert_eq!(row.record.arm(), Arm::Control);
            assert!(row.record.matches("country", &uruguay));
        }
    }

    #[test]
    fn test_same_seed_same_draw() {
        let dataset = skewed();
        let report = report(&dataset);
        let a = corrector(99).correct(&report, &dataset).unwrap();
        let b = corrector(99).correct(&report, &dataset).unwrap();
        assert_eq!(a.dataset, b.dataset);
        assert_eq!(
            serde_json::to_string(&a.dataset).unwrap(),
            serde_json::to_string(&b.dataset).unwrap()
        );

        let c = corrector(100).correct(&report, &dataset).unwrap();
        assert_eq!(a.dataset.synthetic_count(), c.dataset.synthetic_count());
        assert_ne!(a.dataset, c.dataset);
    }

    #[test]
    fn test_small_donor_pool_warns_and_proceeds() {
        // 5 Uruguayan test rows out of 10; control has none of 100
        let mut records = Vec::new();
        for i in 0..10 {
            records.push(
                ExperimentRecord::builder(format!("t{i}"), Arm::Test, false)
                    .covariate("country", if i < 5 { "Uruguay" } else { "Chile" })
                    .build(),
            );
        }
        for i in 0..100 {
            records.push(
                ExperimentRecord::builder(format!("c{i}"), Arm::Control, false)
                    .covariate("country", "Chile")
                    .build(),
            );
        }
        let dataset = ExperimentDataset::new(records).unwrap();
        let plan = BiasCorrectionPlan {
            reference_arm: Arm::Test,
            deficient_arm: Arm::Control,
            steps: vec![CorrectionStep {
                covariate: "country".to_string(),
                value: "Uruguay".into(),
                target_proportion: 0.5,
                required_delta: 100,
                donor_arm: Arm::Test,
            }],
        };
        let (corrected, summary) = corrector(3).apply(&plan, &dataset).unwrap();

        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.warnings[0].available, 5);
        assert_eq!(corrected.synthetic_count(), 100);
        assert!(summary.max_residual < 1e-12);
    }

    #[test]
    fn test_empty_donor_pool_is_not_converged() {
        // Neither arm has a Paraguayan row, but the plan targets 50%
        let dataset = skewed();
        let plan = BiasCorrectionPlan {
            reference_arm: Arm::Test,
            deficient_arm: Arm::Control,
            steps: vec![CorrectionStep {
                covariate: "country".to_string(),
                value: "Paraguay".into(),
                target_proportion: 0.5,
                required_delta: 1000,
                donor_arm: Arm::Test,
            }],
        };
        let (corrected, summary) = corrector(5).apply(&plan, &dataset).unwrap();

        assert_eq!(corrected.synthetic_count(), 0);
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.warnings[0].available, 0);
        assert_eq!(summary.steps[0].appended, 0);
        assert!((summary.max_residual - 0.5).abs() < 1e-12);
        assert!(!summary.converged);
    }

    #[test]
    fn test_inconsistent_plan_rejected() {
        let dataset = skewed();
        let plan = BiasCorrectionPlan {
            reference_arm: Arm::Test,
            deficient_arm: Arm::Test,
            steps: vec![],
        };
        assert!(matches!(
            corrector(1).apply(&plan, &dataset),
            Err(Error::InvalidInput(_))
        ));
    }
}
