//! Metric comparator: Welch's unequal-variance t-test
//!
//! Two-sided test of the difference in mean outcome between treatment and
//! control, with Welch–Satterthwaite degrees of freedom:
//!
//! ```text
//! t  = (m1 − m2) / sqrt(s1²/n1 + s2²/n2)
//! df = (s1²/n1 + s2²/n2)² / [ (s1²/n1)²/(n1−1) + (s2²/n2)²/(n2−1) ]
//! ```
//!
//! References:
//! - Welch (1947): The generalization of "Student's" problem when several
//!   different population variances are involved

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, instrument};

use crate::dataset::{Arm, Population};
use crate::{Error, Result};

/// Outcome of comparing treatment against control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// p-value above alpha
    NonSignificant,
    /// Treatment significantly higher
    SignificantBetter,
    /// Treatment significantly lower
    SignificantWorse,
    /// At least one arm has zero variance; the t-statistic does not exist
    Undefined,
}

/// Final verdict of a comparison.
///
/// For `Decision::Undefined` the statistic is 0 and the p-value is 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    /// Welch t-statistic (treatment − control)
    pub statistic: f64,
    /// Two-sided p-value in [0, 1]
    pub p_value: f64,
    /// Decision at the configured alpha
    pub decision: Decision,
}

impl TestVerdict {
    fn undefined() -> Self {
        Self {
            statistic: 0.0,
            p_value: 1.0,
            decision: Decision::Undefined,
        }
    }
}

/// Full Welch test result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WelchTest {
    /// t-statistic (treatment − control)
    pub statistic: f64,
    /// Welch–Satterthwaite degrees of freedom
    pub degrees_of_freedom: f64,
    /// Two-sided p-value
    pub p_value: f64,
    /// Mean treatment outcome
    pub mean_treatment: f64,
    /// Mean control outcome
    pub mean_control: f64,
}

impl WelchTest {
    /// Apply the decision rule at significance level `alpha`.
    #[must_use]
    pub fn verdict(&self, alpha: f64) -> TestVerdict {
        let decision = if self.p_value > alpha {
            Decision::NonSignificant
        } else if self.statistic > 0.0 {
            Decision::SignificantBetter
        } else {
            Decision::SignificantWorse
        };
        TestVerdict {
            statistic: self.statistic,
            p_value: self.p_value,
            decision,
        }
    }
}

/// Mean and unbiased sample variance (n − 1 denominator).
#[allow(clippy::cast_precision_loss)]
fn mean_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    (mean, ss / (n - 1.0))
}

/// True if every value equals the first. Rounding in the mean can leave a
/// tiny non-zero variance for constant non-integer data, so this is checked
/// on the values themselves.
#[allow(clippy::float_cmp)]
fn is_constant(values: &[f64]) -> bool {
    values.iter().all(|v| *v == values[0])
}

fn validate_arm(values: &[f64], label: &str) -> Result<()> {
    if values.is_empty() {
        return Err(Error::InvalidInput(format!("{label} arm is empty")));
    }
    if values.len() < 2 {
        return Err(Error::DegenerateSample(format!(
            "{label} arm has a single observation"
        )));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "{label} arm contains a non-finite outcome ({bad})"
        )));
    }
    Ok(())
}

/// Welch's t-test of `treatment` against `control`.
///
/// Returns `Ok(None)` when either arm is constant, so callers can
/// surface `Decision::Undefined` instead of a NaN statistic.
///
/// # Errors
///
/// - `InvalidInput` if an arm is empty or has non-finite values
/// - `DegenerateSample` if an arm has a single observation
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(treatment: &[f64], control: &[f64]) -> Result<Option<WelchTest>> {
    validate_arm(treatment, "treatment")?;
    validate_arm(control, "control")?;

    let n1 = treatment.len() as f64;
    let n2 = control.len() as f64;
    let (mean1, var1) = mean_variance(treatment);
    let (mean2, var2) = mean_variance(control);

    if is_constant(treatment) || is_constant(control) {
        debug!(var1, var2, "constant arm, t-statistic undefined");
        return Ok(None);
    }

    let se1 = var1 / n1;
    let se2 = var2 / n2;
    let statistic = (mean1 - mean2) / (se1 + se2).sqrt();
    let degrees_of_freedom = (se1 + se2).powi(2) / (se1.powi(2) / (n1 - 1.0) + se2.powi(2) / (n2 - 1.0));

    let t_dist = StudentsT::new(0.0, 1.0, degrees_of_freedom)
        .map_err(|e| Error::Other(format!("Student's t with df={degrees_of_freedom}: {e}")))?;
    // Survival function keeps precision for very small p-values
    let p_value = (2.0 * t_dist.sf(statistic.abs())).clamp(0.0, 1.0);

    Ok(Some(WelchTest {
        statistic,
        degrees_of_freedom,
        p_value,
        mean_treatment: mean1,
        mean_control: mean2,
    }))
}

/// Compare two outcome sequences and apply the decision rule.
///
/// # Errors
///
/// Same as [`welch_t_test`], plus `InvalidInput` if `alpha` is outside (0, 1).
#[instrument(skip_all, fields(n_treatment = treatment.len(), n_control = control.len()))]
pub fn compare(treatment: &[f64], control: &[f64], alpha: f64) -> Result<TestVerdict> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::InvalidInput(format!(
            "alpha must be in (0, 1), got {alpha}"
        )));
    }
    let verdict = welch_t_test(treatment, control)?
        .map_or_else(TestVerdict::undefined, |test| test.verdict(alpha));
    debug!(
        statistic = verdict.statistic,
        p_value = verdict.p_value,
        decision = ?verdict.decision,
        "welch comparison"
    );
    Ok(verdict)
}

/// Compare conversion outcomes of the two arms of a population.
///
/// # Errors
///
/// Same as [`compare`]; a population with a single arm is `DegenerateSample`.
pub fn compare_population(population: &impl Population, alpha: f64) -> Result<TestVerdict> {
    let arms = population.arms_present();
    if arms.len() < 2 {
        return Err(Error::DegenerateSample(format!(
            "single-arm data, only {arms:?} present"
        )));
    }
    compare(
        &population.outcomes(Arm::Test),
        &population.outcomes(Arm::Control),
        alpha,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bernoulli(n: usize, successes: usize) -> Vec<f64> {
        (0..n).map(|i| if i < successes { 1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn test_identical_arms_are_non_significant() {
        let arm = vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let verdict = compare(&arm, &arm, 0.05).unwrap();
        assert!(verdict.statistic.abs() < 1e-12);
        assert!((verdict.p_value - 1.0).abs() < 1e-9);
        assert_eq!(verdict.decision, Decision::NonSignificant);
    }

    #[test]
    fn test_known_welch_values() {
        // Means 3 and 5, sample variances 2.5 each, n = 5: t = -2, df = 8
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [3.0, 4.0, 5.0, 6.0, 7.0];
        let test = welch_t_test(&a, &b).unwrap().unwrap();
        assert!((test.statistic + 2.0).abs() < 1e-12);
        assert!((test.degrees_of_freedom - 8.0).abs() < 1e-9);
        // Two-sided p for t = 2, df = 8 is 0.0805
        assert!((test.p_value - 0.0805).abs() < 1e-3);
        assert_eq!(test.verdict(0.05).decision, Decision::NonSignificant);
        assert_eq!(test.verdict(0.10).decision, Decision::SignificantWorse);
    }

    #[test]
    fn test_swap_flips_sign_only() {
        let treatment = bernoulli(400, 60);
        let control = bernoulli(500, 50);
        let forward = compare(&treatment, &control, 0.05).unwrap();
        let backward = compare(&control, &treatment, 0.05).unwrap();
        assert!((forward.statistic + backward.statistic).abs() < 1e-12);
        assert!((forward.p_value - backward.p_value).abs() < 1e-12);
        assert_eq!(forward.decision, Decision::SignificantBetter);
        assert_eq!(backward.decision, Decision::SignificantWorse);
    }

    #[test]
    fn test_zero_variance_is_undefined() {
        let verdict = compare(&[1.0, 1.0, 1.0], &[0.0, 1.0, 0.0], 0.05).unwrap();
        assert_eq!(verdict.decision, Decision::Undefined);
        assert!(verdict.statistic.is_finite());
        assert!((verdict.p_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_degenerate_and_invalid_inputs() {
        assert!(matches!(
            compare(&[], &[0.0, 1.0], 0.05),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            compare(&[1.0], &[0.0, 1.0], 0.05),
            Err(Error::DegenerateSample(_))
        ));
        assert!(matches!(
            compare(&[0.0, 1.0], &[0.0, f64::NAN], 0.05),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            compare(&[0.0, 1.0], &[0.0, 1.0], 1.5),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_compare_population_uses_conversions() {
        use crate::dataset::{ExperimentDataset, ExperimentRecord};

        let records = (0..400)
            .map(|i| {
                let arm = if i < 200 { Arm::Test } else { Arm::Control };
                let converted = if i < 200 { i % 4 == 0 } else { i % 10 == 0 };
                ExperimentRecord::new(i.to_string(), arm, converted)
            })
            .collect();
        let dataset = ExperimentDataset::new(records).unwrap();
        let verdict = compare_population(&dataset, 0.05).unwrap();
        assert!(verdict.statistic > 0.0);
        assert_eq!(verdict.decision, Decision::SignificantBetter);

        let single = ExperimentDataset::new(vec![
            ExperimentRecord::new("1", Arm::Control, true),
            ExperimentRecord::new("2", Arm::Control, false),
        ])
        .unwrap();
        assert!(matches!(
            compare_population(&single, 0.05),
            Err(Error::DegenerateSample(_))
        ));
    }

    #[test]
    fn test_constant_non_integer_arms_are_undefined() {
        // Mean of ten 0.7s is not exactly 0.7, so the variance is not exactly 0
        let verdict = compare(&[0.7; 10], &[0.1; 10], 0.05).unwrap();
        assert_eq!(verdict.decision, Decision::Undefined);
        assert!((verdict.p_value - 1.0).abs() < f64::EPSILON);

        let verdict = compare(&[0.7; 10], &[0.7; 10], 0.05).unwrap();
        assert_eq!(verdict.decision, Decision::Undefined);
        assert!(welch_t_test(&[0.3; 7], &[0.1, 0.2, 0.4]).unwrap().is_none());
    }
}
