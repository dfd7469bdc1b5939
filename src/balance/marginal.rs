//! Marginal balance check
//!
//! For each (covariate, value) cell, compares the share of each arm carrying
//! the value and runs a 2×2 Pearson chi-square test of independence
//! (value present/absent × arm). A cell is flagged when the test rejects at
//! the Bonferroni-corrected level `alpha / m` over the `m` cells. The
//! deviation score does not gate the flag; it ranks flagged cells.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use super::features::FeatureSpace;
use super::{deviation_score, ImbalanceEntry};
use crate::{Error, Result};

/// Pearson chi-square statistic of a 2×2 table `[[a, b], [c, d]]`.
///
/// Returns `None` when a margin is empty and the test is not defined.
pub(crate) fn chi_square_2x2(a: f64, b: f64, c: f64, d: f64) -> Option<f64> {
    let margins = [(a + b), (c + d), (a + c), (b + d)];
    if margins.iter().any(|m| *m <= 0.0) {
        return None;
    }
    let n = a + b + c + d;
    let det = a.mul_add(d, -(b * c));
    Some(n * det * det / margins.iter().product::<f64>())
}

#[allow(clippy::cast_precision_loss)]
fn cell(
    space: &FeatureSpace,
    id: usize,
    totals: [usize; 2],
    chi2: &ChiSquared,
    cell_alpha: f64,
) -> ImbalanceEntry {
    let [in_test, in_control] = space.counts(id);
    let test_proportion = in_test as f64 / totals[0] as f64;
    let control_proportion = in_control as f64 / totals[1] as f64;
    let deviation = deviation_score(test_proportion, control_proportion);

    let chi_square = chi_square_2x2(
        in_test as f64,
        in_control as f64,
        (totals[0] - in_test) as f64,
        (totals[1] - in_control) as f64,
    );
    let p_value = chi_square.map_or(1.0, |stat| chi2.sf(stat).clamp(0.0, 1.0));

    let (covariate, value) = space.feature(id).clone();
    ImbalanceEntry {
        covariate,
        value,
        test_proportion,
        control_proportion,
        deviation,
        chi_square: chi_square.unwrap_or(0.0),
        p_value,
        marginal_flag: p_value < cell_alpha,
    }
}

/// The 1-df chi-square distribution shared by both layers.
pub(crate) fn chi_square_1df() -> Result<ChiSquared> {
    ChiSquared::new(1.0).map_err(|e| Error::Other(format!("chi-square(1): {e}")))
}

/// Evaluate every cell of the feature space, ordered by covariate then value.
///
/// `alpha` is the family-wise level of this layer, split evenly over cells.
/// Both arms must be non-empty.
pub(crate) fn check(space: &FeatureSpace, chi2: &ChiSquared, alpha: f64) -> Vec<ImbalanceEntry> {
    let totals = space.arm_totals();
    #[allow(clippy::cast_precision_loss)]
    let cell_alpha = alpha / space.n_features().max(1) as f64;

    let per_covariate = |range: &std::ops::Range<usize>| -> Vec<ImbalanceEntry> {
        range
            .clone()
            .map(|id| cell(space, id, totals, chi2, cell_alpha))
            .collect()
    };

    #[cfg(feature = "parallel")]
    let cells: Vec<Vec<ImbalanceEntry>> = space
        .covariate_ranges()
        .par_iter()
        .map(per_covariate)
        .collect();

    #[cfg(not(feature = "parallel"))]
    let cells: Vec<Vec<ImbalanceEntry>> = space.covariate_ranges().iter().map(per_covariate).collect();

    cells.into_iter().flatten().collect()
}
