//! Sample size solver for two-proportion experiments
//!
//! Effect sizes use Cohen's arcsine transform, which stabilizes the variance
//! of a proportion:
//!
//! ```text
//! h = 2·asin(√p2) − 2·asin(√p1)
//! ```
//!
//! The per-arm sample size is the smallest `n` at which a two-sided test at
//! level `α` reaches the target power:
//!
//! ```text
//! power(n) = Φ(|h|·√(n/2) − z) + Φ(−|h|·√(n/2) − z),   z = Φ⁻¹(1 − α/2)
//! ```
//!
//! `power(n)` is increasing in `n`, and the one-tailed closed form
//! `n₀ = 2·((z + z_β)/h)²` already reaches the target, so `[0, n₀]` brackets
//! the root. Bisection narrows it within a fixed iteration budget.
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::power::{candidate_grid, PowerQuery, SampleSizeSolver};
//!
//! let query = PowerQuery::new(0.10, candidate_grid(0.105, 0.155, 0.005)?);
//! let result = SampleSizeSolver::default().solve(&query)?;
//!
//! assert_eq!(result.points.len(), 10);
//! // Larger lifts need fewer users
//! let curve = result.curve();
//! assert!(curve.windows(2).all(|w| w[1].1 <= w[0].1));
//! # Ok::<(), trueno_ab::Error>(())
//! ```

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, instrument};

use crate::config::{AnalysisConfig, DEFAULT_ALPHA, DEFAULT_POWER};
use crate::{Error, Result};

/// Relative bracket width at which bisection stops
const RELATIVE_TOLERANCE: f64 = 1e-10;

/// Default bisection budget
const DEFAULT_MAX_ITERATIONS: usize = 200;

/// Largest candidate grid [`candidate_grid`] will build
pub const MAX_GRID_POINTS: usize = 100_000;

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| Error::Other(format!("standard normal: {e}")))
}

fn check_rate(name: &str, rate: f64) -> Result<()> {
    if rate > 0.0 && rate < 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("{name} must be in (0, 1), got {rate}")))
    }
}

fn check_alpha(alpha: f64) -> Result<()> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("alpha must be in (0, 1), got {alpha}")))
    }
}

/// Cohen's `h` between baseline `p1` and candidate `p2`.
///
/// # Errors
///
/// Returns `InvalidInput` if either rate is outside (0, 1).
pub fn effect_size(p1: f64, p2: f64) -> Result<f64> {
    check_rate("baseline rate", p1)?;
    check_rate("candidate rate", p2)?;
    Ok(2.0 * p2.sqrt().asin() - 2.0 * p1.sqrt().asin())
}

fn power_at(normal: &Normal, h: f64, n: f64, z: f64) -> f64 {
    let shift = h.abs() * (n / 2.0).sqrt();
    normal.cdf(shift - z) + normal.cdf(-shift - z)
}

/// Power of a two-sided test with `n` users per arm and effect size `h`.
///
/// # Errors
///
/// Returns `InvalidInput` for `alpha` outside (0, 1) or negative `n`.
pub fn achieved_power(h: f64, n: f64, alpha: f64) -> Result<f64> {
    check_alpha(alpha)?;
    if !(n >= 0.0 && n.is_finite()) || !h.is_finite() {
        return Err(Error::InvalidInput(format!(
            "sample size must be finite and non-negative, got n={n}, h={h}"
        )));
    }
    let normal = standard_normal()?;
    let z = normal.inverse_cdf(1.0 - alpha / 2.0);
    Ok(power_at(&normal, h, n, z))
}

/// Continuous per-arm sample size reaching `power` for effect size `h`.
///
/// # Errors
///
/// - `Undefined` if `h` is zero (infinite sample size)
/// - `InvalidInput` for `alpha` outside (0, 1) or `power` outside (alpha, 1)
/// - `NonConvergence` if bisection exceeds `max_iterations`
pub fn required_sample_size(h: f64, power: f64, alpha: f64, max_iterations: usize) -> Result<f64> {
    check_alpha(alpha)?;
    if !(power > alpha && power < 1.0) {
        return Err(Error::InvalidInput(format!(
            "power must be in (alpha, 1), got {power}"
        )));
    }
    if !h.is_finite() {
        return Err(Error::InvalidInput(format!("effect size must be finite, got {h}")));
    }
    if h == 0.0 {
        return Err(Error::Undefined(
            "baseline and candidate rates are equal, no finite sample detects a zero effect"
                .to_string(),
        ));
    }

    let normal = standard_normal()?;
    let z = normal.inverse_cdf(1.0 - alpha / 2.0);
    let z_beta = normal.inverse_cdf(power);
    let n0 = 2.0 * ((z + z_beta) / h).powi(2);
    if !n0.is_finite() {
        return Err(Error::Undefined(format!(
            "effect size {h:e} is too small for a finite sample size"
        )));
    }

    let (mut lo, mut hi) = (0.0_f64, n0);
    let mut iterations = 0;
    while (hi - lo) / hi > RELATIVE_TOLERANCE {
        if iterations >= max_iterations {
            return Err(Error::NonConvergence {
                iterations,
                residual: (hi - lo) / hi,
            });
        }
        iterations += 1;
        let mid = 0.5 * (lo + hi);
        if power_at(&normal, h, mid, z) >= power {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    debug!(h, n0, n = hi, iterations, "sample size solved");
    Ok(hi)
}

/// Half-open grid `start, start + step, ...` below `stop`.
///
/// `candidate_grid(0.105, 0.155, 0.005)` yields ten rates ending at 0.150.
///
/// # Errors
///
/// Returns `InvalidInput` for a non-positive or non-finite step, or when the
/// grid would exceed [`MAX_GRID_POINTS`].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn candidate_grid(start: f64, stop: f64, step: f64) -> Result<Vec<f64>> {
    if !(step > 0.0 && step.is_finite() && start.is_finite() && stop.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "grid needs finite bounds and a positive step, got {start}..{stop} by {step}"
        )));
    }
    // Absorb representation error so 0.05 / 0.005 counts as 10, not 11
    let points = ((stop - start) / step - 1e-9).ceil().max(0.0);
    if points > MAX_GRID_POINTS as f64 {
        return Err(Error::InvalidInput(format!(
            "grid {start}..{stop} by {step} has {points:e} points, at most {MAX_GRID_POINTS} allowed"
        )));
    }
    let count = points as usize;
    Ok((0..count).map(|i| step.mul_add(i as f64, start)).collect())
}

/// Planning request: one baseline, several candidate rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerQuery {
    /// Current conversion rate
    pub baseline: f64,
    /// Minimum detectable rates to plan for
    pub candidates: Vec<f64>,
    /// Target power
    pub power: f64,
    /// Significance level
    pub alpha: f64,
}

impl PowerQuery {
    /// Query with the default power (0.8) and alpha (0.05).
    #[must_use]
    pub fn new(baseline: f64, candidates: Vec<f64>) -> Self {
        Self {
            baseline,
            candidates,
            power: DEFAULT_POWER,
            alpha: DEFAULT_ALPHA,
        }
    }

    /// Query taking power and alpha from the analysis configuration.
    #[must_use]
    pub fn from_config(baseline: f64, candidates: Vec<f64>, config: &AnalysisConfig) -> Self {
        Self {
            baseline,
            candidates,
            power: config.power,
            alpha: config.alpha,
        }
    }

    /// Set the target power.
    #[must_use]
    pub const fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    /// Set the significance level.
    #[must_use]
    pub const fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }
}

/// Required sample size for one candidate rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerPoint {
    /// Candidate minimum detectable rate
    pub candidate_rate: f64,
    /// Cohen's h against the baseline
    pub effect_size: f64,
    /// Continuous solution
    pub sample_size: f64,
    /// Users needed per arm (rounded up)
    pub required_per_arm: u64,
}

/// Answer to a `PowerQuery`, one point per candidate in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerResult {
    /// Baseline rate of the query
    pub baseline: f64,
    /// Target power of the query
    pub power: f64,
    /// Significance level of the query
    pub alpha: f64,
    /// Points parallel to the query's candidates
    pub points: Vec<PowerPoint>,
}

impl PowerResult {
    /// `(candidate_rate, required_per_arm)` pairs for a sensitivity chart.
    #[must_use]
    pub fn curve(&self) -> Vec<(f64, u64)> {
        self.points
            .iter()
            .map(|p| (p.candidate_rate, p.required_per_arm))
            .collect()
    }
}

/// Sample size solver.
///
/// Stateless apart from its iteration budget: identical queries give
/// identical results.
#[derive(Debug, Clone, Copy)]
pub struct SampleSizeSolver {
    max_iterations: usize,
}

impl Default for SampleSizeSolver {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl SampleSizeSolver {
    /// Solver using the configured iteration budget.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the configuration does not validate.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_iterations: config.max_solver_iterations,
        })
    }

    /// Solver with an explicit iteration budget.
    #[must_use]
    pub const fn with_max_iterations(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    /// Required per-arm sample size to detect `p1 → p2`.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `Undefined` (p1 == p2) or `NonConvergence`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn point(&self, p1: f64, p2: f64, power: f64, alpha: f64) -> Result<PowerPoint> {
        let h = effect_size(p1, p2)?;
        if p1 == p2 {
            return Err(Error::Undefined(format!(
                "candidate rate {p2} equals the baseline, sample size is infinite"
            )));
        }
        let sample_size = required_sample_size(h, power, alpha, self.max_iterations)?;
        Ok(PowerPoint {
            candidate_rate: p2,
            effect_size: h,
            sample_size,
            required_per_arm: sample_size.ceil() as u64,
        })
    }

    /// Solve every candidate of `query`.
    ///
    /// Candidates are independent; the first failing one aborts the batch.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty candidate list or any bad rate, plus the
    /// errors of [`SampleSizeSolver::point`].
    #[instrument(skip_all, fields(baseline = query.baseline, candidates = query.candidates.len()))]
    pub fn solve(&self, query: &PowerQuery) -> Result<PowerResult> {
        if query.candidates.is_empty() {
            return Err(Error::InvalidInput(
                "power query needs at least one candidate rate".to_string(),
            ));
        }
        check_rate("baseline rate", query.baseline)?;

        #[cfg(feature = "parallel")]
        let points = query
            .candidates
            .par_iter()
            .map(|&p2| self.point(query.baseline, p2, query.power, query.alpha))
            .collect::<Result<Vec<_>>>()?;
        #[cfg(not(feature = "parallel"))]
        let points = query
            .candidates
            .iter()
            .map(|&p2| self.point(query.baseline, p2, query.power, query.alpha))
            .collect::<Result<Vec<_>>>()?;

        Ok(PowerResult {
            baseline: query.baseline,
            power: query.power,
            alpha: query.alpha,
            points,
        })
    }
}

/// Required per-arm sample size with the default iteration budget.
///
/// # Errors
///
/// Same as [`SampleSizeSolver::point`].
pub fn sample_size(p1: f64, p2: f64, power: f64, alpha: f64) -> Result<u64> {
    Ok(SampleSizeSolver::default()
        .point(p1, p2, power, alpha)?
        .required_per_arm)
}
