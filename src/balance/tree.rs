//! Split-based assignment classifier
//!
//! A shallow binary decision tree predicting the assignment arm from one-hot
//! covariate features. It exists only to explain imbalance: the tree is
//! grown, its splits are summarized, and it is dropped. Predictive accuracy
//! is irrelevant.
//!
//! - **Class-balanced weights**: each row weighs `n / (2 · n_arm)`, so both
//!   arms carry equal total weight and a 46/54 split reads as 50/50.
//! - **Minimum impurity decrease**: a split is kept only if its weighted Gini
//!   decrease, relative to the whole population, reaches the configured
//!   minimum. Noise splits fall below it and the tree stays small.
//! - **Split significance**: every retained split carries the chi-square
//!   p-value of its node's 2×2 table (level present/absent × arm). On small
//!   populations a single row can clear the minimum decrease, so callers
//!   must not read a split's shares without its p-value.
//!
//! References:
//! - Breiman et al. (1984): Classification and Regression Trees

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::trace;

use super::features::{arm_slot, FeatureSpace};
use super::marginal::chi_square_2x2;
use crate::dataset::CovariateValue;

/// Summary of one retained split, in pre-order.
///
/// Shares are class-balanced, so 0.5 means "as expected under proper
/// randomization" regardless of the raw arm sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    /// Depth of the split node (root = 0)
    pub depth: usize,
    /// Covariate tested at the node
    pub covariate: String,
    /// Level tested at the node
    pub value: CovariateValue,
    /// Rows reaching the node
    pub node_rows: usize,
    /// Rows at the node carrying the level
    pub matching_rows: usize,
    /// Share of total (balanced) weight reaching the node
    pub node_weight_share: f64,
    /// Balanced test share among matching rows
    pub matching_test_share: f64,
    /// Balanced test share among the remaining rows
    pub rest_test_share: f64,
    /// Weighted Gini impurity decrease of the split
    pub impurity_decrease: f64,
    /// Pearson chi-square of the node's level × arm table (0 when undefined)
    pub chi_square: f64,
    /// Chi-square p-value (1 when undefined)
    pub p_value: f64,
}

impl SplitSummary {
    /// Relative deviation of the matching side from an even split.
    #[must_use]
    pub fn matching_deviation(&self) -> f64 {
        (self.matching_test_share - 0.5).abs() / 0.5
    }
}

/// Growth limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeParams {
    pub(crate) min_impurity_decrease: f64,
    pub(crate) max_depth: usize,
}

/// Weighted Gini impurity of a node with class weights `wt`, `wc`.
fn gini(wt: f64, wc: f64) -> f64 {
    let w = wt + wc;
    if w <= 0.0 {
        return 0.0;
    }
    let p = wt / w;
    let q = wc / w;
    1.0 - p.mul_add(p, q * q)
}

fn share(wt: f64, wc: f64) -> f64 {
    if wt + wc > 0.0 {
        wt / (wt + wc)
    } else {
        0.5
    }
}

/// Retained splits plus the number of nodes a split was searched at.
#[derive(Debug)]
pub(crate) struct GrownTree {
    pub(crate) splits: Vec<SplitSummary>,
    pub(crate) searched_nodes: usize,
}

struct Grower<'a> {
    space: &'a FeatureSpace,
    params: TreeParams,
    chi2: &'a ChiSquared,
    searched_nodes: usize,
    /// Per-arm row weight (test, control)
    weights: [f64; 2],
    total_weight: f64,
    splits: Vec<SplitSummary>,
}

struct BestSplit {
    feature: usize,
    decrease: f64,
    matching: [usize; 2],
}

impl Grower<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn weight(&self, counts: [usize; 2]) -> (f64, f64) {
        (
            counts[0] as f64 * self.weights[0],
            counts[1] as f64 * self.weights[1],
        )
    }

    fn best_split(&self, rows: &[u32], node_counts: [usize; 2]) -> Option<BestSplit> {
        let mut per_feature = vec![[0usize; 2]; self.space.n_features()];
        for &row in rows {
            let slot = arm_slot(self.space.label(row as usize));
            for &id in self.space.row(row as usize) {
                per_feature[id as usize][slot] += 1;
            }
        }

        let (wt, wc) = self.weight(node_counts);
        let node_weight = wt + wc;
        let node_gini = gini(wt, wc);
        let node_rows = node_counts[0] + node_counts[1];

        let mut best: Option<BestSplit> = None;
        for (feature, matching) in per_feature.into_iter().enumerate() {
            let matching_rows = matching[0] + matching[1];
            if matching_rows == 0 || matching_rows == node_rows {
                continue;
            }
            let (lt, lc) = self.weight(matching);
            let (rt, rc) = (wt - lt, wc - lc);
            let children = (lt + lc) / node_weight * gini(lt, lc) + (rt + rc) / node_weight * gini(rt, rc);
            let decrease = node_weight / self.total_weight * (node_gini - children);
            // Strict comparison keeps the lowest feature id on ties
            if best.as_ref().map_or(true, |b| decrease > b.decrease) {
                best = Some(BestSplit {
                    feature,
                    decrease,
                    matching,
                });
            }
        }
        best
    }

    fn grow(&mut self, rows: Vec<u32>, depth: usize) {
        if depth >= self.params.max_depth {
            return;
        }
        let node_counts = rows.iter().fold([0usize; 2], |mut acc, &row| {
            acc[arm_slot(self.space.label(row as usize))] += 1;
            acc
        });
        if node_counts[0] == 0 || node_counts[1] == 0 {
            return;
        }
        self.searched_nodes += 1;
        let Some(best) = self.best_split(&rows, node_counts) else {
            return;
        };
        if best.decrease <= 0.0 || best.decrease < self.params.min_impurity_decrease {
            trace!(depth, decrease = best.decrease, "split pruned");
            return;
        }

        let (wt, wc) = self.weight(node_counts);
        let (lt, lc) = self.weight(best.matching);
        let (covariate, value) = self.space.feature(best.feature).clone();
        #[allow(clippy::cast_precision_loss)]
        let chi_square = chi_square_2x2(
            best.matching[0] as f64,
            best.matching[1] as f64,
            (node_counts[0] - best.matching[0]) as f64,
            (node_counts[1] - best.matching[1]) as f64,
        );
        self.splits.push(SplitSummary {
            depth,
            covariate,
            value,
            node_rows: rows.len(),
            matching_rows: best.matching[0] + best.matching[1],
            node_weight_share: (wt + wc) / self.total_weight,
            matching_test_share: share(lt, lc),
            rest_test_share: share(wt - lt, wc - lc),
            impurity_decrease: best.decrease,
            chi_square: chi_square.unwrap_or(0.0),
            p_value: chi_square.map_or(1.0, |stat| self.chi2.sf(stat).clamp(0.0, 1.0)),
        });

        #[allow(clippy::cast_possible_truncation)]
        let feature = best.feature as u32;
        let (matching, rest): (Vec<u32>, Vec<u32>) = rows
            .into_iter()
            .partition(|&row| self.space.row(row as usize).contains(&feature));
        self.grow(matching, depth + 1);
        self.grow(rest, depth + 1);
    }
}

/// Grow the tree; splits are returned in pre-order.
///
/// Both arms must be non-empty. `chi2` is the 1-df chi-square distribution.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn grow(space: &FeatureSpace, params: TreeParams, chi2: &ChiSquared) -> GrownTree {
    let [n_test, n_control] = space.arm_totals();
    let n = space.n_rows() as f64;
    let mut grower = Grower {
        space,
        params,
        chi2,
        searched_nodes: 0,
        weights: [n / (2.0 * n_test as f64), n / (2.0 * n_control as f64)],
        total_weight: n,
        splits: Vec::new(),
    };
    grower.grow((0..space.n_rows() as u32).collect(), 0);
    GrownTree {
        splits: grower.splits,
        searched_nodes: grower.searched_nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Arm, ExperimentDataset, ExperimentRecord};

    const PARAMS: TreeParams = TreeParams {
        min_impurity_decrease: 0.001,
        max_depth: 8,
    };

    fn chi2() -> ChiSquared {
        ChiSquared::new(1.0).unwrap()
    }

    fn record(i: usize, arm: Arm, country: &str, device: &str) -> ExperimentRecord {
        ExperimentRecord::builder(i.to_string(), arm, false)
            .covariate("country", country)
            .covariate("device", device)
            .build()
    }

    #[test]
    fn test_gini() {
        assert!((gini(1.0, 1.0) - 0.5).abs() < 1e-12);
        assert!(gini(3.0, 0.0).abs() < 1e-12);
        assert!(gini(0.0, 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_balanced_population_grows_no_splits() {
        let records = (0..2000)
            .map(|i| {
                let arm = if i % 2 == 0 { Arm::Test } else { Arm::Control };
                let country = ["Chile", "Mexico", "Peru", "Spain"][(i / 2) % 4];
                let device = if (i / 8) % 2 == 0 { "Web" } else { "Mobile" };
                record(i, arm, country, device)
            })
            .collect();
        let dataset = ExperimentDataset::new(records).unwrap();
        let tree = grow(&FeatureSpace::encode(&dataset), PARAMS, &chi2());
        assert!(tree.splits.is_empty(), "unexpected splits: {:?}", tree.splits);
        assert_eq!(tree.searched_nodes, 1);
    }

    #[test]
    fn test_leaky_level_becomes_root_split() {
        // 60% test overall; "Uruguay" rows are all test
        let mut records = Vec::new();
        for i in 0..1000 {
            let arm = if i % 5 < 3 { Arm::Test } else { Arm::Control };
            records.push(record(i, arm, "Chile", "Web"));
        }
        for i in 1000..1200 {
            records.push(record(i, Arm::Test, "Uruguay", "Web"));
        }
        let dataset = ExperimentDataset::new(records).unwrap();
        let tree = grow(&FeatureSpace::encode(&dataset), PARAMS, &chi2());

        let root = &tree.splits[0];
        assert!(root.p_value < 1e-10);
        assert!(root.chi_square > 0.0);
        assert_eq!(root.depth, 0);
        assert_eq!(root.covariate, "country");
        assert!(root.impurity_decrease >= 0.001);
        let uruguay_matching = if root.value == CovariateValue::from("Uruguay") {
            root.matching_test_share
        } else {
            root.rest_test_share
        };
        assert!((uruguay_matching - 1.0).abs() < 1e-12);
        assert!((root.node_weight_share - 1.0).abs() < 1e-12);
    }
}
