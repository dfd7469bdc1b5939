//! One-hot feature space over covariate levels
//!
//! Every (covariate, value) pair becomes one indicator feature. No level is
//! dropped: the informative level may be exactly the one a reference-level
//! encoding would discard.
//!
//! Each record activates exactly one feature per covariate, so rows are
//! stored densely as `n_covariates` feature ids per row.

use std::collections::BTreeSet;
use std::ops::Range;

use rustc_hash::FxHashMap;

use crate::dataset::{Arm, CovariateValue, Population};

/// Dense one-hot encoding of a population.
#[derive(Debug)]
pub(crate) struct FeatureSpace {
    /// Feature id → (covariate, value), ordered by covariate then value
    features: Vec<(String, CovariateValue)>,
    /// Feature id range of each covariate
    ranges: Vec<Range<usize>>,
    /// Row-major active feature ids, `ranges.len()` per row
    active: Vec<u32>,
    /// Assignment label per row
    labels: Vec<Arm>,
    /// Per feature (test, control) counts over all rows
    counts: Vec<[usize; 2]>,
}

pub(crate) const fn arm_slot(arm: Arm) -> usize {
    match arm {
        Arm::Test => 0,
        Arm::Control => 1,
    }
}

impl FeatureSpace {
    pub(crate) fn encode(population: &impl Population) -> Self {
        let names = population.covariate_names();

        let mut levels: Vec<BTreeSet<&CovariateValue>> = vec![BTreeSet::new(); names.len()];
        for record in population.records() {
            for (slot, name) in levels.iter_mut().zip(names) {
                if let Some(value) = record.covariate(name) {
                    slot.insert(value);
                }
            }
        }

        let mut features = Vec::new();
        let mut ranges = Vec::with_capacity(names.len());
        let mut lookup: Vec<FxHashMap<&CovariateValue, u32>> = Vec::with_capacity(names.len());
        for (name, values) in names.iter().zip(&levels) {
            let start = features.len();
            let mut ids = FxHashMap::default();
            for value in values {
                #[allow(clippy::cast_possible_truncation)]
                ids.insert(*value, features.len() as u32);
                features.push((name.clone(), (*value).clone()));
            }
            ranges.push(start..features.len());
            lookup.push(ids);
        }

        let mut active = Vec::with_capacity(population.len() * names.len());
        let mut labels = Vec::with_capacity(population.len());
        let mut counts = vec![[0usize; 2]; features.len()];
        for record in population.records() {
            let slot = arm_slot(record.arm());
            for (name, ids) in names.iter().zip(&lookup) {
                // Schema is validated at dataset construction, every record has every covariate
                if let Some(&id) = record.covariate(name).and_then(|value| ids.get(value)) {
                    active.push(id);
                    counts[id as usize][slot] += 1;
                }
            }
            labels.push(record.arm());
        }

        Self {
            features,
            ranges,
            active,
            labels,
            counts,
        }
    }

    pub(crate) fn n_features(&self) -> usize {
        self.features.len()
    }

    pub(crate) fn n_rows(&self) -> usize {
        self.labels.len()
    }

    pub(crate) fn n_covariates(&self) -> usize {
        self.ranges.len()
    }

    pub(crate) fn feature(&self, id: usize) -> &(String, CovariateValue) {
        &self.features[id]
    }

    pub(crate) fn covariate_ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub(crate) fn row(&self, row: usize) -> &[u32] {
        let width = self.n_covariates();
        &self.active[row * width..(row + 1) * width]
    }

    pub(crate) fn label(&self, row: usize) -> Arm {
        self.labels[row]
    }

    /// (test, control) counts of rows carrying feature `id`.
    pub(crate) fn counts(&self, id: usize) -> [usize; 2] {
        self.counts[id]
    }

    /// (test, control) row totals.
    pub(crate) fn arm_totals(&self) -> [usize; 2] {
        self.labels.iter().fold([0, 0], |mut acc, arm| {
            acc[arm_slot(*arm)] += 1;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ExperimentDataset, ExperimentRecord};

    #[test]
    fn test_one_hot_keeps_every_level() {
        let dataset = ExperimentDataset::new(vec![
            ExperimentRecord::builder("1", Arm::Test, false)
                .covariate("country", "Uruguay")
                .covariate("device", "Web")
                .build(),
            ExperimentRecord::builder("2", Arm::Control, false)
                .covariate("country", "Argentina")
                .covariate("device", "Web")
                .build(),
            ExperimentRecord::builder("3", Arm::Test, true)
                .covariate("country", "Argentina")
                .covariate("device", "Mobile")
                .build(),
        ])
        .unwrap();

        let space = FeatureSpace::encode(&dataset);
        assert_eq!(space.n_features(), 4);
        assert_eq!(space.n_rows(), 3);
        assert_eq!(space.covariate_ranges(), &[0..2, 2..4]);
        assert_eq!(space.feature(0).1, CovariateValue::from("Argentina"));
        assert_eq!(space.feature(3).1, CovariateValue::from("Web"));

        // Row 0: Uruguay (1), Web (3)
        assert_eq!(space.row(0), &[1, 3]);
        assert_eq!(space.counts(0), [1, 1]);
        assert_eq!(space.arm_totals(), [2, 1]);
        assert_eq!(space.label(1), Arm::Control);
    }
}
