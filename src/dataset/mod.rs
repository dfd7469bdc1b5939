//! Experiment datasets
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentDataset (ingested, unique ids)
//!        │
//!        └── CorrectedDataset (original rows + appended synthetic rows)
//! ```
//!
//! Both implement [`Population`], the read-only view every analysis stage
//! works against, so a diagnostic can be re-run on a corrected dataset.
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::dataset::{Arm, ExperimentDataset, ExperimentRecord, Population};
//!
//! let records = vec![
//!     ExperimentRecord::builder("1", Arm::Test, true).covariate("country", "Chile").build(),
//!     ExperimentRecord::builder("2", Arm::Control, false).covariate("country", "Chile").build(),
//! ];
//! let dataset = ExperimentDataset::new(records)?;
//! assert_eq!(dataset.arm_size(Arm::Test), 1);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

mod corrected;
mod ingest;
mod record;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use corrected::{CorrectedDataset, CorrectedRow};
pub use ingest::{ColumnKind, DatasetSchema};
pub use record::{Arm, CovariateValue, ExperimentRecord, ExperimentRecordBuilder};

/// Conversion summary for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmSummary {
    /// Arm described
    pub arm: Arm,
    /// Number of records in the arm
    pub size: usize,
    /// Number of converted records
    pub conversions: usize,
    /// Conversion rate (0 for an empty arm)
    pub rate: f64,
}

/// Read-only view over the records of an experiment.
///
/// Implementors only provide [`Population::records`] and
/// [`Population::covariate_names`]; the counting helpers are shared.
pub trait Population {
    /// Iterate over every record in order.
    fn records(&self) -> impl Iterator<Item = &ExperimentRecord>;

    /// Covariate names shared by every record, sorted.
    fn covariate_names(&self) -> &[String];

    /// Total number of records.
    fn len(&self) -> usize {
        self.records().count()
    }

    /// True if there are no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records assigned to `arm`.
    fn arm_size(&self, arm: Arm) -> usize {
        self.records().filter(|r| r.arm() == arm).count()
    }

    /// Number of records in `arm` whose `covariate` equals `value`.
    fn count(&self, covariate: &str, value: &CovariateValue, arm: Arm) -> usize {
        self.records()
            .filter(|r| r.arm() == arm && r.matches(covariate, value))
            .count()
    }

    /// Share of `arm` whose `covariate` equals `value` (0 for an empty arm).
    #[allow(clippy::cast_precision_loss)]
    fn prevalence(&self, covariate: &str, value: &CovariateValue, arm: Arm) -> f64 {
        let size = self.arm_size(arm);
        if size == 0 {
            return 0.0;
        }
        self.count(covariate, value, arm) as f64 / size as f64
    }

    /// Conversion outcomes (0/1) of `arm`, in record order.
    fn outcomes(&self, arm: Arm) -> Vec<f64> {
        self.records()
            .filter(|r| r.arm() == arm)
            .map(ExperimentRecord::outcome)
            .collect()
    }

    /// Arms that have at least one record.
    fn arms_present(&self) -> Vec<Arm> {
        Arm::ALL
            .into_iter()
            .filter(|arm| self.records().any(|r| r.arm() == *arm))
            .collect()
    }

    /// Conversion summary for `arm`.
    #[allow(clippy::cast_precision_loss)]
    fn summary(&self, arm: Arm) -> ArmSummary {
        let (size, conversions) = self
            .records()
            .filter(|r| r.arm() == arm)
            .fold((0usize, 0usize), |(n, c), r| (n + 1, c + usize::from(r.converted())));
        let rate = if size == 0 {
            0.0
        } else {
            conversions as f64 / size as f64
        };
        ArmSummary {
            arm,
            size,
            conversions,
            rate,
        }
    }
}

/// Validated, immutable experiment dataset.
///
/// Invariants (checked by [`ExperimentDataset::new`]):
/// - at least one record
/// - every record carries exactly the same covariate names
/// - a covariate is either categorical or numeric across all records
/// - numeric values are finite
/// - identifiers are unique
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentDataset {
    records: Vec<ExperimentRecord>,
    covariates: Vec<String>,
}

impl ExperimentDataset {
    /// Validate records and build a dataset.
    ///
    /// The covariate schema is taken from the first record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if any invariant above is violated.
    pub fn new(records: Vec<ExperimentRecord>) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| Error::InvalidInput("dataset has no records".to_string()))?;
        let covariates: Vec<String> = first.covariates().keys().cloned().collect();
        let kinds: Vec<bool> = first
            .covariates()
            .values()
            .map(CovariateValue::is_numeric)
            .collect();

        let mut seen = HashSet::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            if !seen.insert(record.id()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate identifier '{}' at row {row}",
                    record.id()
                )));
            }
            validate_schema(row, record, &covariates, &kinds)?;
        }

        Ok(Self {
            records,
            covariates,
        })
    }

    /// Get the records as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[ExperimentRecord] {
        &self.records
    }

    /// Consume the dataset and return its records.
    #[must_use]
    pub fn into_records(self) -> Vec<ExperimentRecord> {
        self.records
    }
}

fn validate_schema(
    row: usize,
    record: &ExperimentRecord,
    covariates: &[String],
    kinds: &[bool],
) -> Result<()> {
    if record.covariates().len() != covariates.len() {
        let missing: Vec<&str> = covariates
            .iter()
            .filter(|name| record.covariate(name).is_none())
            .map(String::as_str)
            .collect();
        let unknown: Vec<&str> = record
            .covariates()
            .keys()
            .filter(|name| !covariates.contains(name))
            .map(String::as_str)
            .collect();
        return Err(Error::InvalidInput(format!(
            "row {row} ('{}') does not match the covariate schema: missing {missing:?}, unrecognized {unknown:?}",
            record.id()
        )));
    }

    // Both sides are sorted by name, so a positional walk lines them up
    for (((name, value), expected), numeric) in record
        .covariates()
        .iter()
        .zip(covariates)
        .zip(kinds.iter().copied())
    {
        if name != expected {
            return Err(Error::InvalidInput(format!(
                "row {row} ('{}'): unrecognized covariate '{name}', expected '{expected}'",
                record.id()
            )));
        }
        if value.is_numeric() != numeric {
            return Err(Error::InvalidInput(format!(
                "row {row} ('{}'): covariate '{name}' mixes numeric and categorical values",
                record.id()
            )));
        }
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!(
                "row {row} ('{}'): covariate '{name}' is not finite",
                record.id()
            )));
        }
    }
    Ok(())
}

impl Population for ExperimentDataset {
    fn records(&self) -> impl Iterator<Item = &ExperimentRecord> {
        self.records.iter()
    }

    fn covariate_names(&self) -> &[String] {
        &self.covariates
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
