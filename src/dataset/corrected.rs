//! Corrected dataset - append-only extension of an ingested dataset

use serde::{Deserialize, Serialize};

use super::{ExperimentDataset, ExperimentRecord, Population};

/// One row of a corrected dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectedRow {
    /// The record (a relabeled copy for synthetic rows)
    #[serde(flatten)]
    pub record: ExperimentRecord,
    /// True for rows appended by the bias corrector
    pub is_synthetic: bool,
}

/// Dataset produced by the bias corrector.
///
/// The first [`CorrectedDataset::original_len`] rows are the ingested
/// records in their original order, untouched. Synthetic rows follow.
/// Synthetic rows reuse the donor's identifier, so identifiers are no
/// longer unique here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectedDataset {
    rows: Vec<CorrectedRow>,
    covariates: Vec<String>,
    original_len: usize,
}

impl CorrectedDataset {
    /// Start a corrected dataset holding only the original records.
    #[must_use]
    pub fn from_original(dataset: &ExperimentDataset) -> Self {
        let rows = dataset
            .as_slice()
            .iter()
            .map(|record| CorrectedRow {
                record: record.clone(),
                is_synthetic: false,
            })
            .collect::<Vec<_>>();
        Self {
            original_len: rows.len(),
            rows,
            covariates: dataset.covariate_names().to_vec(),
        }
    }

    /// Append a synthetic record. Crate-internal: only the corrector grows
    /// the dataset.
    pub(crate) fn push_synthetic(&mut self, record: ExperimentRecord) {
        self.rows.push(CorrectedRow {
            record,
            is_synthetic: true,
        });
    }

    /// All rows, originals first.
    #[must_use]
    pub fn rows(&self) -> &[CorrectedRow] {
        &self.rows
    }

    /// The untouched original rows.
    #[must_use]
    pub fn original_rows(&self) -> &[CorrectedRow] {
        &self.rows[..self.original_len]
    }

    /// Number of original records.
    #[must_use]
    pub const fn original_len(&self) -> usize {
        self.original_len
    }

    /// Number of synthetic records appended.
    #[must_use]
    pub fn synthetic_count(&self) -> usize {
        self.rows.len() - self.original_len
    }
}

impl Population for CorrectedDataset {
    fn records(&self) -> impl Iterator<Item = &ExperimentRecord> {
        self.rows.iter().map(|row| &row.record)
    }

    fn covariate_names(&self) -> &[String] {
        &self.covariates
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}
