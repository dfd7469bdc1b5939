//! Ingestion from Arrow record batches
//!
//! Column access by name happens exactly once, here. Everything downstream
//! works on typed [`ExperimentRecord`]s, so a misspelled or missing column
//! fails fast as `InvalidInput` instead of surfacing later as missing values.
//!
//! Reading files or fetching over the network is left to the caller: hand
//! over an in-memory `RecordBatch` (e.g. from a Parquet or CSV reader).

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use tracing::{debug, instrument};

use super::{Arm, CovariateValue, ExperimentDataset, ExperimentRecord};
use crate::{Error, Result};

/// Declared kind of a covariate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// `Utf8` column
    Categorical,
    /// `Int32`, `Int64` or `Float64` column
    Numeric,
}

/// Expected layout of an experiment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSchema {
    id_column: String,
    assignment_column: String,
    outcome_column: String,
    covariates: Vec<(String, ColumnKind)>,
}

impl DatasetSchema {
    /// Schema with the three required columns and no covariates.
    ///
    /// # Arguments
    ///
    /// * `id_column` - User identifier (`Int32`, `Int64` or `Utf8`)
    /// * `assignment_column` - 1 = test, 0 = control (`Boolean` or integer)
    /// * `outcome_column` - 1 = converted (`Boolean` or integer)
    #[must_use]
    pub fn new(
        id_column: impl Into<String>,
        assignment_column: impl Into<String>,
        outcome_column: impl Into<String>,
    ) -> Self {
        Self {
            id_column: id_column.into(),
            assignment_column: assignment_column.into(),
            outcome_column: outcome_column.into(),
            covariates: Vec::new(),
        }
    }

    /// Declare a categorical covariate column.
    #[must_use]
    pub fn categorical(mut self, name: impl Into<String>) -> Self {
        self.covariates.push((name.into(), ColumnKind::Categorical));
        self
    }

    /// Declare a numeric covariate column.
    #[must_use]
    pub fn numeric(mut self, name: impl Into<String>) -> Self {
        self.covariates.push((name.into(), ColumnKind::Numeric));
        self
    }

    /// Declared covariates in declaration order.
    #[must_use]
    pub fn covariates(&self) -> &[(String, ColumnKind)] {
        &self.covariates
    }

    fn declares(&self, column: &str) -> bool {
        column == self.id_column
            || column == self.assignment_column
            || column == self.outcome_column
            || self.covariates.iter().any(|(name, _)| name == column)
    }
}

impl ExperimentDataset {
    /// Build a dataset from an Arrow batch laid out as `schema` declares.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a declared column is missing, an undeclared
    /// column is present, a column has an unsupported type, a value is null
    /// or out of range, or identifiers repeat.
    #[instrument(skip_all, fields(rows = batch.num_rows()))]
    pub fn from_record_batch(batch: &RecordBatch, schema: &DatasetSchema) -> Result<Self> {
        let batch_schema = batch.schema();
        if let Some(field) = batch_schema
            .fields()
            .iter()
            .find(|field| !schema.declares(field.name()))
        {
            return Err(Error::InvalidInput(format!(
                "unrecognized column '{}' (declare it in the DatasetSchema or drop it)",
                field.name()
            )));
        }

        let ids = identifiers(column(batch, &schema.id_column)?, &schema.id_column)?;
        let arms = flags(column(batch, &schema.assignment_column)?, &schema.assignment_column)?
            .into_iter()
            .map(Arm::from_flag)
            .collect::<Result<Vec<_>>>()?;
        let outcomes = flags(column(batch, &schema.outcome_column)?, &schema.outcome_column)?;

        let mut covariate_columns = Vec::with_capacity(schema.covariates.len());
        for (name, kind) in &schema.covariates {
            let values = covariate_values(column(batch, name)?, name, *kind)?;
            covariate_columns.push((name, values));
        }

        let mut records = Vec::with_capacity(batch.num_rows());
        for (row, ((id, arm), outcome)) in ids.into_iter().zip(arms).zip(outcomes).enumerate() {
            let converted = match outcome {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "column '{}' row {row}: outcome flag must be 0 or 1, got {other}",
                        schema.outcome_column
                    )))
                }
            };
            let record = covariate_columns
                .iter()
                .fold(ExperimentRecord::builder(id, arm, converted), |builder, (name, values)| {
                    builder.covariate(name.as_str(), values[row].clone())
                })
                .build();
            records.push(record);
        }

        debug!(covariates = schema.covariates.len(), "ingested record batch");
        Self::new(records)
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::InvalidInput(format!("missing column '{name}'")))
}

fn reject_nulls(array: &ArrayRef, name: &str) -> Result<()> {
    if array.null_count() == 0 {
        return Ok(());
    }
    let row = (0..array.len()).find(|&i| array.is_null(i)).unwrap_or(0);
    Err(Error::InvalidInput(format!(
        "column '{name}' has a null at row {row}"
    )))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        Error::Other(format!(
            "Failed to downcast column '{name}' of type {:?}",
            array.data_type()
        ))
    })
}

fn identifiers(array: &ArrayRef, name: &str) -> Result<Vec<String>> {
    reject_nulls(array, name)?;
    match array.data_type() {
        DataType::Int32 => Ok(downcast::<Int32Array>(array, name)?
            .values()
            .iter()
            .map(ToString::to_string)
            .collect()),
        DataType::Int64 => Ok(downcast::<Int64Array>(array, name)?
            .values()
            .iter()
            .map(ToString::to_string)
            .collect()),
        DataType::Utf8 => Ok(downcast::<StringArray>(array, name)?
            .iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect()),
        dt => Err(Error::InvalidInput(format!(
            "identifier column '{name}' has unsupported type {dt:?}"
        ))),
    }
}

fn flags(array: &ArrayRef, name: &str) -> Result<Vec<i64>> {
    reject_nulls(array, name)?;
    match array.data_type() {
        DataType::Boolean => Ok(downcast::<BooleanArray>(array, name)?
            .iter()
            .map(|v| i64::from(v.unwrap_or(false)))
            .collect()),
        DataType::Int32 => Ok(downcast::<Int32Array>(array, name)?
            .values()
            .iter()
            .map(|&v| i64::from(v))
            .collect()),
        DataType::Int64 => Ok(downcast::<Int64Array>(array, name)?.values().to_vec()),
        dt => Err(Error::InvalidInput(format!(
            "flag column '{name}' has unsupported type {dt:?}"
        ))),
    }
}

fn covariate_values(array: &ArrayRef, name: &str, kind: ColumnKind) -> Result<Vec<CovariateValue>> {
    reject_nulls(array, name)?;
    let values: Vec<CovariateValue> = match (kind, array.data_type()) {
        (ColumnKind::Categorical, DataType::Utf8) => downcast::<StringArray>(array, name)?
            .iter()
            .map(|v| CovariateValue::from(v.unwrap_or_default()))
            .collect(),
        (ColumnKind::Numeric, DataType::Int32) => downcast::<Int32Array>(array, name)?
            .values()
            .iter()
            .map(|&v| CovariateValue::Numeric(f64::from(v)))
            .collect(),
        (ColumnKind::Numeric, DataType::Int64) => downcast::<Int64Array>(array, name)?
            .values()
            .iter()
            .map(|&v| CovariateValue::from(v))
            .collect(),
        (ColumnKind::Numeric, DataType::Float64) => downcast::<Float64Array>(array, name)?
            .values()
            .iter()
            .map(|&v| CovariateValue::Numeric(v))
            .collect(),
        (kind, dt) => {
            return Err(Error::InvalidInput(format!(
                "covariate column '{name}' declared {kind:?} but has type {dt:?}"
            )))
        }
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Population;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Int64, false),
            Field::new("country", DataType::Utf8, false),
            Field::new("age", DataType::Int32, false),
            Field::new("test", DataType::Int32, false),
            Field::new("conversion", DataType::Int32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec!["Chile", "Argentina", "Chile"])),
                Arc::new(Int32Array::from(vec![38, 27, 18])),
                Arc::new(Int32Array::from(vec![0, 1, 1])),
                Arc::new(Int32Array::from(vec![0, 1, 0])),
            ],
        )
        .unwrap()
    }

    fn schema() -> DatasetSchema {
        DatasetSchema::new("user_id", "test", "conversion")
            .categorical("country")
            .numeric("age")
    }

    #[test]
    fn test_ingest_typed_records() {
        let dataset = ExperimentDataset::from_record_batch(&batch(), &schema()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.covariate_names(), ["age", "country"]);

        let second = &dataset.as_slice()[1];
        assert_eq!(second.id(), "2");
        assert_eq!(second.arm(), Arm::Test);
        assert!(second.converted());
        assert_eq!(second.covariate("age"), Some(&CovariateValue::Numeric(27.0)));
    }

    #[test]
    fn test_missing_declared_column_fails() {
        let schema = schema().categorical("device");
        let err = ExperimentDataset::from_record_batch(&batch(), &schema).unwrap_err();
        assert!(err.to_string().contains("missing column 'device'"));
    }

    #[test]
    fn test_undeclared_column_fails() {
        let schema = DatasetSchema::new("user_id", "test", "conversion").numeric("age");
        let err = ExperimentDataset::from_record_batch(&batch(), &schema).unwrap_err();
        assert!(err.to_string().contains("unrecognized column 'country'"));
    }

    #[test]
    fn test_kind_mismatch_fails() {
        let schema = DatasetSchema::new("user_id", "test", "conversion")
            .numeric("country")
            .numeric("age");
        let err = ExperimentDataset::from_record_batch(&batch(), &schema).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
