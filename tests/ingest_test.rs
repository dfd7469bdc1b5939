//! Arrow ingestion through to a verdict

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use std::sync::Arc;
use trueno_ab::comparator::Decision;
use trueno_ab::config::AnalysisConfig;
use trueno_ab::dataset::{Arm, CovariateValue, DatasetSchema, ExperimentDataset, Population};
use trueno_ab::pipeline::AnalysisPipeline;
use trueno_ab::Error;

const ROWS: usize = 4_000;

fn experiment_batch() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        Field::new("test", DataType::Boolean, false),
        Field::new("conversion", DataType::Int32, false),
        Field::new("browser", DataType::Utf8, false),
        Field::new("ads_channel", DataType::Utf8, false),
        Field::new("income", DataType::Float64, false),
    ]));

    let ids: Vec<String> = (0..ROWS).map(|i| format!("u{i:05}")).collect();
    let arms: Vec<bool> = (0..ROWS).map(|i| i % 2 == 0).collect();
    let conversions: Vec<i32> = (0..ROWS).map(|i| i32::from(i % 13 == 0)).collect();
    let browsers: Vec<&str> = (0..ROWS).map(|i| ["Chrome", "Safari"][(i / 2) % 2]).collect();
    let channels: Vec<&str> = (0..ROWS).map(|i| ["Google", "Facebook", "Bing"][(i / 2) % 3]).collect();
    #[allow(clippy::cast_precision_loss)]
    let incomes: Vec<f64> = (0..ROWS).map(|i| 1_000.0 * ((i / 2) % 4) as f64).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(BooleanArray::from(arms)),
        Arc::new(Int32Array::from(conversions)),
        Arc::new(StringArray::from(browsers)),
        Arc::new(StringArray::from(channels)),
        Arc::new(Float64Array::from(incomes)),
    ];
    RecordBatch::try_new(schema, columns).unwrap()
}

fn experiment_schema() -> DatasetSchema {
    DatasetSchema::new("user_id", "test", "conversion")
        .categorical("browser")
        .categorical("ads_channel")
        .numeric("income")
}

#[test]
fn test_batch_to_verdict() {
    let dataset = ExperimentDataset::from_record_batch(&experiment_batch(), &experiment_schema()).unwrap();
    assert_eq!(dataset.len(), ROWS);
    assert_eq!(dataset.arm_size(Arm::Test), ROWS / 2);
    assert_eq!(dataset.covariate_names(), ["ads_channel", "browser", "income"]);
    assert_eq!(
        dataset.as_slice()[3].covariate("income"),
        Some(&CovariateValue::Numeric(1_000.0))
    );

    let outcome = AnalysisPipeline::new(AnalysisConfig::default())
        .unwrap()
        .run(&dataset)
        .unwrap();
    let report = outcome.balance.report().unwrap();
    assert!(report.is_balanced());
    assert!(!outcome.was_corrected());
    assert_ne!(outcome.verdict.decision, Decision::Undefined);
}

#[test]
fn test_null_covariate_rejected_with_row() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Int32, false),
        Field::new("test", DataType::Int32, false),
        Field::new("conversion", DataType::Int32, false),
        Field::new("country", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(vec![1, 2, 3])),
            Arc::new(Int32Array::from(vec![0, 1, 0])),
            Arc::new(Int32Array::from(vec![0, 0, 1])),
            Arc::new(StringArray::from(vec![Some("Chile"), None, Some("Peru")])),
        ],
    )
    .unwrap();
    let schema = DatasetSchema::new("user_id", "test", "conversion").categorical("country");

    let err = ExperimentDataset::from_record_batch(&batch, &schema).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(err.to_string().contains("null at row 1"));
}

#[test]
fn test_out_of_range_flag_rejected() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Int32, false),
        Field::new("test", DataType::Int32, false),
        Field::new("conversion", DataType::Int32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(Int32Array::from(vec![0, 2])),
            Arc::new(Int32Array::from(vec![0, 1])),
        ],
    )
    .unwrap();
    let schema = DatasetSchema::new("user_id", "test", "conversion");
    assert!(matches!(
        ExperimentDataset::from_record_batch(&batch, &schema),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn test_duplicate_identifiers_rejected() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Int32, false),
        Field::new("test", DataType::Int32, false),
        Field::new("conversion", DataType::Int32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(vec![7, 7])),
            Arc::new(Int32Array::from(vec![0, 1])),
            Arc::new(Int32Array::from(vec![0, 1])),
        ],
    )
    .unwrap();
    let schema = DatasetSchema::new("user_id", "test", "conversion");
    assert!(ExperimentDataset::from_record_batch(&batch, &schema).is_err());
}
