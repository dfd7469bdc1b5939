//! Pipeline integration tests: configuration, state history, stage errors

use trueno_ab::balance::BalanceOutcome;
use trueno_ab::comparator::Decision;
use trueno_ab::config::AnalysisConfig;
use trueno_ab::dataset::{Arm, CovariateValue, ExperimentDataset, ExperimentRecord, Population};
use trueno_ab::pipeline::{AnalysisPipeline, PipelineState, SkipReason, Stage};
use trueno_ab::Error;

/// Control is the larger arm (3000 vs 2000); "Safari" is 3% of test, 30% of control.
fn browser_leak() -> ExperimentDataset {
    let mut records = Vec::new();
    for i in 0..2_000 {
        let browser = if i < 60 { "Safari" } else { "Chrome" };
        records.push(
            ExperimentRecord::builder(format!("t{i}"), Arm::Test, i % 8 == 0)
                .covariate("browser", browser)
                .build(),
        );
    }
    for i in 0..3_000 {
        let browser = if i < 900 { "Safari" } else { "Chrome" };
        records.push(
            ExperimentRecord::builder(format!("c{i}"), Arm::Control, i % 8 == 0)
                .covariate("browser", browser)
                .build(),
        );
    }
    ExperimentDataset::new(records).unwrap()
}

#[test]
fn test_larger_reference_arm_donates_to_smaller() {
    let outcome = AnalysisPipeline::new(AnalysisConfig::default())
        .unwrap()
        .run(&browser_leak())
        .unwrap();
    let correction = outcome.correction.as_ref().unwrap();

    // Control is larger, so it is the reference; test receives synthetic rows
    assert_eq!(correction.plan.reference_arm, Arm::Control);
    assert_eq!(correction.plan.deficient_arm, Arm::Test);
    assert_eq!(correction.dataset.arm_size(Arm::Control), 3_000);

    let safari = CovariateValue::from("Safari");
    let gap = (correction.dataset.prevalence("browser", &safari, Arm::Test)
        - correction.dataset.prevalence("browser", &safari, Arm::Control))
    .abs();
    assert!(gap < 1e-3, "gap {gap}");
    assert_eq!(correction.plan.steps[0].required_delta, 771);
}

#[test]
fn test_json_config_disables_correction() {
    let config = AnalysisConfig::from_json(r#"{ "correction": "never", "alpha": 0.01 }"#).unwrap();
    let outcome = AnalysisPipeline::new(config).unwrap().run(&browser_leak()).unwrap();

    assert_eq!(outcome.skip_reason, Some(SkipReason::Disabled));
    assert_eq!(
        outcome.history,
        vec![
            PipelineState::Loaded,
            PipelineState::BalanceChecked,
            PipelineState::Skipped,
            PipelineState::Verdicted
        ]
    );
    assert!((outcome.config.alpha - 0.01).abs() < f64::EPSILON);
    assert!(matches!(outcome.balance, BalanceOutcome::Report(ref r) if !r.is_balanced()));
}

#[test]
fn test_zero_variance_verdict_is_undefined_not_error() {
    // Nobody converts in either arm
    let records = (0..100)
        .map(|i| {
            let arm = if i % 2 == 0 { Arm::Test } else { Arm::Control };
            ExperimentRecord::new(i.to_string(), arm, false)
        })
        .collect();
    let dataset = ExperimentDataset::new(records).unwrap();
    let outcome = AnalysisPipeline::new(AnalysisConfig::default())
        .unwrap()
        .run(&dataset)
        .unwrap();
    assert_eq!(outcome.verdict.decision, Decision::Undefined);
    assert!((outcome.verdict.p_value - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_single_arm_reports_failing_stage() {
    let records = (0..10)
        .map(|i| ExperimentRecord::new(i.to_string(), Arm::Control, i % 3 == 0))
        .collect();
    let dataset = ExperimentDataset::new(records).unwrap();
    let err = AnalysisPipeline::new(AnalysisConfig::default())
        .unwrap()
        .run(&dataset)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Comparison));
    assert!(err.to_string().contains("single-arm data"));
    assert!(matches!(err, Error::Stage { .. }));
}

#[test]
fn test_invalid_config_rejected_up_front() {
    let mut config = AnalysisConfig::default();
    config.power = 1.5;
    assert!(matches!(
        AnalysisPipeline::new(config),
        Err(Error::InvalidInput(_))
    ));
}
