//! # Trueno-AB: A/B Test Auditing and Planning
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB checks whether an experiment's randomization held, repairs
//! univariate covariate imbalance with seeded oversampling, tests the
//! conversion metric with Welch's t-test, and plans sample sizes for the
//! next experiment.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: Broken randomization is detected before any verdict is issued
//! - **Poka-Yoke safety**: Invalid inputs and undefined statistics are explicit
//!   errors or result variants, never NaN
//! - **Genchi Genbutsu**: Every artifact (report, plan, dataset, verdict) is
//!   structured data a reviewer can inspect
//! - **Heijunka**: Same seed, same corrected dataset, byte for byte
//!
//! ## Modules
//!
//! - [`dataset`]: records, populations, Arrow ingestion, corrected datasets
//! - [`balance`]: marginal prevalence checks plus a split-tree classifier
//! - [`correction`]: seeded synthetic oversampling of the deficient arm
//! - [`comparator`]: Welch's unequal-variance t-test and decision rule
//! - [`power`]: arcsine effect size and per-arm sample size solver
//! - [`pipeline`]: Loaded → `BalanceChecked` → Corrected/Skipped → Verdicted
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_ab::config::AnalysisConfig;
//! use trueno_ab::dataset::{Arm, ExperimentDataset, ExperimentRecord};
//! use trueno_ab::pipeline::AnalysisPipeline;
//! use trueno_ab::power::sample_size;
//!
//! let records = (0..1000)
//!     .map(|i| {
//!         let arm = if i % 2 == 0 { Arm::Test } else { Arm::Control };
//!         ExperimentRecord::builder(i.to_string(), arm, i % 11 == 0)
//!             .covariate("country", ["Chile", "Mexico", "Peru"][i % 3])
//!             .build()
//!     })
//!     .collect();
//! let dataset = ExperimentDataset::new(records)?;
//!
//! let outcome = AnalysisPipeline::new(AnalysisConfig::default())?.run(&dataset)?;
//! println!("{:?} (p = {:.3})", outcome.verdict.decision, outcome.verdict.p_value);
//!
//! // Users per arm to detect 10% → 11% with 80% power
//! let n = sample_size(0.10, 0.11, 0.8, 0.05)?;
//! assert!(n > 14_000);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod balance;
pub mod comparator;
pub mod config;
pub mod correction;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod power;

pub use error::{Error, Result};
