//! Experiment Record - one user observed in an A/B test

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Experiment arm a user was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    /// Treatment group (saw the change).
    Test,
    /// Control group (saw the baseline).
    Control,
}

impl Arm {
    /// Both arms, test first.
    pub const ALL: [Self; 2] = [Self::Test, Self::Control];

    /// The other arm.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Test => Self::Control,
            Self::Control => Self::Test,
        }
    }

    /// Decode the conventional 0/1 assignment flag (1 = test).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for any value other than 0 or 1.
    pub fn from_flag(flag: i64) -> crate::Result<Self> {
        match flag {
            1 => Ok(Self::Test),
            0 => Ok(Self::Control),
            other => Err(crate::Error::InvalidInput(format!(
                "assignment flag must be 0 or 1, got {other}"
            ))),
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => f.write_str("test"),
            Self::Control => f.write_str("control"),
        }
    }
}

/// Value of a single covariate.
///
/// Numeric values compare and hash by bit pattern so they can key the
/// one-hot feature space; non-finite numbers are rejected at dataset
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    /// Categorical level (country, device, ...).
    Categorical(String),
    /// Numeric level (age, ...).
    Numeric(f64),
}

impl CovariateValue {
    /// True for numeric values.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Numeric(_))
    }

    /// True if the value can be used as a feature level.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Categorical(_) => true,
            Self::Numeric(v) => v.is_finite(),
        }
    }
}

impl PartialEq for CovariateValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CovariateValue {}

impl Hash for CovariateValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Categorical(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Numeric(v) => {
                1u8.hash(state);
                // +0.0 and -0.0 are the same level
                let normalized = if *v == 0.0 { 0.0_f64 } else { *v };
                normalized.to_bits().hash(state);
            }
        }
    }
}

impl Ord for CovariateValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Categorical(a), Self::Categorical(b)) => a.cmp(b),
            (Self::Numeric(a), Self::Numeric(b)) => {
                if a == b {
                    Ordering::Equal
                } else {
                    a.total_cmp(b)
                }
            }
            (Self::Categorical(_), Self::Numeric(_)) => Ordering::Less,
            (Self::Numeric(_), Self::Categorical(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for CovariateValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CovariateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical(s) => f.write_str(s),
            Self::Numeric(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for CovariateValue {
    fn from(value: &str) -> Self {
        Self::Categorical(value.to_string())
    }
}

impl From<String> for CovariateValue {
    fn from(value: String) -> Self {
        Self::Categorical(value)
    }
}

impl From<f64> for CovariateValue {
    fn from(value: f64) -> Self {
        Self::Numeric(value)
    }
}

impl From<i64> for CovariateValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        Self::Numeric(value as f64)
    }
}

/// Experiment Record represents one user in the experiment.
///
/// Records are immutable once built. The bias corrector creates relabeled
/// copies with [`ExperimentRecord::reassigned`] instead of editing in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRecord {
    id: String,
    covariates: BTreeMap<String, CovariateValue>,
    arm: Arm,
    converted: bool,
}

impl ExperimentRecord {
    /// Create a record with no covariates.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier of the user
    /// * `arm` - Assigned arm
    /// * `converted` - Whether the user converted
    #[must_use]
    pub fn new(id: impl Into<String>, arm: Arm, converted: bool) -> Self {
        Self {
            id: id.into(),
            covariates: BTreeMap::new(),
            arm,
            converted,
        }
    }

    /// Create a builder for a record with covariates.
    #[must_use]
    pub fn builder(id: impl Into<String>, arm: Arm, converted: bool) -> ExperimentRecordBuilder {
        ExperimentRecordBuilder::new(id, arm, converted)
    }

    /// Get the user identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the assigned arm.
    #[must_use]
    pub const fn arm(&self) -> Arm {
        self.arm
    }

    /// Whether the user converted.
    #[must_use]
    pub const fn converted(&self) -> bool {
        self.converted
    }

    /// Conversion as a 0/1 outcome value.
    #[must_use]
    pub fn outcome(&self) -> f64 {
        if self.converted {
            1.0
        } else {
            0.0
        }
    }

    /// Get a covariate value by name.
    #[must_use]
    pub fn covariate(&self, name: &str) -> Option<&CovariateValue> {
        self.covariates.get(name)
    }

    /// All covariates, ordered by name.
    #[must_use]
    pub const fn covariates(&self) -> &BTreeMap<String, CovariateValue> {
        &self.covariates
    }

    /// True if the named covariate equals `value`.
    #[must_use]
    pub fn matches(&self, covariate: &str, value: &CovariateValue) -> bool {
        self.covariates.get(covariate) == Some(value)
    }

    /// Copy of this record assigned to another arm.
    #[must_use]
    pub fn reassigned(&self, arm: Arm) -> Self {
        Self {
            arm,
            ..self.clone()
        }
    }
}

/// Builder for `ExperimentRecord`.
#[derive(Debug)]
pub struct ExperimentRecordBuilder {
    id: String,
    covariates: BTreeMap<String, CovariateValue>,
    arm: Arm,
    converted: bool,
}

impl ExperimentRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, arm: Arm, converted: bool) -> Self {
        Self {
            id: id.into(),
            covariates: BTreeMap::new(),
            arm,
            converted,
        }
    }

    /// Set a covariate. A repeated name overwrites the earlier value.
    #[must_use]
    pub fn covariate(mut self, name: impl Into<String>, value: impl Into<CovariateValue>) -> Self {
        self.covariates.insert(name.into(), value.into());
        self
    }

    /// Build the `ExperimentRecord`.
    #[must_use]
    pub fn build(self) -> ExperimentRecord {
        ExperimentRecord {
            id: self.id,
            covariates: self.covariates,
            arm: self.arm,
            converted: self.converted,
        }
    }
}
