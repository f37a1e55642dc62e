//! Conditions: threshold predicates over one counter.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrors};
use crate::types::{ConditionId, CounterId};

/// Comparison applied between a measured average and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationalOperator {
    /// `==`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl RelationalOperator {
    /// Returns true if `value <op> threshold` holds.
    #[must_use]
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
        }
    }

    /// Returns the operator symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

impl std::fmt::Display for RelationalOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for RelationalOperator {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EQ" | "==" => Ok(Self::Eq),
            "GT" | ">" => Ok(Self::Gt),
            "GE" | ">=" => Ok(Self::Ge),
            "LT" | "<" => Ok(Self::Lt),
            "LE" | "<=" => Ok(Self::Le),
            _ => Err(ValidationError::InvalidValue {
                field: "relationaloperator",
                value: s.to_string(),
            }),
        }
    }
}

/// A threshold predicate over exactly one counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Unique identifier.
    pub id: ConditionId,
    /// The measured counter.
    pub counter_id: CounterId,
    /// Comparison operator.
    pub operator: RelationalOperator,
    /// Non-negative threshold.
    pub threshold: f64,
    /// Owning account.
    pub owner: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Condition {
    /// Creates a condition after validating the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the threshold is negative or not finite.
    pub fn new(
        counter_id: CounterId,
        operator: RelationalOperator,
        threshold: f64,
        owner: impl Into<String>,
    ) -> Result<Self, ValidationErrors> {
        validate_threshold(threshold)?;
        Ok(Self {
            id: ConditionId::new(),
            counter_id,
            operator,
            threshold,
            owner: owner.into(),
            created_at: Utc::now(),
        })
    }

    /// Returns true if the measured value satisfies this condition.
    #[must_use]
    pub fn is_met_by(&self, value: f64) -> bool {
        self.operator.evaluate(value, self.threshold)
    }
}

/// Checks that a threshold is finite and non-negative.
///
/// # Errors
///
/// Returns an error describing the rejected threshold.
pub fn validate_threshold(threshold: f64) -> Result<(), ValidationErrors> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "threshold",
            reason: format!("{threshold} must be a non-negative number"),
        }
        .into());
    }
    Ok(())
}
