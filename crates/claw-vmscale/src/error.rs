//! Error types for the VM group autoscaler.

use std::fmt;

use thiserror::Error;

/// Result type for autoscaler operations.
pub type Result<T> = std::result::Result<T, AutoscaleError>;

/// User-visible category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Bad input, rejected before anything is persisted.
    InvalidParameter,
    /// The target is referenced or busy.
    ResourceInUse,
    /// The target does not exist.
    NotFound,
    /// An external dependency failed or is unreachable.
    ResourceUnavailable,
    /// Not enough room to perform the requested scaling.
    InsufficientCapacity,
    /// Unexpected failure.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParameter => "invalid-parameter",
            Self::ResourceInUse => "resource-in-use",
            Self::NotFound => "not-found",
            Self::ResourceUnavailable => "resource-unavailable",
            Self::InsufficientCapacity => "insufficient-capacity",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A single structural problem found while validating input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A numeric field is out of its allowed range.
    #[error("{field} is out of range: {reason}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// What the allowed range is.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("{field} is required")]
    Missing {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A string could not be parsed into the expected value.
    #[error("invalid value '{value}' for {field}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected input.
        value: String,
    },

    /// A deploy parameter key is not on the allowed list.
    #[error("unsupported deploy parameter '{key}'")]
    UnsupportedDeployParam {
        /// The rejected key.
        key: String,
    },

    /// Two conditions of one policy measure the same counter.
    #[error("duplicate counter {counter} in policy conditions")]
    DuplicateCounter {
        /// The repeated counter.
        counter: String,
    },

    /// A policy's duration is shorter than a group's sampling interval.
    #[error("policy {policy} duration {duration_secs}s is shorter than group interval {interval_secs}s")]
    DurationBelowInterval {
        /// The offending policy.
        policy: String,
        /// Policy duration in seconds.
        duration_secs: u64,
        /// Group interval in seconds.
        interval_secs: u64,
    },

    /// A counter needs a provider parameter the profile does not carry.
    #[error("counter {counter} requires counter parameter '{param}'")]
    MissingCounterParam {
        /// The counter needing the parameter.
        counter: String,
        /// The missing parameter key.
        param: String,
    },

    /// Any other rule violation.
    #[error("{0}")]
    Rule(String),
}

/// Every problem found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a problem to the report.
    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    /// Appends every problem from another report.
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Returns true if no problem was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the collected problems.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    /// Converts the report into a result, `Ok(value)` when empty.
    pub fn into_result<T>(self, value: T) -> std::result::Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// Errors that can occur in the autoscaler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutoscaleError {
    /// Input failed validation; nothing was persisted.
    #[error("invalid parameter: {0}")]
    InvalidParameter(ValidationErrors),

    /// A record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record (counter, policy, group, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A record is referenced or its owner is busy.
    #[error("{kind} {id} is in use: {reason}")]
    ResourceInUse {
        /// Kind of record.
        kind: &'static str,
        /// Identifier of the record.
        id: String,
        /// Why the change was refused.
        reason: String,
    },

    /// A guarded state transition lost the race or started from the wrong state.
    #[error("group {group_id} is {actual}, expected {expected}")]
    StateConflict {
        /// The group being transitioned.
        group_id: String,
        /// State(s) the caller expected.
        expected: String,
        /// State actually found.
        actual: String,
    },

    /// Scaling would breach the group's member bounds.
    #[error("insufficient capacity: {reason}")]
    InsufficientCapacity {
        /// Which bound would be breached.
        reason: String,
    },

    /// The load balancer provider refused or failed a call.
    #[error("provider error: {message}")]
    Provider {
        /// Description of the provider failure.
        message: String,
    },

    /// VM provisioning or lifecycle call failed.
    #[error("vm lifecycle error: {message}")]
    VmLifecycle {
        /// Description of the failure.
        message: String,
    },

    /// A metrics fetch failed or timed out.
    #[error("metrics error: {message}")]
    MetricsError {
        /// Description of the metrics error.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {reason}")]
    Config {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Unexpected failure.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl AutoscaleError {
    /// Builds a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Builds a resource-in-use error.
    pub fn in_use(kind: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::ResourceInUse {
            kind,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the user-visible category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidParameter(_) | Self::Config { .. } => ErrorCategory::InvalidParameter,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::ResourceInUse { .. } | Self::StateConflict { .. } => ErrorCategory::ResourceInUse,
            Self::InsufficientCapacity { .. } => ErrorCategory::InsufficientCapacity,
            Self::Provider { .. } | Self::VmLifecycle { .. } | Self::MetricsError { .. } => {
                ErrorCategory::ResourceUnavailable
            }
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<ValidationErrors> for AutoscaleError {
    fn from(errors: ValidationErrors) -> Self {
        Self::InvalidParameter(errors)
    }
}

impl From<ValidationError> for AutoscaleError {
    fn from(error: ValidationError) -> Self {
        Self::InvalidParameter(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_found() {
        let err = AutoscaleError::not_found("group", "g-1");
        assert_eq!(err.to_string(), "group not found: g-1");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn error_display_in_use() {
        let err = AutoscaleError::in_use("policy", "p-1", "referenced by group g-1");
        assert_eq!(err.to_string(), "policy p-1 is in use: referenced by group g-1");
        assert_eq!(err.category(), ErrorCategory::ResourceInUse);
    }

    #[test]
    fn validation_errors_join_in_display() {
        let mut report = ValidationErrors::new();
        report.push(ValidationError::Missing { field: "name" });
        report.push(ValidationError::OutOfRange {
            field: "interval",
            reason: "must be positive".into(),
        });
        let err = AutoscaleError::from(report);
        assert_eq!(
            err.to_string(),
            "invalid parameter: name is required; interval is out of range: must be positive"
        );
        assert_eq!(err.category(), ErrorCategory::InvalidParameter);
    }

    #[test]
    fn empty_report_is_ok() {
        let report = ValidationErrors::new();
        assert_eq!(report.into_result(7), Ok(7));
    }

    #[test]
    fn external_failures_are_unavailable() {
        for err in [
            AutoscaleError::Provider {
                message: "down".into(),
            },
            AutoscaleError::VmLifecycle {
                message: "no host".into(),
            },
            AutoscaleError::MetricsError {
                message: "timeout".into(),
            },
        ] {
            assert_eq!(err.category(), ErrorCategory::ResourceUnavailable);
        }
    }

    #[test]
    fn category_display() {
        assert_eq!(
            ErrorCategory::InsufficientCapacity.to_string(),
            "insufficient-capacity"
        );
    }

    #[test]
    fn error_clone_and_eq() {
        let err1 = AutoscaleError::StateConflict {
            group_id: "g".into(),
            expected: "Enabled".into(),
            actual: "Scaling".into(),
        };
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }
}
