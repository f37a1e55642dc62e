//! Scaling policies: a set of conditions, an action and its timing.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{ValidationError, ValidationErrors};
use crate::types::{ConditionId, PolicyId};

/// Quiet time applied when none is configured.
pub const DEFAULT_QUIET_TIME: Duration = Duration::from_secs(300);

/// What a policy does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScaleAction {
    /// Add one member to the group.
    ScaleUp,
    /// Remove one member from the group.
    ScaleDown,
}

impl ScaleAction {
    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScaleUp => "SCALEUP",
            Self::ScaleDown => "SCALEDOWN",
        }
    }
}

impl std::fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCALEUP" => Ok(Self::ScaleUp),
            "SCALEDOWN" => Ok(Self::ScaleDown),
            _ => Err(ValidationError::InvalidValue {
                field: "action",
                value: s.to_string(),
            }),
        }
    }
}

/// A named rule that fires its action once all of its conditions held for
/// `duration` and its quiet time has elapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalePolicy {
    /// Unique identifier.
    pub id: PolicyId,
    /// Display name.
    pub name: String,
    /// Action taken when the policy fires.
    pub action: ScaleAction,
    /// How long the conditions must hold.
    pub duration: Duration,
    /// Cooldown after the policy last fired.
    pub quiet_time: Duration,
    /// When the policy's action last executed.
    pub last_quiet_time: Option<DateTime<Utc>>,
    /// Conditions, in evaluation order.
    pub condition_ids: Vec<ConditionId>,
    /// Owning account.
    pub owner: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl AutoScalePolicy {
    /// Creates a new policy builder.
    #[must_use]
    pub fn builder(name: impl Into<String>, action: ScaleAction) -> AutoScalePolicyBuilder {
        AutoScalePolicyBuilder::new(name, action)
    }

    /// Validates the structural invariants of this policy.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut report = ValidationErrors::new();
        if self.name.trim().is_empty() {
            report.push(ValidationError::Missing { field: "name" });
        }
        if self.duration.is_zero() {
            report.push(ValidationError::OutOfRange {
                field: "duration",
                reason: "must be positive".into(),
            });
        }
        if self.condition_ids.is_empty() {
            report.push(ValidationError::Missing {
                field: "conditionids",
            });
        }
        let mut seen = HashSet::new();
        for id in &self.condition_ids {
            if !seen.insert(id) {
                report.push(ValidationError::InvalidValue {
                    field: "conditionids",
                    value: format!("{id} listed twice"),
                });
            }
        }
        report.into_result(())
    }

    /// Returns true if the quiet time has elapsed at `now`.
    #[must_use]
    pub fn quiet_time_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_quiet_time {
            Some(last) => {
                let quiet = chrono::Duration::from_std(self.quiet_time)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                now - last >= quiet
            }
            None => true,
        }
    }

    /// Records that this policy's action executed at `now`.
    ///
    /// Returns false and leaves the timestamp alone if `now` is not after the
    /// recorded one.
    pub fn record_quiet_time(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_quiet_time {
            Some(last) if now <= last => false,
            _ => {
                self.last_quiet_time = Some(now);
                true
            }
        }
    }
}

/// Checks that no two conditions of one policy measure the same counter.
///
/// # Errors
///
/// Returns one error per repeated counter.
pub fn check_distinct_counters<'a>(
    conditions: impl IntoIterator<Item = &'a Condition>,
) -> Result<(), ValidationErrors> {
    let mut report = ValidationErrors::new();
    let mut seen = HashSet::new();
    for condition in conditions {
        if !seen.insert(condition.counter_id) {
            report.push(ValidationError::DuplicateCounter {
                counter: condition.counter_id.to_string(),
            });
        }
    }
    report.into_result(())
}

/// Builder for [`AutoScalePolicy`].
#[derive(Debug)]
pub struct AutoScalePolicyBuilder {
    name: String,
    action: ScaleAction,
    duration: Duration,
    quiet_time: Duration,
    condition_ids: Vec<ConditionId>,
    owner: String,
}

impl AutoScalePolicyBuilder {
    /// Creates a builder with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, action: ScaleAction) -> Self {
        Self {
            name: name.into(),
            action,
            duration: Duration::from_secs(300),
            quiet_time: DEFAULT_QUIET_TIME,
            condition_ids: Vec::new(),
            owner: String::new(),
        }
    }

    /// Sets how long the conditions must hold.
    #[must_use]
    pub const fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub const fn quiet_time(mut self, quiet_time: Duration) -> Self {
        self.quiet_time = quiet_time;
        self
    }

    /// Appends a condition.
    #[must_use]
    pub fn condition(mut self, id: ConditionId) -> Self {
        self.condition_ids.push(id);
        self
    }

    /// Replaces the condition list.
    #[must_use]
    pub fn conditions(mut self, ids: Vec<ConditionId>) -> Self {
        self.condition_ids = ids;
        self
    }

    /// Sets the owning account.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Builds the policy.
    ///
    /// # Errors
    ///
    /// Returns every structural problem found.
    pub fn build(self) -> Result<AutoScalePolicy, ValidationErrors> {
        let policy = AutoScalePolicy {
            id: PolicyId::new(),
            name: self.name,
            action: self.action,
            duration: self.duration,
            quiet_time: self.quiet_time,
            last_quiet_time: None,
            condition_ids: self.condition_ids,
            owner: self.owner,
            created_at: Utc::now(),
        };

        policy.validate()?;
        Ok(policy)
    }
}
