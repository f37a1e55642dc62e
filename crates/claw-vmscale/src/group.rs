//! VM groups: the scalable unit, its state machine and the flattened
//! descriptor the control loop works from.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::counter::Counter;
use crate::error::{ValidationError, ValidationErrors};
use crate::policy::{AutoScalePolicy, ScaleAction};
use crate::profile::AutoScaleVmProfile;
use crate::services::ServiceProvider;
use crate::types::{GroupId, LoadBalancerId, PolicyId, ProfileId, VmId};

/// Longest hostname a generated VM name may have.
pub const MAX_HOSTNAME_LEN: usize = 63;

const HOSTNAME_SUFFIX_LEN: usize = 6;

/// Lifecycle state of a VM group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmGroupState {
    /// Created, not yet configured on the provider.
    New,
    /// Monitored and scaled.
    Enabled,
    /// Paused; structural changes are allowed.
    Disabled,
    /// A scale operation is in flight.
    Scaling,
    /// Being deleted.
    Revoke,
}

impl VmGroupState {
    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Enabled | Self::Disabled | Self::Revoke)
                | (Self::Enabled, Self::Disabled | Self::Scaling | Self::Revoke)
                | (Self::Disabled, Self::Enabled | Self::Scaling | Self::Revoke)
                | (Self::Scaling, Self::Enabled | Self::Disabled)
                | (Self::Revoke, Self::Enabled | Self::Disabled)
        )
    }

    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Enabled => "Enabled",
            Self::Disabled => "Disabled",
            Self::Scaling => "Scaling",
            Self::Revoke => "Revoke",
        }
    }
}

impl std::fmt::Display for VmGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pool of VMs behind one load balancer rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScaleVmGroup {
    /// Unique identifier.
    pub id: GroupId,
    /// Display name, also used in member hostnames.
    pub name: String,
    /// Owning account.
    pub owner: String,
    /// Load balancer rule the members serve.
    pub load_balancer_id: LoadBalancerId,
    /// Provisioning template of new members.
    pub profile_id: ProfileId,
    /// Lower member bound.
    pub min_members: u32,
    /// Upper member bound.
    pub max_members: u32,
    /// Sampling period.
    pub interval: Duration,
    /// Sequence number of the next generated hostname.
    pub next_vm_seq: u64,
    /// When the group was last sampled.
    pub last_interval: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: VmGroupState,
    /// Scale-up policies, in evaluation order.
    pub scale_up_policy_ids: Vec<PolicyId>,
    /// Scale-down policies, in evaluation order.
    pub scale_down_policy_ids: Vec<PolicyId>,
    /// Current members, oldest first.
    pub members: Vec<VmId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl AutoScaleVmGroup {
    /// Creates a group in the `New` state with no policies and no members.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        load_balancer_id: LoadBalancerId,
        profile_id: ProfileId,
        min_members: u32,
        max_members: u32,
        interval: Duration,
    ) -> Self {
        Self {
            id: GroupId::new(),
            name: name.into(),
            owner: String::new(),
            load_balancer_id,
            profile_id,
            min_members,
            max_members,
            interval,
            next_vm_seq: 1,
            last_interval: None,
            state: VmGroupState::New,
            scale_up_policy_ids: Vec::new(),
            scale_down_policy_ids: Vec::new(),
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the owning account.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the scale-up policies.
    #[must_use]
    pub fn with_scale_up_policies(mut self, ids: Vec<PolicyId>) -> Self {
        self.scale_up_policy_ids = ids;
        self
    }

    /// Sets the scale-down policies.
    #[must_use]
    pub fn with_scale_down_policies(mut self, ids: Vec<PolicyId>) -> Self {
        self.scale_down_policy_ids = ids;
        self
    }

    /// Returns the number of current members.
    #[must_use]
    pub fn member_count(&self) -> u32 {
        u32::try_from(self.members.len()).unwrap_or(u32::MAX)
    }

    /// Returns every policy id, scale-up first.
    pub fn policy_ids(&self) -> impl Iterator<Item = &PolicyId> {
        self.scale_up_policy_ids
            .iter()
            .chain(self.scale_down_policy_ids.iter())
    }

    /// Returns true if the interval has elapsed since the last sample.
    #[must_use]
    pub fn interval_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_interval {
            Some(last) => {
                let interval = chrono::Duration::from_std(self.interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                now - last >= interval
            }
            None => true,
        }
    }

    /// Validates the group's own structural invariants.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut report = ValidationErrors::new();
        if self.name.trim().is_empty() {
            report.push(ValidationError::Missing { field: "name" });
        }
        if self.min_members == 0 {
            report.push(ValidationError::OutOfRange {
                field: "minmembers",
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_members == 0 {
            report.push(ValidationError::OutOfRange {
                field: "maxmembers",
                reason: "must be greater than 0".into(),
            });
        }
        if self.min_members > self.max_members {
            report.push(ValidationError::OutOfRange {
                field: "minmembers",
                reason: format!(
                    "{} cannot exceed maxmembers {}",
                    self.min_members, self.max_members
                ),
            });
        }
        if self.interval.is_zero() {
            report.push(ValidationError::OutOfRange {
                field: "interval",
                reason: "must be positive".into(),
            });
        }
        if self.scale_up_policy_ids.is_empty() {
            report.push(ValidationError::Missing {
                field: "scaleuppolicyids",
            });
        }
        if self.scale_down_policy_ids.is_empty() {
            report.push(ValidationError::Missing {
                field: "scaledownpolicyids",
            });
        }
        let mut seen = HashSet::new();
        for id in self.policy_ids() {
            if !seen.insert(id) {
                report.push(ValidationError::InvalidValue {
                    field: "policyids",
                    value: format!("{id} listed twice"),
                });
            }
        }
        report.into_result(())
    }

    /// Checks policies against this group: kinds match the list they are in
    /// and each duration covers the sampling interval.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn check_policies<'a>(
        &self,
        policies: impl IntoIterator<Item = &'a AutoScalePolicy>,
    ) -> Result<(), ValidationErrors> {
        let mut report = ValidationErrors::new();
        for policy in policies {
            let expected = if self.scale_up_policy_ids.contains(&policy.id) {
                ScaleAction::ScaleUp
            } else {
                ScaleAction::ScaleDown
            };
            if policy.action != expected {
                report.push(ValidationError::Rule(format!(
                    "policy {} is {} but listed as {}",
                    policy.id, policy.action, expected
                )));
            }
            if policy.duration < self.interval {
                report.push(ValidationError::DurationBelowInterval {
                    policy: policy.id.to_string(),
                    duration_secs: policy.duration.as_secs(),
                    interval_secs: self.interval.as_secs(),
                });
            }
        }
        report.into_result(())
    }
}

/// A condition together with the counter it measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDescriptor {
    /// The condition.
    pub condition: Condition,
    /// The measured counter.
    pub counter: Counter,
}

/// A policy together with its resolved conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDescriptor {
    /// The policy.
    pub policy: AutoScalePolicy,
    /// Its conditions, in stored order.
    pub conditions: Vec<ConditionDescriptor>,
}

/// Read-only snapshot of a group and everything it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    /// The group.
    pub group: AutoScaleVmGroup,
    /// Its profile.
    pub profile: AutoScaleVmProfile,
    /// Provider servicing its load balancer.
    pub provider: ServiceProvider,
    /// Policies in evaluation order, scale-up first.
    pub policies: Vec<PolicyDescriptor>,
}

impl GroupDescriptor {
    /// Returns every distinct counter referenced by the group's policies.
    #[must_use]
    pub fn counters(&self) -> Vec<&Counter> {
        let mut seen = HashSet::new();
        self.policies
            .iter()
            .flat_map(|p| p.conditions.iter())
            .map(|c| &c.counter)
            .filter(|c| seen.insert(c.id))
            .collect()
    }

    /// Returns the longest policy duration.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        self.policies
            .iter()
            .map(|p| p.policy.duration)
            .max()
            .unwrap_or_default()
    }
}

/// Point-in-time view of a group for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// The group.
    pub group_id: GroupId,
    /// Display name.
    pub name: String,
    /// Lifecycle state.
    pub state: VmGroupState,
    /// Current member count.
    pub member_count: u32,
    /// Lower bound.
    pub min_members: u32,
    /// Upper bound.
    pub max_members: u32,
    /// Sampling period in seconds.
    pub interval_secs: u64,
    /// Last sample time.
    pub last_interval: Option<DateTime<Utc>>,
    /// Whether a periodic monitor is running.
    pub scheduled: bool,
}

/// Generates a unique hostname for a new member of `group_name`.
///
/// The result is `<prefix><name>-<seq>-<suffix>` where `name` keeps only the
/// ASCII letters, digits and dashes of the group name and is truncated so the
/// whole hostname fits in [`MAX_HOSTNAME_LEN`] characters.
#[must_use]
pub fn generate_hostname(prefix: &str, group_name: &str, seq: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HOSTNAME_SUFFIX_LEN)
        .map(char::from)
        .collect();
    compose_hostname(prefix, group_name, seq, &suffix)
}

fn compose_hostname(prefix: &str, group_name: &str, seq: u64, suffix: &str) -> String {
    let tail = format!("-{seq}-{suffix}");
    let budget = MAX_HOSTNAME_LEN.saturating_sub(prefix.len() + tail.len());
    let name: String = group_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(budget)
        .collect();

    let mut hostname = format!("{prefix}{name}{tail}");
    hostname.truncate(MAX_HOSTNAME_LEN);
    hostname
}
