//! In-memory persistence of autoscaler records.
//!
//! Every record type lives in its own table behind a `parking_lot::RwLock`.
//! Group state changes go through [`Repository::try_transition`], a
//! compare-and-swap under the group table's write lock: it is the only
//! mutual exclusion between concurrent scalers of one group.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::condition::Condition;
use crate::counter::Counter;
use crate::error::{AutoscaleError, Result};
use crate::group::{AutoScaleVmGroup, ConditionDescriptor, GroupDescriptor, PolicyDescriptor, VmGroupState};
use crate::policy::AutoScalePolicy;
use crate::profile::AutoScaleVmProfile;
use crate::services::ServiceProvider;
use crate::types::{ConditionId, CounterId, GroupId, LoadBalancerId, PolicyId, ProfileId, VmId};

#[derive(Debug)]
struct Table<K, V> {
    kind: &'static str,
    rows: RwLock<HashMap<K, V>>,
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Copy + std::fmt::Display,
    V: Clone,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, id: K, value: V) {
        self.rows.write().insert(id, value);
    }

    fn get(&self, id: &K) -> Result<V> {
        self.rows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AutoscaleError::not_found(self.kind, id))
    }

    fn replace(&self, id: K, value: V) -> Result<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(&id) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(AutoscaleError::not_found(self.kind, id)),
        }
    }

    fn update<T>(&self, id: &K, f: impl FnOnce(&mut V) -> T) -> Result<T> {
        let mut rows = self.rows.write();
        let slot = rows
            .get_mut(id)
            .ok_or_else(|| AutoscaleError::not_found(self.kind, id))?;
        Ok(f(slot))
    }

    fn remove(&self, id: &K) -> Result<V> {
        self.rows
            .write()
            .remove(id)
            .ok_or_else(|| AutoscaleError::not_found(self.kind, id))
    }

    fn values(&self) -> Vec<V> {
        self.rows.read().values().cloned().collect()
    }

    fn any(&self, f: impl Fn(&V) -> bool) -> bool {
        self.rows.read().values().any(f)
    }
}

/// Record storage for the control loop.
#[derive(Debug)]
pub struct Repository {
    counters: Table<CounterId, Counter>,
    conditions: Table<ConditionId, Condition>,
    policies: Table<PolicyId, AutoScalePolicy>,
    profiles: Table<ProfileId, AutoScaleVmProfile>,
    groups: Table<GroupId, AutoScaleVmGroup>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Table::new("counter"),
            conditions: Table::new("condition"),
            policies: Table::new("policy"),
            profiles: Table::new("profile"),
            groups: Table::new("group"),
        }
    }

    // Counters

    /// Stores a counter.
    pub fn insert_counter(&self, counter: Counter) {
        self.counters.insert(counter.id, counter);
    }

    /// Loads a counter.
    pub fn counter(&self, id: &CounterId) -> Result<Counter> {
        self.counters.get(id)
    }

    /// Lists counters, oldest first.
    #[must_use]
    pub fn counters(&self) -> Vec<Counter> {
        let mut all = self.counters.values();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Deletes a counter.
    pub fn remove_counter(&self, id: &CounterId) -> Result<Counter> {
        self.counters.remove(id)
    }

    // Conditions

    /// Stores a condition.
    pub fn insert_condition(&self, condition: Condition) {
        self.conditions.insert(condition.id, condition);
    }

    /// Loads a condition.
    pub fn condition(&self, id: &ConditionId) -> Result<Condition> {
        self.conditions.get(id)
    }

    /// Lists conditions, oldest first.
    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        let mut all = self.conditions.values();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Replaces a stored condition.
    pub fn replace_condition(&self, condition: Condition) -> Result<()> {
        self.conditions.replace(condition.id, condition)
    }

    /// Deletes a condition.
    pub fn remove_condition(&self, id: &ConditionId) -> Result<Condition> {
        self.conditions.remove(id)
    }

    // Policies

    /// Stores a policy.
    pub fn insert_policy(&self, policy: AutoScalePolicy) {
        self.policies.insert(policy.id, policy);
    }

    /// Loads a policy.
    pub fn policy(&self, id: &PolicyId) -> Result<AutoScalePolicy> {
        self.policies.get(id)
    }

    /// Lists policies, oldest first.
    #[must_use]
    pub fn policies(&self) -> Vec<AutoScalePolicy> {
        let mut all = self.policies.values();
        all.sort_by_key(|p| p.created_at);
        all
    }

    /// Replaces a stored policy.
    pub fn replace_policy(&self, policy: AutoScalePolicy) -> Result<()> {
        self.policies.replace(policy.id, policy)
    }

    /// Deletes a policy.
    pub fn remove_policy(&self, id: &PolicyId) -> Result<AutoScalePolicy> {
        self.policies.remove(id)
    }

    /// Advances a policy's last quiet time. Returns false if `now` is not
    /// after the stored value.
    pub fn record_quiet_time(&self, id: &PolicyId, now: DateTime<Utc>) -> Result<bool> {
        self.policies.update(id, |p| p.record_quiet_time(now))
    }

    // Profiles

    /// Stores a profile.
    pub fn insert_profile(&self, profile: AutoScaleVmProfile) {
        self.profiles.insert(profile.id, profile);
    }

    /// Loads a profile.
    pub fn profile(&self, id: &ProfileId) -> Result<AutoScaleVmProfile> {
        self.profiles.get(id)
    }

    /// Lists profiles, oldest first.
    #[must_use]
    pub fn profiles(&self) -> Vec<AutoScaleVmProfile> {
        let mut all = self.profiles.values();
        all.sort_by_key(|p| p.created_at);
        all
    }

    /// Replaces a stored profile.
    pub fn replace_profile(&self, profile: AutoScaleVmProfile) -> Result<()> {
        self.profiles.replace(profile.id, profile)
    }

    /// Deletes a profile.
    pub fn remove_profile(&self, id: &ProfileId) -> Result<AutoScaleVmProfile> {
        self.profiles.remove(id)
    }

    // Groups

    /// Stores a group.
    pub fn insert_group(&self, group: AutoScaleVmGroup) {
        self.groups.insert(group.id, group);
    }

    /// Loads a group.
    pub fn group(&self, id: &GroupId) -> Result<AutoScaleVmGroup> {
        self.groups.get(id)
    }

    /// Lists groups, oldest first.
    #[must_use]
    pub fn groups(&self) -> Vec<AutoScaleVmGroup> {
        let mut all = self.groups.values();
        all.sort_by_key(|g| g.created_at);
        all
    }

    /// Replaces a stored group.
    pub fn replace_group(&self, group: AutoScaleVmGroup) -> Result<()> {
        self.groups.replace(group.id, group)
    }

    /// Deletes a group.
    pub fn remove_group(&self, id: &GroupId) -> Result<AutoScaleVmGroup> {
        self.groups.remove(id)
    }

    /// Moves a group to `next` if its current state is one of `expected`.
    ///
    /// Returns the state the group was in.
    ///
    /// # Errors
    ///
    /// Returns `StateConflict` if the group is in any other state, or if the
    /// state machine forbids the move.
    pub fn try_transition(
        &self,
        id: &GroupId,
        expected: &[VmGroupState],
        next: VmGroupState,
    ) -> Result<VmGroupState> {
        self.groups.update(id, |group| {
            let current = group.state;
            if !expected.contains(&current) || !current.can_transition_to(next) {
                return Err(AutoscaleError::StateConflict {
                    group_id: id.to_string(),
                    expected: expected
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join("|"),
                    actual: current.to_string(),
                });
            }
            group.state = next;
            debug!(group = %id, from = %current, to = %next, "group state changed");
            Ok(current)
        })?
    }

    /// Reserves the next hostname sequence number of a group.
    pub fn next_vm_seq(&self, id: &GroupId) -> Result<u64> {
        self.groups.update(id, |group| {
            let seq = group.next_vm_seq;
            group.next_vm_seq = group.next_vm_seq.saturating_add(1);
            seq
        })
    }

    /// Records when a group was last sampled.
    pub fn set_last_interval(&self, id: &GroupId, at: DateTime<Utc>) -> Result<()> {
        self.groups.update(id, |group| group.last_interval = Some(at))
    }

    /// Adds a member. Returns false if it was already a member.
    pub fn add_member(&self, id: &GroupId, vm_id: VmId) -> Result<bool> {
        self.groups.update(id, |group| {
            if group.members.contains(&vm_id) {
                false
            } else {
                group.members.push(vm_id);
                true
            }
        })
    }

    /// Removes a member. Returns false if it was not a member.
    pub fn remove_member(&self, id: &GroupId, vm_id: &VmId) -> Result<bool> {
        self.groups.update(id, |group| {
            let before = group.members.len();
            group.members.retain(|m| m != vm_id);
            group.members.len() != before
        })
    }

    // References

    /// Returns true if a condition measures the counter.
    #[must_use]
    pub fn counter_in_use(&self, id: &CounterId) -> bool {
        self.conditions.any(|c| &c.counter_id == id)
    }

    /// Returns the policies that use a condition.
    #[must_use]
    pub fn policies_using_condition(&self, id: &ConditionId) -> Vec<AutoScalePolicy> {
        self.policies()
            .into_iter()
            .filter(|p| p.condition_ids.contains(id))
            .collect()
    }

    /// Returns the groups that use a policy.
    #[must_use]
    pub fn groups_using_policy(&self, id: &PolicyId) -> Vec<AutoScaleVmGroup> {
        self.groups()
            .into_iter()
            .filter(|g| g.policy_ids().any(|p| p == id))
            .collect()
    }

    /// Returns the groups that use a profile.
    #[must_use]
    pub fn groups_using_profile(&self, id: &ProfileId) -> Vec<AutoScaleVmGroup> {
        self.groups()
            .into_iter()
            .filter(|g| &g.profile_id == id)
            .collect()
    }

    /// Returns the group attached to a load balancer rule, if any.
    #[must_use]
    pub fn group_for_load_balancer(&self, lb_id: &LoadBalancerId) -> Option<AutoScaleVmGroup> {
        self.groups
            .values()
            .into_iter()
            .find(|g| &g.load_balancer_id == lb_id)
    }

    /// Resolves a policy and its conditions.
    pub fn describe_policy(&self, id: &PolicyId) -> Result<PolicyDescriptor> {
        let policy = self.policy(id)?;
        let conditions = policy
            .condition_ids
            .iter()
            .map(|cid| {
                let condition = self.condition(cid)?;
                let counter = self.counter(&condition.counter_id)?;
                Ok(ConditionDescriptor { condition, counter })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PolicyDescriptor { policy, conditions })
    }

    /// Builds the flattened snapshot of a group.
    pub fn describe_group(&self, id: &GroupId, provider: ServiceProvider) -> Result<GroupDescriptor> {
        let group = self.group(id)?;
        let profile = self.profile(&group.profile_id)?;
        let policies = group
            .policy_ids()
            .map(|pid| self.describe_policy(pid))
            .collect::<Result<Vec<_>>>()?;
        Ok(GroupDescriptor {
            group,
            profile,
            provider,
            policies,
        })
    }
}
