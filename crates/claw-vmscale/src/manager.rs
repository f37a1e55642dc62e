//! Autoscale manager.
//!
//! The entry point for administrative operations: lifecycle of counters,
//! conditions, policies, profiles and groups, enabling and disabling groups,
//! manual scaling and status. It owns the shared records, the statistics and
//! the scheduler.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::condition::{Condition, RelationalOperator, validate_threshold};
use crate::config::AutoscaleConfig;
use crate::counter::{Counter, CounterSource};
use crate::error::{AutoscaleError, Result, ValidationError, ValidationErrors};
use crate::group::{AutoScaleVmGroup, GroupStatus, VmGroupState};
use crate::monitor::{GroupMonitor, TickOutcome};
use crate::policy::{AutoScalePolicy, AutoScalePolicyBuilder, ScaleAction, check_distinct_counters};
use crate::profile::AutoScaleVmProfile;
use crate::repository::Repository;
use crate::scheduler::{AutoscaleScheduler, SweepReport};
use crate::services::{ServiceProvider, Services};
use crate::statistics::StatisticsStore;
use crate::types::{ConditionId, CounterId, GroupId, PolicyId, ProfileId, VmId};

/// Changes to a policy. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyUpdate {
    /// New duration.
    pub duration: Option<Duration>,
    /// New quiet time.
    pub quiet_time: Option<Duration>,
    /// New condition list.
    pub condition_ids: Option<Vec<ConditionId>>,
}

/// Changes to a group. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New lower bound.
    pub min_members: Option<u32>,
    /// New upper bound.
    pub max_members: Option<u32>,
    /// New sampling period.
    pub interval: Option<Duration>,
    /// New scale-up policies.
    pub scale_up_policy_ids: Option<Vec<PolicyId>>,
    /// New scale-down policies.
    pub scale_down_policy_ids: Option<Vec<PolicyId>>,
}

/// Manages autoscale records and the control loop of every group.
#[derive(Debug)]
pub struct AutoscaleManager {
    config: AutoscaleConfig,
    repo: Arc<Repository>,
    stats: Arc<StatisticsStore>,
    services: Services,
    monitor: Arc<GroupMonitor>,
    scheduler: AutoscaleScheduler,
}

impl AutoscaleManager {
    /// Creates a manager. Timers are spawned on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(services: Services, config: AutoscaleConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let repo = Arc::new(Repository::new());
        let stats = Arc::new(StatisticsStore::new());
        let monitor = Arc::new(GroupMonitor::new(
            Arc::clone(&repo),
            Arc::clone(&stats),
            services.clone(),
            &config,
        ));
        let scheduler = AutoscaleScheduler::new(Arc::clone(&repo), Arc::clone(&monitor), &config, runtime);
        Ok(Self {
            config,
            repo,
            stats,
            services,
            monitor,
            scheduler,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Returns the record store.
    #[must_use]
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Returns the statistics store.
    #[must_use]
    pub fn statistics(&self) -> &Arc<StatisticsStore> {
        &self.stats
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &AutoscaleScheduler {
        &self.scheduler
    }

    /// Starts timers of enabled groups and the periodic sweep.
    pub fn start(&self) {
        self.scheduler.reconcile_timers();
        self.scheduler.start_sweep();
    }

    /// Stops every timer, waiting for in-flight ticks.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // Counters

    /// Creates a counter.
    pub fn create_counter(
        &self,
        name: impl Into<String>,
        source: CounterSource,
        value: impl Into<String>,
    ) -> Result<Counter> {
        let counter = Counter::new(name, source, value)?;
        self.repo.insert_counter(counter.clone());
        info!(counter = %counter.id, source = %counter.source, "created counter");
        Ok(counter)
    }

    /// Returns a counter.
    pub fn counter(&self, id: &CounterId) -> Result<Counter> {
        self.repo.counter(id)
    }

    /// Returns every counter.
    #[must_use]
    pub fn counters(&self) -> Vec<Counter> {
        self.repo.counters()
    }

    /// Deletes a counter no condition references.
    pub fn delete_counter(&self, id: &CounterId) -> Result<Counter> {
        if self.repo.counter_in_use(id) {
            return Err(AutoscaleError::in_use("counter", id, "referenced by a condition"));
        }
        let counter = self.repo.remove_counter(id)?;
        info!(counter = %id, "deleted counter");
        Ok(counter)
    }

    // Conditions

    /// Creates a condition over an existing counter.
    pub fn create_condition(
        &self,
        counter_id: CounterId,
        operator: RelationalOperator,
        threshold: f64,
        owner: impl Into<String>,
    ) -> Result<Condition> {
        self.repo.counter(&counter_id)?;
        let condition = Condition::new(counter_id, operator, threshold, owner)?;
        self.repo.insert_condition(condition.clone());
        info!(condition = %condition.id, counter = %counter_id, "created condition");
        Ok(condition)
    }

    /// Returns a condition.
    pub fn condition(&self, id: &ConditionId) -> Result<Condition> {
        self.repo.condition(id)
    }

    /// Returns every condition.
    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        self.repo.conditions()
    }

    /// Changes a condition's operator or threshold. Every group using it
    /// must be disabled; their samples for the affected policies go stale.
    pub fn update_condition(
        &self,
        id: &ConditionId,
        operator: Option<RelationalOperator>,
        threshold: Option<f64>,
    ) -> Result<Condition> {
        let mut condition = self.repo.condition(id)?;
        if let Some(threshold) = threshold {
            validate_threshold(threshold)?;
            condition.threshold = threshold;
        }
        if let Some(operator) = operator {
            condition.operator = operator;
        }

        let policies = self.repo.policies_using_condition(id);
        let mut affected = Vec::new();
        for policy in &policies {
            let groups = self.repo.groups_using_policy(&policy.id);
            ensure_disabled("condition", id, &groups)?;
            affected.extend(groups.into_iter().map(|g| (g.id, policy.id)));
        }

        self.repo.replace_condition(condition.clone())?;
        for (group_id, policy_id) in affected {
            self.stats.mark_inactive(&group_id, Some(&policy_id));
        }
        info!(condition = %id, "updated condition");
        Ok(condition)
    }

    /// Deletes a condition no policy references.
    pub fn delete_condition(&self, id: &ConditionId) -> Result<Condition> {
        if let Some(policy) = self.repo.policies_using_condition(id).first() {
            return Err(AutoscaleError::in_use(
                "condition",
                id,
                format!("referenced by policy {}", policy.id),
            ));
        }
        let condition = self.repo.remove_condition(id)?;
        info!(condition = %id, "deleted condition");
        Ok(condition)
    }

    // Policies

    /// Returns a policy builder seeded with the configured quiet time.
    #[must_use]
    pub fn policy_builder(&self, name: impl Into<String>, action: ScaleAction) -> AutoScalePolicyBuilder {
        AutoScalePolicy::builder(name, action).quiet_time(self.config.default_quiet_time())
    }

    /// Stores a built policy after checking its conditions.
    pub fn create_policy(&self, policy: AutoScalePolicy) -> Result<AutoScalePolicy> {
        policy.validate()?;
        self.check_policy_conditions(&policy)?;
        self.repo.insert_policy(policy.clone());
        info!(policy = %policy.id, action = %policy.action, "created policy");
        Ok(policy)
    }

    fn check_policy_conditions(&self, policy: &AutoScalePolicy) -> Result<()> {
        let conditions = policy
            .condition_ids
            .iter()
            .map(|id| self.repo.condition(id))
            .collect::<Result<Vec<_>>>()?;
        check_distinct_counters(&conditions)?;
        Ok(())
    }

    /// Returns a policy.
    pub fn policy(&self, id: &PolicyId) -> Result<AutoScalePolicy> {
        self.repo.policy(id)
    }

    /// Returns every policy.
    #[must_use]
    pub fn policies(&self) -> Vec<AutoScalePolicy> {
        self.repo.policies()
    }

    /// Changes a policy. Every group using it must be disabled and keep its
    /// interval within the new duration.
    pub fn update_policy(&self, id: &PolicyId, update: PolicyUpdate) -> Result<AutoScalePolicy> {
        let mut policy = self.repo.policy(id)?;
        let groups = self.repo.groups_using_policy(id);
        ensure_disabled("policy", id, &groups)?;

        let mut stale = false;
        if let Some(duration) = update.duration {
            stale |= duration != policy.duration;
            policy.duration = duration;
        }
        if let Some(quiet_time) = update.quiet_time {
            policy.quiet_time = quiet_time;
        }
        if let Some(condition_ids) = update.condition_ids {
            stale |= condition_ids != policy.condition_ids;
            policy.condition_ids = condition_ids;
        }

        policy.validate()?;
        self.check_policy_conditions(&policy)?;
        let mut report = ValidationErrors::new();
        for group in &groups {
            if let Err(e) = group.check_policies([&policy]) {
                report.extend(e);
            }
        }
        report.into_result(())?;

        self.repo.replace_policy(policy.clone())?;
        if stale {
            for group in &groups {
                self.stats.mark_inactive(&group.id, Some(id));
            }
        }
        info!(policy = %id, "updated policy");
        Ok(policy)
    }

    /// Deletes a policy no group references.
    pub fn delete_policy(&self, id: &PolicyId) -> Result<AutoScalePolicy> {
        if let Some(group) = self.repo.groups_using_policy(id).first() {
            return Err(AutoscaleError::in_use(
                "policy",
                id,
                format!("referenced by group {}", group.id),
            ));
        }
        let policy = self.repo.remove_policy(id)?;
        info!(policy = %id, "deleted policy");
        Ok(policy)
    }

    // Profiles

    /// Stores a validated profile.
    pub fn create_profile(&self, profile: AutoScaleVmProfile) -> Result<AutoScaleVmProfile> {
        profile.validate()?;
        self.repo.insert_profile(profile.clone());
        info!(profile = %profile.id, "created profile");
        Ok(profile)
    }

    /// Returns a profile.
    pub fn profile(&self, id: &ProfileId) -> Result<AutoScaleVmProfile> {
        self.repo.profile(id)
    }

    /// Returns every profile.
    #[must_use]
    pub fn profiles(&self) -> Vec<AutoScaleVmProfile> {
        self.repo.profiles()
    }

    /// Replaces a profile. Every group using it must be disabled and still
    /// find the counter parameters it needs.
    pub fn update_profile(&self, profile: AutoScaleVmProfile) -> Result<AutoScaleVmProfile> {
        let current = self.repo.profile(&profile.id)?;
        let groups = self.repo.groups_using_profile(&profile.id);
        ensure_disabled("profile", &profile.id, &groups)?;

        let profile = AutoScaleVmProfile {
            created_at: current.created_at,
            ..profile
        };
        profile.validate()?;
        for group in &groups {
            let counters = self.group_counters(group)?;
            profile.check_counter_params(&counters)?;
        }

        self.repo.replace_profile(profile.clone())?;
        info!(profile = %profile.id, "updated profile");
        Ok(profile)
    }

    /// Deletes a profile no group references.
    pub fn delete_profile(&self, id: &ProfileId) -> Result<AutoScaleVmProfile> {
        if let Some(group) = self.repo.groups_using_profile(id).first() {
            return Err(AutoscaleError::in_use(
                "profile",
                id,
                format!("referenced by group {}", group.id),
            ));
        }
        let profile = self.repo.remove_profile(id)?;
        info!(profile = %id, "deleted profile");
        Ok(profile)
    }

    // Groups

    /// Creates a group, configures it on the provider and starts its timer.
    ///
    /// The group is stored as `New` and becomes `Enabled` once the provider
    /// accepts it. If the provider fails the group is removed again.
    pub fn create_group(&self, group: AutoScaleVmGroup) -> Result<AutoScaleVmGroup> {
        let lb_id = group.load_balancer_id.clone();
        if let Some(existing) = self.repo.group_for_load_balancer(&lb_id) {
            return Err(AutoscaleError::in_use(
                "load balancer",
                &lb_id,
                format!("already used by group {}", existing.id),
            ));
        }
        if !self.services.load_balancers.members(&lb_id)?.is_empty() {
            return Err(AutoscaleError::in_use(
                "load balancer",
                &lb_id,
                "has vms assigned outside autoscaling",
            ));
        }
        let provider = self.services.load_balancers.service_provider(&lb_id)?;

        let group = AutoScaleVmGroup {
            state: VmGroupState::New,
            members: Vec::new(),
            last_interval: None,
            next_vm_seq: 1,
            ..group
        };
        self.check_group(&group, provider)?;

        let group_id = group.id;
        self.repo.insert_group(group);
        info!(group = %group_id, lb = %lb_id, provider = %provider, "created group");

        if let Err(e) = self.configure(&group_id, VmGroupState::New, provider) {
            error!(group = %group_id, error = %e, "provider rejected new group, removing it");
            if let Err(e) = self.repo.remove_group(&group_id) {
                warn!(group = %group_id, error = %e, "failed to remove rejected group");
            }
            return Err(e);
        }
        self.repo
            .try_transition(&group_id, &[VmGroupState::New], VmGroupState::Enabled)?;
        let group = self.repo.group(&group_id)?;
        self.scheduler.schedule(group_id, group.interval);
        Ok(group)
    }

    fn check_group(&self, group: &AutoScaleVmGroup, provider: ServiceProvider) -> Result<()> {
        group.validate()?;
        let profile = self.repo.profile(&group.profile_id)?;
        let policies = group
            .policy_ids()
            .map(|id| self.repo.policy(id))
            .collect::<Result<Vec<_>>>()?;

        let mut report = ValidationErrors::new();
        if let Err(e) = group.check_policies(&policies) {
            report.extend(e);
        }
        let counters = self.group_counters(group)?;
        for counter in &counters {
            if !provider.supports(counter.source) {
                report.push(ValidationError::Rule(format!(
                    "counter {} ({}) is not supported by provider {provider}",
                    counter.name, counter.source
                )));
            }
        }
        if let Err(e) = profile.check_counter_params(&counters) {
            report.extend(e);
        }
        report.into_result(())?;
        Ok(())
    }

    fn group_counters(&self, group: &AutoScaleVmGroup) -> Result<Vec<Counter>> {
        let mut ids = BTreeSet::new();
        for policy_id in group.policy_ids() {
            for condition_id in &self.repo.policy(policy_id)?.condition_ids {
                ids.insert(self.repo.condition(condition_id)?.counter_id);
            }
        }
        ids.iter().map(|id| self.repo.counter(id)).collect()
    }

    fn configure(&self, group_id: &GroupId, prior: VmGroupState, provider: ServiceProvider) -> Result<()> {
        let descriptor = self.repo.describe_group(group_id, provider)?;
        if self
            .services
            .load_balancers
            .configure_group(&descriptor, prior)?
        {
            Ok(())
        } else {
            Err(AutoscaleError::Provider {
                message: format!("provider refused configuration of group {group_id}"),
            })
        }
    }

    fn provider_of(&self, group_id: &GroupId) -> Result<ServiceProvider> {
        let group = self.repo.group(group_id)?;
        self.services
            .load_balancers
            .service_provider(&group.load_balancer_id)
    }

    fn rollback(&self, group_id: &GroupId, from: VmGroupState, to: VmGroupState) {
        if let Err(e) = self.repo.try_transition(group_id, &[from], to) {
            error!(group = %group_id, from = %from, to = %to, error = %e, "failed to roll back group state");
        }
    }

    /// Returns a group.
    pub fn group(&self, id: &GroupId) -> Result<AutoScaleVmGroup> {
        self.repo.group(id)
    }

    /// Returns every group.
    #[must_use]
    pub fn groups(&self) -> Vec<AutoScaleVmGroup> {
        self.repo.groups()
    }

    /// Enables a disabled group and starts its timer. The state is rolled
    /// back if the provider cannot be configured.
    pub fn enable_group(&self, id: &GroupId) -> Result<AutoScaleVmGroup> {
        let provider = self.provider_of(id)?;
        let prior = self
            .repo
            .try_transition(id, &[VmGroupState::Disabled], VmGroupState::Enabled)?;
        if let Err(e) = self.configure(id, prior, provider) {
            self.rollback(id, VmGroupState::Enabled, prior);
            return Err(e);
        }

        let group = self.repo.group(id)?;
        self.scheduler.schedule(*id, group.interval);
        info!(group = %id, "enabled group");
        Ok(group)
    }

    /// Disables an enabled group, stops its timer and marks its samples
    /// stale. The state is rolled back if the provider cannot be configured.
    pub fn disable_group(&self, id: &GroupId) -> Result<AutoScaleVmGroup> {
        let provider = self.provider_of(id)?;
        let prior = self
            .repo
            .try_transition(id, &[VmGroupState::Enabled], VmGroupState::Disabled)?;
        if let Err(e) = self.configure(id, prior, provider) {
            self.rollback(id, VmGroupState::Disabled, prior);
            return Err(e);
        }

        self.scheduler.cancel(id);
        self.stats.mark_inactive(id, None);
        info!(group = %id, "disabled group");
        self.repo.group(id)
    }

    /// Changes a disabled group. Its samples are marked stale.
    pub fn update_group(&self, id: &GroupId, update: GroupUpdate) -> Result<AutoScaleVmGroup> {
        let mut group = self.repo.group(id)?;
        if group.state != VmGroupState::Disabled {
            return Err(AutoscaleError::in_use(
                "group",
                id,
                format!("must be disabled to update, is {}", group.state),
            ));
        }

        if let Some(name) = update.name {
            group.name = name;
        }
        if let Some(min) = update.min_members {
            group.min_members = min;
        }
        if let Some(max) = update.max_members {
            group.max_members = max;
        }
        if let Some(interval) = update.interval {
            group.interval = interval;
        }
        if let Some(ids) = update.scale_up_policy_ids {
            group.scale_up_policy_ids = ids;
        }
        if let Some(ids) = update.scale_down_policy_ids {
            group.scale_down_policy_ids = ids;
        }

        let provider = self.provider_of(id)?;
        self.check_group(&group, provider)?;
        self.repo.replace_group(group.clone())?;
        self.stats.mark_inactive(id, None);
        info!(group = %id, "updated group");
        Ok(group)
    }

    /// Deletes a group. With `cleanup` its members are detached and
    /// destroyed first; without it the group must be disabled and empty.
    ///
    /// The group is moved to `Revoke` before its members are read, so no
    /// scale action can add a member that the deletion misses.
    pub fn delete_group(&self, id: &GroupId, cleanup: bool) -> Result<AutoScaleVmGroup> {
        let deletable: &[VmGroupState] = if cleanup {
            &[VmGroupState::New, VmGroupState::Enabled, VmGroupState::Disabled]
        } else {
            &[VmGroupState::New, VmGroupState::Disabled]
        };
        let current = self.repo.group(id)?.state;
        if !deletable.contains(&current) {
            return Err(AutoscaleError::in_use(
                "group",
                id,
                format!("must be disabled to delete, is {current}"),
            ));
        }

        let provider = self.provider_of(id)?;
        let prior = self.repo.try_transition(id, deletable, VmGroupState::Revoke)?;
        let group = self.repo.group(id)?;
        if !cleanup && !group.members.is_empty() {
            self.rollback(id, VmGroupState::Revoke, prior);
            return Err(AutoscaleError::in_use(
                "group",
                id,
                format!("has {} members, cleanup required", group.members.len()),
            ));
        }

        if let Err(e) = self.configure(id, prior, provider) {
            if prior != VmGroupState::New {
                self.rollback(id, VmGroupState::Revoke, prior);
                return Err(e);
            }
            warn!(group = %id, error = %e, "provider failed to revoke new group, removing it");
        }

        self.scheduler.release(id);
        if cleanup {
            self.destroy_members(&group);
        }
        self.stats.remove_group(id);
        let removed = self.repo.remove_group(id)?;
        info!(group = %id, "deleted group");
        Ok(removed)
    }

    fn destroy_members(&self, group: &AutoScaleVmGroup) {
        for vm_id in &group.members {
            match self
                .services
                .load_balancers
                .remove_vms(&group.load_balancer_id, std::slice::from_ref(vm_id))
            {
                Ok(true) => {}
                Ok(false) => warn!(group = %group.id, vm = %vm_id, "provider refused to detach vm"),
                Err(e) => warn!(group = %group.id, vm = %vm_id, error = %e, "failed to detach vm"),
            }
            if let Err(e) = self.services.vms.destroy_vm(vm_id, true) {
                warn!(group = %group.id, vm = %vm_id, error = %e, "failed to destroy vm");
            }
        }
    }

    // Scaling

    /// Adds `count` members without a triggering policy.
    pub fn scale_up(&self, id: &GroupId, count: u32) -> Result<u32> {
        self.monitor.executor().scale_up(id, count, None)
    }

    /// Removes one member without a triggering policy.
    pub fn scale_down(&self, id: &GroupId) -> Result<VmId> {
        self.monitor.executor().scale_down(id, None)
    }

    /// Runs one control-loop tick of a group now.
    pub fn check_group_now(&self, id: &GroupId) -> Result<TickOutcome> {
        self.monitor.check_group(id)
    }

    /// Runs one tick of every enabled group.
    pub async fn check_all_groups(&self) -> SweepReport {
        self.scheduler.check_all_groups().await
    }

    // Status

    /// Returns a snapshot of a group.
    pub fn status(&self, id: &GroupId) -> Result<GroupStatus> {
        let group = self.repo.group(id)?;
        Ok(self.status_of(&group))
    }

    /// Returns a snapshot of every group.
    #[must_use]
    pub fn statuses(&self) -> Vec<GroupStatus> {
        self.repo.groups().iter().map(|g| self.status_of(g)).collect()
    }

    fn status_of(&self, group: &AutoScaleVmGroup) -> GroupStatus {
        GroupStatus {
            group_id: group.id,
            name: group.name.clone(),
            state: group.state,
            member_count: group.member_count(),
            min_members: group.min_members,
            max_members: group.max_members,
            interval_secs: group.interval.as_secs(),
            last_interval: group.last_interval,
            scheduled: self.scheduler.is_scheduled(&group.id),
        }
    }
}

fn ensure_disabled(kind: &'static str, id: impl ToString, groups: &[AutoScaleVmGroup]) -> Result<()> {
    match groups.iter().find(|g| g.state != VmGroupState::Disabled) {
        Some(group) => Err(AutoscaleError::in_use(
            kind,
            id,
            format!("group {} is {}", group.id, group.state),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScalingExecutor;
    use crate::group::GroupDescriptor;
    use crate::in_memory::{InMemoryLoadBalancer, InMemoryServices};
    use crate::services::LoadBalancerService;
    use crate::statistics::{Sample, StatisticState, StatisticValueType};
    use crate::types::LoadBalancerId;

    struct Fixture {
        fakes: InMemoryServices,
        manager: AutoscaleManager,
        counter: CounterId,
        up_condition: ConditionId,
        up: PolicyId,
        down: PolicyId,
        profile: ProfileId,
    }

    fn fakes() -> InMemoryServices {
        let fakes = InMemoryServices::new();
        fakes
            .load_balancers
            .register(LoadBalancerId::new("lb-1"), ServiceProvider::VirtualRouter, "net-1");
        fakes
    }

    fn fixture() -> Fixture {
        let fakes = fakes();
        let services = fakes.services();
        fixture_with(fakes, services)
    }

    fn fixture_with(fakes: InMemoryServices, services: Services) -> Fixture {
        let manager = AutoscaleManager::new(services, AutoscaleConfig::default(), Handle::current()).unwrap();

        let counter = manager.create_counter("cpu", CounterSource::Cpu, "cpu.util").unwrap();
        let up_condition = manager
            .create_condition(counter.id, RelationalOperator::Gt, 80.0, "admin")
            .unwrap();
        let down_condition = manager
            .create_condition(counter.id, RelationalOperator::Lt, 20.0, "admin")
            .unwrap();
        let up = manager
            .create_policy(
                manager
                    .policy_builder("up", ScaleAction::ScaleUp)
                    .condition(up_condition.id)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let down = manager
            .create_policy(
                manager
                    .policy_builder("down", ScaleAction::ScaleDown)
                    .condition(down_condition.id)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let profile = manager
            .create_profile(AutoScaleVmProfile::new("zone-1", "tmpl-1", "small", "admin"))
            .unwrap();

        Fixture {
            fakes,
            manager,
            counter: counter.id,
            up_condition: up_condition.id,
            up: up.id,
            down: down.id,
            profile: profile.id,
        }
    }

    impl Fixture {
        fn group(&self) -> AutoScaleVmGroup {
            AutoScaleVmGroup::new(
                "web",
                LoadBalancerId::new("lb-1"),
                self.profile,
                1,
                4,
                Duration::from_secs(60),
            )
            .with_owner("admin")
            .with_scale_up_policies(vec![self.up])
            .with_scale_down_policies(vec![self.down])
        }
    }

    mod reference_tests {
        use super::*;

        #[tokio::test]
        async fn referenced_records_cannot_be_deleted() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            let err = f.manager.delete_counter(&f.counter).unwrap_err();
            assert!(matches!(err, AutoscaleError::ResourceInUse { .. }));
            assert!(f.manager.delete_condition(&f.up_condition).is_err());
            assert!(f.manager.delete_policy(&f.up).is_err());
            assert!(f.manager.delete_profile(&f.profile).is_err());

            f.manager.delete_group(&group.id, true).unwrap();
            f.manager.delete_policy(&f.up).unwrap();
            f.manager.delete_condition(&f.up_condition).unwrap();
        }

        #[tokio::test]
        async fn updates_need_disabled_groups() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            let update = PolicyUpdate {
                duration: Some(Duration::from_secs(600)),
                ..PolicyUpdate::default()
            };
            assert!(matches!(
                f.manager.update_policy(&f.up, update.clone()).unwrap_err(),
                AutoscaleError::ResourceInUse { .. }
            ));
            assert!(f.manager.update_condition(&f.up_condition, None, Some(90.0)).is_err());

            f.manager.disable_group(&group.id).unwrap();
            let policy = f.manager.update_policy(&f.up, update).unwrap();
            assert_eq!(policy.duration, Duration::from_secs(600));
            let condition = f.manager.update_condition(&f.up_condition, None, Some(90.0)).unwrap();
            assert!((condition.threshold - 90.0).abs() < f64::EPSILON);
        }

        #[tokio::test]
        async fn policy_duration_cannot_drop_below_interval() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager.disable_group(&group.id).unwrap();

            let update = PolicyUpdate {
                duration: Some(Duration::from_secs(30)),
                ..PolicyUpdate::default()
            };
            let err = f.manager.update_policy(&f.up, update).unwrap_err();
            assert!(matches!(err, AutoscaleError::InvalidParameter(_)));
        }

        #[tokio::test]
        async fn duplicate_counters_rejected() {
            let f = fixture();
            let other = f
                .manager
                .create_condition(f.counter, RelationalOperator::Ge, 10.0, "admin")
                .unwrap();
            let policy = f
                .manager
                .policy_builder("both", ScaleAction::ScaleUp)
                .conditions(vec![f.up_condition, other.id])
                .build()
                .unwrap();
            assert!(matches!(
                f.manager.create_policy(policy).unwrap_err(),
                AutoscaleError::InvalidParameter(_)
            ));
        }

        #[tokio::test]
        async fn configured_quiet_time_is_default() {
            let f = fixture();
            let policy = f.manager.repository().policy(&f.up).unwrap();
            assert_eq!(policy.quiet_time, f.manager.config().default_quiet_time());
        }
    }

    mod group_lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn create_enables_and_schedules() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            assert_eq!(group.state, VmGroupState::Enabled);
            assert!(f.manager.scheduler().is_scheduled(&group.id));
            assert_eq!(
                f.fakes.load_balancers.configure_calls(),
                vec![(group.id, VmGroupState::New)]
            );
            let status = f.manager.status(&group.id).unwrap();
            assert!(status.scheduled);
            assert_eq!(status.member_count, 0);
        }

        #[tokio::test]
        async fn status_serializes() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            let json = serde_json::to_value(f.manager.status(&group.id).unwrap()).unwrap();
            assert_eq!(json["state"], "Enabled");
            assert_eq!(json["max_members"], 4);
            assert_eq!(json["scheduled"], true);
        }

        #[tokio::test]
        async fn provider_failure_removes_new_group() {
            let f = fixture();
            f.fakes.load_balancers.set_fail_configure(true);

            let group = f.group();
            let id = group.id;
            assert!(f.manager.create_group(group).is_err());
            assert!(f.manager.repository().group(&id).is_err());
            assert!(!f.manager.scheduler().is_scheduled(&id));
        }

        #[tokio::test]
        async fn one_group_per_load_balancer() {
            let f = fixture();
            f.manager.create_group(f.group()).unwrap();
            let err = f.manager.create_group(f.group()).unwrap_err();
            assert!(matches!(err, AutoscaleError::ResourceInUse { .. }));
        }

        #[tokio::test]
        async fn manual_members_block_creation() {
            let f = fixture();
            f.fakes
                .load_balancers
                .attach(&LoadBalancerId::new("lb-1"), VmId::new("manual-1"));
            let err = f.manager.create_group(f.group()).unwrap_err();
            assert!(matches!(err, AutoscaleError::ResourceInUse { .. }));
        }

        #[tokio::test]
        async fn unsupported_counter_rejected() {
            let f = fixture();
            f.fakes
                .load_balancers
                .register(LoadBalancerId::new("lb-ns"), ServiceProvider::Netscaler, "net-2");
            let mut group = f.group();
            group.load_balancer_id = LoadBalancerId::new("lb-ns");
            let err = f.manager.create_group(group).unwrap_err();
            assert!(matches!(err, AutoscaleError::InvalidParameter(_)));
        }

        #[tokio::test]
        async fn disable_marks_statistics_stale() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager.statistics().record(
                group.id,
                Sample::value(f.up, f.counter, "vm-1", 50.0, StatisticValueType::InstantVm, chrono::Utc::now()),
            );

            let disabled = f.manager.disable_group(&group.id).unwrap();
            assert_eq!(disabled.state, VmGroupState::Disabled);
            assert!(!f.manager.scheduler().is_scheduled(&group.id));
            assert!(f
                .manager
                .statistics()
                .rows(&group.id)
                .iter()
                .all(|r| r.state == StatisticState::Inactive));
        }

        #[tokio::test]
        async fn failed_enable_rolls_back() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager.disable_group(&group.id).unwrap();
            f.fakes.load_balancers.set_fail_configure(true);

            assert!(f.manager.enable_group(&group.id).is_err());
            let status = f.manager.status(&group.id).unwrap();
            assert_eq!(status.state, VmGroupState::Disabled);
            assert!(!status.scheduled);
        }

        #[tokio::test]
        async fn failed_disable_rolls_back() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            f.fakes.load_balancers.set_fail_configure(true);

            assert!(f.manager.disable_group(&group.id).is_err());
            let status = f.manager.status(&group.id).unwrap();
            assert_eq!(status.state, VmGroupState::Enabled);
            assert!(status.scheduled);
        }

        #[tokio::test]
        async fn update_requires_disabled() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            let update = GroupUpdate {
                max_members: Some(8),
                ..GroupUpdate::default()
            };
            assert!(f.manager.update_group(&group.id, update.clone()).is_err());

            f.manager.disable_group(&group.id).unwrap();
            let updated = f.manager.update_group(&group.id, update).unwrap();
            assert_eq!(updated.max_members, 8);

            let bad = GroupUpdate {
                min_members: Some(10),
                ..GroupUpdate::default()
            };
            assert!(matches!(
                f.manager.update_group(&group.id, bad).unwrap_err(),
                AutoscaleError::InvalidParameter(_)
            ));
        }

        #[tokio::test]
        async fn delete_with_cleanup_destroys_members() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            assert_eq!(f.manager.scale_up(&group.id, 2).unwrap(), 2);

            assert!(f.manager.delete_group(&group.id, false).is_err());
            f.manager.delete_group(&group.id, true).unwrap();

            assert_eq!(f.fakes.vms.destroyed().len(), 2);
            assert!(f.manager.repository().group(&group.id).is_err());
            assert!(!f.manager.scheduler().is_scheduled(&group.id));
            assert!(f.manager.statuses().is_empty());
        }

        /// Load balancer that runs a hook once, on the next provider lookup.
        struct HookedLoadBalancer {
            inner: Arc<InMemoryLoadBalancer>,
            hook: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
        }

        impl HookedLoadBalancer {
            fn new(inner: Arc<InMemoryLoadBalancer>) -> Self {
                Self {
                    inner,
                    hook: parking_lot::Mutex::new(None),
                }
            }

            fn on_next_lookup(&self, hook: impl FnOnce() + Send + 'static) {
                *self.hook.lock() = Some(Box::new(hook));
            }
        }

        impl LoadBalancerService for HookedLoadBalancer {
            fn assign_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool> {
                self.inner.assign_vms(lb_id, vm_ids)
            }

            fn remove_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool> {
                self.inner.remove_vms(lb_id, vm_ids)
            }

            fn members(&self, lb_id: &LoadBalancerId) -> Result<Vec<VmId>> {
                self.inner.members(lb_id)
            }

            fn service_provider(&self, lb_id: &LoadBalancerId) -> Result<ServiceProvider> {
                let hook = self.hook.lock().take();
                if let Some(hook) = hook {
                    hook();
                }
                self.inner.service_provider(lb_id)
            }

            fn network_id(&self, lb_id: &LoadBalancerId) -> Result<String> {
                self.inner.network_id(lb_id)
            }

            fn configure_group(&self, descriptor: &GroupDescriptor, prior_state: VmGroupState) -> Result<bool> {
                self.inner.configure_group(descriptor, prior_state)
            }
        }

        #[tokio::test]
        async fn delete_destroys_member_added_during_provider_lookup() {
            let fakes = fakes();
            let lb = Arc::new(HookedLoadBalancer::new(Arc::clone(&fakes.load_balancers)));
            let services = Services {
                load_balancers: Arc::clone(&lb) as Arc<dyn LoadBalancerService>,
                ..fakes.services()
            };
            let f = fixture_with(fakes, services.clone());
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager.scale_up(&group.id, 1).unwrap();

            let concurrent = ScalingExecutor::new(
                Arc::clone(f.manager.repository()),
                services,
                f.manager.config().hostname_prefix.clone(),
            );
            let group_id = group.id;
            lb.on_next_lookup(move || {
                assert_eq!(concurrent.scale_up(&group_id, 1, None).unwrap(), 1);
            });

            f.manager.delete_group(&group.id, true).unwrap();

            assert_eq!(f.fakes.vms.created_count(), 2);
            assert_eq!(f.fakes.vms.destroyed().len(), 2);
            assert!(f.fakes.load_balancers.members_of(&LoadBalancerId::new("lb-1")).is_empty());
            assert!(f.manager.repository().group(&group.id).is_err());
        }

        #[tokio::test]
        async fn delete_without_cleanup_rechecks_members() {
            let fakes = fakes();
            let lb = Arc::new(HookedLoadBalancer::new(Arc::clone(&fakes.load_balancers)));
            let services = Services {
                load_balancers: Arc::clone(&lb) as Arc<dyn LoadBalancerService>,
                ..fakes.services()
            };
            let f = fixture_with(fakes, services.clone());
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager.disable_group(&group.id).unwrap();

            let concurrent = ScalingExecutor::new(
                Arc::clone(f.manager.repository()),
                services,
                f.manager.config().hostname_prefix.clone(),
            );
            let group_id = group.id;
            lb.on_next_lookup(move || {
                assert_eq!(concurrent.scale_up(&group_id, 1, None).unwrap(), 1);
            });

            let err = f.manager.delete_group(&group.id, false).unwrap_err();

            assert!(matches!(err, AutoscaleError::ResourceInUse { .. }));
            let status = f.manager.status(&group.id).unwrap();
            assert_eq!(status.state, VmGroupState::Disabled);
            assert_eq!(status.member_count, 1);
            assert!(f.fakes.vms.destroyed().is_empty());
        }

        #[tokio::test]
        async fn revoking_group_refuses_scaling() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();
            f.manager
                .repository()
                .try_transition(&group.id, &[VmGroupState::Enabled], VmGroupState::Revoke)
                .unwrap();

            let err = f.manager.scale_up(&group.id, 1).unwrap_err();

            assert!(matches!(err, AutoscaleError::StateConflict { .. }));
            assert_eq!(f.fakes.vms.created_count(), 0);
        }

        #[tokio::test]
        async fn new_group_is_removed_when_provider_cannot_revoke() {
            let f = fixture();
            let group = f.group();
            let id = group.id;
            f.manager.repository().insert_group(group);
            f.fakes.load_balancers.set_fail_configure(true);

            let removed = f.manager.delete_group(&id, false).unwrap();

            assert_eq!(removed.state, VmGroupState::Revoke);
            assert!(f.manager.repository().group(&id).is_err());
            assert!(f
                .manager
                .repository()
                .group_for_load_balancer(&LoadBalancerId::new("lb-1"))
                .is_none());
        }

        #[tokio::test]
        async fn provider_receives_autoscale_user() {
            let f = fixture();
            let profile = f
                .manager
                .create_profile(
                    AutoScaleVmProfile::new("zone-1", "tmpl-1", "small", "admin").with_autoscale_user("svc-scaler"),
                )
                .unwrap();
            let mut group = f.group();
            group.profile_id = profile.id;

            f.manager.create_group(group).unwrap();

            let descriptor = f.fakes.load_balancers.last_configured().unwrap();
            assert_eq!(descriptor.profile.autoscale_user_id.as_deref(), Some("svc-scaler"));
        }
    }

    mod scaling_tests {
        use super::*;

        #[tokio::test]
        async fn manual_scaling_leaves_quiet_times() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            f.manager.scale_up(&group.id, 2).unwrap();
            f.manager.scale_down(&group.id).unwrap();

            assert_eq!(f.manager.status(&group.id).unwrap().member_count, 1);
            let repo = f.manager.repository();
            assert!(repo.policy(&f.up).unwrap().last_quiet_time.is_none());
            assert!(repo.policy(&f.down).unwrap().last_quiet_time.is_none());
        }

        #[tokio::test]
        async fn tick_reconciles_new_group() {
            let f = fixture();
            let group = f.manager.create_group(f.group()).unwrap();

            let outcome = f.manager.check_group_now(&group.id).unwrap();
            assert_eq!(outcome, TickOutcome::Reconciled { added: 1, removed: 0 });
        }
    }
}
