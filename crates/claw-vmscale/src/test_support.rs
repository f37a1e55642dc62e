//! Fixtures shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use crate::condition::{Condition, RelationalOperator};
use crate::counter::{Counter, CounterSource};
use crate::group::{AutoScaleVmGroup, ConditionDescriptor, GroupDescriptor, PolicyDescriptor, VmGroupState};
use crate::in_memory::InMemoryServices;
use crate::policy::{AutoScalePolicy, ScaleAction};
use crate::profile::AutoScaleVmProfile;
use crate::repository::Repository;
use crate::services::ServiceProvider;
use crate::types::{GroupId, LoadBalancerId, PolicyId, VmId};

const WINDOW: Duration = Duration::from_secs(300);

fn policy(name: &str, action: ScaleAction, condition: &Condition) -> AutoScalePolicy {
    AutoScalePolicy::builder(name, action)
        .duration(WINDOW)
        .quiet_time(WINDOW)
        .condition(condition.id)
        .owner("admin")
        .build()
        .unwrap()
}

/// Builds a group snapshot with a `> 50` scale-up and a `< 20` scale-down
/// policy sharing one counter.
pub(crate) fn descriptor_with(
    provider: ServiceProvider,
    source: CounterSource,
    members: Vec<VmId>,
) -> GroupDescriptor {
    let counter = Counter::new("load", source, "metric.value").unwrap();
    let up_condition = Condition::new(counter.id, RelationalOperator::Gt, 50.0, "admin").unwrap();
    let down_condition = Condition::new(counter.id, RelationalOperator::Lt, 20.0, "admin").unwrap();
    let up = policy("up", ScaleAction::ScaleUp, &up_condition);
    let down = policy("down", ScaleAction::ScaleDown, &down_condition);
    let profile = AutoScaleVmProfile::new("zone-1", "template-1", "offering-1", "admin")
        .with_counter_param("snmpcommunity", "public")
        .with_counter_param("snmpport", "161");

    let mut group = AutoScaleVmGroup::new(
        "web",
        LoadBalancerId::new("lb-1"),
        profile.id,
        1,
        10,
        Duration::from_secs(60),
    )
    .with_owner("admin")
    .with_scale_up_policies(vec![up.id])
    .with_scale_down_policies(vec![down.id]);
    group.members = members;
    group.state = VmGroupState::Enabled;

    GroupDescriptor {
        group,
        profile,
        provider,
        policies: vec![
            PolicyDescriptor {
                policy: up,
                conditions: vec![ConditionDescriptor {
                    condition: up_condition,
                    counter: counter.clone(),
                }],
            },
            PolicyDescriptor {
                policy: down,
                conditions: vec![ConditionDescriptor {
                    condition: down_condition,
                    counter,
                }],
            },
        ],
    }
}

/// A repository holding one CPU-driven group wired to in-memory services.
pub(crate) struct Seeded {
    pub(crate) repo: Arc<Repository>,
    pub(crate) group_id: GroupId,
    pub(crate) up_policy: PolicyId,
    pub(crate) down_policy: PolicyId,
}

impl Seeded {
    /// Seeds a group with `members` running VMs, bypassing validation so
    /// tests can start from any state.
    pub(crate) fn new(
        fakes: &InMemoryServices,
        min_members: u32,
        max_members: u32,
        members: usize,
        state: VmGroupState,
    ) -> Self {
        let repo = Arc::new(Repository::new());
        let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, Vec::new());
        let lb_id = descriptor.group.load_balancer_id.clone();
        fakes
            .load_balancers
            .register(lb_id.clone(), ServiceProvider::VirtualRouter, "net-1");

        let mut group = descriptor.group;
        group.min_members = min_members;
        group.max_members = max_members;
        group.state = state;
        for i in 0..members {
            let vm = fakes.vms.place(
                VmId::new(format!("seed-{i}")),
                Some(crate::types::HostId::new("host-1")),
                None,
            );
            fakes.load_balancers.attach(&lb_id, vm.clone());
            group.members.push(vm);
        }

        let up_policy = descriptor.policies[0].policy.id;
        let down_policy = descriptor.policies[1].policy.id;
        for entry in descriptor.policies {
            for c in entry.conditions {
                if repo.counter(&c.counter.id).is_err() {
                    repo.insert_counter(c.counter);
                }
                repo.insert_condition(c.condition);
            }
            repo.insert_policy(entry.policy);
        }
        repo.insert_profile(descriptor.profile);
        let group_id = group.id;
        repo.insert_group(group);

        Self {
            repo,
            group_id,
            up_policy,
            down_policy,
        }
    }

    /// Changes how long scale-down waits before destroying a VM.
    pub(crate) fn set_grace_period(&self, period: Duration) {
        let group = self.repo.group(&self.group_id).unwrap();
        let profile = self
            .repo
            .profile(&group.profile_id)
            .unwrap()
            .with_expunge_grace_period(period);
        self.repo.replace_profile(profile).unwrap();
    }
}
