//! Scaling executor.
//!
//! Scale operations take the group from `Enabled`/`Disabled` to `Scaling`
//! through [`Repository::try_transition`] and always put the prior state back
//! when they finish, whatever the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{AutoscaleError, Result};
use crate::group::{VmGroupState, generate_hostname};
use crate::repository::Repository;
use crate::services::{CreateVmRequest, Services};
use crate::types::{GroupId, LoadBalancerId, PolicyId, VmId};

const SCALABLE: [VmGroupState; 2] = [VmGroupState::Enabled, VmGroupState::Disabled];

/// Performs scale-up and scale-down against a group.
#[derive(Debug, Clone)]
pub struct ScalingExecutor {
    repo: Arc<Repository>,
    services: Services,
    hostname_prefix: String,
}

impl ScalingExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(repo: Arc<Repository>, services: Services, hostname_prefix: impl Into<String>) -> Self {
        Self {
            repo,
            services,
            hostname_prefix: hostname_prefix.into(),
        }
    }

    /// Adds `count` members now.
    ///
    /// # Errors
    ///
    /// See [`Self::scale_up_at`].
    pub fn scale_up(&self, group_id: &GroupId, count: u32, policy: Option<PolicyId>) -> Result<u32> {
        self.scale_up_at(group_id, count, policy, Utc::now())
    }

    /// Adds `count` members, refreshing the triggering policy's quiet time
    /// with `now` after each successful member. Returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientCapacity` if the group would exceed its maximum,
    /// `StateConflict` if another operation holds the group, or the failure
    /// that stopped the loop. A member that was created but not load
    /// balanced is destroyed before returning.
    pub fn scale_up_at(
        &self,
        group_id: &GroupId,
        count: u32,
        policy: Option<PolicyId>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        self.check_room_for(group_id, count)?;

        let prior = self
            .repo
            .try_transition(group_id, &SCALABLE, VmGroupState::Scaling)?;
        let result = self
            .check_room_for(group_id, count)
            .and_then(|()| self.add_members(group_id, count, policy, now));
        self.restore_state(group_id, prior);
        result
    }

    fn check_room_for(&self, group_id: &GroupId, count: u32) -> Result<()> {
        let group = self.repo.group(group_id)?;
        let members = group.member_count();
        if members.saturating_add(count) > group.max_members {
            return Err(AutoscaleError::InsufficientCapacity {
                reason: format!(
                    "group {group_id} has {members} of {} members, cannot add {count}",
                    group.max_members
                ),
            });
        }
        Ok(())
    }

    fn add_members(
        &self,
        group_id: &GroupId,
        count: u32,
        policy: Option<PolicyId>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let group = self.repo.group(group_id)?;
        let profile = self.repo.profile(&group.profile_id)?;
        let network_id = self.services.load_balancers.network_id(&group.load_balancer_id)?;

        let mut added = 0;
        for _ in 0..count {
            let seq = self.repo.next_vm_seq(group_id)?;
            let request = CreateVmRequest {
                zone_id: profile.zone_id.clone(),
                service_offering_id: profile.service_offering_id.clone(),
                template_id: profile.template_id.clone(),
                owner: group.owner.clone(),
                hostname: generate_hostname(&self.hostname_prefix, &group.name, seq),
                network_id: network_id.clone(),
                deploy_params: profile.deploy_params.clone(),
                user_data: profile.user_data.clone(),
            };

            let vm_id = self.services.vms.create_vm(&request).inspect_err(|e| {
                error!(group = %group_id, hostname = %request.hostname, error = %e, "failed to create vm");
            })?;
            self.repo.add_member(group_id, vm_id.clone())?;

            if let Err(e) = self.start_and_balance(&group.load_balancer_id, &vm_id) {
                error!(group = %group_id, vm = %vm_id, error = %e, "scale up failed, destroying vm");
                self.discard(group_id, &vm_id);
                return Err(e);
            }

            if let Some(policy_id) = policy {
                self.repo.record_quiet_time(&policy_id, now)?;
            }
            added += 1;
            info!(group = %group_id, vm = %vm_id, hostname = %request.hostname, "scaled up");
        }
        Ok(added)
    }

    fn start_and_balance(&self, lb_id: &LoadBalancerId, vm_id: &VmId) -> Result<()> {
        self.services.vms.start_vm(vm_id)?;
        let assigned = self
            .services
            .load_balancers
            .assign_vms(lb_id, std::slice::from_ref(vm_id))?;
        if !assigned {
            return Err(AutoscaleError::Provider {
                message: format!("load balancer {lb_id} refused vm {vm_id}"),
            });
        }
        Ok(())
    }

    fn discard(&self, group_id: &GroupId, vm_id: &VmId) {
        if let Err(e) = self.repo.remove_member(group_id, vm_id) {
            warn!(group = %group_id, vm = %vm_id, error = %e, "failed to drop membership");
        }
        if let Err(e) = self.services.vms.destroy_vm(vm_id, true) {
            error!(group = %group_id, vm = %vm_id, error = %e, "failed to destroy orphaned vm");
        }
    }

    /// Removes one member now.
    ///
    /// # Errors
    ///
    /// See [`Self::scale_down_at`].
    pub fn scale_down(&self, group_id: &GroupId, policy: Option<PolicyId>) -> Result<VmId> {
        self.scale_down_at(group_id, policy, Utc::now())
    }

    /// Removes the first load balanced member of the group, then destroys it
    /// once the profile's grace period has passed. Returns the removed VM.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientCapacity` if the group is at its minimum,
    /// `StateConflict` if another operation holds the group, or the failure
    /// that stopped the operation. Nothing is destroyed if the VM could not
    /// be detached from the load balancer.
    pub fn scale_down_at(
        &self,
        group_id: &GroupId,
        policy: Option<PolicyId>,
        now: DateTime<Utc>,
    ) -> Result<VmId> {
        self.check_above_min(group_id)?;

        let prior = self
            .repo
            .try_transition(group_id, &SCALABLE, VmGroupState::Scaling)?;
        let result = self
            .check_above_min(group_id)
            .and_then(|()| self.remove_member(group_id, policy, now));
        self.restore_state(group_id, prior);
        result
    }

    fn check_above_min(&self, group_id: &GroupId) -> Result<()> {
        let group = self.repo.group(group_id)?;
        if group.member_count() <= group.min_members {
            return Err(AutoscaleError::InsufficientCapacity {
                reason: format!(
                    "group {group_id} is at its minimum of {} members",
                    group.min_members
                ),
            });
        }
        Ok(())
    }

    fn remove_member(&self, group_id: &GroupId, policy: Option<PolicyId>, now: DateTime<Utc>) -> Result<VmId> {
        let group = self.repo.group(group_id)?;
        let profile = self.repo.profile(&group.profile_id)?;
        let lb_id = &group.load_balancer_id;

        let vm_id = self
            .services
            .load_balancers
            .members(lb_id)?
            .into_iter()
            .find(|vm| group.members.contains(vm))
            .ok_or_else(|| AutoscaleError::Internal {
                message: format!("group {group_id} has no load balanced member to remove"),
            })?;

        let removed = self
            .services
            .load_balancers
            .remove_vms(lb_id, std::slice::from_ref(&vm_id))
            .inspect_err(|e| {
                error!(group = %group_id, vm = %vm_id, error = %e, "failed to detach vm");
            })?;
        if !removed {
            return Err(AutoscaleError::Provider {
                message: format!("load balancer {lb_id} refused to release vm {vm_id}"),
            });
        }

        self.repo.remove_member(group_id, &vm_id)?;
        if let Some(policy_id) = policy {
            self.repo.record_quiet_time(&policy_id, now)?;
        }
        info!(group = %group_id, vm = %vm_id, "scaled down");

        if !profile.expunge_vm_grace_period.is_zero() {
            std::thread::sleep(profile.expunge_vm_grace_period);
        }
        self.services.vms.destroy_vm(&vm_id, true).inspect_err(|e| {
            error!(group = %group_id, vm = %vm_id, error = %e, "failed to destroy removed vm");
        })?;
        Ok(vm_id)
    }

    fn restore_state(&self, group_id: &GroupId, prior: VmGroupState) {
        if let Err(e) = self
            .repo
            .try_transition(group_id, &[VmGroupState::Scaling], prior)
        {
            error!(group = %group_id, state = %prior, error = %e, "failed to restore group state");
        }
    }
}
