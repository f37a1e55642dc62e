//! Interfaces of the external services the control loop calls.
//!
//! All calls are blocking. The scheduler runs ticks on blocking threads, so an
//! implementation may perform network round trips directly. Metric calls get
//! an explicit wait allowance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::counter::{CollectionPath, CounterSource};
use crate::error::Result;
use crate::group::{GroupDescriptor, VmGroupState};
use crate::profile::DeployParams;
use crate::statistics::StatisticValueType;
use crate::types::{CounterId, HostId, LoadBalancerId, PolicyId, RouterId, VmId};

/// Backend servicing a load balancer rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceProvider {
    /// Isolated-network virtual router.
    VirtualRouter,
    /// VPC virtual router.
    VpcVirtualRouter,
    /// External load balancing appliance.
    Netscaler,
}

impl ServiceProvider {
    /// Returns true if this provider can collect the given counter source.
    #[must_use]
    pub const fn supports(self, source: CounterSource) -> bool {
        match self {
            Self::VirtualRouter | Self::VpcVirtualRouter => matches!(
                source,
                CounterSource::Cpu | CounterSource::Memory | CounterSource::VirtualRouter
            ),
            Self::Netscaler => matches!(source, CounterSource::Netscaler | CounterSource::Snmp),
        }
    }

    /// Returns the collection paths this provider uses.
    #[must_use]
    pub const fn collection_paths(self) -> &'static [CollectionPath] {
        match self {
            Self::VirtualRouter | Self::VpcVirtualRouter => {
                &[CollectionPath::Host, CollectionPath::Router]
            }
            Self::Netscaler => &[CollectionPath::Appliance],
        }
    }
}

impl std::fmt::Display for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VirtualRouter => "VirtualRouter",
            Self::VpcVirtualRouter => "VpcVirtualRouter",
            Self::Netscaler => "Netscaler",
        };
        f.write_str(s)
    }
}

/// Everything needed to provision one group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// Target zone.
    pub zone_id: String,
    /// Compute offering.
    pub service_offering_id: String,
    /// Deployment template.
    pub template_id: String,
    /// Owning account.
    pub owner: String,
    /// Generated hostname.
    pub hostname: String,
    /// Network of the group's load balancer.
    pub network_id: String,
    /// Deployment overrides.
    pub deploy_params: DeployParams,
    /// User data.
    pub user_data: Option<String>,
}

/// Where a VM currently runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPlacement {
    /// Current host, if running.
    pub host_id: Option<HostId>,
    /// Previous host, known during migrations.
    pub last_host_id: Option<HostId>,
}

impl VmPlacement {
    /// Returns the host to query, preferring the current one.
    #[must_use]
    pub fn effective_host(&self) -> Option<&HostId> {
        self.host_id.as_ref().or(self.last_host_id.as_ref())
    }
}

/// VM provisioning and lifecycle.
pub trait VmLifecycle: Send + Sync {
    /// Provisions a VM without starting it.
    fn create_vm(&self, request: &CreateVmRequest) -> Result<VmId>;

    /// Starts a provisioned VM.
    fn start_vm(&self, vm_id: &VmId) -> Result<()>;

    /// Destroys a VM, optionally expunging it immediately.
    fn destroy_vm(&self, vm_id: &VmId, expunge: bool) -> Result<()>;

    /// Returns the VM's placement, or `None` if the VM is unknown.
    fn locate_vm(&self, vm_id: &VmId) -> Option<VmPlacement>;
}

/// Load balancer rule assignment and provider configuration.
pub trait LoadBalancerService: Send + Sync {
    /// Adds VMs to the rule. `Ok(false)` means the provider refused.
    fn assign_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool>;

    /// Removes VMs from the rule. `Ok(false)` means the provider refused.
    fn remove_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool>;

    /// Returns the VMs currently assigned to the rule, in assignment order.
    fn members(&self, lb_id: &LoadBalancerId) -> Result<Vec<VmId>>;

    /// Returns the provider servicing the rule.
    fn service_provider(&self, lb_id: &LoadBalancerId) -> Result<ServiceProvider>;

    /// Returns the network the rule lives in.
    fn network_id(&self, lb_id: &LoadBalancerId) -> Result<String>;

    /// Pushes the group's configuration to the provider.
    fn configure_group(&self, descriptor: &GroupDescriptor, prior_state: VmGroupState) -> Result<bool>;
}

/// Hypervisor-reported statistics of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VmStats {
    /// CPU utilization as a fraction of 100.
    pub cpu_utilization: f64,
    /// Free memory in KB as seen by the guest.
    pub free_memory_kb: f64,
    /// Configured memory in KB.
    pub memory_kb: f64,
}

/// Performance query against an external appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceQuery {
    /// Load balancer rule whose appliance is queried.
    pub load_balancer_id: LoadBalancerId,
    /// Counter keys to report.
    pub metrics: Vec<String>,
    /// Provider parameters (SNMP community, port, ...).
    pub params: BTreeMap<String, String>,
}

/// Host agent communication.
pub trait HostAgent: Send + Sync {
    /// Fetches statistics of a batch of VMs on one host.
    fn get_vm_statistics(
        &self,
        host_id: &HostId,
        vm_ids: &[VmId],
        timeout: Duration,
    ) -> Result<HashMap<VmId, VmStats>>;

    /// Sends a performance query and returns the raw answer.
    ///
    /// The answer is a list of `key=value` pairs separated by commas,
    /// semicolons or whitespace.
    fn send_performance_query(&self, query: &PerformanceQuery, timeout: Duration) -> Result<String>;
}

/// A metric the router should report for one (policy, counter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMetricSpec {
    /// Policy the value is for.
    pub policy_id: PolicyId,
    /// Counter measured.
    pub counter_id: CounterId,
    /// Provider key of the counter.
    pub counter_value: String,
    /// Policy duration in seconds.
    pub duration_secs: u64,
}

/// A value reported by a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterMetricValue {
    /// Policy the value is for.
    pub policy_id: PolicyId,
    /// Counter measured.
    pub counter_id: CounterId,
    /// Reported value.
    pub value: f64,
    /// Interpretation of the value.
    pub value_type: StatisticValueType,
}

/// Virtual router agent communication.
pub trait RouterAgent: Send + Sync {
    /// Returns the running routers of a network.
    fn active_routers(&self, network_id: &str) -> Result<Vec<RouterId>>;

    /// Fetches autoscale metrics from one router.
    fn get_autoscale_metrics(
        &self,
        router_id: &RouterId,
        lb_id: &LoadBalancerId,
        specs: &[RouterMetricSpec],
        timeout: Duration,
    ) -> Result<Vec<RouterMetricValue>>;
}

/// Handles to every external service the control loop talks to.
#[derive(Clone)]
pub struct Services {
    /// VM provisioning and lifecycle.
    pub vms: Arc<dyn VmLifecycle>,
    /// Load balancer rules and provider configuration.
    pub load_balancers: Arc<dyn LoadBalancerService>,
    /// Host agents.
    pub hosts: Arc<dyn HostAgent>,
    /// Virtual router agents.
    pub routers: Arc<dyn RouterAgent>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
