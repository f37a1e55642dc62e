//! In-memory implementations of the external services.
//!
//! Used by the tests and by embedders that want to run the control loop
//! without a cloud behind it. Each fake can be switched into a failing mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{AutoscaleError, Result};
use crate::group::{GroupDescriptor, VmGroupState};
use crate::services::{
    CreateVmRequest, HostAgent, LoadBalancerService, PerformanceQuery, RouterAgent,
    RouterMetricSpec, RouterMetricValue, ServiceProvider, Services, VmLifecycle, VmPlacement,
    VmStats,
};
use crate::types::{GroupId, HostId, LoadBalancerId, RouterId, VmId};

#[derive(Debug, Clone)]
struct VmRecord {
    hostname: Option<String>,
    placement: VmPlacement,
    running: bool,
}

/// In-memory VM lifecycle service.
#[derive(Debug)]
pub struct InMemoryVmLifecycle {
    vms: RwLock<BTreeMap<VmId, VmRecord>>,
    destroyed: RwLock<Vec<VmId>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    default_host: HostId,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_destroy: AtomicBool,
}

impl Default for InMemoryVmLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVmLifecycle {
    /// Creates a service that places new VMs on `host-1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vms: RwLock::new(BTreeMap::new()),
            destroyed: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            created: AtomicUsize::new(0),
            default_host: HostId::new("host-1"),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
        }
    }

    /// Registers an existing running VM and returns its id.
    pub fn place(&self, vm_id: VmId, host_id: Option<HostId>, last_host_id: Option<HostId>) -> VmId {
        self.vms.write().insert(
            vm_id.clone(),
            VmRecord {
                hostname: None,
                placement: VmPlacement {
                    host_id,
                    last_host_id,
                },
                running: true,
            },
        );
        vm_id
    }

    /// Makes `create_vm` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Makes `start_vm` fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes `destroy_vm` fail.
    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Returns how many VMs `create_vm` produced.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Returns the destroyed VMs in destruction order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<VmId> {
        self.destroyed.read().clone()
    }

    /// Returns true if the VM exists and is running.
    #[must_use]
    pub fn is_running(&self, vm_id: &VmId) -> bool {
        self.vms.read().get(vm_id).is_some_and(|r| r.running)
    }

    /// Returns the hostname a VM was created with.
    #[must_use]
    pub fn hostname(&self, vm_id: &VmId) -> Option<String> {
        self.vms.read().get(vm_id).and_then(|r| r.hostname.clone())
    }
}

impl VmLifecycle for InMemoryVmLifecycle {
    fn create_vm(&self, request: &CreateVmRequest) -> Result<VmId> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AutoscaleError::VmLifecycle {
                message: format!("cannot deploy {}", request.hostname),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let vm_id = VmId::new(format!("vm-{n}"));
        self.vms.write().insert(
            vm_id.clone(),
            VmRecord {
                hostname: Some(request.hostname.clone()),
                placement: VmPlacement {
                    host_id: Some(self.default_host.clone()),
                    last_host_id: None,
                },
                running: false,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(vm_id)
    }

    fn start_vm(&self, vm_id: &VmId) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AutoscaleError::VmLifecycle {
                message: format!("cannot start {vm_id}"),
            });
        }
        let mut vms = self.vms.write();
        let record = vms
            .get_mut(vm_id)
            .ok_or_else(|| AutoscaleError::not_found("vm", vm_id))?;
        record.running = true;
        Ok(())
    }

    fn destroy_vm(&self, vm_id: &VmId, _expunge: bool) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(AutoscaleError::VmLifecycle {
                message: format!("cannot destroy {vm_id}"),
            });
        }
        self.vms
            .write()
            .remove(vm_id)
            .ok_or_else(|| AutoscaleError::not_found("vm", vm_id))?;
        self.destroyed.write().push(vm_id.clone());
        Ok(())
    }

    fn locate_vm(&self, vm_id: &VmId) -> Option<VmPlacement> {
        self.vms.read().get(vm_id).map(|r| r.placement.clone())
    }
}

#[derive(Debug, Clone)]
struct RuleRecord {
    provider: ServiceProvider,
    network_id: String,
    members: Vec<VmId>,
}

/// In-memory load balancer service.
#[derive(Debug, Default)]
pub struct InMemoryLoadBalancer {
    rules: RwLock<HashMap<LoadBalancerId, RuleRecord>>,
    configured: RwLock<Vec<(GroupDescriptor, VmGroupState)>>,
    fail_assign: AtomicBool,
    fail_remove: AtomicBool,
    fail_configure: AtomicBool,
}

impl InMemoryLoadBalancer {
    /// Creates a service with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a load balancer rule.
    pub fn register(&self, lb_id: LoadBalancerId, provider: ServiceProvider, network_id: impl Into<String>) {
        self.rules.write().insert(
            lb_id,
            RuleRecord {
                provider,
                network_id: network_id.into(),
                members: Vec::new(),
            },
        );
    }

    /// Binds a VM to a rule directly.
    pub fn attach(&self, lb_id: &LoadBalancerId, vm_id: VmId) {
        if let Some(rule) = self.rules.write().get_mut(lb_id) {
            rule.members.push(vm_id);
        }
    }

    /// Returns the VMs bound to a rule.
    #[must_use]
    pub fn members_of(&self, lb_id: &LoadBalancerId) -> Vec<VmId> {
        self.rules
            .read()
            .get(lb_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    /// Makes `assign_vms` refuse.
    pub fn set_fail_assign(&self, fail: bool) {
        self.fail_assign.store(fail, Ordering::SeqCst);
    }

    /// Makes `remove_vms` refuse.
    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Makes `configure_group` fail.
    pub fn set_fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    /// Returns every `configure_group` call as (group, prior state).
    #[must_use]
    pub fn configure_calls(&self) -> Vec<(GroupId, VmGroupState)> {
        self.configured
            .read()
            .iter()
            .map(|(descriptor, prior)| (descriptor.group.id, *prior))
            .collect()
    }

    /// Returns the descriptor of the most recent `configure_group` call.
    #[must_use]
    pub fn last_configured(&self) -> Option<GroupDescriptor> {
        self.configured.read().last().map(|(descriptor, _)| descriptor.clone())
    }

    fn with_rule<T>(&self, lb_id: &LoadBalancerId, f: impl FnOnce(&mut RuleRecord) -> T) -> Result<T> {
        let mut rules = self.rules.write();
        let rule = rules
            .get_mut(lb_id)
            .ok_or_else(|| AutoscaleError::not_found("load balancer", lb_id))?;
        Ok(f(rule))
    }
}

impl LoadBalancerService for InMemoryLoadBalancer {
    fn assign_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool> {
        if self.fail_assign.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.with_rule(lb_id, |rule| {
            for vm in vm_ids {
                if !rule.members.contains(vm) {
                    rule.members.push(vm.clone());
                }
            }
            true
        })
    }

    fn remove_vms(&self, lb_id: &LoadBalancerId, vm_ids: &[VmId]) -> Result<bool> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.with_rule(lb_id, |rule| {
            rule.members.retain(|m| !vm_ids.contains(m));
            true
        })
    }

    fn members(&self, lb_id: &LoadBalancerId) -> Result<Vec<VmId>> {
        self.with_rule(lb_id, |rule| rule.members.clone())
    }

    fn service_provider(&self, lb_id: &LoadBalancerId) -> Result<ServiceProvider> {
        self.with_rule(lb_id, |rule| rule.provider)
    }

    fn network_id(&self, lb_id: &LoadBalancerId) -> Result<String> {
        self.with_rule(lb_id, |rule| rule.network_id.clone())
    }

    fn configure_group(&self, descriptor: &GroupDescriptor, prior_state: VmGroupState) -> Result<bool> {
        self.configured.write().push((descriptor.clone(), prior_state));
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(AutoscaleError::Provider {
                message: format!("cannot configure group {}", descriptor.group.id),
            });
        }
        Ok(true)
    }
}

/// In-memory host agent.
#[derive(Debug, Default)]
pub struct InMemoryHostAgent {
    stats: RwLock<HashMap<VmId, VmStats>>,
    answer: RwLock<String>,
    queries: RwLock<Vec<PerformanceQuery>>,
    stats_calls: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryHostAgent {
    /// Creates an agent with no data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the statistics reported for a VM.
    pub fn set_vm_stats(&self, vm_id: VmId, stats: VmStats) {
        self.stats.write().insert(vm_id, stats);
    }

    /// Sets the same CPU utilization for several VMs.
    pub fn set_cpu<'a>(&self, vm_ids: impl IntoIterator<Item = &'a VmId>, cpu_utilization: f64) {
        let mut stats = self.stats.write();
        for vm in vm_ids {
            stats.insert(
                vm.clone(),
                VmStats {
                    cpu_utilization,
                    free_memory_kb: 512.0 * 1024.0,
                    memory_kb: 1024.0 * 1024.0,
                },
            );
        }
    }

    /// Sets the raw answer of performance queries.
    pub fn set_performance_answer(&self, answer: impl Into<String>) {
        *self.answer.write() = answer.into();
    }

    /// Makes every call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns how many statistics batches were requested.
    #[must_use]
    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// Returns the performance queries received.
    #[must_use]
    pub fn queries(&self) -> Vec<PerformanceQuery> {
        self.queries.read().clone()
    }
}

impl HostAgent for InMemoryHostAgent {
    fn get_vm_statistics(
        &self,
        host_id: &HostId,
        vm_ids: &[VmId],
        _timeout: Duration,
    ) -> Result<HashMap<VmId, VmStats>> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AutoscaleError::MetricsError {
                message: format!("host {host_id} unreachable"),
            });
        }
        let stats = self.stats.read();
        Ok(vm_ids
            .iter()
            .filter_map(|vm| stats.get(vm).map(|s| (vm.clone(), *s)))
            .collect())
    }

    fn send_performance_query(&self, query: &PerformanceQuery, _timeout: Duration) -> Result<String> {
        self.queries.write().push(query.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(AutoscaleError::MetricsError {
                message: format!("appliance for {} unreachable", query.load_balancer_id),
            });
        }
        Ok(self.answer.read().clone())
    }
}

/// In-memory virtual router agent.
#[derive(Debug, Default)]
pub struct InMemoryRouterAgent {
    routers: RwLock<HashMap<String, Vec<RouterId>>>,
    metrics: RwLock<Vec<RouterMetricValue>>,
    failing: AtomicBool,
}

impl InMemoryRouterAgent {
    /// Creates an agent with no routers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running router to a network.
    pub fn add_router(&self, network_id: impl Into<String>, router_id: RouterId) {
        self.routers
            .write()
            .entry(network_id.into())
            .or_default()
            .push(router_id);
    }

    /// Sets the values every router reports.
    pub fn set_metrics(&self, metrics: Vec<RouterMetricValue>) {
        *self.metrics.write() = metrics;
    }

    /// Makes metric fetches fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl RouterAgent for InMemoryRouterAgent {
    fn active_routers(&self, network_id: &str) -> Result<Vec<RouterId>> {
        Ok(self
            .routers
            .read()
            .get(network_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_autoscale_metrics(
        &self,
        router_id: &RouterId,
        _lb_id: &LoadBalancerId,
        specs: &[RouterMetricSpec],
        _timeout: Duration,
    ) -> Result<Vec<RouterMetricValue>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AutoscaleError::MetricsError {
                message: format!("router {router_id} timed out"),
            });
        }
        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| {
                specs
                    .iter()
                    .any(|s| s.policy_id == m.policy_id && s.counter_id == m.counter_id)
            })
            .cloned()
            .collect())
    }
}

/// The four in-memory services, kept typed so tests can drive them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServices {
    /// VM lifecycle.
    pub vms: Arc<InMemoryVmLifecycle>,
    /// Load balancer.
    pub load_balancers: Arc<InMemoryLoadBalancer>,
    /// Host agent.
    pub hosts: Arc<InMemoryHostAgent>,
    /// Router agent.
    pub routers: Arc<InMemoryRouterAgent>,
}

impl InMemoryServices {
    /// Creates a fresh set of services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the services as trait objects.
    #[must_use]
    pub fn services(&self) -> Services {
        Services {
            vms: Arc::clone(&self.vms) as Arc<dyn VmLifecycle>,
            load_balancers: Arc::clone(&self.load_balancers) as Arc<dyn LoadBalancerService>,
            hosts: Arc::clone(&self.hosts) as Arc<dyn HostAgent>,
            routers: Arc::clone(&self.routers) as Arc<dyn RouterAgent>,
        }
    }
}
