//! Metrics collection.
//!
//! A [`MetricsSource`] turns one collection path into statistics samples.
//! The [`MetricsCollector`] picks the sources a group's provider uses and
//! writes what they return into the [`StatisticsStore`]. Sources never read
//! the store, and a failed fetch becomes "no data" samples instead of an
//! error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::counter::{CollectionPath, Counter, CounterSource};
use crate::group::GroupDescriptor;
use crate::services::{
    HostAgent, LoadBalancerService, PerformanceQuery, RouterAgent, RouterMetricSpec, Services,
    VmLifecycle, VmStats,
};
use crate::statistics::{Sample, StatisticValueType, StatisticsStore};
use crate::types::{HostId, PolicyId, VmId};

/// A (policy, counter) pair that must be sampled.
#[derive(Debug, Clone)]
pub struct MetricTarget {
    /// Policy the sample is for.
    pub policy_id: PolicyId,
    /// Policy duration.
    pub duration: Duration,
    /// Counter to sample.
    pub counter: Counter,
}

/// Returns the targets of a group collected through `path`, in policy order.
#[must_use]
pub fn targets_for(descriptor: &GroupDescriptor, path: CollectionPath) -> Vec<MetricTarget> {
    descriptor
        .policies
        .iter()
        .flat_map(|p| {
            p.conditions.iter().map(move |c| MetricTarget {
                policy_id: p.policy.id,
                duration: p.policy.duration,
                counter: c.counter.clone(),
            })
        })
        .filter(|t| t.counter.source.collection_path() == path)
        .collect()
}

/// One way of obtaining counter samples.
pub trait MetricsSource: Send + Sync {
    /// The collection path this source serves.
    fn path(&self) -> CollectionPath;

    /// Samples every target of the group on this path.
    fn collect(&self, descriptor: &GroupDescriptor, now: DateTime<Utc>) -> Vec<Sample>;
}

/// Samples hypervisor statistics of each member, one batch per host.
pub struct HostMetricsSource {
    vms: Arc<dyn VmLifecycle>,
    hosts: Arc<dyn HostAgent>,
    timeout: Duration,
}

impl HostMetricsSource {
    /// Creates a host source.
    #[must_use]
    pub fn new(vms: Arc<dyn VmLifecycle>, hosts: Arc<dyn HostAgent>, timeout: Duration) -> Self {
        Self {
            vms,
            hosts,
            timeout,
        }
    }

    fn by_host(&self, members: &[VmId]) -> BTreeMap<Option<HostId>, Vec<VmId>> {
        let mut buckets: BTreeMap<Option<HostId>, Vec<VmId>> = BTreeMap::new();
        for vm in members {
            let host = self
                .vms
                .locate_vm(vm)
                .and_then(|p| p.effective_host().cloned());
            buckets.entry(host).or_default().push(vm.clone());
        }
        buckets
    }
}

/// Converts hypervisor statistics into a percentage for a host counter.
#[must_use]
pub fn host_value(source: CounterSource, stats: &VmStats) -> Option<f64> {
    match source {
        CounterSource::Cpu => {
            if stats.cpu_utilization.is_finite() {
                Some(stats.cpu_utilization.clamp(0.0, 100.0))
            } else {
                None
            }
        }
        CounterSource::Memory => {
            if stats.memory_kb > 0.0 && stats.free_memory_kb.is_finite() {
                let used = (stats.memory_kb - stats.free_memory_kb) / stats.memory_kb * 100.0;
                Some(used.clamp(0.0, 100.0))
            } else {
                None
            }
        }
        _ => None,
    }
}

impl MetricsSource for HostMetricsSource {
    fn path(&self) -> CollectionPath {
        CollectionPath::Host
    }

    fn collect(&self, descriptor: &GroupDescriptor, now: DateTime<Utc>) -> Vec<Sample> {
        let targets = targets_for(descriptor, CollectionPath::Host);
        if targets.is_empty() || descriptor.group.members.is_empty() {
            return Vec::new();
        }

        let mut samples = Vec::new();
        for (host, vms) in self.by_host(&descriptor.group.members) {
            let stats: HashMap<VmId, VmStats> = match &host {
                Some(host_id) => match self.hosts.get_vm_statistics(host_id, &vms, self.timeout) {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!(
                            group = %descriptor.group.id,
                            host = %host_id,
                            error = %e,
                            "failed to fetch vm statistics"
                        );
                        HashMap::new()
                    }
                },
                None => {
                    warn!(
                        group = %descriptor.group.id,
                        vms = vms.len(),
                        "vms have no known host"
                    );
                    HashMap::new()
                }
            };

            for vm in &vms {
                let vm_stats = stats.get(vm);
                for target in &targets {
                    let value = vm_stats.and_then(|s| host_value(target.counter.source, s));
                    samples.push(Sample {
                        policy_id: target.policy_id,
                        counter_id: target.counter.id,
                        resource_id: vm.to_string(),
                        value,
                        value_type: StatisticValueType::InstantVm,
                        at: now,
                    });
                }
            }
        }
        samples
    }
}

/// Samples the virtual routers servicing the group's network.
pub struct RouterMetricsSource {
    load_balancers: Arc<dyn LoadBalancerService>,
    routers: Arc<dyn RouterAgent>,
    timeout: Duration,
}

impl RouterMetricsSource {
    /// Creates a router source.
    #[must_use]
    pub fn new(
        load_balancers: Arc<dyn LoadBalancerService>,
        routers: Arc<dyn RouterAgent>,
        timeout: Duration,
    ) -> Self {
        Self {
            load_balancers,
            routers,
            timeout,
        }
    }
}

fn dummies(targets: &[MetricTarget], resource_id: &str, now: DateTime<Utc>) -> Vec<Sample> {
    targets
        .iter()
        .map(|t| {
            Sample::dummy(
                t.policy_id,
                t.counter.id,
                resource_id,
                StatisticValueType::InstantVmGroup,
                now,
            )
        })
        .collect()
}

impl MetricsSource for RouterMetricsSource {
    fn path(&self) -> CollectionPath {
        CollectionPath::Router
    }

    fn collect(&self, descriptor: &GroupDescriptor, now: DateTime<Utc>) -> Vec<Sample> {
        let targets = targets_for(descriptor, CollectionPath::Router);
        if targets.is_empty() {
            return Vec::new();
        }
        let group_id = descriptor.group.id;
        let lb_id = &descriptor.group.load_balancer_id;

        let routers = self
            .load_balancers
            .network_id(lb_id)
            .and_then(|network| self.routers.active_routers(&network));
        let routers = match routers {
            Ok(routers) if !routers.is_empty() => routers,
            Ok(_) => {
                warn!(group = %group_id, lb = %lb_id, "no active router for load balancer");
                return dummies(&targets, lb_id.as_str(), now);
            }
            Err(e) => {
                warn!(group = %group_id, lb = %lb_id, error = %e, "failed to resolve routers");
                return dummies(&targets, lb_id.as_str(), now);
            }
        };

        let specs: Vec<RouterMetricSpec> = targets
            .iter()
            .map(|t| RouterMetricSpec {
                policy_id: t.policy_id,
                counter_id: t.counter.id,
                counter_value: t.counter.value.clone(),
                duration_secs: t.duration.as_secs(),
            })
            .collect();

        let mut samples = Vec::new();
        for router in routers {
            let values = match self
                .routers
                .get_autoscale_metrics(&router, lb_id, &specs, self.timeout)
            {
                Ok(values) => values,
                Err(e) => {
                    warn!(group = %group_id, router = %router, error = %e, "failed to fetch router metrics");
                    samples.extend(dummies(&targets, router.as_str(), now));
                    continue;
                }
            };

            for target in &targets {
                let found = values
                    .iter()
                    .find(|v| v.policy_id == target.policy_id && v.counter_id == target.counter.id);
                samples.push(match found {
                    Some(v) => Sample::value(
                        target.policy_id,
                        target.counter.id,
                        router.as_str(),
                        v.value,
                        v.value_type,
                        now,
                    ),
                    None => Sample::dummy(
                        target.policy_id,
                        target.counter.id,
                        router.as_str(),
                        StatisticValueType::InstantVmGroup,
                        now,
                    ),
                });
            }
        }
        samples
    }
}

/// Samples an external appliance through a performance query.
pub struct ApplianceMetricsSource {
    hosts: Arc<dyn HostAgent>,
    timeout: Duration,
}

impl ApplianceMetricsSource {
    /// Creates an appliance source.
    #[must_use]
    pub fn new(hosts: Arc<dyn HostAgent>, timeout: Duration) -> Self {
        Self { hosts, timeout }
    }
}

/// Parses a performance query answer into `key -> value`.
///
/// Malformed pairs are skipped.
#[must_use]
pub fn parse_performance_answer(raw: &str) -> HashMap<String, f64> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let (key, value) = token.split_once('=')?;
            match value.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Some((key.trim().to_string(), v)),
                _ => {
                    debug!(token, "skipping malformed performance pair");
                    None
                }
            }
        })
        .collect()
}

impl MetricsSource for ApplianceMetricsSource {
    fn path(&self) -> CollectionPath {
        CollectionPath::Appliance
    }

    fn collect(&self, descriptor: &GroupDescriptor, now: DateTime<Utc>) -> Vec<Sample> {
        let targets = targets_for(descriptor, CollectionPath::Appliance);
        if targets.is_empty() {
            return Vec::new();
        }
        let lb_id = &descriptor.group.load_balancer_id;

        let mut metrics: Vec<String> = targets.iter().map(|t| t.counter.value.clone()).collect();
        metrics.sort();
        metrics.dedup();
        let query = PerformanceQuery {
            load_balancer_id: lb_id.clone(),
            metrics,
            params: descriptor.profile.counter_params.clone(),
        };

        let answer = match self.hosts.send_performance_query(&query, self.timeout) {
            Ok(raw) => parse_performance_answer(&raw),
            Err(e) => {
                warn!(group = %descriptor.group.id, lb = %lb_id, error = %e, "performance query failed");
                return dummies(&targets, lb_id.as_str(), now);
            }
        };

        targets
            .iter()
            .map(|t| Sample {
                policy_id: t.policy_id,
                counter_id: t.counter.id,
                resource_id: lb_id.to_string(),
                value: answer.get(&t.counter.value).copied(),
                value_type: StatisticValueType::InstantVmGroup,
                at: now,
            })
            .collect()
    }
}

/// Selects metric sources by provider and stores what they collect.
pub struct MetricsCollector {
    sources: Vec<Arc<dyn MetricsSource>>,
}

impl MetricsCollector {
    /// Creates a collector with the host, router and appliance sources.
    #[must_use]
    pub fn new(services: &Services, timeout: Duration) -> Self {
        Self::with_sources(vec![
            Arc::new(HostMetricsSource::new(
                Arc::clone(&services.vms),
                Arc::clone(&services.hosts),
                timeout,
            )),
            Arc::new(RouterMetricsSource::new(
                Arc::clone(&services.load_balancers),
                Arc::clone(&services.routers),
                timeout,
            )),
            Arc::new(ApplianceMetricsSource::new(Arc::clone(&services.hosts), timeout)),
        ])
    }

    /// Creates a collector from explicit sources.
    #[must_use]
    pub fn with_sources(sources: Vec<Arc<dyn MetricsSource>>) -> Self {
        Self { sources }
    }

    /// Returns the sources used for a group.
    #[must_use]
    pub fn sources_for(&self, descriptor: &GroupDescriptor) -> Vec<Arc<dyn MetricsSource>> {
        let paths = descriptor.provider.collection_paths();
        self.sources
            .iter()
            .filter(|s| paths.contains(&s.path()))
            .cloned()
            .collect()
    }

    /// Samples the group and writes the samples. Returns the number of rows
    /// written.
    pub fn collect(
        &self,
        descriptor: &GroupDescriptor,
        store: &StatisticsStore,
        now: DateTime<Utc>,
    ) -> usize {
        let samples: Vec<Sample> = self
            .sources_for(descriptor)
            .iter()
            .flat_map(|source| source.collect(descriptor, now))
            .collect();

        let missing = samples.iter().filter(|s| s.value.is_none()).count();
        if missing > 0 {
            debug!(group = %descriptor.group.id, missing, "recorded samples without data");
        }
        store.record_batch(descriptor.group.id, samples)
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("sources", &self.sources.len())
            .finish()
    }
}
