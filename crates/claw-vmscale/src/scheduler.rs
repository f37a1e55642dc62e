//! Per-group timers and the bulk sweep.
//!
//! Every enabled group owns one timer task. Ticks run on the blocking pool
//! because monitors call external services synchronously. A per-group guard
//! makes sure at most one tick of a group runs at a time; a tick that finds
//! the guard held is skipped, not queued.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AutoscaleConfig;
use crate::group::VmGroupState;
use crate::monitor::{GroupMonitor, TickOutcome};
use crate::repository::Repository;
use crate::types::GroupId;

/// Result of one group's tick during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickStatus {
    /// The tick ran.
    Completed(TickOutcomeKind),
    /// Another tick of the group was in flight.
    Busy,
    /// The tick failed.
    Failed(String),
}

/// Serializable summary of a [`TickOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcomeKind {
    /// Nothing to do.
    Skipped,
    /// Bounds were reconciled.
    Reconciled,
    /// No policy held.
    Idle,
    /// A policy's action ran.
    Scaled,
}

impl From<TickOutcome> for TickOutcomeKind {
    fn from(outcome: TickOutcome) -> Self {
        match outcome {
            TickOutcome::Skipped => Self::Skipped,
            TickOutcome::Reconciled { .. } => Self::Reconciled,
            TickOutcome::Idle => Self::Idle,
            TickOutcome::Scaled(_) => Self::Scaled,
        }
    }
}

/// Per-group results of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Status of each swept group.
    pub results: BTreeMap<GroupId, TickStatus>,
}

impl SweepReport {
    /// Number of groups whose tick ran.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.results
            .values()
            .filter(|s| matches!(s, TickStatus::Completed(_)))
            .count()
    }

    /// Number of groups whose tick failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .values()
            .filter(|s| matches!(s, TickStatus::Failed(_)))
            .count()
    }
}

#[derive(Debug)]
struct Ticks {
    monitor: Arc<GroupMonitor>,
    guards: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl Ticks {
    fn guard(&self, group_id: &GroupId) -> Arc<Mutex<()>> {
        Arc::clone(self.guards.lock().entry(*group_id).or_default())
    }

    fn forget(&self, group_id: &GroupId) {
        self.guards.lock().remove(group_id);
    }

    fn run(&self, group_id: &GroupId) -> TickStatus {
        let guard = self.guard(group_id);
        let Some(_held) = guard.try_lock() else {
            debug!(group = %group_id, "tick already in flight, skipping");
            return TickStatus::Busy;
        };
        match self.monitor.check_group(group_id) {
            Ok(outcome) => TickStatus::Completed(outcome.into()),
            Err(e) => {
                warn!(group = %group_id, error = %e, "group tick failed");
                TickStatus::Failed(e.to_string())
            }
        }
    }
}

#[derive(Debug)]
struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of per-group timer tasks.
#[derive(Debug)]
struct Timers {
    repo: Arc<Repository>,
    ticks: Arc<Ticks>,
    runtime: Handle,
    handles: Mutex<HashMap<GroupId, TimerHandle>>,
}

impl Timers {
    fn schedule(&self, group_id: GroupId, interval: Duration) -> bool {
        let mut handles = self.handles.lock();
        if handles.contains_key(&group_id) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ticks = Arc::clone(&self.ticks);
        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let ticks = Arc::clone(&ticks);
                if let Err(e) = tokio::task::spawn_blocking(move || ticks.run(&group_id)).await {
                    warn!(group = %group_id, error = %e, "group tick panicked");
                }
            }
            debug!(group = %group_id, "group timer stopped");
        });

        handles.insert(group_id, TimerHandle { cancel, task });
        info!(group = %group_id, interval_secs = interval.as_secs(), "group timer started");
        true
    }

    fn cancel(&self, group_id: &GroupId) -> bool {
        let Some(handle) = self.handles.lock().remove(group_id) else {
            return false;
        };
        handle.cancel.cancel();
        info!(group = %group_id, "group timer cancelled");
        true
    }

    fn release(&self, group_id: &GroupId) {
        self.cancel(group_id);
        self.ticks.forget(group_id);
    }

    fn contains(&self, group_id: &GroupId) -> bool {
        self.handles.lock().contains_key(group_id)
    }

    fn ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.handles.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    fn reconcile(&self) -> (usize, usize) {
        let groups = self.repo.groups();
        let mut started = 0;
        let mut stopped = 0;

        for group in &groups {
            let scheduled = self.contains(&group.id);
            match group.state {
                VmGroupState::Enabled if !scheduled => {
                    if self.schedule(group.id, group.interval) {
                        started += 1;
                    }
                }
                VmGroupState::Disabled | VmGroupState::New | VmGroupState::Revoke if scheduled => {
                    if self.cancel(&group.id) {
                        stopped += 1;
                    }
                }
                _ => {}
            }
        }

        for id in self.ids() {
            if !groups.iter().any(|g| g.id == id) {
                self.release(&id);
                stopped += 1;
            }
        }

        if started + stopped > 0 {
            info!(started, stopped, "reconciled group timers");
        }
        (started, stopped)
    }

    fn drain(&self) -> Vec<TimerHandle> {
        self.handles.lock().drain().map(|(_, h)| h).collect()
    }
}

/// Owns the per-group timers and runs sweeps.
#[derive(Debug)]
pub struct AutoscaleScheduler {
    repo: Arc<Repository>,
    ticks: Arc<Ticks>,
    runtime: Handle,
    timers: Arc<Timers>,
    sweep: Mutex<Option<TimerHandle>>,
    sweep_workers: usize,
    sweep_queue_capacity: usize,
    stats_interval: Option<Duration>,
}

impl AutoscaleScheduler {
    /// Creates a scheduler spawning its tasks on `runtime`.
    #[must_use]
    pub fn new(
        repo: Arc<Repository>,
        monitor: Arc<GroupMonitor>,
        config: &AutoscaleConfig,
        runtime: Handle,
    ) -> Self {
        let ticks = Arc::new(Ticks {
            monitor,
            guards: Mutex::new(HashMap::new()),
        });
        let timers = Arc::new(Timers {
            repo: Arc::clone(&repo),
            ticks: Arc::clone(&ticks),
            runtime: runtime.clone(),
            handles: Mutex::new(HashMap::new()),
        });
        Self {
            repo,
            ticks,
            runtime,
            timers,
            sweep: Mutex::new(None),
            sweep_workers: config.sweep_workers.max(1),
            sweep_queue_capacity: config.sweep_queue_capacity.max(1),
            stats_interval: config.stats_interval(),
        }
    }

    /// Starts the timer of a group. Returns false if one is already running.
    pub fn schedule(&self, group_id: GroupId, interval: Duration) -> bool {
        self.timers.schedule(group_id, interval)
    }

    /// Stops the timer of a group. An in-flight tick finishes. Returns false
    /// if no timer was running.
    pub fn cancel(&self, group_id: &GroupId) -> bool {
        self.timers.cancel(group_id)
    }

    /// Cancels the timer of a deleted group and drops its tick guard.
    pub fn release(&self, group_id: &GroupId) {
        self.timers.release(group_id);
    }

    /// Returns true if the group has a running timer.
    #[must_use]
    pub fn is_scheduled(&self, group_id: &GroupId) -> bool {
        self.timers.contains(group_id)
    }

    /// Returns the groups with a running timer.
    #[must_use]
    pub fn scheduled_groups(&self) -> Vec<GroupId> {
        self.timers.ids()
    }

    /// Starts timers for enabled groups that lack one and stops timers of
    /// groups that are gone or no longer enabled. Returns (started, stopped).
    pub fn reconcile_timers(&self) -> (usize, usize) {
        self.timers.reconcile()
    }

    /// Runs one tick of every enabled group on a bounded worker pool.
    /// Individual failures are reported, never propagated.
    pub async fn check_all_groups(&self) -> SweepReport {
        sweep(
            &self.repo,
            &self.ticks,
            self.sweep_workers,
            self.sweep_queue_capacity,
        )
        .await
    }

    /// Starts the periodic sweep when a stats interval is configured. Each
    /// round first reconciles the timers with group states. Returns false if
    /// the sweep is disabled or already running.
    pub fn start_sweep(&self) -> bool {
        let Some(period) = self.stats_interval else {
            debug!("periodic sweep disabled");
            return false;
        };
        let mut slot = self.sweep.lock();
        if slot.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ctx = SweepContext {
            timers: Arc::clone(&self.timers),
            workers: self.sweep_workers,
            capacity: self.sweep_queue_capacity,
        };
        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(period) => {}
                }
                ctx.timers.reconcile();
                let report = sweep(&ctx.timers.repo, &ctx.timers.ticks, ctx.workers, ctx.capacity).await;
                debug!(
                    groups = report.results.len(),
                    completed = report.completed(),
                    failed = report.failed(),
                    "periodic sweep finished"
                );
            }
        });

        *slot = Some(TimerHandle { cancel, task });
        info!(period_secs = period.as_secs(), "periodic sweep started");
        true
    }

    /// Stops the sweep and every timer, waiting for in-flight ticks.
    pub async fn shutdown(&self) {
        let sweep = self.sweep.lock().take();
        if let Some(handle) = sweep {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "sweep task ended abnormally");
            }
        }

        let handles = self.timers.drain();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                warn!(error = %e, "timer task ended abnormally");
            }
        }
        info!("autoscale scheduler stopped");
    }
}

impl Drop for AutoscaleScheduler {
    fn drop(&mut self) {
        for handle in self.timers.handles.lock().values() {
            handle.cancel.cancel();
        }
        if let Some(handle) = self.sweep.get_mut() {
            handle.cancel.cancel();
        }
    }
}

struct SweepContext {
    timers: Arc<Timers>,
    workers: usize,
    capacity: usize,
}

async fn sweep(repo: &Repository, ticks: &Arc<Ticks>, workers: usize, capacity: usize) -> SweepReport {
    let ids: Vec<GroupId> = repo
        .groups()
        .into_iter()
        .filter(|g| g.state == VmGroupState::Enabled)
        .map(|g| g.id)
        .collect();
    let mut report = SweepReport::default();
    if ids.is_empty() {
        return report;
    }

    let permits = Arc::new(Semaphore::new(workers));
    let (tx, mut rx) = mpsc::channel::<(GroupId, TickStatus)>(capacity);
    let ticks = Arc::clone(ticks);
    let producer = tokio::spawn(async move {
        for id in ids {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let tx = tx.clone();
            let ticks = Arc::clone(&ticks);
            tokio::task::spawn_blocking(move || {
                let status = ticks.run(&id);
                drop(permit);
                if tx.blocking_send((id, status)).is_err() {
                    debug!(group = %id, "sweep receiver gone");
                }
            });
        }
    });

    while let Some((id, status)) = rx.recv().await {
        report.results.insert(id, status);
    }
    if let Err(e) = producer.await {
        warn!(error = %e, "sweep producer ended abnormally");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryServices;
    use crate::statistics::StatisticsStore;
    use crate::test_support::Seeded;

    fn scheduler(seeded: &Seeded, fakes: &InMemoryServices) -> AutoscaleScheduler {
        let config = AutoscaleConfig::default();
        let monitor = GroupMonitor::new(
            Arc::clone(&seeded.repo),
            Arc::new(StatisticsStore::new()),
            fakes.services(),
            &config,
        );
        AutoscaleScheduler::new(
            Arc::clone(&seeded.repo),
            Arc::new(monitor),
            &config,
            Handle::current(),
        )
    }

    fn busy_members(seeded: &Seeded, fakes: &InMemoryServices, cpu: f64) {
        let members = seeded.repo.group(&seeded.group_id).unwrap().members;
        fakes.hosts.set_cpu(&members, cpu);
    }

    mod registry_tests {
        use super::*;

        #[tokio::test]
        async fn schedule_and_cancel() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            let scheduler = scheduler(&seeded, &fakes);

            assert!(scheduler.schedule(seeded.group_id, Duration::from_secs(60)));
            assert!(!scheduler.schedule(seeded.group_id, Duration::from_secs(60)));
            assert!(scheduler.is_scheduled(&seeded.group_id));
            assert_eq!(scheduler.scheduled_groups(), vec![seeded.group_id]);

            assert!(scheduler.cancel(&seeded.group_id));
            assert!(!scheduler.cancel(&seeded.group_id));
            assert!(scheduler.scheduled_groups().is_empty());
        }

        #[tokio::test]
        async fn timer_runs_ticks() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            busy_members(&seeded, &fakes, 30.0);
            let scheduler = scheduler(&seeded, &fakes);

            scheduler.schedule(seeded.group_id, Duration::from_millis(10));
            tokio::time::sleep(Duration::from_millis(200)).await;
            scheduler.shutdown().await;

            assert!(seeded.repo.group(&seeded.group_id).unwrap().last_interval.is_some());
            assert!(!scheduler.is_scheduled(&seeded.group_id));
        }

        #[tokio::test]
        async fn reconcile_follows_group_state() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            let scheduler = scheduler(&seeded, &fakes);

            assert_eq!(scheduler.reconcile_timers(), (1, 0));
            assert!(scheduler.is_scheduled(&seeded.group_id));

            seeded
                .repo
                .try_transition(&seeded.group_id, &[VmGroupState::Enabled], VmGroupState::Disabled)
                .unwrap();
            assert_eq!(scheduler.reconcile_timers(), (0, 1));
            assert!(!scheduler.is_scheduled(&seeded.group_id));
        }

        #[tokio::test]
        async fn sweep_disabled_without_interval() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            let config = AutoscaleConfig::default().with_stats_interval_secs(0);
            let monitor = GroupMonitor::new(
                Arc::clone(&seeded.repo),
                Arc::new(StatisticsStore::new()),
                fakes.services(),
                &config,
            );
            let scheduler = AutoscaleScheduler::new(
                Arc::clone(&seeded.repo),
                Arc::new(monitor),
                &config,
                Handle::current(),
            );
            assert!(!scheduler.start_sweep());
        }
    }

    mod sweep_tests {
        use super::*;

        #[tokio::test]
        async fn reports_each_enabled_group() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            busy_members(&seeded, &fakes, 30.0);
            let scheduler = scheduler(&seeded, &fakes);

            let report = scheduler.check_all_groups().await;
            assert_eq!(
                report.results.get(&seeded.group_id),
                Some(&TickStatus::Completed(TickOutcomeKind::Idle))
            );
            assert_eq!(report.completed(), 1);
        }

        #[tokio::test]
        async fn failures_are_reported_not_raised() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            busy_members(&seeded, &fakes, 90.0);
            fakes.vms.set_fail_create(true);
            let scheduler = scheduler(&seeded, &fakes);

            let report = scheduler.check_all_groups().await;
            assert_eq!(report.failed(), 1);
        }

        #[tokio::test]
        async fn disabled_groups_are_not_swept() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Disabled);
            let scheduler = scheduler(&seeded, &fakes);

            assert!(scheduler.check_all_groups().await.results.is_empty());
        }

        #[tokio::test]
        async fn periodic_sweep_starts_missing_timers() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            busy_members(&seeded, &fakes, 30.0);
            let config = AutoscaleConfig::default().with_stats_interval_secs(1);
            let monitor = GroupMonitor::new(
                Arc::clone(&seeded.repo),
                Arc::new(StatisticsStore::new()),
                fakes.services(),
                &config,
            );
            let scheduler = AutoscaleScheduler::new(
                Arc::clone(&seeded.repo),
                Arc::new(monitor),
                &config,
                Handle::current(),
            );

            assert!(scheduler.start_sweep());
            assert!(!scheduler.start_sweep());
            tokio::time::sleep(Duration::from_millis(1500)).await;

            assert!(scheduler.is_scheduled(&seeded.group_id));
            assert!(seeded.repo.group(&seeded.group_id).unwrap().last_interval.is_some());
            scheduler.shutdown().await;
            assert!(scheduler.scheduled_groups().is_empty());
        }

        #[tokio::test]
        async fn held_guard_skips_tick() {
            let fakes = InMemoryServices::new();
            let seeded = Seeded::new(&fakes, 1, 5, 2, VmGroupState::Enabled);
            let scheduler = scheduler(&seeded, &fakes);

            let guard = scheduler.ticks.guard(&seeded.group_id);
            let _held = guard.lock();
            let report = scheduler.check_all_groups().await;
            assert_eq!(report.results.get(&seeded.group_id), Some(&TickStatus::Busy));
        }
    }
}
