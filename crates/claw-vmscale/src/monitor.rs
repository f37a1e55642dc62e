//! One control-loop tick for a group.
//!
//! A tick reconciles membership with the group's bounds, samples metrics,
//! evaluates policies, purges statistics no policy can read any more and
//! finally executes the decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::collector::MetricsCollector;
use crate::config::AutoscaleConfig;
use crate::decision::{Decision, DecisionEngine};
use crate::error::Result;
use crate::executor::ScalingExecutor;
use crate::group::{AutoScaleVmGroup, VmGroupState};
use crate::policy::ScaleAction;
use crate::repository::Repository;
use crate::services::Services;
use crate::statistics::StatisticsStore;
use crate::types::GroupId;

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The group is not enabled or its interval has not elapsed.
    Skipped,
    /// Membership was brought back within bounds; no policy was evaluated.
    Reconciled {
        /// Members added to reach the minimum.
        added: u32,
        /// Members removed to get under the maximum.
        removed: u32,
    },
    /// No policy held.
    Idle,
    /// A policy held and its action was executed.
    Scaled(Decision),
}

/// Runs control-loop ticks.
#[derive(Debug)]
pub struct GroupMonitor {
    repo: Arc<Repository>,
    stats: Arc<StatisticsStore>,
    services: Services,
    collector: MetricsCollector,
    engine: DecisionEngine,
    executor: ScalingExecutor,
}

impl GroupMonitor {
    /// Creates a monitor over shared records and statistics.
    #[must_use]
    pub fn new(
        repo: Arc<Repository>,
        stats: Arc<StatisticsStore>,
        services: Services,
        config: &AutoscaleConfig,
    ) -> Self {
        let collector = MetricsCollector::new(&services, config.metrics_timeout());
        let executor = ScalingExecutor::new(
            Arc::clone(&repo),
            services.clone(),
            config.hostname_prefix.clone(),
        );
        Self {
            repo,
            stats,
            services,
            collector,
            engine: DecisionEngine::new(config.stats_cleanup_delay()),
            executor,
        }
    }

    /// Replaces the metric sources.
    #[must_use]
    pub fn with_collector(mut self, collector: MetricsCollector) -> Self {
        self.collector = collector;
        self
    }

    /// Returns the executor used for scale actions.
    #[must_use]
    pub fn executor(&self) -> &ScalingExecutor {
        &self.executor
    }

    /// Runs one tick now.
    ///
    /// # Errors
    ///
    /// See [`Self::check_group_at`].
    pub fn check_group(&self, group_id: &GroupId) -> Result<TickOutcome> {
        self.check_group_at(group_id, Utc::now())
    }

    /// Runs one tick at a specific time.
    ///
    /// # Errors
    ///
    /// Returns an error if the group or anything it references is missing,
    /// if the provider cannot be resolved, or if a scale action fails.
    pub fn check_group_at(&self, group_id: &GroupId, now: DateTime<Utc>) -> Result<TickOutcome> {
        let group = self.repo.group(group_id)?;
        if group.state != VmGroupState::Enabled {
            debug!(group = %group_id, state = %group.state, "group not enabled, skipping tick");
            return Ok(TickOutcome::Skipped);
        }
        if !group.interval_elapsed(now) {
            return Ok(TickOutcome::Skipped);
        }
        self.repo.set_last_interval(group_id, now)?;

        if let Some(outcome) = self.reconcile(&group)? {
            return Ok(outcome);
        }

        let provider = self
            .services
            .load_balancers
            .service_provider(&group.load_balancer_id)?;
        let descriptor = self.repo.describe_group(group_id, provider)?;

        self.collector.collect(&descriptor, &self.stats, now);
        let decision = self.engine.evaluate_at(&descriptor, &self.stats, now);
        self.engine.cleanup_at(&descriptor, &self.stats, now);

        let Some(decision) = decision else {
            return Ok(TickOutcome::Idle);
        };
        match decision.action {
            ScaleAction::ScaleUp => {
                self.executor
                    .scale_up_at(group_id, 1, Some(decision.policy_id), now)?;
            }
            ScaleAction::ScaleDown => {
                self.executor
                    .scale_down_at(group_id, Some(decision.policy_id), now)?;
            }
        }
        Ok(TickOutcome::Scaled(decision))
    }

    fn reconcile(&self, group: &AutoScaleVmGroup) -> Result<Option<TickOutcome>> {
        let members = group.member_count();

        if members < group.min_members {
            let deficit = group.min_members - members;
            info!(group = %group.id, members, min = group.min_members, "below minimum, scaling up");
            let added = self.executor.scale_up(&group.id, deficit, None)?;
            return Ok(Some(TickOutcome::Reconciled { added, removed: 0 }));
        }

        if members > group.max_members {
            let excess = members - group.max_members;
            info!(group = %group.id, members, max = group.max_members, "above maximum, scaling down");
            let mut removed = 0;
            for _ in 0..excess {
                match self.executor.scale_down(&group.id, None) {
                    Ok(_) => removed += 1,
                    Err(e) => {
                        warn!(group = %group.id, removed, error = %e, "reconciliation stopped");
                        return Err(e);
                    }
                }
            }
            return Ok(Some(TickOutcome::Reconciled { added: 0, removed }));
        }

        Ok(None)
    }
}
