//! Decision engine.
//!
//! Reads the statistics window of every (policy, condition) of a group,
//! reduces it to one average per condition and returns the action of the
//! first policy, in stored order, whose quiet time has elapsed and whose
//! conditions all hold.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::group::{GroupDescriptor, PolicyDescriptor};
use crate::policy::ScaleAction;
use crate::statistics::{StatisticRow, StatisticsStore};
use crate::types::PolicyId;

/// The outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Policy that fired.
    pub policy_id: PolicyId,
    /// Action to take.
    pub action: ScaleAction,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Derives a per-second rate from a monotonic counter series ordered by time.
///
/// Returns `None` when the series has fewer than two samples, spans no time,
/// or decreases anywhere.
#[must_use]
pub fn derive_rate(series: &[(DateTime<Utc>, f64)]) -> Option<f64> {
    let (first, last) = (series.first()?, series.last()?);
    if series.windows(2).any(|pair| pair[1].1 < pair[0].1) {
        return None;
    }
    let elapsed_ms = (last.0 - first.0).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    Some((last.1 - first.1) * 1000.0 / elapsed_ms as f64)
}

/// Averages a statistics window.
///
/// Instant rows contribute their value; each aggregated series of one
/// resource contributes its rate. Group-wide values are divided by the member
/// count. Returns `None` when nothing usable is in the window.
#[must_use]
pub fn aggregate(rows: &[StatisticRow], member_count: u32) -> Option<f64> {
    let divisor = f64::from(member_count.max(1));
    let mut sum = 0.0;
    let mut count = 0u32;
    let mut series: BTreeMap<(&str, bool), Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();

    for row in rows {
        let Some(value) = row.raw_value else {
            continue;
        };
        if row.value_type.is_aggregated() {
            series
                .entry((row.resource_id.as_str(), row.value_type.is_group_wide()))
                .or_default()
                .push((row.created_at, value));
        } else {
            sum += if row.value_type.is_group_wide() {
                value / divisor
            } else {
                value
            };
            count += 1;
        }
    }

    for ((resource, group_wide), mut points) in series {
        points.sort_by_key(|p| p.0);
        match derive_rate(&points) {
            Some(rate) => {
                sum += if group_wide { rate / divisor } else { rate };
                count += 1;
            }
            None if points.len() > 1 => {
                warn!(resource, samples = points.len(), "dropping non-monotonic counter series");
            }
            None => {}
        }
    }

    if count == 0 {
        None
    } else {
        Some(sum / f64::from(count))
    }
}

/// Evaluates policies and purges statistics.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    cleanup_delay: Duration,
}

impl DecisionEngine {
    /// Creates an engine with the global statistics cleanup delay.
    #[must_use]
    pub const fn new(cleanup_delay: Duration) -> Self {
        Self { cleanup_delay }
    }

    /// Evaluates a group now.
    #[must_use]
    pub fn evaluate(&self, descriptor: &GroupDescriptor, store: &StatisticsStore) -> Option<Decision> {
        self.evaluate_at(descriptor, store, Utc::now())
    }

    /// Evaluates a group at a specific time.
    #[must_use]
    pub fn evaluate_at(
        &self,
        descriptor: &GroupDescriptor,
        store: &StatisticsStore,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        let group_id = descriptor.group.id;

        for entry in &descriptor.policies {
            let since = now - to_chrono(entry.policy.duration);
            if store.has_dummy(&group_id, since) {
                debug!(group = %group_id, policy = %entry.policy.id, "no-data samples in window, skipping cycle");
                return None;
            }
        }

        let member_count = descriptor.group.member_count();
        for entry in &descriptor.policies {
            if self.policy_holds(descriptor, entry, store, member_count, now) {
                info!(
                    group = %group_id,
                    policy = %entry.policy.id,
                    action = %entry.policy.action,
                    "policy conditions met"
                );
                return Some(Decision {
                    policy_id: entry.policy.id,
                    action: entry.policy.action,
                });
            }
        }
        None
    }

    fn policy_holds(
        &self,
        descriptor: &GroupDescriptor,
        entry: &PolicyDescriptor,
        store: &StatisticsStore,
        member_count: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let group_id = descriptor.group.id;
        let policy = &entry.policy;

        if !policy.quiet_time_elapsed(now) {
            debug!(group = %group_id, policy = %policy.id, "policy in quiet time");
            return false;
        }
        let since = now - to_chrono(policy.duration);
        if store.has_inactive(&group_id, &policy.id, since) {
            debug!(group = %group_id, policy = %policy.id, "stale samples in window, skipping policy");
            return false;
        }
        if entry.conditions.is_empty() {
            return false;
        }

        entry.conditions.iter().all(|c| {
            let rows = store.active_window(&group_id, &policy.id, &c.counter.id, since);
            match aggregate(&rows, member_count) {
                Some(average) => {
                    let met = c.condition.is_met_by(average);
                    debug!(
                        group = %group_id,
                        policy = %policy.id,
                        counter = %c.counter.name,
                        average,
                        operator = %c.condition.operator,
                        threshold = c.condition.threshold,
                        met,
                        "condition evaluated"
                    );
                    met
                }
                None => {
                    debug!(group = %group_id, policy = %policy.id, counter = %c.counter.name, "no samples for condition");
                    false
                }
            }
        })
    }

    /// Purges statistics no policy of the group can still read. Returns the
    /// number of rows deleted.
    pub fn cleanup_at(&self, descriptor: &GroupDescriptor, store: &StatisticsStore, now: DateTime<Utc>) -> usize {
        let group_id = descriptor.group.id;
        let mut purged = 0;

        for entry in &descriptor.policies {
            let window = self.cleanup_delay.max(entry.policy.duration);
            purged += store.purge_policy_before(&group_id, &entry.policy.id, now - to_chrono(window));
        }
        let widest = self.cleanup_delay.max(descriptor.max_duration());
        purged += store.purge_group_before(&group_id, now - to_chrono(widest));

        if purged > 0 {
            debug!(group = %group_id, purged, "purged statistics");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::RelationalOperator;
    use crate::counter::CounterSource;
    use crate::services::ServiceProvider;
    use crate::statistics::{Sample, StatisticState, StatisticValueType};
    use crate::test_support::descriptor_with;
    use crate::types::{CounterId, GroupId, VmId};
    use proptest::prelude::*;

    fn row(resource: &str, value: Option<f64>, value_type: StatisticValueType, at: DateTime<Utc>) -> StatisticRow {
        StatisticRow {
            id: 0,
            group_id: GroupId::new(),
            policy_id: PolicyId::new(),
            counter_id: CounterId::new(),
            resource_id: resource.to_string(),
            raw_value: value,
            value_type,
            created_at: at,
            state: StatisticState::Active,
        }
    }

    fn members(n: usize) -> Vec<VmId> {
        (0..n).map(|i| VmId::new(format!("vm-{i}"))).collect()
    }

    /// Records `value` for every condition of every policy matching `action`.
    fn feed(descriptor: &GroupDescriptor, store: &StatisticsStore, action: ScaleAction, value: f64, at: DateTime<Utc>) {
        for entry in descriptor.policies.iter().filter(|p| p.policy.action == action) {
            for c in &entry.conditions {
                store.record(
                    descriptor.group.id,
                    Sample::value(entry.policy.id, c.counter.id, "vm-0", value, StatisticValueType::InstantVm, at),
                );
            }
        }
    }

    mod aggregation_tests {
        use super::*;

        #[test]
        fn instant_rows_are_averaged() {
            let now = Utc::now();
            let rows = vec![
                row("vm-1", Some(60.0), StatisticValueType::InstantVm, now),
                row("vm-2", Some(80.0), StatisticValueType::InstantVm, now),
            ];
            assert_eq!(aggregate(&rows, 2), Some(70.0));
        }

        #[test]
        fn group_rows_divided_by_members() {
            let now = Utc::now();
            let rows = vec![row("lb-1", Some(300.0), StatisticValueType::InstantVmGroup, now)];
            assert_eq!(aggregate(&rows, 3), Some(100.0));
        }

        #[test]
        fn aggregated_rows_become_rate() {
            let t0 = Utc::now();
            let rows = vec![
                row("vm-1", Some(1000.0), StatisticValueType::AggregatedVm, t0),
                row("vm-1", Some(1500.0), StatisticValueType::AggregatedVm, t0 + chrono::Duration::seconds(5)),
                row("vm-1", Some(3000.0), StatisticValueType::AggregatedVm, t0 + chrono::Duration::seconds(10)),
            ];
            assert_eq!(aggregate(&rows, 1), Some(200.0));
        }

        #[test]
        fn decreasing_series_is_dropped() {
            let t0 = Utc::now();
            let rows = vec![
                row("vm-1", Some(1000.0), StatisticValueType::AggregatedVm, t0),
                row("vm-1", Some(500.0), StatisticValueType::AggregatedVm, t0 + chrono::Duration::seconds(5)),
                row("vm-2", Some(10.0), StatisticValueType::InstantVm, t0),
            ];
            assert_eq!(aggregate(&rows, 2), Some(10.0));
        }

        #[test]
        fn group_wide_rate_divided_by_members() {
            let t0 = Utc::now();
            let rows = vec![
                row("lb-1", Some(0.0), StatisticValueType::AggregatedVmGroup, t0),
                row("lb-1", Some(3000.0), StatisticValueType::AggregatedVmGroup, t0 + chrono::Duration::seconds(10)),
            ];
            assert_eq!(aggregate(&rows, 3), Some(100.0));
        }

        #[test]
        fn only_the_decreasing_series_is_dropped() {
            let t0 = Utc::now();
            let later = t0 + chrono::Duration::seconds(5);
            let rows = vec![
                row("vm-1", Some(100.0), StatisticValueType::AggregatedVm, t0),
                row("vm-2", Some(900.0), StatisticValueType::AggregatedVm, t0),
                row("vm-1", Some(600.0), StatisticValueType::AggregatedVm, later),
                row("vm-2", Some(400.0), StatisticValueType::AggregatedVm, later),
            ];
            assert_eq!(aggregate(&rows, 2), Some(100.0));
        }

        #[test]
        fn dummy_and_single_samples_yield_nothing() {
            let now = Utc::now();
            let rows = vec![
                row("vm-1", None, StatisticValueType::InstantVm, now),
                row("vm-2", Some(5.0), StatisticValueType::AggregatedVm, now),
            ];
            assert_eq!(aggregate(&rows, 2), None);
        }

        proptest! {
            #[test]
            fn rate_matches_formula(v1 in 0.0f64..1e9, delta in 0.0f64..1e9, ms in 1i64..10_000_000) {
                let t1 = Utc::now();
                let t2 = t1 + chrono::Duration::milliseconds(ms);
                let v2 = v1 + delta;
                let rate = derive_rate(&[(t1, v1), (t2, v2)]).unwrap();
                let expected = (v2 - v1) * 1000.0 / ms as f64;
                prop_assert!((rate - expected).abs() <= expected.abs() * 1e-9 + 1e-9);
            }

            #[test]
            fn decreasing_pair_has_no_rate(v2 in 0.0f64..1e9, drop in 1e-3f64..1e6, ms in 1i64..1_000_000) {
                let t1 = Utc::now();
                let t2 = t1 + chrono::Duration::milliseconds(ms);
                prop_assert!(derive_rate(&[(t1, v2 + drop), (t2, v2)]).is_none());
            }
        }
    }

    mod evaluation_tests {
        use super::*;

        fn engine() -> DecisionEngine {
            DecisionEngine::new(Duration::from_secs(7200))
        }

        #[test]
        fn fires_first_matching_policy() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            let now = Utc::now();
            // both policies use `> 50` / `< 20`; feed a value that satisfies scale-up
            feed(&descriptor, &store, ScaleAction::ScaleUp, 90.0, now - chrono::Duration::seconds(10));
            feed(&descriptor, &store, ScaleAction::ScaleDown, 10.0, now - chrono::Duration::seconds(10));

            let decision = engine().evaluate_at(&descriptor, &store, now).unwrap();
            assert_eq!(decision.action, ScaleAction::ScaleUp);
            assert_eq!(decision.policy_id, descriptor.policies[0].policy.id);
        }

        #[test]
        fn no_samples_means_no_decision() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            assert!(engine().evaluate_at(&descriptor, &store, Utc::now()).is_none());
        }

        #[test]
        fn dummy_row_blocks_every_policy() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            let now = Utc::now();
            feed(&descriptor, &store, ScaleAction::ScaleUp, 90.0, now - chrono::Duration::seconds(10));
            let down = &descriptor.policies[1];
            store.record(
                descriptor.group.id,
                Sample::dummy(
                    down.policy.id,
                    down.conditions[0].counter.id,
                    "vm-1",
                    StatisticValueType::InstantVm,
                    now - chrono::Duration::seconds(5),
                ),
            );

            assert!(engine().evaluate_at(&descriptor, &store, now).is_none());
        }

        #[test]
        fn inactive_rows_skip_only_their_policy() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            let now = Utc::now();
            let up = descriptor.policies[0].policy.id;
            feed(&descriptor, &store, ScaleAction::ScaleUp, 90.0, now - chrono::Duration::seconds(20));
            store.mark_inactive(&descriptor.group.id, Some(&up));
            feed(&descriptor, &store, ScaleAction::ScaleUp, 90.0, now - chrono::Duration::seconds(10));
            feed(&descriptor, &store, ScaleAction::ScaleDown, 10.0, now - chrono::Duration::seconds(10));

            let decision = engine().evaluate_at(&descriptor, &store, now).unwrap();
            assert_eq!(decision.action, ScaleAction::ScaleDown);
        }

        #[test]
        fn quiet_time_skips_policy() {
            let store = StatisticsStore::new();
            let mut descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            let now = Utc::now();
            descriptor.policies[0].policy.last_quiet_time = Some(now - chrono::Duration::seconds(10));
            feed(&descriptor, &store, ScaleAction::ScaleUp, 90.0, now - chrono::Duration::seconds(5));

            assert!(engine().evaluate_at(&descriptor, &store, now).is_none());
        }

        #[test]
        fn condition_not_met() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(2));
            let now = Utc::now();
            feed(&descriptor, &store, ScaleAction::ScaleUp, 40.0, now - chrono::Duration::seconds(5));
            assert_eq!(descriptor.policies[0].conditions[0].condition.operator, RelationalOperator::Gt);
            assert!(engine().evaluate_at(&descriptor, &store, now).is_none());
        }
    }

    mod cleanup_tests {
        use super::*;

        #[test]
        fn keeps_rows_inside_widest_window() {
            let store = StatisticsStore::new();
            let descriptor = descriptor_with(ServiceProvider::VirtualRouter, CounterSource::Cpu, members(1));
            let now = Utc::now();
            feed(&descriptor, &store, ScaleAction::ScaleUp, 1.0, now - chrono::Duration::seconds(30));
            feed(&descriptor, &store, ScaleAction::ScaleUp, 1.0, now - chrono::Duration::seconds(400));

            // policies last 300s; cleanup delay of 60s is shorter
            let engine = DecisionEngine::new(Duration::from_secs(60));
            assert_eq!(engine.cleanup_at(&descriptor, &store, now), 1);
            assert_eq!(store.len(), 1);
        }
    }
}
