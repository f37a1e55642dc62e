//! Statistics store: the time-series ledger the collector writes and the
//! decision engine reads.
//!
//! Rows are kept per group in creation order. A row without a value is a
//! "dummy" row: sampling was attempted but produced no data. Rows are never
//! rewritten except to flip them to [`StatisticState::Inactive`] when the
//! configuration they were sampled under changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{CounterId, GroupId, PolicyId};

/// How a row's value must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatisticValueType {
    /// Point sample of one VM.
    InstantVm,
    /// Point sample of the whole group.
    InstantVmGroup,
    /// Monotonic counter of one VM.
    AggregatedVm,
    /// Monotonic counter of the whole group.
    AggregatedVmGroup,
}

impl StatisticValueType {
    /// Returns true for monotonic counters a rate is derived from.
    #[must_use]
    pub const fn is_aggregated(self) -> bool {
        matches!(self, Self::AggregatedVm | Self::AggregatedVmGroup)
    }

    /// Returns true for values that cover the whole group.
    #[must_use]
    pub const fn is_group_wide(self) -> bool {
        matches!(self, Self::InstantVmGroup | Self::AggregatedVmGroup)
    }
}

/// Whether a row may feed a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatisticState {
    /// Sampled under the current configuration.
    Active,
    /// Sampled under a configuration that has since changed.
    Inactive,
}

/// A sample to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Policy the sample was taken for.
    pub policy_id: PolicyId,
    /// Counter measured.
    pub counter_id: CounterId,
    /// VM, router or load balancer the value belongs to.
    pub resource_id: String,
    /// Measured value, `None` when no data was available.
    pub value: Option<f64>,
    /// Interpretation of the value.
    pub value_type: StatisticValueType,
    /// Sampling time.
    pub at: DateTime<Utc>,
}

impl Sample {
    /// Creates a sample carrying a value.
    #[must_use]
    pub fn value(
        policy_id: PolicyId,
        counter_id: CounterId,
        resource_id: impl Into<String>,
        value: f64,
        value_type: StatisticValueType,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            policy_id,
            counter_id,
            resource_id: resource_id.into(),
            value: Some(value),
            value_type,
            at,
        }
    }

    /// Creates a "no data" sample.
    #[must_use]
    pub fn dummy(
        policy_id: PolicyId,
        counter_id: CounterId,
        resource_id: impl Into<String>,
        value_type: StatisticValueType,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            policy_id,
            counter_id,
            resource_id: resource_id.into(),
            value: None,
            value_type,
            at,
        }
    }
}

/// A stored statistics row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRow {
    /// Row identity, unique across the store.
    pub id: u64,
    /// Owning group.
    pub group_id: GroupId,
    /// Policy the sample was taken for.
    pub policy_id: PolicyId,
    /// Counter measured.
    pub counter_id: CounterId,
    /// VM, router or load balancer the value belongs to.
    pub resource_id: String,
    /// Measured value, `None` for dummy rows.
    pub raw_value: Option<f64>,
    /// Interpretation of the value.
    pub value_type: StatisticValueType,
    /// Sampling time.
    pub created_at: DateTime<Utc>,
    /// Whether the row may feed a decision.
    pub state: StatisticState,
}

impl StatisticRow {
    /// Returns true if this is a "no data" row.
    #[must_use]
    pub const fn is_dummy(&self) -> bool {
        self.raw_value.is_none()
    }
}

/// Thread-safe in-memory statistics ledger.
#[derive(Debug, Default)]
pub struct StatisticsStore {
    next_id: AtomicU64,
    rows: RwLock<HashMap<GroupId, Vec<StatisticRow>>>,
}

impl StatisticsStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn to_row(&self, group_id: GroupId, sample: Sample) -> StatisticRow {
        StatisticRow {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            group_id,
            policy_id: sample.policy_id,
            counter_id: sample.counter_id,
            resource_id: sample.resource_id,
            raw_value: sample.value,
            value_type: sample.value_type,
            created_at: sample.at,
            state: StatisticState::Active,
        }
    }

    /// Records one sample and returns its row id.
    pub fn record(&self, group_id: GroupId, sample: Sample) -> u64 {
        let row = self.to_row(group_id, sample);
        let id = row.id;
        self.rows.write().entry(group_id).or_default().push(row);
        id
    }

    /// Records several samples under one lock.
    pub fn record_batch(&self, group_id: GroupId, samples: Vec<Sample>) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let new_rows: Vec<StatisticRow> = samples
            .into_iter()
            .map(|s| self.to_row(group_id, s))
            .collect();
        let count = new_rows.len();

        self.rows.write().entry(group_id).or_default().extend(new_rows);
        debug!(group = %group_id, count, "recorded statistics");
        count
    }

    /// Returns the active rows of a (group, policy, counter) created at or
    /// after `since`, oldest first.
    #[must_use]
    pub fn active_window(
        &self,
        group_id: &GroupId,
        policy_id: &PolicyId,
        counter_id: &CounterId,
        since: DateTime<Utc>,
    ) -> Vec<StatisticRow> {
        let rows = self.rows.read();
        let mut window: Vec<StatisticRow> = rows
            .get(group_id)
            .into_iter()
            .flatten()
            .filter(|r| {
                r.state == StatisticState::Active
                    && &r.policy_id == policy_id
                    && &r.counter_id == counter_id
                    && r.created_at >= since
            })
            .cloned()
            .collect();
        window.sort_by_key(|r| (r.created_at, r.id));
        window
    }

    /// Returns true if the group has an active dummy row created at or after
    /// `since`, for any policy.
    #[must_use]
    pub fn has_dummy(&self, group_id: &GroupId, since: DateTime<Utc>) -> bool {
        self.rows.read().get(group_id).is_some_and(|rows| {
            rows.iter().any(|r| {
                r.state == StatisticState::Active && r.is_dummy() && r.created_at >= since
            })
        })
    }

    /// Returns true if the policy has an inactive row created at or after
    /// `since`.
    #[must_use]
    pub fn has_inactive(&self, group_id: &GroupId, policy_id: &PolicyId, since: DateTime<Utc>) -> bool {
        self.rows.read().get(group_id).is_some_and(|rows| {
            rows.iter().any(|r| {
                r.state == StatisticState::Inactive
                    && &r.policy_id == policy_id
                    && r.created_at >= since
            })
        })
    }

    /// Marks the group's rows inactive, optionally only those of one policy.
    /// Returns the number of rows flipped.
    pub fn mark_inactive(&self, group_id: &GroupId, policy_id: Option<&PolicyId>) -> usize {
        let mut rows = self.rows.write();
        let Some(group_rows) = rows.get_mut(group_id) else {
            return 0;
        };

        let mut flipped = 0;
        for row in group_rows.iter_mut() {
            if row.state == StatisticState::Active && policy_id.is_none_or(|p| &row.policy_id == p) {
                row.state = StatisticState::Inactive;
                flipped += 1;
            }
        }
        flipped
    }

    /// Deletes a policy's rows created before `cutoff`.
    pub fn purge_policy_before(
        &self,
        group_id: &GroupId,
        policy_id: &PolicyId,
        cutoff: DateTime<Utc>,
    ) -> usize {
        self.retain(group_id, |r| &r.policy_id != policy_id || r.created_at >= cutoff)
    }

    /// Deletes every row of the group created before `cutoff`.
    pub fn purge_group_before(&self, group_id: &GroupId, cutoff: DateTime<Utc>) -> usize {
        self.retain(group_id, |r| r.created_at >= cutoff)
    }

    /// Deletes every row of the group.
    pub fn remove_group(&self, group_id: &GroupId) -> usize {
        self.rows.write().remove(group_id).map_or(0, |rows| rows.len())
    }

    /// Returns a copy of every row of the group.
    #[must_use]
    pub fn rows(&self, group_id: &GroupId) -> Vec<StatisticRow> {
        self.rows.read().get(group_id).cloned().unwrap_or_default()
    }

    /// Returns the total number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().values().map(Vec::len).sum()
    }

    /// Returns true if no rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain(&self, group_id: &GroupId, keep: impl Fn(&StatisticRow) -> bool) -> usize {
        let mut rows = self.rows.write();
        let Some(group_rows) = rows.get_mut(group_id) else {
            return 0;
        };
        let before = group_rows.len();
        group_rows.retain(|r| keep(r));
        before - group_rows.len()
    }
}
