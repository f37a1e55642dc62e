//! VM group autoscaling for Clawbernetes load-balanced pools.
//!
//! `claw-vmscale` keeps a pool of VMs behind a load balancer sized to its
//! load. Every group runs a periodic control loop that samples metrics,
//! evaluates threshold policies over a sliding window and adds or removes
//! one VM at a time, bounded by the group's member limits.
//!
//! # Features
//!
//! - **Counters and Conditions**: Named metrics from hosts, virtual routers
//!   or load-balancer appliances, compared against thresholds
//! - **Policies**: All-conditions-hold rules with an evaluation window and a
//!   quiet time after firing
//! - **Profiles**: VM templates with deploy parameters and a grace period
//!   before destroying removed members
//! - **Groups**: `New → Enabled ⇄ Disabled`, with `Scaling` guarding every
//!   membership change and `Revoke` during deletion
//! - **Scheduler**: One timer per enabled group plus a bounded periodic sweep
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use claw_vmscale::in_memory::InMemoryServices;
//! use claw_vmscale::prelude::*;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let fakes = InMemoryServices::new();
//! fakes.load_balancers.register(
//!     LoadBalancerId::new("lb-1"),
//!     ServiceProvider::VirtualRouter,
//!     "net-1",
//! );
//!
//! let manager = AutoscaleManager::new(
//!     fakes.services(),
//!     AutoscaleConfig::default(),
//!     runtime.handle().clone(),
//! )
//! .unwrap();
//!
//! let cpu = manager.create_counter("cpu", CounterSource::Cpu, "cpu.util").unwrap();
//! let busy = manager
//!     .create_condition(cpu.id, RelationalOperator::Gt, 80.0, "admin")
//!     .unwrap();
//! let idle = manager
//!     .create_condition(cpu.id, RelationalOperator::Lt, 20.0, "admin")
//!     .unwrap();
//! let up = manager
//!     .create_policy(
//!         manager
//!             .policy_builder("cpu-high", ScaleAction::ScaleUp)
//!             .condition(busy.id)
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! let down = manager
//!     .create_policy(
//!         manager
//!             .policy_builder("cpu-low", ScaleAction::ScaleDown)
//!             .condition(idle.id)
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! let profile = manager
//!     .create_profile(AutoScaleVmProfile::new("zone-1", "ubuntu", "small", "admin"))
//!     .unwrap();
//!
//! let group = manager
//!     .create_group(
//!         AutoScaleVmGroup::new(
//!             "web",
//!             LoadBalancerId::new("lb-1"),
//!             profile.id,
//!             2,
//!             6,
//!             Duration::from_secs(60),
//!         )
//!         .with_scale_up_policies(vec![up.id])
//!         .with_scale_down_policies(vec![down.id]),
//!     )
//!     .unwrap();
//!
//! assert_eq!(group.state, VmGroupState::Enabled);
//! assert!(manager.status(&group.id).unwrap().scheduled);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               AutoscaleManager               │
//! │  ┌────────────┐   ┌────────────────────────┐ │
//! │  │ Repository │   │   AutoscaleScheduler   │ │
//! │  └────────────┘   │  timers + sweep pool   │ │
//! │                   └───────────┬────────────┘ │
//! │  ┌────────────────────────────▼────────────┐ │
//! │  │              GroupMonitor               │ │
//! │  │  collect → evaluate → cleanup → execute │ │
//! │  └────┬──────────────┬──────────────┬──────┘ │
//! │  Collector     DecisionEngine   Executor     │
//! │       │              │              │        │
//! │       └──── StatisticsStore ────────┘        │
//! └──────────────────────────────────────────────┘
//!        host / router / load balancer / VM services
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod collector;
pub mod condition;
pub mod config;
pub mod counter;
pub mod decision;
pub mod error;
pub mod executor;
pub mod group;
pub mod in_memory;
pub mod manager;
pub mod monitor;
pub mod policy;
pub mod profile;
pub mod repository;
pub mod scheduler;
pub mod services;
pub mod statistics;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use collector::{
    ApplianceMetricsSource, HostMetricsSource, MetricTarget, MetricsCollector, MetricsSource,
    RouterMetricsSource,
};
pub use condition::{Condition, RelationalOperator};
pub use config::AutoscaleConfig;
pub use counter::{CollectionPath, Counter, CounterSource};
pub use decision::{Decision, DecisionEngine};
pub use error::{AutoscaleError, ErrorCategory, Result, ValidationError, ValidationErrors};
pub use executor::ScalingExecutor;
pub use group::{AutoScaleVmGroup, GroupDescriptor, GroupStatus, VmGroupState};
pub use manager::{AutoscaleManager, GroupUpdate, PolicyUpdate};
pub use monitor::{GroupMonitor, TickOutcome};
pub use policy::{AutoScalePolicy, AutoScalePolicyBuilder, ScaleAction};
pub use profile::{AutoScaleVmProfile, DeployParam, DeployParams};
pub use repository::Repository;
pub use scheduler::{AutoscaleScheduler, SweepReport, TickStatus};
pub use services::{
    HostAgent, LoadBalancerService, RouterAgent, ServiceProvider, Services, VmLifecycle,
};
pub use statistics::{StatisticRow, StatisticState, StatisticValueType, StatisticsStore};
pub use types::{
    ConditionId, CounterId, GroupId, HostId, LoadBalancerId, PolicyId, ProfileId, RouterId, VmId,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::condition::{Condition, RelationalOperator};
    pub use crate::config::AutoscaleConfig;
    pub use crate::counter::{Counter, CounterSource};
    pub use crate::error::{AutoscaleError, Result};
    pub use crate::group::{AutoScaleVmGroup, GroupStatus, VmGroupState};
    pub use crate::manager::{AutoscaleManager, GroupUpdate, PolicyUpdate};
    pub use crate::monitor::TickOutcome;
    pub use crate::policy::{AutoScalePolicy, ScaleAction};
    pub use crate::profile::AutoScaleVmProfile;
    pub use crate::services::{ServiceProvider, Services};
    pub use crate::types::{
        ConditionId, CounterId, GroupId, LoadBalancerId, PolicyId, ProfileId, VmId,
    };
}
