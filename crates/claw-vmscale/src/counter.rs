//! Counters: the measurable quantities conditions are written against.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrors};
use crate::types::CounterId;

/// Where a counter's samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterSource {
    /// Hypervisor-reported CPU utilization of each VM.
    Cpu,
    /// Hypervisor-reported memory usage of each VM.
    Memory,
    /// Metrics reported by the virtual router servicing the load balancer.
    VirtualRouter,
    /// Metrics reported by an external load balancing appliance.
    Netscaler,
    /// SNMP metrics polled by an external appliance.
    Snmp,
}

/// How samples of a counter are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionPath {
    /// Batch query against the compute host running each VM.
    Host,
    /// Query against the virtual router instances of the group's network.
    Router,
    /// Performance query against an external appliance.
    Appliance,
}

impl CounterSource {
    /// Returns the collection path used for this source.
    #[must_use]
    pub const fn collection_path(self) -> CollectionPath {
        match self {
            Self::Cpu | Self::Memory => CollectionPath::Host,
            Self::VirtualRouter => CollectionPath::Router,
            Self::Netscaler | Self::Snmp => CollectionPath::Appliance,
        }
    }

    /// Returns the profile counter parameters this source needs.
    #[must_use]
    pub const fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::Snmp => &["snmpcommunity", "snmpport"],
            _ => &[],
        }
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Memory => "MEMORY",
            Self::VirtualRouter => "VIRTUALROUTER",
            Self::Netscaler => "NETSCALER",
            Self::Snmp => "SNMP",
        }
    }
}

impl std::fmt::Display for CounterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CPU" => Ok(Self::Cpu),
            "MEMORY" => Ok(Self::Memory),
            "VIRTUALROUTER" => Ok(Self::VirtualRouter),
            "NETSCALER" => Ok(Self::Netscaler),
            "SNMP" => Ok(Self::Snmp),
            _ => Err(ValidationError::InvalidValue {
                field: "source",
                value: s.to_string(),
            }),
        }
    }
}

/// A named, sourced metric. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    /// Unique identifier.
    pub id: CounterId,
    /// Display name.
    pub name: String,
    /// Origin of the samples.
    pub source: CounterSource,
    /// Provider-specific key identifying the metric.
    pub value: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Counter {
    /// Creates a counter after validating its fields.
    ///
    /// # Errors
    ///
    /// Returns every validation problem found.
    pub fn new(
        name: impl Into<String>,
        source: CounterSource,
        value: impl Into<String>,
    ) -> Result<Self, ValidationErrors> {
        let name = name.into();
        let value = value.into();

        let mut report = ValidationErrors::new();
        if name.trim().is_empty() {
            report.push(ValidationError::Missing { field: "name" });
        }
        if value.trim().is_empty() {
            report.push(ValidationError::Missing { field: "value" });
        }

        report.into_result(Self {
            id: CounterId::new(),
            name,
            source,
            value,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("cpu", CounterSource::Cpu ; "lower case")]
    #[test_case("MEMORY", CounterSource::Memory ; "upper case")]
    #[test_case("VirtualRouter", CounterSource::VirtualRouter ; "mixed case")]
    #[test_case("snmp", CounterSource::Snmp ; "snmp")]
    fn source_parses(input: &str, expected: CounterSource) {
        assert_eq!(input.parse::<CounterSource>(), Ok(expected));
    }

    #[test]
    fn source_rejects_unknown() {
        assert!("disk".parse::<CounterSource>().is_err());
    }

    #[test]
    fn source_collection_paths() {
        assert_eq!(CounterSource::Cpu.collection_path(), CollectionPath::Host);
        assert_eq!(CounterSource::Memory.collection_path(), CollectionPath::Host);
        assert_eq!(
            CounterSource::VirtualRouter.collection_path(),
            CollectionPath::Router
        );
        assert_eq!(
            CounterSource::Snmp.collection_path(),
            CollectionPath::Appliance
        );
    }

    #[test]
    fn snmp_requires_params() {
        assert_eq!(
            CounterSource::Snmp.required_params(),
            &["snmpcommunity", "snmpport"]
        );
        assert!(CounterSource::Cpu.required_params().is_empty());
    }

    #[test]
    fn counter_creation() {
        let counter = Counter::new("VM CPU", CounterSource::Cpu, "vm.cpu.utilization").unwrap();
        assert_eq!(counter.name, "VM CPU");
        assert_eq!(counter.source, CounterSource::Cpu);
    }

    #[test]
    fn counter_requires_name_and_value() {
        let err = Counter::new(" ", CounterSource::Cpu, "").unwrap_err();
        assert_eq!(err.errors().len(), 2);
    }
}
