//! VM profiles: how new group members are provisioned.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counter::Counter;
use crate::error::{ValidationError, ValidationErrors};
use crate::types::ProfileId;

/// One whitelisted deployment override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployParam {
    /// Root disk size in GB.
    RootDiskSize(u64),
    /// Disk offering for an extra data disk.
    DiskOfferingId(String),
    /// Data disk size in GB.
    DataDiskSize(u64),
    /// Security groups to apply.
    SecurityGroupIds(Vec<String>),
    /// SSH key pairs to install.
    SshKeypairs(Vec<String>),
    /// Affinity groups to join.
    AffinityGroupIds(Vec<String>),
    /// Extra networks to attach.
    NetworkIds(Vec<String>),
}

impl DeployParam {
    /// Parses a key/value pair. List values are comma separated.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys and malformed values.
    pub fn parse(key: &str, value: &str) -> Result<Self, ValidationError> {
        let key_lower = key.trim().to_ascii_lowercase();
        match key_lower.as_str() {
            "rootdisksize" => parse_size("rootdisksize", value).map(Self::RootDiskSize),
            "size" => parse_size("size", value).map(Self::DataDiskSize),
            "diskofferingid" => {
                let value = value.trim();
                if value.is_empty() {
                    Err(ValidationError::Missing {
                        field: "diskofferingid",
                    })
                } else {
                    Ok(Self::DiskOfferingId(value.to_string()))
                }
            }
            "securitygroupids" => Ok(Self::SecurityGroupIds(split_list(value))),
            "keypairs" => Ok(Self::SshKeypairs(split_list(value))),
            "affinitygroupids" => Ok(Self::AffinityGroupIds(split_list(value))),
            "networkids" => Ok(Self::NetworkIds(split_list(value))),
            _ => Err(ValidationError::UnsupportedDeployParam {
                key: key.to_string(),
            }),
        }
    }
}

fn parse_size(field: &'static str, value: &str) -> Result<u64, ValidationError> {
    match value.trim().parse::<u64>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ValidationError::InvalidValue {
            field,
            value: value.to_string(),
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalized deployment overrides of a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    /// Root disk size in GB.
    pub root_disk_size: Option<u64>,
    /// Disk offering for an extra data disk.
    pub disk_offering_id: Option<String>,
    /// Data disk size in GB.
    pub data_disk_size: Option<u64>,
    /// Security groups.
    pub security_group_ids: Vec<String>,
    /// SSH key pairs.
    pub ssh_keypairs: Vec<String>,
    /// Affinity groups.
    pub affinity_group_ids: Vec<String>,
    /// Extra networks.
    pub network_ids: Vec<String>,
}

impl DeployParams {
    /// Builds parameters from raw key/value pairs, rejecting unknown keys.
    ///
    /// # Errors
    ///
    /// Returns every rejected pair.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ValidationErrors> {
        let mut params = Self::default();
        let mut report = ValidationErrors::new();
        for (key, value) in pairs {
            match DeployParam::parse(key, value) {
                Ok(param) => params.apply(param),
                Err(e) => report.push(e),
            }
        }
        report.into_result(params)
    }

    /// Applies one parameter, replacing any previous value for its key.
    pub fn apply(&mut self, param: DeployParam) {
        match param {
            DeployParam::RootDiskSize(size) => self.root_disk_size = Some(size),
            DeployParam::DiskOfferingId(id) => self.disk_offering_id = Some(id),
            DeployParam::DataDiskSize(size) => self.data_disk_size = Some(size),
            DeployParam::SecurityGroupIds(ids) => self.security_group_ids = ids,
            DeployParam::SshKeypairs(keys) => self.ssh_keypairs = keys,
            DeployParam::AffinityGroupIds(ids) => self.affinity_group_ids = ids,
            DeployParam::NetworkIds(ids) => self.network_ids = ids,
        }
    }

    /// Returns the parameters as a list of variants.
    #[must_use]
    pub fn to_params(&self) -> Vec<DeployParam> {
        let mut params = Vec::new();
        if let Some(size) = self.root_disk_size {
            params.push(DeployParam::RootDiskSize(size));
        }
        if let Some(id) = &self.disk_offering_id {
            params.push(DeployParam::DiskOfferingId(id.clone()));
        }
        if let Some(size) = self.data_disk_size {
            params.push(DeployParam::DataDiskSize(size));
        }
        if !self.security_group_ids.is_empty() {
            params.push(DeployParam::SecurityGroupIds(self.security_group_ids.clone()));
        }
        if !self.ssh_keypairs.is_empty() {
            params.push(DeployParam::SshKeypairs(self.ssh_keypairs.clone()));
        }
        if !self.affinity_group_ids.is_empty() {
            params.push(DeployParam::AffinityGroupIds(self.affinity_group_ids.clone()));
        }
        if !self.network_ids.is_empty() {
            params.push(DeployParam::NetworkIds(self.network_ids.clone()));
        }
        params
    }
}

/// Provisioning template for the members of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScaleVmProfile {
    /// Unique identifier.
    pub id: ProfileId,
    /// Zone new VMs are deployed into.
    pub zone_id: String,
    /// Deployment template.
    pub template_id: String,
    /// Compute offering.
    pub service_offering_id: String,
    /// Whitelisted deployment overrides.
    pub deploy_params: DeployParams,
    /// Provider parameters some counters need (SNMP community, port, ...).
    pub counter_params: BTreeMap<String, String>,
    /// User acting on behalf of the autoscaler when the provider calls back.
    /// Only the provider reads it, through the descriptor passed to
    /// `configure_group`.
    pub autoscale_user_id: Option<String>,
    /// User data passed to new VMs.
    pub user_data: Option<String>,
    /// Wait before destroying a scaled-down VM.
    pub expunge_vm_grace_period: Duration,
    /// Owning account.
    pub owner: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl AutoScaleVmProfile {
    /// Creates a profile with no overrides.
    #[must_use]
    pub fn new(
        zone_id: impl Into<String>,
        template_id: impl Into<String>,
        service_offering_id: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            id: ProfileId::new(),
            zone_id: zone_id.into(),
            template_id: template_id.into(),
            service_offering_id: service_offering_id.into(),
            deploy_params: DeployParams::default(),
            counter_params: BTreeMap::new(),
            autoscale_user_id: None,
            user_data: None,
            expunge_vm_grace_period: Duration::ZERO,
            owner: owner.into(),
            created_at: Utc::now(),
        }
    }

    /// Sets the deployment overrides.
    #[must_use]
    pub fn with_deploy_params(mut self, params: DeployParams) -> Self {
        self.deploy_params = params;
        self
    }

    /// Adds a counter parameter.
    #[must_use]
    pub fn with_counter_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.counter_params
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_autoscale_user(mut self, user_id: impl Into<String>) -> Self {
        self.autoscale_user_id = Some(user_id.into());
        self
    }

    /// Sets the user data.
    #[must_use]
    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }

    /// Sets the grace period before scaled-down VMs are destroyed.
    #[must_use]
    pub const fn with_expunge_grace_period(mut self, period: Duration) -> Self {
        self.expunge_vm_grace_period = period;
        self
    }

    /// Returns a counter parameter by case-insensitive key.
    #[must_use]
    pub fn counter_param(&self, key: &str) -> Option<&str> {
        self.counter_params
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Validates the profile's own fields.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut report = ValidationErrors::new();
        if self.zone_id.trim().is_empty() {
            report.push(ValidationError::Missing { field: "zoneid" });
        }
        if self.template_id.trim().is_empty() {
            report.push(ValidationError::Missing { field: "templateid" });
        }
        if self.service_offering_id.trim().is_empty() {
            report.push(ValidationError::Missing {
                field: "serviceofferingid",
            });
        }
        if self.deploy_params.data_disk_size.is_some() && self.deploy_params.disk_offering_id.is_none() {
            report.push(ValidationError::Rule(
                "size requires diskofferingid".into(),
            ));
        }
        report.into_result(())
    }

    /// Checks that every parameter the given counters need is present.
    ///
    /// # Errors
    ///
    /// Returns one error per missing parameter.
    pub fn check_counter_params<'a>(
        &self,
        counters: impl IntoIterator<Item = &'a Counter>,
    ) -> Result<(), ValidationErrors> {
        let mut report = ValidationErrors::new();
        for counter in counters {
            for param in counter.source.required_params() {
                if self.counter_param(param).is_none() {
                    report.push(ValidationError::MissingCounterParam {
                        counter: counter.name.clone(),
                        param: (*param).to_string(),
                    });
                }
            }
        }
        report.into_result(())
    }
}
