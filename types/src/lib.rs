use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

fn default_repository() -> String {
    "coraldb/coral".to_string()
}

/// An ordered set of failure domains making up one datacenter.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DatacenterSpec {
    pub name: String,
    pub racks: Vec<RackSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RackSpec {
    pub name: String,
    pub members: i32,
    #[serde(default)]
    pub storage: StorageSpec,
    #[serde(default)]
    pub placement: PlacementSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct StorageSpec {
    pub capacity: Option<String>,
    pub storage_class_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlacementSpec {
    pub node_selector: Option<BTreeMap<String, String>>,
}

/// Tuning knobs for the multi-phase (major/minor) upgrade procedure.
/// Durations are free-form strings such as "1s" or "500ms".
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GenericUpgradeSpec {
    pub poll_interval: Option<String>,
    pub validation_timeout: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "db.coral.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    derive = "PartialEq",
    status = "ClusterStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.version\", \"name\": \"VERSION\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct ClusterSpec {
    /// Desired CoralDB version, e.g. "5.2.0". Also the image tag.
    pub version: String,
    #[serde(default = "default_repository")]
    pub repository: String,
    pub datacenter: DatacenterSpec,
    pub generic_upgrade: Option<GenericUpgradeSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RackConditionType {
    MemberLeaving,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RackCondition {
    #[serde(rename = "type")]
    pub condition_type: RackConditionType,
    pub status: ConditionStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RackStatus {
    /// Version observed on the rack's workload, not the declared one.
    pub version: String,
    pub members: i32,
    pub ready_members: i32,
    #[serde(default)]
    pub conditions: Vec<RackCondition>,
}

impl RackStatus {
    pub fn condition_is_true(&self, condition_type: RackConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
    }

    pub fn set_condition(&mut self, condition_type: RackConditionType, status: ConditionStatus) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => existing.status = status,
            None => self.conditions.push(RackCondition {
                condition_type,
                status,
            }),
        }
    }
}

/// Cluster-level phase of the version-upgrade procedure.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum UpgradeState {
    BeginUpgrade,
    ValidateSchemaAgreement,
    SystemSnapshot,
    PerNodeLoop,
    ClearSystemSnapshot,
    Done,
}

/// Per-node phase while the upgrade is inside `PerNodeLoop`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NodeUpgradeState {
    PreNode,
    EnterMaintenance,
    Drain,
    DataSnapshot,
    ExitMaintenance,
    DeletePod,
    AwaitReady,
    ClearDataSnapshot,
    PostNode,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpgradeState::BeginUpgrade => "BeginUpgrade",
            UpgradeState::ValidateSchemaAgreement => "ValidateSchemaAgreement",
            UpgradeState::SystemSnapshot => "SystemSnapshot",
            UpgradeState::PerNodeLoop => "PerNodeLoop",
            UpgradeState::ClearSystemSnapshot => "ClearSystemSnapshot",
            UpgradeState::Done => "Done",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for NodeUpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeUpgradeState::PreNode => "PreNode",
            NodeUpgradeState::EnterMaintenance => "EnterMaintenance",
            NodeUpgradeState::Drain => "Drain",
            NodeUpgradeState::DataSnapshot => "DataSnapshot",
            NodeUpgradeState::ExitMaintenance => "ExitMaintenance",
            NodeUpgradeState::DeletePod => "DeletePod",
            NodeUpgradeState::AwaitReady => "AwaitReady",
            NodeUpgradeState::ClearDataSnapshot => "ClearDataSnapshot",
            NodeUpgradeState::PostNode => "PostNode",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for UpgradeState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BeginUpgrade" => Ok(UpgradeState::BeginUpgrade),
            "ValidateSchemaAgreement" => Ok(UpgradeState::ValidateSchemaAgreement),
            "SystemSnapshot" => Ok(UpgradeState::SystemSnapshot),
            "PerNodeLoop" => Ok(UpgradeState::PerNodeLoop),
            "ClearSystemSnapshot" => Ok(UpgradeState::ClearSystemSnapshot),
            "Done" => Ok(UpgradeState::Done),
            _ => Err(()),
        }
    }
}

/// Present on the Cluster status iff a major/minor upgrade is in flight.
/// Keyspace lists and snapshot tags are captured once when the upgrade
/// starts so that snapshot and clear operate on the same set.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct UpgradeStatus {
    pub state: UpgradeState,
    pub node_state: Option<NodeUpgradeState>,
    pub current_rack: String,
    pub current_node: i32,
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub system_snapshot_tag: String,
    #[serde(default)]
    pub data_snapshot_tag: String,
    #[serde(default)]
    pub system_keyspaces: Vec<String>,
    #[serde(default)]
    pub all_keyspaces: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterStatus {
    #[serde(default)]
    pub racks: BTreeMap<String, RackStatus>,
    pub upgrade: Option<UpgradeStatus>,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

impl Cluster {
    /// Rack spec lookup by name.
    pub fn rack_spec(&self, name: &str) -> Option<&RackSpec> {
        self.spec.datacenter.racks.iter().find(|r| r.name == name)
    }

    pub fn rack_status(&self, name: &str) -> Option<&RackStatus> {
        self.status.as_ref().and_then(|s| s.racks.get(name))
    }

    pub fn upgrade_status(&self) -> Option<&UpgradeStatus> {
        self.status.as_ref().and_then(|s| s.upgrade.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rack_condition_set_and_query() {
        let mut status = RackStatus::default();
        assert!(!status.condition_is_true(RackConditionType::MemberLeaving));

        status.set_condition(RackConditionType::MemberLeaving, ConditionStatus::True);
        assert!(status.condition_is_true(RackConditionType::MemberLeaving));

        status.set_condition(RackConditionType::MemberLeaving, ConditionStatus::False);
        assert!(!status.condition_is_true(RackConditionType::MemberLeaving));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn repository_defaults_when_omitted() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "version": "5.2.0",
            "datacenter": { "name": "dc1", "racks": [] },
        }))
        .unwrap();
        assert_eq!(spec.repository, "coraldb/coral");
        assert!(spec.generic_upgrade.is_none());
    }

    #[test]
    fn upgrade_state_round_trips_through_str() {
        for state in [
            UpgradeState::BeginUpgrade,
            UpgradeState::ValidateSchemaAgreement,
            UpgradeState::SystemSnapshot,
            UpgradeState::PerNodeLoop,
            UpgradeState::ClearSystemSnapshot,
            UpgradeState::Done,
        ] {
            assert_eq!(state.to_string().parse::<UpgradeState>(), Ok(state));
        }
    }
}
