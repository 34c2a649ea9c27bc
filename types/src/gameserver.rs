use k8s_openapi::api::core::v1::{LoadBalancerIngress, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "gsorch.dev",
    version = "v1",
    kind = "GameServer",
    plural = "gameservers",
    shortname = "gs",
    derive = "PartialEq",
    status = "GameServerStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.state\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.nodeName\", \"name\": \"NODE\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Ports the game server exposes, expanded onto the pod when the
    /// template uses host networking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<GameServerPort>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<SidecarSettings>,

    /// Externally applied flags; `NotInService` marks the server for drain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<Constraint>>,

    /// Condition types that must all be True before the server counts as ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_gates: Option<Vec<String>>,

    /// Condition types that must all be True before the server may be deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletable_gates: Option<Vec<String>>,

    pub template: PodTemplateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_policy: Option<PortPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port_range: Option<PortRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port_range: Option<PortRange>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub min_port: i32,
    pub max_port: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum PortPolicy {
    #[default]
    Dynamic,
    Static,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum SchedulingStrategy {
    /// Pack game servers together so whole nodes free up for scale-in.
    #[default]
    MostAllocated,
    LeastAllocated,
}

impl FromStr for SchedulingStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MostAllocated" => Ok(SchedulingStrategy::MostAllocated),
            "LeastAllocated" => Ok(SchedulingStrategy::LeastAllocated),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingStrategy::MostAllocated => write!(f, "MostAllocated"),
            SchedulingStrategy::LeastAllocated => write!(f, "LeastAllocated"),
        }
    }
}

/// Tuning for the SDK sidecar injected next to the game-server container.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    #[serde(rename = "type")]
    pub type_: ConstraintType,

    /// Whether the constraint is currently enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ConstraintType {
    #[default]
    NotInService,
}

/// Status object for the [`GameServer`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<GameServerState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Load-balancer ingress endpoints when host-port networking is in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ingress: Option<Vec<LoadBalancerIngress>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<GameServerCondition>>,
}

/// A short description of the [`GameServer`] resource's current state.
/// The unset state is modeled as `None` on the status field.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema)]
pub enum GameServerState {
    Starting,
    Running,
    Failed,
    Exited,
}

impl FromStr for GameServerState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Starting" => Ok(GameServerState::Starting),
            "Running" => Ok(GameServerState::Running),
            "Failed" => Ok(GameServerState::Failed),
            "Exited" => Ok(GameServerState::Exited),
            _ => Err(()),
        }
    }
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameServerState::Starting => write!(f, "Starting"),
            GameServerState::Running => write!(f, "Running"),
            GameServerState::Failed => write!(f, "Failed"),
            GameServerState::Exited => write!(f, "Exited"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}
