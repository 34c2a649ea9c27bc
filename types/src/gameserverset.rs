use crate::{ConditionStatus, GameServerSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "gsorch.dev",
    version = "v1",
    kind = "GameServerSet",
    plural = "gameserversets",
    shortname = "gss",
    derive = "PartialEq",
    status = "GameServerSetStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.replicas\", \"name\": \"DESIRED\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.replicas\", \"name\": \"CURRENT\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.readyReplicas\", \"name\": \"READY\", \"type\": \"integer\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    pub replicas: i32,

    pub selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<crate::SchedulingStrategy>,

    /// When true, game servers already drained under an externally applied
    /// `NotInService` constraint are left out of the replica arithmetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_constraints: Option<bool>,

    pub template: GameServerTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inplace_update: Option<InPlaceUpdateStrategy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    pub spec: GameServerSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateStrategy {
    /// Batch size for an in-place rollout, absolute or a percentage of the
    /// desired replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<IntOrString>,
}

/// Resolves an absolute-or-percentage threshold against the desired replica
/// count. Percentages round up; malformed values resolve to zero.
pub fn resolve_threshold(threshold: &IntOrString, replicas: i32) -> i32 {
    let resolved = match threshold {
        IntOrString::Int(v) => *v,
        IntOrString::String(s) => match s.strip_suffix('%') {
            Some(percent) => match percent.trim().parse::<i64>() {
                Ok(p) if p >= 0 => ((replicas as i64 * p + 99) / 100) as i32,
                _ => 0,
            },
            None => 0,
        },
    };
    resolved.max(0).min(replicas.max(0))
}

/// Status object for the [`GameServerSet`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// Game servers owned by the set and not yet being torn down.
    pub replicas: i32,

    /// Owned game servers that are Running and not already drained.
    pub ready_replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<GameServerSetCondition>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_threshold_absolute() {
        assert_eq!(resolve_threshold(&IntOrString::Int(3), 10), 3);
        assert_eq!(resolve_threshold(&IntOrString::Int(0), 10), 0);
    }

    #[test]
    fn test_resolve_threshold_clamps_to_replicas() {
        assert_eq!(resolve_threshold(&IntOrString::Int(25), 10), 10);
        assert_eq!(resolve_threshold(&IntOrString::Int(-4), 10), 0);
    }

    #[test]
    fn test_resolve_threshold_percentage_rounds_up() {
        assert_eq!(
            resolve_threshold(&IntOrString::String("25%".to_owned()), 10),
            3
        );
        assert_eq!(
            resolve_threshold(&IntOrString::String("100%".to_owned()), 7),
            7
        );
    }

    #[test]
    fn test_resolve_threshold_malformed() {
        assert_eq!(
            resolve_threshold(&IntOrString::String("lots".to_owned()), 10),
            0
        );
        assert_eq!(
            resolve_threshold(&IntOrString::String("-10%".to_owned()), 10),
            0
        );
    }
}
