//! Derives and publishes set status: replica counters and the `Scaling`
//! condition.

use super::predicates;
use crate::util::{Error, patch};
use chrono::Utc;
use gsorch_types::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{Api, ResourceExt};

/// Stringified form of the set's match labels, mirrored into the status for
/// scale clients.
pub(super) fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Replica arithmetic over the owned servers. Conditions are carried over
/// untouched; they have their own write path.
pub(super) fn compute_status(set: &GameServerSet, owned: &[GameServer]) -> GameServerSetStatus {
    let mut replicas = 0;
    let mut ready_replicas = 0;
    for gs in owned {
        if predicates::is_being_deleted(gs) {
            continue;
        }
        replicas += 1;
        let running = matches!(
            gs.status.as_ref().and_then(|s| s.state),
            Some(GameServerState::Running)
        );
        if running && !predicates::is_deletable_with_gates(gs) {
            ready_replicas += 1;
        }
    }
    GameServerSetStatus {
        replicas,
        ready_replicas,
        observed_generation: set.metadata.generation,
        selector: Some(selector_string(&set.spec.selector)),
        conditions: set.status.as_ref().and_then(|s| s.conditions.clone()),
    }
}

/// Publishes the computed status when it differs from the cached one,
/// re-getting and retrying on resource-version conflicts.
pub(super) async fn publish(
    api: &Api<GameServerSet>,
    set: &GameServerSet,
    owned: &[GameServer],
) -> Result<(), Error> {
    let status = compute_status(set, owned);
    if set.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let name = set.name_any();
    let mut attempt = set.clone();
    for _ in 0..3 {
        attempt.status = Some(status.clone());
        match patch::update_set_status(api, &name, &attempt).await {
            Ok(_) => return Ok(()),
            Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 409 => {
                attempt = api.get(&name).await?;
            }
            Err(e) => return Err(e),
        }
    }
    // Still conflicting; the next reconciliation redoes the work.
    Ok(())
}

fn scaling_condition_true(set: &GameServerSet) -> bool {
    set.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().rev().find(|c| c.type_ == SCALING_CONDITION))
        .is_some_and(|c| c.status == ConditionStatus::True)
}

/// Aligns the `Scaling` condition with the scaling-replicas annotation.
/// Conditions-only deltas go through a merge patch on the status subresource
/// so they never conflict with spec writers.
pub(super) async fn sync_scaling_condition(
    api: &Api<GameServerSet>,
    set: &GameServerSet,
) -> Result<(), Error> {
    let want = set.scaling_replicas();
    if want == scaling_condition_true(set) {
        return Ok(());
    }
    let mut conditions = set
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    let condition = GameServerSetCondition {
        type_: SCALING_CONDITION.to_owned(),
        status: if want {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: Some(if want { "ScaleRequested" } else { "ScaleSettled" }.to_owned()),
        message: Some(
            if want {
                "A scale operation is in progress."
            } else {
                "No scale operation is in progress."
            }
            .to_owned(),
        ),
        last_transition_time: Some(Time(Utc::now())),
    };
    match conditions.iter_mut().find(|c| c.type_ == SCALING_CONDITION) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
    patch::patch_set_conditions(api, set, &conditions).await?;
    Ok(())
}

/// Scale-down finished: drop the transient annotation and the `Scaling`
/// condition together.
pub(super) async fn clear_scaling(api: &Api<GameServerSet>, set: &GameServerSet) -> Result<(), Error> {
    patch::patch_set_annotation(api, &set.name_any(), SCALING_REPLICAS_ANNOTATION, None).await?;
    let conditions: Vec<GameServerSetCondition> = set
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|c| c.type_ != SCALING_CONDITION)
        .collect();
    patch::patch_set_conditions(api, set, &conditions).await?;
    Ok(())
}
