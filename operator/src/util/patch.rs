use crate::util::Error;
use gsorch_types::*;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;

/// Merge-patches the status subresource of a game server. The closure mutates
/// a copy of the current status; the whole status object is sent so list
/// fields (conditions) are replaced, not appended.
pub async fn patch_game_server_status<F>(
    api: &Api<GameServer>,
    gs: &GameServer,
    mutate: F,
) -> Result<GameServer, Error>
where
    F: FnOnce(&mut GameServerStatus),
{
    let mut status = gs.status.clone().unwrap_or_default();
    mutate(&mut status);
    let patch = json!({ "status": status });
    Ok(api
        .patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Replaces the status subresource of a set wholesale. Carries the cached
/// resource version, so a concurrent writer surfaces as a 409 for the caller
/// to retry.
pub async fn update_set_status(
    api: &Api<GameServerSet>,
    name: &str,
    set: &GameServerSet,
) -> Result<GameServerSet, Error> {
    let data = serde_json::to_vec(set)?;
    Ok(api.replace_status(name, &PostParams::default(), data).await?)
}

/// Merge-patches only the condition list on a set's status subresource,
/// leaving the replica counters alone.
pub async fn patch_set_conditions(
    api: &Api<GameServerSet>,
    set: &GameServerSet,
    conditions: &[GameServerSetCondition],
) -> Result<GameServerSet, Error> {
    let patch = json!({ "status": { "conditions": conditions } });
    Ok(api
        .patch_status(&set.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Sets or removes (value `None`) a single annotation via merge patch.
pub async fn patch_set_annotation(
    api: &Api<GameServerSet>,
    name: &str,
    key: &str,
    value: Option<&str>,
) -> Result<GameServerSet, Error> {
    let patch = json!({ "metadata": { "annotations": { key: value } } });
    Ok(api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}
