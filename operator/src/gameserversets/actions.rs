//! Write phase of set reconciliation: bounded-parallel create, soft-delete,
//! and out-of-service marking.

use super::reconcile::{ContextData, ReplicaAction};
use super::{builder, hash, predicates, selector, status};
use crate::util::{
    CREATION_PARALLELISM, Error, UPDATE_PARALLELISM, messages, patch,
};
use chrono::Utc;
use futures::{StreamExt, stream};
use gsorch_types::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::PostParams;
use kube::{Api, ResourceExt};

/// Per-server mutation applied atomically with the out-of-service marking,
/// so observers never see the constraint without its companion metadata.
pub(super) type Mutator<'a> = &'a (dyn Fn(&mut GameServer) + Send + Sync);

pub(super) async fn execute(
    context: &ContextData,
    sets: &Api<GameServerSet>,
    game_servers: &Api<GameServer>,
    set: &GameServerSet,
    action: &ReplicaAction,
) -> Result<(), Error> {
    if action.to_add > 0 {
        create_game_servers(context, game_servers, set, action.to_add).await?;
    }

    if !action.to_delete.is_empty() {
        let classified = selector::classify(&action.to_delete, false);
        let (deletables, runnings) = classified.deletion_list();

        let deleted = delete_game_servers(context, game_servers, set, deletables).await?;

        mark_out_of_service(
            context,
            game_servers,
            set,
            &runnings,
            &[],
            messages::NOT_IN_SERVICE_SCALE_DOWN,
        )
        .await?;

        // Scale-down satisfied: drop the transient scaling markers.
        if set.scaling_replicas() && deleted as i32 == action.observed - set.spec.replicas {
            status::clear_scaling(sets, set).await?;
        }
    }

    Ok(())
}

/// Creates `count` servers from the set's template, sixteen requests in
/// flight at a time. Sibling failures do not abort each other.
pub(super) async fn create_game_servers(
    context: &ContextData,
    game_servers: &Api<GameServer>,
    set: &GameServerSet,
    count: usize,
) -> Result<(), Error> {
    let revision = set
        .revision_hash()
        .map(str::to_owned)
        .unwrap_or_else(|| hash::template_hash(&set.spec.template));

    // Surface template problems once, before fanning out the whole batch; a
    // template that cannot realize a pod aborts this key until it is edited.
    let probe = builder::new_game_server(set, &revision);
    builder::build_pod(&probe, &context.config)?;

    let results: Vec<Result<String, Error>> = stream::iter(0..count)
        .map(|_| {
            let api = game_servers.clone();
            let gs = builder::new_game_server(set, &revision);
            async move {
                let created = api.create(&PostParams::default(), &gs).await?;
                Ok(created.name_any())
            }
        })
        .buffer_unordered(CREATION_PARALLELISM)
        .collect()
        .await;

    let mut created: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for result in results {
        match result {
            Ok(name) => created.push(name),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !created.is_empty() {
        context
            .publish_event(
                set,
                "SuccessfulCreate",
                "Create",
                format!(
                    "Created {} of {} game servers for set {}: {:?}",
                    created.len(),
                    count,
                    set.name_any(),
                    created
                ),
            )
            .await;
    }
    if !errors.is_empty() {
        return Err(Error::aggregate("create", count, errors));
    }
    Ok(())
}

/// Soft-deletes the given servers by driving their state to `Exited`; the
/// per-server controller owns the actual teardown. Returns how many were
/// deleted this call.
pub(super) async fn delete_game_servers(
    context: &ContextData,
    game_servers: &Api<GameServer>,
    set: &GameServerSet,
    list: Vec<GameServer>,
) -> Result<usize, Error> {
    if list.is_empty() {
        return Ok(0);
    }
    let total = list.len();
    let names: Vec<String> = list.iter().map(|gs| gs.name_any()).collect();
    context
        .publish_event(
            set,
            "ToDelete",
            "SoftDelete",
            format!("Deleting game servers of set {}: {:?}", set.name_any(), names),
        )
        .await;

    let results: Vec<Result<bool, Error>> = stream::iter(list)
        .map(|gs| {
            let api = game_servers.clone();
            async move { soft_delete(&api, gs).await }
        })
        .buffer_unordered(UPDATE_PARALLELISM)
        .collect()
        .await;

    let mut deleted = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for result in results {
        match result {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(e) => errors.push(e.to_string()),
        }
    }

    if deleted > 0 {
        context
            .publish_event(
                set,
                "SuccessfulDelete",
                "SoftDelete",
                format!("Deleted {} of {} game servers for set {}", deleted, total, set.name_any()),
            )
            .await;
    }
    if !errors.is_empty() {
        return Err(Error::aggregate("delete", total, errors));
    }
    Ok(deleted)
}

/// Returns false when the server was skipped rather than deleted.
async fn soft_delete(api: &Api<GameServer>, gs: GameServer) -> Result<bool, Error> {
    let mut target = gs;
    if predicates::is_before_ready(&target) {
        // The cached view may lag a just-finished startup; only the store of
        // record can rule out deleting a server that went Ready meanwhile.
        match api.get(&target.name_any()).await {
            Ok(fresh) => {
                let has_gates = fresh
                    .spec
                    .readiness_gates
                    .as_ref()
                    .is_some_and(|g| !g.is_empty());
                if predicates::is_ready(&fresh) && has_gates {
                    return Ok(false);
                }
                target = fresh;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    patch::patch_game_server_status(api, &target, |status| {
        status.state = Some(GameServerState::Exited);
    })
    .await?;
    Ok(true)
}

/// Marks the given servers out of service so their drain begins. Servers
/// that are before-ready, already mid-update, or being deleted are skipped.
/// Returns the post-write objects of the servers actually marked.
pub(super) async fn mark_out_of_service(
    context: &ContextData,
    game_servers: &Api<GameServer>,
    set: &GameServerSet,
    list: &[GameServer],
    mutators: &[Mutator<'_>],
    message: &str,
) -> Result<Vec<GameServer>, Error> {
    let mut eligible: Vec<GameServer> = Vec::new();
    for gs in list {
        if predicates::is_before_ready(gs)
            || predicates::is_in_place_updating(gs)
            || predicates::is_being_deleted(gs)
        {
            continue;
        }
        let mut gs = gs.clone();
        for mutator in mutators {
            mutator(&mut gs);
        }
        if gs.spec.deletable_gates.as_ref().is_some_and(|g| !g.is_empty()) {
            upsert_not_in_service(&mut gs, message);
        }
        eligible.push(gs);
    }
    if eligible.is_empty() {
        return Ok(Vec::new());
    }
    let total = eligible.len();

    let results: Vec<Result<GameServer, Error>> = stream::iter(eligible)
        .map(|gs| {
            let api = game_servers.clone();
            async move {
                let updated = api
                    .replace(&gs.name_any(), &PostParams::default(), &gs)
                    .await?;
                Ok(updated)
            }
        })
        .buffer_unordered(UPDATE_PARALLELISM)
        .collect()
        .await;

    let mut marked: Vec<GameServer> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for result in results {
        match result {
            Ok(gs) => marked.push(gs),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !marked.is_empty() {
        let names: Vec<String> = marked.iter().map(|gs| gs.name_any()).collect();
        context
            .publish_event(
                set,
                "SuccessfulMark",
                "MarkOutOfService",
                format!(
                    "Marked {} of {} game servers of set {} out of service: {:?}",
                    marked.len(),
                    total,
                    set.name_any(),
                    names
                ),
            )
            .await;
    }
    if !errors.is_empty() {
        return Err(Error::aggregate("mark", total, errors));
    }
    Ok(marked)
}

fn upsert_not_in_service(gs: &mut GameServer, message: &str) {
    let constraint = Constraint {
        type_: ConstraintType::NotInService,
        effective: Some(true),
        message: Some(message.to_owned()),
        time_added: Some(Time(Utc::now())),
    };
    let constraints = gs.spec.constraints.get_or_insert_with(Vec::new);
    match constraints
        .iter_mut()
        .find(|c| c.type_ == ConstraintType::NotInService)
    {
        Some(existing) => *existing = constraint,
        None => constraints.push(constraint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_not_in_service_appends_once() {
        let mut gs = GameServer::new("gs-0", GameServerSpec::default());
        upsert_not_in_service(&mut gs, "drain for scale down");
        upsert_not_in_service(&mut gs, "drain again");
        let constraints = gs.spec.constraints.as_ref().unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].effective, Some(true));
        assert_eq!(constraints[0].message.as_deref(), Some("drain again"));
        assert!(constraints[0].time_added.is_some());
    }
}
