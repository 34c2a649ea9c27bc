//! In-place rollout inside a set: drain old-revision servers, swap their
//! image/resources/env without replacing them, and publish progress.

use super::reconcile::ContextData;
use super::{actions, builder, hash, predicates, selector};
use crate::util::{Error, UPDATE_PARALLELISM, messages, patch};
use futures::{StreamExt, stream};
use gsorch_types::*;
use k8s_openapi::api::core::v1::Container;
use kube::api::PostParams;
use kube::{Api, ResourceExt};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Retry cadence and give-up deadline for the progress-publish loop.
const PROGRESS_PUBLISH_PERIOD: Duration = Duration::from_secs(1);
const PROGRESS_PUBLISH_DEADLINE: Duration = Duration::from_secs(50);

fn desired_updated(set: &GameServerSet) -> i32 {
    set.spec
        .inplace_update
        .as_ref()
        .and_then(|strategy| strategy.threshold.as_ref())
        .map(|threshold| resolve_threshold(threshold, set.spec.replicas))
        .unwrap_or(0)
}

/// The set is mid-rollout iff its owner stamped the marker and the resolved
/// batch target is positive.
fn is_updating(set: &GameServerSet) -> bool {
    set.in_place_update_marker().is_some() && desired_updated(set) > 0
}

fn partition_by_revision(owned: &[GameServer], revision: &str) -> (Vec<GameServer>, Vec<GameServer>) {
    owned.iter().cloned().partition(|gs| {
        gs.labels()
            .get(GAME_SERVER_HASH_LABEL)
            .is_some_and(|h| h == revision)
    })
}

/// Old-revision servers in update-preference order: already-updating first,
/// then the not-yet-ready, then the drained, each oldest-first; servers
/// still draining or serving come last.
fn assemble_candidates(old_servers: &[GameServer], want: usize) -> Vec<GameServer> {
    let mut classified = selector::classify(old_servers, true);
    selector::sort_by_creation(&mut classified.in_place_updatings);
    selector::sort_by_creation(&mut classified.not_readys);
    selector::sort_by_creation(&mut classified.deletables);
    selector::sort_by_creation(&mut classified.delete_candidates);
    selector::sort_by_creation(&mut classified.runnings);

    let mut candidates = classified.in_place_updatings;
    candidates.extend(classified.not_readys);
    candidates.extend(classified.deletables);
    candidates.extend(classified.delete_candidates);
    candidates.extend(classified.runnings);
    candidates.truncate(want);
    candidates
}

fn template_game_server_container(set: &GameServerSet) -> Result<Container, Error> {
    set.spec
        .template
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|s| {
            s.containers
                .iter()
                .find(|c| c.name == GAME_SERVER_CONTAINER)
        })
        .cloned()
        .ok_or_else(|| Error::MissingContainer(GAME_SERVER_CONTAINER.to_owned()))
}

pub(super) async fn reconcile_in_place(
    context: &ContextData,
    sets: &Api<GameServerSet>,
    game_servers: &Api<GameServer>,
    set: &GameServerSet,
    owned: &[GameServer],
) -> Result<(), Error> {
    if !is_updating(set) {
        return Ok(());
    }
    let desired = desired_updated(set);
    let revision = set
        .revision_hash()
        .map(str::to_owned)
        .unwrap_or_else(|| hash::template_hash(&set.spec.template));

    let (new_servers, old_servers) = partition_by_revision(owned, &revision);
    let updated_count = set.in_place_updated_replicas();

    let diff = desired - new_servers.len() as i32;
    if diff <= 0 || updated_count >= desired {
        // Target met. Scale-up may have minted fresh replicas already on the
        // new revision; fold them into the published count.
        if new_servers.len() as i32 > updated_count {
            publish_progress(context, sets, &set.name_any(), new_servers.len() as i32).await;
        }
        return Ok(());
    }

    let source = template_game_server_container(set)?;
    let mut candidates = assemble_candidates(&old_servers, diff as usize);

    // Mark first, with the updating annotation applied in the same write as
    // the constraint, so observers see "draining for update" rather than
    // "draining for deletion".
    let set_updating: actions::Mutator<'_> =
        &|gs: &mut GameServer| gs.set_in_place_updating(true);
    let marked = actions::mark_out_of_service(
        context,
        game_servers,
        set,
        &candidates,
        &[set_updating],
        messages::NOT_IN_SERVICE_IN_PLACE,
    )
    .await?;
    for updated in marked {
        if let Some(candidate) = candidates
            .iter_mut()
            .find(|c| c.name_any() == updated.name_any())
        {
            *candidate = updated;
        }
    }

    let swappable: Vec<GameServer> = candidates
        .into_iter()
        .filter(predicates::can_in_place_updating)
        .collect();
    let total = swappable.len();

    let results: Vec<Result<bool, Error>> = stream::iter(swappable)
        .map(|gs| {
            let api = game_servers.clone();
            let source = source.clone();
            let revision = revision.clone();
            async move { swap(&api, &source, &revision, gs).await }
        })
        .buffer_unordered(UPDATE_PARALLELISM)
        .collect()
        .await;

    let mut successes = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for result in results {
        match result {
            Ok(true) => successes += 1,
            Ok(false) => {}
            Err(e) => errors.push(e.to_string()),
        }
    }

    if successes > 0 {
        context
            .publish_event(
                set,
                "SuccessfulUpdate",
                "InPlaceUpdate",
                format!(
                    "In-place updated {} game servers of set {} to revision {}",
                    successes,
                    set.name_any(),
                    revision
                ),
            )
            .await;
        // Swap successes stand even if this publish gives up; the counter is
        // reconciled on the next pass.
        publish_progress(
            context,
            sets,
            &set.name_any(),
            updated_count + successes as i32,
        )
        .await;
    }

    if !errors.is_empty() {
        return Err(Error::aggregate("in-place update", total, errors));
    }
    Ok(())
}

/// Returns false when the server was skipped rather than swapped.
async fn swap(
    api: &Api<GameServer>,
    source: &Container,
    revision: &str,
    gs: GameServer,
) -> Result<bool, Error> {
    let mut target = gs;
    if predicates::is_before_ready(&target) {
        // Same cache-lag guard as deletion: never swap under a server that
        // just went Ready.
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

    // Wipe conditions so the readiness gates re-evaluate against the new
    // image once it comes up.
    let mut target = patch::patch_game_server_status(api, &target, |status| {
        status.conditions = Some(Vec::new());
    })
    .await?;

    let template_spec = target
        .spec
        .template
        .spec
        .as_mut()
        .ok_or_else(|| Error::MissingContainer(GAME_SERVER_CONTAINER.to_owned()))?;
    let container = template_spec
        .containers
        .iter_mut()
        .find(|c| c.name == GAME_SERVER_CONTAINER)
        .ok_or_else(|| Error::MissingContainer(GAME_SERVER_CONTAINER.to_owned()))?;
    builder::copy_game_server_container(container, source);

    target
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(GAME_SERVER_HASH_LABEL.to_owned(), revision.to_owned());
    target.spec.constraints = None;
    target.set_in_place_updating(false);

    api.replace(&target.name_any(), &PostParams::default(), &target)
        .await?;
    Ok(true)
}

/// Writes the updated-replica counter, re-getting the set between attempts.
/// Exits on success, on observing the store already caught up, on the
/// deadline, or on shutdown. Never propagates an error.
async fn publish_progress(
    context: &ContextData,
    sets: &Api<GameServerSet>,
    name: &str,
    value: i32,
) {
    let deadline = tokio::time::Instant::now() + PROGRESS_PUBLISH_DEADLINE;
    loop {
        match sets.get(name).await {
            Ok(fresh) => {
                if fresh.in_place_updated_replicas() >= value {
                    return;
                }
                match patch::patch_set_annotation(
                    sets,
                    name,
                    IN_PLACE_UPDATED_REPLICAS_ANNOTATION,
                    Some(&value.to_string()),
                )
                .await
                {
                    Ok(_) => return,
                    Err(e) => eprintln!(
                        "{}",
                        format!("Failed to publish in-place progress for {}: {}", name, e).red()
                    ),
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                // Whole set gone; nothing to publish against.
                return;
            }
            Err(e) => eprintln!(
                "{}",
                format!("Failed to re-read set {} for progress publish: {}", name, e).red()
            ),
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!(
                "{}",
                format!("Giving up publishing in-place progress for {}", name).red()
            );
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(PROGRESS_PUBLISH_PERIOD) => {}
            _ = context.shutdown.cancelled() => return,
        }
    }
}
