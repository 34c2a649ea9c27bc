use futures::stream::StreamExt;
use gsorch_types::*;
use kube::api::ListParams;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::{Controller, controller, controller::Action};
use kube::{Api, Resource, ResourceExt, client::Client};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::counter::{self, NodeCounter};
use super::{OperatorConfig, actions, inplace, predicates, selector, status};
use crate::util::{
    Error, MAX_CREATIONS_PER_SYNC, MAX_DELETIONS_PER_SYNC, MAX_PENDING_GAME_SERVERS,
    PROBE_INTERVAL, REPORTER,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `GameServerSet` controller.
pub async fn run(client: Client, config: OperatorConfig, workers: u16) -> Result<(), Error> {
    println!("{}", "Starting GameServerSet controller...".green());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("{}", "Shutdown signal received, draining workers...".yellow());
                shutdown.cancel();
            }
        });
    }

    // The node census is fed from its own watch of the game-server change
    // feed, independent of the reconcile queue.
    let node_counter = Arc::new(NodeCounter::new());
    tokio::spawn(counter::run_feed(
        client.clone(),
        node_counter.clone(),
        shutdown.clone(),
    ));

    let crd_api: Api<GameServerSet> = Api::all(client.clone());
    let context: Arc<ContextData> = Arc::new(ContextData::new(
        client.clone(),
        node_counter,
        config,
        shutdown.clone(),
    ));

    gsorch_common::signal_ready();

    // The controller comes from the `kube_runtime` crate and manages the
    // reconciliation process: it owns the `GameServerSet` resource, watches
    // the `GameServer` resources it creates, and maps their events back onto
    // the owning set by owner reference. Per-key work is serialized; distinct
    // keys are reconciled by up to `workers` concurrent workers.
    Controller::new(crd_api, Default::default())
        .owns(Api::<GameServer>::all(client), Default::default())
        .with_config(controller::Config::default().concurrency(workers))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_reconciliation_result| async move {})
        .await;
    Ok(())
}

/// Shared state handed to every reconciliation: the client, the node census,
/// the operator knobs, and the event recorder.
pub(super) struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    pub client: Client,

    /// Node -> live game server census for the packing sort.
    pub node_counter: Arc<NodeCounter>,

    pub config: OperatorConfig,

    pub shutdown: CancellationToken,

    recorder: Recorder,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(
        client: Client,
        node_counter: Arc<NodeCounter>,
        config: OperatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let recorder = Recorder::new(client.clone(), REPORTER.clone());
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                node_counter,
                config,
                shutdown,
                recorder,
                metrics: ControllerMetrics::new("gameserversets"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                node_counter,
                config,
                shutdown,
                recorder,
            }
        }
    }

    /// Publishes a normal event against the set. Event delivery is best
    /// effort; failures are logged and swallowed.
    pub async fn publish_event(
        &self,
        set: &GameServerSet,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_owned(),
            note: Some(note),
            action: action.to_owned(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &set.object_ref(&())).await {
            eprintln!("{}", format!("Failed to publish {} event: {}", reason, e).red());
        }
    }
}

/// One tick's worth of replica work, bounded by the batch caps.
#[derive(Debug, Default, PartialEq)]
pub(super) struct ReplicaAction {
    pub to_add: usize,

    /// Victims in deletion-preference order: chosen scale-down candidates
    /// followed by the already-drained servers.
    pub to_delete: Vec<GameServer>,

    /// A batch cap was hit; the set wants an immediate requeue.
    pub partial: bool,

    /// Owned servers not currently being torn down, for the scale-down
    /// completion check.
    pub observed: i32,
}

impl ReplicaAction {
    fn kind(&self) -> &str {
        if self.to_add > 0 {
            "ScaleUp"
        } else if !self.to_delete.is_empty() {
            "ScaleDown"
        } else {
            "NoOp"
        }
    }

    fn has_work(&self) -> bool {
        self.to_add > 0 || !self.to_delete.is_empty()
    }
}

/// Reconciliation function for the `GameServerSet` resource.
async fn reconcile(instance: Arc<GameServerSet>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected GameServerSet resource to be namespaced. Can't reconcile an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    let sets: Api<GameServerSet> = Api::namespaced(client.clone(), &namespace);
    let game_servers: Api<GameServer> = Api::namespaced(client.clone(), &namespace);

    // Surface in-progress scaling on the status conditions before anything
    // else so observers see the transition even if this tick bails early.
    status::sync_scaling_condition(&sets, &instance).await?;

    let selector = status::selector_string(&instance.spec.selector);
    let owned = game_servers
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase: everything after this acts on the computed action, never
    // on the raw list.
    let action = determine_action(&instance, &owned, &context.node_counter);

    if action.has_work() {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            format!(
                "{} add={} delete={} partial={}",
                action.kind(),
                action.to_add,
                action.to_delete.len(),
                action.partial
            )
            .color(FG2),
        );
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.kind()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.kind()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action.has_work() {
        false => None,
        true => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.kind()])
                .start_timer(),
        ),
    };

    // Write phase: create, soft-delete, and mark in bounded parallel batches.
    actions::execute(&context, &sets, &game_servers, &instance, &action).await?;

    // Publish observed replica counts after the scale work, before the
    // in-place pass.
    status::publish(&sets, &instance, &owned).await?;

    inplace::reconcile_in_place(&context, &sets, &game_servers, &instance, &owned).await?;

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    if action.partial {
        // A batch cap was hit; pick the key back up immediately.
        Ok(Action::requeue(Duration::ZERO))
    } else {
        Ok(Action::requeue(PROBE_INTERVAL))
    }
}

/// Decides this tick's bounded add count and delete list from desired versus
/// observed state. Pure apart from the advisory node census.
pub(super) fn determine_action(
    set: &GameServerSet,
    owned: &[GameServer],
    node_counter: &NodeCounter,
) -> ReplicaAction {
    let desired = set.spec.replicas;
    let exclude_constraints = set.spec.exclude_constraints.unwrap_or(false);
    let strategy = set.spec.scheduling.unwrap_or_default();

    let mut up_count: i32 = 0;
    let mut pending: usize = 0;
    let mut observed: i32 = 0;
    let mut potential_deletions: Vec<GameServer> = Vec::new();
    let mut drained: Vec<GameServer> = Vec::new();

    for gs in owned {
        if predicates::is_being_deleted(gs) {
            continue;
        }
        observed += 1;
        match gs.status.as_ref().and_then(|s| s.state) {
            None | Some(GameServerState::Starting) => {
                pending += 1;
                up_count += 1;
                potential_deletions.push(gs.clone());
            }
            Some(GameServerState::Running) => {
                if predicates::is_out_of_service(gs)
                    && exclude_constraints
                    && !predicates::is_in_place_updating(gs)
                {
                    // Already draining under external intent; neither up nor
                    // a candidate.
                    continue;
                }
                if predicates::is_deletable_with_gates(gs) {
                    drained.push(gs.clone());
                    continue;
                }
                up_count += 1;
                potential_deletions.push(gs.clone());
            }
            _ => potential_deletions.push(gs.clone()),
        }
    }

    let diff = desired - up_count;
    let mut to_add = 0usize;
    let mut chosen: Vec<GameServer> = Vec::new();
    let mut partial = false;

    if diff > 0 {
        to_add = (diff as usize)
            .min(MAX_CREATIONS_PER_SYNC)
            .min(MAX_PENDING_GAME_SERVERS.saturating_sub(pending));
        partial = to_add != diff as usize;
    } else if diff < 0 {
        let need = (-diff) as usize;
        let mut ordered = if set.scaling_replicas() {
            selector::scale_down_order(&potential_deletions, strategy, node_counter)
        } else {
            let mut all = potential_deletions;
            selector::sort_by_deletion_cost(&mut all, strategy, node_counter);
            all
        };
        let take = need.min(ordered.len()).min(MAX_DELETIONS_PER_SYNC);
        partial = take < need;
        ordered.truncate(take);
        chosen = ordered;
    }

    // Fully drained servers are retired regardless of the replica delta,
    // cheapest first.
    selector::sort_by_deletion_cost(&mut drained, strategy, node_counter);
    let mut to_delete = chosen;
    to_delete.extend(drained);
    if to_delete.len() > MAX_DELETIONS_PER_SYNC {
        to_delete.truncate(MAX_DELETIONS_PER_SYNC);
        partial = true;
    }

    ReplicaAction {
        to_add,
        to_delete,
        partial,
        observed,
    }
}

/// Failed reconciliations log the error and come back in five seconds; the
/// queue's rate limiter backs off repeat offenders beyond that.
fn on_error(instance: Arc<GameServerSet>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {}/{}: {:?}",
            instance.namespace().unwrap_or_default(),
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn set_with_replicas(replicas: i32) -> GameServerSet {
        GameServerSet::new(
            "squad-a",
            GameServerSetSpec {
                replicas,
                ..Default::default()
            },
        )
    }

    fn gs(name: &str, state: Option<GameServerState>) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.status = Some(GameServerStatus {
            state,
            ..Default::default()
        });
        gs
    }

    fn drained(name: &str, cost: i64) -> GameServer {
        let mut gs = gs(name, Some(GameServerState::Running));
        gs.spec.deletable_gates = Some(vec!["NoPlayers".to_owned()]);
        gs.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(GameServerCondition {
                type_: "NoPlayers".to_owned(),
                status: ConditionStatus::True,
                ..Default::default()
            });
        gs.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DELETION_COST_ANNOTATION.to_owned(), cost.to_string());
        gs
    }

    #[test]
    fn test_scale_up_is_capped_per_tick() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(100);
        let action = determine_action(&set, &[], &counter);
        assert_eq!(action.to_add, 64);
        assert!(action.partial);
        assert!(action.to_delete.is_empty());
    }

    #[test]
    fn test_scale_up_within_cap_is_complete() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(10);
        let owned = vec![gs("gs-0", Some(GameServerState::Running))];
        let action = determine_action(&set, &owned, &counter);
        assert_eq!(action.to_add, 9);
        assert!(!action.partial);
    }

    #[test]
    fn test_pending_budget_clamps_creations() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(6000);
        let owned: Vec<GameServer> = (0..4990)
            .map(|i| gs(&format!("gs-{}", i), Some(GameServerState::Starting)))
            .collect();
        let action = determine_action(&set, &owned, &counter);
        // Only 10 slots left in the pending budget.
        assert_eq!(action.to_add, 10);
        assert!(action.partial);
    }

    #[test]
    fn test_being_deleted_servers_are_ignored() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(2);
        let mut dying = gs("dying", Some(GameServerState::Running));
        dying.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let owned = vec![
            dying,
            gs("failed", Some(GameServerState::Failed)),
            gs("ok", Some(GameServerState::Running)),
        ];
        let action = determine_action(&set, &owned, &counter);
        assert_eq!(action.to_add, 1);
        assert_eq!(action.observed, 1);
    }

    #[test]
    fn test_drained_servers_retire_without_replica_delta() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(3);
        let owned = vec![
            gs("a", Some(GameServerState::Running)),
            gs("b", Some(GameServerState::Running)),
            gs("c", Some(GameServerState::Running)),
            drained("drained-hi", 10),
            drained("drained-lo", 0),
        ];
        let action = determine_action(&set, &owned, &counter);
        assert_eq!(action.to_add, 0);
        // Retired cheapest-first, replicas untouched.
        let names: Vec<String> = action.to_delete.iter().map(|g| g.name_any()).collect();
        assert_eq!(names, ["drained-lo", "drained-hi"]);
        assert!(!action.partial);
        assert_eq!(action.observed, 5);
    }

    #[test]
    fn test_scale_down_picks_by_cost() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(2);
        let mut cheap = gs("cheap", Some(GameServerState::Running));
        cheap
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DELETION_COST_ANNOTATION.to_owned(), "100".to_owned());
        let mut keep_a = gs("keep-a", Some(GameServerState::Running));
        keep_a
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DELETION_COST_ANNOTATION.to_owned(), i64::MAX.to_string());
        let mut keep_b = gs("keep-b", Some(GameServerState::Running));
        keep_b
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DELETION_COST_ANNOTATION.to_owned(), i64::MAX.to_string());

        let action = determine_action(&set, &[cheap, keep_a, keep_b], &counter);
        assert_eq!(action.to_delete.len(), 1);
        assert_eq!(action.to_delete[0].name_any(), "cheap");
        assert!(!action.partial);
    }

    #[test]
    fn test_scale_down_is_capped_per_tick() {
        let counter = NodeCounter::new();
        let set = set_with_replicas(0);
        let owned: Vec<GameServer> = (0..100)
            .map(|i| gs(&format!("gs-{}", i), Some(GameServerState::Running)))
            .collect();
        let action = determine_action(&set, &owned, &counter);
        assert_eq!(action.to_delete.len(), 64);
        assert!(action.partial);
    }

    #[test]
    fn test_exclude_constraints_carves_out_draining_servers() {
        let counter = NodeCounter::new();
        let mut set = set_with_replicas(2);
        set.spec.exclude_constraints = Some(true);

        let mut draining = gs("draining", Some(GameServerState::Running));
        draining.spec.constraints = Some(vec![Constraint {
            type_: ConstraintType::NotInService,
            effective: Some(true),
            ..Default::default()
        }]);
        let owned = vec![
            draining,
            gs("a", Some(GameServerState::Running)),
            gs("b", Some(GameServerState::Running)),
        ];
        // The draining server is not up, so the set is exactly satisfied.
        let action = determine_action(&set, &owned, &counter);
        assert_eq!(action.to_add, 0);
        assert!(action.to_delete.is_empty());
        assert_eq!(action.observed, 3);
    }
}
