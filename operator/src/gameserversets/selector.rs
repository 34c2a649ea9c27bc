//! Victim selection: classification decides which bucket a game server falls
//! into, sorting decides who inside a bucket goes first.

use super::counter::NodeCounter;
use super::predicates;
use chrono::{DateTime, Utc};
use gsorch_types::*;

/// Deletion-preference buckets. Concatenation order for scale-down is
/// `in_place_updatings`, `not_readys`, `deletables`, `delete_candidates`,
/// `runnings`.
#[derive(Default)]
pub struct ClassifiedGameServers {
    pub in_place_updatings: Vec<GameServer>,
    pub not_readys: Vec<GameServer>,
    pub deletables: Vec<GameServer>,
    pub delete_candidates: Vec<GameServer>,
    pub runnings: Vec<GameServer>,
}

impl ClassifiedGameServers {
    /// Servers that can be torn down right away: the drained ones plus those
    /// that never made it into service.
    pub fn deletion_list(self) -> (Vec<GameServer>, Vec<GameServer>) {
        let mut deletable = self.in_place_updatings;
        deletable.extend(self.not_readys);
        deletable.extend(self.deletables);
        (deletable, self.runnings)
    }
}

/// Buckets the list by drainability. `updating` routes in-place-updating
/// servers into their own bucket; otherwise they fall through the regular
/// checks. Being-deleted servers are skipped entirely.
pub fn classify(list: &[GameServer], updating: bool) -> ClassifiedGameServers {
    let mut classified = ClassifiedGameServers::default();
    for gs in list {
        if predicates::is_being_deleted(gs) {
            continue;
        }
        if updating && predicates::is_in_place_updating(gs) {
            classified.in_place_updatings.push(gs.clone());
        } else if predicates::is_before_ready(gs) {
            classified.not_readys.push(gs.clone());
        } else if predicates::is_deletable(gs) {
            classified.deletables.push(gs.clone());
        } else if predicates::is_out_of_service(gs) {
            classified.delete_candidates.push(gs.clone());
        } else {
            classified.runnings.push(gs.clone());
        }
    }
    classified
}

fn created_at(gs: &GameServer) -> Option<DateTime<Utc>> {
    gs.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

pub fn sort_by_creation(list: &mut [GameServer]) {
    list.sort_by_key(created_at);
}

fn node_population(gs: &GameServer, counter: &NodeCounter) -> usize {
    gs.status
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .and_then(|node| counter.count(node))
        .unwrap_or(0)
}

/// Orders scale-down victims. Primary key is the deletion-cost annotation,
/// ascending, with missing treated as the minimum. When the head of the
/// sorted list carries the `i64::MAX` sentinel, every remaining entry is
/// "keep if possible" and the order falls back to packing: under
/// `MostAllocated` the server on the least-populated node goes first so nodes
/// consolidate, ties and other strategies go oldest-first.
pub fn sort_by_deletion_cost(
    list: &mut [GameServer],
    strategy: SchedulingStrategy,
    counter: &NodeCounter,
) {
    list.sort_by_key(GameServer::deletion_cost);
    if list.first().map(GameServer::deletion_cost) != Some(i64::MAX) {
        return;
    }
    match strategy {
        SchedulingStrategy::MostAllocated => list.sort_by(|a, b| {
            node_population(a, counter)
                .cmp(&node_population(b, counter))
                .then_with(|| created_at(a).cmp(&created_at(b)))
        }),
        SchedulingStrategy::LeastAllocated => list.sort_by_key(created_at),
    }
}

/// Full ordering for scale-down when a scale operation is flagged on the set:
/// classify, order inside each bucket, then concatenate.
pub fn scale_down_order(
    list: &[GameServer],
    strategy: SchedulingStrategy,
    counter: &NodeCounter,
) -> Vec<GameServer> {
    let mut classified = classify(list, false);
    sort_by_creation(&mut classified.in_place_updatings);
    sort_by_creation(&mut classified.not_readys);
    sort_by_deletion_cost(&mut classified.deletables, strategy, counter);
    sort_by_creation(&mut classified.delete_candidates);
    sort_by_deletion_cost(&mut classified.runnings, strategy, counter);

    let mut ordered = classified.in_place_updatings;
    ordered.extend(classified.not_readys);
    ordered.extend(classified.deletables);
    ordered.extend(classified.delete_candidates);
    ordered.extend(classified.runnings);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;

    fn running_gs(name: &str) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.status = Some(GameServerStatus {
            state: Some(GameServerState::Running),
            ..Default::default()
        });
        gs
    }

    fn with_cost(mut gs: GameServer, cost: i64) -> GameServer {
        gs.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DELETION_COST_ANNOTATION.to_owned(), cost.to_string());
        gs
    }

    fn on_node(mut gs: GameServer, node: &str) -> GameServer {
        gs.status.get_or_insert_with(Default::default).node_name = Some(node.to_owned());
        gs
    }

    fn created(mut gs: GameServer, secs: i64) -> GameServer {
        gs.metadata.creation_timestamp = Some(Time(
            DateTime::from_timestamp(secs, 0).expect("valid timestamp"),
        ));
        gs
    }

    fn drained_gs(name: &str) -> GameServer {
        let mut gs = running_gs(name);
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
        gs
    }

    fn out_of_service_gs(name: &str) -> GameServer {
        let mut gs = running_gs(name);
        // Not deletable: the gate exists but is not True yet.
        gs.spec.deletable_gates = Some(vec!["NoPlayers".to_owned()]);
        gs.spec.constraints = Some(vec![Constraint {
            type_: ConstraintType::NotInService,
            effective: Some(true),
            ..Default::default()
        }]);
        gs
    }

    fn names(list: &[GameServer]) -> Vec<String> {
        list.iter().map(|gs| gs.name_any()).collect()
    }

    #[test]
    fn test_classify_buckets() {
        let mut starting = GameServer::new("starting", GameServerSpec::default());
        starting.status = Some(GameServerStatus {
            state: Some(GameServerState::Starting),
            ..Default::default()
        });
        let mut exited = running_gs("exited");
        exited.status.as_mut().unwrap().state = Some(GameServerState::Exited);
        let mut updating = drained_gs("updating");
        updating.set_in_place_updating(true);

        let list = vec![
            starting,
            exited,
            updating,
            drained_gs("drained"),
            out_of_service_gs("draining"),
            running_gs("serving"),
        ];

        let classified = classify(&list, true);
        assert_eq!(names(&classified.in_place_updatings), ["updating"]);
        assert_eq!(names(&classified.not_readys), ["starting"]);
        assert_eq!(names(&classified.deletables), ["drained"]);
        assert_eq!(names(&classified.delete_candidates), ["draining"]);
        assert_eq!(names(&classified.runnings), ["serving"]);
    }

    #[test]
    fn test_classify_without_updating_flag() {
        let mut updating = out_of_service_gs("updating");
        updating.set_in_place_updating(true);
        let classified = classify(&[updating], false);
        // Falls through: marked servers are already out of service.
        assert!(classified.in_place_updatings.is_empty());
        assert_eq!(names(&classified.delete_candidates), ["updating"]);
    }

    #[test]
    fn test_cost_sort_ascending_with_missing_as_min() {
        let counter = NodeCounter::new();
        let mut list = vec![
            with_cost(running_gs("ten"), 10),
            running_gs("unset"),
            with_cost(running_gs("zero"), 0),
        ];
        sort_by_deletion_cost(&mut list, SchedulingStrategy::MostAllocated, &counter);
        assert_eq!(names(&list), ["unset", "zero", "ten"]);
    }

    #[test]
    fn test_real_cost_at_head_skips_packing_fallback() {
        let counter = NodeCounter::new();
        counter.inc("a");
        counter.inc("a");
        counter.inc("a");
        counter.inc("b");

        let mut list = vec![
            with_cost(on_node(running_gs("keep-1"), "b"), i64::MAX),
            with_cost(on_node(running_gs("cheap"), "a"), 100),
            with_cost(on_node(running_gs("keep-2"), "a"), i64::MAX),
        ];
        sort_by_deletion_cost(&mut list, SchedulingStrategy::MostAllocated, &counter);
        assert_eq!(list[0].name_any(), "cheap");
    }

    #[test]
    fn test_sentinel_head_triggers_packing_fallback() {
        let counter = NodeCounter::new();
        counter.inc("a");
        counter.inc("a");
        counter.inc("a");
        counter.inc("b");

        let mut list = vec![
            with_cost(on_node(created(running_gs("a-old"), 100), "a"), i64::MAX),
            with_cost(on_node(created(running_gs("a-new"), 200), "a"), i64::MAX),
            with_cost(on_node(created(running_gs("b-only"), 300), "b"), i64::MAX),
        ];
        sort_by_deletion_cost(&mut list, SchedulingStrategy::MostAllocated, &counter);
        // Least-packed node first, then oldest.
        assert_eq!(names(&list), ["b-only", "a-old", "a-new"]);

        sort_by_deletion_cost(&mut list, SchedulingStrategy::LeastAllocated, &counter);
        assert_eq!(names(&list), ["a-old", "a-new", "b-only"]);
    }

    #[test]
    fn test_scale_down_order_concatenation() {
        let counter = NodeCounter::new();
        let mut starting = GameServer::new("pending", GameServerSpec::default());
        starting.status = Some(GameServerStatus {
            state: Some(GameServerState::Starting),
            ..Default::default()
        });
        let list = vec![
            running_gs("serving"),
            out_of_service_gs("draining"),
            drained_gs("drained"),
            starting,
        ];
        let ordered = scale_down_order(&list, SchedulingStrategy::MostAllocated, &counter);
        assert_eq!(names(&ordered), ["pending", "drained", "draining", "serving"]);
    }
}
