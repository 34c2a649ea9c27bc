//! The condition/gate algebra. Every other module asks these questions here
//! instead of reading conditions, gates, or constraints itself.

use gsorch_types::*;
use k8s_openapi::api::core::v1::Node;

fn state(gs: &GameServer) -> Option<GameServerState> {
    gs.status.as_ref().and_then(|s| s.state)
}

/// Latest condition of the given type; later entries win over earlier ones.
pub fn find_condition<'a>(gs: &'a GameServer, condition_type: &str) -> Option<&'a GameServerCondition> {
    gs.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .rev()
        .find(|c| c.type_ == condition_type)
}

fn condition_true(gs: &GameServer, condition_type: &str) -> bool {
    find_condition(gs, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

fn deletable_gates_true(gs: &GameServer) -> bool {
    gs.spec
        .deletable_gates
        .iter()
        .flatten()
        .all(|gate| condition_true(gs, gate))
}

/// Deletion has been requested, or the server already ran to completion.
pub fn is_being_deleted(gs: &GameServer) -> bool {
    gs.metadata.deletion_timestamp.is_some()
        || matches!(
            state(gs),
            Some(GameServerState::Failed) | Some(GameServerState::Exited)
        )
}

/// Not yet serving players: still starting, or a readiness gate is absent or
/// not True.
pub fn is_before_ready(gs: &GameServer) -> bool {
    if matches!(state(gs), None | Some(GameServerState::Starting)) {
        return true;
    }
    gs.spec
        .readiness_gates
        .iter()
        .flatten()
        .any(|gate| !condition_true(gs, gate))
}

/// Every readiness-gate condition is present and True.
pub fn is_ready(gs: &GameServer) -> bool {
    gs.spec
        .readiness_gates
        .iter()
        .flatten()
        .all(|gate| condition_true(gs, gate))
}

/// An effective `NotInService` constraint is draining this server.
pub fn is_out_of_service(gs: &GameServer) -> bool {
    gs.spec.constraints.iter().flatten().any(|c| {
        c.type_ == ConstraintType::NotInService && c.effective.unwrap_or(false)
    })
}

/// Safe to tear down now: not mid in-place update and every deletable gate
/// reports True.
pub fn is_deletable(gs: &GameServer) -> bool {
    !gs.in_place_updating() && deletable_gates_true(gs)
}

/// Deletable, and the owner actually declared gates; a server with no gates
/// never drains "by default".
pub fn is_deletable_with_gates(gs: &GameServer) -> bool {
    is_deletable(gs) && gs.spec.deletable_gates.as_ref().is_some_and(|g| !g.is_empty())
}

pub fn is_in_place_updating(gs: &GameServer) -> bool {
    gs.in_place_updating()
}

/// Eligible for an image swap right now: either it never went ready, or it is
/// mid-update and fully drained.
pub fn can_in_place_updating(gs: &GameServer) -> bool {
    if is_being_deleted(gs) {
        return false;
    }
    is_before_ready(gs) || (gs.in_place_updating() && deletable_gates_true(gs))
}

/// The cluster autoscaler has tainted this node for removal; game servers on
/// it should be drained by whoever owns them.
pub fn node_tainted_by_ca(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == CA_TO_BE_DELETED_TAINT))
}
