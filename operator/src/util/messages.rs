/// Constraint message attached when a game server is drained for scale-down.
pub const NOT_IN_SERVICE_SCALE_DOWN: &str =
    "Taken out of service by the GameServerSet controller to scale down the set.";

/// Constraint message attached when a game server is drained for an in-place
/// update.
pub const NOT_IN_SERVICE_IN_PLACE: &str =
    "Taken out of service by the GameServerSet controller for an in-place update.";
