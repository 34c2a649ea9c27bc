//! Stable label/annotation identifiers and the typed accessors over them.
//! Controller logic goes through these; nothing else reads the string maps.

use crate::{GameServer, GameServerSet};
use const_format::concatcp;
use kube::ResourceExt;

pub const GROUP: &str = "gsorch.dev";
pub const VERSION: &str = "v1";
pub const API_VERSION: &str = concatcp!(GROUP, "/", VERSION);

/// Finalizer tagging game servers for controlled teardown.
pub const FINALIZER: &str = GROUP;

pub const ROLE_LABEL: &str = concatcp!(GROUP, "/role");
pub const GAME_SERVER_ROLE: &str = "gameserver";
pub const GAME_SERVER_POD_LABEL: &str = concatcp!(GROUP, "/gameserver-pod");
pub const GAME_SERVER_SET_LABEL: &str = concatcp!(GROUP, "/gameserverset");
pub const GAME_SERVER_HASH_LABEL: &str = concatcp!(GROUP, "/gss-hash");

pub const GROUP_VERSION_ANNOTATION: &str = concatcp!(GROUP, "/api-version");
pub const IN_PLACE_UPDATING_ANNOTATION: &str = concatcp!(GROUP, "/in-place-updating");
pub const IN_PLACE_UPDATE_ANNOTATION: &str = concatcp!(GROUP, "/in-place-update");
pub const IN_PLACE_UPDATED_REPLICAS_ANNOTATION: &str =
    concatcp!(GROUP, "/in-place-updated-replicas");
pub const SCALING_REPLICAS_ANNOTATION: &str = concatcp!(GROUP, "/scaling-replicas");
pub const DELETION_COST_ANNOTATION: &str = concatcp!(GROUP, "/deletion-cost");

pub const SCALING_CONDITION: &str = "Scaling";

/// Well-known name of the game-server container inside the pod template.
pub const GAME_SERVER_CONTAINER: &str = "gameserver";
pub const SIDECAR_CONTAINER: &str = "sidecar";

pub const SDK_GRPC_PORT_ENV: &str = "SDK_GRPC_PORT";
pub const SDK_HTTP_PORT_ENV: &str = "SDK_HTTP_PORT";

pub const DEFAULT_SIDECAR_LOG_LEVEL: &str = "Info";
pub const DEFAULT_SIDECAR_GRPC_PORT: i32 = 9020;
pub const DEFAULT_SIDECAR_HTTP_PORT: i32 = 9021;

pub const SERVICE_ACCOUNT_SECRET_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Taint the cluster autoscaler places on nodes scheduled for removal.
pub const CA_TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

impl GameServer {
    /// Whether the in-place engine currently owns this server's drain cycle.
    pub fn in_place_updating(&self) -> bool {
        self.annotations()
            .get(IN_PLACE_UPDATING_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn set_in_place_updating(&mut self, updating: bool) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                IN_PLACE_UPDATING_ANNOTATION.to_owned(),
                updating.to_string(),
            );
    }

    /// Signed bias for victim selection; missing or malformed means the
    /// minimum (delete first), `i64::MAX` means effectively do-not-delete.
    pub fn deletion_cost(&self) -> i64 {
        self.annotations()
            .get(DELETION_COST_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(i64::MIN)
    }
}

impl GameServerSet {
    /// Set while a scale operation is pending.
    pub fn scaling_replicas(&self) -> bool {
        self.annotations()
            .get(SCALING_REPLICAS_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Opaque marker stamped by the set's owner to start an in-place rollout.
    pub fn in_place_update_marker(&self) -> Option<&str> {
        self.annotations()
            .get(IN_PLACE_UPDATE_ANNOTATION)
            .map(String::as_str)
    }

    /// Count of replicas already upgraded during the current rollout.
    pub fn in_place_updated_replicas(&self) -> i32 {
        self.annotations()
            .get(IN_PLACE_UPDATED_REPLICAS_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Content hash of the desired template, stamped by the set's owner.
    pub fn revision_hash(&self) -> Option<&str> {
        self.labels()
            .get(GAME_SERVER_HASH_LABEL)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GameServerSetSpec, GameServerSpec};

    fn annotated_gs(key: &str, value: &str) -> GameServer {
        let mut gs = GameServer::new("gs-0", GameServerSpec::default());
        gs.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_owned(), value.to_owned());
        gs
    }

    #[test]
    fn test_in_place_updating_annotation() {
        let gs = GameServer::new("gs-0", GameServerSpec::default());
        assert!(!gs.in_place_updating());
        assert!(annotated_gs(IN_PLACE_UPDATING_ANNOTATION, "true").in_place_updating());
        assert!(!annotated_gs(IN_PLACE_UPDATING_ANNOTATION, "false").in_place_updating());
    }

    #[test]
    fn test_set_in_place_updating_round_trips() {
        let mut gs = GameServer::new("gs-0", GameServerSpec::default());
        gs.set_in_place_updating(true);
        assert!(gs.in_place_updating());
        gs.set_in_place_updating(false);
        assert!(!gs.in_place_updating());
    }

    #[test]
    fn test_deletion_cost_defaults_to_min() {
        let gs = GameServer::new("gs-0", GameServerSpec::default());
        assert_eq!(gs.deletion_cost(), i64::MIN);
        assert_eq!(annotated_gs(DELETION_COST_ANNOTATION, "oops").deletion_cost(), i64::MIN);
        assert_eq!(annotated_gs(DELETION_COST_ANNOTATION, "-7").deletion_cost(), -7);
    }

    #[test]
    fn test_set_accessors() {
        let mut gss = GameServerSet::new("squad-a", GameServerSetSpec::default());
        assert!(!gss.scaling_replicas());
        assert_eq!(gss.in_place_updated_replicas(), 0);
        assert!(gss.in_place_update_marker().is_none());
        assert!(gss.revision_hash().is_none());

        let annotations = gss.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(SCALING_REPLICAS_ANNOTATION.to_owned(), "true".to_owned());
        annotations.insert(
            IN_PLACE_UPDATED_REPLICAS_ANNOTATION.to_owned(),
            "4".to_owned(),
        );
        annotations.insert(IN_PLACE_UPDATE_ANNOTATION.to_owned(), "20060102".to_owned());
        gss.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(GAME_SERVER_HASH_LABEL.to_owned(), "abc123".to_owned());

        assert!(gss.scaling_replicas());
        assert_eq!(gss.in_place_updated_replicas(), 4);
        assert_eq!(gss.in_place_update_marker(), Some("20060102"));
        assert_eq!(gss.revision_hash(), Some("abc123"));
    }
}
