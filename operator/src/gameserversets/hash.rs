use gsorch_types::GameServerTemplate;
use sha2::{Digest, Sha256};

/// Length of the truncated hex digest stamped into the hash label.
const HASH_LEN: usize = 12;

/// Content hash of a set's game-server template. Used as the revision label
/// when the set's owner has not stamped one, so freshly created servers stay
/// attributable to a template revision.
pub fn template_hash(template: &GameServerTemplate) -> String {
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsorch_types::GameServerSpec;

    #[test]
    fn test_template_hash_is_stable() {
        let template = GameServerTemplate::default();
        assert_eq!(template_hash(&template), template_hash(&template.clone()));
        assert_eq!(template_hash(&template).len(), HASH_LEN);
    }

    #[test]
    fn test_template_hash_tracks_content() {
        let base = GameServerTemplate::default();
        let changed = GameServerTemplate {
            spec: GameServerSpec {
                readiness_gates: Some(vec!["SessionReady".to_owned()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_ne!(template_hash(&base), template_hash(&changed));
    }
}
