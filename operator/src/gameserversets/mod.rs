mod actions;
mod builder;
mod counter;
mod hash;
mod inplace;
mod predicates;
mod reconcile;
mod selector;
mod status;

pub use builder::{apply_defaults, build_pod, update_pod_spec};
pub use counter::NodeCounter;
pub use predicates::*;
pub use reconcile::run;

/// Operator-level knobs every reconciliation shares, resolved once from the
/// CLI.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image for the SDK sidecar appended to every built pod.
    pub sidecar_image: String,

    /// Service account substituted when the pod template leaves it empty.
    pub sidecar_service_account: String,
}
