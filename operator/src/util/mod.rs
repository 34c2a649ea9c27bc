use kube::runtime::events::Reporter;
use lazy_static::lazy_static;
use std::time::Duration;

pub mod colors;
pub mod leadership;
pub mod messages;
pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

/// How often a settled set is re-checked for drift.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on game servers created in a single reconciliation.
pub const MAX_CREATIONS_PER_SYNC: usize = 64;

/// Upper bound on game servers deleted or marked in a single reconciliation.
pub const MAX_DELETIONS_PER_SYNC: usize = 64;

/// Budget of not-yet-running game servers per set; creations beyond it wait
/// for the next tick.
pub const MAX_PENDING_GAME_SERVERS: usize = 5000;

/// Concurrent create requests in flight per reconciliation.
pub const CREATION_PARALLELISM: usize = 16;

/// Concurrent delete/mark/update requests in flight per reconciliation.
pub const UPDATE_PARALLELISM: usize = 64;

lazy_static! {
    /// Identity attached to every event this controller emits.
    pub static ref REPORTER: Reporter = Reporter {
        controller: "gsorch-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    };
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    UserInput(String),

    #[error("pod template has no container named '{0}'")]
    MissingContainer(String),

    /// Per-object failures from a parallel fan-out; siblings are not aborted.
    #[error("{failed} of {total} {action} operations failed: {errors:?}")]
    Aggregate {
        action: &'static str,
        total: usize,
        failed: usize,
        errors: Vec<String>,
    },
}

impl Error {
    pub fn aggregate(action: &'static str, total: usize, errors: Vec<String>) -> Self {
        Error::Aggregate {
            action,
            total,
            failed: errors.len(),
            errors,
        }
    }
}
