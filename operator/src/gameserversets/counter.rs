use futures::StreamExt;
use gsorch_types::GameServer;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Advisory census of live game servers per node, consulted by the packing
/// sort. Stale values only weaken sort quality, never correctness.
#[derive(Default)]
pub struct NodeCounter {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    counts: HashMap<String, usize>,
    /// namespace/name -> node, so a server contributes at most once no matter
    /// how its change events interleave.
    assigned: HashMap<String, String>,
}

fn feed_key(gs: &GameServer) -> String {
    format!("{}/{}", gs.namespace().unwrap_or_default(), gs.name_any())
}

fn live_node(gs: &GameServer) -> Option<String> {
    if gs.metadata.deletion_timestamp.is_some() {
        return None;
    }
    gs.status
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .filter(|n| !n.is_empty())
}

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inc(&self, node: &str) {
        Self::inc_locked(&mut self.write(), node);
    }

    pub fn dec(&self, node: &str) {
        Self::dec_locked(&mut self.write(), node);
    }

    /// Current count for a node; the read happens under the guard.
    pub fn count(&self, node: &str) -> Option<usize> {
        self.read().counts.get(node).copied()
    }

    fn inc_locked(inner: &mut Inner, node: &str) {
        *inner.counts.entry(node.to_owned()).or_insert(0) += 1;
    }

    fn dec_locked(inner: &mut Inner, node: &str) {
        if let Some(count) = inner.counts.get_mut(node) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.counts.remove(node);
            }
        }
    }

    /// Applies an add/update event from the change feed.
    pub fn observe(&self, gs: &GameServer) {
        let key = feed_key(gs);
        let node = live_node(gs);
        let mut inner = self.write();
        let previous = inner.assigned.get(&key).cloned();
        match (previous, node) {
            (None, Some(node)) => {
                Self::inc_locked(&mut inner, &node);
                inner.assigned.insert(key, node);
            }
            (Some(previous), None) => {
                Self::dec_locked(&mut inner, &previous);
                inner.assigned.remove(&key);
            }
            (Some(previous), Some(node)) if previous != node => {
                Self::dec_locked(&mut inner, &previous);
                Self::inc_locked(&mut inner, &node);
                inner.assigned.insert(key, node);
            }
            _ => {}
        }
    }

    /// Applies a delete event from the change feed.
    pub fn forget(&self, gs: &GameServer) {
        let key = feed_key(gs);
        let mut inner = self.write();
        if let Some(previous) = inner.assigned.remove(&key) {
            Self::dec_locked(&mut inner, &previous);
        }
    }

    fn reset(&self) {
        let mut inner = self.write();
        inner.counts.clear();
        inner.assigned.clear();
    }
}

/// Consumes the game-server change feed until cancellation, keeping the
/// counter current. Runs out-of-band from the reconcilers.
pub async fn run_feed(
    client: Client,
    counter: std::sync::Arc<NodeCounter>,
    shutdown: CancellationToken,
) {
    let api: Api<GameServer> = Api::all(client);
    let mut feed = watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = feed.next() => match event {
                Some(Ok(watcher::Event::Init)) => counter.reset(),
                Some(Ok(watcher::Event::InitApply(gs))) | Some(Ok(watcher::Event::Apply(gs))) => {
                    counter.observe(&gs)
                }
                Some(Ok(watcher::Event::InitDone)) => {}
                Some(Ok(watcher::Event::Delete(gs))) => counter.forget(&gs),
                Some(Err(e)) => {
                    eprintln!("{}", format!("GameServer watch error: {}", e).red());
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsorch_types::{GameServerSpec, GameServerStatus};

    fn gs_on_node(name: &str, node: Option<&str>) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.metadata.namespace = Some("default".to_owned());
        gs.status = Some(GameServerStatus {
            node_name: node.map(str::to_owned),
            ..Default::default()
        });
        gs
    }

    #[test]
    fn test_inc_dec_count() {
        let counter = NodeCounter::new();
        assert_eq!(counter.count("a"), None);
        counter.inc("a");
        counter.inc("a");
        assert_eq!(counter.count("a"), Some(2));
        counter.dec("a");
        assert_eq!(counter.count("a"), Some(1));
        // Entries are dropped at zero.
        counter.dec("a");
        assert_eq!(counter.count("a"), None);
        // A spurious dec does not underflow.
        counter.dec("a");
        assert_eq!(counter.count("a"), None);
    }

    #[test]
    fn test_observe_counts_each_server_once() {
        let counter = NodeCounter::new();
        let gs = gs_on_node("gs-0", Some("node-a"));
        counter.observe(&gs);
        counter.observe(&gs);
        counter.observe(&gs);
        assert_eq!(counter.count("node-a"), Some(1));
    }

    #[test]
    fn test_observe_tracks_node_transitions() {
        let counter = NodeCounter::new();
        counter.observe(&gs_on_node("gs-0", None));
        assert_eq!(counter.count("node-a"), None);

        counter.observe(&gs_on_node("gs-0", Some("node-a")));
        assert_eq!(counter.count("node-a"), Some(1));

        counter.observe(&gs_on_node("gs-0", Some("node-b")));
        assert_eq!(counter.count("node-a"), None);
        assert_eq!(counter.count("node-b"), Some(1));
    }

    #[test]
    fn test_deleted_server_stops_contributing() {
        let counter = NodeCounter::new();
        counter.observe(&gs_on_node("gs-0", Some("node-a")));
        counter.observe(&gs_on_node("gs-1", Some("node-a")));
        assert_eq!(counter.count("node-a"), Some(2));

        let mut dying = gs_on_node("gs-0", Some("node-a"));
        dying.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        counter.observe(&dying);
        assert_eq!(counter.count("node-a"), Some(1));

        counter.forget(&gs_on_node("gs-1", Some("node-a")));
        assert_eq!(counter.count("node-a"), None);
    }
}
