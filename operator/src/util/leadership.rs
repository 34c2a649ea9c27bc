use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use std::time::Duration;
use uuid::Uuid;

fn holder_id() -> String {
    format!(
        "{}_{}",
        std::env::var("POD_NAME").unwrap_or_else(|_| "gsorch-operator".to_owned()),
        Uuid::new_v4()
    )
}

/// Blocks until this process holds the lease. Contenders poll at a third of
/// the lease TTL, the same cadence the renewal loop uses.
pub async fn acquire(
    client: Client,
    namespace: &str,
    lease_name: &str,
    ttl: Duration,
) -> LeaseLock {
    let lock = LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id: holder_id(),
            lease_name: lease_name.to_owned(),
            lease_ttl: ttl,
        },
    );
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                println!(
                    "{}",
                    format!("Acquired leadership lease '{}'.", lease_name).green()
                );
                return lock;
            }
            Ok(_) => {}
            Err(e) => eprintln!("{}", format!("Leader election error: {}", e).red()),
        }
        tokio::time::sleep(ttl / 3).await;
    }
}

/// Keeps the held lease fresh in the background. Losing the lease is not
/// recoverable in-process; the renewal failure is logged and the next missed
/// renewal lets another replica take over while this one gets restarted by
/// its liveness probe.
pub fn spawn_renewal(lock: LeaseLock, ttl: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(ttl / 3).await;
            if let Err(e) = lock.try_acquire_or_renew().await {
                eprintln!(
                    "{}",
                    format!("Failed to renew leadership lease: {}", e).red()
                );
            }
        }
    });
}
