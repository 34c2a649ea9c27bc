use clap::{Parser, Subcommand};
use gsorch_operator::gameserversets::{self, OperatorConfig};
use gsorch_operator::util;
use kube::client::Client;

/// Command line surface of the operator. Everything here is also settable
/// through `GSORCH_*` environment variables, which is how the in-cluster
/// deployment passes it.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Port for the prometheus scrape endpoint; metrics stay off unless set.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// One subcommand per controller this binary can run. Only the
/// `GameServerSet` controller exists today; the per-server controller ships
/// separately.
#[derive(Subcommand)]
enum Command {
    /// Reconcile `GameServerSet` resources: scale sets up and down and drive
    /// their in-place rollouts.
    ManageGameServerSets {
        #[arg(
            long,
            env = "GSORCH_SIDECAR_IMAGE",
            default_value = "gsorch/sidecar:latest"
        )]
        sidecar_image: String,

        /// Service account substituted into pod templates that leave theirs
        /// empty; paired with the token-path mute so game servers cannot
        /// reach the cluster API.
        #[arg(
            long,
            env = "GSORCH_SIDECAR_SERVICE_ACCOUNT",
            default_value = "gsorch-sidecar"
        )]
        sidecar_service_account: String,

        /// Number of set keys reconciled concurrently.
        #[arg(long, env = "GSORCH_WORKERS", default_value_t = 4)]
        workers: u16,

        #[arg(long, env = "GSORCH_LEASE_NAMESPACE", default_value = "gsorch-system")]
        lease_namespace: String,

        #[arg(long, env = "GSORCH_LEASE_NAME", default_value = "gsorch-operator")]
        lease_name: String,

        #[arg(long, env = "GSORCH_LEASE_TTL", default_value = "15s")]
        lease_ttl: String,
    },
}

/// Dispatches the selected subcommand. Controllers run until shutdown, so
/// falling out of the match means something went wrong.
async fn run(client: Client) {
    let cli = Cli::parse();

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(gsorch_operator::metrics::run_server(metrics_port));
    }

    match cli.command {
        Command::ManageGameServerSets {
            sidecar_image,
            sidecar_service_account,
            workers,
            lease_namespace,
            lease_name,
            lease_ttl,
        } => {
            let ttl = parse_duration::parse(&lease_ttl).expect("Expected a valid --lease-ttl.");

            // Only the lease holder reconciles; everyone else camps on the
            // lease until it frees up.
            let lock =
                util::leadership::acquire(client.clone(), &lease_namespace, &lease_name, ttl)
                    .await;
            util::leadership::spawn_renewal(lock, ttl);

            gameserversets::run(
                client,
                OperatorConfig {
                    sidecar_image,
                    sidecar_service_account,
                },
                workers,
            )
            .await
        }
    }
    .unwrap();

    panic!("controller loop returned without an error");
}

#[tokio::main]
async fn main() {
    gsorch_common::init();

    // A panic on any thread must take the whole process down, otherwise the
    // lease-renewal task or the metrics server could die quietly while the
    // controller keeps reconciling; exiting lets the container restart clean.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // In-cluster the service account provides the credentials; on a
    // workstation this falls back to the local kubeconfig.
    let client: Client = Client::try_default()
        .await
        .expect("No usable kubeconfig or in-cluster credentials.");

    run(client).await;

    // run() never returns normally; the controllers hold the process open.
    panic!("process outlived its controllers");
}
