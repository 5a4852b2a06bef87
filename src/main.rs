use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use primary_kv::{net, task::Supervisor, ClusterTopology, Replica};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Address this replica listens on and is known by in the cluster.
    addr: SocketAddr,
    /// Leader address. May be omitted when `--topology` is given.
    leader: Option<SocketAddr>,

    /// Other cluster members. Defaults to 127.0.0.1:10097-10099 if neither
    /// this nor `--topology` is given.
    #[clap(long = "peer")]
    peers: Vec<SocketAddr>,
    /// JSON file with `leader` and `replicas`.
    #[clap(long)]
    topology: Option<PathBuf>,

    /// Give up on a PUT whose followers have not all acknowledged in time.
    #[clap(long)]
    replication_timeout_ms: Option<u64>,
}

impl Cli {
    fn topology(&self) -> primary_kv::Result<ClusterTopology> {
        if let Some(path) = &self.topology {
            let topology = ClusterTopology::load(path)?;
            if let Some(leader) = self.leader {
                if leader != topology.leader() {
                    primary_kv::bail!(
                        "leader {leader} disagrees with {} in {}",
                        topology.leader(),
                        path.display()
                    )
                }
            }
            return Ok(topology);
        }
        let Some(leader) = self.leader else {
            primary_kv::bail!("leader address required without --topology")
        };
        if self.peers.is_empty() {
            return ClusterTopology::localhost(leader);
        }
        let mut replicas = Vec::new();
        for addr in [self.addr, leader].into_iter().chain(self.peers.iter().copied()) {
            if !replicas.contains(&addr) {
                replicas.push(addr)
            }
        }
        ClusterTopology::new(leader, replicas)
    }
}

#[tokio::main]
async fn main() -> primary_kv::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let topology = Arc::new(cli.topology()?);
    let mut replica = Replica::new(cli.addr, topology)?;
    if let Some(millis) = cli.replication_timeout_ms {
        replica = replica.with_replication_timeout(Duration::from_millis(millis))
    }
    let listener = net::bind(cli.addr)?;

    let mut supervisor = Supervisor::default();
    supervisor
        .spawner()
        .spawn("replica", Arc::new(replica).serve(listener));
    tokio::select! {
        result = supervisor.wait() => result,
        result = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(result?)
        }
    }
}
