mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cohort_membership::{
    parse_duration, parse_optional_duration, Cluster, ClusterEvent, EventKind, InitialStateMode, Phase,
    ReachabilityPolicy, ShutdownReason, Transport, UdpTransport,
};
use tracing::{info, warn};

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "cohort-node", about = "cohort cluster membership node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "COHORT_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the cluster transport to
    #[arg(long, env = "COHORT_BIND")]
    bind: Option<String>,

    /// UDP port for cluster traffic
    #[arg(short, long, env = "COHORT_PORT")]
    port: Option<u16>,

    /// seed nodes tried in order when joining. comma separated.
    /// when the first seed is this node, a new cluster is founded
    #[arg(long, env = "COHORT_SEED_NODES", value_delimiter = ',')]
    seed_nodes: Vec<SocketAddr>,

    /// roles of this member. comma separated
    #[arg(long, env = "COHORT_ROLES", value_delimiter = ',')]
    roles: Vec<String>,

    /// members required before the leader moves anyone to up
    #[arg(long, env = "COHORT_MIN_NR_OF_MEMBERS")]
    min_nr_of_members: Option<usize>,

    /// gossip interval (e.g. "1s", "250ms")
    #[arg(long, env = "COHORT_GOSSIP_INTERVAL")]
    gossip_interval: Option<String>,

    /// down members unreachable for this long. "off" disables
    #[arg(long, env = "COHORT_AUTO_DOWN_UNREACHABLE_AFTER")]
    auto_down_unreachable_after: Option<String>,

    /// how observations combine: any-observer or quorum
    #[arg(long, env = "COHORT_REACHABILITY_POLICY")]
    reachability_policy: Option<String>,
}

/// Applies CLI overrides. Only values given on the command line or in
/// the environment take effect.
fn apply_args(cfg: &mut NodeConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if !args.seed_nodes.is_empty() {
        cfg.membership.seed_nodes = args.seed_nodes.clone();
    }
    if !args.roles.is_empty() {
        cfg.membership.roles = args.roles.iter().cloned().collect();
    }
    if let Some(n) = args.min_nr_of_members {
        cfg.membership.min_nr_of_members = n;
    }
    if let Some(ref v) = args.gossip_interval {
        cfg.membership.gossip_interval = parse_duration(v)
            .unwrap_or_else(|e| exit_err(format!("invalid gossip interval: {e}")));
    }
    if let Some(ref v) = args.auto_down_unreachable_after {
        cfg.membership.auto_down_unreachable_after = parse_optional_duration(v)
            .unwrap_or_else(|e| exit_err(format!("invalid auto-down delay: {e}")));
    }
    if let Some(ref v) = args.reachability_policy {
        cfg.membership.reachability_policy = v
            .parse::<ReachabilityPolicy>()
            .unwrap_or_else(|e| exit_err(format!("invalid reachability policy: {e}")));
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cohort=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match NodeConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => NodeConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.membership.validate() {
        exit_err(e);
    }

    let addr = cfg.bind_addr().unwrap_or_else(|e| exit_err(e));
    let (transport, inbound) = UdpTransport::bind(addr)
        .await
        .unwrap_or_else(|e| exit_err(e));

    let seeds = if cfg.membership.seed_nodes.is_empty() {
        vec![transport.local_address()]
    } else {
        cfg.membership.seed_nodes.clone()
    };

    let cluster = Cluster::start(cfg.membership.clone(), Arc::new(transport), inbound)
        .unwrap_or_else(|e| exit_err(e));
    let handle = cluster.handle();
    info!(node = %handle.self_address(), "cohort node started");

    let mut events = handle
        .subscribe(InitialStateMode::InitialStateAsEvents, EventKind::ALL)
        .await
        .unwrap_or_else(|e| exit_err(e));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::CurrentInternalStats(stats) => {
                    info!(
                        members = stats.member_count,
                        unreachable = stats.unreachable_count,
                        received = stats.received_gossip_count,
                        "gossip stats"
                    );
                }
                other => info!("cluster event: {other}"),
            }
        }
    });

    let cs = cluster.coordinated_shutdown().clone();
    cs.add_task(Phase::Terminate, "log-exit", || async {
        info!("coordinated shutdown finished");
    });

    if let Err(e) = handle.join_seed_nodes(seeds).await {
        exit_err(format!("failed to join: {e}"));
    }

    let terminated = cluster.terminated();
    tokio::pin!(terminated);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown signal received, leaving cluster");
            cs.run(ShutdownReason::ProcessExit).await;
            terminated.await;
        }
        _ = &mut terminated => {
            info!("cluster daemon stopped");
            cs.run(ShutdownReason::ProcessExit).await;
        }
    }
}
