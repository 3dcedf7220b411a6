use gossip_cluster::{ClusterNode, NodeConfig};
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--seed <addr:port>] [--meta ns:key=value]", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:7000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7001 --seed 127.0.0.1:7000 --meta default:region=eu",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<String> = None;
    let mut seeds: Vec<String> = vec![];
    let mut initial_metadata: HashMap<String, HashMap<String, serde_json::Value>> = HashMap::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--seed" => {
                seeds.push(args[i + 1].clone());
                i += 2;
            }
            "--meta" => {
                match parse_meta(&args[i + 1]) {
                    Some((namespace, key, value)) => {
                        initial_metadata.entry(namespace).or_default().insert(key, value);
                    }
                    None => {
                        eprintln!("Ignoring malformed --meta argument: {}", args[i + 1]);
                    }
                }
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    tracing::info!("Starting node on {}", bind_addr);
    if !seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    let mut config = NodeConfig::new(bind_addr, seeds);
    config.initial_metadata = initial_metadata;

    let node = ClusterNode::new(config).await?;
    tracing::info!("Node id: {}", node.node_id());
    node.start().await;

    // Periodic cluster stats:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_node.alive_members();
            let suspect = stats_node.suspect_members();
            let stats = stats_node.transport_stats();
            tracing::info!(
                "Cluster stats: {} alive peer(s), {} suspect, {} datagrams sent / {} received",
                alive.len(),
                suspect.len(),
                stats.sent,
                stats.received
            );
            for member in stats_node.members() {
                tracing::info!(
                    "  - {} {:?} (inc={})",
                    member.address,
                    member.status,
                    member.incarnation
                );
            }
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    node.stop().await;

    Ok(())
}

/// Parses `ns:key=value` (value as JSON, falling back to a plain string).
fn parse_meta(arg: &str) -> Option<(String, String, serde_json::Value)> {
    let (scope, raw_value) = arg.split_once('=')?;
    let (namespace, key) = scope.split_once(':')?;
    if namespace.is_empty() || key.is_empty() {
        return None;
    }
    let value = serde_json::from_str(raw_value)
        .unwrap_or_else(|_| serde_json::Value::String(raw_value.to_string()));
    Some((namespace.to_string(), key.to_string(), value))
}
