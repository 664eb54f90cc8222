use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::sync::Arc;

use cluster_manager_core::config::ManagerConfig;
use cluster_manager_core::failover::{Collaborators, FailoverOptions};
use cluster_manager_core::log::{init_logging, log_shutdown, log_startup};
use cluster_manager_core::quorum::{Txn, Write};
use cluster_manager_core::{
    BucketConfig, BucketType, ClusterManager, InMemoryQuorumStore, Key, NodeId, Service, SharedServices, Value,
};

const DEFAULT_VBUCKETS: usize = 64;
const DEFAULT_REPLICAS: usize = 1;

/// Command line options
#[derive(Debug, Default)]
struct Options {
    config_path: Option<String>,
    node_id: Option<String>,
    nodes: Vec<(NodeId, BTreeSet<Service>)>,
    failover: Vec<NodeId>,
    allow_unsafe: bool,
    auto: bool,
    vbuckets: Option<usize>,
    exit_after_failover: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args)? {
        Some(options) => options,
        None => {
            print_usage();
            return Ok(());
        }
    };

    let mut config = match &options.config_path {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(node_id) = &options.node_id {
        config.node.node_id = node_id.clone();
    }
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config error: {}", error);
        }
        return Err("Invalid configuration".into());
    }

    init_logging(&config.logging)?;
    log_startup(&config);

    run(config, options).await
}

fn parse_args(args: &[String]) -> Result<Option<Options>, Box<dyn Error>> {
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => options.config_path = Some(value_of(args, i, "--config")?),
            "--node-id" => options.node_id = Some(value_of(args, i, "--node-id")?),
            "--nodes" => options.nodes = parse_nodes(&value_of(args, i, "--nodes")?)?,
            "--failover" => {
                options.failover = value_of(args, i, "--failover")?
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(NodeId::from)
                    .collect();
            }
            "--vbuckets" => {
                let count = value_of(args, i, "--vbuckets")?;
                options.vbuckets = Some(count.parse().map_err(|_| format!("Invalid vbucket count: {}", count))?);
            }
            "--allow-unsafe" => {
                options.allow_unsafe = true;
                i += 1;
                continue;
            }
            "--auto" => {
                options.auto = true;
                i += 1;
                continue;
            }
            "--exit" => {
                options.exit_after_failover = true;
                i += 1;
                continue;
            }
            "--help" => return Ok(None),
            other => {
                eprintln!("Unknown argument: {}", other);
                print_usage();
                return Err("Unknown argument".into());
            }
        }
        i += 2;
    }

    Ok(Some(options))
}

fn value_of(args: &[String], i: usize, flag: &str) -> Result<String, Box<dyn Error>> {
    match args.get(i + 1) {
        Some(value) => Ok(value.clone()),
        None => {
            eprintln!("Error: {} requires a value", flag);
            Err(format!("Missing value for {}", flag).into())
        }
    }
}

/// Parse `a,b=kv+index,c` into nodes and their services; kv by default
fn parse_nodes(list: &str) -> Result<Vec<(NodeId, BTreeSet<Service>)>, Box<dyn Error>> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|entry| -> Result<(NodeId, BTreeSet<Service>), Box<dyn Error>> {
            let (name, services) = match entry.split_once('=') {
                Some((name, services)) => (name, services),
                None => (entry, "kv"),
            };
            let services = services
                .split('+')
                .map(parse_service)
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok((NodeId::from(name), services))
        })
        .collect()
}

fn parse_service(name: &str) -> Result<Service, Box<dyn Error>> {
    let service = match name {
        "kv" => Service::Kv,
        "index" => Service::Index,
        "n1ql" => Service::N1ql,
        "fts" => Service::Fts,
        "eventing" => Service::Eventing,
        "cbas" => Service::Cbas,
        "backup" => Service::Backup,
        other => return Err(format!("Unknown service: {}", other).into()),
    };
    Ok(service)
}

fn print_usage() {
    println!("Cluster manager control plane");
    println!();
    println!("Usage:");
    println!("  cluster_manager_server [options]");
    println!();
    println!("Options:");
    println!("  --config <path>             # Configuration file (toml or yaml)");
    println!("  --node-id <id>              # Identifier of this node");
    println!("  --nodes <a,b=kv+index,...>  # Nodes to bootstrap, with services (default kv)");
    println!("  --vbuckets <n>              # Vbuckets of the demo bucket (default: 64)");
    println!("  --failover <a,b>            # Fail these nodes over after startup");
    println!("  --allow-unsafe              # Allow quorum-loss failover of inactive nodes");
    println!("  --auto                      # Treat the failover as an auto-failover");
    println!("  --exit                      # Exit after the failover instead of waiting for Ctrl-C");
    println!();
    println!("Examples:");
    println!("  cluster_manager_server --node-id a --nodes a,b,c --failover c --exit");
    println!("  cluster_manager_server --config manager.toml --nodes a,b=kv+index");
}

async fn run(config: ManagerConfig, options: Options) -> Result<(), Box<dyn Error>> {
    let local = NodeId::from(config.node.node_id.clone());
    let mut nodes: BTreeMap<NodeId, BTreeSet<Service>> = options.nodes.iter().cloned().collect();
    nodes.entry(local.clone()).or_insert_with(|| [Service::Kv].into_iter().collect());

    let store = Arc::new(InMemoryQuorumStore::new(config.store.event_buffer));
    let shared = SharedServices::default();

    // Every node of the in-process cluster gets its own manager so leadership can move
    let mut managers = Vec::new();
    for node in nodes.keys() {
        let mut node_config = config.clone();
        node_config.node.node_id = node.to_string();
        managers.push(ClusterManager::with_shared(
            node_config,
            store.clone(),
            shared.clone(),
            Collaborators::local(),
        ));
    }

    let local_index = managers.iter().position(|m| *m.node() == local).ok_or("local node missing")?;
    managers.swap(0, local_index);

    managers[0].bootstrap(&nodes).await?;
    seed_bucket(&managers[0], &nodes, options.vbuckets.unwrap_or(DEFAULT_VBUCKETS)).await?;
    for manager in managers.iter_mut() {
        manager.start().await;
    }
    println!("Cluster of {} node(s) started, leader: {:?}", nodes.len(), shared.election.leader());

    if !options.failover.is_empty() {
        let failover_options = FailoverOptions {
            allow_unsafe: options.allow_unsafe,
            auto: options.auto,
            failover_ref: None,
        };
        let targets: BTreeSet<NodeId> = options.failover.iter().cloned().collect();

        match managers[0].failover(targets, failover_options).await {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => tracing::error!("Failover failed ({}): {}", e.code(), e),
        }
        println!("{}", serde_json::to_string_pretty(&managers[0].status().await)?);
    }

    if !options.exit_after_failover {
        tokio::signal::ctrl_c().await?;
    }

    for manager in managers.iter_mut() {
        manager.stop().await;
    }
    log_shutdown("requested");
    Ok(())
}

/// Create a `default` bucket whose chains rotate over the kv nodes
async fn seed_bucket(
    manager: &ClusterManager,
    nodes: &BTreeMap<NodeId, BTreeSet<Service>>,
    vbuckets: usize,
) -> Result<(), Box<dyn Error>> {
    let servers: Vec<NodeId> = nodes
        .iter()
        .filter(|(_, services)| services.contains(&Service::Kv))
        .map(|(node, _)| node.clone())
        .collect();
    if servers.is_empty() || vbuckets == 0 {
        return Ok(());
    }

    let replicas = DEFAULT_REPLICAS.min(servers.len() - 1);
    let map = (0..vbuckets)
        .map(|vb| {
            (0..=replicas)
                .map(|offset| Some(servers[(vb + offset) % servers.len()].clone()))
                .collect()
        })
        .collect();
    let bucket = BucketConfig::new("default", BucketType::Couchstore, replicas)
        .with_servers(servers)
        .with_map(map);

    let key = Key::buckets();
    manager
        .client()
        .transaction(&[key.clone()], None, |_snapshot| {
            let buckets: BTreeMap<String, BucketConfig> = [(bucket.name.clone(), bucket.clone())].into_iter().collect();
            Txn::<(), ()>::Commit(vec![Write::Set(key.clone(), Value::Buckets(buckets))], ())
        })
        .await?;
    Ok(())
}
