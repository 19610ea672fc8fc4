//! A replica node serving the store as JSON over UDP.
//!
//! The demo keeps the name service in-process, so peer replicas are listed statically:
//!
//! ```text
//! $ cargo run --example replica -- r1 --addr 127.0.0.1:4001 \
//!       --peer r2=127.0.0.1:4002 --peer r3=127.0.0.1:4003 \
//!       --data data/ml-latest-small
//! ```
//!
//! SIGINT/SIGTERM deregister the replica and exit cleanly.

use reelsync::oplog::{generate_id, UPDATE_ID_LEN};
use reelsync::registry::{InMemoryRegistry, Registry, REPLICA_TAG};
use reelsync::replica::{Replica, ReplicaConfig};
use reelsync::rpc::Transport;
use reelsync::spawn::{spawn_replica, UdpTransport};
use reelsync::store::{load_movielens, Dataset, SnapshotDataset};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();
    let addr: SocketAddr = args
        .opt_value_from_str("--addr")?
        .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
    let data: Option<PathBuf> = args.opt_value_from_str("--data")?;
    let sync_period_ms: Option<u64> = args.opt_value_from_str("--sync-period-ms")?;
    let flaky = args.contains("--flaky");
    let peers: Vec<String> = args.values_from_str("--peer")?;
    let id: String = args
        .opt_free_from_str()?
        .unwrap_or_else(|| generate_id(UPDATE_ID_LEN));

    let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
    for peer in &peers {
        let (peer_id, endpoint) = peer
            .split_once('=')
            .ok_or("peers must look like id=host:port")?;
        registry.register(&format!("{}:{}", REPLICA_TAG, peer_id), endpoint, &[REPLICA_TAG])?;
    }

    let dataset: Arc<dyn Dataset> = match data {
        Some(dir) => Arc::new(SnapshotDataset::new(load_movielens(&dir)?)),
        None => Arc::new(SnapshotDataset::empty()),
    };

    let mut config = ReplicaConfig {
        simulate_flakiness: flaky,
        ..ReplicaConfig::default()
    };
    if let Some(ms) = sync_period_ms {
        config.sync_period = Duration::from_millis(ms);
    }

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::default());
    let replica = Arc::new(Replica::new(id, config, dataset, registry, transport));
    let handle = spawn_replica(replica, addr)?;
    println!("replica {} listening on {}", handle.replica().id(), handle.endpoint());

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    handle.shutdown();
    Ok(())
}
