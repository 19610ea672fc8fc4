//! Utilities for tests: an in-process cluster with a table-backed transport, so scenarios drive
//! gossip deterministically instead of racing a background timer.

use crate::frontend::{Session, SessionConfig};
use crate::registry::{InMemoryRegistry, Registry, REPLICA_TAG};
use crate::replica::{Replica, ReplicaConfig};
use crate::rpc::{Reply, Request, RpcError, Transport};
use crate::store::{Dataset, SnapshotDataset};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A transport that dispatches to replicas in the same process. Removing an entry simulates a
/// dead replica: calls fail with a connect error, exactly like an unreachable peer.
#[derive(Default)]
pub struct InProcTransport {
    replicas: DashMap<String, Arc<Replica>>,
    sync_calls: AtomicUsize,
}

impl InProcTransport {
    pub fn new() -> Self {
        InProcTransport::default()
    }

    pub fn add(&self, endpoint: &str, replica: Arc<Replica>) {
        self.replicas.insert(endpoint.to_string(), replica);
    }

    pub fn kill(&self, endpoint: &str) {
        self.replicas.remove(endpoint);
    }

    /// How many `sync` payloads have crossed this transport.
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::Relaxed)
    }
}

impl Transport for InProcTransport {
    fn call(&self, endpoint: &str, request: Request) -> Result<Reply, RpcError> {
        if matches!(request, Request::Sync { .. }) {
            self.sync_calls.fetch_add(1, Ordering::Relaxed);
        }
        // Clone out of the map so a long-running handler (a read spin) does not pin the shard.
        let replica = match self.replicas.get(endpoint) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(RpcError::Connect(endpoint.to_string())),
        };
        replica.handle(request).map_err(RpcError::from)
    }
}

/// A group of replicas with ids `r1..rN` sharing one registry and transport.
pub struct Cluster {
    registry: Arc<InMemoryRegistry>,
    transport: Arc<InProcTransport>,
    replicas: Vec<Arc<Replica>>,
}

pub struct ClusterBuilder {
    count: usize,
    config: ReplicaConfig,
    dataset: Arc<dyn Dataset>,
}

impl Cluster {
    pub fn new(count: usize) -> Self {
        Cluster::builder(count).build()
    }

    pub fn builder(count: usize) -> ClusterBuilder {
        ClusterBuilder {
            count,
            // A short sync period keeps accidental read spins from stalling the test suite.
            config: ReplicaConfig {
                sync_period: Duration::from_millis(25),
                ..ReplicaConfig::default()
            },
            dataset: Arc::new(SnapshotDataset::empty()),
        }
    }

    pub fn replica(&self, index: usize) -> Arc<Replica> {
        Arc::clone(&self.replicas[index])
    }

    pub fn endpoint(index: usize) -> String {
        format!("mem://r{}", index + 1)
    }

    /// Makes a replica unreachable, as distinct from offline: calls fail at the transport.
    pub fn kill(&self, index: usize) {
        self.transport.kill(&Cluster::endpoint(index));
    }

    /// One full gossip round: every replica sends, then every replica absorbs what it received.
    pub fn gossip_round(&self) {
        for replica in &self.replicas {
            replica.spread_gossip();
        }
        for replica in &self.replicas {
            replica.absorb_gossip();
        }
    }

    /// Forces a reconstruction on every replica, canonicalizing their logs.
    pub fn reconstruct_all(&self) {
        for replica in &self.replicas {
            replica.force_reconstruct();
        }
    }

    pub fn sync_calls(&self) -> usize {
        self.transport.sync_calls()
    }

    /// A fresh client session against this cluster.
    pub fn session(&self) -> Session {
        let registry: Arc<dyn Registry> = self.registry.clone();
        let transport: Arc<dyn Transport> = self.transport.clone();
        Session::with_config(
            registry,
            transport,
            SessionConfig {
                retry_delay: Duration::from_millis(1),
                ..SessionConfig::default()
            },
        )
    }
}

impl ClusterBuilder {
    pub fn config(mut self, config: ReplicaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dataset(mut self, dataset: Arc<dyn Dataset>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn build(self) -> Cluster {
        let registry = Arc::new(InMemoryRegistry::new());
        let transport = Arc::new(InProcTransport::new());
        let registry_dyn: Arc<dyn Registry> = registry.clone();
        let transport_dyn: Arc<dyn Transport> = transport.clone();

        let mut replicas = Vec::with_capacity(self.count);
        for index in 0..self.count {
            let id = format!("r{}", index + 1);
            let endpoint = Cluster::endpoint(index);
            let replica = Arc::new(Replica::new(
                id,
                self.config.clone(),
                Arc::clone(&self.dataset),
                Arc::clone(&registry_dyn),
                Arc::clone(&transport_dyn),
            ));
            registry
                .register(&replica.name(), &endpoint, &[REPLICA_TAG])
                .expect("in-memory registry never fails");
            transport.add(&endpoint, Arc::clone(&replica));
            replicas.push(replica);
        }
        Cluster { registry, transport, replicas }
    }
}
