//! A simple runtime for serving a replica by mapping requests to JSON over UDP.
//!
//! Each datagram carries one serde_json-encoded [`Request`]; the reply datagram carries a
//! `Result<Reply, Fault>`. Requests are handled on their own threads because reads may block in
//! the consistency spin, and the socket loop must stay responsive while they do. The same
//! runtime owns the background gossip thread and the shutdown path that deregisters the replica.

use crate::registry::REPLICA_TAG;
use crate::replica::Replica;
use crate::rpc::{Fault, Reply, Request, RpcError, Transport};
use crossbeam_utils::sync::{Parker, Unparker};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_DATAGRAM: usize = 65_535;

/// How often the server loop wakes to check for shutdown.
const SERVE_POLL: Duration = Duration::from_millis(100);

/// Client-side request/reply over UDP. Endpoints are socket addresses in string form, which is
/// exactly what [`spawn_replica`] registers.
pub struct UdpTransport {
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(timeout: Duration) -> Self {
        UdpTransport { timeout }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        UdpTransport::new(Duration::from_secs(1))
    }
}

impl Transport for UdpTransport {
    fn call(&self, endpoint: &str, request: Request) -> Result<Reply, RpcError> {
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|_| RpcError::Connect(endpoint.to_string()))?;
        let socket =
            UdpSocket::bind("0.0.0.0:0").map_err(|_| RpcError::Connect(endpoint.to_string()))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|_| RpcError::Connect(endpoint.to_string()))?;

        let out_buf =
            serde_json::to_vec(&request).map_err(|_| RpcError::Codec(endpoint.to_string()))?;
        socket
            .send_to(&out_buf, addr)
            .map_err(|_| RpcError::Connect(endpoint.to_string()))?;

        let mut in_buf = [0; MAX_DATAGRAM];
        let count = match socket.recv_from(&mut in_buf) {
            Ok((count, _)) => count,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(RpcError::Timeout(endpoint.to_string()));
            }
            Err(_) => return Err(RpcError::Connect(endpoint.to_string())),
        };
        let result: Result<Reply, Fault> = serde_json::from_slice(&in_buf[..count])
            .map_err(|_| RpcError::Codec(endpoint.to_string()))?;
        result.map_err(RpcError::Fault)
    }
}

/// A running replica: its server and gossip threads, plus the switch that stops them.
pub struct ReplicaHandle {
    replica: Arc<Replica>,
    shutdown: Arc<AtomicBool>,
    unparker: Unparker,
    threads: Vec<thread::JoinHandle<()>>,
    endpoint: String,
}

impl ReplicaHandle {
    /// The socket address the replica is serving on, as registered.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Stops both loops, joins them, and removes the replica from the registry. A registry
    /// failure at this point is logged and swallowed so shutdown never blocks on the directory.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.unparker.unpark();
        for thread in self.threads {
            let _ = thread.join();
        }
        if let Err(err) = self.replica.registry().remove(&self.replica.name()) {
            log::warn!("could not deregister {}: {}", self.replica.name(), err);
        } else {
            log::info!("replica {} deregistered", self.replica.id());
        }
    }
}

/// Binds `addr`, registers the replica under `replica:<id>`, and starts the server and gossip
/// threads. Binding to port 0 picks a free port; the registered endpoint is the bound address.
pub fn spawn_replica(replica: Arc<Replica>, addr: SocketAddr) -> io::Result<ReplicaHandle> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(SERVE_POLL))?;
    let endpoint = socket.local_addr()?.to_string();
    replica
        .registry()
        .register(&replica.name(), &endpoint, &[REPLICA_TAG])
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    log::info!("replica {} serving at {}", replica.id(), endpoint);

    let shutdown = Arc::new(AtomicBool::new(false));
    let parker = Parker::new();
    let unparker = parker.unparker().clone();

    let gossip = {
        let replica = Arc::clone(&replica);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || gossip_loop(&replica, &shutdown, &parker))
    };
    let server = {
        let replica = Arc::clone(&replica);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || serve(&replica, &socket, &shutdown))
    };

    Ok(ReplicaHandle {
        replica,
        shutdown,
        unparker,
        threads: vec![gossip, server],
        endpoint,
    })
}

/// The background anti-entropy loop: absorb what the last round delivered, sleep one sync
/// period (interruptibly, for shutdown), then push entries out to peers.
fn gossip_loop(replica: &Replica, shutdown: &AtomicBool, parker: &Parker) {
    while !shutdown.load(Ordering::Relaxed) {
        replica.absorb_gossip();
        parker.park_timeout(replica.config().sync_period);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        replica.spread_gossip();
    }
}

/// The socket loop: decode datagrams and hand each request to its own thread.
fn serve(replica: &Arc<Replica>, socket: &UdpSocket, shutdown: &AtomicBool) {
    let mut in_buf = [0; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        let (count, src) = match socket.recv_from(&mut in_buf) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                log::warn!("replica {}: unable to read socket: {}", replica.id(), err);
                continue;
            }
        };
        let request: Request = match serde_json::from_slice(&in_buf[..count]) {
            Ok(request) => request,
            Err(err) => {
                log::debug!(
                    "replica {}: unparseable request from {}: {}",
                    replica.id(),
                    src,
                    err
                );
                continue;
            }
        };
        log::debug!("replica {}: {:?} from {}", replica.id(), request, src);

        let responder = match socket.try_clone() {
            Ok(socket) => socket,
            Err(err) => {
                log::warn!("replica {}: unable to clone socket: {}", replica.id(), err);
                continue;
            }
        };
        let replica = Arc::clone(replica);
        thread::spawn(move || {
            let result = replica.handle(request);
            match serde_json::to_vec(&result) {
                Ok(out_buf) => {
                    if let Err(err) = responder.send_to(&out_buf, src) {
                        log::warn!("replica {}: unable to reply to {}: {}", replica.id(), src, err);
                    }
                }
                Err(err) => {
                    log::warn!("replica {}: unable to serialize reply: {}", replica.id(), err);
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::VectorClock;
    use crate::oplog::Op;
    use crate::registry::{InMemoryRegistry, Registry};
    use crate::replica::ReplicaConfig;
    use crate::rpc::Status;
    use crate::store::SnapshotDataset;

    #[test]
    fn udp_round_trip() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::default());
        let replica = Arc::new(Replica::new(
            "u1",
            ReplicaConfig::default(),
            Arc::new(SnapshotDataset::empty()),
            Arc::clone(&registry),
            Arc::clone(&transport),
        ));
        let handle = spawn_replica(Arc::clone(&replica), "127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = handle.endpoint().to_string();
        assert_eq!(registry.list(REPLICA_TAG).unwrap()["replica:u1"], endpoint);

        assert_eq!(
            transport.call(&endpoint, Request::Status),
            Ok(Reply::Status(Status::Online))
        );

        let ts = match transport.call(
            &endpoint,
            Request::Update {
                op: Op::UpdateRating { user_id: 7, movie_id: 42, value: 4.5 },
                prev: VectorClock::new(),
            },
        ) {
            Ok(Reply::Updated { ts }) => ts,
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(ts, VectorClock::from([("u1", 1)]));

        match transport.call(&endpoint, Request::Get { user_id: 7, ts }) {
            Ok(Reply::UserData { data, .. }) => assert_eq!(data.ratings[&42], 4.5),
            other => panic!("unexpected reply: {:?}", other),
        }

        handle.shutdown();
        assert!(registry.list(REPLICA_TAG).unwrap().is_empty());
    }

    #[test]
    fn faults_travel_over_the_wire() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::default());
        let replica = Arc::new(Replica::new(
            "u2",
            ReplicaConfig::default(),
            Arc::new(SnapshotDataset::empty()),
            registry,
            Arc::clone(&transport),
        ));
        let handle = spawn_replica(Arc::clone(&replica), "127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = handle.endpoint().to_string();

        replica.set_forced_offline(true);
        assert_eq!(
            transport.call(
                &endpoint,
                Request::Update {
                    op: Op::DeleteRating { user_id: 7, movie_id: 42 },
                    prev: VectorClock::new(),
                },
            ),
            Err(RpcError::Fault(Fault::Offline))
        );
        handle.shutdown();
    }

    #[test]
    fn unparseable_endpoint_cannot_connect() {
        let transport = UdpTransport::default();
        assert_eq!(
            transport.call("not-an-address", Request::Status),
            Err(RpcError::Connect("not-an-address".to_string()))
        );
    }

    #[test]
    fn silent_peer_times_out() {
        let transport = UdpTransport::new(Duration::from_millis(50));
        // Nothing is listening here; depending on the platform the send either times out
        // waiting or is refused outright.
        let err = transport
            .call("127.0.0.1:9", Request::Status)
            .expect_err("nobody should be listening on the discard port");
        assert!(matches!(err, RpcError::Timeout(_) | RpcError::Connect(_)));
    }
}
