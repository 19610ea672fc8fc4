//! A gossip-replicated, eventually-consistent movie rating service.
//!
//! The service keeps a movie/rating/tag dataset on a group of replicas. Updates are accepted
//! tentatively by whichever replica a client session reaches, exchanged pairwise through
//! anti-entropy gossip, and applied in a causally consistent order; once gossip has propagated
//! and a reconstruction pass has run, every replica holds a byte-identical log and database.
//! Sessions carry a vector clock that buys read-your-writes and monotonic reads without any
//! cross-replica coordination, and movie creation runs a two-phase majority commit so new movies
//! are globally ordered.
//!
//! Please see the `demos` directory for runnable replica and client mains.
//!
//! ```rust,no_run
//! use reelsync::registry::{InMemoryRegistry, Registry};
//! use reelsync::replica::{Replica, ReplicaConfig};
//! use reelsync::rpc::Transport;
//! use reelsync::spawn::{spawn_replica, UdpTransport};
//! use reelsync::store::SnapshotDataset;
//! use reelsync::frontend::Session;
//! use std::sync::Arc;
//!
//! let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
//! let transport: Arc<dyn Transport> = Arc::new(UdpTransport::default());
//! let replica = Arc::new(Replica::new(
//!     "a",
//!     ReplicaConfig::default(),
//!     Arc::new(SnapshotDataset::empty()),
//!     Arc::clone(&registry),
//!     Arc::clone(&transport),
//! ));
//! let handle = spawn_replica(replica, "127.0.0.1:0".parse().unwrap()).unwrap();
//!
//! let mut session = Session::new(registry, transport);
//! session.add_rating(7, 42, 4.5).unwrap();
//! assert_eq!(session.get_user_data(7).unwrap().ratings[&42], 4.5);
//! handle.shutdown();
//! ```

pub mod clock;
pub mod frontend;
pub mod oplog;
pub mod registry;
pub mod replay;
pub mod replica;
pub mod rpc;
pub mod spawn;
pub mod store;
#[cfg(test)]
pub mod test_util;

pub use clock::VectorClock;
pub use frontend::{Session, SessionConfig, SessionError};
pub use oplog::{Entry, Op};
pub use replica::{Replica, ReplicaConfig};
pub use rpc::{Fault, Reply, Request, RpcError, Status, Transport};
pub use store::{Dataset, Db, Movie, MovieId, UserId};
