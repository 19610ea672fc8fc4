//! The replica RPC surface as data: request and reply enums, the fault values a replica can
//! raise, and the transport abstraction calls travel through.
//!
//! Keeping the surface as a pair of serde enums means every transport (the in-process one the
//! tests use, the JSON-over-UDP runtime in [`crate::spawn`]) shares one dispatch point,
//! [`crate::replica::Replica::handle`], and one wire encoding.

use crate::clock::VectorClock;
use crate::oplog::{Entry, Op};
use crate::store::{Db, Movie, MovieDetail, MovieId, UserData, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A replica's advertised availability.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Overloaded,
    Offline,
}

/// A request to a replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Status,
    GetTimestamp,
    Sync { entries: Vec<Entry>, ts: VectorClock },
    ListMovies { ts: VectorClock },
    Search { name: String, genres: BTreeSet<String>, ts: VectorClock },
    GetMovie { movie_id: MovieId, ts: VectorClock },
    Get { user_id: UserId, ts: VectorClock },
    Update { op: Op, prev: VectorClock },
    AcceptUpdate { id: String, op: Op, prev: VectorClock },
    CommitUpdate { id: String },
    GetLog,
    GetState,
    SetForcedOffline { offline: bool },
}

/// A successful reply from a replica. Variants correspond to [`Request`] variants one-to-one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Status(Status),
    Timestamp(VectorClock),
    Synced,
    Movies { movies: BTreeMap<MovieId, String>, ts: VectorClock },
    Matches { movies: BTreeMap<MovieId, Movie>, ts: VectorClock },
    MovieDetail { movie: Option<MovieDetail>, ts: VectorClock },
    UserData { data: UserData, ts: VectorClock },
    Updated { ts: VectorClock },
    Accepted,
    Log { replica: String, log: Vec<Entry> },
    State { replica: String, db: Box<Db> },
    ForcedOffline,
}

/// A fault raised by the replica itself (as opposed to the transport). Faults are part of the
/// wire protocol: the server sends `Result<Reply, Fault>` and the client-side transport folds
/// them into [`RpcError::Fault`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum Fault {
    /// The replica is offline (forced or simulated) and refuses the call.
    #[error("replica is offline")]
    Offline,
    /// The read spin exhausted its patience without the state clock catching up.
    #[error("cannot retrieve a causally consistent value")]
    CannotServe,
    /// `commit_update` for an id with no tentative record.
    #[error("no tentative update with id {0}")]
    UnknownUpdate(String),
    /// A request the replica cannot interpret.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// A failed call: either the transport broke down or the replica raised a fault.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("cannot connect to {0}")]
    Connect(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("malformed message from {0}")]
    Codec(String),
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl RpcError {
    /// True for failures that mean "try another replica" rather than "this call is wrong":
    /// transport breakdowns and the offline fault. Mirrors the distinction between connection
    /// errors and status errors at the session layer.
    pub fn is_unavailability(&self) -> bool {
        matches!(
            self,
            RpcError::Connect(_) | RpcError::Timeout(_) | RpcError::Codec(_) | RpcError::Fault(Fault::Offline)
        )
    }
}

/// Request/reply messaging to a named endpoint.
///
/// Implementations decide what an endpoint string means: the UDP transport parses socket
/// addresses, the in-process test transport treats them as table keys. Calls are synchronous and
/// bounded by the transport's own timeout.
pub trait Transport: Send + Sync {
    fn call(&self, endpoint: &str, request: Request) -> Result<Reply, RpcError>;
}
