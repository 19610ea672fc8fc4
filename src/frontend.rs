//! The frontend session: the client-facing half of the service.
//!
//! A session owns a vector clock that accumulates the clock returned by every call, which gives
//! one client read-your-writes and monotonic reads no matter which replica ends up serving. The
//! session holds no other shared state, so a process can run any number of sessions without
//! coordination.
//!
//! Most operations take the first available replica (sticky to the last one that worked).
//! Movie creation instead runs a two-phase majority commit so that new movies are ordered after
//! everything any majority had seen when the movie was created.

use crate::clock::VectorClock;
use crate::oplog::{generate_id, Op, UPDATE_ID_LEN};
use crate::registry::{Registry, REPLICA_TAG};
use crate::rpc::{Fault, Reply, Request, RpcError, Status, Transport};
use crate::store::{Movie, MovieDetail, MovieId, UserData, UserId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for replica selection and the majority paths.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Rounds of registry polling before giving up on finding an online replica.
    pub patience: u32,
    /// Delay between selection and majority retry rounds.
    pub retry_delay: Duration,
    /// Retry rounds without progress before a majority path gives up.
    pub majority_patience: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            patience: 3,
            retry_delay: Duration::from_millis(50),
            majority_patience: 5,
        }
    }
}

/// Errors surfaced to the client. The display strings are the human-readable form the CLI
/// boundary prints.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("no replica available")]
    NoReplicaAvailable,
    #[error("cannot get consensus")]
    NoConsensus,
    #[error("cannot retrieve value; forget the session to read stale data")]
    CannotServe,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unexpected reply from replica")]
    UnexpectedReply,
}

/// One client's session against the replica group.
pub struct Session {
    registry: Arc<dyn Registry>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    session_ts: VectorClock,
    /// Endpoint of the last replica that served us; tried first next time.
    cached: Option<String>,
}

impl Session {
    pub fn new(registry: Arc<dyn Registry>, transport: Arc<dyn Transport>) -> Self {
        Session::with_config(registry, transport, SessionConfig::default())
    }

    pub fn with_config(
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Session {
            registry,
            transport,
            config,
            session_ts: VectorClock::new(),
            cached: None,
        }
    }

    /// The session's accumulated vector clock.
    pub fn get_timestamp(&self) -> VectorClock {
        self.session_ts.clone()
    }

    /// Drops the session's causal history. After a long partition this lets the client trade
    /// read-your-writes for availability: the next read is served from whatever a live replica
    /// has, instead of waiting for a clock that may never be dominated.
    pub fn forget(&mut self) {
        self.session_ts = VectorClock::new();
    }

    /// One user's ratings and tags.
    pub fn get_user_data(&mut self, user_id: UserId) -> Result<UserData, SessionError> {
        let transport = Arc::clone(&self.transport);
        let ts = self.session_ts.clone();
        let reply = self.with_replica(move |endpoint| {
            transport.call(endpoint, Request::Get { user_id, ts: ts.clone() })
        })?;
        match reply {
            Reply::UserData { data, ts } => {
                self.merge_ts(&ts);
                Ok(data)
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    /// The movie id to name mapping. With `maximal` the read is anchored at a majority-merged
    /// clock, so it observes every movie creation any majority had committed.
    pub fn list_movies(&mut self, maximal: bool) -> Result<BTreeMap<MovieId, String>, SessionError> {
        let dep = if maximal {
            self.get_max_timestamp()?
        } else {
            self.session_ts.clone()
        };
        let transport = Arc::clone(&self.transport);
        let reply = self.with_replica(move |endpoint| {
            transport.call(endpoint, Request::ListMovies { ts: dep.clone() })
        })?;
        match reply {
            Reply::Movies { movies, ts } => {
                self.merge_ts(&ts);
                Ok(movies)
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    /// Movies matching a name substring and genre subset.
    pub fn search(
        &mut self,
        name: &str,
        genres: BTreeSet<String>,
    ) -> Result<BTreeMap<MovieId, Movie>, SessionError> {
        let transport = Arc::clone(&self.transport);
        let ts = self.session_ts.clone();
        let name = name.to_string();
        let reply = self.with_replica(move |endpoint| {
            transport.call(
                endpoint,
                Request::Search { name: name.clone(), genres: genres.clone(), ts: ts.clone() },
            )
        })?;
        match reply {
            Reply::Matches { movies, ts } => {
                self.merge_ts(&ts);
                Ok(movies)
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    /// Aggregate detail for one movie, `None` if no replica knows it.
    pub fn get_movie(&mut self, movie_id: MovieId) -> Result<Option<MovieDetail>, SessionError> {
        let transport = Arc::clone(&self.transport);
        let ts = self.session_ts.clone();
        let reply = self.with_replica(move |endpoint| {
            transport.call(endpoint, Request::GetMovie { movie_id, ts: ts.clone() })
        })?;
        match reply {
            Reply::MovieDetail { movie, ts } => {
                self.merge_ts(&ts);
                Ok(movie)
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    /// Sets the caller's rating for a movie. Ratings live on a 0 to 5 scale.
    pub fn add_rating(&mut self, user_id: UserId, movie_id: MovieId, value: f64) -> Result<(), SessionError> {
        if !(0.0..=5.0).contains(&value) || !value.is_finite() {
            return Err(SessionError::InvalidInput(format!(
                "rating {value} is not between 0 and 5"
            )));
        }
        self.send_update(Op::UpdateRating { user_id, movie_id, value })
    }

    /// Removes the caller's rating for a movie.
    pub fn delete_rating(&mut self, user_id: UserId, movie_id: MovieId) -> Result<(), SessionError> {
        self.send_update(Op::DeleteRating { user_id, movie_id })
    }

    /// Adds tags to the caller's tag set for a movie.
    pub fn add_tag(
        &mut self,
        user_id: UserId,
        movie_id: MovieId,
        tags: BTreeSet<String>,
    ) -> Result<(), SessionError> {
        self.send_update(Op::AddTag { user_id, movie_id, tags })
    }

    /// Removes tags from the caller's tag set for a movie.
    pub fn remove_tag(
        &mut self,
        user_id: UserId,
        movie_id: MovieId,
        tags: BTreeSet<String>,
    ) -> Result<(), SessionError> {
        self.send_update(Op::RemoveTag { user_id, movie_id, tags })
    }

    /// Creates a movie through the majority-commit path and returns its fresh id.
    pub fn add_movie(&mut self, name: &str, genres: BTreeSet<String>) -> Result<MovieId, SessionError> {
        if name.trim().is_empty() {
            return Err(SessionError::InvalidInput("movie name must not be empty".to_string()));
        }
        let movie_id: MovieId = rand::thread_rng().gen();
        let movie = Movie { name: name.to_string(), genres };
        self.forced_update(Op::UpdateMovie { movie_id, movie })?;
        Ok(movie_id)
    }

    /// Broadcasts `get_timestamp` and merges the clocks of a majority of replicas. An update
    /// depending on this clock is ordered after everything that majority had seen.
    pub fn get_max_timestamp(&self) -> Result<VectorClock, SessionError> {
        let transport = Arc::clone(&self.transport);
        let mut merged = VectorClock::new();
        self.on_majority(|endpoint| match transport.call(endpoint, Request::GetTimestamp)? {
            Reply::Timestamp(ts) => {
                merged = VectorClock::merge_max(&merged, &ts);
                Ok(())
            }
            _ => Err(RpcError::Codec(endpoint.to_string())),
        })?;
        Ok(merged)
    }

    /// Sends one tentative update to the first available replica and merges the returned clock.
    fn send_update(&mut self, op: Op) -> Result<(), SessionError> {
        let transport = Arc::clone(&self.transport);
        let prev = self.session_ts.clone();
        let reply = self.with_replica(move |endpoint| {
            transport.call(endpoint, Request::Update { op: op.clone(), prev: prev.clone() })
        })?;
        match reply {
            Reply::Updated { ts } => {
                self.merge_ts(&ts);
                Ok(())
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    /// The two-phase majority path. Phase one records the update on a majority of replicas;
    /// phase two commits it on every acceptor, retrying through flakiness until each one has
    /// acknowledged (or reports the commit already happened).
    fn forced_update(&mut self, op: Op) -> Result<(), SessionError> {
        let dep = self.get_max_timestamp()?;
        let update_id = generate_id(UPDATE_ID_LEN);

        let transport = Arc::clone(&self.transport);
        let accepted = {
            let op = op.clone();
            let id = update_id.clone();
            let dep = dep.clone();
            self.on_majority(move |endpoint| {
                match transport.call(
                    endpoint,
                    Request::AcceptUpdate { id: id.clone(), op: op.clone(), prev: dep.clone() },
                )? {
                    Reply::Accepted => Ok(()),
                    _ => Err(RpcError::Codec(endpoint.to_string())),
                }
            })?
        };

        let mut pending = accepted;
        let mut ts = VectorClock::new();
        let mut stalled = 0;
        while !pending.is_empty() {
            let mut progressed = false;
            for endpoint in pending.clone() {
                match self
                    .transport
                    .call(&endpoint, Request::CommitUpdate { id: update_id.clone() })
                {
                    Ok(Reply::Updated { ts: committed }) => {
                        ts = VectorClock::merge_max(&ts, &committed);
                        pending.remove(&endpoint);
                        progressed = true;
                    }
                    // The commit went through earlier but the acknowledgement was lost.
                    Err(RpcError::Fault(Fault::UnknownUpdate(_))) => {
                        pending.remove(&endpoint);
                        progressed = true;
                    }
                    Ok(other) => {
                        log::warn!("unexpected commit reply from {}: {:?}", endpoint, other);
                        pending.remove(&endpoint);
                        progressed = true;
                    }
                    Err(err) => {
                        log::debug!("commit retry for {}: {}", endpoint, err);
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
            if progressed {
                stalled = 0;
            } else {
                stalled += 1;
                if stalled >= self.config.majority_patience {
                    return Err(SessionError::NoConsensus);
                }
            }
            std::thread::sleep(self.config.retry_delay);
        }
        self.merge_ts(&ts);
        Ok(())
    }

    /// Runs `call` against replicas until one succeeds: the cached replica first if it is still
    /// online, then up to `patience` rounds over the shuffled registry listing. Transport
    /// failures and offline replicas move on to the next candidate; replica faults surface
    /// immediately.
    fn with_replica<Out>(
        &mut self,
        mut call: impl FnMut(&str) -> Result<Out, RpcError>,
    ) -> Result<Out, SessionError> {
        if let Some(endpoint) = self.cached.clone() {
            if self.is_online(&endpoint) {
                match call(&endpoint) {
                    Ok(out) => return Ok(out),
                    Err(err) if err.is_unavailability() => {}
                    Err(err) => return Err(map_fault(err)),
                }
            }
        }
        for _ in 0..self.config.patience {
            let mut endpoints = self.endpoints();
            endpoints.shuffle(&mut rand::thread_rng());
            for endpoint in endpoints {
                if !self.is_online(&endpoint) {
                    continue;
                }
                self.cached = Some(endpoint.clone());
                match call(&endpoint) {
                    Ok(out) => return Ok(out),
                    Err(err) if err.is_unavailability() => {}
                    Err(err) => return Err(map_fault(err)),
                }
            }
            std::thread::sleep(self.config.retry_delay);
        }
        Err(SessionError::NoReplicaAvailable)
    }

    /// Runs `call` against every listed replica until a majority has succeeded. Unreachable
    /// replicas are retried each round; after `majority_patience` rounds without a majority the
    /// path fails with `NoConsensus`.
    fn on_majority(
        &self,
        mut call: impl FnMut(&str) -> Result<(), RpcError>,
    ) -> Result<BTreeSet<String>, SessionError> {
        let endpoints = self.endpoints();
        let majority = endpoints.len() / 2 + 1;
        let mut sent = BTreeSet::new();
        let mut patience = self.config.majority_patience;
        loop {
            for endpoint in &endpoints {
                if sent.contains(endpoint) {
                    continue;
                }
                match call(endpoint) {
                    Ok(()) => {
                        sent.insert(endpoint.clone());
                    }
                    Err(err) if err.is_unavailability() => {}
                    Err(err) => return Err(map_fault(err)),
                }
            }
            if sent.len() >= majority {
                return Ok(sent);
            }
            patience -= 1;
            if patience == 0 {
                return Err(SessionError::NoConsensus);
            }
            std::thread::sleep(self.config.retry_delay);
        }
    }

    fn endpoints(&self) -> Vec<String> {
        match self.registry.list(REPLICA_TAG) {
            Ok(replicas) => replicas.into_values().collect(),
            Err(err) => {
                log::warn!("registry lookup failed: {}", err);
                Vec::new()
            }
        }
    }

    fn is_online(&self, endpoint: &str) -> bool {
        matches!(
            self.transport.call(endpoint, Request::Status),
            Ok(Reply::Status(Status::Online))
        )
    }

    fn merge_ts(&mut self, ts: &VectorClock) {
        self.session_ts = VectorClock::merge_max(&self.session_ts, ts);
    }
}

/// Maps a call failure that `with_replica`/`on_majority` did not absorb into the client-facing
/// error. Unavailability never reaches here; it is handled by moving to another replica.
fn map_fault(err: RpcError) -> SessionError {
    match err {
        RpcError::Fault(Fault::CannotServe) => SessionError::CannotServe,
        RpcError::Fault(Fault::Invalid(reason)) => SessionError::InvalidInput(reason),
        _ => SessionError::UnexpectedReply,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replica::ReplicaConfig;
    use crate::test_util::Cluster;

    #[test]
    fn session_reads_its_own_writes() {
        let cluster = Cluster::new(3);
        let mut session = cluster.session();

        session.add_rating(7, 42, 4.5).unwrap();
        let data = session.get_user_data(7).unwrap();
        assert_eq!(data.ratings, BTreeMap::from([(42, 4.5)]));

        session.delete_rating(7, 42).unwrap();
        assert!(session.get_user_data(7).unwrap().ratings.is_empty());
    }

    #[test]
    fn session_rejects_out_of_range_ratings() {
        let cluster = Cluster::new(1);
        let mut session = cluster.session();
        assert!(matches!(
            session.add_rating(7, 42, 5.5),
            Err(SessionError::InvalidInput(_))
        ));
        assert!(matches!(
            session.add_rating(7, 42, f64::NAN),
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_registry_yields_no_replica_available() {
        let cluster = Cluster::new(0);
        let mut session = cluster.session();
        assert_eq!(session.list_movies(false), Err(SessionError::NoReplicaAvailable));
    }

    #[test]
    fn causal_read_waits_for_gossip_on_another_replica() {
        let cluster = Cluster::builder(2)
            .config(ReplicaConfig {
                sync_period: Duration::from_millis(20),
                ..ReplicaConfig::default()
            })
            .build();
        let (r1, r2) = (cluster.replica(0), cluster.replica(1));

        // Pin the write to the first replica, then take it away so the read lands on the
        // second, which has not heard of the write yet.
        r2.set_forced_offline(true);
        let mut session = cluster.session();
        session.add_rating(7, 42, 4.0).unwrap();
        assert_eq!(session.get_timestamp(), VectorClock::from([(r1.id(), 1)]));
        r2.set_forced_offline(false);
        cluster.kill(0);

        let reader = std::thread::spawn(move || session.get_user_data(7));
        std::thread::sleep(Duration::from_millis(5));
        r1.spread_gossip();
        r2.absorb_gossip();

        let data = reader.join().unwrap().unwrap();
        assert_eq!(data.ratings[&42], 4.0);
    }

    #[test]
    fn majority_movie_creation_survives_a_partition() {
        let cluster = Cluster::new(3);
        let r3 = cluster.replica(2);
        r3.set_forced_offline(true);

        let mut session = cluster.session();
        let movie_id = session
            .add_movie("Dune", BTreeSet::from(["scifi".to_string()]))
            .unwrap();

        // Both acceptors committed independently, so the session clock covers two counters; one
        // gossip round lets either of them dominate it.
        cluster.gossip_round();
        let detail = session.get_movie(movie_id).unwrap().unwrap();
        assert_eq!(detail.name, "Dune");

        // The partitioned replica catches up through gossip and reconstruction.
        r3.set_forced_offline(false);
        cluster.gossip_round();
        cluster.gossip_round();
        cluster.reconstruct_all();

        let states: Vec<_> = (0..3).map(|i| cluster.replica(i).get_state().1).collect();
        assert_eq!(states[0], states[1]);
        assert_eq!(states[1], states[2]);
        assert!(states[2].movies.contains_key(&movie_id));

        let logs: Vec<_> = (0..3).map(|i| cluster.replica(i).get_log().1).collect();
        assert_eq!(logs[0], logs[1]);
        assert_eq!(logs[1], logs[2]);
    }

    #[test]
    fn majority_fails_without_quorum() {
        let cluster = Cluster::new(3);
        cluster.replica(1).set_forced_offline(true);
        cluster.replica(2).set_forced_offline(true);

        let mut session = cluster.session();
        assert_eq!(
            session.add_movie("Dune", BTreeSet::new()),
            Err(SessionError::NoConsensus)
        );
    }

    #[test]
    fn forget_recovers_from_a_lost_replica() {
        let cluster = Cluster::builder(2)
            .config(ReplicaConfig {
                sync_period: Duration::from_millis(1),
                read_patience: 2,
                ..ReplicaConfig::default()
            })
            .build();
        let r2 = cluster.replica(1);

        // The only replica that saw the write dies before gossiping.
        r2.set_forced_offline(true);
        let mut session = cluster.session();
        session.add_rating(7, 42, 4.0).unwrap();
        r2.set_forced_offline(false);
        cluster.kill(0);

        assert_eq!(session.get_user_data(7), Err(SessionError::CannotServe));

        session.forget();
        let movies = session.list_movies(false).unwrap();
        assert!(movies.is_empty());
        assert!(session.get_user_data(7).unwrap().ratings.is_empty());
    }

    #[test]
    fn maximal_listing_observes_majority_committed_movies() {
        let cluster = Cluster::new(2);
        let mut writer = cluster.session();
        let movie_id = writer.add_movie("Dune", BTreeSet::new()).unwrap();
        cluster.gossip_round();

        // A brand-new session with an empty clock still sees the movie when it asks for the
        // maximal listing, because the read is anchored at the majority-merged clock.
        let mut reader = cluster.session();
        let movies = reader.list_movies(true).unwrap();
        assert_eq!(movies[&movie_id], "Dune");
    }
}
