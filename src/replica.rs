//! The replica state machine: tentative update buffer, applied log, vector-clock bookkeeping,
//! pairwise gossip, and periodic reconstruction.
//!
//! A replica accepts updates tentatively, serves reads once its state clock dominates the
//! caller's, and converges with its peers through an anti-entropy gossip exchange. One mutex
//! guards the whole mutable record; the read spin and the gossip loop both release it while
//! waiting so RPC handling stays live.

use crate::clock::VectorClock;
use crate::oplog::{generate_id, now_millis, Entry, Op, UPDATE_ID_LEN};
use crate::registry::{Registry, REPLICA_TAG};
use crate::replay::apply_updates;
use crate::rpc::{Fault, Reply, Request, Status, Transport};
use crate::store::{Dataset, Db, Movie, MovieDetail, MovieId, UserData, UserId};
use ahash::AHashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for one replica. The defaults follow the service's conventional timings: gossip
/// every two seconds, ten rounds of read patience, five peers per gossip round, reconstruction
/// after five idle rounds.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    /// Delay between gossip rounds, and the unit of read-spin patience.
    pub sync_period: Duration,
    /// How many `sync_period`s a read waits for the state clock to catch up before giving up.
    pub read_patience: u32,
    /// Maximum number of peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Idle gossip rounds before a pending reconstruction runs.
    pub reconstruct_after: u32,
    /// Simulated flakiness: when set, the replica randomly reports itself overloaded (p=0.25 per
    /// status call) and drops offline between gossip rounds (p=0.25 per round). Off by default;
    /// production replicas are always online unless forced offline.
    pub simulate_flakiness: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            sync_period: Duration::from_secs(2),
            read_patience: 10,
            gossip_fanout: 5,
            reconstruct_after: 5,
            simulate_flakiness: false,
        }
    }
}

/// Everything the replica mutex guards.
struct State {
    db: Db,
    log: Vec<Entry>,
    buffer: Vec<Entry>,
    state_ts: VectorClock,
    sync_ts: VectorClock,
    executed_ids: AHashSet<String>,
    executed_uids: AHashSet<(String, String)>,
    tentative: BTreeMap<String, (Op, VectorClock)>,
    has_new_gossip: bool,
    need_reconstruct: bool,
    is_online: bool,
    forced_offline: bool,
    idle_rounds: u32,
}

/// A single replica of the movie store.
pub struct Replica {
    id: String,
    config: ReplicaConfig,
    dataset: Arc<dyn Dataset>,
    registry: Arc<dyn Registry>,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    /// Signalled whenever entries are applied, waking read spins.
    applied: Condvar,
}

impl Replica {
    pub fn new(
        id: impl Into<String>,
        config: ReplicaConfig,
        dataset: Arc<dyn Dataset>,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let db = dataset.load();
        Replica {
            id: id.into(),
            config,
            dataset,
            registry,
            transport,
            state: Mutex::new(State {
                db,
                log: Vec::new(),
                buffer: Vec::new(),
                state_ts: VectorClock::new(),
                sync_ts: VectorClock::new(),
                executed_ids: AHashSet::new(),
                executed_uids: AHashSet::new(),
                tentative: BTreeMap::new(),
                has_new_gossip: false,
                need_reconstruct: false,
                is_online: true,
                forced_offline: false,
                idle_rounds: 0,
            }),
            applied: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The name this replica registers under.
    pub fn name(&self) -> String {
        format!("{}:{}", REPLICA_TAG, self.id)
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// The replica's advertised availability. Overloaded is a random draw used only when
    /// flakiness simulation is on.
    pub fn status(&self) -> Status {
        {
            let state = self.state.lock();
            if state.forced_offline || !state.is_online {
                return Status::Offline;
            }
        }
        if self.config.simulate_flakiness && rand::thread_rng().gen_bool(0.25) {
            return Status::Overloaded;
        }
        Status::Online
    }

    /// Forces the replica offline (or back online) for fault injection. Deliberately exempt from
    /// the online check so a forced-offline replica can be revived.
    pub fn set_forced_offline(&self, offline: bool) {
        self.state.lock().forced_offline = offline;
    }

    /// The sync clock covering every known entry, applied or buffered.
    pub fn get_timestamp(&self) -> Result<VectorClock, Fault> {
        let state = self.lock_online()?;
        Ok(state.sync_ts.clone())
    }

    /// Receives a gossip payload from a peer: entries join the buffer, the peer's sync clock
    /// merges into ours, and the next gossip round replays. Accepted even while offline: an
    /// offline replica refuses to serve, not to learn.
    pub fn sync(&self, entries: Vec<Entry>, peer_ts: VectorClock) {
        let mut state = self.state.lock();
        state.buffer.extend(entries);
        state.sync_ts = VectorClock::merge_max(&state.sync_ts, &peer_ts);
        state.has_new_gossip = true;
    }

    /// `list_movies`: the id-to-name mapping, once the state clock dominates `ts`.
    pub fn list_movies(&self, ts: &VectorClock) -> Result<(BTreeMap<MovieId, String>, VectorClock), Fault> {
        let state = self.wait_for_consistency(ts)?;
        Ok((state.db.movie_names(), state.state_ts.clone()))
    }

    /// `search`: case-sensitive substring match on the name, subset match on genres.
    pub fn search(
        &self,
        name: &str,
        genres: &BTreeSet<String>,
        ts: &VectorClock,
    ) -> Result<(BTreeMap<MovieId, Movie>, VectorClock), Fault> {
        let state = self.wait_for_consistency(ts)?;
        Ok((state.db.search(name, genres), state.state_ts.clone()))
    }

    /// `get_movie`: aggregate detail for one movie, `None` if unknown.
    pub fn get_movie(
        &self,
        movie_id: MovieId,
        ts: &VectorClock,
    ) -> Result<(Option<MovieDetail>, VectorClock), Fault> {
        let state = self.wait_for_consistency(ts)?;
        Ok((state.db.movie_detail(movie_id), state.state_ts.clone()))
    }

    /// `get`: one user's ratings and tags.
    pub fn get(&self, user_id: UserId, ts: &VectorClock) -> Result<(UserData, VectorClock), Fault> {
        let state = self.wait_for_consistency(ts)?;
        Ok((state.db.user_data(user_id), state.state_ts.clone()))
    }

    /// The tentative single-replica update path: timestamp the operation here and buffer it.
    /// Returns the new entry's timestamp for the session to merge.
    pub fn update(&self, op: Op, prev: VectorClock) -> Result<VectorClock, Fault> {
        let mut state = self.lock_online()?;
        Ok(self.apply_local(&mut state, op, prev, None))
    }

    /// Phase one of the majority-commit path: record the update without timestamping it.
    pub fn accept_update(&self, id: impl Into<String>, op: Op, prev: VectorClock) -> Result<(), Fault> {
        let mut state = self.lock_online()?;
        state.tentative.insert(id.into(), (op, prev));
        Ok(())
    }

    /// Phase two: promote a tentative update into the buffer under the agreed id.
    pub fn commit_update(&self, id: &str) -> Result<VectorClock, Fault> {
        let mut state = self.lock_online()?;
        let Some((op, prev)) = state.tentative.remove(id) else {
            return Err(Fault::UnknownUpdate(id.to_string()));
        };
        Ok(self.apply_local(&mut state, op, prev, Some(id.to_string())))
    }

    /// Diagnostic: the applied log in order.
    pub fn get_log(&self) -> (String, Vec<Entry>) {
        let state = self.state.lock();
        (self.id.clone(), state.log.clone())
    }

    /// Diagnostic: a snapshot of the database.
    pub fn get_state(&self) -> (String, Db) {
        let state = self.state.lock();
        (self.id.clone(), state.db.clone())
    }

    /// Dispatches a wire request to the matching operation.
    pub fn handle(&self, request: Request) -> Result<Reply, Fault> {
        match request {
            Request::Status => Ok(Reply::Status(self.status())),
            Request::GetTimestamp => self.get_timestamp().map(Reply::Timestamp),
            Request::Sync { entries, ts } => {
                self.sync(entries, ts);
                Ok(Reply::Synced)
            }
            Request::ListMovies { ts } => self
                .list_movies(&ts)
                .map(|(movies, ts)| Reply::Movies { movies, ts }),
            Request::Search { name, genres, ts } => self
                .search(&name, &genres, &ts)
                .map(|(movies, ts)| Reply::Matches { movies, ts }),
            Request::GetMovie { movie_id, ts } => self
                .get_movie(movie_id, &ts)
                .map(|(movie, ts)| Reply::MovieDetail { movie, ts }),
            Request::Get { user_id, ts } => self
                .get(user_id, &ts)
                .map(|(data, ts)| Reply::UserData { data, ts }),
            Request::Update { op, prev } => self.update(op, prev).map(|ts| Reply::Updated { ts }),
            Request::AcceptUpdate { id, op, prev } => {
                self.accept_update(id, op, prev).map(|()| Reply::Accepted)
            }
            Request::CommitUpdate { id } => self.commit_update(&id).map(|ts| Reply::Updated { ts }),
            Request::GetLog => {
                let (replica, log) = self.get_log();
                Ok(Reply::Log { replica, log })
            }
            Request::GetState => {
                let (replica, db) = self.get_state();
                Ok(Reply::State { replica, db: Box::new(db) })
            }
            Request::SetForcedOffline { offline } => {
                self.set_forced_offline(offline);
                Ok(Reply::ForcedOffline)
            }
        }
    }

    /// The inbound half of a gossip round. Under the lock: refresh simulated availability,
    /// replay any newly received entries, or, after enough idle rounds with an empty buffer,
    /// run a full reconstruction to canonicalize the log.
    pub fn absorb_gossip(&self) {
        let mut state = self.state.lock();
        if self.config.simulate_flakiness {
            state.is_online = rand::thread_rng().gen_bool(0.75);
        }
        if state.has_new_gossip {
            state.has_new_gossip = false;
            state.need_reconstruct = true;
            self.run_replay(&mut state);
            state.idle_rounds = 0;
        } else if state.idle_rounds >= self.config.reconstruct_after
            && state.need_reconstruct
            && state.buffer.is_empty()
        {
            self.reconstruct(&mut state);
            state.idle_rounds = 0;
        } else {
            state.idle_rounds += 1;
        }
    }

    /// The outbound half of a gossip round: pick up to `gossip_fanout` random online peers and
    /// send each the entries it has not seen. Peer failures are expected and ignored; gossip
    /// will reach them eventually or the registry will drop them.
    pub fn spread_gossip(&self) {
        if self.status() == Status::Offline {
            return;
        }
        let peers = match self.registry.list(REPLICA_TAG) {
            Ok(peers) => peers,
            Err(err) => {
                log::warn!("replica {}: registry lookup failed: {}", self.id, err);
                return;
            }
        };
        let own_name = self.name();
        let mut candidates: Vec<(String, String)> = peers
            .into_iter()
            .filter(|(name, _)| *name != own_name)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut contacted = 0;
        for (name, endpoint) in candidates {
            if contacted >= self.config.gossip_fanout {
                break;
            }
            match self.transport.call(&endpoint, Request::Status) {
                Ok(Reply::Status(Status::Online)) => {}
                Ok(_) | Err(_) => continue,
            }
            contacted += 1;
            if let Err(err) = self.gossip_with(&endpoint) {
                log::debug!("replica {}: gossip with {} failed: {}", self.id, name, err);
            }
        }
    }

    /// One pairwise exchange: fetch the peer's sync clock, snapshot the entries it is missing,
    /// and send them along with our own sync clock.
    fn gossip_with(&self, endpoint: &str) -> Result<(), crate::rpc::RpcError> {
        let peer_ts = match self.transport.call(endpoint, Request::GetTimestamp)? {
            Reply::Timestamp(ts) => ts,
            other => {
                log::debug!("replica {}: unexpected reply to get_timestamp: {:?}", self.id, other);
                return Ok(());
            }
        };

        // Snapshot the payload under the lock; the outbound call below runs lock-free.
        let payload = {
            let state = self.state.lock();
            if peer_ts == state.sync_ts {
                None
            } else {
                let fresh =
                    |entry: &&Entry| entry.ts.partial_cmp(&peer_ts) != Some(Ordering::Less);
                let mut entries: Vec<Entry> = Vec::new();
                if !peer_ts.greater_than(&state.state_ts) {
                    entries.extend(state.log.iter().filter(fresh).cloned());
                }
                entries.extend(state.buffer.iter().filter(fresh).cloned());
                Some((entries, state.sync_ts.clone()))
            }
        };

        if let Some((entries, ts)) = payload {
            log::debug!(
                "replica {}: sending {} entries to {}",
                self.id,
                entries.len(),
                endpoint
            );
            self.transport.call(endpoint, Request::Sync { entries, ts })?;
        }
        Ok(())
    }

    /// Locks the state, refusing if the replica is offline.
    fn lock_online(&self) -> Result<MutexGuard<'_, State>, Fault> {
        let state = self.state.lock();
        if state.forced_offline || !state.is_online {
            return Err(Fault::Offline);
        }
        Ok(state)
    }

    /// Blocks until the state clock dominates `ts`, waking on every application and giving up
    /// after `read_patience` rounds of `sync_period`. The lock is released while waiting.
    fn wait_for_consistency(&self, ts: &VectorClock) -> Result<MutexGuard<'_, State>, Fault> {
        let mut state = self.lock_online()?;
        let mut rounds = 0;
        while !state.state_ts.geq(ts) {
            if rounds >= self.config.read_patience {
                return Err(Fault::CannotServe);
            }
            self.applied.wait_for(&mut state, self.config.sync_period);
            rounds += 1;
        }
        Ok(state)
    }

    /// Timestamps and buffers one local update, then replays. The entry's clock is the caller's
    /// dependency plus our own freshly incremented counter, so it strictly follows everything
    /// the caller had seen.
    fn apply_local(&self, state: &mut State, op: Op, prev: VectorClock, id: Option<String>) -> VectorClock {
        let id = id.unwrap_or_else(|| generate_id(UPDATE_ID_LEN));
        let new_sync_ts = state.sync_ts.incremented(&self.id);
        let ts = prev.with_counter(&self.id, new_sync_ts.counter(&self.id));
        state.buffer.push(Entry {
            id,
            origin: self.id.clone(),
            op,
            prev,
            ts: ts.clone(),
            time: now_millis(),
        });
        self.run_replay(state);
        state.need_reconstruct = true;
        state.sync_ts = new_sync_ts;
        ts
    }

    /// Replays the buffer and wakes read spins.
    fn run_replay(&self, state: &mut State) {
        let State {
            db,
            log,
            buffer,
            state_ts,
            executed_ids,
            executed_uids,
            ..
        } = state;
        apply_updates(state_ts, db, executed_ids, executed_uids, log, buffer);
        self.applied.notify_all();
    }

    /// Rebuilds the database from the dataset and replays every known entry in the canonical
    /// order. Once all replicas have the same entry set, reconstruction leaves them with
    /// identical logs and databases.
    fn reconstruct(&self, state: &mut State) {
        log::info!(
            "replica {}: reconstructing from {} applied and {} buffered entries",
            self.id,
            state.log.len(),
            state.buffer.len()
        );
        state.state_ts = VectorClock::new();
        state.db = self.dataset.load();
        state.executed_ids.clear();
        state.executed_uids.clear();
        let mut entries = std::mem::take(&mut state.log);
        entries.append(&mut state.buffer);
        state.buffer = entries;
        self.run_replay(state);
        state.need_reconstruct = false;
    }

    /// Test hook: runs a reconstruction immediately, regardless of idle-round accounting.
    #[cfg(test)]
    pub(crate) fn force_reconstruct(&self) {
        let mut state = self.state.lock();
        self.reconstruct(&mut state);
    }
}
