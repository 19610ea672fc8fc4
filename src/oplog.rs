//! The replicated operation vocabulary and the log entry record that carries an operation
//! together with its causal metadata.
//!
//! Operations form a closed sum type: each variant knows how to apply itself to a [`Db`], and the
//! wire representation is the single-letter tag the protocol has always used ("U", "D", "M", "A",
//! "R") carried as the serde enum tag. Entries are immutable once created; replicas exchange them
//! verbatim during gossip.

use crate::clock::VectorClock;
use crate::store::{Db, Movie, MovieId, UserId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the opaque update ids minted for entries and two-phase commits.
pub const UPDATE_ID_LEN: usize = 10;

/// One replicated update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Set a user's rating for a movie.
    #[serde(rename = "U")]
    UpdateRating {
        user_id: UserId,
        movie_id: MovieId,
        value: f64,
    },
    /// Remove a user's rating for a movie.
    #[serde(rename = "D")]
    DeleteRating { user_id: UserId, movie_id: MovieId },
    /// Insert or replace a movie record.
    #[serde(rename = "M")]
    UpdateMovie { movie_id: MovieId, movie: Movie },
    /// Add tags to a user's tag set for a movie.
    #[serde(rename = "A")]
    AddTag {
        user_id: UserId,
        movie_id: MovieId,
        tags: BTreeSet<String>,
    },
    /// Remove tags from a user's tag set for a movie.
    #[serde(rename = "R")]
    RemoveTag {
        user_id: UserId,
        movie_id: MovieId,
        tags: BTreeSet<String>,
    },
}

impl Op {
    /// Applies this operation to a database.
    pub fn apply(&self, db: &mut Db) {
        match self {
            Op::UpdateRating { user_id, movie_id, value } => {
                db.update_rating(*user_id, *movie_id, *value);
            }
            Op::DeleteRating { user_id, movie_id } => {
                db.delete_rating(*user_id, *movie_id);
            }
            Op::UpdateMovie { movie_id, movie } => {
                db.update_movie(*movie_id, movie.clone());
            }
            Op::AddTag { user_id, movie_id, tags } => {
                db.add_tags(*user_id, *movie_id, tags.iter().map(String::as_str));
            }
            Op::RemoveTag { user_id, movie_id, tags } => {
                db.remove_tags(*user_id, *movie_id, tags.iter().map(String::as_str));
            }
        }
    }
}

/// An immutable record of one update in the replicated log.
///
/// `prev` is the causal dependency: the vector clock the submitting session had observed. A
/// replica only applies the entry once its state clock dominates `prev`. `ts` is the entry's own
/// timestamp, and `time` is wall-clock milliseconds used purely as a tie-breaker in the
/// deterministic replay order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub origin: String,
    pub op: Op,
    pub prev: VectorClock,
    pub ts: VectorClock,
    pub time: u64,
}

impl Entry {
    /// The canonical replay order: causal order first (clock domination, realized through the
    /// scalar [`VectorClock::sort_key`]), then wall-clock time, then update id. Origin breaks the
    /// final tie, because a majority-committed update exists once per acceptor under one id.
    /// This is a strict total order, so replicas holding the same entries replay them
    /// identically.
    pub fn replay_cmp(&self, other: &Entry) -> Ordering {
        (self.ts.sort_key(), self.time, &self.id, &self.origin).cmp(&(
            other.ts.sort_key(),
            other.time,
            &other.id,
            &other.origin,
        ))
    }
}

/// Sorts entries into the canonical replay order.
pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(Entry::replay_cmp);
}

/// Mints an opaque lowercase-hex id of the given length.
pub fn generate_id(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(id: &str, ts: VectorClock, time: u64) -> Entry {
        Entry {
            id: id.to_string(),
            origin: "r1".to_string(),
            op: Op::DeleteRating { user_id: 1, movie_id: 1 },
            prev: VectorClock::new(),
            ts,
            time,
        }
    }

    #[test]
    fn op_wire_tags_are_single_letters() {
        let op = Op::UpdateRating { user_id: 7, movie_id: 42, value: 4.5 };
        let encoded = serde_json::to_string(&op).unwrap();
        assert_eq!(encoded, r#"{"U":{"user_id":7,"movie_id":42,"value":4.5}}"#);

        for (op, tag) in [
            (Op::DeleteRating { user_id: 1, movie_id: 2 }, "\"D\""),
            (
                Op::UpdateMovie { movie_id: 2, movie: Movie::default() },
                "\"M\"",
            ),
            (
                Op::AddTag { user_id: 1, movie_id: 2, tags: BTreeSet::new() },
                "\"A\"",
            ),
            (
                Op::RemoveTag { user_id: 1, movie_id: 2, tags: BTreeSet::new() },
                "\"R\"",
            ),
        ] {
            let encoded = serde_json::to_string(&op).unwrap();
            assert!(encoded.starts_with(&format!("{{{tag}")), "{encoded}");
        }
    }

    #[test]
    fn op_round_trips() {
        let op = Op::AddTag {
            user_id: 7,
            movie_id: 42,
            tags: BTreeSet::from(["desert".to_string(), "spice".to_string()]),
        };
        let decoded: Op = serde_json::from_str(&serde_json::to_string(&op).unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn entry_round_trips() {
        let entry = Entry {
            id: generate_id(UPDATE_ID_LEN),
            origin: "r1".to_string(),
            op: Op::UpdateRating { user_id: 7, movie_id: 42, value: 4.5 },
            prev: VectorClock::new(),
            ts: VectorClock::from([("r1", 1)]),
            time: now_millis(),
        };
        let decoded: Entry = serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn generated_ids_are_opaque_hex() {
        let id = generate_id(UPDATE_ID_LEN);
        assert_eq!(id.len(), UPDATE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id(UPDATE_ID_LEN));
    }

    #[test]
    fn replay_order_follows_causality() {
        let earlier = entry("b", VectorClock::from([("r1", 1)]), 50);
        let later = entry("a", VectorClock::from([("r1", 1), ("r2", 1)]), 10);
        // The causally later entry sorts later even though its wall clock and id are smaller.
        assert_eq!(earlier.replay_cmp(&later), Ordering::Less);
    }

    #[test]
    fn identical_timestamps_order_by_time_then_id() {
        let ts = VectorClock::from([("r1", 1)]);
        let a = entry("a", ts.clone(), 20);
        let b = entry("b", ts.clone(), 10);
        let c = entry("c", ts, 10);
        let mut entries = vec![a.clone(), b.clone(), c.clone()];
        sort_entries(&mut entries);
        assert_eq!(entries, vec![b, c, a]);
    }
}
