//! Deterministic replay of buffered entries against a database.
//!
//! This is the single routine both the incremental gossip path and full reconstruction go
//! through: given the current state clock and a buffer of tentative entries, apply every entry
//! whose causal dependency is satisfied, in the canonical order, until a fixed point is reached.
//! Entries that remain blocked stay in the buffer for a later round of gossip to unblock.

use crate::clock::VectorClock;
use crate::oplog::{sort_entries, Entry};
use crate::store::Db;
use ahash::AHashSet;

/// Applies as much of `buffer` as causal dependencies allow.
///
/// The buffer is first sorted into the canonical replay order, then swept repeatedly:
///
/// - An entry whose id was already executed is deduplicated: its timestamp still merges into
///   `state_ts` (so the clock never regresses), and if this `(id, origin)` pairing is new the
///   entry is recorded in the log, but its operation is not applied a second time. This covers
///   the case where two replicas independently timestamped the same logical update.
/// - An entry whose `prev` is dominated by `state_ts` is applied: operation against the db,
///   timestamp merged, id/uid recorded, entry appended to the log.
/// - Anything else is kept for the next sweep; a sweep that applies nothing ends the loop.
///
/// On return `buffer` holds exactly the entries that could not be applied yet.
pub fn apply_updates(
    state_ts: &mut VectorClock,
    db: &mut Db,
    executed_ids: &mut AHashSet<String>,
    executed_uids: &mut AHashSet<(String, String)>,
    log: &mut Vec<Entry>,
    buffer: &mut Vec<Entry>,
) {
    sort_entries(buffer);
    loop {
        let mut progressed = false;
        let mut blocked = Vec::with_capacity(buffer.len());
        for entry in buffer.drain(..) {
            if executed_ids.contains(&entry.id) {
                *state_ts = VectorClock::merge_max(state_ts, &entry.ts);
                let uid = (entry.id.clone(), entry.origin.clone());
                if !executed_uids.contains(&uid) {
                    executed_uids.insert(uid);
                    log.push(entry);
                }
                continue;
            }
            if state_ts.geq(&entry.prev) {
                entry.op.apply(db);
                *state_ts = VectorClock::merge_max(state_ts, &entry.ts);
                executed_ids.insert(entry.id.clone());
                executed_uids.insert((entry.id.clone(), entry.origin.clone()));
                log.push(entry);
                progressed = true;
            } else {
                blocked.push(entry);
            }
        }
        *buffer = blocked;
        if !progressed {
            return;
        }
    }
}
