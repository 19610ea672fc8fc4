//! A [vector clock](https://en.wikipedia.org/wiki/Vector_clock) keyed by node id, which provides
//! a partial causal order on updates in the replica group.
//!
//! Replica membership is open (nodes come and go through the registry), so unlike a fixed-width
//! vector the clock is a mapping from node id to counter, and absent keys read as zero. All
//! operations are value-oriented: they return a new clock rather than mutating in place.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A mapping from node id to monotonic counter. Counters of zero are never stored, so `len` and
/// the counter sum are well-defined for [`VectorClock::sort_key`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// Instantiates an empty vector clock.
    pub fn new() -> Self {
        VectorClock(BTreeMap::new())
    }

    /// The counter for `id`, reading absent keys as zero.
    pub fn counter(&self, id: &str) -> u64 {
        self.0.get(id).copied().unwrap_or(0)
    }

    /// Creates a new vector clock that merges two other vector clocks by picking the maximum
    /// counter for each node id.
    pub fn merge_max(c1: &VectorClock, c2: &VectorClock) -> Self {
        let mut result = c1.0.clone();
        for (id, &counter) in &c2.0 {
            let slot = result.entry(id.clone()).or_insert(0);
            if counter > *slot {
                *slot = counter;
            }
        }
        VectorClock(result)
    }

    /// Creates a new vector clock with the counter for `id` incremented.
    pub fn incremented(&self, id: &str) -> Self {
        self.with_counter(id, self.counter(id) + 1)
    }

    /// Creates a new vector clock with the counter for `id` replaced by `counter`. A zero counter
    /// removes the key, preserving the no-stored-zeros invariant.
    pub fn with_counter(&self, id: &str, counter: u64) -> Self {
        let mut result = self.0.clone();
        if counter == 0 {
            result.remove(id);
        } else {
            result.insert(id.to_string(), counter);
        }
        VectorClock(result)
    }

    /// True iff `self` dominates or equals `other`: every counter in `other` is matched or
    /// exceeded here. This is the read-visibility check.
    pub fn geq(&self, other: &VectorClock) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }

    /// True iff `self` strictly dominates `other`.
    pub fn greater_than(&self, other: &VectorClock) -> bool {
        self.partial_cmp(other) == Some(Ordering::Greater)
    }

    /// True iff neither clock dominates the other.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.partial_cmp(other).is_none()
    }

    /// A scalar key `(entry count, counter sum)` that extends the causal partial order to a
    /// strict total order: a clock that strictly dominates another has strictly more total
    /// counts, and at least as many entries, so ordering by this key never inverts causality.
    /// Ties (including all concurrent pairs with equal totals) are broken further up the stack
    /// by wall-clock time and update id.
    pub fn sort_key(&self) -> (usize, u64) {
        (self.0.len(), self.0.values().sum())
    }

    /// Iterates over the `(node id, counter)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(id, &counter)| (id.as_str(), counter))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, rhs: &Self) -> Option<Ordering> {
        // Walk the union of keys once, tracking whether any counter is less and whether any is
        // greater. Once both have been observed the clocks are concurrent and the walk can stop.
        let mut lt = false;
        let mut gt = false;
        for id in self.0.keys().chain(rhs.0.keys()) {
            let lhs_counter = self.counter(id);
            let rhs_counter = rhs.counter(id);
            lt |= lhs_counter < rhs_counter;
            gt |= lhs_counter > rhs_counter;
            if lt && gt {
                return None;
            }
        }
        match (lt, gt) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => unreachable!("early exit above"),
        }
    }
}

impl Display for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "<")?;
        for (i, (id, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", id, counter)?;
        }
        write!(f, ">")
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        VectorClock(
            entries
                .iter()
                .filter(|(_, counter)| *counter > 0)
                .map(|(id, counter)| (id.to_string(), *counter))
                .collect(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn can_display() {
        assert_eq!(format!("{}", VectorClock::new()), "<>");
        assert_eq!(
            format!("{}", VectorClock::from([("a", 1), ("b", 2)])),
            "<a:1, b:2>"
        );
    }

    #[test]
    fn absent_keys_read_as_zero() {
        let clock = VectorClock::from([("a", 3)]);
        assert_eq!(clock.counter("a"), 3);
        assert_eq!(clock.counter("b"), 0);
    }

    #[test]
    fn can_increment() {
        let clock = VectorClock::new().incremented("a").incremented("a").incremented("b");
        assert_eq!(clock, VectorClock::from([("a", 2), ("b", 1)]));
    }

    #[test]
    fn zero_counters_are_not_stored() {
        let clock = VectorClock::from([("a", 1)]).with_counter("a", 0);
        assert_eq!(clock, VectorClock::new());
        assert_eq!(clock.sort_key(), (0, 0));
    }

    #[test]
    fn can_merge() {
        assert_eq!(
            VectorClock::merge_max(
                &VectorClock::from([("a", 1), ("b", 6)]),
                &VectorClock::from([("a", 5), ("c", 2)])
            ),
            VectorClock::from([("a", 5), ("b", 6), ("c", 2)])
        );
    }

    #[test]
    fn can_order_partially() {
        use Ordering::*;

        let empty = VectorClock::new();
        assert_eq!(empty.partial_cmp(&empty), Some(Equal));
        assert_eq!(
            VectorClock::from([("a", 1)]).partial_cmp(&VectorClock::from([("a", 1)])),
            Some(Equal)
        );

        assert_eq!(empty.partial_cmp(&VectorClock::from([("a", 1)])), Some(Less));
        assert_eq!(
            VectorClock::from([("a", 1)]).partial_cmp(&VectorClock::from([("a", 2), ("b", 1)])),
            Some(Less)
        );

        assert_eq!(VectorClock::from([("a", 1)]).partial_cmp(&empty), Some(Greater));
        assert_eq!(
            VectorClock::from([("a", 2), ("b", 1)]).partial_cmp(&VectorClock::from([("b", 1)])),
            Some(Greater)
        );

        // One counter ahead and another behind means the clocks are concurrent.
        assert_eq!(
            VectorClock::from([("a", 1)]).partial_cmp(&VectorClock::from([("b", 1)])),
            None
        );
        assert_eq!(
            VectorClock::from([("a", 2), ("b", 1)]).partial_cmp(&VectorClock::from([("a", 1), ("b", 2)])),
            None
        );
    }

    #[test]
    fn empty_clock_dominates_only_itself() {
        let empty = VectorClock::new();
        assert!(empty.geq(&empty));
        assert!(!empty.greater_than(&empty));
        assert!(!empty.geq(&VectorClock::from([("a", 1)])));
        assert!(VectorClock::from([("a", 1)]).geq(&empty));
    }

    #[test]
    fn concurrency_is_symmetric() {
        let a = VectorClock::from([("a", 1)]);
        let b = VectorClock::from([("b", 1)]);
        assert!(a.is_concurrent(&b));
        assert!(b.is_concurrent(&a));
        assert!(!a.is_concurrent(&a));
    }

    #[test]
    fn sort_key_extends_domination() {
        let lesser = VectorClock::from([("a", 1), ("b", 2)]);
        let greater = VectorClock::from([("a", 2), ("b", 2)]);
        assert!(greater.greater_than(&lesser));
        assert!(greater.sort_key() > lesser.sort_key());
    }

    #[test]
    fn can_round_trip_wire_format() {
        let clock = VectorClock::from([("r1", 4), ("r2", 1)]);
        let encoded = serde_json::to_string(&clock).unwrap();
        assert_eq!(encoded, r#"{"r1":4,"r2":1}"#);
        let decoded: VectorClock = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, clock);
    }
}
