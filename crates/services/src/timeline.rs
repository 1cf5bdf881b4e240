//! # Timeline
//!
//! Ordered index of `id -> time`. Used for intra-thread post order, for the
//! board-wide bump order and for the feed's consensus-time order.
//!
//! Entries with equal times keep insertion order. Setting the time of an id
//! that is already present replaces the old entry and counts as a new
//! insertion.

use std::collections::{BTreeMap, HashMap};

use domains::Timestamp;

/// Sort key: time first, then insertion sequence.
type Slot = (Timestamp, u64);

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    ordered: BTreeMap<Slot, String>,
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&mut self, id: &str, time: Timestamp) {
        if let Some(old) = self.slots.remove(id) {
            self.ordered.remove(&old);
        }
        let slot = (time, self.next_seq);
        self.next_seq += 1;
        self.ordered.insert(slot, id.to_string());
        self.slots.insert(id.to_string(), slot);
    }

    /// Removes `id`, returning the time it had.
    pub fn unset_time(&mut self, id: &str) -> Option<Timestamp> {
        let slot = self.slots.remove(id)?;
        self.ordered.remove(&slot);
        Some(slot.0)
    }

    pub fn get_time(&self, id: &str) -> Option<Timestamp> {
        self.slots.get(id).map(|slot| slot.0)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get_most_recent(&self) -> Option<(Timestamp, &str)> {
        self.ordered
            .last_key_value()
            .map(|(slot, id)| (slot.0, id.as_str()))
    }

    pub fn get_least_recent(&self) -> Option<(Timestamp, &str)> {
        self.ordered
            .first_key_value()
            .map(|(slot, id)| (slot.0, id.as_str()))
    }

    /// All entries, oldest first.
    pub fn get_events(&self) -> impl DoubleEndedIterator<Item = (Timestamp, &str)> + '_ {
        self.ordered.iter().map(|(slot, id)| (slot.0, id.as_str()))
    }

    /// All entries, newest first.
    pub fn entries_reversed(&self) -> impl Iterator<Item = (Timestamp, &str)> + '_ {
        self.get_events().rev()
    }

    pub fn get_size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_queries_return_none() {
        let timeline = Timeline::new();
        assert!(timeline.get_most_recent().is_none());
        assert!(timeline.get_least_recent().is_none());
        assert!(timeline.get_time("x").is_none());
        assert_eq!(timeline.get_events().count(), 0);
        assert_eq!(timeline.get_size(), 0);
    }

    #[test]
    fn test_orders_by_time() {
        let mut timeline = Timeline::new();
        timeline.set_time("b", 20);
        timeline.set_time("a", 10);
        timeline.set_time("c", 30);
        let ids: Vec<_> = timeline.get_events().map(|(_, id)| id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        let rev: Vec<_> = timeline.entries_reversed().map(|(_, id)| id).collect();
        assert_eq!(rev, ["c", "b", "a"]);
        assert_eq!(timeline.get_most_recent(), Some((30, "c")));
        assert_eq!(timeline.get_least_recent(), Some((10, "a")));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut timeline = Timeline::new();
        timeline.set_time("first", 5);
        timeline.set_time("second", 5);
        timeline.set_time("third", 5);
        let ids: Vec<_> = timeline.get_events().map(|(_, id)| id).collect();
        assert_eq!(ids, ["first", "second", "third"]);
        assert_eq!(timeline.get_most_recent(), Some((5, "third")));
    }

    #[test]
    fn test_set_replaces_instead_of_duplicating() {
        let mut timeline = Timeline::new();
        timeline.set_time("a", 1);
        timeline.set_time("a", 50);
        assert_eq!(timeline.get_size(), 1);
        assert_eq!(timeline.get_time("a"), Some(50));
        assert_eq!(timeline.get_events().count(), 1);
    }

    #[test]
    fn test_unset_missing_is_noop() {
        let mut timeline = Timeline::new();
        timeline.set_time("test", 100);
        timeline.set_time("test2", 100);
        assert_eq!(timeline.unset_time("test1"), None);
        assert_eq!(timeline.unset_time("test"), Some(100));
        assert_eq!(timeline.get_size(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, u16),
        Unset(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, any::<u16>()).prop_map(|(id, t)| Op::Set(id, t)),
            (0u8..16).prop_map(Op::Unset),
        ]
    }

    proptest! {
        #[test]
        fn prop_most_recent_is_maximum(ops in prop::collection::vec(op(), 0..64)) {
            let mut timeline = Timeline::new();
            let mut model: HashMap<String, Timestamp> = HashMap::new();
            for op in ops {
                match op {
                    Op::Set(id, t) => {
                        timeline.set_time(&id.to_string(), u64::from(t));
                        model.insert(id.to_string(), u64::from(t));
                    }
                    Op::Unset(id) => {
                        timeline.unset_time(&id.to_string());
                        model.remove(&id.to_string());
                    }
                }
                prop_assert_eq!(timeline.get_size(), model.len());
                let max = model.values().max().copied();
                prop_assert_eq!(timeline.get_most_recent().map(|(t, _)| t), max);
                let min = model.values().min().copied();
                prop_assert_eq!(timeline.get_least_recent().map(|(t, _)| t), min);
            }
        }
    }
}
