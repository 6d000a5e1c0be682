//! The central suite queue.
//!
//! Ordering policy: longest recorded duration first, so slow suites start
//! early and the tail of the run stays short. Suites with no recorded
//! duration go to the front of the queue; running a fast unknown early beats
//! stalling the tail on a slow unknown. An active whitelist overrides both
//! rules and pins the order to the whitelist's own.

use std::collections::{HashSet, VecDeque};

use crate::protocol::SuiteId;

/// Ordered set of suites still to be dispatched.
///
/// The queue also tracks every suite it has ever contained, which is what
/// makes dispatch at-most-once: re-offering a suite that was queued (or
/// already dispatched) is a no-op.
pub struct SuiteQueue {
    entries: VecDeque<SuiteId>,
    ever_queued: HashSet<SuiteId>,
    whitelist: Vec<String>,
    awaited: Vec<String>,
}

impl SuiteQueue {
    /// Build the initial queue from suites with recorded durations.
    ///
    /// `known` holds the suites present in both the stats history and the
    /// framework's current file enumeration. With an empty whitelist they are
    /// ordered descending by duration; otherwise the whitelist filters and
    /// orders them, and every whitelisted name not yet present becomes
    /// awaited.
    pub fn build(known: Vec<(SuiteId, f64)>, whitelist: &[String]) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            ever_queued: HashSet::new(),
            whitelist: whitelist.to_vec(),
            awaited: Vec::new(),
        };

        let mut known = known;
        if queue.whitelist.is_empty() {
            known.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (suite, _) in known {
                queue.ever_queued.insert(suite.clone());
                queue.entries.push_back(suite);
            }
        } else {
            known.retain(|(suite, _)| queue.whitelist.iter().any(|n| n == &suite.name));
            for (suite, _) in known {
                queue.ever_queued.insert(suite.clone());
                queue.entries.push_back(suite);
            }
            queue.enforce_whitelist_order();
            queue.awaited = queue
                .whitelist
                .iter()
                .filter(|name| !queue.entries.iter().any(|s| s.name == **name))
                .cloned()
                .collect();
        }
        queue
    }

    /// Take the next suite for dispatch.
    pub fn pop(&mut self) -> Option<SuiteId> {
        self.entries.pop_front()
    }

    /// Offer a freshly discovered suite. Returns whether it was accepted.
    ///
    /// Duplicates of anything ever queued are dropped, as are suites outside
    /// an active whitelist. Accepted suites go to the front (unknown
    /// duration); once the last awaited name arrives, the whole queue is
    /// re-pinned to whitelist order.
    pub fn offer(&mut self, suite: SuiteId) -> bool {
        if self.ever_queued.contains(&suite) {
            return false;
        }
        if !self.whitelist.is_empty() && !self.whitelist.iter().any(|n| n == &suite.name) {
            return false;
        }

        self.ever_queued.insert(suite.clone());
        let was_awaiting = !self.awaited.is_empty();
        self.awaited.retain(|name| name != &suite.name);
        self.entries.push_front(suite);

        if was_awaiting && self.awaited.is_empty() {
            self.enforce_whitelist_order();
        }
        true
    }

    /// Whitelisted names not yet seen in the queue.
    pub fn awaited(&self) -> &[String] {
        &self.awaited
    }

    pub fn has_whitelist(&self) -> bool {
        !self.whitelist.is_empty()
    }

    /// True once a non-empty whitelist has every name queued.
    pub fn whitelist_satisfied(&self) -> bool {
        self.has_whitelist() && self.awaited.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_whitelist_order(&mut self) {
        let whitelist = &self.whitelist;
        let index_of = |suite: &SuiteId| {
            whitelist
                .iter()
                .position(|n| n == &suite.name)
                .unwrap_or(usize::MAX)
        };
        let mut entries: Vec<SuiteId> = self.entries.drain(..).collect();
        entries.sort_by_key(index_of);
        self.entries = entries.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(name: &str) -> SuiteId {
        SuiteId::new(name, format!("test/{}.rs", name.to_lowercase()))
    }

    #[test]
    fn test_initial_order_descending_by_duration() {
        let known = vec![(suite("B"), 3.0), (suite("A"), 5.0), (suite("C"), 1.0)];
        let mut queue = SuiteQueue::build(known, &[]);

        assert_eq!(queue.pop().unwrap().name, "A");
        assert_eq!(queue.pop().unwrap().name, "B");
        assert_eq!(queue.pop().unwrap().name, "C");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_discovered_suites_jump_the_queue() {
        let known = vec![(suite("A"), 5.0), (suite("B"), 3.0)];
        let mut queue = SuiteQueue::build(known, &[]);

        assert!(queue.offer(suite("X")));
        assert_eq!(queue.pop().unwrap().name, "X");
        assert_eq!(queue.pop().unwrap().name, "A");
    }

    #[test]
    fn test_offer_is_at_most_once() {
        let mut queue = SuiteQueue::build(vec![(suite("A"), 5.0)], &[]);

        assert!(!queue.offer(suite("A")));
        assert_eq!(queue.len(), 1);

        // Dispatched suites stay dispatched.
        queue.pop();
        assert!(!queue.offer(suite("A")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_whitelist_orders_and_filters() {
        let known = vec![(suite("A"), 5.0), (suite("B"), 3.0), (suite("C"), 1.0)];
        let whitelist = vec!["C".to_string(), "A".to_string(), "B".to_string()];
        let mut queue = SuiteQueue::build(known, &whitelist);

        assert!(queue.awaited().is_empty());
        assert_eq!(queue.pop().unwrap().name, "C");
        assert_eq!(queue.pop().unwrap().name, "A");
        assert_eq!(queue.pop().unwrap().name, "B");
    }

    #[test]
    fn test_whitelist_awaits_unknown_names() {
        let known = vec![(suite("A"), 5.0)];
        let whitelist = vec!["Z".to_string(), "A".to_string()];
        let mut queue = SuiteQueue::build(known, &whitelist);

        assert_eq!(queue.awaited(), ["Z".to_string()]);
        assert!(!queue.whitelist_satisfied());

        // Names outside the whitelist are dropped entirely.
        assert!(!queue.offer(suite("B")));

        assert!(queue.offer(suite("Z")));
        assert!(queue.whitelist_satisfied());

        // Order re-pinned to the whitelist once it is satisfied.
        assert_eq!(queue.pop().unwrap().name, "Z");
        assert_eq!(queue.pop().unwrap().name, "A");
    }
}
