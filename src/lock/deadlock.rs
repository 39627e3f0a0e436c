//! Waits-for graph and deadlock detection policies. Cycle detection
//! returns the actual cycle (not just a boolean) so a victim can be
//! chosen from it under any of the named victim-selection policies.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use super::object::LockerId;

/// Deadlock-detector victim-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectPolicy {
    /// Abort the locker whose request closed the cycle (the one that
    /// called into the detector).
    Default,
    Expire,
    Maxlocks,
    Maxwrite,
    Minlocks,
    Minwrite,
    Oldest,
    Random,
    Youngest,
}

/// Per-locker metadata the victim-selection policies need: lock/write
/// counts and age, kept by `LockManager` and passed in at detection time
/// rather than stored on the graph itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockerStats {
    pub num_locks: u32,
    pub num_writes: u32,
    /// Monotonic sequence number assigned at locker creation; lower is
    /// older.
    pub age: u64,
}

/// Nodes are lockers; an edge `A -> B` means `A` waits for a lock object
/// whose hold queue includes `B`.
pub struct WaitForGraph {
    graph: HashMap<LockerId, HashSet<LockerId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub fn add_edge(&mut self, from: LockerId, to: LockerId) {
        if from == to {
            return;
        }
        self.graph.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    pub fn remove_waiter(&mut self, locker: LockerId) {
        self.graph.remove(&locker);
        for edges in self.graph.values_mut() {
            edges.remove(&locker);
        }
    }

    /// Find a cycle reachable from `start`, if any, returning the
    /// lockers on it in traversal order. Used right after adding an edge
    /// for `start`, so detection is scoped to the locker that just
    /// blocked (eager detection: checked on every conflict).
    pub fn find_cycle_from(&self, start: LockerId) -> Option<Vec<LockerId>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        self.dfs(start, &mut visited, &mut stack)
    }

    fn dfs(
        &self,
        node: LockerId,
        visited: &mut HashSet<LockerId>,
        stack: &mut Vec<LockerId>,
    ) -> Option<Vec<LockerId>> {
        if let Some(pos) = stack.iter().position(|&n| n == node) {
            return Some(stack[pos..].to_vec());
        }
        if visited.contains(&node) {
            return None;
        }
        visited.insert(node);
        stack.push(node);
        if let Some(edges) = self.graph.get(&node) {
            for &next in edges {
                if let Some(cycle) = self.dfs(next, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    /// Scan every node for any cycle (lazy / periodic detection mode).
    pub fn find_any_cycle(&self) -> Option<Vec<LockerId>> {
        for &node in self.graph.keys() {
            if let Some(cycle) = self.find_cycle_from(node) {
                return Some(cycle);
            }
        }
        None
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Choose which locker on `cycle` should be aborted, per the configured
/// `policy`. `requester` is the locker whose new wait closed the cycle
/// (used by `Default`). `stats` supplies the per-locker counters the
/// other policies need.
pub fn select_victim(
    policy: DetectPolicy,
    cycle: &[LockerId],
    requester: LockerId,
    stats: &HashMap<LockerId, LockerStats>,
) -> LockerId {
    let get = |id: &LockerId| stats.get(id).copied().unwrap_or_default();
    match policy {
        DetectPolicy::Default | DetectPolicy::Expire => requester,
        DetectPolicy::Maxlocks => *cycle
            .iter()
            .max_by_key(|id| get(id).num_locks)
            .unwrap_or(&requester),
        DetectPolicy::Minlocks => *cycle
            .iter()
            .min_by_key(|id| get(id).num_locks)
            .unwrap_or(&requester),
        DetectPolicy::Maxwrite => *cycle
            .iter()
            .max_by_key(|id| get(id).num_writes)
            .unwrap_or(&requester),
        DetectPolicy::Minwrite => *cycle
            .iter()
            .min_by_key(|id| get(id).num_writes)
            .unwrap_or(&requester),
        DetectPolicy::Oldest => *cycle
            .iter()
            .min_by_key(|id| get(id).age)
            .unwrap_or(&requester),
        DetectPolicy::Youngest => *cycle
            .iter()
            .max_by_key(|id| get(id).age)
            .unwrap_or(&requester),
        DetectPolicy::Random => {
            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..cycle.len());
            cycle[idx]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_two_cycle() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 1);
        let cycle = g.find_cycle_from(1).expect("cycle expected");
        assert!(cycle.contains(&1));
        assert!(cycle.contains(&2));
    }

    #[test]
    fn no_cycle_in_dag() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        assert!(g.find_cycle_from(1).is_none());
    }

    #[test]
    fn remove_waiter_breaks_cycle() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 1);
        g.remove_waiter(2);
        assert!(g.find_cycle_from(1).is_none());
    }

    #[test]
    fn default_policy_picks_requester() {
        let cycle = vec![1, 2];
        let stats = HashMap::new();
        assert_eq!(select_victim(DetectPolicy::Default, &cycle, 2, &stats), 2);
    }

    #[test]
    fn oldest_policy_picks_lowest_age() {
        let cycle = vec![1, 2];
        let mut stats = HashMap::new();
        stats.insert(1, LockerStats { age: 5, ..Default::default() });
        stats.insert(2, LockerStats { age: 1, ..Default::default() });
        assert_eq!(select_victim(DetectPolicy::Oldest, &cycle, 1, &stats), 2);
    }
}
