//! Fault and upgrade domain trees.
//!
//! One tree per domain kind, built from node path segments. Each node
//! belongs to exactly one leaf. Per service the tree records how many
//! eligible nodes sit under every domain; domains with none (empty,
//! fully deactivated, or entirely block-listed) are left out of the
//! balance math.
//!
//! ```text
//!              root
//!            /      \
//!         dc0        dc1          first level with >= 2 eligible children
//!        /   \      /   \         decides N+1 vs quorum semantics
//!      r0    r1   r0    r1
//! ```
//!
//! **N+1**: with `n` replicas over `D` eligible children, every child
//! must hold `n / D` or `n / D + 1` replicas. Checked recursively and
//! independently per branch.
//!
//! **Quorum**: no child may hold more than `R / 2` replicas (one more
//! when `D * (R / 2) < R`). Used when configured for the domain kind,
//! or automatically when `R > D + 1`.

use std::collections::BTreeMap;

use crate::model::{NodeIndex, ServiceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Fault,
    Upgrade,
}

#[derive(Debug, Clone)]
struct DomainEntry {
    segment: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct DomainTree {
    kind: DomainKind,
    entries: Vec<DomainEntry>,
    /// Leaf entry of every node.
    node_leaf: Vec<usize>,
    /// Per service, per entry: eligible nodes in the subtree.
    eligible: Vec<Vec<u32>>,
    quorum_based: bool,
    auto_switch: bool,
}

impl DomainTree {
    /// Build a tree from the segment path of every node, in node order.
    pub fn new(kind: DomainKind, node_paths: &[Vec<String>], quorum_based: bool, auto_switch: bool) -> Self {
        let mut entries = vec![DomainEntry {
            segment: String::new(),
            parent: None,
            children: Vec::new(),
        }];
        let mut lookup: BTreeMap<(usize, String), usize> = BTreeMap::new();
        let mut node_leaf = Vec::with_capacity(node_paths.len());

        for path in node_paths {
            let mut current = 0;
            for segment in path {
                let key = (current, segment.clone());
                current = match lookup.get(&key) {
                    Some(&index) => index,
                    None => {
                        let index = entries.len();
                        entries.push(DomainEntry {
                            segment: segment.clone(),
                            parent: Some(current),
                            children: Vec::new(),
                        });
                        entries[current].children.push(index);
                        lookup.insert(key, index);
                        index
                    }
                };
            }
            node_leaf.push(current);
        }

        Self {
            kind,
            entries,
            node_leaf,
            eligible: Vec::new(),
            quorum_based,
            auto_switch,
        }
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    /// Register the next service's eligible nodes. Services must be added
    /// in arena order.
    pub fn add_service(&mut self, eligible_nodes: &[bool]) -> ServiceIndex {
        let mut counts = vec![0u32; self.entries.len()];
        for (node, &eligible) in eligible_nodes.iter().enumerate() {
            if !eligible {
                continue;
            }
            let mut cursor = Some(self.node_leaf[node]);
            while let Some(entry) = cursor {
                counts[entry] += 1;
                cursor = self.entries[entry].parent;
            }
        }
        self.eligible.push(counts);
        ServiceIndex(self.eligible.len() - 1)
    }

    /// Full path of the domain a node belongs to, e.g. `/dc0/r1`.
    pub fn node_path(&self, node: NodeIndex) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(self.node_leaf[node.0]);
        while let Some(entry) = cursor {
            if entry != 0 {
                segments.push(self.entries[entry].segment.as_str());
            }
            cursor = self.entries[entry].parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    fn eligible_children(&self, service: ServiceIndex, entry: usize) -> Vec<usize> {
        let counts = &self.eligible[service.0];
        self.entries[entry]
            .children
            .iter()
            .copied()
            .filter(|&child| counts[child] > 0)
            .collect()
    }

    /// Number of eligible children at the first level that branches.
    pub fn branching(&self, service: ServiceIndex) -> usize {
        let mut entry = 0;
        loop {
            let children = self.eligible_children(service, entry);
            match children.len() {
                0 => return 0,
                1 => entry = children[0],
                d => return d,
            }
        }
    }

    /// Whether quorum semantics apply to a partition with target `target`.
    pub fn is_quorum_mode(&self, service: ServiceIndex, target: u32) -> bool {
        let d = self.branching(service);
        d >= 2 && self.quorum_applies(target, d)
    }

    fn quorum_applies(&self, target: u32, branching: usize) -> bool {
        self.quorum_based || (self.auto_switch && target as usize > branching + 1)
    }

    /// Domain violation score for a partition whose replicas sit on `nodes`.
    pub fn violation(&self, service: ServiceIndex, target: u32, nodes: &[NodeIndex]) -> u64 {
        let counts = self.count(service, nodes);
        if counts.is_empty() {
            return 0;
        }
        self.level_violation(service, 0, target, &counts, false)
    }

    fn count(&self, service: ServiceIndex, nodes: &[NodeIndex]) -> BTreeMap<usize, u32> {
        let eligible = &self.eligible[service.0];
        let mut counts = BTreeMap::new();
        for node in nodes {
            let leaf = self.node_leaf[node.0];
            if eligible[leaf] == 0 {
                continue;
            }
            let mut cursor = Some(leaf);
            while let Some(entry) = cursor {
                *counts.entry(entry).or_insert(0) += 1;
                cursor = self.entries[entry].parent;
            }
        }
        counts
    }

    fn level_violation(
        &self,
        service: ServiceIndex,
        entry: usize,
        target: u32,
        counts: &BTreeMap<usize, u32>,
        mode_decided: bool,
    ) -> u64 {
        let children = self.eligible_children(service, entry);
        match children.len() {
            0 => return 0,
            1 => return self.level_violation(service, children[0], target, counts, mode_decided),
            _ => {}
        }

        let child_counts: Vec<u32> = children
            .iter()
            .map(|c| counts.get(c).copied().unwrap_or(0))
            .collect();
        let n: u32 = child_counts.iter().sum();
        if n == 0 {
            return 0;
        }
        let d = children.len() as u32;

        if !mode_decided && self.quorum_applies(target, children.len()) {
            let r = target.max(n);
            let mut limit = r / 2;
            if d * limit < r {
                limit += 1;
            }
            return child_counts
                .iter()
                .map(|&c| u64::from(c.saturating_sub(limit)))
                .sum();
        }

        let base = n / d;
        let mut score: u64 = child_counts
            .iter()
            .map(|&c| u64::from(c.saturating_sub(base + 1)) + u64::from(base.saturating_sub(c)))
            .sum();
        for (child, &c) in children.iter().zip(child_counts.iter()) {
            if c > 1 {
                score += self.level_violation(service, *child, target, counts, true);
            }
        }
        score
    }
}
