//! Enumeration of the argument combinations of a call.
//!
//! Combinations are the cartesian product of the port sequences, in declared
//! port order with the last port varying fastest, restricted to the tuples
//! whose elements agree on every shared provenance key. Agreement on a key is
//! what makes two references to the same node vary together.

use crate::types::{HashMap, Item, NodeId, Origins};

/// One admissible argument tuple.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Combination {
    /// Element index picked in each port, in port order.
    pub(crate) picks: Vec<usize>,
    /// Provenance of the tuple, under the original keys.
    pub(crate) origins: Origins,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    /// Provenance under the original keys, passed downstream.
    origins: Origins,
    /// Provenance with joined anchors folded onto their representative, used
    /// for the agreement check only.
    keys: HashMap<NodeId, usize>,
}

impl Frame {
    fn merge(&self, origins: &Origins, aliases: &HashMap<NodeId, NodeId>) -> Option<Self> {
        let mut next = self.clone();
        for (&node, &element) in origins {
            let key = aliases.get(&node).copied().unwrap_or(node);
            match next.keys.get(&key) {
                Some(&seen) if seen != element => return None,
                Some(_) => {}
                None => {
                    next.keys.insert(key, element);
                }
            }
            next.origins.insert(node, element);
        }
        Some(next)
    }
}

/// Walks the admissible combinations of a set of port sequences.
#[derive(Debug)]
pub(crate) struct Combinations<'a> {
    ports: &'a [&'a [Item]],
    aliases: &'a HashMap<NodeId, NodeId>,
}

impl<'a> Combinations<'a> {
    /// `aliases` maps explicitly joined anchors to the key they are compared
    /// under.
    pub(crate) fn new(ports: &'a [&'a [Item]], aliases: &'a HashMap<NodeId, NodeId>) -> Self {
        Self { ports, aliases }
    }

    /// All admissible combinations in enumeration order.
    ///
    /// Without ports there is exactly one (empty) combination; a port with an
    /// empty sequence leaves none.
    pub(crate) fn enumerate(&self) -> Vec<Combination> {
        let mut combinations = vec![];
        let mut picks = Vec::with_capacity(self.ports.len());
        self.walk(&Frame::default(), &mut picks, &mut combinations);
        combinations
    }

    fn walk(&self, frame: &Frame, picks: &mut Vec<usize>, out: &mut Vec<Combination>) {
        let Some(items) = self.ports.get(picks.len()) else {
            out.push(Combination {
                picks: picks.clone(),
                origins: frame.origins.clone(),
            });
            return;
        };
        for (idx, item) in items.iter().enumerate() {
            let Some(next) = frame.merge(&item.origins, self.aliases) else {
                continue;
            };
            picks.push(idx);
            self.walk(&next, picks, out);
            picks.pop();
        }
    }
}
