//! Pre-execution rewrite of the plan graph.
//!
//! The optimizer never touches the user's [`PlanGraph`]. It realizes the part
//! of it reachable from the invoked root into a [`RealizedGraph`], where every
//! node is either computed or an alias of a structurally identical node that
//! was realized earlier.

pub(crate) mod fingerprint;

use crate::{
    error::BuildError,
    optimizer::fingerprint::Digests,
    plan::{PlanGraph, PlanNode},
    types::{HashMap, IndexMap, NodeId},
};
use core::fmt;
use tracing::debug;

/// How a realized node obtains its output.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RealizedNode {
    /// Evaluated from its inputs.
    Compute(PlanNode),
    /// Reuses the output of `of`, which has the same structure.
    ///
    /// Provenance keys of `of`'s elements are renamed through `relabel` (pairs
    /// of `of`-side and alias-side ids), so that this node keeps its own
    /// identity for join purposes.
    Alias {
        /// Representative computing the shared output.
        of: NodeId,
        /// Pairs of corresponding nodes of both subgraphs.
        relabel: Vec<(NodeId, NodeId)>,
    },
}

impl RealizedNode {
    /// Nodes this one must wait for.
    #[must_use]
    pub fn dependencies(&self) -> Vec<NodeId> {
        match self {
            Self::Compute(node) => node.inputs(),
            Self::Alias { of, .. } => vec![*of],
        }
    }
}

/// Result of [`Optimizer::realize`]: the nodes needed to evaluate a root,
/// sorted by id (hence topologically).
#[derive(Debug, Clone)]
pub struct RealizedGraph {
    root: NodeId,
    nodes: IndexMap<NodeId, RealizedNode>,
}

impl RealizedGraph {
    /// The invoked node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Realized nodes in topological order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &RealizedNode)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// A single realized node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&RealizedNode> {
        self.nodes.get(&id)
    }

    /// Number of realized nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true: the root is always realized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes answered by an alias instead of being computed.
    #[must_use]
    pub fn merged(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| matches!(node, RealizedNode::Alias { .. }))
            .count()
    }

    /// GraphViz rendering, also available through `Display`.
    #[must_use]
    pub fn to_dot(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RealizedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph plan {{")?;
        writeln!(f, "  rankdir=BT;")?;
        for (id, node) in self.iter() {
            let shape = if id == self.root { "doubleoctagon" } else { "box" };
            match node {
                RealizedNode::Compute(node) => {
                    let label = node.label().replace('"', "\\\"");
                    writeln!(f, "  n{} [label=\"{id} {label}\", shape={shape}];", id.0)?;
                    for (edge, input) in node.labelled_inputs() {
                        writeln!(f, "  n{} -> n{} [label=\"{edge}\"];", input.0, id.0)?;
                    }
                }
                RealizedNode::Alias { of, .. } => {
                    writeln!(f, "  n{} [label=\"{id} = {of}\", shape={shape}];", id.0)?;
                    writeln!(f, "  n{} -> n{} [style=dashed];", of.0, id.0)?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

/// Realizes plan graphs, optionally merging structurally identical subplans.
#[derive(Debug, Clone, Copy)]
pub struct Optimizer {
    factorize: bool,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self { factorize: true }
    }
}

impl Optimizer {
    /// An optimizer that merges identical subplans iff `factorize` is set.
    #[must_use]
    pub fn new(factorize: bool) -> Self {
        Self { factorize }
    }

    /// Realizes everything `root` depends on.
    ///
    /// Within each class of structurally identical nodes, the lowest needed id
    /// computes and the others alias it. Nodes only needed by an alias's own
    /// ancestry are not realized at all.
    ///
    /// # Errors
    /// [`BuildError::UnknownNode`] if `root` is not a node of `graph`.
    pub fn realize(&self, graph: &PlanGraph, root: NodeId) -> Result<RealizedGraph, BuildError> {
        let ancestry = graph.ancestry(root)?;
        let (digests, classes) = if self.factorize {
            let digests = Digests::of(graph, &ancestry);
            let mut classes: HashMap<u64, Vec<NodeId>> = HashMap::default();
            for &id in &ancestry {
                if let Some(digest) = digests.get(id) {
                    classes.entry(digest).or_default().push(id);
                }
            }
            (digests, classes)
        } else {
            (Digests::default(), HashMap::default())
        };

        // Walk down from the root: an aliased node does not need its inputs.
        let mut nodes: HashMap<NodeId, RealizedNode> = HashMap::default();
        let mut needed = vec![root];
        while let Some(id) = needed.pop() {
            if nodes.contains_key(&id) {
                continue;
            }
            let members = digests.get(id).and_then(|digest| classes.get(&digest));
            // Members are sorted, so the lowest matching id computes for its
            // whole class.
            let representative = members.into_iter().flatten().take_while(|&&member| member < id).find_map(
                |&member| fingerprint::correspondence(graph, member, id).map(|pairs| (member, pairs)),
            );
            let node = match representative {
                Some((of, pairs)) => RealizedNode::Alias {
                    of,
                    relabel: pairs.into_iter().filter(|(from, to)| from != to).collect(),
                },
                None => RealizedNode::Compute(graph.node(id)?.clone()),
            };
            needed.extend(node.dependencies());
            nodes.insert(id, node);
        }
        let mut nodes: Vec<(NodeId, RealizedNode)> = nodes.into_iter().collect();
        nodes.sort_unstable_by_key(|(id, _)| *id);

        let realized = RealizedGraph {
            root,
            nodes: nodes.into_iter().collect(),
        };
        debug!(
            %root,
            reachable = ancestry.len(),
            realized = realized.len(),
            merged = realized.merged(),
            "optimized plan"
        );
        Ok(realized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan::{Binding, TransformFn},
        registry::{PortSpec, TaskRegistry},
        value::ValueType,
    };
    use std::sync::Arc;

    fn graph() -> PlanGraph {
        let mut registry = TaskRegistry::new();
        registry
            .register(
                "plus",
                [("x", PortSpec::new(ValueType::Integer)), ("y", PortSpec::new(ValueType::Integer))],
                |p| Ok((p.integer("x")? + p.integer("y")?).into()),
            )
            .unwrap();
        PlanGraph::new(Arc::new(registry))
    }

    #[test]
    fn identical_subplans_are_aliased() {
        let mut graph = graph();
        let left = graph
            .plan("plus", [("x", Binding::from(vec![1, 2])), ("y", Binding::from(vec![3]))])
            .unwrap();
        let right = graph
            .plan("plus", [("x", Binding::from(vec![1, 2])), ("y", Binding::from(vec![3]))])
            .unwrap();
        let top = graph
            .plan("plus", [("x", Binding::from(left)), ("y", Binding::from(right))])
            .unwrap();

        let realized = Optimizer::default().realize(&graph, top).unwrap();
        // Three sources of `left`, its call, the alias of `right` and `top`.
        assert_eq!(realized.len(), 5);
        assert_eq!(realized.merged(), 1);
        let Some(RealizedNode::Alias { of, relabel }) = realized.get(right) else {
            panic!("expected an alias");
        };
        assert_eq!(*of, left);
        assert_eq!(relabel.last(), Some(&(left, right)));
        assert_eq!(relabel.len(), 3);
        // The sources of `right` are only reachable through the alias.
        assert!(realized.iter().all(|(id, _)| id <= left || id >= right));

        let ids: Vec<NodeId> = realized.iter().map(|(id, _)| id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn factorization_can_be_disabled() {
        let mut graph = graph();
        let left = graph
            .plan("plus", [("x", Binding::from(vec![1])), ("y", Binding::from(vec![1]))])
            .unwrap();
        let realized = Optimizer::new(false).realize(&graph, left).unwrap();
        assert_eq!(realized.merged(), 0);
        assert_eq!(realized.len(), 3);
        let realized = Optimizer::new(true).realize(&graph, left).unwrap();
        assert_eq!(realized.merged(), 1);
        assert_eq!(realized.len(), 3);
    }

    #[test]
    fn dot_output_lists_nodes_and_edges() {
        let mut graph = graph();
        let call = graph
            .plan("plus", [("x", Binding::from(vec![1])), ("y", Binding::from(vec![1]))])
            .unwrap();
        let dot = Optimizer::default().realize(&graph, call).unwrap().to_dot();
        assert!(dot.starts_with("digraph plan {"));
        assert!(dot.contains("n2 [label=\"#2 plus\", shape=doubleoctagon];"));
        assert!(dot.contains("n0 -> n2 [label=\"x\"];"));
        assert!(dot.contains("n0 -> n1 [style=dashed];"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn deep_chains_are_realized_in_one_pass() {
        let mut graph = graph();
        let identity = TransformFn::new(|v| Ok(v.clone()));
        let chain = |graph: &mut PlanGraph, depth: usize| {
            let mut tip = graph.source([1, 2]).unwrap();
            for _ in 0..depth {
                tip = graph.transform(&identity, tip).unwrap();
            }
            tip
        };

        let tip = chain(&mut graph, 5000);
        let realized = Optimizer::default().realize(&graph, tip).unwrap();
        assert_eq!(realized.len(), 5001);
        assert_eq!(realized.merged(), 0);

        // Two equal chains: only the second tip is answered by an alias.
        let mut graph = self::graph();
        let left = chain(&mut graph, 2000);
        let right = chain(&mut graph, 2000);
        let top = graph
            .plan("plus", [("x", Binding::from(left)), ("y", Binding::from(right))])
            .unwrap();
        let realized = Optimizer::default().realize(&graph, top).unwrap();
        assert_eq!(realized.len(), 2003);
        assert_eq!(realized.merged(), 1);
        let Some(RealizedNode::Alias { of, relabel }) = realized.get(right) else {
            panic!("expected an alias");
        };
        assert_eq!(*of, left);
        assert_eq!(relabel.len(), 2001);
    }

    #[test]
    fn unknown_roots_are_rejected() {
        let graph = graph();
        assert!(matches!(
            Optimizer::default().realize(&graph, NodeId(3)),
            Err(BuildError::UnknownNode(_))
        ));
    }
}
