use crate::{
    plan::{PlanGraph, PlanNode},
    types::{HashMap, NodeId},
};
use core::hash::{Hash, Hasher};
use rustc_hash::FxHasher;

/// What a node computes from its inputs, ignoring where those come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Label {
    Source(String),
    Call { task: String, ports: Vec<String> },
    Projection(String),
    Transform(u64),
    Union,
}

impl Label {
    fn of(node: &PlanNode) -> Self {
        match node {
            PlanNode::Source(source) => {
                let values: Vec<String> = source.values().iter().map(ToString::to_string).collect();
                Self::Source(values.join(","))
            }
            PlanNode::Call(call) => Self::Call {
                task: call.task().id().to_owned(),
                ports: call.bindings().keys().cloned().collect(),
            },
            PlanNode::Projection(projection) => Self::Projection(projection.path().to_string()),
            PlanNode::Transform(transform) => Self::Transform(transform.function.id()),
            PlanNode::Union(_) => Self::Union,
        }
    }
}

/// Structural digests of a set of nodes, computed bottom-up.
///
/// A digest covers the node's label, its inputs' digests in port order, which
/// ports are bound to the very same node, and the digests of its join
/// anchors. Equal structures always get equal digests. The converse is only
/// likely, so candidates are confirmed with [`correspondence`].
#[derive(Debug, Default)]
pub(crate) struct Digests(HashMap<NodeId, u64>);

impl Digests {
    /// Digests of `nodes`, which must be closed under inputs and sorted
    /// topologically.
    ///
    /// # Panics
    /// If `nodes` is not a topologically sorted ancestry of `graph`.
    pub(crate) fn of(graph: &PlanGraph, nodes: &[NodeId]) -> Self {
        let mut digests = HashMap::with_capacity_and_hasher(nodes.len(), Default::default());
        let digest_of = |digests: &HashMap<NodeId, u64>, node: &NodeId| -> u64 {
            *digests.get(node).expect("Digests::of: [1]")
        };
        for &id in nodes {
            let node = graph.node(id).expect("Digests::of: [2]");
            let inputs = node.inputs();
            let mut hasher = FxHasher::default();
            Label::of(node).hash(&mut hasher);
            for (position, input) in inputs.iter().enumerate() {
                digest_of(&digests, input).hash(&mut hasher);
                // First port bound to the same node, so `f(p, p)` and
                // `f(p, copy(p))` differ.
                inputs[..position]
                    .iter()
                    .position(|other| other == input)
                    .unwrap_or(position)
                    .hash(&mut hasher);
            }
            if let PlanNode::Call(call) = node {
                let mut joins: Vec<Vec<u64>> = call
                    .joins()
                    .iter()
                    .map(|join| {
                        let mut anchors: Vec<u64> =
                            join.anchors().iter().map(|anchor| digest_of(&digests, anchor)).collect();
                        anchors.sort_unstable();
                        anchors
                    })
                    .collect();
                joins.sort_unstable();
                joins.hash(&mut hasher);
            }
            digests.insert(id, hasher.finish());
        }
        Self(digests)
    }

    pub(crate) fn get(&self, node: NodeId) -> Option<u64> {
        self.0.get(&node).copied()
    }
}

/// Node-by-node correspondence between the subgraphs rooted at `from` and
/// `to`, in post-order (the roots last), or `None` if they differ.
///
/// Subgraphs match iff they have the same labels, the same wiring and the same
/// internal sharing: a node reached twice on one side must be reached twice on
/// the other. Explicit joins must have corresponding anchors.
pub(crate) fn correspondence(graph: &PlanGraph, from: NodeId, to: NodeId) -> Option<Vec<(NodeId, NodeId)>> {
    let mut forward: HashMap<NodeId, NodeId> = HashMap::default();
    let mut backward: HashMap<NodeId, NodeId> = HashMap::default();
    let mut pairs = vec![];
    // Explicit stack of (from-side, to-side, expanded).
    let mut stack = vec![(from, to, false)];
    while let Some((lhs, rhs, expanded)) = stack.pop() {
        if expanded {
            pairs.push((lhs, rhs));
            continue;
        }
        if let Some(&seen) = forward.get(&lhs) {
            if seen != rhs {
                return None;
            }
            continue;
        }
        if backward.contains_key(&rhs) {
            return None;
        }
        let (lhs_node, rhs_node) = (graph.node(lhs).ok()?, graph.node(rhs).ok()?);
        let (lhs_inputs, rhs_inputs) = (lhs_node.inputs(), rhs_node.inputs());
        if lhs_inputs.len() != rhs_inputs.len() || Label::of(lhs_node) != Label::of(rhs_node) {
            return None;
        }
        forward.insert(lhs, rhs);
        backward.insert(rhs, lhs);
        stack.push((lhs, rhs, true));
        stack.extend(lhs_inputs.into_iter().zip(rhs_inputs).rev().map(|(l, r)| (l, r, false)));
    }

    for &(lhs, rhs) in &pairs {
        let (Ok(PlanNode::Call(lhs_call)), Ok(PlanNode::Call(rhs_call))) = (graph.node(lhs), graph.node(rhs)) else {
            continue;
        };
        let mut mapped = Vec::with_capacity(lhs_call.joins().len());
        for join in lhs_call.joins() {
            let mut anchors = join
                .anchors()
                .iter()
                .map(|anchor| forward.get(anchor).copied())
                .collect::<Option<Vec<NodeId>>>()?;
            anchors.sort_unstable();
            mapped.push(anchors);
        }
        let mut expected: Vec<Vec<NodeId>> = rhs_call.joins().iter().map(|join| join.anchors().to_vec()).collect();
        mapped.sort_unstable();
        expected.sort_unstable();
        if mapped != expected {
            return None;
        }
    }
    Some(pairs)
}
