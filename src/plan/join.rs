use crate::{
    error::BuildError,
    optimizer::fingerprint,
    plan::{PlanGraph, PlanNode},
    types::{HashMap, HashSet, NodeId},
};
use tracing::debug;

/// An explicit correlation constraint attached to a call.
///
/// `anchors` are the nodes standing for `ancestor` inside each joined path:
/// the ancestor itself or one of its copies. At the call, elements whose
/// provenance disagrees on the anchors are never combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    ancestor: NodeId,
    paths: Vec<NodeId>,
    anchors: Vec<NodeId>,
}

impl JoinRecord {
    /// Declared common ancestor.
    #[must_use]
    pub fn ancestor(&self) -> NodeId {
        self.ancestor
    }

    /// Joined paths, as declared.
    #[must_use]
    pub fn paths(&self) -> &[NodeId] {
        &self.paths
    }

    /// Resolved anchors, sorted and deduplicated.
    #[must_use]
    pub fn anchors(&self) -> &[NodeId] {
        &self.anchors
    }

    pub(crate) fn remap(&self, map: impl Fn(NodeId) -> NodeId) -> Self {
        let mut anchors: Vec<NodeId> = self.anchors.iter().copied().map(&map).collect();
        anchors.sort_unstable();
        Self {
            ancestor: map(self.ancestor),
            paths: self.paths.iter().copied().map(&map).collect(),
            anchors,
        }
    }
}

impl PlanGraph {
    /// Forces `paths` (inputs of `call`, or nodes upstream of them) to consume
    /// matching elements of `ancestor`.
    ///
    /// Each path must reach `ancestor`, or exactly one copy of it, through its
    /// own dependencies. This also correlates paths whose sharing the engine
    /// would not detect on its own, e.g. one going through a copy.
    ///
    /// # Errors
    /// [`BuildError::NotACall`] if `call` is not a task call,
    /// [`BuildError::JoinMismatch`] if fewer than two paths are given, a path
    /// is not upstream of `call`, a path does not reach `ancestor`, or the
    /// matched nodes cannot be aligned element by element, and
    /// [`BuildError::JoinConflict`] if a path reaches `ancestor` through
    /// several copies.
    pub fn join(
        &mut self,
        call: NodeId,
        ancestor: NodeId,
        paths: impl IntoIterator<Item = NodeId>,
    ) -> Result<(), BuildError> {
        let paths: Vec<NodeId> = paths.into_iter().collect();
        let PlanNode::Call(call_node) = self.node(call)? else {
            return Err(BuildError::NotACall(call));
        };
        self.node(ancestor)?;
        let mismatch = |reason: String| BuildError::JoinMismatch {
            call,
            ancestor,
            reason,
        };
        if paths.len() < 2 {
            return Err(mismatch(format!("at least two paths are needed, got {}", paths.len())));
        }

        let mut upstream = HashSet::default();
        for &input in call_node.bindings.values() {
            upstream.extend(self.ancestry(input)?);
        }

        let lineage = self.lineage(ancestor);
        let mut anchors = Vec::with_capacity(paths.len());
        for &path in &paths {
            self.node(path)?;
            if !upstream.contains(&path) {
                return Err(mismatch(format!("{path} is not upstream of the call")));
            }
            let matches: Vec<NodeId> = self
                .ancestry(path)?
                .into_iter()
                .filter(|&node| self.lineage(node) == lineage)
                .collect();
            let anchor = match matches.as_slice() {
                [] => return Err(mismatch(format!("{path} does not depend on {ancestor}"))),
                [anchor] => *anchor,
                [..] => {
                    return Err(BuildError::JoinConflict {
                        call,
                        ancestor,
                        reason: format!("{path} reaches it through {} distinct copies", matches.len()),
                    });
                }
            };
            if anchor != ancestor && fingerprint::correspondence(self, ancestor, anchor).is_none() {
                return Err(mismatch(format!(
                    "{anchor} no longer matches {ancestor} element for element"
                )));
            }
            anchors.push(anchor);
        }
        anchors.sort_unstable();
        anchors.dedup();

        let record = JoinRecord {
            ancestor,
            paths,
            anchors,
        };
        let Some(PlanNode::Call(call_node)) = self.nodes.get_mut(call.index()).map(|slot| &mut slot.node) else {
            unreachable!("PlanGraph::join: [1]");
        };
        if call_node.joins.iter().any(|join| join.anchors == record.anchors) {
            return Ok(());
        }
        debug!(%call, %ancestor, anchors = ?record.anchors, "declared join");
        call_node.joins.push(record);
        Ok(())
    }
}

impl super::CallNode {
    /// Maps every joined anchor to a single representative, so that elements
    /// can be compared on the representative's key.
    pub(crate) fn join_aliases(&self) -> HashMap<NodeId, NodeId> {
        let mut parent: HashMap<NodeId, NodeId> = HashMap::default();
        let find = |parent: &HashMap<NodeId, NodeId>, mut node: NodeId| {
            while let Some(&next) = parent.get(&node) {
                node = next;
            }
            node
        };
        for join in &self.joins {
            let Some((&first, rest)) = join.anchors.split_first() else {
                continue;
            };
            let root = find(&parent, first);
            for &anchor in rest {
                let other = find(&parent, anchor);
                if other != root {
                    parent.insert(other, root);
                }
            }
        }
        let nodes: Vec<NodeId> = parent.keys().copied().collect();
        nodes
            .into_iter()
            .map(|node| (node, find(&parent, node)))
            .collect()
    }
}
