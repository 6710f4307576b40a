use crate::{
    error::BuildError,
    plan::PlanGraph,
    types::{HashMap, NodeId},
};
use tracing::debug;

impl PlanGraph {
    /// Duplicates the subgraph rooted at `node`.
    ///
    /// Every node of the subgraph, sources included, gets a fresh identity
    /// while internal sharing is preserved. The copy therefore combines with
    /// the original as an independent (cartesian) dimension. Explicit joins
    /// can still relate the two, since a copy keeps its original's lineage.
    ///
    /// # Errors
    /// [`BuildError::UnknownNode`] for a foreign handle,
    /// [`BuildError::TooManyNodes`] if the arena fills up.
    pub fn copy(&mut self, node: NodeId) -> Result<NodeId, BuildError> {
        let ancestry = self.ancestry(node)?;
        let mut mapping: HashMap<NodeId, NodeId> =
            HashMap::with_capacity_and_hasher(ancestry.len(), Default::default());
        for original in ancestry {
            let copied = self
                .node(original)?
                .remap(|id| mapping.get(&id).copied().unwrap_or(id));
            let id = self.push_slot(copied, Some(self.lineage(original)))?;
            mapping.insert(original, id);
        }
        let copy = mapping[&node];
        debug!(original = %node, copy = %copy, nodes = mapping.len(), "copied plan");
        Ok(copy)
    }
}
