use crate::{
    optimizer::RealizedGraph,
    stage::{SetupApi, Subscription},
    types::{IndexMap, IndexSet, NodeId},
};

pub(super) struct StageSetupApiImpl<'a> {
    pub(super) current_node: NodeId,
    pub(super) realized: &'a RealizedGraph,
    pub(super) child_to_parents: &'a mut IndexMap<NodeId, IndexSet<NodeId>>,
    pub(super) parent_to_children: &'a mut IndexMap<NodeId, IndexSet<NodeId>>,
}

impl SetupApi for StageSetupApiImpl<'_> {
    fn subscribe(&mut self, parent: NodeId) -> Subscription {
        let Self {
            current_node,
            realized,
            child_to_parents,
            parent_to_children,
        } = self;
        assert!(
            realized.get(parent).is_some(),
            "Node {parent} is subscribed to but was not realized"
        );
        assert!(
            parent < *current_node,
            "Node {current_node} subscribes to {parent}, which is not upstream"
        );
        child_to_parents
            .entry(*current_node)
            .or_default()
            .insert(parent);
        parent_to_children
            .entry(parent)
            .or_default()
            .insert(*current_node);

        Subscription(parent)
    }
}
