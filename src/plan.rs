//! Builder-side plan graph.
//!
//! A [`PlanGraph`] is an append-only arena of [`PlanNode`]s. Every node only
//! references nodes created before it, so arena order is a topological order
//! and cycles cannot be expressed. Nothing is executed while building.

mod call;
mod copy;
mod join;

pub use crate::plan::join::JoinRecord;
use crate::{
    error::BuildError,
    registry::{TaskRegistry, TaskSpec},
    types::{HashSet, IndexMap, NodeId, Value},
    value::{FieldPath, ValueType},
};
use derive_more::Debug;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// A graph element denoting a finite, ordered sequence of values.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PlanNode {
    /// Literal values.
    Source(SourceNode),
    /// Combinatorial application of a task.
    Call(CallNode),
    /// Sub-field extraction from each produced value.
    Projection(ProjectionNode),
    /// Pure function applied to each produced value.
    Transform(TransformNode),
    /// Concatenation of several producers.
    Union(UnionNode),
}

/// Zero-dependency node producing exactly its values, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceNode {
    pub(crate) values: Arc<[Value]>,
}

impl SourceNode {
    /// Produced values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// A task bound to one producer per port.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub(crate) task: Arc<TaskSpec>,
    /// Port name to producer, in the task's declared port order.
    pub(crate) bindings: IndexMap<String, NodeId>,
    pub(crate) joins: Vec<JoinRecord>,
}

impl CallNode {
    /// Called task.
    #[must_use]
    pub fn task(&self) -> &Arc<TaskSpec> {
        &self.task
    }

    /// Producer bound to each port, in declared port order.
    #[must_use]
    pub fn bindings(&self) -> &IndexMap<String, NodeId> {
        &self.bindings
    }

    /// Explicit joins attached to this call.
    #[must_use]
    pub fn joins(&self) -> &[JoinRecord] {
        &self.joins
    }
}

/// Extracts `path` from every value of `input`.
#[derive(Debug, Clone)]
pub struct ProjectionNode {
    pub(crate) input: NodeId,
    pub(crate) path: FieldPath,
}

impl ProjectionNode {
    /// Projected producer.
    #[must_use]
    pub fn input(&self) -> NodeId {
        self.input
    }

    /// Extracted path.
    #[must_use]
    pub fn path(&self) -> &FieldPath {
        &self.path
    }
}

/// Applies `function` to every value of `input`.
#[derive(Debug, Clone)]
pub struct TransformNode {
    pub(crate) input: NodeId,
    pub(crate) function: TransformFn,
}

impl TransformNode {
    /// Transformed producer.
    #[must_use]
    pub fn input(&self) -> NodeId {
        self.input
    }
}

/// Concatenates the sequences of its branches.
#[derive(Debug, Clone)]
pub struct UnionNode {
    pub(crate) branches: Vec<NodeId>,
}

impl UnionNode {
    /// Branches in concatenation order.
    #[must_use]
    pub fn branches(&self) -> &[NodeId] {
        &self.branches
    }
}

/// A pure per-value function usable in [`PlanGraph::transform`].
///
/// Each constructed function gets a fresh identity; two transform nodes are
/// structurally equal only when they share the same `TransformFn` (clones
/// included).
#[derive(Debug, Clone)]
pub struct TransformFn {
    id: u64,
    #[debug(skip)]
    function: Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>,
}

impl TransformFn {
    /// Wraps `function`.
    pub fn new(function: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            function: Arc::new(function),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn apply(&self, value: &Value) -> anyhow::Result<Value> {
        (self.function)(value)
    }
}

/// What a port is bound to when planning a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// An existing node of the same graph.
    Node(NodeId),
    /// Literal values, wrapped in a fresh [`SourceNode`].
    Values(Vec<Value>),
}

impl From<NodeId> for Binding {
    fn from(node: NodeId) -> Self {
        Self::Node(node)
    }
}

impl From<Value> for Binding {
    /// A JSON array binds its elements; any other value binds itself alone.
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => Self::Values(values),
            value => Self::Values(vec![value]),
        }
    }
}

impl<V: Into<Value>> From<Vec<V>> for Binding {
    fn from(values: Vec<V>) -> Self {
        Self::Values(values.into_iter().map(Into::into).collect())
    }
}

impl PlanNode {
    /// Direct producers of this node, in evaluation order.
    #[must_use]
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Self::Source(_) => vec![],
            Self::Call(call) => call.bindings.values().copied().collect(),
            Self::Projection(ProjectionNode { input, .. }) | Self::Transform(TransformNode { input, .. }) => {
                vec![*input]
            }
            Self::Union(union) => union.branches.clone(),
        }
    }

    /// Short human readable description.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Source(source) => format!("values ({})", source.values.len()),
            Self::Call(call) => call.task.id().to_owned(),
            Self::Projection(projection) => format!(".{}", projection.path),
            Self::Transform(transform) => format!("transform #{}", transform.function.id()),
            Self::Union(union) => format!("union ({})", union.branches.len()),
        }
    }

    /// Inputs paired with the name of the edge leading to them.
    pub(crate) fn labelled_inputs(&self) -> Vec<(String, NodeId)> {
        match self {
            Self::Call(call) => call
                .bindings
                .iter()
                .map(|(port, node)| (port.clone(), *node))
                .collect(),
            Self::Union(union) => union
                .branches
                .iter()
                .enumerate()
                .map(|(idx, node)| (idx.to_string(), *node))
                .collect(),
            _ => self.inputs().into_iter().map(|node| (String::new(), node)).collect(),
        }
    }

    /// Same node with every referenced node id passed through `map`.
    pub(crate) fn remap(&self, map: impl Fn(NodeId) -> NodeId) -> Self {
        match self {
            Self::Source(source) => Self::Source(source.clone()),
            Self::Call(call) => Self::Call(CallNode {
                task: Arc::clone(&call.task),
                bindings: call
                    .bindings
                    .iter()
                    .map(|(port, node)| (port.clone(), map(*node)))
                    .collect(),
                joins: call.joins.iter().map(|join| join.remap(&map)).collect(),
            }),
            Self::Projection(projection) => Self::Projection(ProjectionNode {
                input: map(projection.input),
                path: projection.path.clone(),
            }),
            Self::Transform(transform) => Self::Transform(TransformNode {
                input: map(transform.input),
                function: transform.function.clone(),
            }),
            Self::Union(union) => Self::Union(UnionNode {
                branches: union.branches.iter().copied().map(map).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeSlot {
    node: PlanNode,
    /// The node this one was (transitively) copied from, or itself.
    lineage: NodeId,
}

/// Append-only arena of plan nodes bound to a task registry.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    registry: Arc<TaskRegistry>,
    nodes: Vec<NodeSlot>,
}

impl PlanGraph {
    /// An empty graph planning calls against `registry`.
    #[must_use]
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            nodes: vec![],
        }
    }

    /// The registry tasks are looked up in.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Node behind a handle.
    ///
    /// # Errors
    /// [`BuildError::UnknownNode`] if the handle is out of range.
    pub fn node(&self, id: NodeId) -> Result<&PlanNode, BuildError> {
        self.nodes
            .get(id.index())
            .map(|slot| &slot.node)
            .ok_or(BuildError::UnknownNode(id))
    }

    /// Number of nodes built so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node was built yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wraps `values` as a zero-dependency node producing them in order.
    ///
    /// # Errors
    /// [`BuildError::TooManyNodes`] if the arena is full.
    pub fn source<V: Into<Value>>(
        &mut self,
        values: impl IntoIterator<Item = V>,
    ) -> Result<NodeId, BuildError> {
        let values: Arc<[Value]> = values.into_iter().map(Into::into).collect();
        self.push(PlanNode::Source(SourceNode { values }))
    }

    /// Projects `path` out of every value produced by `node`.
    ///
    /// # Errors
    /// [`BuildError::InvalidPath`] for a malformed path,
    /// [`BuildError::UnknownNode`] for a foreign handle.
    pub fn project(&mut self, node: NodeId, path: &str) -> Result<NodeId, BuildError> {
        self.node(node)?;
        let path = path.parse()?;
        self.push(PlanNode::Projection(ProjectionNode { input: node, path }))
    }

    /// Applies `function` to every value produced by `node`.
    ///
    /// # Errors
    /// [`BuildError::UnknownNode`] for a foreign handle.
    pub fn transform(&mut self, function: &TransformFn, node: NodeId) -> Result<NodeId, BuildError> {
        self.node(node)?;
        self.push(PlanNode::Transform(TransformNode {
            input: node,
            function: function.clone(),
        }))
    }

    /// Concatenates the sequences of `branches`, in order.
    ///
    /// # Errors
    /// [`BuildError::EmptyUnion`] without branches,
    /// [`BuildError::UnknownNode`] for a foreign handle.
    pub fn union(&mut self, branches: impl IntoIterator<Item = NodeId>) -> Result<NodeId, BuildError> {
        let branches: Vec<NodeId> = branches.into_iter().collect();
        if branches.is_empty() {
            return Err(BuildError::EmptyUnion);
        }
        for &branch in &branches {
            self.node(branch)?;
        }
        self.push(PlanNode::Union(UnionNode { branches }))
    }

    /// Static type of the values `node` produces, `Any` when unknown.
    pub(crate) fn static_type(&self, node: NodeId) -> ValueType {
        match self.node(node) {
            Ok(PlanNode::Source(source)) => common_type(source.values.iter().map(ValueType::of)),
            Ok(PlanNode::Call(call)) => call.task.output_type(),
            Ok(PlanNode::Union(union)) => common_type(union.branches.iter().map(|&b| self.static_type(b))),
            Ok(PlanNode::Projection(_) | PlanNode::Transform(_)) | Err(_) => ValueType::Any,
        }
    }

    pub(crate) fn lineage(&self, node: NodeId) -> NodeId {
        self.nodes.get(node.index()).map_or(node, |slot| slot.lineage)
    }

    /// `node` and everything it transitively depends on, in arena (hence
    /// topological) order.
    pub(crate) fn ancestry(&self, node: NodeId) -> Result<Vec<NodeId>, BuildError> {
        self.node(node)?;
        let mut seen = HashSet::default();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                stack.extend(self.node(current)?.inputs());
            }
        }
        let mut ancestry: Vec<NodeId> = seen.into_iter().collect();
        ancestry.sort_unstable();
        Ok(ancestry)
    }

    fn push(&mut self, node: PlanNode) -> Result<NodeId, BuildError> {
        self.push_slot(node, None)
    }

    /// Appends `node`, which starts its own lineage unless it copies one.
    fn push_slot(&mut self, node: PlanNode, lineage: Option<NodeId>) -> Result<NodeId, BuildError> {
        let id = self.next_id()?;
        debug!(node = %id, kind = %node.label(), "added plan node");
        self.nodes.push(NodeSlot {
            node,
            lineage: lineage.unwrap_or(id),
        });
        Ok(id)
    }

    fn next_id(&self) -> Result<NodeId, BuildError> {
        u32::try_from(self.nodes.len())
            .map(NodeId)
            .map_err(|_| BuildError::TooManyNodes {
                max: u32::MAX as usize,
            })
    }
}

fn common_type(mut types: impl Iterator<Item = ValueType>) -> ValueType {
    let Some(first) = types.next() else {
        return ValueType::Any;
    };
    if types.all(|other| other == first) {
        first
    } else {
        ValueType::Any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> PlanGraph {
        PlanGraph::new(Arc::new(TaskRegistry::new()))
    }

    #[test]
    fn arena_ids_are_sequential() {
        let mut graph = graph();
        let a = graph.source([1, 2]).unwrap();
        let b = graph.source(["x"]).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.static_type(a), ValueType::Integer);
        assert_eq!(graph.static_type(b), ValueType::String);
    }

    #[test]
    fn fresh_nodes_start_their_own_lineage() {
        let mut graph = graph();
        let a = graph.source([1]).unwrap();
        let b = graph.source([2]).unwrap();
        let c = graph.copy(a).unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(graph.lineage(a), a);
        assert_eq!(graph.lineage(b), b);
        assert_eq!(graph.lineage(c), a);
    }

    #[test]
    fn ancestry_is_topologically_sorted() {
        let mut graph = graph();
        let a = graph.source([1]).unwrap();
        let b = graph.source([2]).unwrap();
        let u = graph.union([b, a]).unwrap();
        let p = graph.project(u, "x").unwrap();
        assert_eq!(graph.ancestry(p).unwrap(), vec![a, b, u, p]);
        assert_eq!(graph.ancestry(a).unwrap(), vec![a]);
    }

    #[test]
    fn foreign_handles_and_bad_paths_are_rejected() {
        let mut graph = graph();
        let a = graph.source([json!({"x": 1})]).unwrap();
        assert_eq!(
            graph.project(NodeId(7), "x").unwrap_err(),
            BuildError::UnknownNode(NodeId(7))
        );
        assert_eq!(
            graph.project(a, "x.").unwrap_err(),
            BuildError::InvalidPath("x.".into())
        );
        assert_eq!(
            graph.union([]).unwrap_err(),
            BuildError::EmptyUnion
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn bindings_from_literals() {
        assert_eq!(
            Binding::from(json!([1, 2])),
            Binding::Values(vec![json!(1), json!(2)])
        );
        assert_eq!(Binding::from(json!(3)), Binding::Values(vec![json!(3)]));
        assert_eq!(
            Binding::from(vec!["a", "b"]),
            Binding::Values(vec![json!("a"), json!("b")])
        );
    }

    #[test]
    fn transform_functions_have_distinct_identities() {
        let f = TransformFn::new(|v| Ok(v.clone()));
        let g = TransformFn::new(|v| Ok(v.clone()));
        assert_ne!(f.id(), g.id());
        assert_eq!(f.clone().id(), f.id());
        assert_eq!(f.apply(&json!(1)).unwrap(), json!(1));
    }
}
