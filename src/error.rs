use crate::{
    types::{NodeId, Value},
    value::{Params, ValueType},
};
use core::fmt;
use thiserror::Error;

/// Error raised while registering tasks or assembling a plan graph.
///
/// Building fails fast: the graph is left without the node (or join) whose
/// construction failed.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum BuildError {
    /// No task is registered under this identifier.
    #[error("task `{0}` is not registered")]
    UnknownTask(String),
    /// A task with this identifier is already registered.
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),
    /// A binding names a port the task does not declare.
    #[error("task `{task}` has no input port `{port}`")]
    UnknownPort {
        /// Task identifier.
        task: String,
        /// Offending port name.
        port: String,
    },
    /// The same port is bound twice in one call.
    #[error("port `{port}` of task `{task}` is bound more than once")]
    DuplicateBinding {
        /// Task identifier.
        task: String,
        /// Offending port name.
        port: String,
    },
    /// A port without default and not optional was left unbound.
    #[error("required port `{port}` of task `{task}` is not bound")]
    MissingRequiredPort {
        /// Task identifier.
        task: String,
        /// Unbound port name.
        port: String,
    },
    /// A bound value or producer is incompatible with the port's declared type.
    #[error("port `{port}` of task `{task}` expects {expected}, got {found}")]
    TypeMismatch {
        /// Task identifier.
        task: String,
        /// Port name.
        port: String,
        /// Declared port type.
        expected: ValueType,
        /// The offending value or the producer's static type.
        found: String,
    },
    /// A type name could not be parsed.
    #[error("unknown value type `{0}`")]
    UnknownValueType(String),
    /// The handle does not designate a node of this graph.
    #[error("node {0} does not belong to this plan graph")]
    UnknownNode(NodeId),
    /// Joins can only be attached to task calls.
    #[error("node {0} is not a task call")]
    NotACall(NodeId),
    /// A projection path is empty or has an empty segment.
    #[error("invalid projection path `{0}`")]
    InvalidPath(String),
    /// A union must have at least one branch.
    #[error("a union needs at least one branch")]
    EmptyUnion,
    /// The declared join cannot be satisfied.
    #[error("cannot join {call} on {ancestor}: {reason}")]
    JoinMismatch {
        /// Call the join was attached to.
        call: NodeId,
        /// Declared common ancestor.
        ancestor: NodeId,
        /// What failed.
        reason: String,
    },
    /// The declared join is ambiguous.
    #[error("join of {call} on {ancestor} is ambiguous: {reason}")]
    JoinConflict {
        /// Call the join was attached to.
        call: NodeId,
        /// Declared common ancestor.
        ancestor: NodeId,
        /// What conflicts.
        reason: String,
    },
    /// The arena ran out of node identifiers.
    #[error("plan graph cannot hold more than {max} nodes")]
    TooManyNodes {
        /// Capacity of the arena.
        max: usize,
    },
}

/// Why a single element could not be produced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ElementError {
    /// The projected path is absent from the produced value.
    #[error("path `{path}` not found in {value}")]
    PathNotFound {
        /// Projection path.
        path: String,
        /// Value the path was resolved against.
        value: Value,
    },
    /// The transform function failed.
    #[error("transform failed")]
    Transform(#[source] anyhow::Error),
    /// The task's run body failed.
    #[error("task run failed")]
    TaskRun(#[source] anyhow::Error),
    /// A value reaching a port cannot be coerced to the port's type.
    #[error("port `{port}` expects {expected}, got {found}")]
    ArgumentType {
        /// Port name.
        port: String,
        /// Declared port type.
        expected: ValueType,
        /// Offending value.
        found: Value,
    },
}

/// An element-level failure with enough context to reproduce it.
#[derive(Debug, Error)]
pub struct ElementFailure {
    /// Node whose element failed.
    pub node: NodeId,
    /// Task identifier, when the node is a task call.
    pub task: Option<String>,
    /// Combination index (calls) or input element index (projections and
    /// transforms).
    pub element: usize,
    /// Resolved argument tuple, when the failure happened around a run body.
    pub arguments: Option<Params>,
    /// Cause.
    #[source]
    pub error: ElementError,
}

impl fmt::Display for ElementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            node,
            task,
            element,
            arguments,
            error,
        } = self;
        write!(f, "node {node}")?;
        if let Some(task) = task {
            write!(f, " (task `{task}`)")?;
        }
        write!(f, ", element {element}")?;
        if let Some(arguments) = arguments {
            write!(f, " [{arguments}]")?;
        }
        write!(f, ": {error}")
    }
}

/// Error returned by an invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvocationError {
    /// The invoked graph or root is invalid.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// An element failed under the fail-fast policy.
    #[error("invocation aborted: {0}")]
    Element(Box<ElementFailure>),
    /// The configured worker pool could not be started.
    #[error("failed to start the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<ElementFailure> for InvocationError {
    fn from(failure: ElementFailure) -> Self {
        Self::Element(Box::new(failure))
    }
}
