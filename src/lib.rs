//! Declarative plan composition and parallel execution.
//!
//! Tasks are registered once, with typed input ports and a run body. A plan
//! binds every port of a task to a producer: literal values, another call, a
//! projection of a structured output, a transformed sequence, or a union of
//! those. A plan does not denote one invocation but the whole family of
//! invocations over the combinations of its bound inputs:
//! - Independent ports combine as a cartesian product, the last declared port
//!   varying fastest.
//! - Ports tracing back to the same node instance vary together (implicit
//!   join), while a copy of a node is an independent dimension.
//! - Explicit joins correlate paths that would otherwise combine freely, e.g.
//!   a node and a copy of it.
//!
//! Nothing runs while building. Invoking a node realizes the part of the graph
//! it depends on, merges structurally identical subplans so that they are
//! computed once, and runs the remaining stages on a rayon pool. Stages run in
//! topological order and with minimal synchronization: a child with a single
//! parent starts on its parent's thread, and a shared child starts once its
//! last parent published its output. Results always come back in enumeration
//! order, whatever the execution order.
//!
//! Quick start:
//! 1. Fill a `TaskRegistry` with `TaskRegistry::register`.
//! 2. Build a `PlanGraph` over it with `PlanGraph::plan`, `PlanGraph::project`,
//!    `PlanGraph::copy` and `PlanGraph::join`.
//! 3. Invoke a node with `PlanGraph::invoke`, or through an `Engine` for a
//!    custom `EngineConfig`.

mod combine;
/// Engine configuration.
pub mod config;
/// Invocation entry point.
pub mod engine;
/// Build-time and execution-time errors.
pub mod error;
mod executor;
/// Realization and factorization of plan graphs.
pub mod optimizer;
pub mod plan;
/// Task specifications and the registry holding them.
pub mod registry;
mod stage;
mod sync;
/// Core types shared across the crate (node ids, values, cell wrapper).
pub mod types;
/// Value types, projection paths and parameter tuples.
pub mod value;

pub use crate::{
    config::{EngineConfig, FailurePolicy},
    engine::{Engine, Outcome},
    error::{BuildError, ElementError, ElementFailure, InvocationError},
    optimizer::{Optimizer, RealizedGraph, RealizedNode},
    plan::{Binding, PlanGraph, PlanNode, TransformFn},
    registry::{PortSpec, TaskRegistry, TaskSpec},
    types::{NodeId, Value},
    value::{FieldPath, Params, ValueType},
};
