#![allow(missing_docs)]

use planweave::{
    Binding, BuildError, ElementError, Engine, EngineConfig, FailurePolicy, InvocationError, NodeId, PlanGraph,
    PortSpec, TaskRegistry, TaskSpec, TransformFn, Value, ValueType,
};
use serde_json::json;
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Run-body invocations of the `counted` task.
#[derive(Debug, Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

fn int(name: &str) -> (&str, PortSpec) {
    (name, PortSpec::new(ValueType::Integer))
}

fn registry(counter: &Counter) -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .register("identity", [int("x")], |p| p.require("x").cloned())
        .unwrap();
    registry
        .register("plus", [int("x"), int("y")], |p| Ok(json!(p.integer("x")? + p.integer("y")?)))
        .unwrap();
    registry
        .register("mult", [int("x"), int("y")], |p| Ok(json!(p.integer("x")? * p.integer("y")?)))
        .unwrap();
    registry
        .register("div", [int("x"), int("y")], |p| {
            let y = p.integer("y")?;
            anyhow::ensure!(y != 0, "division by zero");
            Ok(json!(p.integer("x")? / y))
        })
        .unwrap();
    registry
        .insert(
            TaskSpec::new("wrap", |p| Ok(json!({"x": p.require("x")?})))
                .input("x", PortSpec::new(ValueType::Integer))
                .output(ValueType::Record),
        )
        .unwrap();
    registry
        .insert(
            TaskSpec::new("nest", |p| Ok(json!({"a": {"x": p.require("x")?, "tag": "nested"}})))
                .input("x", PortSpec::new(ValueType::Any))
                .output(ValueType::Record),
        )
        .unwrap();
    registry
        .insert(
            TaskSpec::new("scale", |p| {
                let scaled = p.integer("x")? * p.integer("factor")?;
                Ok(match p.get("label") {
                    Some(label) => json!(format!("{}={scaled}", label.as_str().unwrap_or_default())),
                    None => json!(scaled),
                })
            })
            .input("x", PortSpec::new(ValueType::Integer).documented("value to scale"))
            .input("factor", PortSpec::new(ValueType::Integer).with_default(2))
            .input("label", PortSpec::new(ValueType::String).optional()),
        )
        .unwrap();
    let counter = counter.clone();
    registry
        .register("counted", [int("x")], move |p| {
            counter.0.fetch_add(1, Ordering::Relaxed);
            p.require("x").cloned()
        })
        .unwrap();
    Arc::new(registry)
}

fn graph() -> PlanGraph {
    PlanGraph::new(registry(&Counter::default()))
}

fn ints(values: &[Value]) -> Vec<i64> {
    values.iter().map(|value| value.as_i64().unwrap()).collect()
}

fn invoke(graph: &PlanGraph, root: NodeId) -> Vec<i64> {
    ints(&graph.invoke(root).unwrap())
}

#[test]
fn cartesian_product_law() {
    let mut graph = graph();
    let call = graph
        .plan("mult", [("x", Binding::from(vec![1, 2])), ("y", Binding::from(vec![3, 5]))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [3, 5, 6, 10]);
}

#[test]
fn binding_order_does_not_change_enumeration_order() {
    let mut graph = graph();
    let call = graph
        .plan("mult", [("y", Binding::from(vec![3, 5])), ("x", Binding::from(vec![1, 2]))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [3, 5, 6, 10]);
}

#[test]
fn explicit_join_law() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![1, 2]))]).unwrap();
    let plan2 = graph
        .plan("mult", [("x", Binding::from(plan1)), ("y", Binding::from(vec![3, 5]))])
        .unwrap();
    assert_eq!(invoke(&graph, plan2), [3, 5, 6, 10]);
    let plan3 = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(plan2))])
        .unwrap();
    graph.join(plan3, plan1, [plan2, plan1]).unwrap();
    assert_eq!(invoke(&graph, plan3), [4, 6, 8, 12]);
}

#[test]
fn explicit_join_through_a_projection() {
    let mut graph = graph();
    let plan1 = graph.plan("wrap", [("x", Binding::from(vec![1, 2]))]).unwrap();
    let x = graph.project(plan1, "x").unwrap();
    let plan2 = graph
        .plan("mult", [("x", Binding::from(x)), ("y", Binding::from(vec![3, 5]))])
        .unwrap();
    let plan3 = graph
        .plan("plus", [("x", Binding::from(x)), ("y", Binding::from(plan2))])
        .unwrap();
    graph.join(plan3, plan1, [plan2, x]).unwrap();
    assert_eq!(invoke(&graph, plan3), [4, 6, 8, 12]);
}

#[test]
fn explicit_join_reaches_through_a_copy() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![1, 2]))]).unwrap();
    let copy = graph.copy(plan1).unwrap();
    let plan2 = graph
        .plan("mult", [("x", Binding::from(copy)), ("y", Binding::from(vec![3, 5]))])
        .unwrap();
    let plan3 = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(plan2))])
        .unwrap();
    assert_eq!(invoke(&graph, plan3), [4, 6, 7, 11, 5, 7, 8, 12]);

    graph.join(plan3, plan1, [plan1, plan2]).unwrap();
    assert_eq!(invoke(&graph, plan3), [4, 6, 8, 12]);
}

#[test]
fn implicit_join_law() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![2, 3]))]).unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(plan1))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [4, 6]);
}

#[test]
fn implicit_join_spans_several_levels() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![1, 2]))]).unwrap();
    let doubled = graph
        .plan("mult", [("x", Binding::from(plan1)), ("y", Binding::from(vec![2]))])
        .unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(doubled))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [3, 6]);
}

#[test]
fn copy_breaks_correlation() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![2, 3]))]).unwrap();
    let copy = graph.copy(plan1).unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(copy))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [4, 5, 5, 6]);
}

#[test]
fn projection_preserves_cardinality_and_order() {
    let mut graph = graph();
    let call = graph
        .plan("nest", [("x", Binding::from(vec![json!(3), json!("b"), json!(1)]))])
        .unwrap();
    let projected = graph.project(call, "a.x").unwrap();
    assert_eq!(graph.invoke(projected).unwrap(), [json!(3), json!("b"), json!(1)]);
    let tags = graph.project(call, "a.tag").unwrap();
    assert_eq!(graph.invoke(tags).unwrap().len(), 3);
}

#[test]
fn transform_is_one_to_one_and_order_preserving() {
    let mut graph = graph();
    let call = graph
        .plan("mult", [("x", Binding::from(vec![1, 2])), ("y", Binding::from(vec![3, 5]))])
        .unwrap();
    let square = TransformFn::new(|value| {
        let value = value.as_i64().ok_or_else(|| anyhow::anyhow!("not an integer"))?;
        Ok(json!(value * value))
    });
    let squared = graph.transform(&square, call).unwrap();
    assert_eq!(invoke(&graph, squared), [9, 25, 36, 100]);

    // Transformed values still correlate with their source.
    let call2 = graph
        .plan("plus", [("x", Binding::from(call)), ("y", Binding::from(squared))])
        .unwrap();
    assert_eq!(invoke(&graph, call2), [12, 30, 42, 110]);
}

#[test]
fn unions_concatenate_their_branches() {
    let mut graph = graph();
    let small = graph.source([1, 2]).unwrap();
    let large = graph.source([10]).unwrap();
    let union = graph.union([small, large]).unwrap();
    let call = graph.plan("identity", [("x", Binding::from(union))]).unwrap();
    assert_eq!(invoke(&graph, call), [1, 2, 10]);
    let twice = graph
        .plan("plus", [("x", Binding::from(union)), ("y", Binding::from(union))])
        .unwrap();
    assert_eq!(invoke(&graph, twice), [2, 4, 20]);
}

#[test]
fn defaults_and_optional_ports() {
    let mut graph = graph();
    let plain = graph.plan("scale", [("x", Binding::from(vec![1, 2]))]).unwrap();
    assert_eq!(invoke(&graph, plain), [2, 4]);
    let labelled = graph
        .plan(
            "scale",
            [
                ("x", Binding::from(json!(3))),
                ("factor", Binding::from(vec![1, 10])),
                ("label", Binding::from(json!("n"))),
            ],
        )
        .unwrap();
    assert_eq!(graph.invoke(labelled).unwrap(), [json!("n=3"), json!("n=30")]);
}

#[test]
fn empty_sources_produce_nothing() {
    let mut graph = graph();
    let call = graph
        .plan("plus", [("x", Binding::from(Vec::<Value>::new())), ("y", Binding::from(vec![1]))])
        .unwrap();
    assert!(graph.invoke(call).unwrap().is_empty());
}

#[test]
fn factorization_is_observation_invariant() {
    for factorize in [true, false] {
        let counter = Counter::default();
        let mut graph = PlanGraph::new(registry(&counter));
        let left = graph.plan("counted", [("x", Binding::from(vec![1, 2, 3]))]).unwrap();
        let right = graph.plan("counted", [("x", Binding::from(vec![1, 2, 3]))]).unwrap();
        let call = graph
            .plan("plus", [("x", Binding::from(left)), ("y", Binding::from(right))])
            .unwrap();

        let engine = Engine::new(EngineConfig::default().with_factorize(factorize)).unwrap();
        let values = ints(&engine.invoke(&graph, call).unwrap().values);
        assert_eq!(values, [2, 3, 4, 3, 4, 5, 4, 5, 6]);
        assert_eq!(counter.get(), if factorize { 3 } else { 6 });
    }
}

#[test]
fn factorization_keeps_copies_independent() {
    let counter = Counter::default();
    let mut graph = PlanGraph::new(registry(&counter));
    let plan1 = graph.plan("counted", [("x", Binding::from(vec![2, 3]))]).unwrap();
    let copy = graph.copy(plan1).unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(copy))])
        .unwrap();
    assert_eq!(invoke(&graph, call), [4, 5, 5, 6]);
    assert_eq!(counter.get(), 2);
}

#[test]
fn invocations_are_deterministic() {
    let mut graph = graph();
    let xs: Vec<i64> = (0..20).collect();
    let ys: Vec<i64> = (0..15).map(|y| y * 100).collect();
    let call = graph
        .plan("plus", [("x", Binding::from(xs.clone())), ("y", Binding::from(ys.clone()))])
        .unwrap();
    let expected: Vec<i64> = xs.iter().flat_map(|x| ys.iter().map(move |y| x + y)).collect();

    let engine = Engine::new(EngineConfig::default().with_workers(NonZeroUsize::new(4).unwrap())).unwrap();
    for _ in 0..5 {
        assert_eq!(ints(&engine.invoke(&graph, call).unwrap().values), expected);
    }
    assert_eq!(invoke(&graph, call), expected);
}

#[test]
fn fail_fast_reports_the_failing_combination() {
    let mut graph = graph();
    let call = graph
        .plan("div", [("x", Binding::from(vec![6])), ("y", Binding::from(vec![1, 0, 2]))])
        .unwrap();
    let Err(InvocationError::Element(failure)) = graph.invoke(call) else {
        panic!("expected an element failure");
    };
    assert_eq!(failure.node, call);
    assert_eq!(failure.task.as_deref(), Some("div"));
    assert_eq!(failure.element, 1);
    assert_eq!(failure.arguments.as_ref().unwrap().get("y"), Some(&json!(0)));
    assert!(matches!(failure.error, ElementError::TaskRun(_)));
    assert!(failure.to_string().contains("y=0"));
}

#[test]
fn best_effort_returns_partial_results() {
    let mut graph = graph();
    let call = graph
        .plan("div", [("x", Binding::from(vec![6])), ("y", Binding::from(vec![1, 0, 2]))])
        .unwrap();
    let halve = TransformFn::new(|value| match value.as_i64() {
        Some(value) if value % 2 == 0 => Ok(json!(value / 2)),
        _ => anyhow::bail!("{value} is odd"),
    });
    let halved = graph.transform(&halve, call).unwrap();

    let engine = Engine::new(EngineConfig::default().with_failure_policy(FailurePolicy::BestEffort)).unwrap();
    let outcome = engine.invoke(&graph, halved).unwrap();
    assert_eq!(ints(&outcome.values), [3]);
    assert_eq!(outcome.failures.len(), 2);
    assert!(matches!(outcome.failures[0].error, ElementError::TaskRun(_)));
    assert_eq!(outcome.failures[0].node, call);
    assert!(matches!(outcome.failures[1].error, ElementError::Transform(_)));
    assert_eq!(outcome.failures[1].node, halved);
    // 6 / 2 = 3 is the second surviving element of `call`.
    assert_eq!(outcome.failures[1].element, 1);
}

#[test]
fn missing_paths_are_element_failures() {
    let mut graph = graph();
    let call = graph.plan("wrap", [("x", Binding::from(vec![1]))]).unwrap();
    let missing = graph.project(call, "y").unwrap();
    assert!(matches!(
        graph.invoke(missing),
        Err(InvocationError::Element(failure))
            if matches!(failure.error, ElementError::PathNotFound { ref path, .. } if path == "y")
    ));
}

#[test]
fn build_errors_abort_construction() {
    let mut graph = graph();
    assert_eq!(
        graph.plan("nope", [("x", Binding::from(json!(1)))]).unwrap_err(),
        BuildError::UnknownTask("nope".into())
    );
    assert_eq!(
        graph.plan::<&str>("plus", [("x", Binding::from(json!(1)))]).unwrap_err(),
        BuildError::MissingRequiredPort {
            task: "plus".into(),
            port: "y".into()
        }
    );
    assert!(matches!(
        graph.plan("plus", [("x", Binding::from(json!("a"))), ("y", Binding::from(json!(1)))]),
        Err(BuildError::TypeMismatch { .. })
    ));
    let record = graph.plan("wrap", [("x", Binding::from(json!(1)))]).unwrap();
    assert!(matches!(
        graph.plan("plus", [("x", Binding::from(record)), ("y", Binding::from(json!(1)))]),
        Err(BuildError::TypeMismatch { ref found, .. }) if found == "record"
    ));

    let mut registry = TaskRegistry::new();
    registry.register("t", [int("x")], |p| p.require("x").cloned()).unwrap();
    assert_eq!(
        registry.register("t", [int("x")], |p| p.require("x").cloned()).unwrap_err(),
        BuildError::DuplicateTask("t".into())
    );
}

#[test]
fn join_mismatches_are_build_errors() {
    let mut graph = graph();
    let plan1 = graph.plan("identity", [("x", Binding::from(vec![1, 2]))]).unwrap();
    let other = graph.plan("identity", [("x", Binding::from(vec![3, 4]))]).unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(plan1)), ("y", Binding::from(other))])
        .unwrap();
    assert!(matches!(
        graph.join(call, plan1, [plan1, other]),
        Err(BuildError::JoinMismatch { .. })
    ));
    // Nothing was recorded: the plan still combines freely.
    assert_eq!(invoke(&graph, call), [4, 5, 5, 6]);
}

#[test]
fn explain_renders_the_realized_graph() {
    let mut graph = graph();
    let left = graph.plan("identity", [("x", Binding::from(vec![1]))]).unwrap();
    let right = graph.plan("identity", [("x", Binding::from(vec![1]))]).unwrap();
    let call = graph
        .plan("plus", [("x", Binding::from(left)), ("y", Binding::from(right))])
        .unwrap();
    let dot = Engine::default().explain(&graph, call).unwrap();
    assert!(dot.starts_with("digraph plan {"));
    assert!(dot.contains(&format!("n{} -> n{} [style=dashed];", left.index(), right.index())));
}
