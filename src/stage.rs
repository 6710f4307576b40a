use crate::{
    combine::Combinations,
    config::FailurePolicy,
    error::{ElementError, ElementFailure},
    optimizer::RealizedNode,
    plan::{PlanNode, TransformFn},
    registry::{PortSpec, TaskSpec},
    sync::{self, AtomicBool, Ordering},
    types::{HashMap, Item, NodeId, Origins, Value},
    value::{FieldPath, Params, ValueType},
};
use derive_more::Debug;
use std::sync::Arc;
use tracing::{trace, warn};

/// API available to stages during construction to declare the stages they
/// read from.
pub(crate) trait SetupApi {
    /// Subscribe to the output of `node` and receive a token to read it
    /// during `exec`.
    fn subscribe(&mut self, node: NodeId) -> Subscription;
}

/// API available to stages at execution time for reading parents' outputs.
pub(crate) trait ExecApi {
    /// Output of a parent previously subscribed to via [`SetupApi`].
    ///
    /// Only called once that parent has completed and published its output.
    fn read(&self, subscription: Subscription) -> &StageOutput;
}

/// Opaque handle representing a subscription to a parent stage's output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct Subscription(pub(crate) NodeId);

/// State shared by all stages of one invocation.
#[derive(Debug)]
pub(crate) struct ExecControl {
    policy: FailurePolicy,
    aborted: AtomicBool,
}

impl ExecControl {
    pub(crate) fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Logs a failed element and, when failing fast, aborts the invocation
    /// right away so that sibling elements stop running.
    fn observe<T>(&self, result: Result<T, ElementFailure>) -> Result<T, ElementFailure> {
        if let Err(failure) = &result {
            warn!(%failure, "element failed");
            if self.policy == FailurePolicy::FailFast {
                self.aborted.store(true, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Everything a stage produced: elements in enumeration order, plus the
/// elements that could not be produced.
#[derive(Debug, Default)]
pub(crate) struct StageOutput {
    pub(crate) items: Vec<Item>,
    pub(crate) failures: Vec<ElementFailure>,
}

/// Executable counterpart of a realized node.
#[derive(Debug)]
pub(crate) struct Stage {
    node: NodeId,
    kind: StageKind,
    #[debug(skip)]
    control: Arc<ExecControl>,
}

#[derive(Debug)]
enum StageKind {
    Source(Arc<[Value]>),
    Call {
        task: Arc<TaskSpec>,
        ports: Vec<BoundPort>,
        aliases: HashMap<NodeId, NodeId>,
    },
    Projection {
        input: Subscription,
        path: FieldPath,
    },
    Transform {
        input: Subscription,
        function: TransformFn,
    },
    Union(Vec<Subscription>),
    Alias {
        of: Subscription,
        relabel: HashMap<NodeId, NodeId>,
    },
}

#[derive(Debug)]
struct BoundPort {
    name: String,
    value_type: ValueType,
    input: Subscription,
}

impl Stage {
    pub(crate) fn setup(
        api: &mut impl SetupApi,
        node: NodeId,
        realized: &RealizedNode,
        control: Arc<ExecControl>,
    ) -> Self {
        let kind = match realized {
            RealizedNode::Compute(PlanNode::Source(source)) => StageKind::Source(Arc::clone(&source.values)),
            RealizedNode::Compute(PlanNode::Call(call)) => StageKind::Call {
                task: Arc::clone(call.task()),
                ports: call
                    .bindings()
                    .iter()
                    .map(|(name, &input)| BoundPort {
                        name: name.clone(),
                        value_type: call.task().port(name).map_or(ValueType::Any, PortSpec::value_type),
                        input: api.subscribe(input),
                    })
                    .collect(),
                aliases: call.join_aliases(),
            },
            RealizedNode::Compute(PlanNode::Projection(projection)) => StageKind::Projection {
                input: api.subscribe(projection.input()),
                path: projection.path().clone(),
            },
            RealizedNode::Compute(PlanNode::Transform(transform)) => StageKind::Transform {
                input: api.subscribe(transform.input()),
                function: transform.function.clone(),
            },
            RealizedNode::Compute(PlanNode::Union(union)) => {
                StageKind::Union(union.branches().iter().map(|&branch| api.subscribe(branch)).collect())
            }
            RealizedNode::Alias { of, relabel } => StageKind::Alias {
                of: api.subscribe(*of),
                relabel: relabel.iter().copied().collect(),
            },
        };
        Self { node, kind, control }
    }

    /// Produces this stage's output from its parents' outputs.
    ///
    /// Once the invocation is aborted, stages that have not started produce
    /// nothing and running stages stop invoking run bodies.
    pub(crate) fn exec(&self, api: &impl ExecApi) -> StageOutput {
        let Self { node, kind, control } = self;
        let node = *node;
        if control.is_aborted() {
            trace!(%node, "skipped stage of aborted invocation");
            return StageOutput::default();
        }
        let output = match kind {
            StageKind::Source(values) => StageOutput {
                items: values
                    .iter()
                    .enumerate()
                    .map(|(idx, value)| Item {
                        value: value.clone(),
                        origins: own_origin(&Origins::default(), node, idx),
                    })
                    .collect(),
                failures: vec![],
            },
            StageKind::Call { task, ports, aliases } => {
                let inputs: Vec<&[Item]> = ports.iter().map(|port| api.read(port.input).items.as_slice()).collect();
                let combinations = Combinations::new(&inputs, aliases).enumerate();
                let results = sync::map_ordered(
                    combinations.into_iter().enumerate().collect(),
                    |(idx, combination)| {
                        if control.is_aborted() {
                            return None;
                        }
                        let result = call_once(node, task, ports, &inputs, &combination.picks, idx);
                        Some(control.observe(result.map(|value| Item {
                            value,
                            origins: own_origin(&combination.origins, node, idx),
                        })))
                    },
                );
                collect(results.into_iter().flatten())
            }
            StageKind::Projection { input, path } => {
                let results = api.read(*input).items.iter().enumerate().map(|(idx, item)| {
                    control.observe(match path.resolve(&item.value) {
                        Some(value) => Ok(Item {
                            value: value.clone(),
                            origins: item.origins.clone(),
                        }),
                        None => Err(ElementFailure {
                            node,
                            task: None,
                            element: idx,
                            arguments: None,
                            error: ElementError::PathNotFound {
                                path: path.to_string(),
                                value: item.value.clone(),
                            },
                        }),
                    })
                });
                collect(results)
            }
            StageKind::Transform { input, function } => {
                let items = &api.read(*input).items;
                let results = sync::map_ordered(items.iter().enumerate().collect(), |(idx, item)| {
                    let result = function
                        .apply(&item.value)
                        .map(|value| Item {
                            value,
                            origins: item.origins.clone(),
                        })
                        .map_err(|error| ElementFailure {
                            node,
                            task: None,
                            element: idx,
                            arguments: None,
                            error: ElementError::Transform(error),
                        });
                    control.observe(result)
                });
                collect(results)
            }
            StageKind::Union(branches) => StageOutput {
                items: branches
                    .iter()
                    .flat_map(|&branch| &api.read(branch).items)
                    .enumerate()
                    .map(|(position, item)| Item {
                        value: item.value.clone(),
                        origins: own_origin(&item.origins, node, position),
                    })
                    .collect(),
                failures: vec![],
            },
            // Failures of the representative are reported there only.
            StageKind::Alias { of, relabel } => StageOutput {
                items: api
                    .read(*of)
                    .items
                    .iter()
                    .map(|item| Item {
                        value: item.value.clone(),
                        origins: item
                            .origins
                            .iter()
                            .map(|(key, &element)| (relabel.get(key).copied().unwrap_or(*key), element))
                            .collect(),
                    })
                    .collect(),
                failures: vec![],
            },
        };
        trace!(
            %node,
            produced = output.items.len(),
            failed = output.failures.len(),
            "stage done"
        );
        output
    }
}

fn own_origin(origins: &Origins, node: NodeId, element: usize) -> Origins {
    let mut origins = origins.clone();
    origins.insert(node, element);
    origins
}

fn call_once(
    node: NodeId,
    task: &TaskSpec,
    ports: &[BoundPort],
    inputs: &[&[Item]],
    picks: &[usize],
    element: usize,
) -> Result<Value, ElementFailure> {
    let failure = |arguments, error| ElementFailure {
        node,
        task: Some(task.id().to_owned()),
        element,
        arguments,
        error,
    };
    let mut params = Params::with_capacity(ports.len());
    for ((port, items), &pick) in ports.iter().zip(inputs).zip(picks) {
        let value = &items[pick].value;
        let Some(coerced) = port.value_type.coerce(value) else {
            let error = ElementError::ArgumentType {
                port: port.name.clone(),
                expected: port.value_type,
                found: value.clone(),
            };
            return Err(failure(Some(params), error));
        };
        params.insert(port.name.clone(), coerced);
    }
    match task.run(&params) {
        Ok(value) => Ok(value),
        Err(error) => Err(failure(Some(params), ElementError::TaskRun(error))),
    }
}

fn collect(results: impl IntoIterator<Item = Result<Item, ElementFailure>>) -> StageOutput {
    let mut output = StageOutput::default();
    for result in results {
        match result {
            Ok(item) => output.items.push(item),
            Err(failure) => output.failures.push(failure),
        }
    }
    output
}
