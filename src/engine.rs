use crate::{
    config::{EngineConfig, FailurePolicy},
    error::{ElementFailure, InvocationError},
    executor::Executor,
    optimizer::{Optimizer, RealizedGraph},
    plan::PlanGraph,
    stage::ExecControl,
    types::{NodeId, Value},
};
use std::sync::Arc;
use tracing::{debug_span, info};

/// Result of a best-effort invocation.
#[derive(Debug)]
pub struct Outcome {
    /// Produced values of the root, in combination enumeration order.
    pub values: Vec<Value>,
    /// Elements that could not be produced, in topological order.
    pub failures: Vec<ElementFailure>,
}

impl Outcome {
    /// Whether every element was produced.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Drops the failures.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Evaluates plan graphs.
///
/// An engine holds no per-invocation state and can serve concurrent
/// invocations, including of the same graph.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    #[cfg(not(feature = "loom"))]
    pool: Option<rayon::ThreadPool>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            #[cfg(not(feature = "loom"))]
            pool: None,
        }
    }
}

impl Engine {
    /// An engine running with `config`.
    ///
    /// # Errors
    /// [`InvocationError::WorkerPool`] if a dedicated pool was requested and
    /// cannot be started.
    pub fn new(config: EngineConfig) -> Result<Self, InvocationError> {
        #[cfg(not(feature = "loom"))]
        let pool = match config.workers {
            Some(workers) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers.get())
                    .thread_name(|idx| format!("planweave-worker-{idx}"))
                    .build()?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            #[cfg(not(feature = "loom"))]
            pool,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The optimizer invocations go through.
    #[must_use]
    pub fn optimizer(&self) -> Optimizer {
        Optimizer::new(self.config.factorize)
    }

    /// Realizes `root` without running anything.
    ///
    /// # Errors
    /// [`InvocationError::Build`] if `root` is not a node of `graph`.
    pub fn realize(&self, graph: &PlanGraph, root: NodeId) -> Result<RealizedGraph, InvocationError> {
        Ok(self.optimizer().realize(graph, root)?)
    }

    /// GraphViz rendering of what invoking `root` would run.
    ///
    /// # Errors
    /// Same as [`Engine::realize`].
    pub fn explain(&self, graph: &PlanGraph, root: NodeId) -> Result<String, InvocationError> {
        Ok(self.realize(graph, root)?.to_dot())
    }

    /// Evaluates `root` and returns its values in combination enumeration
    /// order.
    ///
    /// Every invocation recomputes the whole realized graph; nothing is cached
    /// across invocations.
    ///
    /// # Errors
    /// [`InvocationError::Build`] for a foreign root, and
    /// [`InvocationError::Element`] with the first failure (in topological
    /// order) under [`FailurePolicy::FailFast`]. Under
    /// [`FailurePolicy::BestEffort`] element failures are returned in the
    /// [`Outcome`] instead.
    pub fn invoke(&self, graph: &PlanGraph, root: NodeId) -> Result<Outcome, InvocationError> {
        let span = debug_span!("invoke", %root);
        let _entered = span.enter();

        let realized = self.realize(graph, root)?;
        let control = Arc::new(ExecControl::new(self.config.failure_policy));
        let executor = Executor::setup(&realized, &control);
        let executor = self.run(executor);

        let mut values = vec![];
        let mut failures = vec![];
        for (node, output) in executor.into_outputs() {
            if node == root {
                values = output.items.into_iter().map(|item| item.value).collect();
            }
            failures.extend(output.failures);
        }
        if self.config.failure_policy == FailurePolicy::FailFast {
            if let Some(failure) = failures.into_iter().next() {
                return Err(failure.into());
            }
            failures = vec![];
        }
        info!(
            %root,
            stages = realized.len(),
            merged = realized.merged(),
            values = values.len(),
            failures = failures.len(),
            "invocation complete"
        );
        Ok(Outcome { values, failures })
    }

    #[cfg(not(feature = "loom"))]
    fn run(&self, executor: Executor) -> Executor {
        match &self.pool {
            Some(pool) => pool.install(|| executor.execute()),
            None => executor.execute(),
        }
    }

    #[cfg(feature = "loom")]
    #[allow(clippy::unused_self)]
    fn run(&self, executor: Executor) -> Executor {
        executor.execute()
    }
}

impl PlanGraph {
    /// Evaluates `root` with a default engine: fail-fast, factorized, on the
    /// global rayon pool.
    ///
    /// # Errors
    /// Same as [`Engine::invoke`].
    pub fn invoke(&self, root: NodeId) -> Result<Vec<Value>, InvocationError> {
        Engine::default().invoke(self, root).map(Outcome::into_values)
    }
}
