use crate::{
    error::BuildError,
    types::{IndexMap, Value},
    value::{Params, ValueType},
};
use derive_more::Debug;
use indexmap::map::Entry;
use std::sync::Arc;
use tracing::debug;

/// A task's computation body: maps a fully resolved parameter tuple to an
/// output value.
///
/// Run bodies may be invoked concurrently from several worker threads.
pub type RunBody = Arc<dyn Fn(&Params) -> anyhow::Result<Value> + Send + Sync>;

/// Declaration of a single task input port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortSpec {
    value_type: ValueType,
    default: Option<Value>,
    optional: bool,
    documentation: Option<String>,
}

impl PortSpec {
    /// A required port of the given type.
    #[must_use]
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            ..Self::default()
        }
    }

    /// Value used when the port is left unbound.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Allows the port to stay unbound; it is then absent from [`Params`].
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Attaches human readable documentation.
    #[must_use]
    pub fn documented(mut self, documentation: impl Into<String>) -> Self {
        self.documentation = Some(documentation.into());
        self
    }

    /// Declared type.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Default value, if any.
    #[must_use]
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Whether the port may stay unbound without a default.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Whether a binding is mandatory.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.default.is_none() && !self.optional
    }

    /// Documentation, if any.
    #[must_use]
    pub fn documentation(&self) -> Option<&str> {
        self.documentation.as_deref()
    }
}

/// A registered task: identifier, ordered input ports, output type and run
/// body. Immutable once registered.
#[derive(Debug)]
pub struct TaskSpec {
    id: String,
    inputs: IndexMap<String, PortSpec>,
    output: ValueType,
    #[debug(skip)]
    run: RunBody,
}

impl TaskSpec {
    /// A task without inputs, producing values of any type.
    pub fn new(
        id: impl Into<String>,
        run: impl Fn(&Params) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            inputs: IndexMap::default(),
            output: ValueType::Any,
            run: Arc::new(run),
        }
    }

    /// Declares an input port. Ports are enumerated in declaration order,
    /// the last declared one varying fastest.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, port: PortSpec) -> Self {
        self.inputs.insert(name.into(), port);
        self
    }

    /// Declares the type of the values the run body returns.
    #[must_use]
    pub fn output(mut self, value_type: ValueType) -> Self {
        self.output = value_type;
        self
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Input ports in declaration order.
    #[must_use]
    pub fn inputs(&self) -> &IndexMap<String, PortSpec> {
        &self.inputs
    }

    /// A single input port.
    #[must_use]
    pub fn port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.get(name)
    }

    /// Declared output type.
    #[must_use]
    pub fn output_type(&self) -> ValueType {
        self.output
    }

    /// Invokes the run body.
    ///
    /// # Errors
    /// Whatever the run body reports.
    pub fn run(&self, params: &Params) -> anyhow::Result<Value> {
        (self.run)(params)
    }

    fn validate(&self) -> Result<(), BuildError> {
        for (port, spec) in &self.inputs {
            let Some(default) = spec.default_value() else {
                continue;
            };
            if spec.value_type().coerce(default).is_none() {
                return Err(BuildError::TypeMismatch {
                    task: self.id.clone(),
                    port: port.clone(),
                    expected: spec.value_type(),
                    found: default.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Maps task identifiers to their specifications.
///
/// Mutated only while registering; wrap it in an `Arc` afterwards and share it
/// between plan graphs and concurrent invocations.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: IndexMap<String, Arc<TaskSpec>>,
}

impl TaskRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task from its identifier, input ports and run body.
    ///
    /// # Errors
    /// [`BuildError::DuplicateTask`] if `id` is taken, and
    /// [`BuildError::TypeMismatch`] if a default does not fit its port.
    pub fn register<K: Into<String>>(
        &mut self,
        id: impl Into<String>,
        inputs: impl IntoIterator<Item = (K, PortSpec)>,
        run: impl Fn(&Params) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Result<Arc<TaskSpec>, BuildError> {
        let spec = inputs
            .into_iter()
            .fold(TaskSpec::new(id, run), |spec, (name, port)| spec.input(name, port));
        self.insert(spec)
    }

    /// Registers a fully built task specification.
    ///
    /// # Errors
    /// Same as [`TaskRegistry::register`].
    pub fn insert(&mut self, spec: TaskSpec) -> Result<Arc<TaskSpec>, BuildError> {
        spec.validate()?;
        match self.tasks.entry(spec.id.clone()) {
            Entry::Occupied(entry) => Err(BuildError::DuplicateTask(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(task = spec.id(), ports = spec.inputs.len(), "registered task");
                Ok(Arc::clone(entry.insert(Arc::new(spec))))
            }
        }
    }

    /// Looks a task up by identifier.
    ///
    /// # Errors
    /// [`BuildError::UnknownTask`] if nothing is registered under `id`.
    pub fn lookup(&self, id: &str) -> Result<&Arc<TaskSpec>, BuildError> {
        self.tasks
            .get(id)
            .ok_or_else(|| BuildError::UnknownTask(id.to_owned()))
    }

    /// Registered identifiers in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
