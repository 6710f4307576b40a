use crate::{
    error::BuildError,
    plan::{Binding, CallNode, PlanGraph, PlanNode},
    registry::{PortSpec, TaskSpec},
    types::{IndexMap, NodeId, Value},
};
use std::sync::Arc;
use tracing::debug;

impl PlanGraph {
    /// Binds the ports of `task` and returns the resulting call node.
    ///
    /// Literal bindings are wrapped in fresh source nodes. Unbound ports fall
    /// back to their default (wrapped the same way) or, when optional, stay
    /// absent. Nothing is added to the graph unless every binding is valid.
    ///
    /// # Errors
    /// [`BuildError::UnknownTask`], [`BuildError::UnknownPort`],
    /// [`BuildError::DuplicateBinding`], [`BuildError::MissingRequiredPort`],
    /// [`BuildError::TypeMismatch`] or [`BuildError::UnknownNode`].
    pub fn plan<K: AsRef<str>>(
        &mut self,
        task: &str,
        bindings: impl IntoIterator<Item = (K, Binding)>,
    ) -> Result<NodeId, BuildError> {
        let spec = Arc::clone(self.registry().lookup(task)?);

        let mut bound: IndexMap<String, Binding> = IndexMap::default();
        for (port, binding) in bindings {
            let port = port.as_ref();
            if spec.port(port).is_none() {
                return Err(BuildError::UnknownPort {
                    task: spec.id().to_owned(),
                    port: port.to_owned(),
                });
            }
            if bound.insert(port.to_owned(), binding).is_some() {
                return Err(BuildError::DuplicateBinding {
                    task: spec.id().to_owned(),
                    port: port.to_owned(),
                });
            }
        }

        // Validate everything first so a failing call leaves no stray sources.
        let mut resolved = Vec::with_capacity(spec.inputs().len());
        for (port, port_spec) in spec.inputs() {
            match bound.swap_remove(port) {
                Some(binding) => {
                    self.check_binding(&spec, port, port_spec, &binding)?;
                    resolved.push((port.clone(), binding));
                }
                None => match port_spec.default_value() {
                    Some(default) => resolved.push((port.clone(), Binding::Values(vec![default.clone()]))),
                    None if port_spec.is_optional() => {}
                    None => {
                        return Err(BuildError::MissingRequiredPort {
                            task: spec.id().to_owned(),
                            port: port.clone(),
                        });
                    }
                },
            }
        }

        let mut ports = IndexMap::with_capacity_and_hasher(resolved.len(), Default::default());
        for (port, binding) in resolved {
            let producer = match binding {
                Binding::Node(node) => node,
                Binding::Values(values) => self.source(values)?,
            };
            ports.insert(port, producer);
        }
        let id = self.push(PlanNode::Call(CallNode {
            task: Arc::clone(&spec),
            bindings: ports,
            joins: vec![],
        }))?;
        debug!(node = %id, task = spec.id(), "planned task call");
        Ok(id)
    }

    fn check_binding(
        &self,
        task: &TaskSpec,
        port: &str,
        port_spec: &PortSpec,
        binding: &Binding,
    ) -> Result<(), BuildError> {
        let expected = port_spec.value_type();
        let mismatch = |found: String| BuildError::TypeMismatch {
            task: task.id().to_owned(),
            port: port.to_owned(),
            expected,
            found,
        };
        let check_values = |values: &[Value]| {
            values
                .iter()
                .find(|value| expected.coerce(value).is_none())
                .map_or(Ok(()), |value| Err(mismatch(value.to_string())))
        };
        match binding {
            Binding::Values(values) => check_values(values.as_slice()),
            Binding::Node(node) => match self.node(*node)? {
                PlanNode::Source(source) => check_values(source.values()),
                _ => {
                    let found = self.static_type(*node);
                    if expected.accepts(found) {
                        Ok(())
                    } else {
                        Err(mismatch(found.to_string()))
                    }
                }
            },
        }
    }
}
