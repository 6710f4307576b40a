use crate::{error::BuildError, types::IndexMap, types::Value};
use anyhow::anyhow;
use core::{fmt, str::FromStr};
use derive_more::Display;
use serde::Deserialize;

/// Declared type of a task input port (or of a task output).
///
/// `Any` is compatible with everything; the remaining variants follow the
/// shape of a JSON value. Integers and floats coerce into each other when no
/// precision is lost.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Accepts any value.
    #[default]
    #[display("any")]
    Any,
    /// Whole number.
    #[display("integer")]
    Integer,
    /// Floating point number.
    #[display("float")]
    Float,
    /// `true` or `false`.
    #[display("boolean")]
    Boolean,
    /// Text.
    #[display("string")]
    String,
    /// Mapping from field name to value.
    #[display("record")]
    Record,
    /// Ordered list of values.
    #[display("list")]
    List,
}

impl ValueType {
    /// The narrowest type describing `value`.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Boolean,
            Value::Number(number) if number.is_f64() => Self::Float,
            Value::Number(_) => Self::Integer,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::List,
            Value::Object(_) => Self::Record,
        }
    }

    /// Whether a producer statically typed `found` may feed a port of this
    /// type. Numeric conversions are checked again per value at run time.
    #[must_use]
    pub fn accepts(self, found: Self) -> bool {
        match (self, found) {
            (Self::Any, _)
            | (_, Self::Any)
            | (Self::Integer, Self::Float)
            | (Self::Float, Self::Integer) => true,
            (expected, found) => expected == found,
        }
    }

    /// Converts `value` to this type, or `None` if it cannot be represented.
    #[must_use]
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match self {
            Self::Any => Some(value.clone()),
            Self::Integer => match value {
                Value::Number(number) if number.is_i64() || number.is_u64() => Some(value.clone()),
                Value::Number(number) => number.as_f64().and_then(integral).map(Value::from),
                _ => None,
            },
            Self::Float => value.as_f64().map(Value::from),
            Self::Boolean => value.is_boolean().then(|| value.clone()),
            Self::String => value.is_string().then(|| value.clone()),
            Self::Record => value.is_object().then(|| value.clone()),
            Self::List => value.is_array().then(|| value.clone()),
        }
    }
}

/// 2^63, the first float above `i64::MAX`.
const I64_END: f64 = 9_223_372_036_854_775_808.0;

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral(float: f64) -> Option<i64> {
    let in_range = (-I64_END..I64_END).contains(&float);
    (in_range && float.fract() == 0.0).then_some(float as i64)
}

impl FromStr for ValueType {
    type Err = BuildError;

    /// Parses a type name, optionally namespaced (`xs:integer`, `xp:integer`).
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let local = name.rsplit_once(':').map_or(name, |(_, local)| local);
        let value_type = match local.to_ascii_lowercase().as_str() {
            "any" | "anytype" | "item" => Self::Any,
            "integer" | "int" | "long" | "short" => Self::Integer,
            "float" | "double" | "decimal" | "real" => Self::Float,
            "boolean" | "bool" => Self::Boolean,
            "string" | "token" => Self::String,
            "record" | "object" | "map" => Self::Record,
            "list" | "array" | "sequence" => Self::List,
            _ => return Err(BuildError::UnknownValueType(name.to_owned())),
        };
        Ok(value_type)
    }
}

/// Dotted path addressing a field of a structured task output, e.g. `a.x`.
///
/// Numeric segments index into lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Walks the path through `value`.
    #[must_use]
    pub fn resolve<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        self.0.iter().try_fold(value, |current, segment| match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(elements) => segment.parse::<usize>().ok().and_then(|idx| elements.get(idx)),
            _ => None,
        })
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromStr for FieldPath {
    type Err = BuildError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(BuildError::InvalidPath(path.to_owned()));
        }
        Ok(Self(segments))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Fully resolved argument tuple handed to a task's run body, in the task's
/// declared port order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(IndexMap<String, Value>);

impl Params {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity_and_hasher(capacity, Default::default()))
    }

    pub(crate) fn insert(&mut self, port: String, value: Value) {
        self.0.insert(port, value);
    }

    /// Value bound to `port`, if any.
    #[must_use]
    pub fn get(&self, port: &str) -> Option<&Value> {
        self.0.get(port)
    }

    /// Value bound to `port`.
    ///
    /// # Errors
    /// If the port is absent (an unbound optional port).
    pub fn require(&self, port: &str) -> anyhow::Result<&Value> {
        self.get(port).ok_or_else(|| anyhow!("missing parameter `{port}`"))
    }

    /// Integer bound to `port`.
    ///
    /// # Errors
    /// If the port is absent or not an integer.
    pub fn integer(&self, port: &str) -> anyhow::Result<i64> {
        let value = self.require(port)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow!("parameter `{port}` is not an integer: {value}"))
    }

    /// Number bound to `port`, as a float.
    ///
    /// # Errors
    /// If the port is absent or not a number.
    pub fn float(&self, port: &str) -> anyhow::Result<f64> {
        let value = self.require(port)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow!("parameter `{port}` is not a number: {value}"))
    }

    /// String bound to `port`.
    ///
    /// # Errors
    /// If the port is absent or not a string.
    pub fn string(&self, port: &str) -> anyhow::Result<&str> {
        let value = self.require(port)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("parameter `{port}` is not a string: {value}"))
    }

    /// Port/value pairs in declared port order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(port, value)| (port.as_str(), value))
    }

    /// Number of bound ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no port is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (port, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{port}={value}")?;
        }
        Ok(())
    }
}
