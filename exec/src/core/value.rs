use crate::core::{CommandHandle, FailureType, NodeOutcome, NodeState, ValueType};
use std::fmt::{Display, Formatter};

/// An array with a per-element known flag. The length is fixed at creation;
/// elements start unknown.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue<T> {
    elems: Vec<Option<T>>,
}

impl<T: Clone> ArrayValue<T> {
    pub fn unknown(len: usize) -> Self {
        ArrayValue {
            elems: vec![None; len],
        }
    }

    pub fn from_elems(elems: Vec<Option<T>>) -> Self {
        ArrayValue { elems }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// None on out-of-bounds or unknown element.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.elems.get(index).and_then(|e| e.as_ref())
    }

    /// False if `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: T) -> bool {
        match self.elems.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn set_unknown(&mut self, index: usize) -> bool {
        match self.elems.get_mut(index) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn all_known(&self) -> bool {
        self.elems.iter().all(|e| e.is_some())
    }

    pub fn any_known(&self) -> bool {
        self.elems.iter().any(|e| e.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&T>> {
        self.elems.iter().map(|e| e.as_ref())
    }
}

/// The result of reading an expression: a typed payload or Unknown.
///
/// `PartialEq` is the change-detection equality: `Unknown == Unknown`, so
/// overwriting an unknown variable with unknown publishes nothing. It is
/// *not* the language-level `EQ` operator, which returns unknown when either
/// side is unknown (see the operator catalog).
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Unknown,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    BooleanArray(ArrayValue<bool>),
    IntegerArray(ArrayValue<i32>),
    RealArray(ArrayValue<f64>),
    StringArray(ArrayValue<String>),
    NodeState(NodeState),
    NodeOutcome(NodeOutcome),
    FailureType(FailureType),
    CommandHandle(CommandHandle),
}

impl Value {
    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown)
    }

    /// The type of a known value; Unknown has none.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Unknown => None,
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Real(_) => Some(ValueType::Real),
            Value::String(_) => Some(ValueType::String),
            Value::BooleanArray(_) => Some(ValueType::BooleanArray),
            Value::IntegerArray(_) => Some(ValueType::IntegerArray),
            Value::RealArray(_) => Some(ValueType::RealArray),
            Value::StringArray(_) => Some(ValueType::StringArray),
            Value::NodeState(_) => Some(ValueType::NodeState),
            Value::NodeOutcome(_) => Some(ValueType::NodeOutcome),
            Value::FailureType(_) => Some(ValueType::FailureType),
            Value::CommandHandle(_) => Some(ValueType::CommandHandle),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer widens to Real.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node_state(&self) -> Option<NodeState> {
        match self {
            Value::NodeState(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_command_handle(&self) -> Option<CommandHandle> {
        match self {
            Value::CommandHandle(h) => Some(*h),
            _ => None,
        }
    }

    /// Numeric equality across the Integer/Real divide; everything else is
    /// plain equality. Unknown compared to anything (including Unknown) is
    /// None, matching the EQ operator's tri-state contract.
    pub fn eq_value(&self, other: &Value) -> Option<bool> {
        if !self.is_known() || !other.is_known() {
            return None;
        }
        match (self, other) {
            (Value::Integer(a), Value::Real(b)) => Some(*a as f64 == *b),
            (Value::Real(a), Value::Integer(b)) => Some(*a == *b as f64),
            (a, b) => Some(a == b),
        }
    }

    pub fn unknown_array(element: ValueType, len: usize) -> Option<Value> {
        match element {
            ValueType::Boolean => Some(Value::BooleanArray(ArrayValue::unknown(len))),
            ValueType::Integer => Some(Value::IntegerArray(ArrayValue::unknown(len))),
            ValueType::Real => Some(Value::RealArray(ArrayValue::unknown(len))),
            ValueType::String => Some(Value::StringArray(ArrayValue::unknown(len))),
            _ => None,
        }
    }

    /// Length of an array value.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Value::BooleanArray(a) => Some(a.len()),
            Value::IntegerArray(a) => Some(a.len()),
            Value::RealArray(a) => Some(a.len()),
            Value::StringArray(a) => Some(a.len()),
            _ => None,
        }
    }

    /// Element `index` of an array value; Unknown on unknown element or
    /// out-of-bounds access.
    pub fn array_element(&self, index: usize) -> Option<Value> {
        match self {
            Value::BooleanArray(a) => Some(a.get(index).map(|b| Value::Boolean(*b)).unwrap_or(Value::Unknown)),
            Value::IntegerArray(a) => Some(a.get(index).map(|i| Value::Integer(*i)).unwrap_or(Value::Unknown)),
            Value::RealArray(a) => Some(a.get(index).map(|r| Value::Real(*r)).unwrap_or(Value::Unknown)),
            Value::StringArray(a) => Some(a.get(index).map(|s| Value::String(s.clone())).unwrap_or(Value::Unknown)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}
impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<NodeState> for Value {
    fn from(s: NodeState) -> Self {
        Value::NodeState(s)
    }
}
impl From<CommandHandle> for Value {
    fn from(h: CommandHandle) -> Self {
        Value::CommandHandle(h)
    }
}

fn fmt_array<T: Display>(f: &mut Formatter<'_>, elems: impl Iterator<Item = Option<T>>) -> std::fmt::Result {
    write!(f, "#(")?;
    for (i, e) in elems.enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        match e {
            Some(v) => write!(f, "{v}")?,
            None => write!(f, "UNKNOWN")?,
        }
    }
    write!(f, ")")
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unknown => write!(f, "UNKNOWN"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::BooleanArray(a) => fmt_array(f, a.iter().map(|e| e.copied())),
            Value::IntegerArray(a) => fmt_array(f, a.iter().map(|e| e.copied())),
            Value::RealArray(a) => fmt_array(f, a.iter().map(|e| e.copied())),
            Value::StringArray(a) => fmt_array(f, a.iter().map(|e| e.cloned())),
            Value::NodeState(s) => write!(f, "{s}"),
            Value::NodeOutcome(o) => write!(f, "{o}"),
            Value::FailureType(t) => write!(f, "{t}"),
            Value::CommandHandle(h) => write!(f, "{h}"),
        }
    }
}
