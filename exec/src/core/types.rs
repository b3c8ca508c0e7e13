use std::fmt::{Display, Formatter};

/// Declared type of an expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Boolean,
    Integer,
    Real,
    String,
    BooleanArray,
    IntegerArray,
    RealArray,
    StringArray,
    NodeState,
    NodeOutcome,
    FailureType,
    CommandHandle,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Real)
    }

    pub fn is_array(self) -> bool {
        self.element_type().is_some()
    }

    pub fn element_type(self) -> Option<ValueType> {
        match self {
            ValueType::BooleanArray => Some(ValueType::Boolean),
            ValueType::IntegerArray => Some(ValueType::Integer),
            ValueType::RealArray => Some(ValueType::Real),
            ValueType::StringArray => Some(ValueType::String),
            _ => None,
        }
    }

    pub fn array_of(element: ValueType) -> Option<ValueType> {
        match element {
            ValueType::Boolean => Some(ValueType::BooleanArray),
            ValueType::Integer => Some(ValueType::IntegerArray),
            ValueType::Real => Some(ValueType::RealArray),
            ValueType::String => Some(ValueType::StringArray),
            _ => None,
        }
    }

    /// May a value of type `source` be read through an access of type
    /// `self`? Integer widens to Real; no other implicit conversion exists.
    pub fn readable_from(self, source: ValueType) -> bool {
        self == source || (self == ValueType::Real && source == ValueType::Integer)
    }

    /// May a value of type `source` be assigned to a variable declared as
    /// `self`? Same rule as reading: widening only.
    pub fn assignable_from(self, source: ValueType) -> bool {
        self.readable_from(source)
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::Boolean => "Boolean",
            ValueType::Integer => "Integer",
            ValueType::Real => "Real",
            ValueType::String => "String",
            ValueType::BooleanArray => "BooleanArray",
            ValueType::IntegerArray => "IntegerArray",
            ValueType::RealArray => "RealArray",
            ValueType::StringArray => "StringArray",
            ValueType::NodeState => "NodeState",
            ValueType::NodeOutcome => "NodeOutcome",
            ValueType::FailureType => "FailureType",
            ValueType::CommandHandle => "CommandHandle",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening() {
        assert!(ValueType::Real.readable_from(ValueType::Integer));
        assert!(!ValueType::Integer.readable_from(ValueType::Real));
        assert!(!ValueType::Real.readable_from(ValueType::Boolean));
        assert!(ValueType::Boolean.readable_from(ValueType::Boolean));
    }

    #[test]
    fn array_element_types() {
        assert_eq!(ValueType::IntegerArray.element_type(), Some(ValueType::Integer));
        assert_eq!(ValueType::array_of(ValueType::String), Some(ValueType::StringArray));
        assert_eq!(ValueType::array_of(ValueType::NodeState), None);
        assert!(!ValueType::Integer.is_array());
    }
}
