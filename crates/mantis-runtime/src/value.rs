//! Runtime values.

use std::fmt;

use smol_str::SmolStr;

/// A value held in frame locals or on the evaluation stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Interned string.
    Str(SmolStr),
    /// Absence of a value (implicit return, unset slot).
    Nil,
}

impl Value {
    /// Truthiness as used by breakpoint conditions and tests.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(value) => *value != 0,
            Value::Bool(value) => *value,
            Value::Str(value) => !value.is_empty(),
            Value::Nil => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "'{value}'"),
            Value::Nil => write!(f, "nil"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_value_content() {
        assert!(Value::Int(1).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Str("x".into()).is_truthy());
        assert!(!Value::Str("".into()).is_truthy());
        assert!(!Value::Nil.is_truthy());
    }
}
