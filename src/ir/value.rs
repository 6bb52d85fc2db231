//! Constant values bound into qualifiers and partition keys.

use serde::{Deserialize, Serialize};
use smol_str::{format_smolstr, SmolStr};
use std::fmt::{self, Display, Formatter};

use crate::errors::{Action, Entity, PlannerError};

/// Scalar column types known to the planner.
#[derive(Serialize, Deserialize, PartialEq, Hash, Debug, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Boolean,
    Integer,
    Unsigned,
    Double,
    String,
    Any,
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::Boolean => write!(f, "boolean"),
            Type::Integer => write!(f, "integer"),
            Type::Unsigned => write!(f, "unsigned"),
            Type::Double => write!(f, "double"),
            Type::String => write!(f, "string"),
            Type::Any => write!(f, "any"),
        }
    }
}

impl Type {
    /// Average width in bytes used when the catalog has no better estimate.
    #[must_use]
    pub fn default_width(&self) -> f64 {
        match self {
            Type::Boolean => 1.0,
            Type::Integer | Type::Unsigned | Type::Double => 8.0,
            Type::String => 32.0,
            Type::Any => 16.0,
        }
    }

    /// Coercing distinct values of this type to `to` never yields equal
    /// results, so an equality on the coerced value pins the original one.
    #[must_use]
    pub fn casts_losslessly_to(self, to: Type) -> bool {
        self == to
            || matches!(
                (self, to),
                (_, Type::Any)
                    | (Type::Integer, Type::Unsigned)
                    | (Type::Unsigned, Type::Integer)
                    | (Type::Boolean | Type::Integer | Type::Unsigned, Type::String)
            )
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    Double(f64),
    String(SmolStr),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(SmolStr::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn get_type(&self) -> Option<Type> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(Type::Boolean),
            Value::Integer(_) => Some(Type::Integer),
            Value::Unsigned(_) => Some(Type::Unsigned),
            Value::Double(_) => Some(Type::Double),
            Value::String(_) => Some(Type::String),
        }
    }

    /// Coerce the value to the given type. Null stays null.
    ///
    /// # Errors
    /// - the value can't be represented in the target type
    pub fn cast(&self, to: Type) -> Result<Value, PlannerError> {
        let failed = || {
            PlannerError::FailedTo(
                Action::Cast,
                Some(Entity::Value),
                format_smolstr!("{self} to {to}"),
            )
        };
        let v = match (self, to) {
            (Value::Null, _) | (_, Type::Any) => self.clone(),
            (Value::Boolean(_), Type::Boolean)
            | (Value::Integer(_), Type::Integer)
            | (Value::Unsigned(_), Type::Unsigned)
            | (Value::Double(_), Type::Double)
            | (Value::String(_), Type::String) => self.clone(),
            (Value::Integer(v), Type::Unsigned) => {
                Value::Unsigned(u64::try_from(*v).map_err(|_| failed())?)
            }
            (Value::Unsigned(v), Type::Integer) => {
                Value::Integer(i64::try_from(*v).map_err(|_| failed())?)
            }
            #[allow(clippy::cast_precision_loss)]
            (Value::Integer(v), Type::Double) => Value::Double(*v as f64),
            #[allow(clippy::cast_precision_loss)]
            (Value::Unsigned(v), Type::Double) => Value::Double(*v as f64),
            #[allow(clippy::cast_possible_truncation)]
            (Value::Double(v), Type::Integer) if v.fract() == 0.0 && v.is_finite() => {
                Value::Integer(*v as i64)
            }
            (Value::String(s), Type::Integer) => {
                Value::Integer(s.trim().parse::<i64>().map_err(|_| failed())?)
            }
            (Value::String(s), Type::Unsigned) => {
                Value::Unsigned(s.trim().parse::<u64>().map_err(|_| failed())?)
            }
            (Value::String(s), Type::Double) => {
                Value::Double(s.trim().parse::<f64>().map_err(|_| failed())?)
            }
            (Value::String(s), Type::Boolean) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Value::Boolean(true),
                "false" | "f" | "0" => Value::Boolean(false),
                _ => return Err(failed()),
            },
            (Value::Boolean(v), Type::String) => Value::String(format_smolstr!("{v}")),
            (Value::Integer(v), Type::String) => Value::String(format_smolstr!("{v}")),
            (Value::Unsigned(v), Type::String) => Value::String(format_smolstr!("{v}")),
            (Value::Double(v), Type::String) => Value::String(format_smolstr!("{v}")),
            _ => return Err(failed()),
        };
        Ok(v)
    }

    /// Canonical byte representation fed to the distribution hash.
    /// Integer values are encoded identically whatever their signedness,
    /// so `1::integer` and `1::unsigned` land on the same node.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn hash_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Boolean(v) => vec![u8::from(*v)],
            Value::Integer(v) => v.to_le_bytes().to_vec(),
            Value::Unsigned(v) => match i64::try_from(*v) {
                Ok(i) => i.to_le_bytes().to_vec(),
                Err(_) => v.to_le_bytes().to_vec(),
            },
            Value::Double(v) => {
                if v.fract() == 0.0 && v.abs() < 9.0e15 {
                    (*v as i64).to_le_bytes().to_vec()
                } else {
                    v.to_bits().to_le_bytes().to_vec()
                }
            }
            Value::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Integer view of the value used by modulo distribution.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Integer(v) => Some(i128::from(*v)),
            Value::Unsigned(v) => Some(i128::from(*v)),
            Value::Boolean(v) => Some(i128::from(u8::from(*v))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cast_values() {
        assert_eq!(Value::from(5).cast(Type::Unsigned).unwrap(), Value::Unsigned(5));
        assert_eq!(
            Value::from("42").cast(Type::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(Value::Null.cast(Type::Integer).unwrap(), Value::Null);
        assert!(Value::from(-1).cast(Type::Unsigned).is_err());
        assert!(Value::Double(1.5).cast(Type::Integer).is_err());
        assert_eq!(
            Value::Double(3.0).cast(Type::Integer).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn hash_bytes_ignore_integer_signedness() {
        assert_eq!(
            Value::Integer(7).hash_bytes(),
            Value::Unsigned(7).hash_bytes()
        );
        assert_eq!(Value::Integer(7).hash_bytes(), Value::Double(7.0).hash_bytes());
        assert_ne!(Value::Integer(7).hash_bytes(), Value::from("7").hash_bytes());
    }

    #[test]
    fn lossless_coercions() {
        assert!(Type::Integer.casts_losslessly_to(Type::String));
        assert!(Type::Unsigned.casts_losslessly_to(Type::Integer));
        assert!(Type::String.casts_losslessly_to(Type::String));
        // '07' and '7' both become 7
        assert!(!Type::String.casts_losslessly_to(Type::Integer));
        assert!(!Type::Double.casts_losslessly_to(Type::Integer));
        assert!(!Type::Integer.casts_losslessly_to(Type::Double));
    }
}
