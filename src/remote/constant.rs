//! Serializable constant values and query arguments.

use crate::remote::descriptor::TypeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by a constant node, a query argument or a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    /// Underlying value of an enum plus the enum type
    Enum { ty: TypeId, value: i64 },
    /// Record or anonymous object flattened to name/value pairs
    Object(DynamicObject),
    List(Vec<ConstantValue>),
}

impl ConstantValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ConstantValue::Null)
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Null => write!(f, "null"),
            ConstantValue::Bool(b) => write!(f, "{}", b),
            ConstantValue::Int32(v) => write!(f, "{}", v),
            ConstantValue::Int64(v) => write!(f, "{}L", v),
            ConstantValue::Float64(v) => write!(f, "{:?}", v),
            ConstantValue::String(s) => write!(f, "{:?}", s),
            ConstantValue::Enum { ty, value } => write!(f, "#{}({})", ty.0, value),
            ConstantValue::Object(o) => {
                write!(f, "{{")?;
                for (i, p) in o.properties.iter().enumerate() {
                    let sep = if i > 0 { ", " } else { " " };
                    write!(f, "{}{} = {}", sep, p.name, p.value)?;
                }
                write!(f, " }}")
            }
            ConstantValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Structural stand-in for a record that may not be nameable on the
/// receiving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    pub ty: Option<TypeId>,
    pub properties: Vec<DynamicProperty>,
}

impl DynamicObject {
    pub fn get(&self, name: &str) -> Option<&ConstantValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicProperty {
    pub name: String,
    pub value: ConstantValue,
}

/// Index into [`RemoteExpression::arguments`](crate::remote::RemoteExpression)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentId(pub u32);

impl ArgumentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Runtime value captured by the query, serialized independently of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryArgument {
    pub name: Option<String>,
    pub ty: TypeId,
    pub value: ConstantValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_object_lookup() {
        let object = DynamicObject {
            ty: None,
            properties: vec![
                DynamicProperty {
                    name: "Id".to_string(),
                    value: ConstantValue::Int32(4),
                },
                DynamicProperty {
                    name: "Name".to_string(),
                    value: ConstantValue::String("lamp".to_string()),
                },
            ],
        };
        assert_eq!(object.get("Id"), Some(&ConstantValue::Int32(4)));
        assert_eq!(object.get("Price"), None);
        assert_eq!(
            ConstantValue::Object(object).to_string(),
            "{ Id = 4, Name = \"lamp\" }"
        );
    }
}
