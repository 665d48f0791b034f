//! Runtime values and data sources.

use crate::expression::{Expression, ExpressionError, ExpressionResult};
use crate::types::{NamedType, Type};
use crate::{QueryError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Values produced and consumed by expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Enum(EnumValue),
    Record(Record),
    /// Arrays and materialized sequences
    List(Vec<Value>),
    Queryable(QueryableValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Short variant name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Enum(_) => "enum",
            Value::Record(_) => "record",
            Value::List(_) => "list",
            Value::Queryable(_) => "queryable",
        }
    }

    /// Default value of a type: zero for numbers, false, otherwise null
    pub fn default_of(ty: &Type) -> Value {
        match ty {
            Type::Primitive(p) => match p {
                crate::types::PrimitiveType::Bool => Value::Bool(false),
                crate::types::PrimitiveType::Int32 => Value::Int32(0),
                crate::types::PrimitiveType::Int64 => Value::Int64(0),
                crate::types::PrimitiveType::Float64 => Value::Float64(0.0),
                crate::types::PrimitiveType::String | crate::types::PrimitiveType::Object => {
                    Value::Null
                }
            },
            Type::Named(named) if named.def().is_enum() => Value::Enum(EnumValue {
                ty: named.clone(),
                value: 0,
            }),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}L", v),
            Value::Float64(v) => write!(f, "{:?}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Enum(e) => match e.ty.def().enum_variant(e.value) {
                Some(variant) => write!(f, "{}.{}", e.ty.def().name(), variant),
                None => write!(f, "{}({})", e.ty, e.value),
            },
            Value::Record(r) => {
                write!(f, "{{")?;
                for (i, (name, value)) in r.iter().enumerate() {
                    let sep = if i > 0 { ", " } else { " " };
                    write!(f, "{}{} = {}", sep, name, value)?;
                }
                write!(f, " }}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Queryable(q) => match q {
                QueryableValue::Resource { element_type, .. } => {
                    write!(f, "Resource<{}>", element_type)
                }
                QueryableValue::Query { expression, .. } => write!(f, "{}", expression),
                QueryableValue::Data(data) => write!(f, "Data<{}>", data.element_type()),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub ty: NamedType,
    pub value: i64,
}

/// Instance of a record or anonymous type; fields follow declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    ty: NamedType,
    fields: Vec<Value>,
}

impl Record {
    pub fn new(ty: NamedType, fields: Vec<Value>) -> ExpressionResult<Self> {
        let expected = ty.def().properties().len();
        if fields.len() != expected {
            return Err(ExpressionError::ArgumentCount {
                method: format!("{}::new", ty),
                expected,
                actual: fields.len(),
            });
        }
        Ok(Self { ty, fields })
    }

    /// Build from named values; unnamed properties get their default value
    pub fn from_pairs(ty: &Type, pairs: Vec<(&str, Value)>) -> ExpressionResult<Self> {
        let named = ty.as_named().ok_or_else(|| ExpressionError::EvaluationError {
            message: format!("{} is not a record type", ty),
        })?;
        let mut fields: Vec<Value> = named
            .properties()
            .iter()
            .map(|p| Value::default_of(&p.ty))
            .collect();
        for (name, value) in pairs {
            let (index, _) = named
                .property(name)
                .ok_or_else(|| ExpressionError::UnknownMember {
                    ty: ty.clone(),
                    name: name.to_string(),
                })?;
            fields[index] = value;
        }
        Ok(Self {
            ty: named.clone(),
            fields,
        })
    }

    pub fn ty(&self) -> &NamedType {
        &self.ty
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.ty.property(name).map(|(index, _)| &self.fields[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.ty
            .def()
            .properties()
            .iter()
            .map(|p| p.name.as_str())
            .zip(self.fields.iter())
    }
}

/// A data source as seen by an expression
#[derive(Clone)]
pub enum QueryableValue {
    /// Remote data source not bound on this side
    Resource {
        element_type: Type,
        name: Option<String>,
    },
    /// Composed query; inlined when referenced from another query
    Query {
        element_type: Type,
        expression: Arc<Expression>,
    },
    /// Live data
    Data(Arc<dyn DataSet>),
}

impl QueryableValue {
    pub fn element_type(&self) -> Type {
        match self {
            QueryableValue::Resource { element_type, .. }
            | QueryableValue::Query { element_type, .. } => element_type.clone(),
            QueryableValue::Data(data) => data.element_type(),
        }
    }
}

impl fmt::Debug for QueryableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryableValue::Resource { element_type, name } => f
                .debug_struct("Resource")
                .field("element_type", &element_type.to_string())
                .field("name", name)
                .finish(),
            QueryableValue::Query {
                element_type,
                expression,
            } => f
                .debug_struct("Query")
                .field("element_type", &element_type.to_string())
                .field("expression", &expression.to_string())
                .finish(),
            QueryableValue::Data(data) => write!(f, "Data({})", data.element_type()),
        }
    }
}

impl PartialEq for QueryableValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                QueryableValue::Resource {
                    element_type: a,
                    name: an,
                },
                QueryableValue::Resource {
                    element_type: b,
                    name: bn,
                },
            ) => a == b && an == bn,
            (
                QueryableValue::Query { expression: a, .. },
                QueryableValue::Query { expression: b, .. },
            ) => Arc::ptr_eq(a, b) || a == b,
            (QueryableValue::Data(a), QueryableValue::Data(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

/// Live rows of one element type
pub trait DataSet: Send + Sync {
    fn element_type(&self) -> Type;

    fn load(&self) -> anyhow::Result<Vec<Value>>;

    fn load_async(&self) -> BoxFuture<'_, anyhow::Result<Vec<Value>>> {
        Box::pin(async move { self.load() })
    }
}

/// Rows held in memory
#[derive(Debug, Clone)]
pub struct MemoryDataSet {
    element_type: Type,
    rows: Arc<Vec<Value>>,
}

impl MemoryDataSet {
    pub fn new(element_type: Type, rows: Vec<Value>) -> Self {
        Self {
            element_type,
            rows: Arc::new(rows),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Queryable(QueryableValue::Data(Arc::new(self)))
    }
}

impl DataSet for MemoryDataSet {
    fn element_type(&self) -> Type {
        self.element_type.clone()
    }

    fn load(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self.rows.as_ref().clone())
    }
}

/// Rust types with a fixed query type
pub trait QueryValue: Into<Value> {
    fn query_type() -> Type;
}

impl QueryValue for bool {
    fn query_type() -> Type {
        Type::bool()
    }
}

impl QueryValue for i32 {
    fn query_type() -> Type {
        Type::int32()
    }
}

impl QueryValue for i64 {
    fn query_type() -> Type {
        Type::int64()
    }
}

impl QueryValue for f64 {
    fn query_type() -> Type {
        Type::float64()
    }
}

impl QueryValue for String {
    fn query_type() -> Type {
        Type::string()
    }
}

impl QueryValue for &str {
    fn query_type() -> Type {
        Type::string()
    }
}

impl<T: QueryValue> QueryValue for Option<T> {
    fn query_type() -> Type {
        let inner = T::query_type();
        if inner.is_reference() {
            inner
        } else {
            Type::nullable(inner)
        }
    }
}

impl<T: QueryValue> QueryValue for Vec<T> {
    fn query_type() -> Type {
        Type::array(T::query_type())
    }
}

/// Conversion of query results into Rust types
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn conversion_error<T>(expected: &str, value: &Value) -> Result<T> {
    Err(QueryError::Conversion(format!(
        "expected {}, got {}",
        expected,
        value.kind()
    )))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => conversion_error("bool", &other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int32(v) => Ok(v),
            other => conversion_error("int32", &other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int64(v) => Ok(v),
            Value::Int32(v) => Ok(v as i64),
            Value::Enum(e) => Ok(e.value),
            other => conversion_error("int64", &other),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float64(v) => Ok(v),
            other => conversion_error("float64", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => conversion_error("string", &other),
        }
    }
}

impl FromValue for Record {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Record(r) => Ok(r),
            other => conversion_error("record", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => conversion_error("list", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDef;

    #[test]
    fn test_record_from_pairs() {
        let product = TypeDef::record(
            "shop",
            "Product",
            vec![("Id", Type::int32()), ("Name", Type::string()), ("Stock", Type::int64())],
        );
        let record = Record::from_pairs(
            &Type::named(&product),
            vec![("Name", Value::from("Desk")), ("Id", Value::Int32(7))],
        )
        .unwrap();
        assert_eq!(record.get("Id"), Some(&Value::Int32(7)));
        assert_eq!(record.get("Name"), Some(&Value::String("Desk".to_string())));
        assert_eq!(record.get("Stock"), Some(&Value::Int64(0)));
        assert_eq!(record.get("Price"), None);

        let names: Vec<&str> = record.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Id", "Name", "Stock"]);

        assert!(Record::from_pairs(&Type::named(&product), vec![("Nope", Value::Null)]).is_err());
    }

    #[test]
    fn test_record_arity() {
        let product = TypeDef::record("shop", "Product", vec![("Id", Type::int32())]);
        let named = Type::named(&product).as_named().cloned().unwrap();
        assert!(Record::new(named.clone(), vec![]).is_err());
        assert!(Record::new(named, vec![Value::Int32(1)]).is_ok());
    }

    #[test]
    fn test_from_value() {
        assert_eq!(i32::from_value(Value::Int32(3)).unwrap(), 3);
        assert_eq!(Option::<i32>::from_value(Value::Null).unwrap(), None);
        assert_eq!(
            Vec::<String>::from_value(Value::from(vec!["a", "b"])).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(matches!(
            bool::from_value(Value::Int32(1)),
            Err(QueryError::Conversion(_))
        ));
    }

    #[test]
    fn test_query_types() {
        assert_eq!(<Option<i32>>::query_type(), Type::nullable(Type::int32()));
        assert_eq!(<Option<String>>::query_type(), Type::string());
        assert_eq!(<Vec<i64>>::query_type(), Type::array(Type::int64()));
    }

    #[test]
    fn test_memory_data_set() {
        let data = MemoryDataSet::new(Type::int32(), vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(data.load().unwrap().len(), 2);
        let a = data.clone().into_value();
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, data.into_value());
    }
}
