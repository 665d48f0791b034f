//! Conversion between runtime values and serializable constants.

use crate::remote::{ConstantValue, DynamicObject, DynamicProperty, TypeId, TypeTable, TypeTableBuilder};
use crate::types::{PrimitiveType, ResolutionContext, Type, TypeDefKind};
use crate::value::{EnumValue, Record, Value};
use crate::{QueryError, Result};
use serde::{Deserialize, Serialize};

/// Serialize `value` of static type `ty`, registering the types it needs
pub fn to_constant(value: &Value, ty: &Type, types: &mut TypeTableBuilder) -> Result<ConstantValue> {
    Ok(match value {
        Value::Null => ConstantValue::Null,
        Value::Bool(b) => ConstantValue::Bool(*b),
        Value::Int32(v) => ConstantValue::Int32(*v),
        Value::Int64(v) => ConstantValue::Int64(*v),
        Value::Float64(v) => ConstantValue::Float64(*v),
        Value::String(s) => ConstantValue::String(s.clone()),
        Value::Enum(e) => ConstantValue::Enum {
            ty: types.create(&Type::Named(e.ty.clone())),
            value: e.value,
        },
        Value::Record(record) => {
            let record_ty = Type::Named(record.ty().clone());
            let id = types.create(&record_ty);
            let properties = record
                .ty()
                .properties()
                .iter()
                .zip(record.fields())
                .map(|(p, v)| {
                    Ok(DynamicProperty {
                        name: p.name.clone(),
                        value: to_constant(v, &p.ty, types)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            ConstantValue::Object(DynamicObject {
                ty: Some(id),
                properties,
            })
        }
        Value::List(items) => {
            let element = ty.element_type().cloned().unwrap_or_else(Type::object);
            ConstantValue::List(
                items
                    .iter()
                    .map(|item| to_constant(item, &element, types))
                    .collect::<Result<_>>()?,
            )
        }
        Value::Queryable(q) => {
            return Err(QueryError::translation(format!(
                "query over {} cannot be serialized as a value",
                q.element_type()
            )))
        }
    })
}

/// Deserialize `value` into a runtime value of the `expected` type
pub fn from_constant(
    value: &ConstantValue,
    expected: &Type,
    table: &TypeTable,
    context: &ResolutionContext,
) -> Result<Value> {
    let mismatch = || {
        QueryError::Conversion(format!("constant {} is not a value of {}", value, expected))
    };

    match (expected, value) {
        (Type::Nullable(_), ConstantValue::Null) => Ok(Value::Null),
        (Type::Nullable(inner), _) => from_constant(value, inner, table, context),
        (ty, ConstantValue::Null) if ty.accepts_null() => Ok(Value::Null),
        (Type::Primitive(PrimitiveType::Object), _) => infer(value, table, context),
        (Type::Primitive(p), _) => match (p, value) {
            (PrimitiveType::Bool, ConstantValue::Bool(b)) => Ok(Value::Bool(*b)),
            (PrimitiveType::Int32, ConstantValue::Int32(v)) => Ok(Value::Int32(*v)),
            (PrimitiveType::Int64, ConstantValue::Int64(v)) => Ok(Value::Int64(*v)),
            (PrimitiveType::Int64, ConstantValue::Int32(v)) => Ok(Value::Int64(i64::from(*v))),
            (PrimitiveType::Float64, ConstantValue::Float64(v)) => Ok(Value::Float64(*v)),
            (PrimitiveType::String, ConstantValue::String(s)) => Ok(Value::String(s.clone())),
            _ => Err(mismatch()),
        },
        (Type::Named(named), _) => match (named.def().kind(), value) {
            (TypeDefKind::Enum { .. }, ConstantValue::Enum { value: v, .. })
            | (TypeDefKind::Enum { .. }, ConstantValue::Int64(v)) => Ok(Value::Enum(EnumValue {
                ty: named.clone(),
                value: *v,
            })),
            (TypeDefKind::Enum { .. }, ConstantValue::Int32(v)) => Ok(Value::Enum(EnumValue {
                ty: named.clone(),
                value: i64::from(*v),
            })),
            (TypeDefKind::Record(_), ConstantValue::Object(object))
            | (TypeDefKind::Anonymous(_), ConstantValue::Object(object)) => {
                let mut pairs = Vec::with_capacity(object.properties.len());
                for property in &object.properties {
                    let (_, def) = named.property(&property.name).ok_or_else(|| {
                        QueryError::Conversion(format!(
                            "{} has no property '{}'",
                            expected, property.name
                        ))
                    })?;
                    pairs.push((
                        property.name.as_str(),
                        from_constant(&property.value, &def.ty, table, context)?,
                    ));
                }
                Ok(Value::Record(Record::from_pairs(expected, pairs)?))
            }
            _ => Err(mismatch()),
        },
        (Type::Array(element), ConstantValue::List(items))
        | (Type::Sequence(element), ConstantValue::List(items))
        | (Type::Queryable(element), ConstantValue::List(items)) => Ok(Value::List(
            items
                .iter()
                .map(|item| from_constant(item, element, table, context))
                .collect::<Result<_>>()?,
        )),
        _ => Err(mismatch()),
    }
}

/// Deserialize without a static type, using the type ids the constant carries
fn infer(value: &ConstantValue, table: &TypeTable, context: &ResolutionContext) -> Result<Value> {
    Ok(match value {
        ConstantValue::Null => Value::Null,
        ConstantValue::Bool(b) => Value::Bool(*b),
        ConstantValue::Int32(v) => Value::Int32(*v),
        ConstantValue::Int64(v) => Value::Int64(*v),
        ConstantValue::Float64(v) => Value::Float64(*v),
        ConstantValue::String(s) => Value::String(s.clone()),
        ConstantValue::Enum { ty, .. } => {
            let ty = context.resolve_type(table, *ty)?;
            return from_constant(value, &ty, table, context);
        }
        ConstantValue::Object(object) => match object.ty {
            Some(id) => {
                let ty = context.resolve_type(table, id)?;
                return from_constant(value, &ty, table, context);
            }
            None => {
                return Err(QueryError::Conversion(
                    "object constant without a type cannot be materialized".to_string(),
                ))
            }
        },
        ConstantValue::List(items) => Value::List(
            items
                .iter()
                .map(|item| infer(item, table, context))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Serialized query result with the descriptors its value refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub types: TypeTable,
    /// Static type of the executed expression
    pub ty: TypeId,
    pub value: ConstantValue,
}

impl RemoteResult {
    pub fn from_value(value: &Value, ty: &Type) -> Result<Self> {
        let mut types = TypeTableBuilder::new();
        let id = types.create(ty);
        let value = to_constant(value, ty, &mut types)?;
        Ok(Self {
            types: types.finish(),
            ty: id,
            value,
        })
    }

    /// Materialize as a value of the caller's `requested` type
    pub fn into_value(&self, requested: &Type, context: &ResolutionContext) -> Result<Value> {
        from_constant(&self.value, requested, &self.types, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDef;

    #[test]
    fn test_record_and_enum_constants() {
        let status = TypeDef::enumeration("shop", "Status", vec![("Open", 0), ("Closed", 1)]);
        let order = TypeDef::record(
            "shop",
            "Order",
            vec![("Id", Type::int32()), ("Status", Type::named(&status))],
        );
        let order_ty = Type::named(&order);
        let record = Record::from_pairs(
            &order_ty,
            vec![
                ("Id", Value::Int32(7)),
                (
                    "Status",
                    Value::Enum(EnumValue {
                        ty: order_ty.property("Status").unwrap().ty.as_named().unwrap().clone(),
                        value: 1,
                    }),
                ),
            ],
        )
        .unwrap();

        let mut types = TypeTableBuilder::new();
        let constant = to_constant(&Value::Record(record.clone()), &order_ty, &mut types).unwrap();
        let ConstantValue::Object(object) = &constant else {
            panic!("object expected");
        };
        assert!(matches!(object.get("Status"), Some(ConstantValue::Enum { value: 1, .. })));

        let table = types.finish();
        let context = ResolutionContext::default();
        let back = from_constant(&constant, &order_ty, &table, &context).unwrap();
        assert_eq!(back, Value::Record(record));
    }

    #[test]
    fn test_result_shapes() {
        let context = ResolutionContext::default();
        let result = RemoteResult::from_value(
            &Value::List(vec![Value::Int32(1), Value::Null]),
            &Type::sequence(Type::nullable(Type::int32())),
        )
        .unwrap();
        let value = result
            .into_value(&Type::array(Type::nullable(Type::int64())), &context)
            .unwrap();
        assert_eq!(value, Value::List(vec![Value::Int64(1), Value::Null]));

        let err = result.into_value(&Type::bool(), &context).unwrap_err();
        assert!(matches!(err, QueryError::Conversion(_)));

        // Null into a non-nullable value type
        let null = RemoteResult::from_value(&Value::Null, &Type::object()).unwrap();
        assert!(null.into_value(&Type::int32(), &context).is_err());
        assert_eq!(null.into_value(&Type::string(), &context).unwrap(), Value::Null);
    }

    #[test]
    fn test_queryable_is_not_a_constant() {
        let value = crate::value::MemoryDataSet::new(Type::int32(), vec![]).into_value();
        let mut types = TypeTableBuilder::new();
        assert!(to_constant(&value, &Type::queryable(Type::int32()), &mut types).is_err());
    }
}
