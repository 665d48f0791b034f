//! Serializable type and member descriptors.
//!
//! Descriptors are stored in a [`TypeTable`] arena and referenced by
//! [`TypeId`]. A [`TypeTableBuilder`] tracks which runtime types already have
//! an entry, so every occurrence of a type within one translation shares a
//! single descriptor.

use crate::expression::MethodInfo;
use crate::types::builtin;
use crate::types::ty::CORE_NAMESPACE;
use crate::types::{PropertyInfo, Type};
use crate::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Display recursion limit for malformed (cyclic) tables
const MAX_DISPLAY_DEPTH: usize = 32;

/// Index of a descriptor in a [`TypeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorProperty {
    pub name: String,
    pub ty: TypeId,
}

/// Surrogate for a runtime type, usable without that type being loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub namespace: Option<String>,
    /// Enclosing type of a nested type
    pub declaring: Option<TypeId>,
    pub generic_args: Vec<TypeId>,
    /// Array of `generic_args[0]`
    pub is_array: bool,
    pub is_anonymous: bool,
    /// Only present for anonymous types
    pub properties: Option<Vec<DescriptorProperty>>,
}

impl TypeDescriptor {
    fn placeholder() -> Self {
        Self {
            name: String::new(),
            namespace: None,
            declaring: None,
            generic_args: Vec::new(),
            is_array: false,
            is_anonymous: false,
            properties: None,
        }
    }

    fn core(name: &str, generic_args: Vec<TypeId>) -> Self {
        Self {
            name: name.to_string(),
            namespace: Some(CORE_NAMESPACE.to_string()),
            generic_args,
            ..Self::placeholder()
        }
    }

    pub fn is_core(&self) -> bool {
        self.namespace.as_deref() == Some(CORE_NAMESPACE) && self.declaring.is_none()
    }
}

/// Arena of type descriptors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeTable {
    entries: Vec<TypeDescriptor>,
}

impl From<Vec<TypeDescriptor>> for TypeTable {
    fn from(entries: Vec<TypeDescriptor>) -> Self {
        Self { entries }
    }
}

impl TypeTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.entries.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, d)| (TypeId(i as u32), d))
    }

    /// Descriptor lookup that fails on dangling ids
    pub fn descriptor(&self, id: TypeId) -> Result<&TypeDescriptor> {
        self.get(id).ok_or_else(|| QueryError::Resolution {
            type_name: format!("#{}", id.0),
            reason: "type id is not present in the type table".to_string(),
        })
    }

    /// Name used for lookup: `namespace.Outer+Name` plus a generic arity suffix
    pub fn full_name(&self, id: TypeId) -> String {
        self.full_name_at(id, 0)
    }

    /// Full name with generic arguments, for diagnostics
    pub fn display(&self, id: TypeId) -> String {
        self.display_at(id, 0)
    }

    /// Canonical identity of a descriptor, used as resolution cache key
    pub fn key(&self, id: TypeId) -> String {
        self.key_at(id, 0)
    }

    fn full_name_at(&self, id: TypeId, depth: usize) -> String {
        let Some(d) = self.get(id) else {
            return format!("#{}", id.0);
        };
        if depth > MAX_DISPLAY_DEPTH {
            return "...".to_string();
        }
        if d.is_array {
            let element = d
                .generic_args
                .first()
                .map(|e| self.display_at(*e, depth + 1))
                .unwrap_or_default();
            return format!("{}[]", element);
        }
        let mut name = match (d.declaring, &d.namespace) {
            (Some(outer), _) => format!("{}+{}", self.full_name_at(outer, depth + 1), d.name),
            (None, Some(ns)) => format!("{}.{}", ns, d.name),
            (None, None) => d.name.clone(),
        };
        if !d.generic_args.is_empty() {
            name.push_str(&format!("`{}", d.generic_args.len()));
        }
        name
    }

    fn display_at(&self, id: TypeId, depth: usize) -> String {
        let name = self.full_name_at(id, depth);
        match self.get(id) {
            Some(d) if !d.is_array && !d.generic_args.is_empty() && depth <= MAX_DISPLAY_DEPTH => {
                let args: Vec<String> = d
                    .generic_args
                    .iter()
                    .map(|a| self.display_at(*a, depth + 1))
                    .collect();
                format!("{}[{}]", name, args.join(", "))
            }
            _ => name,
        }
    }

    fn key_at(&self, id: TypeId, depth: usize) -> String {
        let mut key = self.display_at(id, depth);
        if depth > MAX_DISPLAY_DEPTH {
            return key;
        }
        if let Some(props) = self.get(id).and_then(|d| d.properties.as_ref()) {
            let props: Vec<String> = props
                .iter()
                .map(|p| format!("{}:{}", p.name, self.key_at(p.ty, depth + 1)))
                .collect();
            key.push_str(&format!("{{{}}}", props.join(",")));
        }
        key
    }
}

/// Reference tracker building a [`TypeTable`] from runtime types
#[derive(Debug, Default)]
pub struct TypeTableBuilder {
    table: TypeTable,
    index: HashMap<Type, TypeId>,
}

impl TypeTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor id for `ty`, reusing the entry created earlier for the same type
    pub fn create(&mut self, ty: &Type) -> TypeId {
        if let Some(id) = self.index.get(ty) {
            return *id;
        }
        // Register the slot before recursing so shared references land here.
        let id = TypeId(self.table.entries.len() as u32);
        self.table.entries.push(TypeDescriptor::placeholder());
        self.index.insert(ty.clone(), id);
        let descriptor = self.describe(ty);
        self.table.entries[id.index()] = descriptor;
        id
    }

    fn describe(&mut self, ty: &Type) -> TypeDescriptor {
        if let Type::Array(element) = ty {
            let element = self.create(element);
            return TypeDescriptor {
                is_array: true,
                ..TypeDescriptor::core("Array", vec![element])
            };
        }
        if let Some((name, args)) = builtin::core_name(ty) {
            let args = args.iter().map(|a| self.create(a)).collect();
            return TypeDescriptor::core(name, args);
        }
        match ty {
            Type::Named(named) => {
                let def = named.def();
                let declaring = def.declaring().map(|outer| self.create(&Type::named(outer)));
                let generic_args = named.args().iter().map(|a| self.create(a)).collect();
                let properties = def.is_anonymous().then(|| {
                    named
                        .properties()
                        .iter()
                        .map(|p| DescriptorProperty {
                            name: p.name.clone(),
                            ty: self.create(&p.ty),
                        })
                        .collect()
                });
                TypeDescriptor {
                    name: def.name().to_string(),
                    namespace: if declaring.is_none() {
                        def.namespace().map(str::to_string)
                    } else {
                        None
                    },
                    declaring,
                    generic_args,
                    is_array: false,
                    is_anonymous: def.is_anonymous(),
                    properties,
                }
            }
            other => TypeDescriptor {
                name: format!("!{}", other),
                ..TypeDescriptor::placeholder()
            },
        }
    }

    pub fn property(&mut self, property: &PropertyInfo) -> PropertyDescriptor {
        PropertyDescriptor {
            declaring: self.create(&property.declaring),
            name: property.name.clone(),
            ty: self.create(&property.ty),
        }
    }

    pub fn method(&mut self, method: &MethodInfo) -> MethodDescriptor {
        MethodDescriptor {
            declaring: self.create(&method.declaring),
            name: method.name.clone(),
            binding: MethodBinding {
                is_static: method.is_static,
                is_public: method.is_public,
            },
            generic_args: method.generic_args.iter().map(|a| self.create(a)).collect(),
            parameters: method.parameters.iter().map(|p| self.create(p)).collect(),
            return_type: self.create(&method.return_type),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn finish(self) -> TypeTable {
        self.table
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub declaring: TypeId,
    pub name: String,
    pub ty: TypeId,
}

impl PropertyDescriptor {
    pub fn display(&self, table: &TypeTable) -> String {
        format!("{}.{}", table.display(self.declaring), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBinding {
    pub is_static: bool,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub declaring: TypeId,
    pub name: String,
    pub binding: MethodBinding,
    pub generic_args: Vec<TypeId>,
    pub parameters: Vec<TypeId>,
    pub return_type: TypeId,
}

impl MethodDescriptor {
    pub fn display(&self, table: &TypeTable) -> String {
        let mut out = format!("{}.{}", table.display(self.declaring), self.name);
        if !self.generic_args.is_empty() {
            let args: Vec<String> = self.generic_args.iter().map(|a| table.display(*a)).collect();
            out.push_str(&format!("[{}]", args.join(", ")));
        }
        let params: Vec<String> = self.parameters.iter().map(|p| table.display(*p)).collect();
        out.push_str(&format!("({})", params.join(", ")));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructorDescriptor {
    pub declaring: TypeId,
    pub parameters: Vec<TypeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDef;

    #[test]
    fn test_create_is_idempotent_and_shares_entries() {
        let product = TypeDef::record("shop", "Product", vec![("Id", Type::int32())]);
        let mut builder = TypeTableBuilder::new();
        let a = builder.create(&Type::queryable(Type::named(&product)));
        let b = builder.create(&Type::sequence(Type::named(&product)));
        let c = builder.create(&Type::queryable(Type::named(&product)));
        assert_eq!(a, c);
        assert_ne!(a, b);

        let table = builder.finish();
        // Queryable, Product, Sequence
        assert_eq!(table.len(), 3);
        let q = table.get(a).unwrap();
        let s = table.get(b).unwrap();
        assert_eq!(q.generic_args, s.generic_args);
    }

    #[test]
    fn test_names() {
        let outer = TypeDef::record("shop", "Catalog", vec![]);
        let inner = TypeDef::builder("Entry").nested_in(&outer).build();
        let mut builder = TypeTableBuilder::new();
        let array = builder.create(&Type::array(Type::named(&inner)));
        let nullable = builder.create(&Type::nullable(Type::int32()));
        let table = builder.finish();

        assert_eq!(table.full_name(array), "shop.Catalog+Entry[]");
        assert_eq!(table.full_name(nullable), "core.Nullable`1");
        assert_eq!(table.display(nullable), "core.Nullable`1[core.Int32]");
    }

    #[test]
    fn test_anonymous_descriptor_carries_properties() {
        let anon = TypeDef::anonymous(vec![("Id", Type::int32()), ("Name", Type::string())]);
        let mut builder = TypeTableBuilder::new();
        let id = builder.create(&Type::named(&anon));
        let table = builder.finish();

        let d = table.get(id).unwrap();
        assert!(d.is_anonymous);
        let props = d.properties.as_ref().unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "Id");
        assert!(table.key(id).ends_with("{Id:core.Int32,Name:core.String}"));
    }

    #[test]
    fn test_dangling_id() {
        let table = TypeTable::default();
        assert!(table.descriptor(TypeId(3)).is_err());
        assert_eq!(table.full_name(TypeId(3)), "#3");
    }

    #[test]
    fn test_key_of_self_referencing_property_terminates() {
        let table = TypeTable::from(vec![TypeDescriptor {
            name: "Loop".to_string(),
            is_anonymous: true,
            properties: Some(vec![DescriptorProperty {
                name: "Next".to_string(),
                ty: TypeId(0),
            }]),
            ..TypeDescriptor::placeholder()
        }]);
        let key = table.key(TypeId(0));
        assert!(key.starts_with("Loop{Next:Loop{Next:"));
        assert!(key.len() < 4096);
    }
}
