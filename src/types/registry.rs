//! Type registries and descriptor resolution.

use crate::expression::{MethodInfo, MethodRegistry};
use crate::remote::descriptor::{
    ConstructorDescriptor, MethodDescriptor, PropertyDescriptor, TypeDescriptor, TypeId, TypeTable,
};
use crate::types::builtin;
use crate::types::ty::{PropertyInfo, Type, TypeDef};
use crate::{QueryError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Source of type definitions by full name
pub trait TypeResolver: Send + Sync {
    fn find_type(&self, full_name: &str) -> Option<Arc<TypeDef>>;

    /// Candidates for structural matching of anonymous types
    fn anonymous_types(&self) -> Vec<Arc<TypeDef>> {
        Vec::new()
    }
}

/// Type definitions loaded in this process
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<TypeDef>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(defs: impl IntoIterator<Item = Arc<TypeDef>>) -> Self {
        let registry = Self::new();
        for def in defs {
            registry.register(def);
        }
        registry
    }

    /// Register a definition together with its enclosing types
    pub fn register(&self, def: Arc<TypeDef>) -> Arc<TypeDef> {
        let mut types = self.types.write();
        let mut outer = def.declaring().cloned();
        while let Some(o) = outer {
            outer = o.declaring().cloned();
            types.entry(o.full_name().to_string()).or_insert(o);
        }
        types.insert(def.full_name().to_string(), def.clone());
        def
    }

    /// Register `def` only if its full name is free; otherwise return the
    /// definition already registered under it
    pub fn register_if_vacant(
        &self,
        def: Arc<TypeDef>,
    ) -> std::result::Result<Arc<TypeDef>, Arc<TypeDef>> {
        match self.types.write().entry(def.full_name().to_string()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => Ok(slot.insert(def).clone()),
        }
    }

    pub fn get(&self, full_name: &str) -> Option<Arc<TypeDef>> {
        self.types.read().get(full_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl TypeResolver for TypeRegistry {
    fn find_type(&self, full_name: &str) -> Option<Arc<TypeDef>> {
        self.get(full_name)
    }

    fn anonymous_types(&self) -> Vec<Arc<TypeDef>> {
        self.types
            .read()
            .values()
            .filter(|def| def.is_anonymous())
            .cloned()
            .collect()
    }
}

/// Union of several resolvers, consulted in order
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn TypeResolver>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn TypeResolver>>) -> Self {
        Self { resolvers }
    }
}

impl TypeResolver for ChainResolver {
    fn find_type(&self, full_name: &str) -> Option<Arc<TypeDef>> {
        self.resolvers.iter().find_map(|r| r.find_type(full_name))
    }

    fn anonymous_types(&self) -> Vec<Arc<TypeDef>> {
        self.resolvers
            .iter()
            .flat_map(|r| r.anonymous_types())
            .collect()
    }
}

/// Resolved types keyed by canonical descriptor identity.
///
/// Concurrent writers store equal results, so a lost race only repeats work.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: DashMap<String, Type>,
}

impl ResolutionCache {
    pub fn get(&self, key: &str) -> Option<Type> {
        self.entries.get(key).map(|t| t.clone())
    }

    pub fn insert(&self, key: String, ty: Type) {
        self.entries.insert(key, ty);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Everything needed to turn descriptors back into runtime types and members.
///
/// Cloning shares the registry and the cache. `ResolutionContext::default()`
/// resolves builtins only and emits anonymous types on demand.
#[derive(Clone)]
pub struct ResolutionContext {
    registry: Arc<TypeRegistry>,
    fallback: Option<Arc<dyn TypeResolver>>,
    methods: Arc<MethodRegistry>,
    cache: Arc<ResolutionCache>,
    emit_anonymous_types: bool,
}

impl Default for ResolutionContext {
    fn default() -> Self {
        Self::new(Arc::new(TypeRegistry::new()))
    }
}

impl fmt::Debug for ResolutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionContext")
            .field("registered_types", &self.registry.len())
            .field("has_fallback", &self.fallback.is_some())
            .field("cached", &self.cache.len())
            .field("emit_anonymous_types", &self.emit_anonymous_types)
            .finish()
    }
}

impl ResolutionContext {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            fallback: None,
            methods: Arc::new(MethodRegistry::new()),
            cache: Arc::new(ResolutionCache::default()),
            emit_anonymous_types: true,
        }
    }

    /// Resolver consulted when the registry has no type with the name
    pub fn with_fallback(mut self, resolver: Arc<dyn TypeResolver>) -> Self {
        self.fallback = Some(resolver);
        self.cache = Arc::new(ResolutionCache::default());
        self
    }

    pub fn with_methods(mut self, methods: Arc<MethodRegistry>) -> Self {
        self.methods = methods;
        self
    }

    /// Whether unmatched anonymous descriptors synthesize a new type
    pub fn emit_anonymous_types(mut self, enabled: bool) -> Self {
        self.emit_anonymous_types = enabled;
        self.cache = Arc::new(ResolutionCache::default());
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.methods
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn resolve_type(&self, table: &TypeTable, id: TypeId) -> Result<Type> {
        self.resolve_in(table, id, &mut Vec::new())
    }

    /// `visiting` holds the ids whose resolution is still in progress
    fn resolve_in(&self, table: &TypeTable, id: TypeId, visiting: &mut Vec<TypeId>) -> Result<Type> {
        let key = table.key(id);
        if let Some(ty) = self.cache.get(&key) {
            return Ok(ty);
        }
        if visiting.contains(&id) {
            return Err(QueryError::Resolution {
                type_name: table.full_name(id),
                reason: "cyclic type descriptor".to_string(),
            });
        }
        visiting.push(id);
        let resolved = self.resolve_uncached(table, id, visiting);
        visiting.pop();
        let ty = resolved?;
        log::trace!("resolved {} -> {}", key, ty);
        self.cache.insert(key, ty.clone());
        Ok(ty)
    }

    fn resolve_uncached(
        &self,
        table: &TypeTable,
        id: TypeId,
        visiting: &mut Vec<TypeId>,
    ) -> Result<Type> {
        let d = table.descriptor(id)?;
        if d.is_array {
            let element = d.generic_args.first().ok_or_else(|| QueryError::Resolution {
                type_name: table.full_name(id),
                reason: "array descriptor without element type".to_string(),
            })?;
            return Ok(Type::array(self.resolve_in(table, *element, visiting)?));
        }

        let args = d
            .generic_args
            .iter()
            .map(|a| self.resolve_in(table, *a, visiting))
            .collect::<Result<Vec<_>>>()?;

        if d.is_core() {
            if let Some(ty) = builtin::resolve_core(&d.name, args.clone()) {
                return Ok(ty);
            }
        }

        let full_name = table.full_name(id);
        if let Some(def) = self.find_type(&full_name) {
            if !d.is_anonymous || Self::same_property_names(&def, d) {
                if def.generic_params().len() != args.len() {
                    return Err(QueryError::Resolution {
                        type_name: table.display(id),
                        reason: format!(
                            "expected {} generic arguments, descriptor has {}",
                            def.generic_params().len(),
                            args.len()
                        ),
                    });
                }
                return Ok(Type::generic(&def, args));
            }
        }

        if d.is_anonymous {
            return self.resolve_anonymous(table, id, d, visiting);
        }

        Err(QueryError::Resolution {
            type_name: full_name,
            reason: "no type with this name is loaded".to_string(),
        })
    }

    fn find_type(&self, full_name: &str) -> Option<Arc<TypeDef>> {
        self.registry.find_type(full_name).or_else(|| {
            self.fallback
                .as_ref()
                .and_then(|resolver| resolver.find_type(full_name))
        })
    }

    fn same_property_names(def: &TypeDef, d: &TypeDescriptor) -> bool {
        let mut names: Vec<&str> = d
            .properties
            .iter()
            .flatten()
            .map(|p| p.name.as_str())
            .collect();
        names.sort_unstable();
        def.property_name_set() == names
    }

    fn resolve_anonymous(
        &self,
        table: &TypeTable,
        id: TypeId,
        d: &TypeDescriptor,
        visiting: &mut Vec<TypeId>,
    ) -> Result<Type> {
        let props = d.properties.as_ref().ok_or_else(|| QueryError::Resolution {
            type_name: table.full_name(id),
            reason: "anonymous type descriptor carries no properties".to_string(),
        })?;

        let mut candidates = self.registry.anonymous_types();
        if let Some(fallback) = &self.fallback {
            candidates.extend(fallback.anonymous_types());
        }
        candidates.retain(|c| Self::same_property_names(c, d));
        candidates.sort_by(|a, b| a.full_name().cmp(b.full_name()));
        if let Some(def) = candidates.first() {
            return Ok(Type::named(def));
        }

        if self.emit_anonymous_types {
            let resolved = props
                .iter()
                .map(|p| Ok((p.name.as_str(), self.resolve_in(table, p.ty, visiting)?)))
                .collect::<Result<Vec<_>>>()?;
            let def = self.emit_anonymous(d, &resolved);
            log::debug!(
                "emitted anonymous type {} for descriptor {}",
                def.full_name(),
                table.key(id)
            );
            return Ok(Type::named(&def));
        }

        let names: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        Err(QueryError::Resolution {
            type_name: table.full_name(id),
            reason: format!(
                "no anonymous type with properties {{{}}} is loaded",
                names.join(", ")
            ),
        })
    }

    /// Register a new anonymous type for `d`.
    ///
    /// The sender's name is kept so the type describes back to the same
    /// descriptor. A name already taken by another type gets a numeric suffix;
    /// an emitted type never replaces a loaded one.
    fn emit_anonymous(&self, d: &TypeDescriptor, props: &[(&str, Type)]) -> Arc<TypeDef> {
        let mut suffix = 0usize;
        loop {
            let name = match suffix {
                0 => d.name.clone(),
                n => format!("{}_{}", d.name, n),
            };
            suffix += 1;
            let builder = props
                .iter()
                .fold(TypeDef::builder(name).anonymous(), |b, (n, t)| {
                    b.property(*n, t.clone())
                });
            let builder = match &d.namespace {
                Some(ns) => builder.namespace(ns.clone()),
                None => builder,
            };
            let def = builder.build();
            let taken_by_fallback = self
                .fallback
                .as_ref()
                .is_some_and(|f| f.find_type(def.full_name()).is_some());
            if taken_by_fallback {
                continue;
            }
            match self.registry.register_if_vacant(def) {
                Ok(def) => return def,
                // A concurrent emission for the same shape won the name
                Err(existing)
                    if existing.is_anonymous() && Self::same_property_names(&existing, d) =>
                {
                    return existing
                }
                Err(_) => {}
            }
        }
    }

    pub fn resolve_property(
        &self,
        table: &TypeTable,
        descriptor: &PropertyDescriptor,
    ) -> Result<PropertyInfo> {
        let declaring = self.resolve_type(table, descriptor.declaring)?;
        let ty = self.resolve_type(table, descriptor.ty)?;
        let property =
            declaring
                .property(&descriptor.name)
                .ok_or_else(|| QueryError::MemberResolution {
                    member: descriptor.display(table),
                    reason: format!("{} has no such property", declaring),
                })?;
        if property.ty != ty {
            return Err(QueryError::MemberResolution {
                member: descriptor.display(table),
                reason: format!("property has type {}, descriptor expects {}", property.ty, ty),
            });
        }
        Ok(property)
    }

    pub fn resolve_method(
        &self,
        table: &TypeTable,
        descriptor: &MethodDescriptor,
    ) -> Result<Arc<MethodInfo>> {
        let declaring = self.resolve_type(table, descriptor.declaring)?;
        let generic_args = descriptor
            .generic_args
            .iter()
            .map(|a| self.resolve_type(table, *a))
            .collect::<Result<Vec<_>>>()?;
        let parameters = descriptor
            .parameters
            .iter()
            .map(|p| self.resolve_type(table, *p))
            .collect::<Result<Vec<_>>>()?;
        let return_type = self.resolve_type(table, descriptor.return_type)?;

        let method = self
            .methods
            .find(
                &declaring,
                &descriptor.name,
                &generic_args,
                &parameters,
                descriptor.binding.is_static,
            )
            .map_err(|e| QueryError::MemberResolution {
                member: descriptor.display(table),
                reason: e.to_string(),
            })?;
        if method.is_public != descriptor.binding.is_public || method.return_type != return_type {
            return Err(QueryError::MemberResolution {
                member: descriptor.display(table),
                reason: "binding or return type differs from the loaded method".to_string(),
            });
        }
        Ok(method)
    }

    /// Resolve the constructed type; `members` names each constructor argument
    pub fn resolve_constructor(
        &self,
        table: &TypeTable,
        descriptor: &ConstructorDescriptor,
        members: &[String],
    ) -> Result<Type> {
        let ty = self.resolve_type(table, descriptor.declaring)?;
        let member_error = |reason: String| QueryError::MemberResolution {
            member: format!("{}::new", table.display(descriptor.declaring)),
            reason,
        };
        let named = ty
            .as_named()
            .ok_or_else(|| member_error(format!("{} has no constructor", ty)))?;
        if members.len() != descriptor.parameters.len()
            || members.len() != named.def().properties().len()
        {
            return Err(member_error(format!(
                "expected {} arguments, got {}",
                named.def().properties().len(),
                descriptor.parameters.len()
            )));
        }
        for (member, param) in members.iter().zip(&descriptor.parameters) {
            let param = self.resolve_type(table, *param)?;
            match named.property(member) {
                Some((_, p)) if p.ty == param => {}
                Some((_, p)) => {
                    return Err(member_error(format!(
                        "argument '{}' has type {}, expected {}",
                        member, param, p.ty
                    )))
                }
                None => return Err(member_error(format!("no property named '{}'", member))),
            }
        }
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::descriptor::{DescriptorProperty, TypeTableBuilder};
    use crate::types::ty::CORE_NAMESPACE;

    fn round_trip(ctx: &ResolutionContext, ty: &Type) -> Result<Type> {
        let mut builder = TypeTableBuilder::new();
        let id = builder.create(ty);
        let table = builder.finish();
        ctx.resolve_type(&table, id)
    }

    #[test]
    fn test_resolve_concrete_types() {
        let product = TypeDef::record("shop", "Product", vec![("Id", Type::int32())]);
        let catalog = TypeDef::record("shop", "Catalog", vec![]);
        let entry = TypeDef::builder("Entry")
            .nested_in(&catalog)
            .property("Sku", Type::string())
            .build();
        let pair = TypeDef::builder("Pair")
            .namespace("shop")
            .generic_params(&["A", "B"])
            .property("First", Type::GenericParam(0))
            .property("Second", Type::GenericParam(1))
            .build();
        let registry = Arc::new(TypeRegistry::with_types([
            product.clone(),
            entry.clone(),
            pair.clone(),
        ]));
        let ctx = ResolutionContext::new(registry);

        let types = vec![
            Type::bool(),
            Type::int64(),
            Type::string(),
            Type::nullable(Type::int32()),
            Type::array(Type::float64()),
            Type::named(&product),
            Type::named(&entry),
            Type::array(Type::named(&entry)),
            Type::generic(&pair, vec![Type::named(&product), Type::nullable(Type::int32())]),
            Type::queryable(Type::named(&product)),
            Type::function(vec![Type::named(&product)], Type::bool()),
        ];
        for ty in types {
            assert_eq!(round_trip(&ctx, &ty).unwrap(), ty);
        }
    }

    #[test]
    fn test_unknown_type_fails_with_full_name() {
        let product = TypeDef::record("shop", "Product", vec![]);
        let ctx = ResolutionContext::default();
        let err = round_trip(&ctx, &Type::named(&product)).unwrap_err();
        match err {
            QueryError::Resolution { type_name, .. } => assert_eq!(type_name, "shop.Product"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fallback_resolver() {
        let product = TypeDef::record("shop", "Product", vec![]);
        let app = Arc::new(TypeRegistry::with_types([product.clone()]));
        let ctx = ResolutionContext::default()
            .with_fallback(Arc::new(ChainResolver::new(vec![app as Arc<dyn TypeResolver>])));
        assert_eq!(round_trip(&ctx, &Type::named(&product)).unwrap(), Type::named(&product));
    }

    #[test]
    fn test_cache_is_populated() {
        let ctx = ResolutionContext::default();
        round_trip(&ctx, &Type::sequence(Type::int32())).unwrap();
        assert_eq!(ctx.cache().len(), 2);
    }

    #[test]
    fn test_anonymous_structural_match() {
        let client = TypeDef::anonymous(vec![
            ("A", Type::int32()),
            ("B", Type::string()),
            ("C", Type::bool()),
        ]);
        let server_exact = TypeDef::anonymous(vec![
            ("C", Type::bool()),
            ("A", Type::int32()),
            ("B", Type::string()),
        ]);
        let ctx = ResolutionContext::new(Arc::new(TypeRegistry::with_types([server_exact.clone()])))
            .emit_anonymous_types(false);
        assert_eq!(
            round_trip(&ctx, &Type::named(&client)).unwrap(),
            Type::named(&server_exact)
        );
    }

    #[test]
    fn test_anonymous_subset_and_superset_do_not_match() {
        let client = TypeDef::anonymous(vec![
            ("A", Type::int32()),
            ("B", Type::string()),
            ("C", Type::bool()),
        ]);
        let subset = TypeDef::anonymous(vec![("A", Type::int32()), ("B", Type::string())]);
        let superset = TypeDef::anonymous(vec![
            ("A", Type::int32()),
            ("B", Type::string()),
            ("C", Type::bool()),
            ("D", Type::bool()),
        ]);
        for candidate in [subset, superset] {
            let ctx = ResolutionContext::new(Arc::new(TypeRegistry::with_types([candidate])))
                .emit_anonymous_types(false);
            assert!(matches!(
                round_trip(&ctx, &Type::named(&client)),
                Err(QueryError::Resolution { .. })
            ));
        }
    }

    #[test]
    fn test_anonymous_emission() {
        let client = TypeDef::anonymous(vec![("Id", Type::int32()), ("Name", Type::string())]);
        let ctx = ResolutionContext::default();
        let resolved = round_trip(&ctx, &Type::named(&client)).unwrap();
        let named = resolved.as_named().unwrap();
        assert!(named.def().is_anonymous());
        assert!(!Arc::ptr_eq(named.def(), &client));
        assert_eq!(named.def().property_name_set(), vec!["Id", "Name"]);
        assert_eq!(ctx.registry().len(), 1);
    }

    fn descriptor(name: &str) -> TypeDescriptor {
        TypeDescriptor {
            name: name.to_string(),
            namespace: Some("shop".to_string()),
            declaring: None,
            generic_args: Vec::new(),
            is_array: false,
            is_anonymous: false,
            properties: None,
        }
    }

    #[test]
    fn test_cyclic_descriptor_is_rejected() {
        let generic = TypeTable::from(vec![TypeDescriptor {
            generic_args: vec![TypeId(0)],
            ..descriptor("Box")
        }]);
        let anonymous = TypeTable::from(vec![TypeDescriptor {
            is_anonymous: true,
            properties: Some(vec![DescriptorProperty {
                name: "Next".to_string(),
                ty: TypeId(0),
            }]),
            ..descriptor("Loop")
        }]);
        let array = TypeTable::from(vec![TypeDescriptor {
            is_array: true,
            generic_args: vec![TypeId(0)],
            ..descriptor("Items")
        }]);

        let ctx = ResolutionContext::default();
        for table in [generic, anonymous, array] {
            match ctx.resolve_type(&table, TypeId(0)) {
                Err(QueryError::Resolution { reason, .. }) => {
                    assert_eq!(reason, "cyclic type descriptor")
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert!(ctx.registry().is_empty());
    }

    #[test]
    fn test_emitted_type_never_replaces_registered_type() {
        let product = TypeDef::record("shop", "Product", vec![("Id", Type::int32())]);
        let ctx = ResolutionContext::new(Arc::new(TypeRegistry::with_types([product.clone()])));

        let table = TypeTable::from(vec![
            TypeDescriptor {
                is_anonymous: true,
                properties: Some(vec![DescriptorProperty {
                    name: "X".to_string(),
                    ty: TypeId(1),
                }]),
                ..descriptor("Product")
            },
            TypeDescriptor {
                namespace: Some(CORE_NAMESPACE.to_string()),
                ..descriptor("Int32")
            },
        ]);
        let emitted = ctx.resolve_type(&table, TypeId(0)).unwrap();
        let emitted = emitted.as_named().unwrap();
        assert!(emitted.def().is_anonymous());
        assert_eq!(emitted.def().full_name(), "shop.Product_1");

        let registered = ctx.registry().get("shop.Product").unwrap();
        assert!(Arc::ptr_eq(&registered, &product));
        assert_eq!(
            round_trip(&ctx, &Type::named(&product)).unwrap(),
            Type::named(&product)
        );
    }

    #[test]
    fn test_register_if_vacant() {
        let registry = TypeRegistry::new();
        let first = TypeDef::record("shop", "Product", vec![("Id", Type::int32())]);
        let second = TypeDef::record("shop", "Product", vec![("Name", Type::string())]);
        assert!(registry.register_if_vacant(first.clone()).is_ok());
        let existing = registry.register_if_vacant(second).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &first));
    }
}
