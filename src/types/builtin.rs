//! Builtin types living in the `core` namespace.

use crate::types::ty::{PrimitiveType, Type, TypeDef, CORE_NAMESPACE};
use std::sync::{Arc, OnceLock};

fn static_class(cell: &'static OnceLock<Arc<TypeDef>>, name: &str) -> Arc<TypeDef> {
    cell.get_or_init(|| {
        TypeDef::builder(name)
            .namespace(CORE_NAMESPACE)
            .static_class()
            .build()
    })
    .clone()
}

/// Query operators over `Queryable<T>`
pub fn query_ops() -> Arc<TypeDef> {
    static DEF: OnceLock<Arc<TypeDef>> = OnceLock::new();
    static_class(&DEF, "QueryOps")
}

/// Query operators over in-memory `Sequence<T>`
pub fn sequence_ops() -> Arc<TypeDef> {
    static DEF: OnceLock<Arc<TypeDef>> = OnceLock::new();
    static_class(&DEF, "SequenceOps")
}

pub fn math() -> Arc<TypeDef> {
    static DEF: OnceLock<Arc<TypeDef>> = OnceLock::new();
    static_class(&DEF, "Math")
}

pub fn clock() -> Arc<TypeDef> {
    static DEF: OnceLock<Arc<TypeDef>> = OnceLock::new();
    static_class(&DEF, "Clock")
}

/// Provider hint markers such as `Include`
pub fn query_hints() -> Arc<TypeDef> {
    static DEF: OnceLock<Arc<TypeDef>> = OnceLock::new();
    static_class(&DEF, "QueryHints")
}

pub fn static_classes() -> [Arc<TypeDef>; 5] {
    [query_ops(), sequence_ops(), math(), clock(), query_hints()]
}

/// Descriptor name and generic arguments of a builtin constructed type
pub fn core_name(ty: &Type) -> Option<(&'static str, Vec<Type>)> {
    match ty {
        Type::Primitive(p) => Some((p.name(), Vec::new())),
        Type::Nullable(inner) => Some(("Nullable", vec![(**inner).clone()])),
        Type::Sequence(e) => Some(("Sequence", vec![(**e).clone()])),
        Type::Queryable(e) => Some(("Queryable", vec![(**e).clone()])),
        Type::Function(params, ret) => {
            let mut args = params.clone();
            args.push((**ret).clone());
            Some(("Func", args))
        }
        Type::Array(_) | Type::Named(_) | Type::GenericParam(_) => None,
    }
}

/// Inverse of [`core_name`], plus the builtin static classes
pub fn resolve_core(name: &str, mut args: Vec<Type>) -> Option<Type> {
    if let Some(p) = PrimitiveType::from_name(name) {
        return args.is_empty().then_some(Type::Primitive(p));
    }
    match (name, args.len()) {
        ("Nullable", 1) => args.pop().map(Type::nullable),
        ("Sequence", 1) => args.pop().map(Type::sequence),
        ("Queryable", 1) => args.pop().map(Type::queryable),
        ("Func", n) if n >= 1 => {
            let ret = args.pop()?;
            Some(Type::function(args, ret))
        }
        (_, 0) => static_classes()
            .into_iter()
            .find(|def| def.name() == name)
            .map(|def| Type::named(&def)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_classes_are_singletons() {
        assert!(Arc::ptr_eq(&query_ops(), &query_ops()));
        assert_eq!(query_ops().full_name(), "core.QueryOps");
        assert_eq!(Type::named(&math()), Type::named(&math()));
    }

    #[test]
    fn test_core_name_round_trip() {
        let types = vec![
            Type::int32(),
            Type::string(),
            Type::nullable(Type::float64()),
            Type::sequence(Type::int64()),
            Type::queryable(Type::bool()),
            Type::function(vec![Type::int32(), Type::string()], Type::bool()),
        ];
        for ty in types {
            let (name, args) = core_name(&ty).unwrap();
            assert_eq!(resolve_core(name, args), Some(ty));
        }
    }

    #[test]
    fn test_resolve_static_class() {
        assert_eq!(resolve_core("Clock", vec![]), Some(Type::named(&clock())));
        assert_eq!(resolve_core("Nowhere", vec![]), None);
        assert_eq!(resolve_core("Int32", vec![Type::int32()]), None);
    }
}
