//! Runtime type definitions.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Namespace holding the builtin types.
pub const CORE_NAMESPACE: &str = "core";

static NEXT_ANONYMOUS_ID: AtomicUsize = AtomicUsize::new(0);

/// Primitive value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    /// Top type; any value converts to it
    Object,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 6] = [
        PrimitiveType::Bool,
        PrimitiveType::Int32,
        PrimitiveType::Int64,
        PrimitiveType::Float64,
        PrimitiveType::String,
        PrimitiveType::Object,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveType::Bool => "Bool",
            PrimitiveType::Int32 => "Int32",
            PrimitiveType::Int64 => "Int64",
            PrimitiveType::Float64 => "Float64",
            PrimitiveType::String => "String",
            PrimitiveType::Object => "Object",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PrimitiveType::Int32 | PrimitiveType::Int64 | PrimitiveType::Float64
        )
    }
}

/// Runtime type of an expression or value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(PrimitiveType),
    Nullable(Box<Type>),
    Array(Box<Type>),
    /// In-memory sequence
    Sequence(Box<Type>),
    /// Composable query over a data source
    Queryable(Box<Type>),
    /// Lambda signature: parameter types and return type
    Function(Vec<Type>, Box<Type>),
    /// User-defined type, possibly generic
    Named(NamedType),
    /// Placeholder inside generic definitions, replaced by [`Type::substitute`]
    GenericParam(usize),
}

impl Type {
    pub fn bool() -> Self {
        Type::Primitive(PrimitiveType::Bool)
    }

    pub fn int32() -> Self {
        Type::Primitive(PrimitiveType::Int32)
    }

    pub fn int64() -> Self {
        Type::Primitive(PrimitiveType::Int64)
    }

    pub fn float64() -> Self {
        Type::Primitive(PrimitiveType::Float64)
    }

    pub fn string() -> Self {
        Type::Primitive(PrimitiveType::String)
    }

    pub fn object() -> Self {
        Type::Primitive(PrimitiveType::Object)
    }

    /// Nullable wrapper; wrapping an already nullable type is a no-op
    pub fn nullable(inner: Type) -> Self {
        match inner {
            Type::Nullable(_) => inner,
            other => Type::Nullable(Box::new(other)),
        }
    }

    pub fn array(element: Type) -> Self {
        Type::Array(Box::new(element))
    }

    pub fn sequence(element: Type) -> Self {
        Type::Sequence(Box::new(element))
    }

    pub fn queryable(element: Type) -> Self {
        Type::Queryable(Box::new(element))
    }

    pub fn function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function(params, Box::new(ret))
    }

    pub fn named(def: &Arc<TypeDef>) -> Self {
        Type::Named(NamedType::new(def.clone(), Vec::new()))
    }

    pub fn generic(def: &Arc<TypeDef>, args: Vec<Type>) -> Self {
        Type::Named(NamedType::new(def.clone(), args))
    }

    /// Element type of arrays, sequences and queryables
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::Array(e) | Type::Sequence(e) | Type::Queryable(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_queryable(&self) -> bool {
        matches!(self, Type::Queryable(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Primitive(PrimitiveType::Bool))
    }

    pub fn as_primitive(&self) -> Option<PrimitiveType> {
        match self {
            Type::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_named(&self) -> Option<&NamedType> {
        match self {
            Type::Named(named) => Some(named),
            _ => None,
        }
    }

    /// Strips one level of `Nullable`
    pub fn non_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Whether values of this type may be null without a `Nullable` wrapper
    pub fn is_reference(&self) -> bool {
        match self {
            Type::Primitive(PrimitiveType::String) | Type::Primitive(PrimitiveType::Object) => true,
            Type::Primitive(_) | Type::Nullable(_) | Type::GenericParam(_) => false,
            Type::Array(_) | Type::Sequence(_) | Type::Queryable(_) | Type::Function(..) => true,
            Type::Named(named) => !named.def().is_enum(),
        }
    }

    pub fn accepts_null(&self) -> bool {
        matches!(self, Type::Nullable(_)) || self.is_reference()
    }

    /// Whether a value of `other` can be used where `self` is expected
    pub fn is_assignable_from(&self, other: &Type) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Type::Primitive(PrimitiveType::Object), _) => true,
            (Type::Nullable(inner), o) => **inner == *o,
            (Type::Sequence(e), Type::Array(o))
            | (Type::Sequence(e), Type::Sequence(o))
            | (Type::Sequence(e), Type::Queryable(o))
            | (Type::Queryable(e), Type::Queryable(o)) => e.is_assignable_from(o),
            (Type::Function(p1, r1), Type::Function(p2, r2)) => {
                p1 == p2 && r1.is_assignable_from(r2)
            }
            _ => false,
        }
    }

    /// Look up a property, including the builtin ones on strings, arrays and
    /// nullables
    pub fn property(&self, name: &str) -> Option<PropertyInfo> {
        let ty = match (self, name) {
            (Type::Named(named), _) => {
                return named.property(name).map(|(_, p)| PropertyInfo {
                    declaring: self.clone(),
                    name: p.name,
                    ty: p.ty,
                })
            }
            (Type::Primitive(PrimitiveType::String), "Length") => Type::int32(),
            (Type::Array(_), "Length") => Type::int32(),
            (Type::Nullable(_), "HasValue") => Type::bool(),
            (Type::Nullable(inner), "Value") => (**inner).clone(),
            _ => return None,
        };
        Some(PropertyInfo {
            declaring: self.clone(),
            name: name.to_string(),
            ty,
        })
    }

    /// Replace generic parameters with the given arguments
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::GenericParam(i) => args.get(*i).cloned().unwrap_or_else(|| self.clone()),
            Type::Primitive(_) => self.clone(),
            Type::Nullable(t) => Type::nullable(t.substitute(args)),
            Type::Array(t) => Type::array(t.substitute(args)),
            Type::Sequence(t) => Type::sequence(t.substitute(args)),
            Type::Queryable(t) => Type::queryable(t.substitute(args)),
            Type::Function(params, ret) => Type::function(
                params.iter().map(|p| p.substitute(args)).collect(),
                ret.substitute(args),
            ),
            Type::Named(named) => Type::Named(NamedType::new(
                named.def.clone(),
                named.args.iter().map(|a| a.substitute(args)).collect(),
            )),
        }
    }
}

impl From<PrimitiveType> for Type {
    fn from(p: PrimitiveType) -> Self {
        Type::Primitive(p)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(p) => write!(f, "{}", p.name()),
            Type::Nullable(inner) => write!(f, "{}?", inner),
            Type::Array(e) => write!(f, "{}[]", e),
            Type::Sequence(e) => write!(f, "Sequence<{}>", e),
            Type::Queryable(e) => write!(f, "Queryable<{}>", e),
            Type::Function(params, ret) => {
                write!(f, "Func<")?;
                for p in params {
                    write!(f, "{}, ", p)?;
                }
                write!(f, "{}>", ret)
            }
            Type::Named(named) => write!(f, "{}", named),
            Type::GenericParam(i) => write!(f, "T{}", i),
        }
    }
}

/// A type definition closed over its generic arguments
#[derive(Debug, Clone)]
pub struct NamedType {
    def: Arc<TypeDef>,
    args: Vec<Type>,
}

impl NamedType {
    pub fn new(def: Arc<TypeDef>, args: Vec<Type>) -> Self {
        Self { def, args }
    }

    pub fn def(&self) -> &Arc<TypeDef> {
        &self.def
    }

    pub fn args(&self) -> &[Type] {
        &self.args
    }

    pub fn full_name(&self) -> &str {
        self.def.full_name()
    }

    /// Properties with generic arguments substituted
    pub fn properties(&self) -> Vec<PropertyDef> {
        self.def
            .properties()
            .iter()
            .map(|p| PropertyDef {
                name: p.name.clone(),
                ty: p.ty.substitute(&self.args),
            })
            .collect()
    }

    /// Property position and definition by name
    pub fn property(&self, name: &str) -> Option<(usize, PropertyDef)> {
        self.def
            .properties()
            .iter()
            .position(|p| p.name == name)
            .map(|index| {
                let p = &self.def.properties()[index];
                (
                    index,
                    PropertyDef {
                        name: p.name.clone(),
                        ty: p.ty.substitute(&self.args),
                    },
                )
            })
    }
}

impl PartialEq for NamedType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.def, &other.def) && self.args == other.args
    }
}

impl Eq for NamedType {}

impl Hash for NamedType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.full_name().hash(state);
        self.args.hash(state);
    }
}

impl fmt::Display for NamedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.def.full_name())?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, "[{}]", args.join(", "))?;
        }
        Ok(())
    }
}

/// Property of a type definition; may mention [`Type::GenericParam`]
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub ty: Type,
}

/// Property bound to a concrete declaring type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyInfo {
    pub declaring: Type,
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDefKind {
    Record(Vec<PropertyDef>),
    /// Structurally typed record; names differ between processes
    Anonymous(Vec<PropertyDef>),
    Enum {
        underlying: PrimitiveType,
        variants: Vec<(String, i64)>,
    },
    /// Holder of static methods only
    Static,
}

/// User-defined type definition
#[derive(Debug)]
pub struct TypeDef {
    name: String,
    namespace: Option<String>,
    declaring: Option<Arc<TypeDef>>,
    generic_params: Vec<String>,
    kind: TypeDefKind,
    full_name: String,
}

impl TypeDef {
    pub fn builder(name: impl Into<String>) -> TypeDefBuilder {
        TypeDefBuilder {
            name: name.into(),
            namespace: None,
            declaring: None,
            generic_params: Vec::new(),
            kind: TypeDefKind::Record(Vec::new()),
        }
    }

    /// Non-generic record in a namespace
    pub fn record(namespace: &str, name: &str, properties: Vec<(&str, Type)>) -> Arc<TypeDef> {
        properties
            .into_iter()
            .fold(TypeDef::builder(name).namespace(namespace), |b, (n, t)| {
                b.property(n, t)
            })
            .build()
    }

    /// Anonymous record with a process-unique name
    pub fn anonymous(properties: Vec<(&str, Type)>) -> Arc<TypeDef> {
        let id = NEXT_ANONYMOUS_ID.fetch_add(1, Ordering::Relaxed);
        properties
            .into_iter()
            .fold(
                TypeDef::builder(format!("<>Anonymous{}", id)).anonymous(),
                |b, (n, t)| b.property(n, t),
            )
            .build()
    }

    pub fn enumeration(namespace: &str, name: &str, variants: Vec<(&str, i64)>) -> Arc<TypeDef> {
        TypeDef::builder(name)
            .namespace(namespace)
            .enumeration(
                PrimitiveType::Int32,
                variants.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
            )
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the outermost declaring type
    pub fn namespace(&self) -> Option<&str> {
        match &self.declaring {
            Some(declaring) => declaring.namespace(),
            None => self.namespace.as_deref(),
        }
    }

    pub fn declaring(&self) -> Option<&Arc<TypeDef>> {
        self.declaring.as_ref()
    }

    pub fn generic_params(&self) -> &[String] {
        &self.generic_params
    }

    pub fn kind(&self) -> &TypeDefKind {
        &self.kind
    }

    /// `namespace.Outer+Inner` with a "`N" suffix for generic definitions
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        match &self.kind {
            TypeDefKind::Record(props) | TypeDefKind::Anonymous(props) => props,
            TypeDefKind::Enum { .. } | TypeDefKind::Static => &[],
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, TypeDefKind::Anonymous(_))
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.kind, TypeDefKind::Enum { .. })
    }

    /// Property names sorted, used for structural matching
    pub fn property_name_set(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.properties().iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn enum_variant(&self, value: i64) -> Option<&str> {
        match &self.kind {
            TypeDefKind::Enum { variants, .. } => variants
                .iter()
                .find(|(_, v)| *v == value)
                .map(|(n, _)| n.as_str()),
            _ => None,
        }
    }
}

pub struct TypeDefBuilder {
    name: String,
    namespace: Option<String>,
    declaring: Option<Arc<TypeDef>>,
    generic_params: Vec<String>,
    kind: TypeDefKind,
}

impl TypeDefBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Declare this type nested inside `outer`
    pub fn nested_in(mut self, outer: &Arc<TypeDef>) -> Self {
        self.declaring = Some(outer.clone());
        self
    }

    pub fn generic_params(mut self, params: &[&str]) -> Self {
        self.generic_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn property(mut self, name: impl Into<String>, ty: Type) -> Self {
        let prop = PropertyDef {
            name: name.into(),
            ty,
        };
        match &mut self.kind {
            TypeDefKind::Record(props) | TypeDefKind::Anonymous(props) => props.push(prop),
            TypeDefKind::Enum { .. } | TypeDefKind::Static => {
                self.kind = TypeDefKind::Record(vec![prop]);
            }
        }
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.kind = match self.kind {
            TypeDefKind::Record(props) => TypeDefKind::Anonymous(props),
            other => other,
        };
        self
    }

    pub fn enumeration(mut self, underlying: PrimitiveType, variants: Vec<(String, i64)>) -> Self {
        self.kind = TypeDefKind::Enum {
            underlying,
            variants,
        };
        self
    }

    pub fn static_class(mut self) -> Self {
        self.kind = TypeDefKind::Static;
        self
    }

    pub fn build(self) -> Arc<TypeDef> {
        let mut full_name = match (&self.declaring, &self.namespace) {
            (Some(outer), _) => format!("{}+{}", outer.full_name(), self.name),
            (None, Some(ns)) => format!("{}.{}", ns, self.name),
            (None, None) => self.name.clone(),
        };
        if !self.generic_params.is_empty() {
            full_name.push_str(&format!("`{}", self.generic_params.len()));
        }
        Arc::new(TypeDef {
            name: self.name,
            namespace: self.namespace,
            declaring: self.declaring,
            generic_params: self.generic_params,
            kind: self.kind,
            full_name,
        })
    }
}
