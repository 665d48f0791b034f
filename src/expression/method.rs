//! Method metadata and operation-kind dispatch.
//!
//! Methods are described by [`MethodDef`] templates (possibly generic) and
//! instantiated into [`MethodInfo`]s bound to concrete types. What a call
//! does at evaluation time is decided by its [`MethodKind`]; there is no
//! lookup by name once a call node exists.

use crate::expression::{ExpressionError, ExpressionResult};
use crate::types::{builtin, PrimitiveType, Type};
use crate::value::Value;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Host function backing a registered method; instance methods receive the
/// instance as the first value
pub type NativeFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Which operator family a query operator belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// `core.QueryOps`, operating on `Queryable<T>`
    Queryable,
    /// `core.SequenceOps`, operating on in-memory `Sequence<T>`
    Sequence,
}

impl SourceKind {
    pub fn declaring(self) -> Type {
        match self {
            SourceKind::Queryable => Type::named(&builtin::query_ops()),
            SourceKind::Sequence => Type::named(&builtin::sequence_ops()),
        }
    }

    pub fn wrap(self, element: Type) -> Type {
        match self {
            SourceKind::Queryable => Type::queryable(element),
            SourceKind::Sequence => Type::sequence(element),
        }
    }

    /// Operator family that accepts a source of type `ty`
    pub fn of(ty: &Type) -> Option<SourceKind> {
        match ty {
            Type::Queryable(_) => Some(SourceKind::Queryable),
            Type::Sequence(_) | Type::Array(_) => Some(SourceKind::Sequence),
            _ => None,
        }
    }
}

/// Closed set of query operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperator {
    Where,
    Select,
    SelectMany,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Skip,
    Take,
    Distinct,
    Count,
    CountWhere,
    Any,
    AnyWhere,
    All,
    First,
    FirstWhere,
    FirstOrDefault,
    Single,
    SingleWhere,
    SingleOrDefault,
    Sum,
    Min,
    Max,
    Contains,
}

impl QueryOperator {
    pub const ALL: [QueryOperator; 25] = [
        QueryOperator::Where,
        QueryOperator::Select,
        QueryOperator::SelectMany,
        QueryOperator::OrderBy,
        QueryOperator::OrderByDescending,
        QueryOperator::ThenBy,
        QueryOperator::ThenByDescending,
        QueryOperator::Skip,
        QueryOperator::Take,
        QueryOperator::Distinct,
        QueryOperator::Count,
        QueryOperator::CountWhere,
        QueryOperator::Any,
        QueryOperator::AnyWhere,
        QueryOperator::All,
        QueryOperator::First,
        QueryOperator::FirstWhere,
        QueryOperator::FirstOrDefault,
        QueryOperator::Single,
        QueryOperator::SingleWhere,
        QueryOperator::SingleOrDefault,
        QueryOperator::Sum,
        QueryOperator::Min,
        QueryOperator::Max,
        QueryOperator::Contains,
    ];

    /// Method name; overloads share a name and differ by parameter count
    pub fn name(self) -> &'static str {
        match self {
            QueryOperator::Where => "Where",
            QueryOperator::Select => "Select",
            QueryOperator::SelectMany => "SelectMany",
            QueryOperator::OrderBy => "OrderBy",
            QueryOperator::OrderByDescending => "OrderByDescending",
            QueryOperator::ThenBy => "ThenBy",
            QueryOperator::ThenByDescending => "ThenByDescending",
            QueryOperator::Skip => "Skip",
            QueryOperator::Take => "Take",
            QueryOperator::Distinct => "Distinct",
            QueryOperator::Count | QueryOperator::CountWhere => "Count",
            QueryOperator::Any | QueryOperator::AnyWhere => "Any",
            QueryOperator::All => "All",
            QueryOperator::First | QueryOperator::FirstWhere => "First",
            QueryOperator::FirstOrDefault => "FirstOrDefault",
            QueryOperator::Single | QueryOperator::SingleWhere => "Single",
            QueryOperator::SingleOrDefault => "SingleOrDefault",
            QueryOperator::Sum => "Sum",
            QueryOperator::Min => "Min",
            QueryOperator::Max => "Max",
            QueryOperator::Contains => "Contains",
        }
    }

    /// Number of generic arguments: the element type, plus a result or key
    /// type for projecting operators
    pub fn generic_arity(self) -> usize {
        match self {
            QueryOperator::Select
            | QueryOperator::SelectMany
            | QueryOperator::OrderBy
            | QueryOperator::OrderByDescending
            | QueryOperator::ThenBy
            | QueryOperator::ThenByDescending
            | QueryOperator::Sum
            | QueryOperator::Min
            | QueryOperator::Max => 2,
            _ => 1,
        }
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            QueryOperator::OrderBy
                | QueryOperator::OrderByDescending
                | QueryOperator::ThenBy
                | QueryOperator::ThenByDescending
        )
    }

    /// Parameter and return types over `T0` (element) and `T1`
    fn signature(self, kind: SourceKind) -> (Vec<Type>, Type) {
        let t = Type::GenericParam(0);
        let r = Type::GenericParam(1);
        let src = kind.wrap(t.clone());
        let predicate = Type::function(vec![t.clone()], Type::bool());
        let selector = Type::function(vec![t.clone()], r.clone());
        match self {
            QueryOperator::Where => (vec![src.clone(), predicate], src),
            QueryOperator::Select => (vec![src, selector], kind.wrap(r)),
            QueryOperator::SelectMany => (
                vec![src, Type::function(vec![t], Type::sequence(r.clone()))],
                kind.wrap(r),
            ),
            QueryOperator::OrderBy
            | QueryOperator::OrderByDescending
            | QueryOperator::ThenBy
            | QueryOperator::ThenByDescending => (vec![src.clone(), selector], src),
            QueryOperator::Skip | QueryOperator::Take => (vec![src.clone(), Type::int32()], src),
            QueryOperator::Distinct => (vec![src.clone()], src),
            QueryOperator::Count => (vec![src], Type::int32()),
            QueryOperator::CountWhere => (vec![src, predicate], Type::int32()),
            QueryOperator::Any => (vec![src], Type::bool()),
            QueryOperator::AnyWhere | QueryOperator::All => (vec![src, predicate], Type::bool()),
            QueryOperator::First
            | QueryOperator::FirstOrDefault
            | QueryOperator::Single
            | QueryOperator::SingleOrDefault => (vec![src], t),
            QueryOperator::FirstWhere | QueryOperator::SingleWhere => (vec![src, predicate], t),
            QueryOperator::Sum | QueryOperator::Min | QueryOperator::Max => {
                (vec![src, selector], r)
            }
            QueryOperator::Contains => (vec![src, t], Type::bool()),
        }
    }

    pub fn def(self, kind: SourceKind) -> MethodDef {
        let (parameters, return_type) = self.signature(kind);
        MethodDef {
            declaring: kind.declaring(),
            name: self.name().to_string(),
            generic_arity: self.generic_arity(),
            parameters,
            return_type,
            is_static: true,
            is_public: true,
            kind: MethodKind::Query(self, kind),
        }
    }
}

/// Methods with a builtin implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Contains,
    StartsWith,
    EndsWith,
    ToUpper,
    ToLower,
    Abs(PrimitiveType),
    /// Milliseconds since the Unix epoch
    Now,
}

impl Intrinsic {
    pub const ALL: [Intrinsic; 9] = [
        Intrinsic::Contains,
        Intrinsic::StartsWith,
        Intrinsic::EndsWith,
        Intrinsic::ToUpper,
        Intrinsic::ToLower,
        Intrinsic::Abs(PrimitiveType::Int32),
        Intrinsic::Abs(PrimitiveType::Int64),
        Intrinsic::Abs(PrimitiveType::Float64),
        Intrinsic::Now,
    ];

    pub fn def(self) -> MethodDef {
        let (declaring, name, is_static, parameters, return_type) = match self {
            Intrinsic::Contains => (Type::string(), "Contains", false, vec![Type::string()], Type::bool()),
            Intrinsic::StartsWith => (Type::string(), "StartsWith", false, vec![Type::string()], Type::bool()),
            Intrinsic::EndsWith => (Type::string(), "EndsWith", false, vec![Type::string()], Type::bool()),
            Intrinsic::ToUpper => (Type::string(), "ToUpper", false, vec![], Type::string()),
            Intrinsic::ToLower => (Type::string(), "ToLower", false, vec![], Type::string()),
            Intrinsic::Abs(p) => (
                Type::named(&builtin::math()),
                "Abs",
                true,
                vec![Type::Primitive(p)],
                Type::Primitive(p),
            ),
            Intrinsic::Now => (Type::named(&builtin::clock()), "Now", true, vec![], Type::int64()),
        };
        MethodDef {
            declaring,
            name: name.to_string(),
            generic_arity: 0,
            parameters,
            return_type,
            is_static,
            is_public: true,
            kind: MethodKind::Intrinsic(self),
        }
    }
}

/// `QueryHints.Include[T](Queryable<T>, String)`: eager-load hint that only a
/// data provider can interpret
pub fn include_marker() -> MethodDef {
    let t = Type::GenericParam(0);
    MethodDef {
        declaring: Type::named(&builtin::query_hints()),
        name: "Include".to_string(),
        generic_arity: 1,
        parameters: vec![Type::queryable(t.clone()), Type::string()],
        return_type: Type::queryable(t),
        is_static: true,
        is_public: true,
        kind: MethodKind::Marker,
    }
}

#[derive(Clone)]
pub enum MethodKind {
    Query(QueryOperator, SourceKind),
    Intrinsic(Intrinsic),
    /// Never evaluated locally; rewritten by the receiving side
    Marker,
    Native(NativeFn),
}

impl MethodKind {
    fn same(&self, other: &MethodKind) -> bool {
        match (self, other) {
            (MethodKind::Query(a, ak), MethodKind::Query(b, bk)) => a == b && ak == bk,
            (MethodKind::Intrinsic(a), MethodKind::Intrinsic(b)) => a == b,
            (MethodKind::Marker, MethodKind::Marker) => true,
            (MethodKind::Native(a), MethodKind::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKind::Query(op, kind) => write!(f, "Query({:?}, {:?})", op, kind),
            MethodKind::Intrinsic(i) => write!(f, "Intrinsic({:?})", i),
            MethodKind::Marker => write!(f, "Marker"),
            MethodKind::Native(_) => write!(f, "Native"),
        }
    }
}

/// Signature of a generic method definition, independent of its type arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub declaring: String,
    pub name: String,
    pub generic_arity: usize,
    pub parameter_count: usize,
}

/// Method template; parameter and return types may mention generic parameters
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub declaring: Type,
    pub name: String,
    pub generic_arity: usize,
    pub parameters: Vec<Type>,
    pub return_type: Type,
    pub is_static: bool,
    pub is_public: bool,
    pub kind: MethodKind,
}

impl MethodDef {
    /// Static method backed by a host function
    pub fn native(
        declaring: Type,
        name: &str,
        parameters: Vec<Type>,
        return_type: Type,
        f: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            declaring,
            name: name.to_string(),
            generic_arity: 0,
            parameters,
            return_type,
            is_static: true,
            is_public: true,
            kind: MethodKind::Native(Arc::new(f)),
        }
    }

    pub fn with_generic_arity(mut self, arity: usize) -> Self {
        self.generic_arity = arity;
        self
    }

    pub fn key(&self) -> MethodKey {
        MethodKey {
            declaring: self.declaring.to_string(),
            name: self.name.clone(),
            generic_arity: self.generic_arity,
            parameter_count: self.parameters.len(),
        }
    }

    pub fn instantiate(&self, generic_args: &[Type]) -> MethodInfo {
        MethodInfo {
            declaring: self.declaring.clone(),
            name: self.name.clone(),
            generic_args: generic_args.to_vec(),
            parameters: self
                .parameters
                .iter()
                .map(|p| p.substitute(generic_args))
                .collect(),
            return_type: self.return_type.substitute(generic_args),
            is_static: self.is_static,
            is_public: self.is_public,
            kind: self.kind.clone(),
        }
    }
}

/// Method bound to concrete types
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub declaring: Type,
    pub name: String,
    pub generic_args: Vec<Type>,
    pub parameters: Vec<Type>,
    pub return_type: Type,
    pub is_static: bool,
    pub is_public: bool,
    pub kind: MethodKind,
}

impl MethodInfo {
    pub fn key(&self) -> MethodKey {
        MethodKey {
            declaring: self.declaring.to_string(),
            name: self.name.clone(),
            generic_arity: self.generic_args.len(),
            parameter_count: self.parameters.len(),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self.kind, MethodKind::Marker)
    }

    pub fn query_operator(&self) -> Option<(QueryOperator, SourceKind)> {
        match self.kind {
            MethodKind::Query(op, kind) => Some((op, kind)),
            _ => None,
        }
    }
}

impl PartialEq for MethodInfo {
    fn eq(&self, other: &Self) -> bool {
        self.declaring == other.declaring
            && self.name == other.name
            && self.generic_args == other.generic_args
            && self.parameters == other.parameters
            && self.return_type == other.return_type
            && self.is_static == other.is_static
            && self.is_public == other.is_public
            && self.kind.same(&other.kind)
    }
}

impl fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring, self.name)?;
        if !self.generic_args.is_empty() {
            let args: Vec<String> = self.generic_args.iter().map(|a| a.to_string()).collect();
            write!(f, "[{}]", args.join(", "))?;
        }
        let params: Vec<String> = self.parameters.iter().map(|p| p.to_string()).collect();
        write!(f, "({})", params.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodLookupError {
    #[error("no loaded method matches the signature")]
    NotFound,
    #[error("signature is ambiguous between {0} loaded methods")]
    Ambiguous(usize),
}

type OperatorKey = (QueryOperator, SourceKind, Vec<Type>);

/// Loaded methods, plus a cache of instantiated query operators
pub struct MethodRegistry {
    methods: RwLock<Vec<Arc<MethodDef>>>,
    operators: DashMap<OperatorKey, Arc<MethodInfo>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.len())
            .field("cached_operators", &self.operators.len())
            .finish()
    }
}

impl MethodRegistry {
    /// Registry with the query operators, intrinsics and markers loaded
    pub fn new() -> Self {
        let registry = Self::empty();
        for kind in [SourceKind::Queryable, SourceKind::Sequence] {
            for op in QueryOperator::ALL {
                registry.register(op.def(kind));
            }
        }
        for intrinsic in Intrinsic::ALL {
            registry.register(intrinsic.def());
        }
        registry.register(include_marker());
        registry
    }

    pub fn empty() -> Self {
        Self {
            methods: RwLock::new(Vec::new()),
            operators: DashMap::new(),
        }
    }

    pub fn register(&self, def: MethodDef) {
        self.methods.write().push(Arc::new(def));
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }

    /// Query operator instantiated for `generic_args`, resolved once per key
    pub fn query_operator(
        &self,
        op: QueryOperator,
        kind: SourceKind,
        generic_args: &[Type],
    ) -> ExpressionResult<Arc<MethodInfo>> {
        if generic_args.len() != op.generic_arity() {
            return Err(ExpressionError::EvaluationError {
                message: format!(
                    "{} takes {} generic arguments, got {}",
                    op.name(),
                    op.generic_arity(),
                    generic_args.len()
                ),
            });
        }
        let key = (op, kind, generic_args.to_vec());
        if let Some(method) = self.operators.get(&key) {
            return Ok(method.clone());
        }
        let method = self
            .operators
            .entry(key)
            .or_insert_with(|| Arc::new(op.def(kind).instantiate(generic_args)))
            .clone();
        Ok(method)
    }

    pub fn intrinsic(&self, intrinsic: Intrinsic) -> Arc<MethodInfo> {
        Arc::new(intrinsic.def().instantiate(&[]))
    }

    pub fn include(&self, element: &Type) -> Arc<MethodInfo> {
        Arc::new(include_marker().instantiate(std::slice::from_ref(element)))
    }

    /// Unique method matching name, generic arity and exact parameter types
    pub fn find(
        &self,
        declaring: &Type,
        name: &str,
        generic_args: &[Type],
        parameters: &[Type],
        is_static: bool,
    ) -> Result<Arc<MethodInfo>, MethodLookupError> {
        let mut matches: Vec<MethodInfo> = self
            .methods
            .read()
            .iter()
            .filter(|def| {
                def.declaring == *declaring
                    && def.name == name
                    && def.is_static == is_static
                    && def.generic_arity == generic_args.len()
                    && def.parameters.len() == parameters.len()
            })
            .map(|def| def.instantiate(generic_args))
            .filter(|info| info.parameters == parameters)
            .collect();

        match matches.len() {
            0 => Err(MethodLookupError::NotFound),
            1 => {
                let info = matches.remove(0);
                match info.kind {
                    MethodKind::Query(op, kind) => self
                        .query_operator(op, kind, generic_args)
                        .map_err(|_| MethodLookupError::NotFound),
                    _ => Ok(Arc::new(info)),
                }
            }
            n => Err(MethodLookupError::Ambiguous(n)),
        }
    }
}

/// Replacement of marker methods by concrete provider methods, keyed by the
/// marker's generic definition
#[derive(Debug, Clone, Default)]
pub struct MarkerMap {
    replacements: HashMap<MethodKey, MethodDef>,
}

impl MarkerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls of `marker` to `replacement`, which must take the same
    /// generic arguments
    pub fn map(mut self, marker: &MethodDef, replacement: MethodDef) -> Self {
        self.replacements.insert(marker.key(), replacement);
        self
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    /// Concrete method for a marker call, if one is mapped
    pub fn rewrite(&self, method: &MethodInfo) -> Option<MethodInfo> {
        self.replacements
            .get(&method.key())
            .filter(|def| def.generic_arity == method.generic_args.len())
            .map(|def| def.instantiate(&method.generic_args))
    }
}
