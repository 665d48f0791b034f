//! Native expression trees for query composition.
//!
//! This module provides:
//! - Expression AST representation with lambdas bound by parameter identity
//! - Method metadata dispatched by operation kind rather than by name
//! - Type checking and validation of translated trees
//! - Expression evaluation against in-memory and live data
//! - A rewriting pass used by partial evaluation and query inlining

pub mod error;
pub mod eval;
pub mod expr;
pub mod method;
pub mod operator;
pub mod rewrite;
pub mod type_checker;

pub use error::{ExpressionError, ExpressionResult};
pub use eval::{evaluate, ExpressionEvaluator};
pub use expr::{
    Closure, Constant, ConstantOrigin, Expression, LambdaExpr, MemberBinding, ParameterRef,
};
pub use method::{
    include_marker, Intrinsic, MarkerMap, MethodDef, MethodInfo, MethodKey, MethodKind,
    MethodLookupError, MethodRegistry, NativeFn, QueryOperator, SourceKind,
};
pub use operator::{BinaryOperator, UnaryOperator};
pub use rewrite::ExpressionRewriter;
pub use type_checker::{type_check_expression, validate_lambda, TypeChecker};
