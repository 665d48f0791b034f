//! Runtime type model.
//!
//! This module provides:
//! - [`Type`]: the runtime type of every expression node and value
//! - [`TypeDef`]: user-defined records, anonymous records, enums and static
//!   method holders
//! - [`TypeRegistry`]: the set of type definitions loaded in this process
//! - [`ResolutionContext`]: maps serialized type/member descriptors back to
//!   runtime types and members

pub mod builtin;
pub mod registry;
pub mod ty;

pub use registry::{ChainResolver, ResolutionCache, ResolutionContext, TypeRegistry, TypeResolver};
pub use ty::{
    NamedType, PrimitiveType, PropertyDef, PropertyInfo, Type, TypeDef, TypeDefBuilder,
    TypeDefKind,
};
