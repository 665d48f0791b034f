//! Serializable remote expression model.
//!
//! A [`RemoteExpression`] is self-contained: type and member identities are
//! carried as descriptors in a [`TypeTable`], runtime values captured by the
//! query travel as [`QueryArgument`]s, and data sources are left as
//! [`ResourceNode`] placeholders for the executing side to bind.

pub mod constant;
pub mod descriptor;
pub mod node;
pub mod visitor;

pub use constant::{ArgumentId, ConstantValue, DynamicObject, DynamicProperty, QueryArgument};
pub use descriptor::{
    ConstructorDescriptor, DescriptorProperty, MethodBinding, MethodDescriptor,
    PropertyDescriptor, TypeDescriptor, TypeId, TypeTable, TypeTableBuilder,
};
pub use node::{
    BinaryNode, CallNode, CollectionNode, ConditionalNode, ConstantCollectionNode, ConstantNode,
    ConvertNode, LambdaNode, MemberBindingNode, MemberInitNode, MemberNode, NewNode,
    ParameterNode, RemoteExpr, RemoteExpression, ResourceNode, UnaryNode,
};
pub use visitor::RemoteVisitor;
