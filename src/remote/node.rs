//! Remote expression nodes.

use crate::expression::{BinaryOperator, UnaryOperator};
use crate::remote::constant::{ArgumentId, ConstantValue, QueryArgument};
use crate::remote::descriptor::{
    ConstructorDescriptor, MethodDescriptor, PropertyDescriptor, TypeId, TypeTable,
};
use crate::remote::visitor::RemoteVisitor;
use crate::{QueryError, Result};
use serde::{Deserialize, Serialize};

/// Closed set of serializable expression nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteExpr {
    /// Inline literal
    Constant(ConstantNode),
    /// Reference to a query argument
    Variable(ArgumentId),
    Parameter(ParameterNode),
    Binary(BinaryNode),
    Unary(UnaryNode),
    Convert(ConvertNode),
    Member(MemberNode),
    Call(CallNode),
    Lambda(LambdaNode),
    New(NewNode),
    MemberInit(MemberInitNode),
    ListInit(CollectionNode),
    NewArray(CollectionNode),
    Conditional(ConditionalNode),
    /// Literal array or sequence of scalars
    ConstantCollection(ConstantCollectionNode),
    /// Data source bound by the executing side
    Resource(ResourceNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantNode {
    pub ty: TypeId,
    pub value: ConstantValue,
}

/// Parameters are matched by `(ty, name)` within one tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterNode {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryNode {
    pub op: BinaryOperator,
    pub left: Box<RemoteExpr>,
    pub right: Box<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryNode {
    pub op: UnaryOperator,
    pub operand: Box<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertNode {
    pub operand: Box<RemoteExpr>,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberNode {
    pub instance: Box<RemoteExpr>,
    pub member: PropertyDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    pub instance: Option<Box<RemoteExpr>>,
    pub method: MethodDescriptor,
    pub args: Vec<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaNode {
    pub params: Vec<ParameterNode>,
    pub body: Box<RemoteExpr>,
}

/// Constructor call; `members` names the property each argument initializes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub constructor: ConstructorDescriptor,
    pub members: Vec<String>,
    pub args: Vec<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberBindingNode {
    pub member: PropertyDescriptor,
    pub value: RemoteExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInitNode {
    pub ty: TypeId,
    pub bindings: Vec<MemberBindingNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionNode {
    pub element: TypeId,
    pub items: Vec<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalNode {
    pub test: Box<RemoteExpr>,
    pub if_true: Box<RemoteExpr>,
    pub if_false: Box<RemoteExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantCollectionNode {
    pub element: TypeId,
    pub is_array: bool,
    pub values: Vec<ConstantValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub element: TypeId,
    /// Provider hint identifying the data source
    pub name: Option<String>,
}

/// Self-contained translated query: descriptors, arguments and the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteExpression {
    pub types: TypeTable,
    pub arguments: Vec<QueryArgument>,
    pub root: RemoteExpr,
}

impl RemoteExpression {
    pub fn argument(&self, id: ArgumentId) -> Result<&QueryArgument> {
        self.arguments.get(id.index()).ok_or_else(|| {
            QueryError::translation(format!("argument #{} is not present", id.0))
        })
    }

    /// First argument with the given name
    pub fn argument_named(&self, name: &str) -> Option<(ArgumentId, &QueryArgument)> {
        self.arguments
            .iter()
            .enumerate()
            .find(|(_, a)| a.name.as_deref() == Some(name))
            .map(|(i, a)| (ArgumentId(i as u32), a))
    }

    /// Replace an argument value without touching the tree
    pub fn set_argument(&mut self, id: ArgumentId, value: ConstantValue) -> Result<()> {
        let argument = self.arguments.get_mut(id.index()).ok_or_else(|| {
            QueryError::translation(format!("argument #{} is not present", id.0))
        })?;
        argument.value = value;
        Ok(())
    }

    /// Resource placeholders in tree order
    pub fn resources(&self) -> Vec<ResourceNode> {
        #[derive(Default)]
        struct Collect(Vec<ResourceNode>);

        impl RemoteVisitor for Collect {
            fn visit_resource(&mut self, node: &ResourceNode) -> Option<RemoteExpr> {
                self.0.push(node.clone());
                None
            }
        }

        let mut collect = Collect::default();
        collect.visit(&self.root);
        collect.0
    }

    /// Replace every argument reference by an inline constant
    pub fn inline_arguments(&self) -> Result<RemoteExpression> {
        struct Inline<'a> {
            arguments: &'a [QueryArgument],
            missing: Option<ArgumentId>,
        }

        impl RemoteVisitor for Inline<'_> {
            fn visit_variable(&mut self, id: ArgumentId) -> Option<RemoteExpr> {
                match self.arguments.get(id.index()) {
                    Some(argument) => Some(RemoteExpr::Constant(ConstantNode {
                        ty: argument.ty,
                        value: argument.value.clone(),
                    })),
                    None => {
                        self.missing = Some(id);
                        None
                    }
                }
            }
        }

        let mut inline = Inline {
            arguments: &self.arguments,
            missing: None,
        };
        let root = inline.apply(&self.root);
        if let Some(id) = inline.missing {
            return Err(QueryError::translation(format!(
                "argument #{} is not present",
                id.0
            )));
        }
        Ok(RemoteExpression {
            types: self.types.clone(),
            arguments: Vec::new(),
            root,
        })
    }

    pub fn node_count(&self) -> usize {
        struct Count(usize);

        impl RemoteVisitor for Count {
            fn visit(&mut self, expr: &RemoteExpr) -> Option<RemoteExpr> {
                self.0 += 1;
                self.walk(expr)
            }
        }

        let mut count = Count(0);
        count.visit(&self.root);
        count.0
    }
}
