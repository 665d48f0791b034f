//! Remote tree traversal.
//!
//! Every `visit_*` method returns `None` when the node is unchanged. The
//! default implementations visit the children and rebuild the node only
//! when at least one child changed, so an identity visitor clones nothing.

use crate::remote::constant::ArgumentId;
use crate::remote::node::{
    BinaryNode, CallNode, CollectionNode, ConditionalNode, ConstantCollectionNode, ConstantNode,
    ConvertNode, LambdaNode, MemberBindingNode, MemberInitNode, MemberNode, NewNode,
    ParameterNode, RemoteExpr, ResourceNode, UnaryNode,
};

pub trait RemoteVisitor {
    fn visit(&mut self, expr: &RemoteExpr) -> Option<RemoteExpr> {
        self.walk(expr)
    }

    /// Dispatch to the method for the node kind
    fn walk(&mut self, expr: &RemoteExpr) -> Option<RemoteExpr> {
        match expr {
            RemoteExpr::Constant(node) => self.visit_constant(node),
            RemoteExpr::Variable(id) => self.visit_variable(*id),
            RemoteExpr::Parameter(node) => self.visit_parameter(node),
            RemoteExpr::Binary(node) => self.visit_binary(node),
            RemoteExpr::Unary(node) => self.visit_unary(node),
            RemoteExpr::Convert(node) => self.visit_convert(node),
            RemoteExpr::Member(node) => self.visit_member(node),
            RemoteExpr::Call(node) => self.visit_call(node),
            RemoteExpr::Lambda(node) => self.visit_lambda(node),
            RemoteExpr::New(node) => self.visit_new(node),
            RemoteExpr::MemberInit(node) => self.visit_member_init(node),
            RemoteExpr::ListInit(node) => self
                .visit_collection(node)
                .map(RemoteExpr::ListInit),
            RemoteExpr::NewArray(node) => self
                .visit_collection(node)
                .map(RemoteExpr::NewArray),
            RemoteExpr::Conditional(node) => self.visit_conditional(node),
            RemoteExpr::ConstantCollection(node) => self.visit_constant_collection(node),
            RemoteExpr::Resource(node) => self.visit_resource(node),
        }
    }

    /// Visit and return the rewritten tree
    fn apply(&mut self, expr: &RemoteExpr) -> RemoteExpr {
        self.visit(expr).unwrap_or_else(|| expr.clone())
    }

    fn visit_constant(&mut self, _node: &ConstantNode) -> Option<RemoteExpr> {
        None
    }

    fn visit_variable(&mut self, _id: ArgumentId) -> Option<RemoteExpr> {
        None
    }

    fn visit_parameter(&mut self, _node: &ParameterNode) -> Option<RemoteExpr> {
        None
    }

    fn visit_binary(&mut self, node: &BinaryNode) -> Option<RemoteExpr> {
        let left = self.visit(&node.left);
        let right = self.visit(&node.right);
        if left.is_none() && right.is_none() {
            return None;
        }
        Some(RemoteExpr::Binary(BinaryNode {
            op: node.op,
            left: Box::new(left.unwrap_or_else(|| (*node.left).clone())),
            right: Box::new(right.unwrap_or_else(|| (*node.right).clone())),
        }))
    }

    fn visit_unary(&mut self, node: &UnaryNode) -> Option<RemoteExpr> {
        self.visit(&node.operand).map(|operand| {
            RemoteExpr::Unary(UnaryNode {
                op: node.op,
                operand: Box::new(operand),
            })
        })
    }

    fn visit_convert(&mut self, node: &ConvertNode) -> Option<RemoteExpr> {
        self.visit(&node.operand).map(|operand| {
            RemoteExpr::Convert(ConvertNode {
                operand: Box::new(operand),
                ty: node.ty,
            })
        })
    }

    fn visit_member(&mut self, node: &MemberNode) -> Option<RemoteExpr> {
        self.visit(&node.instance).map(|instance| {
            RemoteExpr::Member(MemberNode {
                instance: Box::new(instance),
                member: node.member.clone(),
            })
        })
    }

    fn visit_call(&mut self, node: &CallNode) -> Option<RemoteExpr> {
        let instance = node.instance.as_ref().and_then(|i| self.visit(i));
        let args = visit_all(self, &node.args);
        if instance.is_none() && args.is_none() {
            return None;
        }
        Some(RemoteExpr::Call(CallNode {
            instance: match instance {
                Some(i) => Some(Box::new(i)),
                None => node.instance.clone(),
            },
            method: node.method.clone(),
            args: args.unwrap_or_else(|| node.args.clone()),
        }))
    }

    fn visit_lambda(&mut self, node: &LambdaNode) -> Option<RemoteExpr> {
        self.visit(&node.body).map(|body| {
            RemoteExpr::Lambda(LambdaNode {
                params: node.params.clone(),
                body: Box::new(body),
            })
        })
    }

    fn visit_new(&mut self, node: &NewNode) -> Option<RemoteExpr> {
        visit_all(self, &node.args).map(|args| {
            RemoteExpr::New(NewNode {
                constructor: node.constructor.clone(),
                members: node.members.clone(),
                args,
            })
        })
    }

    fn visit_member_init(&mut self, node: &MemberInitNode) -> Option<RemoteExpr> {
        let values: Vec<Option<RemoteExpr>> =
            node.bindings.iter().map(|b| self.visit(&b.value)).collect();
        if values.iter().all(Option::is_none) {
            return None;
        }
        Some(RemoteExpr::MemberInit(MemberInitNode {
            ty: node.ty,
            bindings: node
                .bindings
                .iter()
                .zip(values)
                .map(|(b, v)| MemberBindingNode {
                    member: b.member.clone(),
                    value: v.unwrap_or_else(|| b.value.clone()),
                })
                .collect(),
        }))
    }

    /// Shared by list initializers and array constructors
    fn visit_collection(&mut self, node: &CollectionNode) -> Option<CollectionNode> {
        visit_all(self, &node.items).map(|items| CollectionNode {
            element: node.element,
            items,
        })
    }

    fn visit_conditional(&mut self, node: &ConditionalNode) -> Option<RemoteExpr> {
        let test = self.visit(&node.test);
        let if_true = self.visit(&node.if_true);
        let if_false = self.visit(&node.if_false);
        if test.is_none() && if_true.is_none() && if_false.is_none() {
            return None;
        }
        Some(RemoteExpr::Conditional(ConditionalNode {
            test: Box::new(test.unwrap_or_else(|| (*node.test).clone())),
            if_true: Box::new(if_true.unwrap_or_else(|| (*node.if_true).clone())),
            if_false: Box::new(if_false.unwrap_or_else(|| (*node.if_false).clone())),
        }))
    }

    fn visit_constant_collection(&mut self, _node: &ConstantCollectionNode) -> Option<RemoteExpr> {
        None
    }

    fn visit_resource(&mut self, _node: &ResourceNode) -> Option<RemoteExpr> {
        None
    }
}

/// Visit each item; `Some` with the full list when any item changed
fn visit_all<V: RemoteVisitor + ?Sized>(
    visitor: &mut V,
    items: &[RemoteExpr],
) -> Option<Vec<RemoteExpr>> {
    let visited: Vec<Option<RemoteExpr>> = items.iter().map(|i| visitor.visit(i)).collect();
    if visited.iter().all(Option::is_none) {
        return None;
    }
    Some(
        items
            .iter()
            .zip(visited)
            .map(|(item, v)| v.unwrap_or_else(|| item.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::BinaryOperator;
    use crate::remote::constant::ConstantValue;
    use crate::remote::descriptor::TypeId;

    struct Identity;

    impl RemoteVisitor for Identity {}

    /// Renames every parameter
    struct Rename;

    impl RemoteVisitor for Rename {
        fn visit_parameter(&mut self, node: &ParameterNode) -> Option<RemoteExpr> {
            Some(RemoteExpr::Parameter(ParameterNode {
                name: format!("{}2", node.name),
                ty: node.ty,
            }))
        }
    }

    fn tree() -> RemoteExpr {
        let param = RemoteExpr::Parameter(ParameterNode {
            name: "x".to_string(),
            ty: TypeId(0),
        });
        RemoteExpr::Lambda(LambdaNode {
            params: vec![ParameterNode {
                name: "x".to_string(),
                ty: TypeId(0),
            }],
            body: Box::new(RemoteExpr::Binary(BinaryNode {
                op: BinaryOperator::Add,
                left: Box::new(param),
                right: Box::new(RemoteExpr::Constant(ConstantNode {
                    ty: TypeId(0),
                    value: ConstantValue::Int32(1),
                })),
            })),
        })
    }

    #[test]
    fn test_identity_visitor_reports_no_change() {
        assert!(Identity.visit(&tree()).is_none());
        assert_eq!(Identity.apply(&tree()), tree());
    }

    #[test]
    fn test_rebuilds_changed_path_only() {
        let renamed = Rename.apply(&tree());
        let RemoteExpr::Lambda(lambda) = renamed else {
            panic!("lambda expected");
        };
        // Declared parameters are not body nodes
        assert_eq!(lambda.params[0].name, "x");
        let RemoteExpr::Binary(body) = *lambda.body else {
            panic!("binary expected");
        };
        assert!(matches!(&*body.left, RemoteExpr::Parameter(p) if p.name == "x2"));
        assert!(matches!(&*body.right, RemoteExpr::Constant(_)));
    }
}
