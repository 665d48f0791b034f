//! Native to remote translation.

use crate::expression::{
    BinaryOperator, Constant, ConstantOrigin, Expression, ExpressionRewriter, UnaryOperator,
};
use crate::remote::{
    ArgumentId, BinaryNode, CallNode, CollectionNode, ConditionalNode, ConstantCollectionNode,
    ConstantNode, ConstructorDescriptor, ConvertNode, LambdaNode, MemberBindingNode,
    MemberInitNode, MemberNode, NewNode, ParameterNode, QueryArgument, RemoteExpr,
    RemoteExpression, ResourceNode, TypeTableBuilder, UnaryNode,
};
use crate::translate::partial_eval::partial_evaluate;
use crate::translate::values::to_constant;
use crate::types::Type;
use crate::value::{QueryableValue, Value};
use crate::{QueryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationOptions {
    /// Evaluate parameter-free subtrees on the client
    pub partial_evaluation: bool,
    /// Rewrite `x == true`, `x != null` and similar comparisons
    pub simplify_boolean_comparisons: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            partial_evaluation: true,
            simplify_boolean_comparisons: true,
        }
    }
}

/// Translate with default options
pub fn to_remote(expr: &Expression) -> Result<RemoteExpression> {
    OutboundTranslator::new(TranslationOptions::default()).translate(expr)
}

/// One-shot translator; the type table and argument list belong to one
/// translation
pub struct OutboundTranslator {
    options: TranslationOptions,
    types: TypeTableBuilder,
    arguments: Vec<QueryArgument>,
}

impl OutboundTranslator {
    pub fn new(options: TranslationOptions) -> Self {
        Self {
            options,
            types: TypeTableBuilder::new(),
            arguments: Vec::new(),
        }
    }

    pub fn translate(mut self, expr: &Expression) -> Result<RemoteExpression> {
        let expr = QueryInliner.rewrite(expr)?;
        let expr = if self.options.partial_evaluation {
            partial_evaluate(&expr)?
        } else {
            expr
        };
        let root = self.node(&expr)?;
        log::debug!(
            "translated {} into {} types and {} arguments",
            expr,
            self.types.len(),
            self.arguments.len()
        );
        Ok(RemoteExpression {
            types: self.types.finish(),
            arguments: self.arguments,
            root,
        })
    }

    fn node(&mut self, expr: &Expression) -> Result<RemoteExpr> {
        Ok(match expr {
            Expression::Constant(c) => self.constant(c)?,

            Expression::Parameter(p) => RemoteExpr::Parameter(ParameterNode {
                name: p.name().to_string(),
                ty: self.types.create(p.ty()),
            }),

            Expression::Binary { op, left, right } => {
                if self.options.simplify_boolean_comparisons {
                    if let Some(simplified) = simplify(*op, left, right) {
                        return self.node(&simplified);
                    }
                }
                RemoteExpr::Binary(BinaryNode {
                    op: *op,
                    left: Box::new(self.node(left)?),
                    right: Box::new(self.node(right)?),
                })
            }

            Expression::Unary { op, operand } => RemoteExpr::Unary(UnaryNode {
                op: *op,
                operand: Box::new(self.node(operand)?),
            }),

            Expression::Convert { operand, ty } => RemoteExpr::Convert(ConvertNode {
                operand: Box::new(self.node(operand)?),
                ty: self.types.create(ty),
            }),

            Expression::Member { instance, member } => RemoteExpr::Member(MemberNode {
                instance: Box::new(self.node(instance)?),
                member: self.types.property(member),
            }),

            Expression::Call {
                instance,
                method,
                args,
            } => {
                let method = self.types.method(method);
                let instance = match instance {
                    Some(i) => Some(Box::new(self.node(i)?)),
                    None => None,
                };
                RemoteExpr::Call(CallNode {
                    instance,
                    method,
                    args: self.nodes(args)?,
                })
            }

            Expression::Lambda(lambda) => {
                let params = lambda
                    .params
                    .iter()
                    .map(|p| ParameterNode {
                        name: p.name().to_string(),
                        ty: self.types.create(p.ty()),
                    })
                    .collect();
                RemoteExpr::Lambda(LambdaNode {
                    params,
                    body: Box::new(self.node(&lambda.body)?),
                })
            }

            Expression::New { ty, args } => {
                let named = ty.as_named().ok_or_else(|| {
                    QueryError::translation(format!("{} cannot be constructed remotely", ty))
                })?;
                let properties = named.properties();
                let constructor = ConstructorDescriptor {
                    declaring: self.types.create(ty),
                    parameters: properties.iter().map(|p| self.types.create(&p.ty)).collect(),
                };
                RemoteExpr::New(NewNode {
                    constructor,
                    members: properties.into_iter().map(|p| p.name).collect(),
                    args: self.nodes(args)?,
                })
            }

            Expression::MemberInit { ty, bindings } => {
                let ty = self.types.create(ty);
                let bindings = bindings
                    .iter()
                    .map(|b| {
                        Ok(MemberBindingNode {
                            member: self.types.property(&b.member),
                            value: self.node(&b.value)?,
                        })
                    })
                    .collect::<Result<_>>()?;
                RemoteExpr::MemberInit(MemberInitNode { ty, bindings })
            }

            Expression::ListInit { element, items } | Expression::NewArray { element, items } => {
                let is_array = matches!(expr, Expression::NewArray { .. });
                if let Some(values) = literal_items(items) {
                    let collection_ty = expr.ty();
                    return self.constant_collection(&collection_ty, element, is_array, &values);
                }
                let node = CollectionNode {
                    element: self.types.create(element),
                    items: self.nodes(items)?,
                };
                if is_array {
                    RemoteExpr::NewArray(node)
                } else {
                    RemoteExpr::ListInit(node)
                }
            }

            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => RemoteExpr::Conditional(ConditionalNode {
                test: Box::new(self.node(test)?),
                if_true: Box::new(self.node(if_true)?),
                if_false: Box::new(self.node(if_false)?),
            }),
        })
    }

    fn nodes(&mut self, items: &[Expression]) -> Result<Vec<RemoteExpr>> {
        items.iter().map(|item| self.node(item)).collect()
    }

    fn constant(&mut self, c: &Constant) -> Result<RemoteExpr> {
        if let Value::Queryable(q) = &c.value {
            return match q {
                QueryableValue::Resource { element_type, name } => {
                    Ok(RemoteExpr::Resource(ResourceNode {
                        element: self.types.create(element_type),
                        name: name.clone(),
                    }))
                }
                QueryableValue::Data(data) => Ok(RemoteExpr::Resource(ResourceNode {
                    element: self.types.create(&data.element_type()),
                    name: None,
                })),
                QueryableValue::Query { expression, .. } => {
                    let inlined = QueryInliner.rewrite(expression)?;
                    self.node(&inlined)
                }
            };
        }

        match &c.origin {
            ConstantOrigin::Variable { name } => {
                let ty = self.types.create(&c.ty);
                let value = to_constant(&c.value, &c.ty, &mut self.types)?;
                let id = ArgumentId(self.arguments.len() as u32);
                log::trace!("argument #{} {:?} = {}", id.0, name, c.value);
                self.arguments.push(QueryArgument {
                    name: name.clone(),
                    ty,
                    value,
                });
                Ok(RemoteExpr::Variable(id))
            }
            ConstantOrigin::Literal => match (&c.value, &c.ty) {
                (Value::List(values), Type::Array(element))
                | (Value::List(values), Type::Sequence(element)) => {
                    let is_array = matches!(c.ty, Type::Array(_));
                    self.constant_collection(&c.ty, element, is_array, values)
                }
                _ => Ok(RemoteExpr::Constant(ConstantNode {
                    ty: self.types.create(&c.ty),
                    value: to_constant(&c.value, &c.ty, &mut self.types)?,
                })),
            },
        }
    }

    fn constant_collection(
        &mut self,
        collection_ty: &Type,
        element: &Type,
        is_array: bool,
        values: &[Value],
    ) -> Result<RemoteExpr> {
        let element = self.types.create(element);
        let values = values
            .iter()
            .map(|v| {
                to_constant(
                    v,
                    collection_ty.element_type().unwrap_or(collection_ty),
                    &mut self.types,
                )
            })
            .collect::<Result<_>>()?;
        Ok(RemoteExpr::ConstantCollection(ConstantCollectionNode {
            element,
            is_array,
            values,
        }))
    }
}

/// Values of collection items that are all literal constants
fn literal_items(items: &[Expression]) -> Option<Vec<Value>> {
    items
        .iter()
        .map(|item| match item {
            Expression::Constant(c) if !c.is_variable() && !matches!(c.value, Value::Queryable(_)) => {
                Some(c.value.clone())
            }
            _ => None,
        })
        .collect()
}

/// Replace composed-query constants by the expressions they wrap
struct QueryInliner;

impl ExpressionRewriter for QueryInliner {
    fn rewrite_node(&mut self, expr: &Expression) -> Result<Option<Expression>> {
        match expr {
            Expression::Constant(Constant {
                value: Value::Queryable(QueryableValue::Query { expression, .. }),
                ..
            }) => Ok(Some(self.rewrite(expression)?)),
            _ => Ok(None),
        }
    }
}

/// Comparison against a literal boolean or null, rewritten to a unary form
fn simplify(op: BinaryOperator, left: &Expression, right: &Expression) -> Option<Expression> {
    if !matches!(op, BinaryOperator::Eq | BinaryOperator::Ne) {
        return None;
    }
    let (operand, literal) = match (literal_value(left), literal_value(right)) {
        (None, Some(v)) => (left, v),
        (Some(v), None) => (right, v),
        _ => return None,
    };
    let eq = op == BinaryOperator::Eq;
    match literal {
        Value::Bool(b) if operand.ty() == Type::bool() => {
            if b == eq {
                Some(operand.clone())
            } else {
                Expression::unary(UnaryOperator::Not, operand.clone()).ok()
            }
        }
        Value::Null if operand.ty().accepts_null() => {
            let unary = if eq {
                UnaryOperator::IsNull
            } else {
                UnaryOperator::IsNotNull
            };
            Expression::unary(unary, operand.clone()).ok()
        }
        _ => None,
    }
}

fn literal_value(expr: &Expression) -> Option<Value> {
    match expr {
        Expression::Constant(c) if !c.is_variable() => match &c.value {
            Value::Bool(_) | Value::Null => Some(c.value.clone()),
            _ => None,
        },
        _ => None,
    }
}
