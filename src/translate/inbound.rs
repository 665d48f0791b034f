//! Remote to native translation.

use crate::expression::{Expression, MarkerMap, MemberBinding, ParameterRef};
use crate::remote::{ConstantCollectionNode, RemoteExpr, RemoteExpression};
use crate::translate::values::from_constant;
use crate::types::{ResolutionContext, Type};
use crate::value::{QueryableValue, Value};
use crate::{QueryError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Binds a resource placeholder to live data: element type and optional
/// source name in, queryable value out
pub type DataProvider = Arc<dyn Fn(&Type, Option<&str>) -> anyhow::Result<Value> + Send + Sync>;

/// Translate with builtin resolution and unbound resources
pub fn to_native(query: &RemoteExpression, context: &ResolutionContext) -> Result<Expression> {
    InboundTranslator::new(context).translate(query)
}

pub struct InboundTranslator<'a> {
    context: &'a ResolutionContext,
    data_provider: Option<DataProvider>,
    markers: Option<&'a MarkerMap>,
    /// One parameter instance per `(type, name)` within a translation
    parameters: HashMap<(Type, String), ParameterRef>,
}

impl<'a> InboundTranslator<'a> {
    pub fn new(context: &'a ResolutionContext) -> Self {
        Self {
            context,
            data_provider: None,
            markers: None,
            parameters: HashMap::new(),
        }
    }

    /// Without a provider, resources stay unbound placeholders
    pub fn with_data_provider(mut self, provider: Option<DataProvider>) -> Self {
        self.data_provider = provider;
        self
    }

    pub fn with_markers(mut self, markers: &'a MarkerMap) -> Self {
        self.markers = Some(markers);
        self
    }

    pub fn translate(&mut self, query: &RemoteExpression) -> Result<Expression> {
        self.parameters.clear();
        let expr = self.node(query, &query.root)?;
        log::debug!("translated remote query into {}", expr);
        Ok(expr)
    }

    fn node(&mut self, query: &RemoteExpression, node: &RemoteExpr) -> Result<Expression> {
        let types = &query.types;
        Ok(match node {
            RemoteExpr::Constant(c) => {
                let ty = self.context.resolve_type(types, c.ty)?;
                let value = from_constant(&c.value, &ty, types, self.context)?;
                Expression::constant(value, ty)
            }

            RemoteExpr::Variable(id) => {
                let argument = query.argument(*id)?;
                let ty = self.context.resolve_type(types, argument.ty)?;
                let value = from_constant(&argument.value, &ty, types, self.context)?;
                Expression::variable_value(argument.name.clone(), value, ty)
            }

            RemoteExpr::Parameter(p) => {
                let ty = self.context.resolve_type(types, p.ty)?;
                Expression::Parameter(self.parameter(ty, &p.name))
            }

            RemoteExpr::Binary(b) => {
                let left = self.node(query, &b.left)?;
                let right = self.node(query, &b.right)?;
                Expression::binary(b.op, left, right)?
            }

            RemoteExpr::Unary(u) => Expression::unary(u.op, self.node(query, &u.operand)?)?,

            RemoteExpr::Convert(c) => {
                let ty = self.context.resolve_type(types, c.ty)?;
                self.node(query, &c.operand)?.convert(ty)
            }

            RemoteExpr::Member(m) => {
                let instance = self.node(query, &m.instance)?;
                let member = self.context.resolve_property(types, &m.member)?;
                Expression::Member {
                    instance: Box::new(instance),
                    member,
                }
            }

            RemoteExpr::Call(c) => {
                let mut method = self.context.resolve_method(types, &c.method)?;
                if method.is_marker() {
                    let replacement = self
                        .markers
                        .and_then(|markers| markers.rewrite(&method))
                        .ok_or_else(|| {
                            QueryError::not_supported(format!(
                                "marker method {} has no mapping on this side",
                                method
                            ))
                        })?;
                    log::trace!("rewrote marker {} to {}", method, replacement);
                    method = Arc::new(replacement);
                }
                let instance = match &c.instance {
                    Some(i) => Some(self.node(query, i)?),
                    None => None,
                };
                let args = self.nodes(query, &c.args)?;
                Expression::call(instance, method, args)?
            }

            RemoteExpr::Lambda(l) => {
                let params = l
                    .params
                    .iter()
                    .map(|p| {
                        let ty = self.context.resolve_type(types, p.ty)?;
                        Ok(self.parameter(ty, &p.name))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Expression::lambda(params, self.node(query, &l.body)?)
            }

            RemoteExpr::New(n) => {
                let ty = self
                    .context
                    .resolve_constructor(types, &n.constructor, &n.members)?;
                if n.args.len() != n.members.len() {
                    return Err(QueryError::translation(format!(
                        "constructor of {} names {} members for {} arguments",
                        ty,
                        n.members.len(),
                        n.args.len()
                    )));
                }
                let mut args = self.nodes(query, &n.args)?.into_iter().map(Some).collect::<Vec<_>>();
                // Arguments in the local declaration order
                let ordered = ty
                    .as_named()
                    .map(|named| named.properties())
                    .unwrap_or_default()
                    .iter()
                    .map(|p| {
                        n.members
                            .iter()
                            .position(|m| *m == p.name)
                            .and_then(|i| args.get_mut(i).and_then(Option::take))
                            .ok_or_else(|| {
                                QueryError::translation(format!(
                                    "constructor of {} has no argument for {}",
                                    ty, p.name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Expression::new_object(ty, ordered)?
            }

            RemoteExpr::MemberInit(m) => {
                let ty = self.context.resolve_type(types, m.ty)?;
                let bindings = m
                    .bindings
                    .iter()
                    .map(|b| {
                        Ok(MemberBinding {
                            member: self.context.resolve_property(types, &b.member)?,
                            value: self.node(query, &b.value)?,
                        })
                    })
                    .collect::<Result<_>>()?;
                Expression::MemberInit { ty, bindings }
            }

            RemoteExpr::ListInit(c) => {
                let element = self.context.resolve_type(types, c.element)?;
                Expression::list_init(element, self.nodes(query, &c.items)?)
            }

            RemoteExpr::NewArray(c) => {
                let element = self.context.resolve_type(types, c.element)?;
                Expression::new_array(element, self.nodes(query, &c.items)?)
            }

            RemoteExpr::Conditional(c) => Expression::conditional(
                self.node(query, &c.test)?,
                self.node(query, &c.if_true)?,
                self.node(query, &c.if_false)?,
            )?,

            RemoteExpr::ConstantCollection(c) => self.constant_collection(query, c)?,

            RemoteExpr::Resource(r) => {
                let element = self.context.resolve_type(types, r.element)?;
                let value = match &self.data_provider {
                    Some(provider) => {
                        provider(&element, r.name.as_deref()).map_err(QueryError::DataSource)?
                    }
                    None => Value::Queryable(QueryableValue::Resource {
                        element_type: element.clone(),
                        name: r.name.clone(),
                    }),
                };
                Expression::constant(value, Type::queryable(element))
            }
        })
    }

    fn nodes(&mut self, query: &RemoteExpression, nodes: &[RemoteExpr]) -> Result<Vec<Expression>> {
        nodes.iter().map(|n| self.node(query, n)).collect()
    }

    fn parameter(&mut self, ty: Type, name: &str) -> ParameterRef {
        self.parameters
            .entry((ty.clone(), name.to_string()))
            .or_insert_with(|| ParameterRef::new(name, ty))
            .clone()
    }

    fn constant_collection(
        &mut self,
        query: &RemoteExpression,
        node: &ConstantCollectionNode,
    ) -> Result<Expression> {
        let element = self.context.resolve_type(&query.types, node.element)?;
        let values = node
            .values
            .iter()
            .map(|v| from_constant(v, &element, &query.types, self.context))
            .collect::<Result<Vec<_>>>()?;
        let ty = if node.is_array {
            Type::array(element)
        } else {
            Type::sequence(element)
        };
        Ok(Expression::constant(Value::List(values), ty))
    }
}
