//! Local evaluation of subtrees that do not depend on query data.
//!
//! A subtree is evaluable when it references no lambda parameter, calls no
//! marker method, consumes no queryable and is not itself a lambda. Every
//! maximal evaluable subtree that is not already a constant is evaluated
//! once on the client and replaced by a constant:
//!
//! - built from literals only, the constant stays a literal
//! - anything else (closure reads, intrinsic calls) becomes a variable, so
//!   it travels as a query argument named after the member it was read from

use crate::expression::{Constant, ConstantOrigin, Expression, ExpressionEvaluator, MethodKind};
use crate::types::Type;
use crate::value::Value;
use crate::Result;

/// Collapse the evaluable subtrees of `expr`
pub fn partial_evaluate(expr: &Expression) -> Result<Expression> {
    let (rewritten, evaluable) = nominate(expr)?;
    if evaluable {
        collapse(&rewritten)
    } else {
        Ok(rewritten)
    }
}

/// Rewrite the children of `expr` and report whether `expr` is evaluable.
///
/// Evaluable children of an evaluable node are left intact so the parent
/// can be collapsed as a whole.
fn nominate(expr: &Expression) -> Result<(Expression, bool)> {
    let mut flags = Vec::new();
    let rebuilt = expr.map_children(&mut |child| {
        let (child, evaluable) = nominate(child)?;
        flags.push(evaluable);
        Ok::<_, crate::QueryError>(child)
    })?;

    let evaluable = flags.iter().all(|f| *f) && is_evaluable_node(&rebuilt);
    if evaluable || flags.iter().all(|f| !*f) {
        return Ok((rebuilt, evaluable));
    }

    let mut flags = flags.into_iter();
    let collapsed = rebuilt.map_children(&mut |child| {
        if flags.next().unwrap_or(false) {
            collapse(child)
        } else {
            Ok(child.clone())
        }
    })?;
    Ok((collapsed, false))
}

fn is_evaluable_node(expr: &Expression) -> bool {
    match expr {
        Expression::Constant(c) => !matches!(c.value, Value::Queryable(_)),
        Expression::Parameter(_) | Expression::Lambda(_) => false,
        Expression::Call { method, .. } => {
            !matches!(method.kind, MethodKind::Marker | MethodKind::Query(..))
                && !method.parameters.iter().any(consumes_query)
        }
        _ => true,
    }
}

fn consumes_query(ty: &Type) -> bool {
    matches!(ty, Type::Queryable(_))
}

/// Evaluate a closed subtree into a constant
fn collapse(expr: &Expression) -> Result<Expression> {
    if let Expression::Constant(_) = expr {
        return Ok(expr.clone());
    }
    let value = ExpressionEvaluator::new().evaluate(expr)?;
    let origin = if is_literal(expr) {
        ConstantOrigin::Literal
    } else {
        ConstantOrigin::Variable {
            name: variable_name(expr),
        }
    };
    log::trace!("evaluated {} locally", expr);
    Ok(Expression::Constant(Constant {
        value,
        ty: expr.ty(),
        origin,
    }))
}

fn is_literal(expr: &Expression) -> bool {
    let mut literal = true;
    expr.walk(&mut |node| match node {
        Expression::Constant(c) if c.is_variable() => literal = false,
        Expression::Call { .. } => literal = false,
        _ => {}
    });
    literal
}

/// Name of the member a captured value was read from
fn variable_name(expr: &Expression) -> Option<String> {
    match expr {
        Expression::Member { instance, member } => {
            let mut inner = instance.as_ref();
            while let Expression::Member { instance, .. } = inner {
                inner = instance;
            }
            matches!(inner, Expression::Constant(_)).then(|| member.name.clone())
        }
        Expression::Convert { operand, .. } => variable_name(operand),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Closure, Intrinsic, MethodRegistry, ParameterRef};

    fn origin(expr: &Expression) -> &ConstantOrigin {
        match expr {
            Expression::Constant(c) => &c.origin,
            other => panic!("constant expected, got {other}"),
        }
    }

    #[test]
    fn test_literal_arithmetic_stays_literal() {
        let expr = Expression::literal(2).multiply(Expression::literal(21)).unwrap();
        let folded = partial_evaluate(&expr).unwrap();
        assert_eq!(folded.to_string(), "42");
        assert_eq!(origin(&folded), &ConstantOrigin::Literal);
    }

    #[test]
    fn test_closure_read_becomes_named_variable() {
        let closure = Closure::new(vec![("limit", Value::Int32(10), Type::int32())]).unwrap();
        let p = ParameterRef::new("p", Type::int32());
        let body = Expression::parameter(&p)
            .greater_than(closure.get("limit").unwrap())
            .unwrap();
        let folded = partial_evaluate(&Expression::lambda(vec![p], body)).unwrap();

        let Expression::Lambda(lambda) = folded else {
            panic!("lambda expected");
        };
        let Expression::Binary { left, right, .. } = *lambda.body else {
            panic!("binary expected");
        };
        assert!(matches!(*left, Expression::Parameter(_)));
        assert_eq!(
            origin(&right),
            &ConstantOrigin::Variable {
                name: Some("limit".to_string())
            }
        );
    }

    #[test]
    fn test_intrinsic_call_is_evaluated_as_variable() {
        let methods = MethodRegistry::new();
        let upper = Expression::call(
            Some(Expression::literal("abc")),
            methods.intrinsic(Intrinsic::ToUpper),
            vec![],
        )
        .unwrap();
        let folded = partial_evaluate(&upper).unwrap();
        assert_eq!(folded.to_string(), "\"ABC\"");
        assert_eq!(origin(&folded), &ConstantOrigin::Variable { name: None });
    }

    #[test]
    fn test_parameter_dependent_subtree_is_kept() {
        let p = ParameterRef::new("p", Type::int32());
        let body = Expression::parameter(&p).add(Expression::literal(1)).unwrap();
        let lambda = Expression::lambda(vec![p], body);
        assert_eq!(partial_evaluate(&lambda).unwrap(), lambda);
    }
}
