//! Bottom-up tree rewriting.

use crate::expression::Expression;
use crate::Result;

/// A rewriting pass over a native tree. Nodes for which `rewrite_node`
/// returns `None` are rebuilt from their rewritten children.
pub trait ExpressionRewriter {
    fn rewrite_node(&mut self, expr: &Expression) -> Result<Option<Expression>>;

    fn rewrite(&mut self, expr: &Expression) -> Result<Expression> {
        match self.rewrite_node(expr)? {
            Some(replacement) => Ok(replacement),
            None => expr.map_children(&mut |child| self.rewrite(child)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ConstantOrigin;
    use crate::value::Value;

    /// Marks every literal integer as a runtime variable
    struct Variables;

    impl ExpressionRewriter for Variables {
        fn rewrite_node(&mut self, expr: &Expression) -> Result<Option<Expression>> {
            Ok(match expr {
                Expression::Constant(c) if matches!(c.value, Value::Int32(_)) => Some(
                    Expression::variable_value(None, c.value.clone(), c.ty.clone()),
                ),
                _ => None,
            })
        }
    }

    #[test]
    fn test_rewrite_reaches_leaves() {
        let expr = Expression::literal(1)
            .add(Expression::literal(2))
            .unwrap()
            .equal(Expression::literal(3))
            .unwrap();
        let rewritten = Variables.rewrite(&expr).unwrap();
        let mut variables = 0;
        rewritten.walk(&mut |node| {
            if let Expression::Constant(c) = node {
                assert!(matches!(c.origin, ConstantOrigin::Variable { .. }));
                variables += 1;
            }
        });
        assert_eq!(variables, 3);
        assert_eq!(rewritten.to_string(), expr.to_string());
    }
}
