//! Type checking for expressions.

use crate::expression::{Expression, ExpressionError, ExpressionResult, LambdaExpr, ParameterRef};
use crate::types::Type;

/// Validates a tree the way a compiler would before running it: every
/// parameter occurrence must be bound by an enclosing lambda (by identity),
/// and every node must be well-typed
#[derive(Debug, Default)]
pub struct TypeChecker {
    scope: Vec<ParameterRef>,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type check an expression and return its output type
    pub fn check(&mut self, expr: &Expression) -> ExpressionResult<Type> {
        match expr {
            Expression::Constant(c) => Ok(c.ty.clone()),

            Expression::Parameter(p) => {
                if self.scope.iter().any(|bound| bound == p) {
                    Ok(p.ty().clone())
                } else {
                    Err(ExpressionError::UnboundParameter {
                        name: p.name().to_string(),
                    })
                }
            }

            Expression::Binary { op, left, right } => {
                let lt = self.check(left)?;
                let rt = self.check(right)?;
                op.output_type(&lt, &rt)
                    .ok_or_else(|| ExpressionError::InvalidOperandTypes {
                        operator: op.as_str().to_string(),
                        left_type: Some(lt),
                        right_type: Some(rt),
                    })
            }

            Expression::Unary { op, operand } => {
                let ty = self.check(operand)?;
                op.output_type(&ty)
                    .ok_or_else(|| ExpressionError::InvalidOperandTypes {
                        operator: op.as_str().to_string(),
                        left_type: Some(ty),
                        right_type: None,
                    })
            }

            Expression::Convert { operand, ty } => {
                self.check(operand)?;
                Ok(ty.clone())
            }

            Expression::Member { instance, member } => {
                let ty = self.check(instance)?;
                match ty.property(&member.name) {
                    Some(found) if found.ty == member.ty => Ok(found.ty),
                    Some(found) => Err(ExpressionError::TypeMismatch {
                        expected: member.ty.clone(),
                        actual: found.ty,
                        context: format!("{}.{}", ty, member.name),
                    }),
                    None => Err(ExpressionError::UnknownMember {
                        ty,
                        name: member.name.clone(),
                    }),
                }
            }

            Expression::Call {
                instance,
                method,
                args,
            } => {
                if let Some(instance) = instance {
                    let ty = self.check(instance)?;
                    if !method.declaring.is_assignable_from(&ty) {
                        return Err(ExpressionError::TypeMismatch {
                            expected: method.declaring.clone(),
                            actual: ty,
                            context: format!("instance of {}", method.name),
                        });
                    }
                }
                if args.len() != method.parameters.len() {
                    return Err(ExpressionError::ArgumentCount {
                        method: method.to_string(),
                        expected: method.parameters.len(),
                        actual: args.len(),
                    });
                }
                for (arg, param) in args.iter().zip(&method.parameters) {
                    let actual = self.check(arg)?;
                    if !param.is_assignable_from(&actual) {
                        return Err(ExpressionError::TypeMismatch {
                            expected: param.clone(),
                            actual,
                            context: format!("argument of {}", method.name),
                        });
                    }
                }
                Ok(method.return_type.clone())
            }

            Expression::Lambda(lambda) => self.check_lambda(lambda),

            Expression::New { ty, args } => {
                let named = ty.as_named().ok_or_else(|| ExpressionError::EvaluationError {
                    message: format!("{} has no constructor", ty),
                })?;
                let props = named.properties();
                if props.len() != args.len() {
                    return Err(ExpressionError::ArgumentCount {
                        method: format!("{}::new", ty),
                        expected: props.len(),
                        actual: args.len(),
                    });
                }
                for (arg, prop) in args.iter().zip(&props) {
                    let actual = self.check(arg)?;
                    if !prop.ty.is_assignable_from(&actual) {
                        return Err(ExpressionError::TypeMismatch {
                            expected: prop.ty.clone(),
                            actual,
                            context: format!("{}.{}", ty, prop.name),
                        });
                    }
                }
                Ok(ty.clone())
            }

            Expression::MemberInit { ty, bindings } => {
                for binding in bindings {
                    let actual = self.check(&binding.value)?;
                    if !binding.member.ty.is_assignable_from(&actual) {
                        return Err(ExpressionError::TypeMismatch {
                            expected: binding.member.ty.clone(),
                            actual,
                            context: format!("{}.{}", ty, binding.member.name),
                        });
                    }
                }
                Ok(ty.clone())
            }

            Expression::ListInit { element, items } | Expression::NewArray { element, items } => {
                for item in items {
                    let actual = self.check(item)?;
                    if !element.is_assignable_from(&actual) {
                        return Err(ExpressionError::TypeMismatch {
                            expected: element.clone(),
                            actual,
                            context: "collection element".to_string(),
                        });
                    }
                }
                Ok(expr.ty())
            }

            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let test_ty = self.check(test)?;
                if !test_ty.is_bool() {
                    return Err(ExpressionError::TypeMismatch {
                        expected: Type::bool(),
                        actual: test_ty,
                        context: "conditional test".to_string(),
                    });
                }
                let t = self.check(if_true)?;
                let f = self.check(if_false)?;
                if !t.is_assignable_from(&f) {
                    return Err(ExpressionError::TypeMismatch {
                        expected: t,
                        actual: f,
                        context: "conditional branches".to_string(),
                    });
                }
                Ok(t)
            }
        }
    }

    fn check_lambda(&mut self, lambda: &LambdaExpr) -> ExpressionResult<Type> {
        let depth = self.scope.len();
        self.scope.extend(lambda.params.iter().cloned());
        let body = self.check(&lambda.body);
        self.scope.truncate(depth);
        Ok(Type::function(
            lambda.params.iter().map(|p| p.ty().clone()).collect(),
            body?,
        ))
    }

    /// Check that a predicate is boolean
    pub fn check_predicate(&mut self, expr: &Expression) -> ExpressionResult<()> {
        let ty = self.check(expr)?;
        if ty.is_bool() {
            Ok(())
        } else {
            Err(ExpressionError::TypeMismatch {
                expected: Type::bool(),
                actual: ty,
                context: "predicate".to_string(),
            })
        }
    }
}

/// Type check a closed expression
pub fn type_check_expression(expr: &Expression) -> ExpressionResult<Type> {
    TypeChecker::new().check(expr)
}

/// Compile check of a lambda: the tree a translator hands to an executor
/// must pass this
pub fn validate_lambda(lambda: &LambdaExpr) -> ExpressionResult<Type> {
    TypeChecker::new().check_lambda(lambda)
}
