//! Expression tree definitions.

use crate::expression::method::MethodInfo;
use crate::expression::operator::{BinaryOperator, UnaryOperator};
use crate::expression::{ExpressionError, ExpressionResult};
use crate::types::{PropertyInfo, Type, TypeDef};
use crate::value::{QueryValue, QueryableValue, Record, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Where a constant came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantOrigin {
    /// Written into the query; safe to inline
    Literal,
    /// Runtime variable or captured value; shipped as a query argument
    Variable { name: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: Value,
    pub ty: Type,
    pub origin: ConstantOrigin,
}

impl Constant {
    pub fn is_variable(&self) -> bool {
        matches!(self.origin, ConstantOrigin::Variable { .. })
    }
}

#[derive(Debug)]
pub struct ParameterDef {
    name: String,
    ty: Type,
}

/// Lambda parameter; equality is instance identity, not name
#[derive(Clone)]
pub struct ParameterRef(Arc<ParameterDef>);

impl ParameterRef {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self(Arc::new(ParameterDef {
            name: name.into(),
            ty,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }
}

impl PartialEq for ParameterRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ParameterRef {}

impl Hash for ParameterRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for ParameterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.name, self.0.ty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub params: Vec<ParameterRef>,
    pub body: Box<Expression>,
}

impl LambdaExpr {
    pub fn ty(&self) -> Type {
        Type::function(
            self.params.iter().map(|p| p.ty().clone()).collect(),
            self.body.ty(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberBinding {
    pub member: PropertyInfo,
    pub value: Expression,
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(Constant),

    Parameter(ParameterRef),

    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },

    Convert {
        operand: Box<Expression>,
        ty: Type,
    },

    /// Property read
    Member {
        instance: Box<Expression>,
        member: PropertyInfo,
    },

    /// Method call; `instance` is `None` for static methods
    Call {
        instance: Option<Box<Expression>>,
        method: Arc<MethodInfo>,
        args: Vec<Expression>,
    },

    Lambda(LambdaExpr),

    /// Constructor call; arguments follow property declaration order
    New { ty: Type, args: Vec<Expression> },

    MemberInit {
        ty: Type,
        bindings: Vec<MemberBinding>,
    },

    /// Collection initializer producing a `Sequence`
    ListInit {
        element: Type,
        items: Vec<Expression>,
    },

    NewArray {
        element: Type,
        items: Vec<Expression>,
    },

    Conditional {
        test: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
}

impl Expression {
    /// Literal constant
    pub fn constant(value: Value, ty: Type) -> Self {
        Expression::Constant(Constant {
            value,
            ty,
            origin: ConstantOrigin::Literal,
        })
    }

    pub fn literal<T: QueryValue>(value: T) -> Self {
        Self::constant(value.into(), T::query_type())
    }

    /// Named runtime value, shipped as a query argument
    pub fn variable<T: QueryValue>(name: &str, value: T) -> Self {
        Self::variable_value(Some(name.to_string()), value.into(), T::query_type())
    }

    pub fn variable_value(name: Option<String>, value: Value, ty: Type) -> Self {
        Expression::Constant(Constant {
            value,
            ty,
            origin: ConstantOrigin::Variable { name },
        })
    }

    pub fn null(ty: Type) -> Self {
        Self::constant(Value::Null, ty)
    }

    /// Constant referring to a data source
    pub fn queryable(value: QueryableValue) -> Self {
        let ty = Type::queryable(value.element_type());
        Self::constant(Value::Queryable(value), ty)
    }

    pub fn parameter(param: &ParameterRef) -> Self {
        Expression::Parameter(param.clone())
    }

    pub fn member(self, name: &str) -> ExpressionResult<Self> {
        let ty = self.ty();
        let member = ty
            .property(name)
            .ok_or_else(|| ExpressionError::UnknownMember {
                ty: ty.clone(),
                name: name.to_string(),
            })?;
        Ok(Expression::Member {
            instance: Box::new(self),
            member,
        })
    }

    /// Binary node, rejecting operand types the operator does not accept
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> ExpressionResult<Self> {
        let (lt, rt) = (left.ty(), right.ty());
        if op.output_type(&lt, &rt).is_none() {
            return Err(ExpressionError::InvalidOperandTypes {
                operator: op.as_str().to_string(),
                left_type: Some(lt),
                right_type: Some(rt),
            });
        }
        Ok(Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn unary(op: UnaryOperator, operand: Expression) -> ExpressionResult<Self> {
        let ty = operand.ty();
        if op.output_type(&ty).is_none() {
            return Err(ExpressionError::InvalidOperandTypes {
                operator: op.as_str().to_string(),
                left_type: Some(ty),
                right_type: None,
            });
        }
        Ok(Expression::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn equal(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Eq, self, rhs)
    }

    pub fn not_equal(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Ne, self, rhs)
    }

    pub fn less_than(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Lt, self, rhs)
    }

    pub fn less_or_equal(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Le, self, rhs)
    }

    pub fn greater_than(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Gt, self, rhs)
    }

    pub fn greater_or_equal(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Ge, self, rhs)
    }

    pub fn and_also(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::And, self, rhs)
    }

    pub fn or_else(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Or, self, rhs)
    }

    pub fn add(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Add, self, rhs)
    }

    pub fn subtract(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Sub, self, rhs)
    }

    pub fn multiply(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Mul, self, rhs)
    }

    pub fn divide(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Div, self, rhs)
    }

    pub fn modulo(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Rem, self, rhs)
    }

    pub fn coalesce(self, rhs: Expression) -> ExpressionResult<Self> {
        Self::binary(BinaryOperator::Coalesce, self, rhs)
    }

    pub fn not(self) -> ExpressionResult<Self> {
        Self::unary(UnaryOperator::Not, self)
    }

    pub fn negate(self) -> ExpressionResult<Self> {
        Self::unary(UnaryOperator::Negate, self)
    }

    pub fn is_null(self) -> ExpressionResult<Self> {
        Self::unary(UnaryOperator::IsNull, self)
    }

    pub fn is_not_null(self) -> ExpressionResult<Self> {
        Self::unary(UnaryOperator::IsNotNull, self)
    }

    pub fn convert(self, ty: Type) -> Self {
        Expression::Convert {
            operand: Box::new(self),
            ty,
        }
    }

    /// Method call with argument count and type checks
    pub fn call(
        instance: Option<Expression>,
        method: Arc<MethodInfo>,
        args: Vec<Expression>,
    ) -> ExpressionResult<Self> {
        if method.is_static != instance.is_none() {
            return Err(ExpressionError::EvaluationError {
                message: format!(
                    "{} is {}",
                    method,
                    if method.is_static { "static" } else { "an instance method" }
                ),
            });
        }
        if args.len() != method.parameters.len() {
            return Err(ExpressionError::ArgumentCount {
                method: method.to_string(),
                expected: method.parameters.len(),
                actual: args.len(),
            });
        }
        for (arg, param) in args.iter().zip(&method.parameters) {
            let actual = arg.ty();
            if !param.is_assignable_from(&actual) {
                return Err(ExpressionError::TypeMismatch {
                    expected: param.clone(),
                    actual,
                    context: format!("argument of {}", method.name),
                });
            }
        }
        Ok(Expression::Call {
            instance: instance.map(Box::new),
            method,
            args,
        })
    }

    pub fn lambda(params: Vec<ParameterRef>, body: Expression) -> Self {
        Expression::Lambda(LambdaExpr {
            params,
            body: Box::new(body),
        })
    }

    /// Construct `ty` from positional arguments in property order
    pub fn new_object(ty: Type, args: Vec<Expression>) -> ExpressionResult<Self> {
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
            let actual = arg.ty();
            if !prop.ty.is_assignable_from(&actual) {
                return Err(ExpressionError::TypeMismatch {
                    expected: prop.ty.clone(),
                    actual,
                    context: format!("{}.{}", ty, prop.name),
                });
            }
        }
        Ok(Expression::New { ty, args })
    }

    /// Anonymous record built from named values, as in `new { Id = .., Name = .. }`
    pub fn anonymous(members: Vec<(&str, Expression)>) -> Self {
        let def = TypeDef::anonymous(members.iter().map(|(n, e)| (*n, e.ty())).collect());
        Expression::New {
            ty: Type::named(&def),
            args: members.into_iter().map(|(_, e)| e).collect(),
        }
    }

    pub fn member_init(ty: Type, bindings: Vec<(&str, Expression)>) -> ExpressionResult<Self> {
        let bindings = bindings
            .into_iter()
            .map(|(name, value)| {
                let member = ty
                    .property(name)
                    .ok_or_else(|| ExpressionError::UnknownMember {
                        ty: ty.clone(),
                        name: name.to_string(),
                    })?;
                Ok(MemberBinding { member, value })
            })
            .collect::<ExpressionResult<Vec<_>>>()?;
        Ok(Expression::MemberInit { ty, bindings })
    }

    pub fn list_init(element: Type, items: Vec<Expression>) -> Self {
        Expression::ListInit { element, items }
    }

    pub fn new_array(element: Type, items: Vec<Expression>) -> Self {
        Expression::NewArray { element, items }
    }

    pub fn conditional(
        test: Expression,
        if_true: Expression,
        if_false: Expression,
    ) -> ExpressionResult<Self> {
        let test_ty = test.ty();
        if !test_ty.is_bool() {
            return Err(ExpressionError::TypeMismatch {
                expected: Type::bool(),
                actual: test_ty,
                context: "conditional test".to_string(),
            });
        }
        let (t, f) = (if_true.ty(), if_false.ty());
        if !t.is_assignable_from(&f) {
            return Err(ExpressionError::TypeMismatch {
                expected: t,
                actual: f,
                context: "conditional branches".to_string(),
            });
        }
        Ok(Expression::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        })
    }

    /// Static result type of the node
    pub fn ty(&self) -> Type {
        match self {
            Expression::Constant(c) => c.ty.clone(),
            Expression::Parameter(p) => p.ty().clone(),
            Expression::Binary { op, left, right } => {
                let (lt, rt) = (left.ty(), right.ty());
                op.output_type(&lt, &rt).unwrap_or(lt)
            }
            Expression::Unary { op, operand } => {
                let ty = operand.ty();
                op.output_type(&ty).unwrap_or(ty)
            }
            Expression::Convert { ty, .. } => ty.clone(),
            Expression::Member { member, .. } => member.ty.clone(),
            Expression::Call { method, .. } => method.return_type.clone(),
            Expression::Lambda(lambda) => lambda.ty(),
            Expression::New { ty, .. } | Expression::MemberInit { ty, .. } => ty.clone(),
            Expression::ListInit { element, .. } => Type::sequence(element.clone()),
            Expression::NewArray { element, .. } => Type::array(element.clone()),
            Expression::Conditional { if_true, .. } => if_true.ty(),
        }
    }

    pub fn as_lambda(&self) -> Option<&LambdaExpr> {
        match self {
            Expression::Lambda(lambda) => Some(lambda),
            _ => None,
        }
    }

    /// Direct child expressions in evaluation order
    pub fn children(&self) -> Vec<&Expression> {
        match self {
            Expression::Constant(_) | Expression::Parameter(_) => Vec::new(),
            Expression::Binary { left, right, .. } => vec![left, right],
            Expression::Unary { operand, .. } | Expression::Convert { operand, .. } => {
                vec![operand]
            }
            Expression::Member { instance, .. } => vec![instance],
            Expression::Call { instance, args, .. } => {
                instance.iter().map(|i| &**i).chain(args.iter()).collect()
            }
            Expression::Lambda(lambda) => vec![&lambda.body],
            Expression::New { args, .. } => args.iter().collect(),
            Expression::MemberInit { bindings, .. } => bindings.iter().map(|b| &b.value).collect(),
            Expression::ListInit { items, .. } | Expression::NewArray { items, .. } => {
                items.iter().collect()
            }
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => vec![test, if_true, if_false],
        }
    }

    /// Pre-order traversal
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expression)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Rebuild this node with every direct child replaced by `f(child)`
    pub fn map_children<E>(
        &self,
        f: &mut impl FnMut(&Expression) -> Result<Expression, E>,
    ) -> Result<Expression, E> {
        Ok(match self {
            Expression::Constant(_) | Expression::Parameter(_) => self.clone(),
            Expression::Binary { op, left, right } => Expression::Binary {
                op: *op,
                left: Box::new(f(left)?),
                right: Box::new(f(right)?),
            },
            Expression::Unary { op, operand } => Expression::Unary {
                op: *op,
                operand: Box::new(f(operand)?),
            },
            Expression::Convert { operand, ty } => Expression::Convert {
                operand: Box::new(f(operand)?),
                ty: ty.clone(),
            },
            Expression::Member { instance, member } => Expression::Member {
                instance: Box::new(f(instance)?),
                member: member.clone(),
            },
            Expression::Call {
                instance,
                method,
                args,
            } => {
                let instance = match instance {
                    Some(i) => Some(Box::new(f(i)?)),
                    None => None,
                };
                Expression::Call {
                    instance,
                    method: method.clone(),
                    args: args.iter().map(&mut *f).collect::<Result<_, E>>()?,
                }
            }
            Expression::Lambda(lambda) => Expression::Lambda(LambdaExpr {
                params: lambda.params.clone(),
                body: Box::new(f(&lambda.body)?),
            }),
            Expression::New { ty, args } => Expression::New {
                ty: ty.clone(),
                args: map_all(args, f)?,
            },
            Expression::MemberInit { ty, bindings } => Expression::MemberInit {
                ty: ty.clone(),
                bindings: bindings
                    .iter()
                    .map(|b| {
                        Ok(MemberBinding {
                            member: b.member.clone(),
                            value: f(&b.value)?,
                        })
                    })
                    .collect::<Result<_, E>>()?,
            },
            Expression::ListInit { element, items } => Expression::ListInit {
                element: element.clone(),
                items: map_all(items, f)?,
            },
            Expression::NewArray { element, items } => Expression::NewArray {
                element: element.clone(),
                items: map_all(items, f)?,
            },
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => Expression::Conditional {
                test: Box::new(f(test)?),
                if_true: Box::new(f(if_true)?),
                if_false: Box::new(f(if_false)?),
            },
        })
    }
}

impl From<Constant> for Expression {
    fn from(c: Constant) -> Self {
        Expression::Constant(c)
    }
}

impl From<LambdaExpr> for Expression {
    fn from(lambda: LambdaExpr) -> Self {
        Expression::Lambda(lambda)
    }
}

fn map_all<E>(
    items: &[Expression],
    f: &mut impl FnMut(&Expression) -> Result<Expression, E>,
) -> Result<Vec<Expression>, E> {
    items.iter().map(f).collect()
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Expression]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(c) => write!(f, "{}", c.value),
            Expression::Parameter(p) => write!(f, "{}", p.name()),
            Expression::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.as_str(), right)
            }
            Expression::Unary { op, operand } => match op {
                UnaryOperator::IsNull => write!(f, "({} == null)", operand),
                UnaryOperator::IsNotNull => write!(f, "({} != null)", operand),
                _ => write!(f, "{}{}", op.as_str(), operand),
            },
            Expression::Convert { operand, ty } => write!(f, "Convert({}, {})", operand, ty),
            Expression::Member { instance, member } => write!(f, "{}.{}", instance, member.name),
            Expression::Call {
                instance,
                method,
                args,
            } => {
                match instance {
                    Some(i) => write!(f, "{}.{}(", i, method.name)?,
                    None => write!(f, "{}(", method.name)?,
                }
                join(f, args)?;
                write!(f, ")")
            }
            Expression::Lambda(lambda) => {
                let names: Vec<&str> = lambda.params.iter().map(|p| p.name()).collect();
                if names.len() == 1 {
                    write!(f, "{} => {}", names[0], lambda.body)
                } else {
                    write!(f, "({}) => {}", names.join(", "), lambda.body)
                }
            }
            Expression::New { ty, args } => {
                write!(f, "new {}(", ty)?;
                join(f, args)?;
                write!(f, ")")
            }
            Expression::MemberInit { ty, bindings } => {
                write!(f, "new {} {{", ty)?;
                for (i, b) in bindings.iter().enumerate() {
                    let sep = if i > 0 { ", " } else { " " };
                    write!(f, "{}{} = {}", sep, b.member.name, b.value)?;
                }
                write!(f, " }}")
            }
            Expression::ListInit { items, .. } => {
                write!(f, "[")?;
                join(f, items)?;
                write!(f, "]")
            }
            Expression::NewArray { element, items } => {
                write!(f, "new {}[] {{ ", element)?;
                join(f, items)?;
                write!(f, " }}")
            }
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
        }
    }
}

/// Captured values read through member access, the way a closure
/// environment is seen by a query
#[derive(Debug, Clone)]
pub struct Closure {
    record: Expression,
}

impl Closure {
    pub fn new(captures: Vec<(&str, Value, Type)>) -> ExpressionResult<Self> {
        let def = captures
            .iter()
            .fold(TypeDef::builder("<>Closure").namespace("closure"), |b, (n, _, t)| {
                b.property(*n, t.clone())
            })
            .build();
        let ty = Type::named(&def);
        let record = Record::from_pairs(&ty, captures.into_iter().map(|(n, v, _)| (n, v)).collect())?;
        Ok(Self {
            record: Expression::variable_value(None, Value::Record(record), ty),
        })
    }

    /// Access to one captured value
    pub fn get(&self, name: &str) -> ExpressionResult<Expression> {
        self.record.clone().member(name)
    }
}
