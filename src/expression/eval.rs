//! Expression evaluation.

use crate::expression::method::{Intrinsic, MethodInfo, MethodKind, QueryOperator};
use crate::expression::{
    BinaryOperator, Expression, ExpressionError, ExpressionResult, LambdaExpr, ParameterRef,
    UnaryOperator,
};
use crate::pipeline::CancellationToken;
use crate::types::{PrimitiveType, Type};
use crate::value::{DataSet, EnumValue, QueryableValue, Record, Value};
use crate::{QueryError, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Interpreter for expression trees.
///
/// Lambda parameters are bound on a scope stack while a lambda is invoked
/// by a query operator, so nested lambdas see the parameters of the
/// enclosing ones.
#[derive(Default)]
pub struct ExpressionEvaluator {
    scope: Vec<(ParameterRef, Value)>,
    /// Rows per data set; a set is loaded at most once per evaluator
    loaded: HashMap<usize, (Arc<dyn DataSet>, Arc<Vec<Value>>)>,
    cancellation: Option<CancellationToken>,
    loads: usize,
}

/// Evaluate a closed expression
pub fn evaluate(expr: &Expression) -> Result<Value> {
    ExpressionEvaluator::new().evaluate(expr)
}

/// Identity of a data set, for preloading
pub fn data_key(data: &Arc<dyn DataSet>) -> usize {
    Arc::as_ptr(data) as *const () as usize
}

/// Data sets referenced by constants, each listed once
pub fn data_sets(expr: &Expression) -> Vec<Arc<dyn DataSet>> {
    let mut found: Vec<Arc<dyn DataSet>> = Vec::new();
    collect_data_sets(expr, &mut found);
    found
}

fn collect_data_sets(expr: &Expression, found: &mut Vec<Arc<dyn DataSet>>) {
    expr.walk(&mut |node| {
        if let Expression::Constant(c) = node {
            match &c.value {
                Value::Queryable(QueryableValue::Data(data)) => {
                    if !found.iter().any(|d| data_key(d) == data_key(data)) {
                        found.push(data.clone());
                    }
                }
                Value::Queryable(QueryableValue::Query { expression, .. }) => {
                    collect_data_sets(expression, found)
                }
                _ => {}
            }
        }
    });
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `token` before every data-source load
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Serve loads of `data` from `rows` instead of invoking the source
    pub fn preload(&mut self, data: &Arc<dyn DataSet>, rows: Vec<Value>) {
        self.loaded
            .insert(data_key(data), (data.clone(), Arc::new(rows)));
    }

    /// Number of data-source invocations so far
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn evaluate(&mut self, expr: &Expression) -> Result<Value> {
        match expr {
            Expression::Constant(c) => Ok(c.value.clone()),

            Expression::Parameter(p) => self.lookup(p),

            Expression::Binary { op, left, right } => self.evaluate_binary(*op, left, right),

            Expression::Unary { op, operand } => {
                let value = self.evaluate(operand)?;
                Ok(evaluate_unary(*op, value)?)
            }

            Expression::Convert { operand, ty } => {
                let value = self.evaluate(operand)?;
                Ok(convert_value(value, ty)?)
            }

            Expression::Member { instance, member } => {
                let value = self.evaluate(instance)?;
                Ok(read_member(value, &member.declaring, &member.name)?)
            }

            Expression::Call {
                instance,
                method,
                args,
            } => self.evaluate_call(instance.as_deref(), method, args),

            Expression::Lambda(_) => Err(QueryError::not_supported(
                "lambda evaluated outside of a query operator",
            )),

            Expression::New { ty, args } => {
                let named = ty.as_named().ok_or_else(|| ExpressionError::EvaluationError {
                    message: format!("{} has no constructor", ty),
                })?;
                let values = self.evaluate_all(args)?;
                Ok(Value::Record(Record::new(named.clone(), values)?))
            }

            Expression::MemberInit { ty, bindings } => {
                let mut pairs = Vec::with_capacity(bindings.len());
                for binding in bindings {
                    pairs.push((binding.member.name.as_str(), self.evaluate(&binding.value)?));
                }
                Ok(Value::Record(Record::from_pairs(ty, pairs)?))
            }

            Expression::ListInit { items, .. } | Expression::NewArray { items, .. } => {
                Ok(Value::List(self.evaluate_all(items)?))
            }

            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => {
                if self.evaluate_bool(test, "conditional test")? {
                    self.evaluate(if_true)
                } else {
                    self.evaluate(if_false)
                }
            }
        }
    }

    /// Call `lambda` with `args` bound to its parameters
    pub fn invoke(&mut self, lambda: &LambdaExpr, args: Vec<Value>) -> Result<Value> {
        if lambda.params.len() != args.len() {
            return Err(ExpressionError::ArgumentCount {
                method: "lambda".to_string(),
                expected: lambda.params.len(),
                actual: args.len(),
            }
            .into());
        }
        let depth = self.scope.len();
        self.scope
            .extend(lambda.params.iter().cloned().zip(args));
        let result = self.evaluate(&lambda.body);
        self.scope.truncate(depth);
        result
    }

    fn lookup(&self, param: &ParameterRef) -> Result<Value> {
        self.scope
            .iter()
            .rev()
            .find(|(p, _)| p == param)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                ExpressionError::UnboundParameter {
                    name: param.name().to_string(),
                }
                .into()
            })
    }

    fn evaluate_all(&mut self, items: &[Expression]) -> Result<Vec<Value>> {
        items.iter().map(|item| self.evaluate(item)).collect()
    }

    fn evaluate_bool(&mut self, expr: &Expression, context: &str) -> Result<bool> {
        match self.evaluate(expr)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Err(ExpressionError::UnexpectedNull {
                context: context.to_string(),
            }
            .into()),
            other => Err(ExpressionError::TypeMismatch {
                expected: Type::bool(),
                actual: value_type(&other),
                context: context.to_string(),
            }
            .into()),
        }
    }

    fn evaluate_binary(
        &mut self,
        op: BinaryOperator,
        left: &Expression,
        right: &Expression,
    ) -> Result<Value> {
        match op {
            BinaryOperator::And => {
                let l = self.evaluate_bool(left, "&&")?;
                Ok(Value::Bool(l && self.evaluate_bool(right, "&&")?))
            }
            BinaryOperator::Or => {
                let l = self.evaluate_bool(left, "||")?;
                Ok(Value::Bool(l || self.evaluate_bool(right, "||")?))
            }
            BinaryOperator::Coalesce => {
                let l = self.evaluate(left)?;
                if l.is_null() {
                    self.evaluate(right)
                } else {
                    Ok(l)
                }
            }
            _ => {
                let l = self.evaluate(left)?;
                let r = self.evaluate(right)?;
                Ok(evaluate_binary_values(op, l, r)?)
            }
        }
    }

    fn evaluate_call(
        &mut self,
        instance: Option<&Expression>,
        method: &Arc<MethodInfo>,
        args: &[Expression],
    ) -> Result<Value> {
        match &method.kind {
            MethodKind::Query(op, _) => self.evaluate_query(*op, method, args),
            MethodKind::Intrinsic(intrinsic) => {
                let instance = match instance {
                    Some(expr) => Some(self.evaluate(expr)?),
                    None => None,
                };
                let args = self.evaluate_all(args)?;
                Ok(evaluate_intrinsic(*intrinsic, instance, args)?)
            }
            MethodKind::Marker => Err(QueryError::not_supported(format!(
                "marker method {} has no local implementation",
                method
            ))),
            MethodKind::Native(f) => {
                let mut values = Vec::with_capacity(args.len() + 1);
                if let Some(expr) = instance {
                    values.push(self.evaluate(expr)?);
                }
                values.extend(self.evaluate_all(args)?);
                f(&values).map_err(QueryError::DataSource)
            }
        }
    }

    /// Replace a data-source value by its rows; other values pass through
    pub fn materialize(&mut self, value: Value) -> Result<Value> {
        match value {
            Value::Queryable(_) => Ok(Value::List(self.rows(value)?)),
            other => Ok(other),
        }
    }

    /// Materialize a sequence-valued value
    fn rows(&mut self, value: Value) -> Result<Vec<Value>> {
        match value {
            Value::List(items) => Ok(items),
            Value::Queryable(QueryableValue::Data(data)) => self.load(&data),
            Value::Queryable(QueryableValue::Query { expression, .. }) => {
                let value = self.evaluate(&expression)?;
                self.rows(value)
            }
            Value::Queryable(QueryableValue::Resource { element_type, .. }) => {
                Err(QueryError::not_supported(format!(
                    "resource of {} is not bound to a data source",
                    element_type
                )))
            }
            Value::Null => Err(ExpressionError::UnexpectedNull {
                context: "query source".to_string(),
            }
            .into()),
            other => Err(ExpressionError::EvaluationError {
                message: format!("{} is not a sequence", other.kind()),
            }
            .into()),
        }
    }

    fn load(&mut self, data: &Arc<dyn DataSet>) -> Result<Vec<Value>> {
        if let Some(token) = &self.cancellation {
            token.check()?;
        }
        if let Some((_, rows)) = self.loaded.get(&data_key(data)) {
            return Ok(rows.as_ref().clone());
        }
        self.loads += 1;
        log::trace!("loading data set of {}", data.element_type());
        let rows = data.load().map_err(QueryError::DataSource)?;
        self.preload(data, rows.clone());
        Ok(rows)
    }

    fn lambda_arg<'e>(args: &'e [Expression], index: usize, op: QueryOperator) -> Result<&'e LambdaExpr> {
        args.get(index)
            .and_then(Expression::as_lambda)
            .ok_or_else(|| {
                QueryError::translation(format!("{} expects a lambda argument", op.name()))
            })
    }

    fn source_arg(args: &[Expression], op: QueryOperator) -> Result<&Expression> {
        args.first().ok_or_else(|| {
            ExpressionError::ArgumentCount {
                method: op.name().to_string(),
                expected: 1,
                actual: 0,
            }
            .into()
        })
    }

    fn test(&mut self, predicate: &LambdaExpr, row: Value) -> Result<bool> {
        match self.invoke(predicate, vec![row])? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ExpressionError::TypeMismatch {
                expected: Type::bool(),
                actual: value_type(&other),
                context: "predicate".to_string(),
            }
            .into()),
        }
    }

    fn evaluate_query(
        &mut self,
        op: QueryOperator,
        method: &MethodInfo,
        args: &[Expression],
    ) -> Result<Value> {
        if op.is_ordering() {
            return self.evaluate_ordering(op, args);
        }
        let source = self.evaluate(Self::source_arg(args, op)?)?;
        let rows = self.rows(source)?;
        let element = method.generic_args.first().cloned().unwrap_or_else(Type::object);

        match op {
            QueryOperator::Where => {
                let predicate = Self::lambda_arg(args, 1, op)?;
                let mut out = Vec::new();
                for row in rows {
                    if self.test(predicate, row.clone())? {
                        out.push(row);
                    }
                }
                Ok(Value::List(out))
            }

            QueryOperator::Select => {
                let selector = Self::lambda_arg(args, 1, op)?;
                let out = rows
                    .into_iter()
                    .map(|row| self.invoke(selector, vec![row]))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::List(out))
            }

            QueryOperator::SelectMany => {
                let selector = Self::lambda_arg(args, 1, op)?;
                let mut out = Vec::new();
                for row in rows {
                    let inner = self.invoke(selector, vec![row])?;
                    out.extend(self.rows(inner)?);
                }
                Ok(Value::List(out))
            }

            QueryOperator::Skip | QueryOperator::Take => {
                let count = match args.get(1).map(|a| self.evaluate(a)).transpose()? {
                    Some(Value::Int32(n)) => n.max(0) as usize,
                    _ => {
                        return Err(ExpressionError::EvaluationError {
                            message: format!("{} expects an Int32 count", op.name()),
                        }
                        .into())
                    }
                };
                let out = if op == QueryOperator::Skip {
                    rows.into_iter().skip(count).collect()
                } else {
                    rows.into_iter().take(count).collect()
                };
                Ok(Value::List(out))
            }

            QueryOperator::Distinct => {
                let mut out: Vec<Value> = Vec::new();
                for row in rows {
                    if !out.iter().any(|seen| values_equal(seen, &row)) {
                        out.push(row);
                    }
                }
                Ok(Value::List(out))
            }

            QueryOperator::Count => Ok(count_value(rows.len(), op)?),

            QueryOperator::CountWhere => {
                let predicate = Self::lambda_arg(args, 1, op)?;
                let mut count = 0usize;
                for row in rows {
                    if self.test(predicate, row)? {
                        count += 1;
                    }
                }
                Ok(count_value(count, op)?)
            }

            QueryOperator::Any => Ok(Value::Bool(!rows.is_empty())),

            QueryOperator::AnyWhere | QueryOperator::All => {
                let predicate = Self::lambda_arg(args, 1, op)?;
                let want = op == QueryOperator::AnyWhere;
                for row in rows {
                    if self.test(predicate, row)? == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }

            QueryOperator::First => rows.into_iter().next().ok_or_else(no_elements),

            QueryOperator::FirstWhere => {
                let predicate = Self::lambda_arg(args, 1, op)?;
                for row in rows {
                    if self.test(predicate, row.clone())? {
                        return Ok(row);
                    }
                }
                Err(no_elements())
            }

            QueryOperator::FirstOrDefault => Ok(rows
                .into_iter()
                .next()
                .unwrap_or_else(|| Value::default_of(&element))),

            QueryOperator::Single | QueryOperator::SingleOrDefault => {
                single(rows, op == QueryOperator::SingleOrDefault, &element)
            }

            QueryOperator::SingleWhere => {
                let predicate = Self::lambda_arg(args, 1, op)?;
                let mut matched = Vec::new();
                for row in rows {
                    if self.test(predicate, row.clone())? {
                        matched.push(row);
                    }
                }
                single(matched, false, &element)
            }

            QueryOperator::Sum => {
                let selector = Self::lambda_arg(args, 1, op)?;
                let mut total = Value::default_of(method.return_type.non_nullable());
                for row in rows {
                    let value = self.invoke(selector, vec![row])?;
                    if !value.is_null() {
                        total = evaluate_binary_values(BinaryOperator::Add, total, value)?;
                    }
                }
                Ok(total)
            }

            QueryOperator::Min | QueryOperator::Max => {
                let selector = Self::lambda_arg(args, 1, op)?;
                let mut best: Option<Value> = None;
                for row in rows {
                    let value = self.invoke(selector, vec![row])?;
                    if value.is_null() {
                        continue;
                    }
                    let replace = match &best {
                        None => true,
                        Some(current) => {
                            let ord = compare_values(&value, current).unwrap_or(Ordering::Equal);
                            if op == QueryOperator::Min {
                                ord == Ordering::Less
                            } else {
                                ord == Ordering::Greater
                            }
                        }
                    };
                    if replace {
                        best = Some(value);
                    }
                }
                match best {
                    Some(value) => Ok(value),
                    None if method.return_type.accepts_null() => Ok(Value::Null),
                    None => Err(no_elements()),
                }
            }

            QueryOperator::Contains => {
                let needle = match args.get(1) {
                    Some(arg) => self.evaluate(arg)?,
                    None => Value::Null,
                };
                Ok(Value::Bool(rows.iter().any(|row| values_equal(row, &needle))))
            }

            QueryOperator::OrderBy
            | QueryOperator::OrderByDescending
            | QueryOperator::ThenBy
            | QueryOperator::ThenByDescending => self.evaluate_ordering(op, args),
        }
    }

    /// Sort once by the whole `OrderBy .. ThenBy ..` chain ending at `op`
    fn evaluate_ordering(&mut self, op: QueryOperator, args: &[Expression]) -> Result<Value> {
        let descending = |op: QueryOperator| {
            matches!(
                op,
                QueryOperator::OrderByDescending | QueryOperator::ThenByDescending
            )
        };
        let mut keys = vec![(Self::lambda_arg(args, 1, op)?, descending(op))];
        let mut source = Self::source_arg(args, op)?;
        let mut current = op;
        while matches!(current, QueryOperator::ThenBy | QueryOperator::ThenByDescending) {
            let Expression::Call { method, args, .. } = source else {
                break;
            };
            match method.query_operator() {
                Some((inner, _)) if inner.is_ordering() => {
                    keys.push((Self::lambda_arg(args, 1, inner)?, descending(inner)));
                    source = Self::source_arg(args, inner)?;
                    current = inner;
                }
                _ => break,
            }
        }
        keys.reverse();

        let value = self.evaluate(source)?;
        let rows = self.rows(value)?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row_keys = Vec::with_capacity(keys.len());
            for (selector, _) in &keys {
                row_keys.push(self.invoke(selector, vec![row.clone()])?);
            }
            keyed.push((row_keys, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (_, desc)) in keys.iter().enumerate() {
                let ord = compare_values(&a[i], &b[i]).unwrap_or(Ordering::Equal);
                let ord = if *desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(Value::List(keyed.into_iter().map(|(_, row)| row).collect()))
    }
}

fn no_elements() -> QueryError {
    ExpressionError::Sequence {
        message: "Sequence contains no elements".to_string(),
    }
    .into()
}

fn single(rows: Vec<Value>, or_default: bool, element: &Type) -> Result<Value> {
    let mut rows = rows.into_iter();
    match (rows.next(), rows.next()) {
        (Some(row), None) => Ok(row),
        (None, _) if or_default => Ok(Value::default_of(element)),
        (None, _) => Err(no_elements()),
        (Some(_), Some(_)) => Err(ExpressionError::Sequence {
            message: "Sequence contains more than one element".to_string(),
        }
        .into()),
    }
}

/// Best-effort runtime type of a value, for diagnostics
fn value_type(value: &Value) -> Type {
    match value {
        Value::Bool(_) => Type::bool(),
        Value::Int32(_) => Type::int32(),
        Value::Int64(_) => Type::int64(),
        Value::Float64(_) => Type::float64(),
        Value::String(_) => Type::string(),
        Value::Enum(e) => Type::Named(e.ty.clone()),
        Value::Record(r) => Type::Named(r.ty().clone()),
        Value::List(_) => Type::sequence(Type::object()),
        Value::Queryable(q) => Type::queryable(q.element_type()),
        Value::Null => Type::object(),
    }
}

fn invalid_operands(op: &str, left: &Value, right: Option<&Value>) -> ExpressionError {
    ExpressionError::InvalidOperandTypes {
        operator: op.to_string(),
        left_type: Some(value_type(left)),
        right_type: right.map(value_type),
    }
}

/// Equality with `null == null`
pub fn values_equal(left: &Value, right: &Value) -> bool {
    left == right
}

/// Ordering used by comparisons and sorting; null sorts first
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
        (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
        (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Enum(a), Value::Enum(b)) => Some(a.value.cmp(&b.value)),
        _ => None,
    }
}

fn evaluate_binary_values(op: BinaryOperator, left: Value, right: Value) -> ExpressionResult<Value> {
    match op {
        BinaryOperator::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOperator::Ne => Ok(Value::Bool(!values_equal(&left, &right))),

        BinaryOperator::Lt | BinaryOperator::Le | BinaryOperator::Gt | BinaryOperator::Ge => {
            // Ordered comparisons involving null are false
            if left.is_null() || right.is_null() {
                return Ok(Value::Bool(false));
            }
            let ord = compare_values(&left, &right)
                .ok_or_else(|| invalid_operands(op.as_str(), &left, Some(&right)))?;
            Ok(Value::Bool(match op {
                BinaryOperator::Lt => ord == Ordering::Less,
                BinaryOperator::Le => ord != Ordering::Greater,
                BinaryOperator::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }

        BinaryOperator::And | BinaryOperator::Or => match (&left, &right) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinaryOperator::And {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(invalid_operands(op.as_str(), &left, Some(&right))),
        },

        BinaryOperator::Coalesce => Ok(if left.is_null() { right } else { left }),

        BinaryOperator::Add
        | BinaryOperator::Sub
        | BinaryOperator::Mul
        | BinaryOperator::Div
        | BinaryOperator::Rem => arithmetic(op, left, right),
    }
}

fn integer_op(op: BinaryOperator, a: i64, b: i64) -> ExpressionResult<i64> {
    let result = match op {
        BinaryOperator::Div | BinaryOperator::Rem if b == 0 => {
            return Err(ExpressionError::DivisionByZero)
        }
        BinaryOperator::Add => a.checked_add(b),
        BinaryOperator::Sub => a.checked_sub(b),
        BinaryOperator::Mul => a.checked_mul(b),
        BinaryOperator::Div => a.checked_div(b),
        BinaryOperator::Rem => a.checked_rem(b),
        _ => None,
    };
    result.ok_or_else(|| overflow(op.as_str()))
}

/// Counts are Int32; larger ones overflow instead of wrapping
fn count_value(count: usize, op: QueryOperator) -> ExpressionResult<Value> {
    i32::try_from(count)
        .map(Value::Int32)
        .map_err(|_| overflow(op.name()))
}

fn overflow(context: &str) -> ExpressionError {
    ExpressionError::EvaluationError {
        message: format!("arithmetic overflow in {}", context),
    }
}

fn arithmetic(op: BinaryOperator, left: Value, right: Value) -> ExpressionResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    match (&left, &right) {
        (Value::Int32(a), Value::Int32(b)) => {
            let v = integer_op(op, *a as i64, *b as i64)?;
            i32::try_from(v)
                .map(Value::Int32)
                .map_err(|_| overflow(op.as_str()))
        }
        (Value::Int64(a), Value::Int64(b)) => integer_op(op, *a, *b).map(Value::Int64),
        (Value::Float64(a), Value::Float64(b)) => Ok(Value::Float64(match op {
            BinaryOperator::Add => a + b,
            BinaryOperator::Sub => a - b,
            BinaryOperator::Mul => a * b,
            BinaryOperator::Div => a / b,
            _ => a % b,
        })),
        (Value::String(a), Value::String(b)) if op == BinaryOperator::Add => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        _ => Err(invalid_operands(op.as_str(), &left, Some(&right))),
    }
}

fn evaluate_unary(op: UnaryOperator, operand: Value) -> ExpressionResult<Value> {
    match op {
        UnaryOperator::IsNull => Ok(Value::Bool(operand.is_null())),
        UnaryOperator::IsNotNull => Ok(Value::Bool(!operand.is_null())),
        UnaryOperator::Not => match operand {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(invalid_operands(op.as_str(), &other, None)),
        },
        UnaryOperator::Negate => match operand {
            Value::Null => Ok(Value::Null),
            Value::Int32(n) => n.checked_neg().map(Value::Int32).ok_or_else(|| overflow("-")),
            Value::Int64(n) => n.checked_neg().map(Value::Int64).ok_or_else(|| overflow("-")),
            Value::Float64(n) => Ok(Value::Float64(-n)),
            other => Err(invalid_operands(op.as_str(), &other, None)),
        },
    }
}

/// Runtime conversion to `target`
pub fn convert_value(value: Value, target: &Type) -> ExpressionResult<Value> {
    if value.is_null() {
        return if target.accepts_null() {
            Ok(Value::Null)
        } else {
            Err(ExpressionError::UnexpectedNull {
                context: format!("conversion to {}", target),
            })
        };
    }
    let cannot = |value: &Value| ExpressionError::EvaluationError {
        message: format!("cannot convert {} to {}", value.kind(), target),
    };
    match target {
        Type::Nullable(inner) => convert_value(value, inner),
        Type::Primitive(PrimitiveType::Object) => Ok(value),
        Type::Primitive(p) => match (p, value) {
            (PrimitiveType::Int32, Value::Int32(v)) => Ok(Value::Int32(v)),
            (PrimitiveType::Int32, Value::Int64(v)) => i32::try_from(v)
                .map(Value::Int32)
                .map_err(|_| overflow("conversion to Int32")),
            (PrimitiveType::Int32, Value::Enum(e)) => i32::try_from(e.value)
                .map(Value::Int32)
                .map_err(|_| overflow("conversion to Int32")),
            (PrimitiveType::Int32, Value::Float64(v)) => Ok(Value::Int32(v as i32)),
            (PrimitiveType::Int64, Value::Int32(v)) => Ok(Value::Int64(v as i64)),
            (PrimitiveType::Int64, Value::Int64(v)) => Ok(Value::Int64(v)),
            (PrimitiveType::Int64, Value::Enum(e)) => Ok(Value::Int64(e.value)),
            (PrimitiveType::Int64, Value::Float64(v)) => Ok(Value::Int64(v as i64)),
            (PrimitiveType::Float64, Value::Int32(v)) => Ok(Value::Float64(v as f64)),
            (PrimitiveType::Float64, Value::Int64(v)) => Ok(Value::Float64(v as f64)),
            (PrimitiveType::Float64, Value::Float64(v)) => Ok(Value::Float64(v)),
            (PrimitiveType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (PrimitiveType::String, Value::String(s)) => Ok(Value::String(s)),
            (_, other) => Err(cannot(&other)),
        },
        Type::Named(named) if named.def().is_enum() => match value {
            Value::Int32(v) => Ok(Value::Enum(EnumValue {
                ty: named.clone(),
                value: v as i64,
            })),
            Value::Int64(v) => Ok(Value::Enum(EnumValue {
                ty: named.clone(),
                value: v,
            })),
            Value::Enum(e) if e.ty == *named => Ok(Value::Enum(e)),
            other => Err(cannot(&other)),
        },
        // Reference conversions are checked statically
        _ => Ok(value),
    }
}

fn read_member(instance: Value, declaring: &Type, name: &str) -> ExpressionResult<Value> {
    if let Type::Nullable(_) = declaring {
        match name {
            "HasValue" => return Ok(Value::Bool(!instance.is_null())),
            "Value" if instance.is_null() => {
                return Err(ExpressionError::UnexpectedNull {
                    context: format!("{}.Value", declaring),
                })
            }
            "Value" => return Ok(instance),
            _ => {}
        }
    }
    let unknown = || ExpressionError::UnknownMember {
        ty: declaring.clone(),
        name: name.to_string(),
    };
    match instance {
        Value::Null => Err(ExpressionError::UnexpectedNull {
            context: format!("access to {}.{}", declaring, name),
        }),
        Value::Record(record) => record.get(name).cloned().ok_or_else(unknown),
        Value::String(s) if name == "Length" => Ok(Value::Int32(s.chars().count() as i32)),
        Value::List(items) if name == "Length" => Ok(Value::Int32(items.len() as i32)),
        _ => Err(unknown()),
    }
}

fn evaluate_intrinsic(
    intrinsic: Intrinsic,
    instance: Option<Value>,
    args: Vec<Value>,
) -> ExpressionResult<Value> {
    let context = || format!("{:?}", intrinsic);
    match intrinsic {
        Intrinsic::Contains
        | Intrinsic::StartsWith
        | Intrinsic::EndsWith
        | Intrinsic::ToUpper
        | Intrinsic::ToLower => {
            let s = match instance {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => {
                    return Err(ExpressionError::UnexpectedNull { context: context() })
                }
                Some(other) => return Err(invalid_operands(&context(), &other, None)),
            };
            let arg = match args.first() {
                Some(Value::String(a)) => Some(a.as_str()),
                Some(Value::Null) => {
                    return Err(ExpressionError::UnexpectedNull { context: context() })
                }
                _ => None,
            };
            let needle = || arg.ok_or_else(|| ExpressionError::UnexpectedNull { context: context() });
            Ok(match intrinsic {
                Intrinsic::Contains => Value::Bool(s.contains(needle()?)),
                Intrinsic::StartsWith => Value::Bool(s.starts_with(needle()?)),
                Intrinsic::EndsWith => Value::Bool(s.ends_with(needle()?)),
                Intrinsic::ToUpper => Value::String(s.to_uppercase()),
                _ => Value::String(s.to_lowercase()),
            })
        }
        Intrinsic::Abs(_) => match args.into_iter().next() {
            Some(Value::Int32(v)) => v.checked_abs().map(Value::Int32).ok_or_else(|| overflow("Abs")),
            Some(Value::Int64(v)) => v.checked_abs().map(Value::Int64).ok_or_else(|| overflow("Abs")),
            Some(Value::Float64(v)) => Ok(Value::Float64(v.abs())),
            Some(Value::Null) | None => Err(ExpressionError::UnexpectedNull { context: context() }),
            Some(other) => Err(invalid_operands("Abs", &other, None)),
        },
        Intrinsic::Now => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Value::Int64(d.as_millis() as i64))
            .map_err(|e| ExpressionError::EvaluationError {
                message: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Closure, MethodRegistry, SourceKind};
    use crate::types::TypeDef;
    use crate::value::MemoryDataSet;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn product_def() -> Arc<TypeDef> {
        TypeDef::record(
            "shop",
            "Product",
            vec![("Id", Type::int32()), ("Name", Type::string()), ("Price", Type::float64())],
        )
    }

    fn products(def: &Arc<TypeDef>) -> Vec<Value> {
        [(3, "desk", 120.0), (1, "lamp", 20.0), (2, "chair", 45.5), (1, "bulb", 2.0)]
            .into_iter()
            .map(|(id, name, price)| {
                Value::Record(
                    Record::from_pairs(
                        &Type::named(def),
                        vec![
                            ("Id", Value::Int32(id)),
                            ("Name", Value::from(name)),
                            ("Price", Value::Float64(price)),
                        ],
                    )
                    .unwrap(),
                )
            })
            .collect()
    }

    fn source(def: &Arc<TypeDef>) -> Expression {
        Expression::constant(
            Value::List(products(def)),
            Type::sequence(Type::named(def)),
        )
    }

    fn lambda(
        ty: Type,
        body: impl FnOnce(Expression) -> ExpressionResult<Expression>,
    ) -> Expression {
        let p = ParameterRef::new("p", ty);
        let body = body(Expression::parameter(&p)).unwrap();
        Expression::lambda(vec![p], body)
    }

    fn call(op: QueryOperator, generic_args: &[Type], args: Vec<Expression>) -> Expression {
        let method = MethodRegistry::new()
            .query_operator(op, SourceKind::Sequence, generic_args)
            .unwrap();
        Expression::call(None, method, args).unwrap()
    }

    #[test]
    fn test_arithmetic_and_null_semantics() {
        let eval = |e: ExpressionResult<Expression>| evaluate(&e.unwrap()).unwrap();
        assert_eq!(eval(Expression::literal(7).add(Expression::literal(5))), Value::Int32(12));
        assert_eq!(eval(Expression::literal(7).modulo(Expression::literal(5))), Value::Int32(2));
        assert_eq!(
            eval(Expression::literal("a").add(Expression::literal("b"))),
            Value::from("ab")
        );

        let null_int = Expression::null(Type::nullable(Type::int32()));
        assert_eq!(eval(null_int.clone().add(Expression::literal(1))), Value::Null);
        assert_eq!(eval(null_int.clone().less_than(Expression::literal(1))), Value::Bool(false));
        assert_eq!(eval(null_int.clone().equal(null_int.clone())), Value::Bool(true));
        assert_eq!(eval(null_int.clone().coalesce(Expression::literal(4))), Value::Int32(4));

        let err = evaluate(&Expression::literal(1).divide(Expression::literal(0)).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Expression(ExpressionError::DivisionByZero)
        ));

        let err = evaluate(
            &Expression::literal(i32::MAX)
                .add(Expression::literal(1))
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_short_circuit() {
        // The right side would divide by zero if evaluated
        let boom = Expression::literal(1)
            .divide(Expression::literal(0))
            .unwrap()
            .equal(Expression::literal(1))
            .unwrap();
        let expr = Expression::literal(false).and_also(boom).unwrap();
        assert_eq!(evaluate(&expr).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_where_select() {
        let def = product_def();
        let pt = Type::named(&def);
        let filtered = call(
            QueryOperator::Where,
            &[pt.clone()],
            vec![
                source(&def),
                lambda(pt.clone(), |p| p.member("Id")?.equal(Expression::literal(1))),
            ],
        );
        let names = call(
            QueryOperator::Select,
            &[pt.clone(), Type::string()],
            vec![filtered, lambda(pt.clone(), |p| p.member("Name"))],
        );
        assert_eq!(
            evaluate(&names).unwrap(),
            Value::from(vec!["lamp", "bulb"])
        );
    }

    #[test]
    fn test_order_by_then_by() {
        let def = product_def();
        let pt = Type::named(&def);
        let ordered = call(
            QueryOperator::OrderBy,
            &[pt.clone(), Type::int32()],
            vec![source(&def), lambda(pt.clone(), |p| p.member("Id"))],
        );
        let then = call(
            QueryOperator::ThenByDescending,
            &[pt.clone(), Type::float64()],
            vec![ordered, lambda(pt.clone(), |p| p.member("Price"))],
        );
        let names = call(
            QueryOperator::Select,
            &[pt.clone(), Type::string()],
            vec![then, lambda(pt.clone(), |p| p.member("Name"))],
        );
        assert_eq!(
            evaluate(&names).unwrap(),
            Value::from(vec!["lamp", "bulb", "chair", "desk"])
        );
    }

    #[test]
    fn test_terminal_operators() {
        let def = product_def();
        let pt = Type::named(&def);
        let count = call(QueryOperator::Count, &[pt.clone()], vec![source(&def)]);
        assert_eq!(evaluate(&count).unwrap(), Value::Int32(4));

        let sum = call(
            QueryOperator::Sum,
            &[pt.clone(), Type::float64()],
            vec![source(&def), lambda(pt.clone(), |p| p.member("Price"))],
        );
        assert_eq!(evaluate(&sum).unwrap(), Value::Float64(187.5));

        let max = call(
            QueryOperator::Max,
            &[pt.clone(), Type::int32()],
            vec![source(&def), lambda(pt.clone(), |p| p.member("Id"))],
        );
        assert_eq!(evaluate(&max).unwrap(), Value::Int32(3));

        let single = call(
            QueryOperator::SingleWhere,
            &[pt.clone()],
            vec![
                source(&def),
                lambda(pt.clone(), |p| p.member("Id")?.equal(Expression::literal(1))),
            ],
        );
        let err = evaluate(&single).unwrap_err();
        assert!(err.to_string().contains("more than one element"));

        let empty = Expression::constant(Value::List(vec![]), Type::sequence(Type::int32()));
        let first = call(QueryOperator::First, &[Type::int32()], vec![empty.clone()]);
        assert!(evaluate(&first).unwrap_err().to_string().contains("no elements"));
        let first_or_default =
            call(QueryOperator::FirstOrDefault, &[Type::int32()], vec![empty.clone()]);
        assert_eq!(evaluate(&first_or_default).unwrap(), Value::Int32(0));
        let min = call(
            QueryOperator::Min,
            &[Type::int32(), Type::int32()],
            vec![empty, lambda(Type::int32(), Ok)],
        );
        assert!(evaluate(&min).is_err());
    }

    #[test]
    fn test_nested_lambda_sees_outer_parameter() {
        let def = product_def();
        let pt = Type::named(&def);
        // products.Where(p => products.Count(q => q.Id == p.Id) > 1)
        let outer = ParameterRef::new("p", pt.clone());
        let inner = ParameterRef::new("q", pt.clone());
        let inner_body = Expression::parameter(&inner)
            .member("Id")
            .unwrap()
            .equal(Expression::parameter(&outer).member("Id").unwrap())
            .unwrap();
        let count = call(
            QueryOperator::CountWhere,
            &[pt.clone()],
            vec![source(&def), Expression::lambda(vec![inner], inner_body)],
        );
        let predicate = Expression::lambda(
            vec![outer],
            count.greater_than(Expression::literal(1)).unwrap(),
        );
        let duplicates = call(QueryOperator::Where, &[pt.clone()], vec![source(&def), predicate]);
        match evaluate(&duplicates).unwrap() {
            Value::List(rows) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unbound_parameter() {
        let p = ParameterRef::new("p", Type::int32());
        let err = evaluate(&Expression::parameter(&p)).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Expression(ExpressionError::UnboundParameter { .. })
        ));
    }

    #[test]
    fn test_intrinsics_and_closure() {
        let registry = MethodRegistry::new();
        let upper = Expression::call(
            Some(Expression::literal("desk")),
            registry.intrinsic(Intrinsic::ToUpper),
            vec![],
        )
        .unwrap();
        assert_eq!(evaluate(&upper).unwrap(), Value::from("DESK"));

        let closure = Closure::new(vec![("delta", Value::Int64(-5), Type::int64())]).unwrap();
        let abs = Expression::call(
            None,
            registry.intrinsic(Intrinsic::Abs(PrimitiveType::Int64)),
            vec![closure.get("delta").unwrap()],
        )
        .unwrap();
        assert_eq!(evaluate(&abs).unwrap(), Value::Int64(5));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            convert_value(Value::Int32(3), &Type::nullable(Type::int64())).unwrap(),
            Value::Int64(3)
        );
        assert_eq!(
            convert_value(Value::Null, &Type::nullable(Type::int32())).unwrap(),
            Value::Null
        );
        assert!(convert_value(Value::Null, &Type::int32()).is_err());
        assert!(convert_value(Value::Int64(i64::MAX), &Type::int32()).is_err());

        let status = TypeDef::enumeration("shop", "Status", vec![("Active", 1)]);
        let converted = convert_value(Value::Int32(1), &Type::named(&status)).unwrap();
        assert_eq!(converted.to_string(), "Status.Active");
        assert_eq!(convert_value(converted, &Type::int32()).unwrap(), Value::Int32(1));
    }

    struct CountingSet {
        inner: MemoryDataSet,
        loads: AtomicUsize,
    }

    impl DataSet for CountingSet {
        fn element_type(&self) -> Type {
            self.inner.element_type()
        }

        fn load(&self) -> anyhow::Result<Vec<Value>> {
            self.loads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.load()
        }
    }

    #[test]
    fn test_count_overflow() {
        assert_eq!(count_value(3, QueryOperator::Count).unwrap(), Value::Int32(3));
        let max = i32::MAX as usize;
        assert_eq!(
            count_value(max, QueryOperator::Count).unwrap(),
            Value::Int32(i32::MAX)
        );
        let err = count_value(max + 1, QueryOperator::CountWhere).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_data_loads_preload_and_cancellation() {
        let data: Arc<dyn DataSet> = Arc::new(CountingSet {
            inner: MemoryDataSet::new(Type::int32(), vec![Value::Int32(1), Value::Int32(2)]),
            loads: AtomicUsize::new(0),
        });
        let source = Expression::queryable(QueryableValue::Data(data.clone()));
        let count = MethodRegistry::new()
            .query_operator(QueryOperator::Count, SourceKind::Queryable, &[Type::int32()])
            .unwrap();
        let expr = Expression::call(None, count, vec![source]).unwrap();
        assert_eq!(data_sets(&expr).len(), 1);

        let mut evaluator = ExpressionEvaluator::new();
        assert_eq!(evaluator.evaluate(&expr).unwrap(), Value::Int32(2));
        assert_eq!(evaluator.loads(), 1);
        assert_eq!(evaluator.evaluate(&expr).unwrap(), Value::Int32(2));
        assert_eq!(evaluator.loads(), 1);

        let mut preloaded = ExpressionEvaluator::new();
        preloaded.preload(&data, vec![Value::Int32(9)]);
        assert_eq!(preloaded.evaluate(&expr).unwrap(), Value::Int32(1));
        assert_eq!(preloaded.loads(), 0);

        let token = CancellationToken::new();
        token.cancel();
        let mut cancelled = ExpressionEvaluator::new().with_cancellation(token);
        assert!(cancelled.evaluate(&expr).unwrap_err().is_cancelled());
        assert_eq!(cancelled.loads(), 0);
    }
}
