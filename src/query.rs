//! Query composition.
//!
//! A [`Queryable`] accumulates an expression through operator calls; nothing
//! runs until a terminal operation. Each terminal translates the whole
//! expression, including queryables referenced from inside its lambdas,
//! and issues exactly one remote call.

pub mod provider;

pub use provider::{AsyncRemoteCall, QueryProvider, RemoteCall};

use crate::expression::{Expression, ParameterRef, QueryOperator, SourceKind};
use crate::pipeline::CancellationToken;
use crate::types::Type;
use crate::value::{FromValue, QueryableValue, Value};
use crate::{QueryError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of a queryable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Bare data source; no operator applied yet
    Unbound,
    /// Expression accumulated, nothing executed
    Composed,
    /// Translation or the remote call in progress
    Executing,
    Materialized,
    Faulted,
}

#[derive(Clone)]
pub struct Queryable {
    provider: QueryProvider,
    element_type: Type,
    expression: Arc<Expression>,
    state: Arc<Mutex<QueryState>>,
    cancellation: Option<CancellationToken>,
}

impl std::fmt::Debug for Queryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queryable")
            .field("element_type", &self.element_type)
            .field("expression", &self.expression.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl Queryable {
    pub(crate) fn new(provider: QueryProvider, element_type: Type, expression: Expression) -> Self {
        Self::with_state(provider, element_type, expression, QueryState::Composed)
    }

    /// Root queryable over a data source
    pub(crate) fn source(provider: QueryProvider, element_type: Type, expression: Expression) -> Self {
        Self::with_state(provider, element_type, expression, QueryState::Unbound)
    }

    fn with_state(
        provider: QueryProvider,
        element_type: Type,
        expression: Expression,
        state: QueryState,
    ) -> Self {
        Self {
            provider,
            element_type,
            expression: Arc::new(expression),
            state: Arc::new(Mutex::new(state)),
            cancellation: None,
        }
    }

    pub fn element_type(&self) -> &Type {
        &self.element_type
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn state(&self) -> QueryState {
        *self.state.lock()
    }

    pub fn provider(&self) -> &QueryProvider {
        &self.provider
    }

    /// Terminals check `token` before translating and before the remote call
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// This query as a value usable inside the lambdas of another query
    pub fn as_expression(&self) -> Expression {
        Expression::queryable(QueryableValue::Query {
            element_type: self.element_type.clone(),
            expression: self.expression.clone(),
        })
    }

    /// One-parameter lambda over the element type
    pub fn lambda(&self, f: impl FnOnce(Expression) -> Result<Expression>) -> Result<Expression> {
        let param = ParameterRef::new("x", self.element_type.clone());
        let body = f(Expression::parameter(&param))?;
        Ok(Expression::lambda(vec![param], body))
    }

    /// Operator call over this query, for use inside another query's lambda
    pub fn nested(
        &self,
        op: QueryOperator,
        f: Option<&dyn Fn(Expression) -> Result<Expression>>,
    ) -> Result<Expression> {
        let lambda = f.map(|f| self.lambda(f)).transpose()?;
        self.operator_call(self.as_expression(), op, lambda.into_iter().collect())
    }

    fn operator_call(
        &self,
        source: Expression,
        op: QueryOperator,
        extra: Vec<Expression>,
    ) -> Result<Expression> {
        let mut generic_args = vec![self.element_type.clone()];
        if op.generic_arity() == 2 {
            let selected = extra
                .first()
                .and_then(Expression::as_lambda)
                .map(|l| l.body.ty())
                .ok_or_else(|| {
                    QueryError::translation(format!("{} expects a selector", op.name()))
                })?;
            generic_args.push(match op {
                // SelectMany takes the element type of the selected sequence
                QueryOperator::SelectMany => selected.element_type().cloned().ok_or_else(|| {
                    QueryError::translation(format!("{} does not select a sequence", selected))
                })?,
                _ => selected,
            });
        }
        let method = self
            .provider
            .methods()
            .query_operator(op, SourceKind::Queryable, &generic_args)?;
        let mut args = vec![source];
        args.extend(extra);
        Ok(Expression::call(None, method, args)?)
    }

    fn compose(&self, op: QueryOperator, extra: Vec<Expression>, element: Type) -> Result<Queryable> {
        let expr = self.operator_call((*self.expression).clone(), op, extra)?;
        let mut next = Queryable::new(self.provider.clone(), element, expr);
        next.cancellation = self.cancellation.clone();
        Ok(next)
    }

    pub fn filter(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<Queryable> {
        let lambda = self.lambda(predicate)?;
        self.compose(QueryOperator::Where, vec![lambda], self.element_type.clone())
    }

    pub fn map(&self, selector: impl FnOnce(Expression) -> Result<Expression>) -> Result<Queryable> {
        let lambda = self.lambda(selector)?;
        let element = lambda.as_lambda().map(|l| l.body.ty()).unwrap_or_else(Type::object);
        self.compose(QueryOperator::Select, vec![lambda], element)
    }

    pub fn flat_map(&self, selector: impl FnOnce(Expression) -> Result<Expression>) -> Result<Queryable> {
        let lambda = self.lambda(selector)?;
        let element = lambda
            .as_lambda()
            .and_then(|l| l.body.ty().element_type().cloned())
            .ok_or_else(|| QueryError::translation("flat_map selector must return a sequence"))?;
        self.compose(QueryOperator::SelectMany, vec![lambda], element)
    }

    pub fn order_by(&self, key: impl FnOnce(Expression) -> Result<Expression>) -> Result<Queryable> {
        self.ordered(QueryOperator::OrderBy, key)
    }

    pub fn order_by_descending(
        &self,
        key: impl FnOnce(Expression) -> Result<Expression>,
    ) -> Result<Queryable> {
        self.ordered(QueryOperator::OrderByDescending, key)
    }

    /// Secondary ordering; only valid directly after another ordering
    pub fn then_by(&self, key: impl FnOnce(Expression) -> Result<Expression>) -> Result<Queryable> {
        self.require_ordering(QueryOperator::ThenBy)?;
        self.ordered(QueryOperator::ThenBy, key)
    }

    pub fn then_by_descending(
        &self,
        key: impl FnOnce(Expression) -> Result<Expression>,
    ) -> Result<Queryable> {
        self.require_ordering(QueryOperator::ThenByDescending)?;
        self.ordered(QueryOperator::ThenByDescending, key)
    }

    fn ordered(
        &self,
        op: QueryOperator,
        key: impl FnOnce(Expression) -> Result<Expression>,
    ) -> Result<Queryable> {
        let lambda = self.lambda(key)?;
        self.compose(op, vec![lambda], self.element_type.clone())
    }

    fn require_ordering(&self, op: QueryOperator) -> Result<()> {
        let ordered = match &*self.expression {
            Expression::Call { method, .. } => method
                .query_operator()
                .map_or(false, |(previous, _)| previous.is_ordering()),
            _ => false,
        };
        if ordered {
            Ok(())
        } else {
            Err(QueryError::not_supported(format!(
                "{} must follow an ordering operator",
                op.name()
            )))
        }
    }

    pub fn skip(&self, count: i32) -> Result<Queryable> {
        self.compose(
            QueryOperator::Skip,
            vec![Expression::literal(count)],
            self.element_type.clone(),
        )
    }

    pub fn take(&self, count: i32) -> Result<Queryable> {
        self.compose(
            QueryOperator::Take,
            vec![Expression::literal(count)],
            self.element_type.clone(),
        )
    }

    pub fn distinct(&self) -> Result<Queryable> {
        self.compose(QueryOperator::Distinct, vec![], self.element_type.clone())
    }

    /// Eager-load hint for `path`, interpreted by the executing side
    pub fn include(&self, path: &str) -> Result<Queryable> {
        let method = self.provider.methods().include(&self.element_type);
        let expr = Expression::call(
            None,
            method,
            vec![(*self.expression).clone(), Expression::literal(path)],
        )?;
        let mut next = Queryable::new(self.provider.clone(), self.element_type.clone(), expr);
        next.cancellation = self.cancellation.clone();
        Ok(next)
    }

    /// Execute the query itself, delivering the result as `requested`
    pub fn execute(&self, requested: &Type) -> Result<Value> {
        let expr = self.expression.clone();
        self.run(&expr, requested)
    }

    pub async fn execute_async(&self, requested: &Type) -> Result<Value> {
        let expr = self.expression.clone();
        self.run_async(&expr, requested).await
    }

    /// Enumerate every element
    pub fn to_list(&self) -> Result<Vec<Value>> {
        self.to_vec()
    }

    pub fn to_vec<T: FromValue>(&self) -> Result<Vec<T>> {
        Vec::<T>::from_value(self.execute(&Type::sequence(self.element_type.clone()))?)
    }

    pub async fn to_list_async(&self) -> Result<Vec<Value>> {
        Vec::<Value>::from_value(
            self.execute_async(&Type::sequence(self.element_type.clone()))
                .await?,
        )
    }

    pub fn count(&self) -> Result<i32> {
        i32::from_value(self.terminal(QueryOperator::Count, vec![], Type::int32())?)
    }

    pub async fn count_async(&self) -> Result<i32> {
        let expr = self.operator_call((*self.expression).clone(), QueryOperator::Count, vec![])?;
        i32::from_value(self.run_async(&expr, &Type::int32()).await?)
    }

    pub fn count_where(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<i32> {
        let lambda = self.lambda(predicate)?;
        i32::from_value(self.terminal(QueryOperator::CountWhere, vec![lambda], Type::int32())?)
    }

    pub fn any(&self) -> Result<bool> {
        bool::from_value(self.terminal(QueryOperator::Any, vec![], Type::bool())?)
    }

    pub fn any_where(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<bool> {
        let lambda = self.lambda(predicate)?;
        bool::from_value(self.terminal(QueryOperator::AnyWhere, vec![lambda], Type::bool())?)
    }

    pub fn all(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<bool> {
        let lambda = self.lambda(predicate)?;
        bool::from_value(self.terminal(QueryOperator::All, vec![lambda], Type::bool())?)
    }

    pub fn first(&self) -> Result<Value> {
        self.terminal(QueryOperator::First, vec![], self.element_type.clone())
    }

    pub async fn first_async(&self) -> Result<Value> {
        let expr = self.operator_call((*self.expression).clone(), QueryOperator::First, vec![])?;
        self.run_async(&expr, &self.element_type).await
    }

    pub fn first_where(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<Value> {
        let lambda = self.lambda(predicate)?;
        self.terminal(QueryOperator::FirstWhere, vec![lambda], self.element_type.clone())
    }

    /// First element, or the element type's default when there is none
    pub fn first_or_default(&self) -> Result<Value> {
        self.terminal(QueryOperator::FirstOrDefault, vec![], self.element_type.clone())
    }

    pub fn single(&self) -> Result<Value> {
        self.terminal(QueryOperator::Single, vec![], self.element_type.clone())
    }

    pub fn single_where(&self, predicate: impl FnOnce(Expression) -> Result<Expression>) -> Result<Value> {
        let lambda = self.lambda(predicate)?;
        self.terminal(QueryOperator::SingleWhere, vec![lambda], self.element_type.clone())
    }

    pub fn single_or_default(&self) -> Result<Value> {
        self.terminal(QueryOperator::SingleOrDefault, vec![], self.element_type.clone())
    }

    pub fn sum(&self, selector: impl FnOnce(Expression) -> Result<Expression>) -> Result<Value> {
        self.aggregate(QueryOperator::Sum, selector)
    }

    pub fn min(&self, selector: impl FnOnce(Expression) -> Result<Expression>) -> Result<Value> {
        self.aggregate(QueryOperator::Min, selector)
    }

    pub fn max(&self, selector: impl FnOnce(Expression) -> Result<Expression>) -> Result<Value> {
        self.aggregate(QueryOperator::Max, selector)
    }

    fn aggregate(
        &self,
        op: QueryOperator,
        selector: impl FnOnce(Expression) -> Result<Expression>,
    ) -> Result<Value> {
        let lambda = self.lambda(selector)?;
        let result = lambda.as_lambda().map(|l| l.body.ty()).unwrap_or_else(Type::object);
        self.terminal(op, vec![lambda], result)
    }

    /// Whether the query yields `value`; the value travels as a query argument
    pub fn contains(&self, value: Value) -> Result<bool> {
        let item = Expression::variable_value(None, value, self.element_type.clone());
        bool::from_value(self.terminal(QueryOperator::Contains, vec![item], Type::bool())?)
    }

    fn terminal(&self, op: QueryOperator, extra: Vec<Expression>, requested: Type) -> Result<Value> {
        let expr = self.operator_call((*self.expression).clone(), op, extra)?;
        self.run(&expr, &requested)
    }

    fn run(&self, expr: &Expression, requested: &Type) -> Result<Value> {
        self.set_state(QueryState::Executing);
        let result = self
            .provider
            .execute(expr, requested, self.cancellation.as_ref());
        self.finish(result)
    }

    async fn run_async(&self, expr: &Expression, requested: &Type) -> Result<Value> {
        self.set_state(QueryState::Executing);
        let result = self
            .provider
            .execute_async(expr, requested, self.cancellation.as_ref())
            .await;
        self.finish(result)
    }

    fn finish(&self, result: Result<Value>) -> Result<Value> {
        match &result {
            Ok(_) => self.set_state(QueryState::Materialized),
            Err(e) => {
                log::debug!("query faulted: {}", e);
                self.set_state(QueryState::Faulted);
            }
        }
        result
    }

    fn set_state(&self, state: QueryState) {
        *self.state.lock() = state;
    }
}
