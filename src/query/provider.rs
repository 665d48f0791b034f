//! Query provider: translation, the remote call and result conversion for
//! every terminal operation.

use crate::expression::{Expression, MethodRegistry};
use crate::pipeline::CancellationToken;
use crate::remote::RemoteExpression;
use crate::translate::{OutboundTranslator, RemoteResult, TranslationOptions};
use crate::types::{ResolutionContext, Type};
use crate::value::{BoxFuture, QueryableValue, Value};
use crate::{QueryError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Queryable;

/// Blocking transport to the executing side
pub trait RemoteCall: Send + Sync {
    fn call(&self, query: RemoteExpression) -> anyhow::Result<RemoteResult>;
}

impl<F> RemoteCall for F
where
    F: Fn(RemoteExpression) -> anyhow::Result<RemoteResult> + Send + Sync,
{
    fn call(&self, query: RemoteExpression) -> anyhow::Result<RemoteResult> {
        self(query)
    }
}

/// Asynchronous transport to the executing side
pub trait AsyncRemoteCall: Send + Sync {
    fn call_async(&self, query: RemoteExpression) -> BoxFuture<'_, anyhow::Result<RemoteResult>>;
}

/// Entry point for composing queries against one remote endpoint.
///
/// Cloning is cheap and clones share the transport, the resolution context
/// and the round-trip counter.
#[derive(Clone)]
pub struct QueryProvider {
    remote: Option<Arc<dyn RemoteCall>>,
    remote_async: Option<Arc<dyn AsyncRemoteCall>>,
    context: ResolutionContext,
    options: TranslationOptions,
    round_trips: Arc<AtomicUsize>,
}

impl QueryProvider {
    pub fn new(remote: impl RemoteCall + 'static) -> Self {
        Self {
            remote: Some(Arc::new(remote)),
            remote_async: None,
            context: ResolutionContext::default(),
            options: TranslationOptions::default(),
            round_trips: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn new_async(remote: impl AsyncRemoteCall + 'static) -> Self {
        Self {
            remote: None,
            remote_async: Some(Arc::new(remote)),
            context: ResolutionContext::default(),
            options: TranslationOptions::default(),
            round_trips: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Also serve `*_async` terminals through `remote`
    pub fn with_async(mut self, remote: impl AsyncRemoteCall + 'static) -> Self {
        self.remote_async = Some(Arc::new(remote));
        self
    }

    /// Context used to resolve result types
    pub fn with_context(mut self, context: ResolutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: TranslationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn context(&self) -> &ResolutionContext {
        &self.context
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        self.context.methods()
    }

    /// Number of remote calls issued by this provider and its clones
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Queryable over the remote data source `name` with rows of `element_type`
    pub fn query(&self, element_type: Type, name: Option<&str>) -> Queryable {
        Queryable::source(
            self.clone(),
            element_type.clone(),
            Expression::queryable(QueryableValue::Resource {
                element_type,
                name: name.map(str::to_string),
            }),
        )
    }

    /// Check the result shape, then translate
    pub fn prepare(&self, expr: &Expression, requested: &Type) -> Result<RemoteExpression> {
        check_shape(&expr.ty(), requested)?;
        OutboundTranslator::new(self.options).translate(expr)
    }

    pub fn execute(
        &self,
        expr: &Expression,
        requested: &Type,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Value> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| QueryError::not_supported("provider has no blocking remote call"))?;
        check_cancelled(cancellation)?;
        let query = self.prepare(expr, requested)?;
        check_cancelled(cancellation)?;

        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let result = remote.call(query).map_err(QueryError::Remote)?;
        result.into_value(requested, &self.context)
    }

    pub async fn execute_async(
        &self,
        expr: &Expression,
        requested: &Type,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Value> {
        let remote = self
            .remote_async
            .as_ref()
            .ok_or_else(|| QueryError::not_supported("provider has no asynchronous remote call"))?;
        check_cancelled(cancellation)?;
        let query = self.prepare(expr, requested)?;
        check_cancelled(cancellation)?;

        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let result = match cancellation {
            Some(token) => tokio::select! {
                result = remote.call_async(query) => result,
                _ = token.cancelled() => return Err(QueryError::Cancelled),
            },
            None => remote.call_async(query).await,
        };
        result
            .map_err(QueryError::Remote)?
            .into_value(requested, &self.context)
    }
}

fn check_cancelled(cancellation: Option<&CancellationToken>) -> Result<()> {
    match cancellation {
        Some(token) => token.check(),
        None => Ok(()),
    }
}

/// Whether a result of static type `actual` can be delivered as `requested`
fn check_shape(actual: &Type, requested: &Type) -> Result<()> {
    let compatible = requested.is_assignable_from(actual)
        || match (requested, actual) {
            (Type::Array(e), Type::Queryable(a))
            | (Type::Array(e), Type::Sequence(a))
            | (Type::Array(e), Type::Array(a)) => e.is_assignable_from(a),
            _ => false,
        };
    if compatible {
        Ok(())
    } else {
        Err(QueryError::ResultShape {
            requested: requested.to_string(),
            actual: actual.to_string(),
        })
    }
}
