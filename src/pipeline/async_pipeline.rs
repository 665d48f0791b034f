//! Asynchronous execution.
//!
//! Shares the synchronous stages, except that `execute` and `convert` run as
//! async stages. The default async execute loads every data source the
//! prepared expression references before evaluating it, so a correlated
//! subquery reads each source once.

use super::{AsyncStage, CancellationToken, Conversion, Execution, RawResult, Stage, Stages};
use crate::expression::eval::data_sets;
use crate::query::AsyncRemoteCall;
use crate::remote::RemoteExpression;
use crate::translate::RemoteResult;
use crate::types::Type;
use crate::value::{BoxFuture, Value};
use crate::{QueryError, Result};
use log::{debug, warn};
use std::sync::Arc;

/// Default async execute: load the referenced data sources, then run `execute`
pub(crate) fn preloading(execute: Stage<Execution, RawResult>) -> AsyncStage<Execution, RawResult> {
    Arc::new(move |execution: Execution| -> BoxFuture<'static, Result<RawResult>> {
        let execute = execute.clone();
        Box::pin(async move {
            let execution = preload(execution).await?;
            execute(execution)
        })
    })
}

/// Default async convert: check cancellation, then run `convert`
pub(crate) fn checked(convert: Stage<RawResult, RemoteResult>) -> AsyncStage<Conversion, RemoteResult> {
    Arc::new(move |conversion: Conversion| -> BoxFuture<'static, Result<RemoteResult>> {
        let convert = convert.clone();
        Box::pin(async move {
            conversion.cancellation.check()?;
            convert(conversion.raw)
        })
    })
}

/// Load every referenced data source not loaded yet, checking the token
/// before each load
async fn preload(mut execution: Execution) -> Result<Execution> {
    let token = execution.cancellation.clone();
    for data in data_sets(&execution.expression) {
        if execution.is_preloaded(&data) {
            continue;
        }
        token.check()?;
        let rows = tokio::select! {
            rows = data.load_async() => rows.map_err(QueryError::DataSource)?,
            _ = token.cancelled() => return Err(QueryError::Cancelled),
        };
        debug!("loaded {} rows of {}", rows.len(), data.element_type());
        execution.preload(data, rows);
    }
    Ok(execution)
}

#[derive(Clone)]
pub struct AsyncExecutionPipeline {
    stages: Arc<Stages>,
}

impl AsyncExecutionPipeline {
    pub(crate) fn new(stages: Arc<Stages>) -> Self {
        Self { stages }
    }

    pub async fn execute_async(
        &self,
        query: RemoteExpression,
        token: &CancellationToken,
    ) -> Result<RemoteResult> {
        let result = self.run(query, token).await;
        if let Err(e) = &result {
            warn!("query execution faulted: {}", e);
        }
        result
    }

    async fn run(&self, query: RemoteExpression, token: &CancellationToken) -> Result<RemoteResult> {
        let raw = self.execute_raw(query, token).await?;
        let raw = (self.stages.process_raw)(raw)?;
        let converted = (self.stages.convert_async)(Conversion {
            raw,
            cancellation: token.clone(),
        })
        .await?;
        (self.stages.process_converted)(converted)
    }

    async fn execute_raw(&self, query: RemoteExpression, token: &CancellationToken) -> Result<RawResult> {
        let native = self.stages.prepare(query, token)?;
        let native = (self.stages.prepare_async)(native)?;
        (self.stages.execute_async)(Execution::new(native, token.clone())).await
    }

    /// Execute, then yield the elements of a sequence result one at a time
    pub async fn execute_stream(
        &self,
        query: RemoteExpression,
        token: CancellationToken,
    ) -> Result<QueryStream> {
        let raw = self.execute_raw(query, &token).await?;
        let raw = (self.stages.process_raw)(raw)?;
        let element_type = raw.ty.element_type().cloned().unwrap_or_else(|| raw.ty.clone());
        let items = match raw.value {
            Value::List(items) => items,
            other => vec![other],
        };
        Ok(QueryStream {
            items: items.into_iter(),
            element_type,
            convert: self.stages.convert_async.clone(),
            process_converted: self.stages.process_converted.clone(),
            token,
            consumed: 0,
            done: false,
        })
    }
}

impl AsyncRemoteCall for AsyncExecutionPipeline {
    fn call_async(&self, query: RemoteExpression) -> BoxFuture<'_, anyhow::Result<RemoteResult>> {
        Box::pin(async move {
            let token = CancellationToken::new();
            Ok(self.execute_async(query, &token).await?)
        })
    }
}

/// Converted elements of one streamed execution.
///
/// Cancellation is checked before each element; once it fails the stream
/// yields the error and then ends. Dropping the stream releases the rows.
pub struct QueryStream {
    items: std::vec::IntoIter<Value>,
    element_type: Type,
    convert: AsyncStage<Conversion, RemoteResult>,
    process_converted: Stage<RemoteResult, RemoteResult>,
    token: CancellationToken,
    consumed: usize,
    done: bool,
}

impl QueryStream {
    pub async fn next(&mut self) -> Option<Result<RemoteResult>> {
        if self.done {
            return None;
        }
        if let Err(e) = self.token.check() {
            debug!("stream cancelled after {} elements", self.consumed);
            self.done = true;
            return Some(Err(e));
        }
        let value = match self.items.next() {
            Some(value) => value,
            None => {
                self.done = true;
                return None;
            }
        };
        self.consumed += 1;
        let conversion = Conversion {
            raw: RawResult {
                value,
                ty: self.element_type.clone(),
            },
            cancellation: self.token.clone(),
        };
        let converted = match (self.convert)(conversion).await {
            Ok(converted) => converted,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        Some((self.process_converted)(converted))
    }

    /// Elements yielded so far
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn element_type(&self) -> &Type {
        &self.element_type
    }
}

#[cfg(test)]
mod tests {
    use crate::pipeline::{CancellationToken, Conversion, DataSources, Execution, PipelineBuilder, RawResult};
    use crate::translate::{to_remote, RemoteResult};
    use crate::Result;
    use crate::types::{ResolutionContext, Type};
    use crate::value::{BoxFuture, DataSet, QueryableValue, Value};
    use crate::expression::Expression;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingData {
        loads: AtomicUsize,
    }

    impl DataSet for CountingData {
        fn element_type(&self) -> Type {
            Type::int32()
        }

        fn load(&self) -> anyhow::Result<Vec<Value>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok((0..10).map(Value::Int32).collect())
        }

        fn load_async(&self) -> BoxFuture<'_, anyhow::Result<Vec<Value>>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.load()
            })
        }
    }

    fn setup() -> (Arc<CountingData>, ResolutionContext, DataSources) {
        let data = Arc::new(CountingData {
            loads: AtomicUsize::new(0),
        });
        let sources = DataSources::new();
        sources.register("numbers", data.clone());
        (data, ResolutionContext::default(), sources)
    }

    fn query() -> crate::remote::RemoteExpression {
        to_remote(&Expression::queryable(QueryableValue::Resource {
            element_type: Type::int32(),
            name: Some("numbers".to_string()),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_async() {
        let (data, context, sources) = setup();
        let pipeline = PipelineBuilder::new(context.clone())
            .with_data_sources(&sources)
            .build_async();
        let result = pipeline
            .execute_async(query(), &CancellationToken::new())
            .await
            .unwrap();
        let value = result
            .into_value(&Type::array(Type::int32()), &context)
            .unwrap();
        assert_eq!(value, Value::List((0..10).map(Value::Int32).collect()));
        assert_eq!(data.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_stops_on_cancellation() {
        let (data, context, sources) = setup();
        let pipeline = PipelineBuilder::new(context.clone())
            .with_data_sources(&sources)
            .build_async();
        let token = CancellationToken::new();
        let mut stream = pipeline.execute_stream(query(), token.clone()).await.unwrap();
        let loads = data.loads.load(Ordering::SeqCst);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let item = stream.next().await.unwrap().unwrap();
            seen.push(item.into_value(&Type::int32(), &context).unwrap());
        }
        token.cancel();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(stream.next().await.is_none());
        assert_eq!(seen, vec![Value::Int32(0), Value::Int32(1), Value::Int32(2)]);
        assert_eq!(stream.consumed(), 3);
        assert_eq!(data.loads.load(Ordering::SeqCst), loads);
    }

    #[tokio::test]
    async fn test_cancelled_before_load() {
        let (data, context, sources) = setup();
        let pipeline = PipelineBuilder::new(context)
            .with_data_sources(&sources)
            .build_async();
        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline.execute_async(query(), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(data.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_convert_decorator() {
        let (_, context, sources) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let pipeline = PipelineBuilder::new(context.clone())
            .with_data_sources(&sources)
            .decorate_convert_async(move |inner| {
                let counted = counted.clone();
                Arc::new(move |mut conversion: Conversion| -> BoxFuture<'static, Result<RemoteResult>> {
                    let inner = inner.clone();
                    let counted = counted.clone();
                    Box::pin(async move {
                        tokio::task::yield_now().await;
                        conversion.cancellation.check()?;
                        counted.fetch_add(1, Ordering::SeqCst);
                        if let Value::List(items) = &mut conversion.raw.value {
                            items.truncate(3);
                        }
                        inner(conversion).await
                    })
                })
            })
            .build_async();

        let value = pipeline
            .execute_async(query(), &CancellationToken::new())
            .await
            .unwrap()
            .into_value(&Type::array(Type::int32()), &context)
            .unwrap();
        assert_eq!(value, Value::List((0..3).map(Value::Int32).collect()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Streamed elements go through the same stage, one call each
        let mut stream = pipeline
            .execute_stream(query(), CancellationToken::new())
            .await
            .unwrap();
        let mut count = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            count += 1;
        }
        assert_eq!(count, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_async_execute_substitute_and_decorator() {
        let (data, context, sources) = setup();
        let pipeline = PipelineBuilder::new(context.clone())
            .with_data_sources(&sources)
            .substitute_execute_async(|execution: Execution| -> BoxFuture<'static, Result<RawResult>> {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    execution.cancellation.check()?;
                    Ok(RawResult {
                        value: Value::List(vec![Value::Int32(7)]),
                        ty: execution.expression.ty(),
                    })
                })
            })
            .decorate_execute_async(|inner| {
                Arc::new(move |execution: Execution| -> BoxFuture<'static, Result<RawResult>> {
                    let inner = inner.clone();
                    Box::pin(async move {
                        let mut raw = inner(execution).await?;
                        if let Value::List(items) = &mut raw.value {
                            items.push(Value::Int32(8));
                        }
                        Ok(raw)
                    })
                })
            })
            .build_async();

        let value = pipeline
            .execute_async(query(), &CancellationToken::new())
            .await
            .unwrap()
            .into_value(&Type::array(Type::int32()), &context)
            .unwrap();
        assert_eq!(value, Value::List(vec![Value::Int32(7), Value::Int32(8)]));
        assert_eq!(data.loads.load(Ordering::SeqCst), 0);
    }
}
