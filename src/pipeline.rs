//! Execution pipeline for translated queries.
//!
//! A remote expression passes through a fixed sequence of stages:
//! `prepare_remote`, `transform`, `prepare_native`, (`prepare_async`),
//! `execute`, `process_raw`, `convert`, `process_converted`. Every stage has
//! a default that callers may wrap with decorators or, explicitly, replace.
//!
//! The async pipeline suspends in `execute` and `convert`, which it runs as
//! [`AsyncStage`]s. Their defaults load the referenced data sources
//! asynchronously and then delegate to the synchronous stage.

pub mod async_pipeline;
pub mod cancel;

pub use async_pipeline::{AsyncExecutionPipeline, QueryStream};
pub use cancel::CancellationToken;

use crate::expression::eval::data_key;
use crate::expression::{
    include_marker, type_check_expression, Expression, ExpressionEvaluator, MarkerMap, MethodDef,
};
use crate::query::RemoteCall;
use crate::remote::RemoteExpression;
use crate::translate::{DataProvider, InboundTranslator, RemoteResult};
use crate::types::{ResolutionContext, Type, TypeDef};
use crate::value::{BoxFuture, DataSet, QueryableValue, Value};
use crate::Result;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;

/// One pipeline step
pub type Stage<I, O> = Arc<dyn Fn(I) -> Result<O> + Send + Sync>;

/// Pipeline step that may suspend
pub type AsyncStage<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// Wraps a stage; decorators receive the stage they decorate
pub type Decorator<I, O> = Arc<dyn Fn(Stage<I, O>) -> Stage<I, O> + Send + Sync>;

pub type AsyncDecorator<I, O> = Arc<dyn Fn(AsyncStage<I, O>) -> AsyncStage<I, O> + Send + Sync>;

/// Substitute and decorators registered for one stage of type `S`
pub struct StageConfig<S> {
    substitute: Option<S>,
    decorators: Vec<Arc<dyn Fn(S) -> S + Send + Sync>>,
}

impl<S> Default for StageConfig<S> {
    fn default() -> Self {
        Self {
            substitute: None,
            decorators: Vec::new(),
        }
    }
}

impl<S: Clone> Clone for StageConfig<S> {
    fn clone(&self) -> Self {
        Self {
            substitute: self.substitute.clone(),
            decorators: self.decorators.clone(),
        }
    }
}

impl<S: Clone> StageConfig<S> {
    /// Decorators in registration order, the first one innermost
    fn compose(&self, default: S) -> S {
        let base = self.substitute.clone().unwrap_or(default);
        self.decorators
            .iter()
            .fold(base, |inner, decorator| decorator(inner))
    }
}

/// Output of the execute stage
#[derive(Debug, Clone)]
pub struct RawResult {
    pub value: Value,
    /// Static type of the executed expression
    pub ty: Type,
}

/// Input of the execute stage
#[derive(Clone)]
pub struct Execution {
    pub expression: Expression,
    pub cancellation: CancellationToken,
    preloaded: Vec<(Arc<dyn DataSet>, Vec<Value>)>,
}

impl Execution {
    pub fn new(expression: Expression, cancellation: CancellationToken) -> Self {
        Self {
            expression,
            cancellation,
            preloaded: Vec::new(),
        }
    }

    /// Rows already fetched for `data`; the evaluator will not load it again
    pub fn preload(&mut self, data: Arc<dyn DataSet>, rows: Vec<Value>) {
        self.preloaded.push((data, rows));
    }

    pub fn is_preloaded(&self, data: &Arc<dyn DataSet>) -> bool {
        self.preloaded
            .iter()
            .any(|(loaded, _)| data_key(loaded) == data_key(data))
    }
}

/// Input of the async convert stage
#[derive(Debug, Clone)]
pub struct Conversion {
    pub raw: RawResult,
    pub cancellation: CancellationToken,
}

/// Named data sources bound to resource placeholders during transform
#[derive(Clone, Default)]
pub struct DataSources {
    by_name: Arc<DashMap<String, Arc<dyn DataSet>>>,
    by_type: Arc<DashMap<Type, Arc<dyn DataSet>>>,
}

impl DataSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve resources named `name`, and unnamed resources of its element type
    pub fn register(&self, name: &str, data: Arc<dyn DataSet>) {
        self.by_type.insert(data.element_type(), data.clone());
        self.by_name.insert(name.to_string(), data);
    }

    pub fn get(&self, element_type: &Type, name: Option<&str>) -> Option<Arc<dyn DataSet>> {
        match name {
            Some(name) => self.by_name.get(name).map(|d| d.value().clone()),
            None => self.by_type.get(element_type).map(|d| d.value().clone()),
        }
    }

    pub fn provider(&self) -> DataProvider {
        let sources = self.clone();
        Arc::new(move |element_type: &Type, name: Option<&str>| {
            let data = sources.get(element_type, name).ok_or_else(|| {
                anyhow::anyhow!(
                    "no data source {} for {}",
                    name.unwrap_or("<unnamed>"),
                    element_type
                )
            })?;
            anyhow::ensure!(
                element_type.is_assignable_from(&data.element_type()),
                "data source {} yields {}, not {}",
                name.unwrap_or("<unnamed>"),
                data.element_type(),
                element_type
            );
            Ok(Value::Queryable(QueryableValue::Data(data)))
        })
    }
}

/// Marker replacements for in-memory data: eager loading is a no-op
pub fn in_memory_markers() -> MarkerMap {
    let t = Type::GenericParam(0);
    let hints = TypeDef::builder("MemoryHints")
        .namespace("remote_query")
        .static_class()
        .build();
    let include = MethodDef::native(
        Type::named(&hints),
        "Include",
        vec![Type::queryable(t.clone()), Type::string()],
        Type::queryable(t),
        |args: &[Value]| {
            args.first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Include expects a source"))
        },
    )
    .with_generic_arity(1);
    MarkerMap::new().map(&include_marker(), include)
}

/// Composed stages shared by the sync and async pipelines
pub(crate) struct Stages {
    pub prepare_remote: Stage<RemoteExpression, RemoteExpression>,
    pub transform: Stage<RemoteExpression, Expression>,
    pub prepare_native: Stage<Expression, Expression>,
    pub prepare_async: Stage<Expression, Expression>,
    pub execute: Stage<Execution, RawResult>,
    pub execute_async: AsyncStage<Execution, RawResult>,
    pub process_raw: Stage<RawResult, RawResult>,
    pub convert: Stage<RawResult, RemoteResult>,
    pub convert_async: AsyncStage<Conversion, RemoteResult>,
    pub process_converted: Stage<RemoteResult, RemoteResult>,
}

impl Stages {
    /// Synchronous stages up to, not including, execute
    pub fn prepare(&self, query: RemoteExpression, token: &CancellationToken) -> Result<Expression> {
        token.check()?;
        let query = (self.prepare_remote)(query)?;
        let native = (self.transform)(query)?;
        debug!("transformed: {}", native);
        (self.prepare_native)(native)
    }

    /// Stages after execute
    pub fn finish(&self, raw: RawResult) -> Result<RemoteResult> {
        let raw = (self.process_raw)(raw)?;
        let converted = (self.convert)(raw)?;
        (self.process_converted)(converted)
    }
}

#[derive(Clone, Default)]
struct StageConfigs {
    prepare_remote: StageConfig<Stage<RemoteExpression, RemoteExpression>>,
    transform: StageConfig<Stage<RemoteExpression, Expression>>,
    prepare_native: StageConfig<Stage<Expression, Expression>>,
    prepare_async: StageConfig<Stage<Expression, Expression>>,
    execute: StageConfig<Stage<Execution, RawResult>>,
    execute_async: StageConfig<AsyncStage<Execution, RawResult>>,
    process_raw: StageConfig<Stage<RawResult, RawResult>>,
    convert: StageConfig<Stage<RawResult, RemoteResult>>,
    convert_async: StageConfig<AsyncStage<Conversion, RemoteResult>>,
    process_converted: StageConfig<Stage<RemoteResult, RemoteResult>>,
}

/// Configures and builds execution pipelines.
///
/// ```ignore
/// let pipeline = PipelineBuilder::new(context)
///     .with_data_provider(sources.provider())
///     .decorate_execute(|inner| Arc::new(move |exec| inner(exec)))
///     .build();
/// ```
#[derive(Clone)]
pub struct PipelineBuilder {
    context: ResolutionContext,
    data_provider: Option<DataProvider>,
    markers: Arc<MarkerMap>,
    stages: StageConfigs,
}

macro_rules! stage_methods {
    ($($field:ident: $decorate:ident, $substitute:ident, $i:ty => $o:ty;)*) => {
        $(
            pub fn $decorate(
                mut self,
                decorator: impl Fn(Stage<$i, $o>) -> Stage<$i, $o> + Send + Sync + 'static,
            ) -> Self {
                self.stages.$field.decorators.push(Arc::new(decorator));
                self
            }

            pub fn $substitute(
                mut self,
                stage: impl Fn($i) -> Result<$o> + Send + Sync + 'static,
            ) -> Self {
                self.stages.$field.substitute = Some(Arc::new(stage));
                self
            }
        )*
    };
}

macro_rules! async_stage_methods {
    ($($field:ident: $decorate:ident, $substitute:ident, $i:ty => $o:ty;)*) => {
        $(
            pub fn $decorate(
                mut self,
                decorator: impl Fn(AsyncStage<$i, $o>) -> AsyncStage<$i, $o> + Send + Sync + 'static,
            ) -> Self {
                self.stages.$field.decorators.push(Arc::new(decorator));
                self
            }

            pub fn $substitute(
                mut self,
                stage: impl Fn($i) -> BoxFuture<'static, Result<$o>> + Send + Sync + 'static,
            ) -> Self {
                self.stages.$field.substitute = Some(Arc::new(stage));
                self
            }
        )*
    };
}

impl PipelineBuilder {
    pub fn new(context: ResolutionContext) -> Self {
        Self {
            context,
            data_provider: None,
            markers: Arc::new(MarkerMap::new()),
            stages: StageConfigs::default(),
        }
    }

    pub fn with_data_provider(mut self, provider: DataProvider) -> Self {
        self.data_provider = Some(provider);
        self
    }

    pub fn with_data_sources(self, sources: &DataSources) -> Self {
        self.with_data_provider(sources.provider())
    }

    /// Replacements for marker methods such as the include hint
    pub fn with_markers(mut self, markers: MarkerMap) -> Self {
        self.markers = Arc::new(markers);
        self
    }

    stage_methods! {
        prepare_remote: decorate_prepare_remote, substitute_prepare_remote, RemoteExpression => RemoteExpression;
        transform: decorate_transform, substitute_transform, RemoteExpression => Expression;
        prepare_native: decorate_prepare_native, substitute_prepare_native, Expression => Expression;
        prepare_async: decorate_prepare_async, substitute_prepare_async, Expression => Expression;
        execute: decorate_execute, substitute_execute, Execution => RawResult;
        process_raw: decorate_process_raw, substitute_process_raw, RawResult => RawResult;
        convert: decorate_convert, substitute_convert, RawResult => RemoteResult;
        process_converted: decorate_process_converted, substitute_process_converted, RemoteResult => RemoteResult;
    }

    async_stage_methods! {
        execute_async: decorate_execute_async, substitute_execute_async, Execution => RawResult;
        convert_async: decorate_convert_async, substitute_convert_async, Conversion => RemoteResult;
    }

    fn stages(&self) -> Stages {
        let context = self.context.clone();
        let provider = self.data_provider.clone();
        let markers = self.markers.clone();
        let transform: Stage<RemoteExpression, Expression> = Arc::new(move |query: RemoteExpression| {
            InboundTranslator::new(&context)
                .with_data_provider(provider.clone())
                .with_markers(&markers)
                .translate(&query)
        });

        let execute: Stage<Execution, RawResult> = self.stages.execute.compose(Arc::new(execute));
        let convert: Stage<RawResult, RemoteResult> = self
            .stages
            .convert
            .compose(Arc::new(|raw: RawResult| RemoteResult::from_value(&raw.value, &raw.ty)));
        let execute_async = self
            .stages
            .execute_async
            .compose(async_pipeline::preloading(execute.clone()));
        let convert_async = self
            .stages
            .convert_async
            .compose(async_pipeline::checked(convert.clone()));

        Stages {
            prepare_remote: self.stages.prepare_remote.compose(Arc::new(pass::<RemoteExpression>)),
            transform: self.stages.transform.compose(transform),
            prepare_native: self.stages.prepare_native.compose(Arc::new(|expr: Expression| {
                type_check_expression(&expr)?;
                Ok(expr)
            })),
            prepare_async: self.stages.prepare_async.compose(Arc::new(pass::<Expression>)),
            execute,
            execute_async,
            process_raw: self.stages.process_raw.compose(Arc::new(pass::<RawResult>)),
            convert,
            convert_async,
            process_converted: self.stages.process_converted.compose(Arc::new(pass::<RemoteResult>)),
        }
    }

    pub fn build(&self) -> ExecutionPipeline {
        ExecutionPipeline {
            stages: Arc::new(self.stages()),
        }
    }

    pub fn build_async(&self) -> AsyncExecutionPipeline {
        AsyncExecutionPipeline::new(Arc::new(self.stages()))
    }
}

fn pass<T>(value: T) -> Result<T> {
    Ok(value)
}

/// Default execute stage: evaluate, then materialize a sequence result
fn execute(execution: Execution) -> Result<RawResult> {
    let mut evaluator = ExpressionEvaluator::new().with_cancellation(execution.cancellation);
    for (data, rows) in execution.preloaded {
        evaluator.preload(&data, rows);
    }
    let ty = execution.expression.ty();
    let value = evaluator.evaluate(&execution.expression)?;
    let value = evaluator.materialize(value)?;
    debug!("executed with {} data-source loads", evaluator.loads());
    Ok(RawResult { value, ty })
}

/// Synchronous pipeline; usable directly as a [`RemoteCall`]
#[derive(Clone)]
pub struct ExecutionPipeline {
    stages: Arc<Stages>,
}

impl ExecutionPipeline {
    pub fn builder(context: ResolutionContext) -> PipelineBuilder {
        PipelineBuilder::new(context)
    }

    pub fn execute(&self, query: RemoteExpression) -> Result<RemoteResult> {
        self.execute_with(query, &CancellationToken::new())
    }

    pub fn execute_with(&self, query: RemoteExpression, token: &CancellationToken) -> Result<RemoteResult> {
        let result = self.run(query, token);
        if let Err(e) = &result {
            warn!("query execution faulted: {}", e);
        }
        result
    }

    fn run(&self, query: RemoteExpression, token: &CancellationToken) -> Result<RemoteResult> {
        let native = self.stages.prepare(query, token)?;
        let raw = (self.stages.execute)(Execution::new(native, token.clone()))?;
        self.stages.finish(raw)
    }
}

impl RemoteCall for ExecutionPipeline {
    fn call(&self, query: RemoteExpression) -> anyhow::Result<RemoteResult> {
        Ok(self.execute(query)?)
    }
}
