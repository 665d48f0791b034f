use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remote_query::expression::{Expression, QueryOperator};
use remote_query::pipeline::{
    in_memory_markers, CancellationToken, DataSources, ExecutionPipeline, PipelineBuilder,
};
use remote_query::query::{QueryProvider, QueryState};
use remote_query::remote::RemoteExpression;
use remote_query::translate::{to_native, to_remote};
use remote_query::transport::{Server, TcpRemoteCall};
use remote_query::types::{ResolutionContext, Type, TypeDef};
use remote_query::value::{BoxFuture, DataSet, MemoryDataSet, Record, Value};
use remote_query::{QueryError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

const PRODUCTS: [(i32, &str, i32); 5] = [
    (7, "Desk", 3),
    (10, "Lamp", 12),
    (12, "Chair", 0),
    (10, "Lamp shade", 4),
    (15, "Shelf", 9),
];

const ORDERS: [(i32, i32); 3] = [(100, 7), (101, 15), (102, 7)];

struct Catalog {
    context: ResolutionContext,
    sources: DataSources,
    product: Type,
    order: Type,
}

fn catalog() -> Catalog {
    let context = ResolutionContext::default();
    let product = Type::named(&context.registry().register(TypeDef::record(
        "shop",
        "Product",
        vec![
            ("Id", Type::int32()),
            ("Name", Type::string()),
            ("Stock", Type::int32()),
        ],
    )));
    let order = Type::named(&context.registry().register(TypeDef::record(
        "shop",
        "Order",
        vec![("Id", Type::int32()), ("ProductId", Type::int32())],
    )));

    let products = PRODUCTS
        .iter()
        .map(|(id, name, stock)| {
            let fields = vec![
                ("Id", Value::Int32(*id)),
                ("Name", Value::from(*name)),
                ("Stock", Value::Int32(*stock)),
            ];
            Value::Record(Record::from_pairs(&product, fields).unwrap())
        })
        .collect();
    let orders = ORDERS
        .iter()
        .map(|(id, product_id)| {
            let fields = vec![("Id", Value::Int32(*id)), ("ProductId", Value::Int32(*product_id))];
            Value::Record(Record::from_pairs(&order, fields).unwrap())
        })
        .collect();

    let sources = DataSources::new();
    sources.register("products", Arc::new(MemoryDataSet::new(product.clone(), products)));
    sources.register("orders", Arc::new(MemoryDataSet::new(order.clone(), orders)));
    Catalog {
        context,
        sources,
        product,
        order,
    }
}

fn pipeline(catalog: &Catalog) -> ExecutionPipeline {
    PipelineBuilder::new(catalog.context.clone())
        .with_data_sources(&catalog.sources)
        .with_markers(in_memory_markers())
        .build()
}

fn provider(catalog: &Catalog) -> QueryProvider {
    QueryProvider::new(pipeline(catalog)).with_context(catalog.context.clone())
}

fn field(row: &Value, name: &str) -> Value {
    row.as_record().unwrap().get(name).unwrap().clone()
}

#[test]
fn test_filter_by_runtime_variable() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let wanted = 10;

    let products = provider.query(catalog.product.clone(), Some("products"));
    assert_eq!(products.state(), QueryState::Unbound);
    let query = products
        .filter(|p| Ok(p.member("Id")?.equal(Expression::variable("wanted", wanted))?))
        .unwrap();
    assert_eq!(query.state(), QueryState::Composed);
    assert_eq!(products.state(), QueryState::Unbound);

    let rows = query.to_list().unwrap();
    assert_eq!(query.state(), QueryState::Materialized);
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(field(row, "Id"), Value::Int32(10));
    }
    let names: Vec<Value> = rows.iter().map(|r| field(r, "Name")).collect();
    assert_eq!(names, vec![Value::from("Lamp"), Value::from("Lamp shade")]);
    assert_eq!(provider.round_trips(), 1);
}

#[test]
fn test_anonymous_projection() {
    let catalog = catalog();
    let provider = provider(&catalog);

    let rows = provider
        .query(catalog.product.clone(), Some("products"))
        .filter(|p| Ok(p.member("Stock")?.greater_than(Expression::literal(0))?))
        .unwrap()
        .map(|p| {
            Ok(Expression::anonymous(vec![
                ("Id", p.clone().member("Id")?),
                ("Name", p.member("Name")?),
            ]))
        })
        .unwrap()
        .to_list()
        .unwrap();

    assert_eq!(rows.len(), 4);
    let first = rows[0].as_record().unwrap();
    assert!(first.ty().def().is_anonymous());
    assert_eq!(first.get("Id"), Some(&Value::Int32(7)));
    assert_eq!(first.get("Name"), Some(&Value::from("Desk")));
    assert_eq!(first.get("Stock"), None);
}

#[test]
fn test_correlated_subquery_is_one_round_trip() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let orders = provider.query(catalog.order.clone(), Some("orders"));

    let names: Vec<String> = provider
        .query(catalog.product.clone(), Some("products"))
        .filter(|p| {
            let ordered = |o: Expression| -> Result<Expression> {
                Ok(o.member("ProductId")?.equal(p.clone().member("Id")?)?)
            };
            orders.nested(QueryOperator::AnyWhere, Some(&ordered))
        })
        .unwrap()
        .order_by(|p| Ok(p.member("Name")?))
        .unwrap()
        .map(|p| Ok(p.member("Name")?))
        .unwrap()
        .to_vec()
        .unwrap();

    assert_eq!(names, vec!["Desk".to_string(), "Shelf".to_string()]);
    assert_eq!(provider.round_trips(), 1);
}

#[test]
fn test_terminal_operators() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let products = provider.query(catalog.product.clone(), Some("products"));

    assert_eq!(products.count().unwrap(), 5);
    assert_eq!(products.state(), QueryState::Materialized);
    assert!(products
        .any_where(|p| Ok(p.member("Stock")?.equal(Expression::literal(0))?))
        .unwrap());
    assert!(!products
        .all(|p| Ok(p.member("Stock")?.greater_than(Expression::literal(0))?))
        .unwrap());
    assert_eq!(
        products.sum(|p| Ok(p.member("Stock")?)).unwrap(),
        Value::Int32(28)
    );
    assert_eq!(products.max(|p| Ok(p.member("Id")?)).unwrap(), Value::Int32(15));

    let ids = products.map(|p| Ok(p.member("Id")?)).unwrap();
    assert!(ids.contains(Value::Int32(12)).unwrap());
    assert!(!ids.contains(Value::Int32(11)).unwrap());
    assert_eq!(ids.distinct().unwrap().count().unwrap(), 4);
    assert_eq!(
        ids.order_by_descending(|id| Ok(id))
            .unwrap()
            .skip(1)
            .unwrap()
            .take(2)
            .unwrap()
            .to_vec::<i32>()
            .unwrap(),
        vec![12, 10]
    );

    let chair = products
        .single_where(|p| Ok(p.member("Name")?.equal(Expression::literal("Chair"))?))
        .unwrap();
    assert_eq!(field(&chair, "Id"), Value::Int32(12));

    let none = products
        .filter(|p| Ok(p.member("Id")?.greater_than(Expression::literal(100))?))
        .unwrap();
    assert_eq!(none.first_or_default().unwrap(), Value::Null);
    assert!(none.first().is_err());
    assert_eq!(none.state(), QueryState::Faulted);
}

#[test]
fn test_then_by_requires_ordering() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let products = provider.query(catalog.product.clone(), Some("products"));

    let err = products.then_by(|p| Ok(p.member("Name")?)).unwrap_err();
    assert!(matches!(err, QueryError::NotSupported(_)));

    let names: Vec<String> = products
        .order_by(|p| Ok(p.member("Id")?))
        .unwrap()
        .then_by_descending(|p| Ok(p.member("Name")?))
        .unwrap()
        .map(|p| Ok(p.member("Name")?))
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(names, vec!["Desk", "Lamp shade", "Lamp", "Chair", "Shelf"]);
}

#[test]
fn test_include_is_rewritten_for_memory_data() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let count = provider
        .query(catalog.product.clone(), Some("products"))
        .include("Orders")
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(count, 5);

    // Without a replacement the marker cannot run
    let bare = PipelineBuilder::new(catalog.context.clone())
        .with_data_sources(&catalog.sources)
        .build();
    let err = QueryProvider::new(bare)
        .with_context(catalog.context.clone())
        .query(catalog.product.clone(), Some("products"))
        .include("Orders")
        .unwrap()
        .count()
        .unwrap_err();
    assert!(matches!(err, QueryError::Remote(_)));
}

#[test]
fn test_result_shape_is_checked_before_the_call() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let query = provider.query(catalog.product.clone(), Some("products"));

    let err = query.execute(&Type::string()).unwrap_err();
    assert!(matches!(err, QueryError::ResultShape { .. }));
    assert_eq!(provider.round_trips(), 0);

    let rows = query.execute(&Type::array(catalog.product.clone())).unwrap();
    assert!(matches!(rows, Value::List(ref items) if items.len() == 5));
}

#[test]
fn test_cancelled_before_translation() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let token = CancellationToken::new();
    token.cancel();

    let err = provider
        .query(catalog.product.clone(), Some("products"))
        .with_cancellation(token)
        .count()
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(provider.round_trips(), 0);
}

#[test]
fn test_remote_expression_survives_bincode() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let query = provider
        .query(catalog.product.clone(), Some("products"))
        .filter(|p| Ok(p.member("Stock")?.less_than(Expression::variable("limit", 5))?))
        .unwrap()
        .map(|p| Ok(Expression::anonymous(vec![("Name", p.member("Name")?)])))
        .unwrap();
    let remote = provider
        .prepare(query.expression(), &Type::sequence(query.element_type().clone()))
        .unwrap();

    let bytes = bincode::serialize(&remote).unwrap();
    let decoded: RemoteExpression = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, remote);

    let result = pipeline(&catalog).execute(decoded).unwrap();
    let bytes = bincode::serialize(&result).unwrap();
    let rows = bincode::deserialize::<remote_query::translate::RemoteResult>(&bytes)
        .unwrap()
        .into_value(&Type::sequence(query.element_type().clone()), &catalog.context)
        .unwrap();
    assert!(matches!(rows, Value::List(ref items) if items.len() == 3));
}

/// Random predicate over `Id` and `Stock`, built both as an expression and
/// as a Rust closure
#[derive(Debug, Clone)]
enum Predicate {
    Less(&'static str, i32, bool),
    Equal(&'static str, i32, bool),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    IsTrue(Box<Predicate>),
}

impl Predicate {
    fn random(rng: &mut StdRng, depth: usize) -> Self {
        let field = if rng.gen_bool(0.5) { "Id" } else { "Stock" };
        let leaf = depth == 0 || rng.gen_bool(0.3);
        match (leaf, rng.gen_range(0..4)) {
            (true, 0 | 1) => Predicate::Less(field, rng.gen_range(0..16), rng.gen_bool(0.5)),
            (true, _) => Predicate::Equal(field, rng.gen_range(0..16), rng.gen_bool(0.5)),
            (false, 0) => Predicate::Not(Box::new(Self::random(rng, depth - 1))),
            (false, 1) => Predicate::And(
                Box::new(Self::random(rng, depth - 1)),
                Box::new(Self::random(rng, depth - 1)),
            ),
            (false, 2) => Predicate::Or(
                Box::new(Self::random(rng, depth - 1)),
                Box::new(Self::random(rng, depth - 1)),
            ),
            (false, _) => Predicate::IsTrue(Box::new(Self::random(rng, depth - 1))),
        }
    }

    fn operand(value: i32, variable: bool) -> Expression {
        if variable {
            Expression::variable("bound", value)
        } else {
            Expression::literal(value)
        }
    }

    fn build(&self, p: &Expression) -> Result<Expression> {
        Ok(match self {
            Predicate::Less(field, v, var) => {
                p.clone().member(*field)?.less_than(Self::operand(*v, *var))?
            }
            Predicate::Equal(field, v, var) => {
                p.clone().member(*field)?.equal(Self::operand(*v, *var))?
            }
            Predicate::Not(inner) => inner.build(p)?.not()?,
            Predicate::And(l, r) => l.build(p)?.and_also(r.build(p)?)?,
            Predicate::Or(l, r) => l.build(p)?.or_else(r.build(p)?)?,
            Predicate::IsTrue(inner) => inner.build(p)?.equal(Expression::literal(true))?,
        })
    }

    fn test(&self, id: i32, stock: i32) -> bool {
        let read = |field: &str| if field == "Id" { id } else { stock };
        match self {
            Predicate::Less(field, v, _) => read(*field) < *v,
            Predicate::Equal(field, v, _) => read(*field) == *v,
            Predicate::Not(inner) => !inner.test(id, stock),
            Predicate::And(l, r) => l.test(id, stock) && r.test(id, stock),
            Predicate::Or(l, r) => l.test(id, stock) || r.test(id, stock),
            Predicate::IsTrue(inner) => inner.test(id, stock),
        }
    }
}

#[test]
fn test_random_predicates_round_trip() {
    let catalog = catalog();
    let provider = provider(&catalog);
    let products = provider.query(catalog.product.clone(), Some("products"));

    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let predicate = Predicate::random(&mut rng, 3);

        let query = products
            .filter(|p| predicate.build(&p))
            .unwrap()
            .map(|p| Ok(p.member("Name")?))
            .unwrap();
        let expected: Vec<String> = PRODUCTS
            .iter()
            .filter(|(id, _, stock)| predicate.test(*id, *stock))
            .map(|(_, name, _)| name.to_string())
            .collect();
        assert_eq!(query.to_vec::<String>().unwrap(), expected, "{:?}", predicate);

        // Inbound then outbound reaches a fixed point
        let remote = provider
            .prepare(query.expression(), &Type::sequence(Type::string()))
            .unwrap();
        let first = to_remote(&to_native(&remote, &catalog.context).unwrap()).unwrap();
        let second = to_remote(&to_native(&first, &catalog.context).unwrap()).unwrap();
        assert_eq!(first, second, "{:?}", predicate);
    }
}

/// Rows that count every load
struct CountingRows {
    rows: Vec<Value>,
    element_type: Type,
    loads: AtomicUsize,
}

impl DataSet for CountingRows {
    fn element_type(&self) -> Type {
        self.element_type.clone()
    }

    fn load(&self) -> anyhow::Result<Vec<Value>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.clone())
    }

    fn load_async(&self) -> BoxFuture<'_, anyhow::Result<Vec<Value>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.load()
        })
    }
}

fn counting(catalog: &Catalog, name: &str, element_type: &Type) -> Arc<CountingRows> {
    let rows = catalog
        .sources
        .get(element_type, Some(name))
        .unwrap()
        .load()
        .unwrap();
    Arc::new(CountingRows {
        rows,
        element_type: element_type.clone(),
        loads: AtomicUsize::new(0),
    })
}

#[test]
fn test_correlated_subquery_loads_each_source_once() {
    let catalog = catalog();
    let products = counting(&catalog, "products", &catalog.product);
    let orders = counting(&catalog, "orders", &catalog.order);
    let sources = DataSources::new();
    sources.register("products", products.clone());
    sources.register("orders", orders.clone());
    let pipeline = PipelineBuilder::new(catalog.context.clone())
        .with_data_sources(&sources)
        .build();
    let provider = QueryProvider::new(pipeline).with_context(catalog.context.clone());
    let order_query = provider.query(catalog.order.clone(), Some("orders"));

    let ordered = provider
        .query(catalog.product.clone(), Some("products"))
        .filter(|p| {
            let matches = |o: Expression| -> Result<Expression> {
                Ok(o.member("ProductId")?.equal(p.clone().member("Id")?)?)
            };
            Ok(order_query
                .nested(QueryOperator::CountWhere, Some(&matches))?
                .greater_than(Expression::literal(0))?)
        })
        .unwrap()
        .count()
        .unwrap();

    assert_eq!(ordered, 2);
    assert_eq!(products.loads.load(Ordering::SeqCst), 1);
    assert_eq!(orders.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_cancellation_stops_consumption() {
    let catalog = catalog();
    let counting = counting(&catalog, "products", &catalog.product);
    let sources = DataSources::new();
    sources.register("products", counting.clone());
    let pipeline = PipelineBuilder::new(catalog.context.clone())
        .with_data_sources(&sources)
        .build_async();

    let provider = provider(&catalog);
    let query = provider.query(catalog.product.clone(), Some("products"));
    let remote = provider
        .prepare(query.expression(), &Type::sequence(catalog.product.clone()))
        .unwrap();

    let token = CancellationToken::new();
    let mut stream = pipeline.execute_stream(remote, token.clone()).await.unwrap();
    let loads = counting.loads.load(Ordering::SeqCst);
    assert_eq!(loads, 1);

    let consumed = 2;
    for _ in 0..consumed {
        let element = stream.next().await.unwrap().unwrap();
        let row = element
            .into_value(&catalog.product, &catalog.context)
            .unwrap();
        assert!(row.as_record().is_some());
    }
    token.cancel();

    assert!(stream.next().await.unwrap().unwrap_err().is_cancelled());
    assert!(stream.next().await.is_none());
    assert_eq!(stream.consumed(), consumed);
    assert_eq!(counting.loads.load(Ordering::SeqCst), loads);
}

#[tokio::test]
async fn test_queries_over_tcp() {
    let catalog = catalog();
    let pipeline = PipelineBuilder::new(catalog.context.clone())
        .with_data_sources(&catalog.sources)
        .with_markers(in_memory_markers())
        .build_async();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(pipeline, 4);
    let server_task = tokio::spawn(async move { server.serve(listener).await });

    let provider = QueryProvider::new_async(TcpRemoteCall::new(addr))
        .with_context(catalog.context.clone());
    let products = provider.query(catalog.product.clone(), Some("products"));

    let lamps = products
        .filter(|p| Ok(p.member("Id")?.equal(Expression::variable("id", 10))?))
        .unwrap()
        .to_list_async()
        .await
        .unwrap();
    assert_eq!(lamps.len(), 2);
    assert_eq!(products.count_async().await.unwrap(), 5);
    let first = products.first_async().await.unwrap();
    assert_eq!(field(&first, "Name"), Value::from("Desk"));

    // Server-side failures come back as remote errors
    let missing = provider.query(catalog.product.clone(), Some("missing"));
    let err = missing.count_async().await.unwrap_err();
    assert!(matches!(err, QueryError::Remote(_)));
    assert_eq!(provider.round_trips(), 4);

    // Synchronous terminals need a blocking transport
    assert!(matches!(
        products.count().unwrap_err(),
        QueryError::NotSupported(_)
    ));

    server_task.abort();
}
