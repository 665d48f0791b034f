//! Remote query server serving an in-memory demo catalog

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use log::{error, info};
use remote_query::pipeline::{in_memory_markers, DataSources, PipelineBuilder};
use remote_query::transport::{Server, DEFAULT_PORT};
use remote_query::types::{NamedType, ResolutionContext, Type, TypeDef};
use remote_query::value::{EnumValue, MemoryDataSet, Record, Value};
use std::sync::Arc;

/// Executes translated queries sent over TCP
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Maximum concurrent connections
    #[arg(short = 'c', long, default_value = "100")]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let context = ResolutionContext::default();
    let sources = DataSources::new();
    register_demo_catalog(&context, &sources)?;

    let pipeline = PipelineBuilder::new(context)
        .with_data_sources(&sources)
        .with_markers(in_memory_markers())
        .build_async();
    let server = Server::new(pipeline, args.max_connections);

    let addr = std::net::SocketAddr::from((
        args.host
            .parse::<std::net::IpAddr>()
            .context("Invalid host address")?,
        args.port,
    ));
    info!(
        "serving data sources 'products' and 'orders' (max {} connections)",
        args.max_connections
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(Some(addr)).await {
            error!("server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("shutting down");
    server_handle.abort();

    Ok(())
}

/// Registers the demo types and fills their data sources
fn register_demo_catalog(context: &ResolutionContext, sources: &DataSources) -> Result<()> {
    let category = context.registry().register(TypeDef::enumeration(
        "shop",
        "Category",
        vec![("Furniture", 0), ("Lighting", 1), ("Office", 2)],
    ));
    let product = context.registry().register(TypeDef::record(
        "shop",
        "Product",
        vec![
            ("Id", Type::int32()),
            ("Name", Type::string()),
            ("Price", Type::float64()),
            ("Category", Type::named(&category)),
        ],
    ));
    let order = context.registry().register(TypeDef::record(
        "shop",
        "Order",
        vec![
            ("Id", Type::int32()),
            ("ProductId", Type::int32()),
            ("Quantity", Type::int32()),
        ],
    ));

    let product_ty = Type::named(&product);
    let products = [
        (1, "Desk", 249.0, 0),
        (2, "Lamp", 39.5, 1),
        (3, "Chair", 129.0, 0),
        (4, "Stapler", 12.0, 2),
        (5, "Shelf", 89.0, 0),
    ]
    .into_iter()
    .map(|(id, name, price, category_value)| {
        let record = Record::from_pairs(
            &product_ty,
            vec![
                ("Id", Value::Int32(id)),
                ("Name", Value::from(name)),
                ("Price", Value::Float64(price)),
                (
                    "Category",
                    Value::Enum(EnumValue {
                        ty: NamedType::new(category.clone(), vec![]),
                        value: category_value,
                    }),
                ),
            ],
        )?;
        Ok(Value::Record(record))
    })
    .collect::<Result<Vec<_>>>()?;

    let order_ty = Type::named(&order);
    let orders = [(100, 1, 2), (101, 3, 4), (102, 1, 1), (103, 4, 10)]
        .into_iter()
        .map(|(id, product_id, quantity)| {
            let record = Record::from_pairs(
                &order_ty,
                vec![
                    ("Id", Value::Int32(id)),
                    ("ProductId", Value::Int32(product_id)),
                    ("Quantity", Value::Int32(quantity)),
                ],
            )?;
            Ok(Value::Record(record))
        })
        .collect::<Result<Vec<_>>>()?;

    sources.register("products", Arc::new(MemoryDataSet::new(product_ty, products)));
    sources.register("orders", Arc::new(MemoryDataSet::new(order_ty, orders)));
    Ok(())
}
