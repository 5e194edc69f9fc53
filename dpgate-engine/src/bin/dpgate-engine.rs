use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use dpgate_engine::{
    router, DatasetCache, EngineService, HttpCsvProvider, InMemoryDatasetCache, NoDatasetCache,
};
use dpgate_query::{AggregationLibrary, ExactAggregation, NoisyAggregation};

#[derive(Parser, Debug)]
#[command(name = "dpgate-engine", about = "Serve differentially private query evaluation over HTTP")]
struct Args {
    /// Name reported in validation messages and `/functions`.
    #[arg(long, env = "DPGATE_ENGINE_NAME", default_value = "dpgate")]
    name: String,

    #[arg(long, env = "DPGATE_ENGINE_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Seeds the noise generator so repeated runs give identical answers.
    #[arg(long, env = "DPGATE_ENGINE_SEED")]
    seed: Option<String>,

    /// Skip noise entirely. For testing only.
    #[arg(long, conflicts_with = "seed")]
    exact: bool,

    /// Refetch the dataset on every request.
    #[arg(long)]
    no_cache: bool,

    #[arg(long, env = "DPGATE_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let library: Arc<dyn AggregationLibrary> = match (&args.seed, args.exact) {
        (_, true) => {
            tracing::warn!("running without noise; results are not differentially private");
            Arc::new(ExactAggregation)
        }
        (Some(seed), false) => Arc::new(NoisyAggregation::new(*blake3::hash(seed.as_bytes()).as_bytes())),
        (None, false) => Arc::new(NoisyAggregation::from_entropy()),
    };
    let cache: Arc<dyn DatasetCache> = if args.no_cache {
        Arc::new(NoDatasetCache)
    } else {
        Arc::new(InMemoryDatasetCache::new())
    };

    let engine = Arc::new(EngineService::new(
        args.name.clone(),
        Arc::new(HttpCsvProvider::new()),
        cache,
        library,
    ));

    tracing::info!(bind = %args.bind, engine = %args.name, "engine starting");
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
