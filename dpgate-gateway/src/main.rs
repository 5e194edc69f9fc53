use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::WrapErr, Result};
use dpgate_gateway::{
    load_config, Config, ConfigError, ConfigFormat, DatasetInfo, GatewayError, QueryAccuracy,
    QueryEvaluate, QueryGateway,
};
use dpgate_ledger::TracingLedgerSink;
use dpgate_query::DatasetId;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Parser)]
#[command(
    name = "dpgate-gateway",
    version,
    about = "Admit differentially private queries against a budget ledger and dispatch them to engines"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/dpgate-gateway.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the engine call timeout defined in the config file.
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long, env = "DPGATE_JSON_LOGS")]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    user: String,
    /// JSON request body; `-` reads stdin.
    #[arg(long)]
    request: PathBuf,
    /// Engine to use; the configured default otherwise.
    #[arg(long)]
    engine: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a query and consume its budget.
    Evaluate(QueryArgs),
    /// Validate a query on one engine, or on all of them without `--engine`.
    Validate(QueryArgs),
    /// Ask an engine for the accuracy of a query.
    Accuracy(QueryArgs),
    /// List configured engines.
    Engines,
    /// Show the functions supported by one or every engine.
    Functions {
        #[arg(long)]
        engine: Option<String>,
    },
    /// Print engine documentation.
    Docs {
        #[arg(long)]
        engine: Option<String>,
    },
    /// Show a user's allocations.
    Budget {
        #[arg(long)]
        user: String,
    },
    /// Evict a dataset from every engine cache.
    ClearCache {
        #[arg(long)]
        dataset: DatasetId,
    },
}

fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        raw
    } else {
        std::fs::read_to_string(path)
            .wrap_err_with(|| format!("unable to read request {}", path.display()))?
    };
    serde_json::from_str(&raw).wrap_err("malformed request body")
}

fn dataset_info(config: &Config, dataset: DatasetId) -> Result<DatasetInfo, GatewayError> {
    config
        .dataset_info(dataset)
        .ok_or(GatewayError::UnknownDataset(dataset))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let mut config = load_config(&cli.config, cli.config_format)?;
    if let Some(timeout) = cli.timeout_secs {
        config.gateway.timeout_secs = timeout;
    }
    config.validate().map_err(|err| match err {
        ConfigError::Validation(reason) => color_eyre::eyre::eyre!(reason),
        other => other.into(),
    })?;

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if cli.json_logs || config.gateway.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let ledger = config.ledger(Arc::new(TracingLedgerSink))?;
    let gateway = QueryGateway::new(ledger, config.dispatch_client());

    match cli.command {
        Command::Evaluate(args) => {
            let request: QueryEvaluate = read_request(&args.request)?;
            let info = dataset_info(&config, request.dataset)?;
            let result = gateway
                .evaluate(&args.user, &request, &info, args.engine.as_deref())
                .await?;
            print_json(&result)?;
            let remaining = gateway.ledger().remaining(&args.user, request.dataset)?;
            eprintln!("remaining budget on dataset {}: {remaining}", request.dataset);
        }
        Command::Validate(args) => {
            let request: QueryEvaluate = read_request(&args.request)?;
            let info = dataset_info(&config, request.dataset)?;
            let verdicts = gateway
                .validate(&args.user, &request, &info, args.engine.as_deref())
                .await?;
            print_json(&verdicts)?;
        }
        Command::Accuracy(args) => {
            let request: QueryAccuracy = read_request(&args.request)?;
            let info = dataset_info(&config, request.evaluate.dataset)?;
            let accuracy = gateway
                .accuracy(&args.user, &request, &info, args.engine.as_deref())
                .await?;
            print_json(&accuracy)?;
        }
        Command::Engines => {
            let client = gateway.client();
            println!("default: {}", client.default_engine());
            for engine in client.available_engines() {
                println!("{engine}");
            }
        }
        Command::Functions { engine } => {
            print_json(&gateway.functions(engine.as_deref()).await?)?;
        }
        Command::Docs { engine } => {
            println!("{}", gateway.documentation(engine.as_deref()).await?);
        }
        Command::Budget { user } => {
            print_json(&gateway.ledger().user_budgets(&user)?)?;
        }
        Command::ClearCache { dataset } => {
            gateway.clear_cache(dataset).await;
            println!("cache cleared for dataset {dataset}");
        }
    }

    Ok(())
}
