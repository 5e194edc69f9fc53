use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::ValueEnum;
use dpgate_dispatch::{DispatchClient, EngineTarget, EnginesConfig};
use dpgate_ledger::{BudgetLedger, InMemoryLedgerStore, LedgerAuditSink, LedgerError};
use dpgate_query::{Budget, Column, DatasetId, PrivacyNotion, Schema};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::service::DatasetInfo;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewaySection,
    pub engines: EnginesConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetSection>,
    #[serde(default)]
    pub allocations: Vec<AllocationSection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Base URL engines download dataset CSVs from.
    pub dataset_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSection {
    pub id: DatasetId,
    pub total: Budget,
    #[serde(default = "default_privacy_notion")]
    pub privacy_notion: PrivacyNotion,
    pub schema: Schema,
    #[serde(default = "default_loaded")]
    pub loaded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationSection {
    pub user: String,
    pub dataset: DatasetId,
    pub budget: Budget,
}

const fn default_timeout_secs() -> u64 {
    120
}

const fn default_privacy_notion() -> PrivacyNotion {
    PrivacyNotion::PureDP
}

const fn default_loaded() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout must be greater than zero".into(),
            ));
        }
        Url::parse(&self.gateway.dataset_url).map_err(|err| {
            ConfigError::Validation(format!(
                "invalid dataset url {:?}: {err}",
                self.gateway.dataset_url
            ))
        })?;
        self.engines.validate().map_err(ConfigError::Validation)?;

        let mut ids = HashSet::new();
        for dataset in &self.datasets {
            if !ids.insert(dataset.id) {
                return Err(ConfigError::Validation(format!(
                    "dataset {} is declared more than once",
                    dataset.id
                )));
            }
            dataset
                .total
                .validate_for(dataset.privacy_notion)
                .map_err(|err| {
                    ConfigError::Validation(format!("dataset {} total: {err}", dataset.id))
                })?;
        }
        for allocation in &self.allocations {
            if !ids.contains(&allocation.dataset) {
                return Err(ConfigError::Validation(format!(
                    "allocation for {} names unknown dataset {}",
                    allocation.user, allocation.dataset
                )));
            }
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            gateway: GatewaySection {
                dataset_url: "http://localhost:8080/v1/datasets".into(),
                timeout_secs: default_timeout_secs(),
                json_logs: false,
            },
            engines: EnginesConfig {
                default: "dpgate".into(),
                engines: vec![EngineTarget::standard("dpgate", "http://localhost:8000")],
            },
            datasets: vec![DatasetSection {
                id: 1,
                total: Budget::pure(10.0),
                privacy_notion: default_privacy_notion(),
                schema: Schema::new(vec![Column::int("age", 0, 100), Column::text("city")])
                    .unwrap_or_default(),
                loaded: default_loaded(),
            }],
            allocations: vec![AllocationSection {
                user: "analyst".into(),
                dataset: 1,
                budget: Budget::pure(1.0),
            }],
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.timeout_secs)
    }

    pub fn dataset_info(&self, id: DatasetId) -> Option<DatasetInfo> {
        self.datasets
            .iter()
            .find(|dataset| dataset.id == id)
            .map(|dataset| DatasetInfo {
                id: dataset.id,
                schema: dataset.schema.clone(),
                privacy_notion: dataset.privacy_notion,
                loaded: dataset.loaded,
            })
    }

    pub fn dispatch_client(&self) -> DispatchClient {
        DispatchClient::new(
            &self.engines,
            self.gateway.dataset_url.clone(),
            Some(self.timeout()),
        )
    }

    /// In-memory ledger seeded with the configured datasets and allocations.
    pub fn ledger(&self, audit: Arc<dyn LedgerAuditSink>) -> Result<BudgetLedger, LedgerError> {
        let store = InMemoryLedgerStore::new();
        for dataset in &self.datasets {
            store.register_dataset(dataset.id, dataset.total);
        }
        let ledger = BudgetLedger::new(Arc::new(store)).with_audit(audit);
        for allocation in &self.allocations {
            ledger.allocate(&allocation.user, allocation.dataset, allocation.budget)?;
        }
        Ok(ledger)
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
