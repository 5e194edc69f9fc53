//! Query gateway: the front door analysts talk to.
//!
//! The gateway checks a query's budget against the ledger, forwards it to
//! an engine through the dispatch client and records the spent budget once
//! the engine has answered.

pub mod config;
pub mod errors;
pub mod service;

pub use crate::config::{load_config, parse_config, Config, ConfigError, ConfigFormat};
pub use crate::errors::GatewayError;
pub use crate::service::{DatasetInfo, QueryAccuracy, QueryEvaluate, QueryGateway};
