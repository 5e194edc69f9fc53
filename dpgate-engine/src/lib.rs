//! A dpgate engine: the HTTP process that actually runs queries.
//!
//! Requests name a dataset and carry the URL it can be downloaded from. The
//! engine fetches it once, keeps it in a [`DatasetCache`] until the gateway
//! evicts it, and evaluates queries with its configured aggregation library.

pub mod cache;
pub mod provider;
pub mod routes;
pub mod service;

pub use crate::cache::{DatasetCache, InMemoryDatasetCache, NoDatasetCache};
pub use crate::provider::{parse_csv, DatasetProvider, HttpCsvProvider, ProviderError};
pub use crate::routes::router;
pub use crate::service::{EngineError, EngineService};
