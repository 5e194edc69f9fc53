use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dpgate_query::{AccuracyRequest, DatasetId, EvaluateRequest, QueryResult, ValidateResponse};
use futures_util::future::join_all;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EngineTarget, EnginesConfig};

/// Applied to every outbound call when the configuration names none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const NOT_IMPLEMENTED_FEATURES: &str = "engine has not implemented features";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("query failed due to timeout")]
    Timeout,
    #[error("{0}")]
    Unexpected(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("engine response could not be decoded: {0}")]
    Formatting(String),
}

impl DispatchError {
    /// Timeouts, unreachable engines and malformed replies. A caller may try
    /// another engine for these; a bad request would fail everywhere.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::BadRequest(_))
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

struct Reply {
    status: StatusCode,
    body: Vec<u8>,
}

/// Talks to every configured engine over HTTP with one shared timeout.
#[derive(Clone)]
pub struct DispatchClient {
    http: reqwest::Client,
    engines: Arc<BTreeMap<String, EngineTarget>>,
    default_engine: String,
    dataset_url: String,
    timeout: Duration,
}

impl DispatchClient {
    /// `dataset_url` is the base the engines call back on to fetch a
    /// dataset's CSV; requests carry `{dataset_url}/{dataset}`.
    pub fn new(config: &EnginesConfig, dataset_url: impl Into<String>, timeout: Option<Duration>) -> Self {
        let engines = config.by_name();
        let wanted = config.default.to_lowercase();
        let default_engine = if engines.contains_key(&wanted) {
            wanted
        } else {
            let fallback = engines.keys().next().cloned().unwrap_or_default();
            if !config.default.is_empty() {
                warn!(configured = %config.default, %fallback, "default engine is not configured");
            }
            fallback
        };
        let dataset_url = dataset_url.into().trim_end_matches('/').to_owned();
        Self {
            http: reqwest::Client::new(),
            engines: Arc::new(engines),
            default_engine,
            dataset_url,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn available_engines(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    pub fn is_available(&self, engine: &str) -> bool {
        self.engines.contains_key(&engine.to_lowercase())
    }

    pub fn dataset_url_for(&self, dataset: DatasetId) -> String {
        format!("{}/{dataset}", self.dataset_url)
    }

    fn target(&self, engine: Option<&str>) -> Result<(String, &EngineTarget)> {
        let name = engine
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.default_engine.clone());
        match self.engines.get(&name) {
            Some(target) => Ok((name, target)),
            None => Err(DispatchError::BadRequest(format!("unknown dp engine: {name}"))),
        }
    }

    fn endpoint<'t>(
        name: &str,
        url: &'t Option<String>,
        capability: &str,
    ) -> Result<&'t str> {
        url.as_deref()
            .ok_or_else(|| DispatchError::BadRequest(format!("dp engine {name} does not support {capability}")))
    }

    /// Issues one call and races it against the timeout. On timeout the
    /// in-flight request is aborted and its outcome discarded.
    async fn call<B: Serialize>(&self, method: Method, url: &str, body: Option<&B>) -> Result<Reply> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let mut task = tokio::spawn(async move {
            let response = request
                .send()
                .await
                .map_err(|err| DispatchError::Unexpected(err.to_string()))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|err| DispatchError::Unexpected(err.to_string()))?;
            Ok::<_, DispatchError>(Reply {
                status,
                body: body.to_vec(),
            })
        });

        let reply = tokio::select! {
            joined = &mut task => {
                joined.map_err(|err| DispatchError::Unexpected(err.to_string()))??
            }
            _ = tokio::time::sleep(self.timeout) => {
                task.abort();
                debug!(url, timeout_ms = self.timeout.as_millis() as u64, "engine call timed out");
                return Err(DispatchError::Timeout);
            }
        };

        if reply.status.is_server_error() {
            return Err(DispatchError::Unexpected(
                String::from_utf8_lossy(&reply.body).into_owned(),
            ));
        }
        if reply.status.is_client_error() {
            return Err(DispatchError::BadRequest(
                String::from_utf8_lossy(&reply.body).into_owned(),
            ));
        }
        if reply.status == StatusCode::NO_CONTENT {
            return Ok(Reply {
                status: reply.status,
                body: Vec::new(),
            });
        }
        Ok(reply)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let reply = self.call(Method::POST, url, Some(body)).await?;
        decode(&reply.body)
    }

    pub async fn evaluate(&self, engine: Option<&str>, mut request: EvaluateRequest) -> Result<QueryResult> {
        let (name, target) = self.target(engine)?;
        let url = Self::endpoint(&name, &target.evaluate_url, "evaluation")?;
        request.url = self.dataset_url_for(request.dataset);
        debug!(engine = %name, dataset = request.dataset, "dispatching evaluate");
        self.post_json(url, &request).await
    }

    pub async fn validate(&self, engine: Option<&str>, mut request: EvaluateRequest) -> Result<ValidateResponse> {
        let (name, target) = self.target(engine)?;
        let url = Self::endpoint(&name, &target.validation_url, "validation")?;
        request.url = self.dataset_url_for(request.dataset);
        self.post_json(url, &request).await.map_err(|err| match err {
            DispatchError::Timeout => DispatchError::Timeout,
            other => DispatchError::Unexpected(format!("{name} failed to validate query: {other}")),
        })
    }

    /// Validates against every engine concurrently and waits for all of
    /// them. Failures become per-engine entries instead of an error.
    pub async fn validate_all(&self, request: &EvaluateRequest) -> BTreeMap<String, ValidateResponse> {
        let calls = self.engines.keys().map(|name| {
            let request = request.clone();
            async move {
                let outcome = match self.validate(Some(name.as_str()), request).await {
                    Ok(response) => response,
                    Err(DispatchError::Timeout) => {
                        ValidateResponse::timeout(DispatchError::Timeout.to_string())
                    }
                    Err(err) => ValidateResponse::invalid(err.to_string()),
                };
                (name.clone(), outcome)
            }
        });
        join_all(calls).await.into_iter().collect()
    }

    pub async fn accuracy(&self, engine: Option<&str>, mut request: AccuracyRequest) -> Result<Vec<f64>> {
        let (name, target) = self.target(engine)?;
        let url = Self::endpoint(&name, &target.accuracy_url, "accuracy")?;
        request.evaluate.url = self.dataset_url_for(request.evaluate.dataset);
        self.post_json(url, &request).await
    }

    /// Asks every engine to drop its cached copy of `dataset`. Best effort:
    /// failures are logged and the call always completes once every engine
    /// has answered or timed out.
    pub async fn clear_cache(&self, dataset: DatasetId) {
        let calls = self.engines.iter().map(|(name, target)| async move {
            let Some(base) = target.delete_url.as_deref() else {
                debug!(engine = %name, "engine has no cache endpoint");
                return;
            };
            let url = format!("{}/{dataset}", base.trim_end_matches('/'));
            match self.call::<()>(Method::DELETE, &url, None).await {
                Ok(reply) if reply.status == StatusCode::NO_CONTENT => {
                    info!(engine = %name, dataset, "engine cache cleared");
                }
                Ok(reply) => {
                    warn!(engine = %name, dataset, status = %reply.status, "unexpected cache clear status");
                }
                Err(err) => {
                    warn!(engine = %name, dataset, error = %err, "failed to clear engine cache");
                }
            }
        });
        join_all(calls).await;
    }

    pub async fn functions(&self, engine: &str) -> Result<serde_json::Value> {
        let (name, target) = self.target(Some(engine))?;
        let url = target
            .functions_url
            .as_deref()
            .ok_or_else(|| DispatchError::BadRequest(format!("engine {name} has not implemented help")))?;
        let reply = self.call::<()>(Method::GET, url, None).await?;
        decode(&reply.body)
    }

    /// Functions of every engine; engines without the endpoint map to a
    /// marker string. Stops at the first failing engine.
    pub async fn all_functions(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut out = BTreeMap::new();
        for (name, target) in self.engines.iter() {
            let value = match target.functions_url.as_deref() {
                Some(url) => decode(&self.call::<()>(Method::GET, url, None).await?.body)?,
                None => serde_json::Value::String(NOT_IMPLEMENTED_FEATURES.into()),
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    pub async fn documentation(&self, engine: &str) -> Result<String> {
        let (name, target) = self.target(Some(engine))?;
        let url = Self::endpoint(&name, &target.documentation_url, "documentation")?;
        let reply = self.call::<()>(Method::GET, url, None).await?;
        Ok(String::from_utf8_lossy(&reply.body).into_owned())
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|err| DispatchError::Formatting(err.to_string()))
}
