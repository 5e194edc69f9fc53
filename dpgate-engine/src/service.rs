use std::sync::Arc;

use dpgate_query::{
    compile_and_run, AccuracyRequest, AggregationLibrary, Dataset, DatasetId, EvaluateRequest,
    ExactAggregation, MeasurementKind, NoiseMechanism, QueryError, QueryResult, ValidateResponse,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::DatasetCache,
    provider::{DatasetProvider, ProviderError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to load dataset {dataset}: {source}")]
    Provider {
        dataset: DatasetId,
        #[source]
        source: ProviderError,
    },
    #[error("accuracy estimation is not supported by the {0} engine")]
    AccuracyUnsupported(String),
}

/// One engine: fetches datasets through a provider, keeps them in a cache
/// and evaluates queries with its aggregation library.
pub struct EngineService {
    name: String,
    provider: Arc<dyn DatasetProvider>,
    cache: Arc<dyn DatasetCache>,
    library: Arc<dyn AggregationLibrary>,
}

impl EngineService {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn DatasetProvider>,
        cache: Arc<dyn DatasetCache>,
        library: Arc<dyn AggregationLibrary>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            cache,
            library,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn dataset(&self, request: &EvaluateRequest) -> Result<Arc<Dataset>, EngineError> {
        if let Some(hit) = self.cache.get(request.dataset) {
            return Ok(hit);
        }
        let data = self
            .provider
            .fetch(request.dataset, &request.url)
            .await
            .map_err(|source| EngineError::Provider {
                dataset: request.dataset,
                source,
            })?;
        let data = Arc::new(data);
        self.cache.put(request.dataset, Arc::clone(&data));
        Ok(data)
    }

    pub async fn evaluate(&self, request: &EvaluateRequest) -> Result<QueryResult, EngineError> {
        let data = self.dataset(request).await?;
        let result = compile_and_run(
            &request.query,
            &request.schema,
            &data,
            &request.budget,
            request.privacy_notion,
            self.library.as_ref(),
        )?;
        info!(
            engine = %self.name,
            dataset = request.dataset,
            steps = request.query.steps.len(),
            rows = result.rows.len(),
            "query evaluated"
        );
        Ok(result)
    }

    /// Runs the full pipeline without noise. Query problems are reported in
    /// the response; only a dataset that cannot be loaded is an error.
    pub async fn validate(&self, request: &EvaluateRequest) -> Result<ValidateResponse, EngineError> {
        let data = self.dataset(request).await?;
        let outcome = compile_and_run(
            &request.query,
            &request.schema,
            &data,
            &request.budget,
            request.privacy_notion,
            &ExactAggregation,
        );
        Ok(match outcome {
            Ok(_) => ValidateResponse {
                valid: true,
                status: format!("query is valid in {}", self.name),
                timed_out: false,
            },
            Err(err) => {
                debug!(engine = %self.name, dataset = request.dataset, error = %err, "query rejected");
                ValidateResponse::invalid(err.to_string())
            }
        })
    }

    pub fn accuracy(&self, _request: &AccuracyRequest) -> Result<Vec<f64>, EngineError> {
        Err(EngineError::AccuracyUnsupported(self.name.clone()))
    }

    pub fn clear_cache(&self, dataset: DatasetId) -> bool {
        let removed = self.cache.invalidate(dataset);
        if removed {
            info!(engine = %self.name, dataset, "dataset evicted");
        } else {
            warn!(engine = %self.name, dataset, "dataset was not cached");
        }
        removed
    }

    /// Measurements this engine understands, keyed by wire name.
    pub fn functions(&self) -> serde_json::Value {
        let measurements: serde_json::Map<_, _> = MeasurementKind::ALL
            .iter()
            .map(|kind| {
                (
                    kind.as_str().to_owned(),
                    json!({
                        "numeric_column": kind.requires_numeric(),
                        "options": ["column", "mech", "budget"],
                    }),
                )
            })
            .collect();
        json!({
            "engine": self.name,
            "library": self.library.name(),
            "steps": {
                "filter": "list of \"<column> <op> <literal>\" predicates, op one of < <= > >= == !=",
                "bin": "{\"<column>\": [ascending boundaries]}",
            },
            "measurements": measurements,
            "mechanisms": [NoiseMechanism::Laplace.as_str(), NoiseMechanism::Gaussian.as_str()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDatasetCache;
    use async_trait::async_trait;
    use dpgate_query::{Budget, Column, PrivacyNotion, Query, Schema};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DatasetProvider for CountingProvider {
        async fn fetch(&self, _dataset: DatasetId, url: &str) -> Result<Dataset, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if url.is_empty() {
                return Err(ProviderError::Status {
                    url: url.to_owned(),
                    status: 404,
                });
            }
            crate::provider::parse_csv(b"age\n5\n15\n25\n")
        }
    }

    fn request(query: &str) -> EvaluateRequest {
        let mut request = EvaluateRequest::new(
            4,
            Schema::new(vec![Column::int("age", 0, 100)]).unwrap(),
            serde_json::from_str::<Query>(query).unwrap(),
            Budget::pure(1.0),
            PrivacyNotion::PureDP,
        );
        request.url = "http://gateway/datasets/4".into();
        request
    }

    fn service(provider: Arc<CountingProvider>) -> EngineService {
        EngineService::new(
            "exact",
            provider,
            Arc::new(InMemoryDatasetCache::new()),
            Arc::new(ExactAggregation),
        )
    }

    #[tokio::test]
    async fn datasets_are_fetched_once_until_evicted() {
        let provider = Arc::new(CountingProvider::default());
        let engine = service(provider.clone());
        let query = request(r#"[{"filter": ["age > 10"]}, {"sum": {"column": "age"}}]"#);

        let result = engine.evaluate(&query).await.unwrap();
        assert_eq!(result.rows[0]["age_sum"], 40.0);
        engine.evaluate(&query).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        assert!(engine.clear_cache(4));
        assert!(!engine.clear_cache(4));
        engine.evaluate(&query).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validate_reports_query_problems_in_the_body() {
        let engine = service(Arc::new(CountingProvider::default()));
        let ok = engine.validate(&request(r#"[{"count": {"column": "age"}}]"#)).await.unwrap();
        assert_eq!(ok.status, "query is valid in exact");
        assert!(ok.valid);

        let bad = engine
            .validate(&request(r#"[{"mean": {"column": "height"}}]"#))
            .await
            .unwrap();
        assert!(!bad.valid);
        assert!(bad.status.contains("height"), "{}", bad.status);

        let mut unreachable = request(r#"[{"count": {"column": "age"}}]"#);
        unreachable.url.clear();
        assert!(matches!(
            engine.validate(&unreachable).await,
            Err(EngineError::Provider { dataset: 4, .. })
        ));
    }

    #[test]
    fn functions_list_every_measurement() {
        let engine = service(Arc::new(CountingProvider::default()));
        let functions = engine.functions();
        assert_eq!(functions["library"], "exact");
        assert_eq!(functions["measurements"]["quantile"]["numeric_column"], true);
        assert_eq!(functions["measurements"]["count"]["numeric_column"], false);
        assert!(matches!(
            engine.accuracy(&AccuracyRequest {
                evaluate: request("[]"),
                confidence: 0.9
            }),
            Err(EngineError::AccuracyUnsupported(_))
        ));
    }
}
