use std::collections::BTreeMap;

use dpgate_dispatch::DispatchClient;
use dpgate_ledger::BudgetLedger;
use dpgate_query::{
    AccuracyRequest, Budget, DatasetId, EvaluateRequest, PrivacyNotion, Query, QueryResult,
    Schema, ValidateResponse,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{GatewayError, Result};

/// What the gateway knows about a dataset when forwarding a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub id: DatasetId,
    pub schema: Schema,
    pub privacy_notion: PrivacyNotion,
    /// False until the dataset's rows have been uploaded.
    pub loaded: bool,
}

/// A user's query as submitted to the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryEvaluate {
    pub dataset: DatasetId,
    pub budget: Budget,
    pub query: Query,
}

impl QueryEvaluate {
    /// Canonical JSON of the query, hashed into the consume audit event.
    pub fn fingerprint_bytes(&self) -> Option<Vec<u8>> {
        match serde_json::to_vec(&self.query) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(dataset = self.dataset, error = %err, "query fingerprint unavailable");
                None
            }
        }
    }

    /// Checks the request budget and, when any measurement names its own
    /// budget, that the measurement budgets add up to it. Measurements
    /// without a budget count as zero here.
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        let declared: Vec<Budget> = self.query.measurements().filter_map(|m| m.budget).collect();
        for budget in &declared {
            budget.validate()?;
        }
        if declared.is_empty() {
            return Ok(());
        }
        let sum: Budget = declared.into_iter().sum();
        if !sum.approx_eq(&self.budget) {
            return Err(GatewayError::InvalidRequest(format!(
                "query budgets {sum} don't add up to the given total budget {}",
                self.budget
            )));
        }
        Ok(())
    }

    fn to_engine_request(&self, info: &DatasetInfo) -> EvaluateRequest {
        EvaluateRequest::new(
            self.dataset,
            info.schema.clone(),
            self.query.clone(),
            self.budget,
            info.privacy_notion,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryAccuracy {
    #[serde(flatten)]
    pub evaluate: QueryEvaluate,
    pub confidence: f64,
}

impl QueryAccuracy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(GatewayError::InvalidRequest(format!(
                "confidence parameter is out of range. accepted range is [0,1] but given confidence was: {}",
                self.confidence
            )));
        }
        Ok(self.evaluate.budget.validate()?)
    }
}

/// Admission control in front of the engines: a query is only forwarded
/// when the user's remaining budget covers it, and budget is only consumed
/// once an engine has answered successfully.
#[derive(Clone)]
pub struct QueryGateway {
    ledger: BudgetLedger,
    client: DispatchClient,
}

impl QueryGateway {
    pub fn new(ledger: BudgetLedger, client: DispatchClient) -> Self {
        Self { ledger, client }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn client(&self) -> &DispatchClient {
        &self.client
    }

    fn check_target(request: &QueryEvaluate, info: &DatasetInfo) -> Result<()> {
        if request.dataset != info.id {
            return Err(GatewayError::InvalidRequest(format!(
                "request names dataset {} but dataset {} was supplied",
                request.dataset, info.id
            )));
        }
        if !info.loaded {
            return Err(GatewayError::NotLoaded(info.id));
        }
        Ok(())
    }

    fn check_engine(&self, engine: Option<&str>) -> Result<()> {
        match engine {
            Some(name) if !self.client.is_available(name) => {
                Err(GatewayError::UnknownEngine(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    pub async fn evaluate(
        &self,
        user: &str,
        request: &QueryEvaluate,
        info: &DatasetInfo,
        engine: Option<&str>,
    ) -> Result<QueryResult> {
        request.validate()?;
        if !self
            .ledger
            .has_enough_budget(user, request.dataset, &request.budget)
        {
            return Err(GatewayError::InsufficientBudget {
                user: user.to_owned(),
                dataset: request.dataset,
            });
        }
        Self::check_target(request, info)?;
        self.check_engine(engine)?;

        let result = self
            .client
            .evaluate(engine, request.to_engine_request(info))
            .await?;

        let fingerprint = request.fingerprint_bytes();
        let consumed = self.ledger.add_consumed(
            user,
            request.dataset,
            request.budget,
            fingerprint.as_deref(),
        )?;
        info!(
            user,
            dataset = request.dataset,
            engine = engine.unwrap_or(self.client.default_engine()),
            spent = %request.budget,
            total_consumed = %consumed,
            "query answered"
        );
        Ok(result)
    }

    /// Validates on one engine, or on every engine when none is named.
    /// Requires an allocation but consumes nothing.
    pub async fn validate(
        &self,
        user: &str,
        request: &QueryEvaluate,
        info: &DatasetInfo,
        engine: Option<&str>,
    ) -> Result<BTreeMap<String, ValidateResponse>> {
        request.validate()?;
        Self::check_target(request, info)?;
        self.ledger.get_allocated(user, request.dataset)?;

        let engine_request = request.to_engine_request(info);
        match engine {
            Some(name) => {
                self.check_engine(Some(name))?;
                let verdict = self.client.validate(Some(name), engine_request).await?;
                Ok(BTreeMap::from([(name.to_lowercase(), verdict)]))
            }
            None => Ok(self.client.validate_all(&engine_request).await),
        }
    }

    pub async fn accuracy(
        &self,
        user: &str,
        request: &QueryAccuracy,
        info: &DatasetInfo,
        engine: Option<&str>,
    ) -> Result<Vec<f64>> {
        request.validate()?;
        self.ledger.get_allocated(user, request.evaluate.dataset)?;
        Self::check_target(&request.evaluate, info)?;
        self.check_engine(engine)?;
        let engine_request = AccuracyRequest {
            evaluate: request.evaluate.to_engine_request(info),
            confidence: request.confidence,
        };
        Ok(self.client.accuracy(engine, engine_request).await?)
    }

    /// Drops the dataset from every engine cache, e.g. after new rows were
    /// uploaded. Never fails.
    pub async fn clear_cache(&self, dataset: DatasetId) {
        self.client.clear_cache(dataset).await;
    }

    pub async fn functions(&self, engine: Option<&str>) -> Result<serde_json::Value> {
        match engine {
            Some(name) => {
                self.check_engine(Some(name))?;
                Ok(self.client.functions(name).await?)
            }
            None => {
                let all = self.client.all_functions().await?;
                Ok(serde_json::Value::Object(all.into_iter().collect()))
            }
        }
    }

    /// Markdown documentation of one engine, or of all of them separated by
    /// horizontal rules. Engines failing to answer are skipped.
    pub async fn documentation(&self, engine: Option<&str>) -> Result<String> {
        if let Some(name) = engine {
            self.check_engine(Some(name))?;
            return Ok(self.client.documentation(name).await?);
        }
        let mut combined = String::new();
        for name in self.client.available_engines() {
            match self.client.documentation(&name).await {
                Ok(docs) => combined.push_str(&docs),
                Err(err) => warn!(engine = %name, error = %err, "documentation unavailable"),
            }
            combined.push_str("\n***\n");
        }
        Ok(combined)
    }
}
