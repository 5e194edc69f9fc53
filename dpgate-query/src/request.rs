//! Requests exchanged between the gateway and the engines.

use serde::{Deserialize, Serialize};

use crate::{
    budget::{Budget, PrivacyNotion},
    schema::Schema,
    step::Query,
};

pub use crate::executor::QueryResult;

pub type DatasetId = i64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub budget: Budget,
    pub query: Query,
    pub dataset: DatasetId,
    pub schema: Schema,
    pub privacy_notion: PrivacyNotion,
    /// Where the engine fetches the dataset's CSV. Filled in by the dispatch
    /// client just before sending.
    #[serde(default)]
    pub url: String,
}

impl EvaluateRequest {
    pub fn new(
        dataset: DatasetId,
        schema: Schema,
        query: Query,
        budget: Budget,
        privacy_notion: PrivacyNotion,
    ) -> Self {
        Self {
            budget,
            query,
            dataset,
            schema,
            privacy_notion,
            url: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRequest {
    #[serde(flatten)]
    pub evaluate: EvaluateRequest,
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub status: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl ValidateResponse {
    pub fn ok() -> Self {
        Self {
            valid: true,
            status: "ok".into(),
            timed_out: false,
        }
    }

    pub fn invalid(status: impl Into<String>) -> Self {
        Self {
            valid: false,
            status: status.into(),
            timed_out: false,
        }
    }

    pub fn timeout(status: impl Into<String>) -> Self {
        Self {
            valid: false,
            status: status.into(),
            timed_out: true,
        }
    }
}
