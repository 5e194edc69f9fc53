use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dpgate_query::{AccuracyRequest, DatasetId, EvaluateRequest, ValidateResponse};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::service::{EngineError, EngineService};

const DOCUMENTATION: &str = include_str!("../static/README.md");

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::AccuracyUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_string())).into_response()
    }
}

pub fn router(engine: Arc<EngineService>) -> Router {
    Router::new()
        .route("/evaluate", post(evaluate))
        .route("/validate", post(validate))
        .route("/accuracy", post(accuracy))
        .route("/functions", get(functions))
        .route("/documentation", get(documentation))
        .route("/cache/:dataset", delete(clear_cache))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new().include_headers(false)),
        )
        .with_state(engine)
}

async fn evaluate(
    State(engine): State<Arc<EngineService>>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return (StatusCode::BAD_REQUEST, Json(rejection.body_text())).into_response(),
    };
    match engine.evaluate(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn validate(
    State(engine): State<Arc<EngineService>>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return Json(ValidateResponse::invalid(rejection.body_text())).into_response(),
    };
    match engine.validate(&request).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => (err.status(), Json(ValidateResponse::invalid(err.to_string()))).into_response(),
    }
}

async fn accuracy(
    State(engine): State<Arc<EngineService>>,
    Json(request): Json<AccuracyRequest>,
) -> Result<Json<Vec<f64>>, EngineError> {
    engine.accuracy(&request).map(Json)
}

async fn functions(State(engine): State<Arc<EngineService>>) -> Json<serde_json::Value> {
    Json(engine.functions())
}

async fn documentation() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/markdown")], DOCUMENTATION)
}

async fn clear_cache(
    State(engine): State<Arc<EngineService>>,
    Path(dataset): Path<DatasetId>,
) -> StatusCode {
    engine.clear_cache(dataset);
    StatusCode::NO_CONTENT
}
