use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use dpgate_dispatch::{DispatchClient, EngineTarget, EnginesConfig};
use dpgate_gateway::{
    load_config, ConfigFormat, DatasetInfo, GatewayError, QueryEvaluate, QueryGateway,
};
use dpgate_ledger::{BudgetLedger, InMemoryLedgerSink, InMemoryLedgerStore, LedgerEvent};
use dpgate_query::{
    Budget, Column, EvaluateRequest, PrivacyNotion, QueryResult, Schema, ValidateResponse,
};
use pretty_assertions::assert_eq;

async fn evaluate(
    State(hits): State<Arc<AtomicUsize>>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<QueryResult>, (StatusCode, String)> {
    hits.fetch_add(1, Ordering::SeqCst);
    if request.query.measurement_count() == 0 {
        return Err((StatusCode::BAD_REQUEST, "query has no measurement".into()));
    }
    let row = BTreeMap::from([("age_count".to_owned(), 42.0)]);
    Ok(Json(QueryResult { rows: vec![row] }))
}

async fn validate(Json(_request): Json<EvaluateRequest>) -> Json<ValidateResponse> {
    Json(ValidateResponse::ok())
}

struct Harness {
    gateway: QueryGateway,
    sink: Arc<InMemoryLedgerSink>,
    hits: Arc<AtomicUsize>,
    info: DatasetInfo,
}

async fn harness() -> Harness {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/evaluate", post(evaluate))
        .route("/validate", post(validate))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let store = InMemoryLedgerStore::new();
    store.register_dataset(1, Budget::pure(10.0));
    let sink = Arc::new(InMemoryLedgerSink::new());
    let ledger = BudgetLedger::new(Arc::new(store)).with_audit(sink.clone());
    ledger.allocate("analyst", 1, Budget::pure(1.0)).unwrap();

    let client = DispatchClient::new(
        &EnginesConfig {
            default: "mock".into(),
            engines: vec![EngineTarget::standard("mock", &format!("http://{addr}"))],
        },
        "http://gateway/datasets",
        Some(Duration::from_secs(5)),
    );
    Harness {
        gateway: QueryGateway::new(ledger, client),
        sink,
        hits,
        info: DatasetInfo {
            id: 1,
            schema: Schema::new(vec![Column::int("age", 0, 100)]).unwrap(),
            privacy_notion: PrivacyNotion::PureDP,
            loaded: true,
        },
    }
}

fn query(raw: &str, epsilon: f64) -> QueryEvaluate {
    QueryEvaluate {
        dataset: 1,
        budget: Budget::pure(epsilon),
        query: serde_json::from_str(raw).unwrap(),
    }
}

#[tokio::test]
async fn budget_is_consumed_only_after_a_successful_answer() {
    let h = harness().await;
    let count = query(r#"[{"count": {"column": "age"}}]"#, 0.4);

    let result = h.gateway.evaluate("analyst", &count, &h.info, None).await.unwrap();
    assert_eq!(result.rows[0]["age_count"], 42.0);
    assert_eq!(h.gateway.ledger().get_consumed("analyst", 1).unwrap(), Budget::pure(0.4));

    let failing = query(r#"[{"filter": ["age > 3"]}]"#, 0.4);
    let err = h
        .gateway
        .evaluate("analyst", &failing, &h.info, Some("MOCK"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Dispatch(_)), "{err:?}");
    assert!(!err.is_transport());
    assert_eq!(h.gateway.ledger().get_consumed("analyst", 1).unwrap(), Budget::pure(0.4));

    h.gateway.evaluate("analyst", &count, &h.info, None).await.unwrap();
    let err = h
        .gateway
        .evaluate("analyst", &count, &h.info, None)
        .await
        .unwrap_err();
    assert!(err.is_budget(), "{err:?}");
    assert_eq!(h.hits.load(Ordering::SeqCst), 3);

    let fingerprinted = h
        .sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, LedgerEvent::Consumed { query_fingerprint: Some(_), .. }))
        .count();
    assert_eq!(fingerprinted, 2);
}

#[tokio::test]
async fn requests_are_checked_before_reaching_an_engine() {
    let h = harness().await;
    let count = query(r#"[{"count": {"column": "age"}}]"#, 0.1);

    let err = h.gateway.evaluate("stranger", &count, &h.info, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::InsufficientBudget { .. }));

    let mut unloaded = h.info.clone();
    unloaded.loaded = false;
    let err = h.gateway.evaluate("analyst", &count, &unloaded, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotLoaded(1)));

    let err = h
        .gateway
        .evaluate("analyst", &count, &h.info, Some("other"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownEngine(_)));

    let mismatched = query(
        r#"[{"count": {"column": "age", "budget": {"epsilon": 0.05}}}]"#,
        0.1,
    );
    let err = h.gateway.evaluate("analyst", &mismatched, &h.info, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));

    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.gateway.ledger().get_consumed("analyst", 1).unwrap(), Budget::zero());
}

#[tokio::test]
async fn validation_needs_an_allocation_but_spends_nothing() {
    let h = harness().await;
    let count = query(r#"[{"count": {"column": "age"}}]"#, 0.5);

    let all = h.gateway.validate("analyst", &count, &h.info, None).await.unwrap();
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["mock"]);
    assert!(all["mock"].valid);

    let single = h.gateway.validate("analyst", &count, &h.info, Some("Mock")).await.unwrap();
    assert!(single["mock"].valid);

    let err = h.gateway.validate("stranger", &count, &h.info, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::Ledger(_)));
    assert_eq!(h.gateway.ledger().get_consumed("analyst", 1).unwrap(), Budget::zero());
}

#[test]
fn shipped_configs_load() {
    let configs = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
    for name in ["dpgate-gateway.toml", "dpgate-gateway.yaml"] {
        let config = load_config(&configs.join(name), ConfigFormat::Auto).unwrap();
        let ledger = config.ledger(Arc::new(InMemoryLedgerSink::new())).unwrap();
        assert!(ledger.has_enough_budget("analyst", 1, &Budget::pure(0.5)), "{name}");
        assert_eq!(config.dispatch_client().default_engine(), "dpgate");
    }
}
