use dpgate_query::{
    compile, compile_and_run,
    step::{MeasurementStep, QueryStep},
    Budget, Column, Dataset, ExactAggregation, MeasurementKind, NoisyAggregation, PrivacyNotion,
    Query, QueryError, ResultRow, Row, Schema, StructuralError,
};
use pretty_assertions::assert_eq;

fn people() -> (Schema, Dataset) {
    let schema = Schema::new(vec![
        Column::text("name"),
        Column::int("age", 0, 100),
        Column::double("income", 0.0, 1_000.0),
    ])
    .unwrap();
    let mut records = vec![vec!["name".to_string(), "age".to_string(), "income".to_string()]];
    records.extend((0..100).map(|age| {
        vec![
            format!("person-{age}"),
            age.to_string(),
            format!("{}.5", age * 10),
        ]
    }));
    (schema, Dataset::from_records_with_header(records))
}

fn query(json: &str) -> Query {
    serde_json::from_str(json).unwrap()
}

#[test]
fn filter_then_count() {
    let (schema, data) = people();
    let query = query(r#"[{"filter": ["age < 10"]}, {"count": {"column": "age"}}]"#);
    let result = compile_and_run(
        &query,
        &schema,
        &data,
        &Budget::pure(1.0),
        PrivacyNotion::PureDP,
        &ExactAggregation,
    )
    .unwrap();
    assert_eq!(result.rows, vec![ResultRow::from([("age_count".to_string(), 10.0)])]);
}

#[test]
fn binned_count_keys_rows_by_upper_bound() {
    let (schema, data) = people();
    let query = query(r#"[{"bin": {"age": [0, 50, 100]}}, {"count": {"column": "age"}}]"#);
    let result = compile_and_run(
        &query,
        &schema,
        &data,
        &Budget::pure(1.0),
        PrivacyNotion::PureDP,
        &ExactAggregation,
    )
    .unwrap();
    assert_eq!(
        result.rows,
        vec![
            ResultRow::from([("age_binned".to_string(), 50.0), ("count".to_string(), 50.0)]),
            ResultRow::from([("age_binned".to_string(), 100.0), ("count".to_string(), 50.0)]),
        ]
    );
}

#[test]
fn every_sub_query_starts_from_the_full_dataset() {
    let (schema, data) = people();
    let query = query(
        r#"[
            {"filter": ["age >= 90"]}, {"count": {"column": "age"}},
            {"sum": {"column": "age"}},
            {"filter": ["name == person-3"]}, {"mean": {"column": "income"}}
        ]"#,
    );
    let result = compile_and_run(
        &query,
        &schema,
        &data,
        &Budget::approx(3.0, 1e-6),
        PrivacyNotion::ApproxDP,
        &ExactAggregation,
    )
    .unwrap();
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[0]["age_count"], 10.0);
    assert_eq!(result.rows[1]["age_sum"], 4950.0);
    assert_eq!(result.rows[2]["income_mean"], 30.5);
}

#[test]
fn shape_rules_apply_per_sub_query() {
    let count = || QueryStep::measure(MeasurementKind::Count, "age");
    let filter = || QueryStep::filter(["age < 3"]).unwrap();
    let bin = || QueryStep::bin("age", vec![0, 10]);
    let budget = Budget::pure(1.0);

    let accepted = Query::new(vec![filter(), bin(), count()]);
    assert!(compile(&accepted, &budget, PrivacyNotion::PureDP).is_ok());

    let reordered = Query::new(vec![bin(), filter(), count()]);
    assert!(matches!(
        compile(&reordered, &budget, PrivacyNotion::PureDP),
        Err(StructuralError::MalformedShape { index: 0, .. })
    ));

    let trailing = Query::new(vec![count(), filter()]);
    assert!(matches!(
        compile(&trailing, &budget, PrivacyNotion::PureDP),
        Err(StructuralError::MalformedShape { index: 1, .. })
    ));
}

#[test]
fn explicit_budgets_off_by_more_than_rounding_are_rejected() {
    let (schema, data) = people();
    let with_budget = |epsilon: f64| {
        QueryStep::Measurement(
            MeasurementStep::new(MeasurementKind::Count, "age").with_budget(Budget::pure(epsilon)),
        )
    };
    let exact = Query::new(vec![with_budget(0.1), with_budget(0.2)]);
    let declared = Budget::pure(0.3);
    assert!(compile_and_run(&exact, &schema, &data, &declared, PrivacyNotion::PureDP, &ExactAggregation).is_ok());

    let off = Query::new(vec![with_budget(0.1), with_budget(0.2000001)]);
    let err = compile_and_run(&off, &schema, &data, &declared, PrivacyNotion::PureDP, &ExactAggregation)
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Structural(StructuralError::BudgetMismatch { .. })
    ));
}

#[test]
fn bad_cell_aborts_the_measurement() {
    let (schema, _) = people();
    let data = Dataset::new(vec![
        ["a", "1", "10"].into_iter().collect::<Row>(),
        ["b", "unknown", "20"].into_iter().collect::<Row>(),
    ]);
    let query = query(r#"[{"sum": {"column": "age"}}]"#);
    let err = compile_and_run(
        &query,
        &schema,
        &data,
        &Budget::pure(1.0),
        PrivacyNotion::PureDP,
        &ExactAggregation,
    )
    .unwrap_err();
    assert!(err.is_data());
}

#[test]
fn noisy_library_is_deterministic_under_a_seed() {
    let (schema, data) = people();
    let query = query(r#"[{"bin": {"age": [0, 25, 50, 75, 100]}}, {"mean": {"column": "income", "mech": "Laplace"}}]"#);
    let run = || {
        compile_and_run(
            &query,
            &schema,
            &data,
            &Budget::pure(2.0),
            PrivacyNotion::PureDP,
            &NoisyAggregation::new([42; 32]),
        )
        .unwrap()
    };
    let first = run();
    assert_eq!(first.rows.len(), 4);
    assert_eq!(first, run());
    for row in &first.rows {
        assert!((0.0..=1_000.0).contains(&row["mean"]));
    }
}
