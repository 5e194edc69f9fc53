use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    aggregation::{AggregationLibrary, AggregationOptions, NoiseMechanism},
    budget::Budget,
    compiler::{ExecutionPlan, PlannedSubQuery},
    dataset::{Dataset, Row},
    errors::Result,
    schema::{ColumnRef, Schema},
    step::{BinKey, BinStep, FilterStep, MeasurementKind, MeasurementStep, QueryStep, ValueType},
};

/// Number of quantile values emitted per quantile measurement, at
/// probabilities 0.01 through 0.99.
pub const QUANTILE_POINTS: usize = 99;

pub type ResultRow = BTreeMap<String, f64>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
}

/// Rows that fell into one bin interval.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition<'d> {
    pub key: BinKey,
    pub rows: Vec<&'d Row>,
}

/// Runs compiled plans against an in-memory dataset. Sub-queries run in plan
/// order, each starting from the full dataset.
pub struct Executor<'a> {
    schema: &'a Schema,
    library: &'a dyn AggregationLibrary,
}

impl<'a> Executor<'a> {
    pub fn new(schema: &'a Schema, library: &'a dyn AggregationLibrary) -> Self {
        Self { schema, library }
    }

    pub fn run(&self, plan: &ExecutionPlan<'_>, dataset: &Dataset) -> Result<QueryResult> {
        let mut result = QueryResult::default();
        for (index, sub_query) in plan.sub_queries.iter().enumerate() {
            debug!(
                sub_query = index,
                steps = sub_query.steps.len(),
                epsilon = sub_query.budget.epsilon,
                "executing sub-query"
            );
            self.run_sub_query(sub_query, dataset.rows(), &mut result.rows)?;
        }
        Ok(result)
    }

    pub fn run_sub_query(
        &self,
        sub_query: &PlannedSubQuery<'_>,
        data: &[Row],
        out: &mut Vec<ResultRow>,
    ) -> Result<()> {
        let mut rows: Vec<&Row> = data.iter().collect();
        let mut bins: Option<Vec<Partition<'_>>> = None;

        for step in sub_query.steps {
            match step {
                QueryStep::Filter(filter) => rows = self.filter(filter, rows)?,
                QueryStep::Bin(bin) => bins = Some(self.bin(bin, &rows)?),
                QueryStep::Measurement(measurement) => {
                    self.measure(measurement, &sub_query.budget, &rows, bins.as_deref(), out)?
                }
            }
        }
        Ok(())
    }

    /// Applies predicates left to right; each one narrows the previous result.
    pub fn filter<'d>(&self, filter: &FilterStep, mut rows: Vec<&'d Row>) -> Result<Vec<&'d Row>> {
        for predicate in &filter.predicates {
            let column = self.schema.resolve(&predicate.column)?;
            let mut kept = Vec::with_capacity(rows.len());
            match predicate.value_type {
                ValueType::Number => {
                    let literal = predicate.number()?;
                    for row in rows {
                        if predicate.operator.compare(&row.numeric(&column)?, &literal) {
                            kept.push(row);
                        }
                    }
                }
                ValueType::String => {
                    for row in rows {
                        if predicate.operator.compare(row.cell(&column)?, predicate.literal.as_str()) {
                            kept.push(row);
                        }
                    }
                }
            }
            trace!(predicate = %predicate, kept = kept.len(), "applied predicate");
            rows = kept;
        }
        Ok(rows)
    }

    /// Assigns each row to the first interval containing it. Rows outside
    /// every interval are dropped.
    pub fn bin<'d>(&self, bin: &BinStep, rows: &[&'d Row]) -> Result<Vec<Partition<'d>>> {
        let column = self.schema.resolve(&bin.column)?;
        column.require_numeric("bin")?;
        bin.validate()?;

        let mut partitions: Vec<Partition<'d>> = bin
            .intervals()
            .into_iter()
            .map(|key| Partition { key, rows: Vec::new() })
            .collect();
        let mut dropped = 0usize;
        for &row in rows {
            let value = row.numeric(&column)?;
            match partitions.iter_mut().find(|p| p.key.contains(value)) {
                Some(partition) => partition.rows.push(row),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!(column = %bin.column, dropped, "rows outside every bin were dropped");
        }
        Ok(partitions)
    }

    fn measure(
        &self,
        step: &MeasurementStep,
        budget: &Budget,
        rows: &[&Row],
        bins: Option<&[Partition<'_>]>,
        out: &mut Vec<ResultRow>,
    ) -> Result<()> {
        let column = self.schema.resolve(&step.column)?;
        let bounds = if step.kind.requires_numeric() {
            column.require_numeric(step.kind.as_str())?
        } else {
            column.column.ty.bounds().unwrap_or((0.0, 0.0))
        };
        let noise = NoiseMechanism::from_name(step.mechanism.as_deref());

        let Some(partitions) = bins else {
            let options = AggregationOptions::new(bounds, budget, noise);
            let row = self.aggregate(step, &column, rows, options, None)?;
            out.push(row);
            return Ok(());
        };

        let share = budget.split(partitions.len());
        let options = AggregationOptions::new(bounds, &share, noise);
        for partition in partitions {
            let row = self.aggregate(step, &column, &partition.rows, options, Some(partition.key))?;
            out.push(row);
        }
        Ok(())
    }

    fn aggregate(
        &self,
        step: &MeasurementStep,
        column: &ColumnRef<'_>,
        rows: &[&Row],
        options: AggregationOptions,
        bin: Option<BinKey>,
    ) -> Result<ResultRow> {
        let mut row = ResultRow::new();
        if let Some(key) = bin {
            row.insert(format!("{}_binned", step.column), key.high_exclusive as f64);
        }

        let Some(kind) = step.kind.scalar_kind() else {
            let mut quantiles = self.library.quantiles(options)?;
            for record in rows {
                quantiles.add(record.numeric(column)?);
            }
            for index in 0..QUANTILE_POINTS {
                let probability = (index + 1) as f64 / 100.0;
                row.insert(
                    format!("{index}_{}_{}", step.kind, step.column),
                    quantiles.result(probability)?,
                );
            }
            return Ok(row);
        };

        let mut aggregator = self.library.scalar(kind, options)?;
        if step.kind == MeasurementKind::Count {
            aggregator.increment_by(rows.len() as u64);
        } else {
            for record in rows {
                aggregator.add(record.numeric(column)?);
            }
        }
        let value = aggregator.result()?;
        let key = match bin {
            Some(_) => step.kind.as_str().to_owned(),
            None => format!("{}_{}", step.column, step.kind),
        };
        row.insert(key, value);
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregation::{
            AggregationError, Aggregator, ExactAggregation, QuantileAggregator, ScalarKind,
        },
        budget::PrivacyNotion,
        compiler::compile,
        errors::{DataError, QueryError, StructuralError},
        schema::Column,
        step::Query,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Exact statistics that remember the options every aggregator was
    /// built with.
    #[derive(Default)]
    struct RecordingAggregation {
        seen: Mutex<Vec<AggregationOptions>>,
    }

    impl RecordingAggregation {
        fn budgets(&self) -> Vec<(f64, f64)> {
            self.seen.lock().iter().map(|o| (o.epsilon, o.delta)).collect()
        }
    }

    impl AggregationLibrary for RecordingAggregation {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn scalar(
            &self,
            kind: ScalarKind,
            options: AggregationOptions,
        ) -> Result<Box<dyn Aggregator>, AggregationError> {
            self.seen.lock().push(options);
            ExactAggregation.scalar(kind, options)
        }

        fn quantiles(
            &self,
            options: AggregationOptions,
        ) -> Result<Box<dyn QuantileAggregator>, AggregationError> {
            self.seen.lock().push(options);
            ExactAggregation.quantiles(options)
        }
    }

    fn assert_budgets(actual: Vec<(f64, f64)>, expected: &[(f64, f64)]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?}");
        for ((eps, delta), (want_eps, want_delta)) in actual.iter().zip(expected) {
            assert!((eps - want_eps).abs() < 1e-12, "epsilon {eps} != {want_eps}");
            assert!((delta - want_delta).abs() < 1e-15, "delta {delta} != {want_delta}");
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Column::text("name"),
            Column::int("age", 0, 100),
            Column::text("city"),
        ])
        .unwrap()
    }

    fn dataset() -> Dataset {
        Dataset::new(
            (0..20)
                .map(|age| {
                    let city = if age % 2 == 0 { "Oslo" } else { "Bergen" };
                    [format!("p{age}"), age.to_string(), city.to_string()]
                        .into_iter()
                        .collect::<Row>()
                })
                .collect(),
        )
    }

    fn filter(predicates: &[&str]) -> FilterStep {
        match QueryStep::filter(predicates).unwrap() {
            QueryStep::Filter(filter) => filter,
            other => panic!("not a filter: {other:?}"),
        }
    }

    #[test]
    fn filter_conjunction_is_order_independent_and_idempotent() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let all: Vec<&Row> = data.rows().iter().collect();

        let ab = executor.filter(&filter(&["age >= 4", "city == Oslo"]), all.clone()).unwrap();
        let ba = executor.filter(&filter(&["city == Oslo", "age >= 4"]), all.clone()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 8);

        let again = executor.filter(&filter(&["age >= 4", "city == Oslo"]), ab.clone()).unwrap();
        assert_eq!(again, ab);
    }

    #[test]
    fn numeric_filter_on_text_data_is_a_data_error() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let err = executor
            .filter(&filter(&["city < 3"]), data.rows().iter().collect())
            .unwrap_err();
        assert!(matches!(err, QueryError::Data(DataError::NotNumeric { .. })));
    }

    #[test]
    fn bins_partition_values_exclusively() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let rows: Vec<&Row> = data.rows().iter().collect();
        let QueryStep::Bin(bin) = QueryStep::bin("age", vec![0, 10, 20]) else {
            unreachable!()
        };
        let partitions = executor.bin(&bin, &rows).unwrap();
        assert_eq!(partitions.len(), 2);
        let ages = |p: &Partition<'_>| -> Vec<String> { p.rows.iter().map(|r| r.0[1].clone()).collect() };
        assert_eq!(ages(&partitions[0]), (0..10).map(|a| a.to_string()).collect::<Vec<_>>());
        assert_eq!(ages(&partitions[1]), (10..20).map(|a| a.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn rows_outside_bins_are_dropped() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let rows: Vec<&Row> = data.rows().iter().collect();
        let QueryStep::Bin(bin) = QueryStep::bin("age", vec![5, 8]) else {
            unreachable!()
        };
        let partitions = executor.bin(&bin, &rows).unwrap();
        assert_eq!(partitions[0].rows.len(), 3);
    }

    #[test]
    fn bin_on_text_column_is_structural() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let QueryStep::Bin(bin) = QueryStep::bin("city", vec![0, 1]) else {
            unreachable!()
        };
        let err = executor.bin(&bin, &[]).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Structural(StructuralError::IneligibleColumn { .. })
        ));
    }

    #[test]
    fn binned_measurement_emits_one_row_per_interval() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let steps = vec![
            QueryStep::bin("age", vec![0, 5, 20]),
            QueryStep::measure(MeasurementKind::Sum, "age"),
        ];
        let sub_query = PlannedSubQuery {
            steps: &steps,
            budget: Budget::pure(1.0),
        };
        let mut out = Vec::new();
        executor.run_sub_query(&sub_query, data.rows(), &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                ResultRow::from([("age_binned".to_string(), 5.0), ("sum".to_string(), 10.0)]),
                ResultRow::from([("age_binned".to_string(), 20.0), ("sum".to_string(), 180.0)]),
            ]
        );
    }

    #[test]
    fn quantiles_emit_ninety_nine_keys() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let data = dataset();
        let steps = vec![QueryStep::measure(MeasurementKind::Quantile, "age")];
        let sub_query = PlannedSubQuery {
            steps: &steps,
            budget: Budget::pure(1.0),
        };
        let mut out = Vec::new();
        executor.run_sub_query(&sub_query, data.rows(), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), QUANTILE_POINTS);
        assert_eq!(out[0]["0_quantile_age"], 0.0);
        assert_eq!(out[0]["49_quantile_age"], 9.0);
        assert_eq!(out[0]["98_quantile_age"], 19.0);
    }

    #[test]
    fn numeric_measurement_rejects_text_column() {
        let schema = schema();
        let executor = Executor::new(&schema, &ExactAggregation);
        let steps = vec![QueryStep::measure(MeasurementKind::Mean, "name")];
        let sub_query = PlannedSubQuery {
            steps: &steps,
            budget: Budget::pure(1.0),
        };
        let err = executor.run_sub_query(&sub_query, &[], &mut Vec::new()).unwrap_err();
        assert!(err.is_structural());

        let count = vec![QueryStep::measure(MeasurementKind::Count, "name")];
        let sub_query = PlannedSubQuery {
            steps: &count,
            budget: Budget::pure(1.0),
        };
        let mut out = Vec::new();
        executor.run_sub_query(&sub_query, dataset().rows(), &mut out).unwrap();
        assert_eq!(out[0]["name_count"], 20.0);
    }

    #[test]
    fn binned_measurement_divides_its_budget_across_bins() {
        let schema = schema();
        let library = RecordingAggregation::default();
        let executor = Executor::new(&schema, &library);
        let steps = vec![
            QueryStep::bin("age", vec![0, 5, 10, 20]),
            QueryStep::measure(MeasurementKind::Count, "age"),
        ];
        let sub_query = PlannedSubQuery {
            steps: &steps,
            budget: Budget::approx(0.6, 3e-6),
        };
        let mut out = Vec::new();
        executor.run_sub_query(&sub_query, dataset().rows(), &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_budgets(library.budgets(), &[(0.2, 1e-6); 3]);
    }

    #[test]
    fn implicit_budget_reaches_each_measurement_evenly() {
        let schema = schema();
        let library = RecordingAggregation::default();
        let query = Query::new(vec![
            QueryStep::measure(MeasurementKind::Count, "age"),
            QueryStep::filter(["age < 10"]).unwrap(),
            QueryStep::measure(MeasurementKind::Quantile, "age"),
            QueryStep::bin("age", vec![0, 10, 20]),
            QueryStep::measure(MeasurementKind::Sum, "age"),
        ]);
        let plan = compile(&query, &Budget::approx(0.9, 3e-6), PrivacyNotion::ApproxDP).unwrap();
        Executor::new(&schema, &library).run(&plan, &dataset()).unwrap();
        assert_budgets(
            library.budgets(),
            &[(0.3, 1e-6), (0.3, 1e-6), (0.15, 5e-7), (0.15, 5e-7)],
        );
    }

    #[test]
    fn explicit_step_budgets_are_used_as_given() {
        let schema = schema();
        let library = RecordingAggregation::default();
        let measure = |kind, epsilon| {
            let step = MeasurementStep::new(kind, "age").with_budget(Budget::pure(epsilon));
            QueryStep::Measurement(step)
        };
        let query = Query::new(vec![
            measure(MeasurementKind::Count, 0.2),
            QueryStep::bin("age", vec![0, 10, 20]),
            measure(MeasurementKind::Mean, 0.8),
        ]);
        let plan = compile(&query, &Budget::pure(1.0), PrivacyNotion::PureDP).unwrap();
        Executor::new(&schema, &library).run(&plan, &dataset()).unwrap();
        assert_budgets(library.budgets(), &[(0.2, 0.0), (0.4, 0.0), (0.4, 0.0)]);
    }
}
