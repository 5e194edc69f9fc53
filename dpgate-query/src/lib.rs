//! Differentially private query compilation and execution.
//!
//! A query is an ordered list of steps (`filter`, `bin`, and one of the
//! measurements). The compiler cuts it into sub-queries of the shape
//! `[filter] [bin] measurement`, resolves the privacy budget each measurement
//! runs with, and the executor evaluates every sub-query against an
//! in-memory dataset through a pluggable aggregation library.

pub mod aggregation;
pub mod budget;
pub mod compiler;
pub mod dataset;
pub mod errors;
pub mod executor;
pub mod request;
pub mod schema;
pub mod shape;
pub mod step;

pub use crate::aggregation::{
    AggregationError, AggregationLibrary, AggregationOptions, ExactAggregation, NoiseMechanism,
    NoisyAggregation,
};
pub use crate::budget::{Budget, PrivacyNotion};
pub use crate::compiler::{compile, BudgetMode, ExecutionPlan};
pub use crate::dataset::{Dataset, Row};
pub use crate::errors::{DataError, QueryError, StructuralError};
pub use crate::executor::{Executor, QueryResult, ResultRow};
pub use crate::request::{AccuracyRequest, DatasetId, EvaluateRequest, ValidateResponse};
pub use crate::schema::{Column, ColumnType, Schema};
pub use crate::shape::{ShapeState, ShapeValidator};
pub use crate::step::{MeasurementKind, Query, QueryStep};

/// Compiles `query` and runs it against `dataset` in one go.
pub fn compile_and_run(
    query: &Query,
    schema: &Schema,
    dataset: &Dataset,
    declared: &Budget,
    notion: PrivacyNotion,
    library: &dyn AggregationLibrary,
) -> errors::Result<QueryResult> {
    let plan = compile(query, declared, notion)?;
    Executor::new(schema, library).run(&plan, dataset)
}
