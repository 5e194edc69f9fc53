use thiserror::Error;

use crate::{
    aggregation::AggregationError,
    budget::{Budget, BudgetFormatError},
    shape::ShapeState,
};

pub type Result<T, E = QueryError> = std::result::Result<T, E>;

/// The query itself is malformed. Always surfaced to the caller unmodified.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StructuralError {
    #[error("query is not well formed, expected `[filter] [bin] measurement` repeated one or more times (sub-query {index} ended in {state:?})")]
    MalformedShape { index: usize, state: ShapeState },
    #[error("query has no steps")]
    EmptyQuery,
    #[error("unknown query step `{0}`")]
    UnknownStep(String),
    #[error("column with name {0} not in schema")]
    UnknownColumn(String),
    #[error("column {0} appears more than once in schema")]
    DuplicateColumn(String),
    #[error("can't do {operation} on column {column}, column type {type_name} is not a number")]
    IneligibleColumn {
        column: String,
        operation: &'static str,
        type_name: &'static str,
    },
    #[error("bins not well formatted, {0}")]
    MalformedBins(String),
    #[error("malformed filter predicate `{0}`, expected `column operator value`")]
    MalformedPredicate(String),
    #[error("{0} not supported")]
    UnsupportedOperator(String),
    #[error("can't use {0} operator on string")]
    StringOrdering(&'static str),
    #[error("provided value not a number {0}")]
    LiteralNotNumber(String),
    #[error("every measurement must carry a budget or none may ({with_budget} of {measurements} do)")]
    PartialBudgets {
        with_budget: usize,
        measurements: usize,
    },
    #[error("query budgets don't add up to the given total budget: measurements sum to {sum}, declared {declared}")]
    BudgetMismatch { sum: Budget, declared: Budget },
    #[error(transparent)]
    InvalidBudget(#[from] BudgetFormatError),
}

/// A stored cell did not parse under the column's declared type.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DataError {
    #[error("type mismatch, error in data: `{value}` in column {column} is not a number")]
    NotNumeric { column: String, value: String },
    #[error("error in data: row has {width} cells but column {column} is at index {index}")]
    MissingCell {
        column: String,
        index: usize,
        width: usize,
    },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl QueryError {
    pub fn is_structural(&self) -> bool {
        matches!(self, QueryError::Structural(_))
    }

    pub fn is_data(&self) -> bool {
        matches!(self, QueryError::Data(_))
    }
}

impl From<BudgetFormatError> for QueryError {
    fn from(err: BudgetFormatError) -> Self {
        QueryError::Structural(err.into())
    }
}
