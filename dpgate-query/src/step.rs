//! Query steps and their JSON wire shape.
//!
//! A step travels as a single-key object, e.g. `{"filter": ["age < 10"]}`,
//! `{"bin": {"age": [0, 50, 100]}}` or `{"count": {"column": "age"}}`.
//! Deserialization goes through [`WireStep`] and then into the typed
//! [`QueryStep`], so malformed predicates and bin maps are rejected before a
//! query ever reaches the compiler.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{aggregation::ScalarKind, budget::Budget, errors::StructuralError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl ComparisonOperator {
    pub fn parse(raw: &str) -> Result<Self, StructuralError> {
        match raw {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            other => Err(StructuralError::UnsupportedOperator(other.to_owned())),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }

    pub fn compare<T: PartialOrd + ?Sized>(&self, lhs: &T, rhs: &T) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
}

/// `column operator literal`, e.g. `age >= 18` or `city != Oslo`.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub operator: ComparisonOperator,
    pub value_type: ValueType,
    pub literal: String,
}

impl Predicate {
    pub fn parse(raw: &str) -> Result<Self, StructuralError> {
        let malformed = || StructuralError::MalformedPredicate(raw.to_owned());
        let (column, rest) = raw.trim().split_once(char::is_whitespace).ok_or_else(malformed)?;
        let (operator, literal) = rest
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or_else(malformed)?;
        let literal = literal.trim();
        if literal.is_empty() {
            return Err(malformed());
        }

        let operator = ComparisonOperator::parse(operator)?;
        let value_type = match literal.parse::<f64>() {
            Ok(number) if number.is_finite() => ValueType::Number,
            _ => ValueType::String,
        };
        Self::new(column, operator, value_type, literal)
    }

    pub fn new(
        column: impl Into<String>,
        operator: ComparisonOperator,
        value_type: ValueType,
        literal: impl Into<String>,
    ) -> Result<Self, StructuralError> {
        if value_type == ValueType::String && operator.is_ordering() {
            return Err(StructuralError::StringOrdering(operator.symbol()));
        }
        Ok(Self {
            column: column.into(),
            operator,
            value_type,
            literal: literal.into(),
        })
    }

    /// The literal as a number; only meaningful for number-typed predicates.
    pub fn number(&self) -> Result<f64, StructuralError> {
        self.literal
            .parse::<f64>()
            .map_err(|_| StructuralError::LiteralNotNumber(self.literal.clone()))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.operator, self.literal)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterStep {
    pub predicates: Vec<Predicate>,
}

/// Half-open interval `[low_inclusive, high_exclusive)` produced by a bin step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinKey {
    pub low_inclusive: i64,
    pub high_exclusive: i64,
}

impl BinKey {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low_inclusive as f64 && value < self.high_exclusive as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinStep {
    pub column: String,
    pub boundaries: Vec<i64>,
}

impl BinStep {
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.boundaries.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(StructuralError::MalformedBins(
                "bins should be unique and in ascending order".into(),
            ));
        }
        if self.boundaries.len() < 2 {
            return Err(StructuralError::MalformedBins("minimum 2 bins".into()));
        }
        Ok(())
    }

    /// Intervals in ascending order; empty when fewer than two boundaries.
    pub fn intervals(&self) -> Vec<BinKey> {
        self.boundaries
            .windows(2)
            .map(|pair| BinKey {
                low_inclusive: pair[0],
                high_exclusive: pair[1],
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Count,
    Sum,
    Mean,
    Stdev,
    Variance,
    Quantile,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 6] = [
        Self::Count,
        Self::Sum,
        Self::Mean,
        Self::Stdev,
        Self::Variance,
        Self::Quantile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Stdev => "stdev",
            Self::Variance => "variance",
            Self::Quantile => "quantile",
        }
    }

    /// Count only needs the column to exist.
    pub fn requires_numeric(&self) -> bool {
        !matches!(self, Self::Count)
    }

    /// The scalar primitive backing this kind, or `None` for quantiles.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Self::Count => Some(ScalarKind::Count),
            Self::Sum => Some(ScalarKind::Sum),
            Self::Mean => Some(ScalarKind::Mean),
            Self::Stdev => Some(ScalarKind::Stdev),
            Self::Variance => Some(ScalarKind::Variance),
            Self::Quantile => None,
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementStep {
    pub kind: MeasurementKind,
    pub column: String,
    pub mechanism: Option<String>,
    pub budget: Option<Budget>,
}

impl MeasurementStep {
    pub fn new(kind: MeasurementKind, column: impl Into<String>) -> Self {
        Self {
            kind,
            column: column.into(),
            mechanism: None,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = Some(mechanism.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepCategory {
    Transformation,
    Measurement,
}

/// Input alphabet of the shape automaton. Every measurement kind maps to the
/// same symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeSymbol {
    Filter,
    Bin,
    Measurement,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireStep", into = "WireStep")]
pub enum QueryStep {
    Filter(FilterStep),
    Bin(BinStep),
    Measurement(MeasurementStep),
}

impl QueryStep {
    pub fn filter<I, S>(predicates: I) -> Result<Self, StructuralError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let predicates = predicates
            .into_iter()
            .map(|raw| Predicate::parse(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryStep::Filter(FilterStep { predicates }))
    }

    pub fn bin(column: impl Into<String>, boundaries: Vec<i64>) -> Self {
        QueryStep::Bin(BinStep {
            column: column.into(),
            boundaries,
        })
    }

    pub fn measure(kind: MeasurementKind, column: impl Into<String>) -> Self {
        QueryStep::Measurement(MeasurementStep::new(kind, column))
    }

    pub fn category(&self) -> StepCategory {
        match self {
            QueryStep::Filter(_) | QueryStep::Bin(_) => StepCategory::Transformation,
            QueryStep::Measurement(_) => StepCategory::Measurement,
        }
    }

    pub fn symbol(&self) -> ShapeSymbol {
        match self {
            QueryStep::Filter(_) => ShapeSymbol::Filter,
            QueryStep::Bin(_) => ShapeSymbol::Bin,
            QueryStep::Measurement(_) => ShapeSymbol::Measurement,
        }
    }

    pub fn as_measurement(&self) -> Option<&MeasurementStep> {
        match self {
            QueryStep::Measurement(step) => Some(step),
            _ => None,
        }
    }

    pub fn budget(&self) -> Option<Budget> {
        self.as_measurement().and_then(|step| step.budget)
    }

    pub fn operation(&self) -> &'static str {
        match self {
            QueryStep::Filter(_) => "filter",
            QueryStep::Bin(_) => "bin",
            QueryStep::Measurement(step) => step.kind.as_str(),
        }
    }
}

/// Ordered list of steps, serialized as a plain JSON array.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query {
    pub steps: Vec<QueryStep>,
}

impl Query {
    pub fn new(steps: Vec<QueryStep>) -> Self {
        Self { steps }
    }

    pub fn measurements(&self) -> impl Iterator<Item = &MeasurementStep> {
        self.steps.iter().filter_map(QueryStep::as_measurement)
    }

    pub fn measurement_count(&self) -> usize {
        self.measurements().count()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl From<Vec<QueryStep>> for Query {
    fn from(steps: Vec<QueryStep>) -> Self {
        Self::new(steps)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMeasurement {
    column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mech: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    budget: Option<Budget>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireStep {
    Filter(Vec<String>),
    Bin(BTreeMap<String, Vec<i64>>),
    Count(WireMeasurement),
    Sum(WireMeasurement),
    Mean(WireMeasurement),
    Stdev(WireMeasurement),
    Variance(WireMeasurement),
    Quantile(WireMeasurement),
}

impl WireStep {
    fn measurement(kind: MeasurementKind, wire: WireMeasurement) -> MeasurementStep {
        MeasurementStep {
            kind,
            column: wire.column,
            mechanism: wire.mech,
            budget: wire.budget,
        }
    }
}

impl TryFrom<WireStep> for QueryStep {
    type Error = StructuralError;

    fn try_from(wire: WireStep) -> Result<Self, Self::Error> {
        let step = match wire {
            WireStep::Filter(raw) => return QueryStep::filter(raw),
            WireStep::Bin(map) => {
                if map.len() != 1 {
                    return Err(StructuralError::MalformedBins(format!(
                        "expected exactly one column, got {}",
                        map.len()
                    )));
                }
                let Some((column, boundaries)) = map.into_iter().next() else {
                    return Err(StructuralError::MalformedBins("missing column".into()));
                };
                return Ok(QueryStep::Bin(BinStep { column, boundaries }));
            }
            WireStep::Count(m) => WireStep::measurement(MeasurementKind::Count, m),
            WireStep::Sum(m) => WireStep::measurement(MeasurementKind::Sum, m),
            WireStep::Mean(m) => WireStep::measurement(MeasurementKind::Mean, m),
            WireStep::Stdev(m) => WireStep::measurement(MeasurementKind::Stdev, m),
            WireStep::Variance(m) => WireStep::measurement(MeasurementKind::Variance, m),
            WireStep::Quantile(m) => WireStep::measurement(MeasurementKind::Quantile, m),
        };
        Ok(QueryStep::Measurement(step))
    }
}

impl From<QueryStep> for WireStep {
    fn from(step: QueryStep) -> Self {
        match step {
            QueryStep::Filter(filter) => {
                WireStep::Filter(filter.predicates.iter().map(ToString::to_string).collect())
            }
            QueryStep::Bin(bin) => WireStep::Bin(BTreeMap::from([(bin.column, bin.boundaries)])),
            QueryStep::Measurement(m) => {
                let wire = WireMeasurement {
                    column: m.column,
                    mech: m.mechanism,
                    budget: m.budget,
                };
                match m.kind {
                    MeasurementKind::Count => WireStep::Count(wire),
                    MeasurementKind::Sum => WireStep::Sum(wire),
                    MeasurementKind::Mean => WireStep::Mean(wire),
                    MeasurementKind::Stdev => WireStep::Stdev(wire),
                    MeasurementKind::Variance => WireStep::Variance(wire),
                    MeasurementKind::Quantile => WireStep::Quantile(wire),
                }
            }
        }
    }
}
