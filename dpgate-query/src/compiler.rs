//! Splits a query into sub-queries, validates their shape and resolves the
//! budget every measurement runs with.

use tracing::debug;

use crate::{
    budget::{Budget, PrivacyNotion},
    errors::StructuralError,
    shape::validate_shape,
    step::{Query, QueryStep},
};

/// How per-measurement budgets were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetMode {
    /// Every measurement carried its own budget and they sum to the total.
    Explicit,
    /// No measurement carried a budget; the total is split evenly.
    Implicit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedSubQuery<'q> {
    pub steps: &'q [QueryStep],
    pub budget: Budget,
}

impl PlannedSubQuery<'_> {
    /// The terminal measurement. Present for every planned sub-query.
    pub fn measurement(&self) -> Option<&QueryStep> {
        self.steps.last()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan<'q> {
    pub mode: BudgetMode,
    pub sub_queries: Vec<PlannedSubQuery<'q>>,
}

/// Cuts after every measurement. Trailing transformations form a final
/// sub-query of their own, which shape validation then rejects.
pub fn split_into_sub_queries(steps: &[QueryStep]) -> Vec<&[QueryStep]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, step) in steps.iter().enumerate() {
        if step.as_measurement().is_some() {
            out.push(&steps[start..=idx]);
            start = idx + 1;
        }
    }
    if start < steps.len() {
        out.push(&steps[start..]);
    }
    out
}

/// Resolves one budget per measurement, in query order.
pub fn resolve_budgets(
    query: &Query,
    declared: &Budget,
    notion: PrivacyNotion,
) -> Result<(BudgetMode, Vec<Budget>), StructuralError> {
    declared.validate_for(notion)?;

    let measurements: Vec<_> = query.measurements().collect();
    let explicit: Vec<Budget> = measurements.iter().filter_map(|m| m.budget).collect();

    if explicit.is_empty() {
        let share = declared.split(measurements.len());
        return Ok((BudgetMode::Implicit, vec![share; measurements.len()]));
    }
    if explicit.len() != measurements.len() {
        return Err(StructuralError::PartialBudgets {
            with_budget: explicit.len(),
            measurements: measurements.len(),
        });
    }

    for budget in &explicit {
        budget.validate_for(notion)?;
    }
    let sum: Budget = explicit.iter().sum();
    if !sum.approx_eq(declared) {
        return Err(StructuralError::BudgetMismatch {
            sum,
            declared: *declared,
        });
    }
    Ok((BudgetMode::Explicit, explicit))
}

/// Shape first, then budgets.
pub fn compile<'q>(
    query: &'q Query,
    declared: &Budget,
    notion: PrivacyNotion,
) -> Result<ExecutionPlan<'q>, StructuralError> {
    let sub_queries = split_into_sub_queries(&query.steps);
    validate_shape(&sub_queries)?;
    let (mode, budgets) = resolve_budgets(query, declared, notion)?;
    debug!(
        sub_queries = sub_queries.len(),
        mode = ?mode,
        "compiled query plan"
    );

    // Shape validation guarantees one measurement per sub-query, in order.
    let sub_queries = sub_queries
        .into_iter()
        .zip(budgets)
        .map(|(steps, budget)| PlannedSubQuery { steps, budget })
        .collect();
    Ok(ExecutionPlan { mode, sub_queries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{MeasurementKind, MeasurementStep};
    use pretty_assertions::assert_eq;

    fn count(budget: Option<Budget>) -> QueryStep {
        let step = MeasurementStep::new(MeasurementKind::Count, "age");
        QueryStep::Measurement(match budget {
            Some(budget) => step.with_budget(budget),
            None => step,
        })
    }

    fn filter() -> QueryStep {
        QueryStep::filter(["age < 10"]).unwrap()
    }

    #[test]
    fn splits_after_each_measurement() {
        let steps = vec![filter(), count(None), count(None), filter()];
        let parts = split_into_sub_queries(&steps);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 1);
        assert_eq!(parts[2].len(), 1);
    }

    #[test]
    fn trailing_transformation_fails_shape() {
        let query = Query::new(vec![count(None), filter()]);
        let err = compile(&query, &Budget::pure(1.0), PrivacyNotion::PureDP).unwrap_err();
        assert!(matches!(err, StructuralError::MalformedShape { index: 1, .. }));
    }

    #[test]
    fn implicit_budget_is_split_evenly() {
        let query = Query::new(vec![filter(), count(None), count(None), count(None)]);
        let plan = compile(&query, &Budget::approx(0.9, 3e-6), PrivacyNotion::ApproxDP).unwrap();
        assert_eq!(plan.mode, BudgetMode::Implicit);
        assert_eq!(plan.sub_queries.len(), 3);
        let total: Budget = plan.sub_queries.iter().map(|sq| sq.budget).sum();
        assert!((total.epsilon - 0.9).abs() < 1e-10);
        assert!(plan.sub_queries[0].budget.approx_eq(&Budget::approx(0.3, 1e-6)));
    }

    #[test]
    fn explicit_budgets_must_sum_to_declared() {
        let query = Query::new(vec![
            count(Some(Budget::pure(0.25))),
            count(Some(Budget::pure(0.75))),
        ]);
        let plan = compile(&query, &Budget::pure(1.0), PrivacyNotion::PureDP).unwrap();
        assert_eq!(plan.mode, BudgetMode::Explicit);
        assert_eq!(plan.sub_queries[1].budget, Budget::pure(0.75));

        let err = compile(&query, &Budget::pure(1.1), PrivacyNotion::PureDP).unwrap_err();
        assert!(matches!(err, StructuralError::BudgetMismatch { .. }));
    }

    #[test]
    fn partial_budgets_are_rejected() {
        let query = Query::new(vec![count(Some(Budget::pure(0.5))), count(None)]);
        assert_eq!(
            compile(&query, &Budget::pure(0.5), PrivacyNotion::PureDP).unwrap_err(),
            StructuralError::PartialBudgets {
                with_budget: 1,
                measurements: 2
            }
        );
    }

    #[test]
    fn declared_budget_must_match_notion() {
        let query = Query::new(vec![count(None)]);
        let err = compile(&query, &Budget::pure(1.0), PrivacyNotion::ApproxDP).unwrap_err();
        assert!(matches!(err, StructuralError::InvalidBudget(_)));
    }
}
