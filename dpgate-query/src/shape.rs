use serde::{Deserialize, Serialize};

use crate::{
    errors::StructuralError,
    step::{QueryStep, ShapeSymbol},
};

/// States of the sub-query shape automaton. `Reject` is absorbing and
/// `Accept` is the only final state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeState {
    #[default]
    Start,
    AfterFilter,
    AfterBin,
    Accept,
    Reject,
}

impl ShapeState {
    pub fn next(self, symbol: ShapeSymbol) -> ShapeState {
        use ShapeState::*;
        use ShapeSymbol as S;
        match (self, symbol) {
            (Start, S::Filter) => AfterFilter,
            (Start, S::Bin) | (AfterFilter, S::Bin) => AfterBin,
            (Start | AfterFilter | AfterBin, S::Measurement) => Accept,
            (AfterFilter, S::Filter) | (AfterBin, S::Filter | S::Bin) => Reject,
            (Accept, _) | (Reject, _) => Reject,
        }
    }

    pub fn is_final(self) -> bool {
        self == ShapeState::Accept
    }
}

/// Deterministic automaton over one sub-query's step symbols. Reset it
/// between sub-queries.
#[derive(Clone, Debug, Default)]
pub struct ShapeValidator {
    state: ShapeState,
}

impl ShapeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = ShapeState::Start;
    }

    pub fn state(&self) -> ShapeState {
        self.state
    }

    pub fn input(&mut self, symbol: ShapeSymbol) -> ShapeState {
        self.state = self.state.next(symbol);
        self.state
    }

    pub fn accepts(&self) -> bool {
        self.state.is_final()
    }

    /// Feeds every symbol and reports whether the run ended in `Accept`.
    pub fn verify_inputs<I>(&mut self, symbols: I) -> bool
    where
        I: IntoIterator<Item = ShapeSymbol>,
    {
        for symbol in symbols {
            self.input(symbol);
        }
        self.accepts()
    }
}

/// Checks every sub-query against `[filter] [bin] measurement`.
pub fn validate_shape(sub_queries: &[&[QueryStep]]) -> Result<(), StructuralError> {
    if sub_queries.is_empty() {
        return Err(StructuralError::EmptyQuery);
    }
    let mut validator = ShapeValidator::new();
    for (index, steps) in sub_queries.iter().enumerate() {
        validator.reset();
        if !validator.verify_inputs(steps.iter().map(QueryStep::symbol)) {
            return Err(StructuralError::MalformedShape {
                index,
                state: validator.state(),
            });
        }
    }
    Ok(())
}
