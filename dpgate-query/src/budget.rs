use std::{
    fmt,
    iter::Sum,
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal digits kept when comparing budgets. Repeated division and
/// addition of epsilon shares drifts in the last bits; comparisons are made
/// on values rounded to this precision.
pub const ROUNDING_DIGITS: i32 = 10;

pub fn round_to(value: f64, digits: i32) -> f64 {
    let ratio = 10f64.powi(digits);
    (value * ratio).round() / ratio
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivacyNotion {
    /// Delta is always absent (or zero).
    PureDP,
    /// Delta must be present and non-negative.
    ApproxDP,
}

impl PrivacyNotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyNotion::PureDP => "PureDP",
            PrivacyNotion::ApproxDP => "ApproxDP",
        }
    }
}

impl fmt::Display for PrivacyNotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BudgetFormatError {
    #[error("epsilon must be positive: {0}")]
    Epsilon(Budget),
    #[error("delta can't be negative: {0}")]
    Delta(Budget),
    #[error("{notion} budget incorrectly formatted: {budget}")]
    Notion {
        notion: PrivacyNotion,
        budget: Budget,
    },
}

/// An (epsilon, delta) privacy-loss budget.
///
/// Budgets add component-wise and compare component-wise. An absent delta
/// counts as zero in arithmetic; a sum keeps delta absent only when every
/// operand left it absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub epsilon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
}

impl Budget {
    pub const fn new(epsilon: f64, delta: Option<f64>) -> Self {
        Self { epsilon, delta }
    }

    pub const fn pure(epsilon: f64) -> Self {
        Self {
            epsilon,
            delta: None,
        }
    }

    pub const fn approx(epsilon: f64, delta: f64) -> Self {
        Self {
            epsilon,
            delta: Some(delta),
        }
    }

    pub const fn zero() -> Self {
        Self {
            epsilon: 0.0,
            delta: None,
        }
    }

    pub fn delta_or_zero(&self) -> f64 {
        self.delta.unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), BudgetFormatError> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(BudgetFormatError::Epsilon(*self));
        }
        match self.delta {
            Some(delta) if !delta.is_finite() || delta < 0.0 => {
                Err(BudgetFormatError::Delta(*self))
            }
            _ => Ok(()),
        }
    }

    pub fn validate_for(&self, notion: PrivacyNotion) -> Result<(), BudgetFormatError> {
        self.validate()?;
        let well_formed = match notion {
            PrivacyNotion::PureDP => self.delta_or_zero() == 0.0,
            PrivacyNotion::ApproxDP => self.delta.is_some(),
        };
        if well_formed {
            Ok(())
        } else {
            Err(BudgetFormatError::Notion {
                notion,
                budget: *self,
            })
        }
    }

    /// Divides both components evenly across `parts` shares.
    pub fn split(&self, parts: usize) -> Budget {
        let parts = parts.max(1) as f64;
        Budget {
            epsilon: self.epsilon / parts,
            delta: self.delta.map(|delta| delta / parts),
        }
    }

    pub fn rounded(&self) -> Budget {
        Budget {
            epsilon: round_to(self.epsilon, ROUNDING_DIGITS),
            delta: self.delta.map(|delta| round_to(delta, ROUNDING_DIGITS)),
        }
    }

    /// Component-wise `self <= other` after rounding.
    pub fn fits_within(&self, other: &Budget) -> bool {
        let lhs = self.rounded();
        let rhs = other.rounded();
        lhs.epsilon <= rhs.epsilon && lhs.delta_or_zero() <= rhs.delta_or_zero()
    }

    /// What is left of `self` after `consumed`, floored at zero.
    pub fn remaining(&self, consumed: &Budget) -> Budget {
        let left = *self - *consumed;
        Budget {
            epsilon: left.epsilon.max(0.0),
            delta: left.delta.map(|delta| delta.max(0.0)),
        }
    }

    /// Component-wise equality after rounding.
    pub fn approx_eq(&self, other: &Budget) -> bool {
        let lhs = self.rounded();
        let rhs = other.rounded();
        lhs.epsilon == rhs.epsilon && lhs.delta_or_zero() == rhs.delta_or_zero()
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.epsilon, self.delta_or_zero())
    }
}

fn combine_delta(lhs: Option<f64>, rhs: Option<f64>, op: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (lhs, rhs) {
        (None, None) => None,
        (lhs, rhs) => Some(op(lhs.unwrap_or(0.0), rhs.unwrap_or(0.0))),
    }
}

impl Add for Budget {
    type Output = Budget;

    fn add(self, rhs: Budget) -> Budget {
        Budget {
            epsilon: self.epsilon + rhs.epsilon,
            delta: combine_delta(self.delta, rhs.delta, |a, b| a + b),
        }
    }
}

impl Sub for Budget {
    type Output = Budget;

    fn sub(self, rhs: Budget) -> Budget {
        Budget {
            epsilon: round_to(self.epsilon, ROUNDING_DIGITS) - round_to(rhs.epsilon, ROUNDING_DIGITS),
            delta: combine_delta(self.delta, rhs.delta, |a, b| {
                round_to(a, ROUNDING_DIGITS) - round_to(b, ROUNDING_DIGITS)
            }),
        }
    }
}

impl Sum for Budget {
    fn sum<I: Iterator<Item = Budget>>(iter: I) -> Budget {
        iter.fold(Budget::zero(), |acc, budget| acc + budget)
    }
}

impl<'a> Sum<&'a Budget> for Budget {
    fn sum<I: Iterator<Item = &'a Budget>>(iter: I) -> Budget {
        iter.copied().sum()
    }
}
