//! Aggregation primitives the executor drives.
//!
//! The executor never computes a statistic itself. It builds
//! [`AggregationOptions`] from the column bounds and the resolved budget, asks
//! an [`AggregationLibrary`] for an aggregator, feeds it values and reads the
//! result. [`ExactAggregation`] returns the clamped statistic unchanged and is
//! what tests and dry runs use; [`NoisyAggregation`] adds Laplace or Gaussian
//! noise calibrated from the bounds and the budget.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::budget::Budget;

/// Buckets used by the noisy quantile histogram.
const QUANTILE_BUCKETS: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseMechanism {
    #[default]
    Laplace,
    Gaussian,
}

impl NoiseMechanism {
    /// Resolves a step's `mech` field. Absent means the default, an unknown
    /// name falls back to Laplace.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            None => Self::default(),
            Some("Laplace") => Self::Laplace,
            Some("Gaussian") => Self::Gaussian,
            Some(other) => {
                warn!(mechanism = other, "unknown noise mechanism, using Laplace");
                Self::Laplace
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Laplace => "Laplace",
            Self::Gaussian => "Gaussian",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("epsilon must be > 0, got {0}")]
    InvalidEpsilon(f64),
    #[error("delta must be within [0,1), got {0}")]
    InvalidDelta(f64),
    #[error("gaussian noise needs a positive delta")]
    GaussianWithoutDelta,
    #[error("invalid bounds [{lower}, {upper}]")]
    InvalidBounds { lower: f64, upper: f64 },
    #[error("probability must be within [0,1], got {0}")]
    InvalidProbability(f64),
    #[error("aggregation result already consumed")]
    AlreadyConsumed,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationOptions {
    pub lower: f64,
    pub upper: f64,
    pub max_partitions_contributed: u32,
    pub max_contributions_per_partition: u32,
    pub epsilon: f64,
    pub delta: f64,
    pub noise: NoiseMechanism,
}

impl AggregationOptions {
    pub fn new(bounds: (f64, f64), budget: &Budget, noise: NoiseMechanism) -> Self {
        Self {
            lower: bounds.0,
            upper: bounds.1,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            epsilon: budget.epsilon,
            delta: budget.delta_or_zero(),
            noise,
        }
    }

    pub fn check(&self) -> Result<(), AggregationError> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(AggregationError::InvalidEpsilon(self.epsilon));
        }
        if !self.delta.is_finite() || !(0.0..1.0).contains(&self.delta) {
            return Err(AggregationError::InvalidDelta(self.delta));
        }
        if self.noise == NoiseMechanism::Gaussian && self.delta <= 0.0 {
            return Err(AggregationError::GaussianWithoutDelta);
        }
        if !self.lower.is_finite() || !self.upper.is_finite() || self.lower > self.upper {
            return Err(AggregationError::InvalidBounds {
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }

    pub fn midpoint(&self) -> f64 {
        self.lower + (self.upper - self.lower) / 2.0
    }

    fn contributions(&self) -> f64 {
        f64::from(self.max_partitions_contributed.max(1))
            * f64::from(self.max_contributions_per_partition.max(1))
    }

    /// Same bounds and mechanism with the budget divided into `parts`.
    fn share(&self, parts: u32) -> Self {
        let parts = f64::from(parts.max(1));
        Self {
            epsilon: self.epsilon / parts,
            delta: self.delta / parts,
            ..*self
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Count,
    Sum,
    Mean,
    Variance,
    Stdev,
}

/// Incremental scalar statistic. `result` may be read once.
pub trait Aggregator: Send {
    fn add(&mut self, value: f64);
    /// Adds `count` contributions without values.
    fn increment_by(&mut self, count: u64);
    fn result(&mut self) -> Result<f64, AggregationError>;
}

/// Incremental quantile statistic; `result` may be read for any number of
/// probabilities once all values are in.
pub trait QuantileAggregator: Send {
    fn add(&mut self, value: f64);
    fn result(&mut self, probability: f64) -> Result<f64, AggregationError>;
}

pub trait AggregationLibrary: Send + Sync {
    fn name(&self) -> &'static str;

    fn scalar(
        &self,
        kind: ScalarKind,
        options: AggregationOptions,
    ) -> Result<Box<dyn Aggregator>, AggregationError>;

    fn quantiles(
        &self,
        options: AggregationOptions,
    ) -> Result<Box<dyn QuantileAggregator>, AggregationError>;
}

/// Running moments over clamped values.
#[derive(Clone, Debug, Default)]
struct Moments {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }
}

fn check_probability(probability: f64) -> Result<(), AggregationError> {
    if (0.0..=1.0).contains(&probability) {
        Ok(())
    } else {
        Err(AggregationError::InvalidProbability(probability))
    }
}

/// Identity mechanism: clamps to bounds, adds no noise.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactAggregation;

struct ExactScalar {
    kind: ScalarKind,
    options: AggregationOptions,
    moments: Moments,
    consumed: bool,
}

impl Aggregator for ExactScalar {
    fn add(&mut self, value: f64) {
        self.moments.push(self.options.clamp(value));
    }

    fn increment_by(&mut self, count: u64) {
        self.moments.count += count;
    }

    fn result(&mut self) -> Result<f64, AggregationError> {
        if std::mem::replace(&mut self.consumed, true) {
            return Err(AggregationError::AlreadyConsumed);
        }
        let Moments { count, sum, sum_sq } = self.moments;
        let n = count as f64;
        let mean = if count == 0 { self.options.midpoint() } else { sum / n };
        let variance = if count == 0 {
            0.0
        } else {
            (sum_sq / n - mean * mean).max(0.0)
        };
        Ok(match self.kind {
            ScalarKind::Count => n,
            ScalarKind::Sum => sum,
            ScalarKind::Mean => mean,
            ScalarKind::Variance => variance,
            ScalarKind::Stdev => variance.sqrt(),
        })
    }
}

struct ExactQuantiles {
    options: AggregationOptions,
    values: Vec<f64>,
    sorted: bool,
}

impl QuantileAggregator for ExactQuantiles {
    fn add(&mut self, value: f64) {
        self.values.push(self.options.clamp(value));
        self.sorted = false;
    }

    fn result(&mut self, probability: f64) -> Result<f64, AggregationError> {
        check_probability(probability)?;
        if self.values.is_empty() {
            return Ok(self.options.midpoint());
        }
        if !self.sorted {
            self.values.sort_by(f64::total_cmp);
            self.sorted = true;
        }
        // Nearest rank.
        let rank = (probability * self.values.len() as f64).ceil() as usize;
        Ok(self.values[rank.clamp(1, self.values.len()) - 1])
    }
}

impl AggregationLibrary for ExactAggregation {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn scalar(
        &self,
        kind: ScalarKind,
        options: AggregationOptions,
    ) -> Result<Box<dyn Aggregator>, AggregationError> {
        options.check()?;
        Ok(Box::new(ExactScalar {
            kind,
            options,
            moments: Moments::default(),
            consumed: false,
        }))
    }

    fn quantiles(
        &self,
        options: AggregationOptions,
    ) -> Result<Box<dyn QuantileAggregator>, AggregationError> {
        options.check()?;
        Ok(Box::new(ExactQuantiles {
            options,
            values: Vec::new(),
            sorted: true,
        }))
    }
}

/// Clamped statistics plus calibrated noise. Every aggregator draws from its
/// own ChaCha stream seeded from the library's generator, so a fixed library
/// seed reproduces a whole query.
pub struct NoisyAggregation {
    rng: Mutex<ChaCha20Rng>,
}

impl NoisyAggregation {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    fn child_rng(&self) -> ChaCha20Rng {
        let seed: [u8; 32] = self.rng.lock().gen();
        ChaCha20Rng::from_seed(seed)
    }
}

impl std::fmt::Debug for NoisyAggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoisyAggregation").finish_non_exhaustive()
    }
}

fn sample_laplace(rng: &mut ChaCha20Rng, b: f64) -> f64 {
    let u: f64 = rng.gen::<f64>() - 0.5;
    let sign = if u >= 0.0 { 1.0 } else { -1.0 };
    let magnitude = (1.0 - 2.0 * u.abs()).abs().max(1e-12);
    -b.max(1e-18) * sign * magnitude.ln()
}

/// Noise for a statistic with the given L1 (Laplace) or L2 (Gaussian)
/// sensitivity under `options`' budget.
fn noise(
    rng: &mut ChaCha20Rng,
    options: &AggregationOptions,
    sensitivity: f64,
) -> Result<f64, AggregationError> {
    match options.noise {
        NoiseMechanism::Laplace => Ok(sample_laplace(rng, sensitivity / options.epsilon)),
        NoiseMechanism::Gaussian => {
            let sigma =
                sensitivity * (2.0 * (1.25 / options.delta).ln()).sqrt() / options.epsilon;
            let normal = Normal::new(0.0, sigma.max(1e-18))
                .map_err(|_| AggregationError::InvalidDelta(options.delta))?;
            Ok(normal.sample(rng))
        }
    }
}

struct NoisyScalar {
    kind: ScalarKind,
    options: AggregationOptions,
    moments: Moments,
    rng: ChaCha20Rng,
    consumed: bool,
}

impl NoisyScalar {
    fn noisy_count(&mut self, options: &AggregationOptions) -> Result<f64, AggregationError> {
        let sensitivity = options.contributions();
        Ok((self.moments.count as f64 + noise(&mut self.rng, options, sensitivity)?).round())
    }

    /// Mean and variance computed around the midpoint of the bounds, so the
    /// sensitivity of the sums is half the bound range.
    fn centered(&mut self, parts: u32) -> Result<(f64, f64), AggregationError> {
        let share = self.options.share(parts);
        let mid = self.options.midpoint();
        let half_range = (self.options.upper - self.options.lower) / 2.0;
        let contributions = self.options.contributions();

        let count = self.noisy_count(&share)?.max(1.0);
        let centered_sum = self.moments.sum - mid * self.moments.count as f64;
        let noisy_sum =
            centered_sum + noise(&mut self.rng, &share, half_range * contributions)?;
        let mean_offset = noisy_sum / count;
        let mean = (mid + mean_offset).clamp(self.options.lower, self.options.upper);
        if parts < 3 {
            return Ok((mean, 0.0));
        }

        let n = self.moments.count as f64;
        let centered_sum_sq = self.moments.sum_sq - 2.0 * mid * self.moments.sum + mid * mid * n;
        let noisy_sum_sq = centered_sum_sq
            + noise(&mut self.rng, &share, half_range * half_range * contributions)?;
        let variance = (noisy_sum_sq / count - mean_offset * mean_offset)
            .clamp(0.0, half_range * half_range);
        Ok((mean, variance))
    }
}

impl Aggregator for NoisyScalar {
    fn add(&mut self, value: f64) {
        self.moments.push(self.options.clamp(value));
    }

    fn increment_by(&mut self, count: u64) {
        self.moments.count += count;
    }

    fn result(&mut self) -> Result<f64, AggregationError> {
        if std::mem::replace(&mut self.consumed, true) {
            return Err(AggregationError::AlreadyConsumed);
        }
        let options = self.options;
        match self.kind {
            ScalarKind::Count => self.noisy_count(&options),
            ScalarKind::Sum => {
                let sensitivity =
                    options.lower.abs().max(options.upper.abs()) * options.contributions();
                Ok(self.moments.sum + noise(&mut self.rng, &options, sensitivity)?)
            }
            ScalarKind::Mean => self.centered(2).map(|(mean, _)| mean),
            ScalarKind::Variance => self.centered(3).map(|(_, variance)| variance),
            ScalarKind::Stdev => self.centered(3).map(|(_, variance)| variance.sqrt()),
        }
    }
}

/// Quantiles read off a noisy histogram over the bounds. The histogram is
/// noised once, every probability after that is post-processing.
struct NoisyQuantiles {
    options: AggregationOptions,
    buckets: Vec<f64>,
    rng: ChaCha20Rng,
    noised: bool,
}

impl NoisyQuantiles {
    fn bucket_width(&self) -> f64 {
        (self.options.upper - self.options.lower) / QUANTILE_BUCKETS as f64
    }
}

impl QuantileAggregator for NoisyQuantiles {
    fn add(&mut self, value: f64) {
        let width = self.bucket_width();
        let index = if width > 0.0 {
            ((self.options.clamp(value) - self.options.lower) / width) as usize
        } else {
            0
        };
        self.buckets[index.min(QUANTILE_BUCKETS - 1)] += 1.0;
    }

    fn result(&mut self, probability: f64) -> Result<f64, AggregationError> {
        check_probability(probability)?;
        if !self.noised {
            let options = self.options;
            let sensitivity = options.contributions();
            for bucket in self.buckets.iter_mut() {
                *bucket = (*bucket + noise(&mut self.rng, &options, sensitivity)?).max(0.0);
            }
            self.noised = true;
        }

        let total: f64 = self.buckets.iter().sum();
        if total <= 0.0 {
            return Ok(self.options.midpoint());
        }
        let target = probability * total;
        let width = self.bucket_width();
        let mut seen = 0.0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            if *bucket > 0.0 && seen + bucket >= target {
                let within = ((target - seen) / bucket).clamp(0.0, 1.0);
                return Ok(self.options.lower + width * (index as f64 + within));
            }
            seen += bucket;
        }
        Ok(self.options.upper)
    }
}

impl AggregationLibrary for NoisyAggregation {
    fn name(&self) -> &'static str {
        "noisy"
    }

    fn scalar(
        &self,
        kind: ScalarKind,
        options: AggregationOptions,
    ) -> Result<Box<dyn Aggregator>, AggregationError> {
        options.check()?;
        Ok(Box::new(NoisyScalar {
            kind,
            options,
            moments: Moments::default(),
            rng: self.child_rng(),
            consumed: false,
        }))
    }

    fn quantiles(
        &self,
        options: AggregationOptions,
    ) -> Result<Box<dyn QuantileAggregator>, AggregationError> {
        options.check()?;
        Ok(Box::new(NoisyQuantiles {
            options,
            buckets: vec![0.0; QUANTILE_BUCKETS],
            rng: self.child_rng(),
            noised: false,
        }))
    }
}
