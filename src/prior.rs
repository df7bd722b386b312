//! Prior distributions over the inferred parameters.

use std::{f64::consts::PI, fmt::Debug, sync::Arc};

use rand::Rng;
use rand_distr::{Exp1, StandardNormal};

use crate::error::{AbcError, Result};

/// Prior of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Normal { mean: f64, variance: f64 },
    Uniform { low: f64, high: f64 },
    /// `exp(X)` with `X ~ Normal(mu, sigma^2)`.
    LogNormal { mu: f64, sigma: f64 },
    Exponential { rate: f64 },
}

impl Prior {
    /// Build a prior from a family name and its hyperparameters, e.g.
    /// `("normal", &[mean, variance])` or `("uniform", &[low, high])`.
    pub fn from_tuple(kind: &str, params: &[f64]) -> Result<Self> {
        let expect = |count: usize| {
            if params.len() == count {
                Ok(())
            } else {
                Err(AbcError::Configuration(format!(
                    "prior '{}' takes {} hyperparameters, got {}",
                    kind,
                    count,
                    params.len()
                )))
            }
        };

        let prior = match kind.to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => {
                expect(2)?;
                Prior::Normal {
                    mean: params[0],
                    variance: params[1],
                }
            }
            "uniform" | "flat" => {
                expect(2)?;
                Prior::Uniform {
                    low: params[0],
                    high: params[1],
                }
            }
            "lognormal" => {
                expect(2)?;
                Prior::LogNormal {
                    mu: params[0],
                    sigma: params[1],
                }
            }
            "exponential" | "exp" => {
                expect(1)?;
                Prior::Exponential { rate: params[0] }
            }
            other => {
                return Err(AbcError::Configuration(format!(
                    "unknown prior family '{}'",
                    other
                )))
            }
        };
        prior.validate()?;
        Ok(prior)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Prior::Normal { mean, variance } => mean.is_finite() && variance.is_finite() && variance > 0.,
            Prior::Uniform { low, high } => low.is_finite() && high.is_finite() && low < high,
            Prior::LogNormal { mu, sigma } => mu.is_finite() && sigma.is_finite() && sigma > 0.,
            Prior::Exponential { rate } => rate.is_finite() && rate > 0.,
        };
        if ok {
            Ok(())
        } else {
            Err(AbcError::Configuration(format!(
                "degenerate prior hyperparameters: {:?}",
                self
            )))
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Normal { mean, variance } => {
                let z: f64 = rng.sample(StandardNormal);
                variance.sqrt().mul_add(z, mean)
            }
            Prior::Uniform { low, high } => {
                let u: f64 = rng.random();
                (high - low).mul_add(u, low)
            }
            Prior::LogNormal { mu, sigma } => {
                let z: f64 = rng.sample(StandardNormal);
                sigma.mul_add(z, mu).exp()
            }
            Prior::Exponential { rate } => {
                let e: f64 = rng.sample(Exp1);
                e / rate
            }
        }
    }

    /// Log density at `x`, `-inf` outside the support.
    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Normal { mean, variance } => {
                let diff = x - mean;
                -0.5 * ((2. * PI * variance).ln() + diff * diff / variance)
            }
            Prior::Uniform { low, high } => {
                if (low..=high).contains(&x) {
                    -(high - low).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Prior::LogNormal { mu, sigma } => {
                if x <= 0. {
                    return f64::NEG_INFINITY;
                }
                let diff = x.ln() - mu;
                -x.ln() - sigma.ln() - 0.5 * (2. * PI).ln() - diff * diff / (2. * sigma * sigma)
            }
            Prior::Exponential { rate } => {
                if x < 0. {
                    f64::NEG_INFINITY
                } else {
                    rate.ln() - rate * x
                }
            }
        }
    }

    pub fn contains(&self, x: f64) -> bool {
        self.log_density(x) > f64::NEG_INFINITY
    }
}

type Constraint = Arc<dyn Fn(&[f64]) -> bool + Send + Sync>;

/// Independent priors, one per parameter, with an optional joint support
/// constraint.
///
/// The joint density is the product of the marginals times the indicator of
/// the constraint. The constraint only restricts the support; it is not
/// renormalized, which leaves importance weights unchanged up to a constant.
#[derive(Clone)]
pub struct PriorSet {
    priors: Vec<Prior>,
    constraint: Option<Constraint>,
}

impl Debug for PriorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorSet")
            .field("priors", &self.priors)
            .field("constrained", &self.constraint.is_some())
            .finish()
    }
}

impl PriorSet {
    pub fn new(priors: Vec<Prior>) -> Result<Self> {
        if priors.is_empty() {
            return Err(AbcError::Configuration(
                "at least one prior is required".to_string(),
            ));
        }
        priors.iter().try_for_each(Prior::validate)?;
        Ok(Self {
            priors,
            constraint: None,
        })
    }

    /// Build the set from `(family, hyperparameters)` tuples.
    pub fn from_tuples<'a, I>(tuples: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [f64])>,
    {
        let priors = tuples
            .into_iter()
            .map(|(kind, params)| Prior::from_tuple(kind, params))
            .collect::<Result<Vec<_>>>()?;
        Self::new(priors)
    }

    /// Restrict the joint support to the vectors accepted by `constraint`.
    pub fn with_constraint<F>(mut self, constraint: F) -> Self
    where
        F: Fn(&[f64]) -> bool + Send + Sync + 'static,
    {
        self.constraint = Some(Arc::new(constraint));
        self
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    pub fn priors(&self) -> &[Prior] {
        &self.priors
    }

    pub fn log_density(&self, params: &[f64]) -> f64 {
        assert!(params.len() == self.len());
        if let Some(constraint) = &self.constraint {
            if !constraint(params) {
                return f64::NEG_INFINITY;
            }
        }
        self.priors
            .iter()
            .zip(params)
            .map(|(prior, &x)| prior.log_density(x))
            .sum()
    }

    pub fn contains(&self, params: &[f64]) -> bool {
        self.log_density(params) > f64::NEG_INFINITY
    }

    /// Draw one parameter vector from the joint prior.
    ///
    /// Fails with a configuration error if `max_retries` independent draws
    /// all fall outside the joint constraint.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, max_retries: usize) -> Result<Box<[f64]>> {
        let mut last = None;
        for _ in 0..max_retries.max(1) {
            let draw: Box<[f64]> = self.priors.iter().map(|prior| prior.sample(rng)).collect();
            if self.contains(&draw) {
                return Ok(draw);
            }
            last = Some(draw);
        }
        Err(AbcError::Configuration(format!(
            "no prior draw inside the joint support after {} attempts (last draw {:?}); \
             the priors may be contradictory",
            max_retries, last
        )))
    }
}
