//! User supplied parts of an ABC problem.
//!
//! A [`Simulator`] generates synthetic data from a parameter vector and a
//! [`Distance`] compares it with the observed data. Neither has to be
//! deterministic, but all randomness should come from [`SimContext::rng`] so
//! that runs can be reproduced from their seed.

use anyhow::{bail, Context, Result};
use rand_chacha::ChaCha8Rng;

/// Where a simulation happens inside a run, and its random number stream.
#[derive(Debug, Clone)]
pub struct SimContext {
    iteration: usize,
    slot: usize,
    attempt: usize,
    rng: ChaCha8Rng,
}

impl SimContext {
    pub fn new(iteration: usize, slot: usize, attempt: usize, rng: ChaCha8Rng) -> Self {
        Self {
            iteration,
            slot,
            attempt,
            rng,
        }
    }

    /// Random number generator reserved for this simulation.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Index of the population slot the simulation tries to fill.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of earlier proposals for this slot in the current iteration.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Generative model of the data.
pub trait Simulator: Sync {
    type Data: Send;

    fn simulate(&self, params: &[f64], ctx: &mut SimContext) -> Result<Self::Data>;
}

impl<D, F> Simulator for F
where
    D: Send,
    F: Fn(&[f64], &mut SimContext) -> Result<D> + Sync,
{
    type Data = D;

    fn simulate(&self, params: &[f64], ctx: &mut SimContext) -> Result<D> {
        self(params, ctx)
    }
}

/// Discrepancy between observed and simulated data.
///
/// Must return a finite non-negative value.
pub trait Distance<D>: Sync {
    fn distance(&self, observed: &D, simulated: &D) -> Result<f64>;
}

impl<D, F> Distance<D> for F
where
    F: Fn(&D, &D) -> f64 + Sync,
{
    fn distance(&self, observed: &D, simulated: &D) -> Result<f64> {
        Ok(self(observed, simulated))
    }
}

/// Simulates a parameter vector and measures the distance of the result to
/// the observed data.
pub struct DistanceEvaluator<'a, S: Simulator, M> {
    simulator: &'a S,
    distance: &'a M,
    observed: &'a S::Data,
}

impl<'a, S, M> DistanceEvaluator<'a, S, M>
where
    S: Simulator,
    S::Data: Sync,
    M: Distance<S::Data>,
{
    pub fn new(simulator: &'a S, distance: &'a M, observed: &'a S::Data) -> Self {
        Self {
            simulator,
            distance,
            observed,
        }
    }

    pub fn score(&self, params: &[f64], ctx: &mut SimContext) -> Result<f64> {
        let simulated = self
            .simulator
            .simulate(params, ctx)
            .context("Simulation failed")?;
        let distance = self
            .distance
            .distance(self.observed, &simulated)
            .context("Distance computation failed")?;
        if !(distance.is_finite() && distance >= 0.) {
            bail!("Distance must be finite and non-negative, got {}", distance);
        }
        Ok(distance)
    }
}
