use faer::Mat;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    covariance::weighted_covariance,
    error::{AbcError, Result},
};

/// A scored parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub params: Box<[f64]>,
    /// Distance between the simulated and the observed data.
    pub distance: f64,
    pub weight: f64,
}

/// The accepted particles of one iteration.
///
/// The weights of a population are always normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    particles: Vec<Particle>,
    iteration: usize,
    tolerance: f64,
}

impl Population {
    /// Normalize the weights of `particles` and wrap them into a population.
    pub fn normalized(
        mut particles: Vec<Particle>,
        iteration: usize,
        tolerance: f64,
    ) -> Result<Self> {
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        let valid = particles
            .iter()
            .all(|p| p.weight.is_finite() && p.weight >= 0.);
        if particles.is_empty() || !valid || !total.is_finite() || total <= 0. {
            return Err(AbcError::DegenerateWeights { iteration });
        }
        particles.iter_mut().for_each(|p| p.weight /= total);
        Ok(Self {
            particles,
            iteration,
            tolerance,
        })
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Number of parameters of each particle.
    pub fn dim(&self) -> usize {
        self.particles.first().map_or(0, |p| p.params.len())
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The tolerance every particle of this population passed.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    pub fn distances(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.distance).collect()
    }

    pub fn mean(&self) -> Box<[f64]> {
        let mut mean = vec![0f64; self.dim()];
        for particle in &self.particles {
            crate::math::axpy(&particle.params, &mut mean, particle.weight);
        }
        mean.into()
    }

    pub fn variance(&self) -> Box<[f64]> {
        let mean = self.mean();
        let mut variance = vec![0f64; self.dim()];
        for particle in &self.particles {
            variance
                .iter_mut()
                .zip(particle.params.iter().zip(mean.iter()))
                .for_each(|(var, (x, m))| *var += particle.weight * (x - m) * (x - m));
        }
        variance.into()
    }

    /// Weighted sample covariance of the parameters.
    pub fn covariance(&self) -> Mat<f64> {
        let points: Vec<&[f64]> = self.particles.iter().map(|p| &p.params[..]).collect();
        weighted_covariance(&points, &self.weights())
    }

    /// Kish's effective sample size `1 / sum(w^2)`.
    pub fn effective_sample_size(&self) -> f64 {
        let weights = self.weights();
        crate::math::vector_dot(&weights, &weights).recip()
    }

    pub fn resampler(&self) -> Resampler {
        let mut cumulative = Vec::with_capacity(self.len());
        let mut total = 0f64;
        for particle in &self.particles {
            total += particle.weight;
            cumulative.push(total);
        }
        Resampler { cumulative }
    }
}

/// Draws particle indices with probability proportional to their weight.
#[derive(Debug, Clone)]
pub struct Resampler {
    cumulative: Vec<f64>,
}

impl Resampler {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let total = self.cumulative.last().copied().unwrap_or(0.);
        let u: f64 = rng.random::<f64>() * total;
        self.cumulative
            .partition_point(|&c| c <= u)
            .min(self.cumulative.len().saturating_sub(1))
    }
}
