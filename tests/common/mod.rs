#![allow(dead_code)]

use abc_smc_rs::{AbcSettings, PriorSet, SimContext, Simulator};
use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

pub const TRUE_MEANS: [f64; 2] = [0.037579, 0.573537];

/// Columns of normally distributed data with unknown means.
pub struct GaussianMeans {
    pub num_points: usize,
    pub sigma: f64,
}

impl GaussianMeans {
    pub fn draw<R: Rng + ?Sized>(&self, means: &[f64], rng: &mut R) -> Result<Vec<Vec<f64>>> {
        means
            .iter()
            .map(|&mean| -> Result<Vec<f64>> {
                let normal = Normal::new(mean, self.sigma)?;
                Ok((0..self.num_points).map(|_| normal.sample(rng)).collect())
            })
            .collect()
    }

    pub fn observed(&self, seed: u64) -> Result<Vec<Vec<f64>>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.draw(&TRUE_MEANS, &mut rng)
    }
}

impl Simulator for GaussianMeans {
    type Data = Vec<Vec<f64>>;

    fn simulate(&self, params: &[f64], ctx: &mut SimContext) -> Result<Self::Data> {
        self.draw(params, ctx.rng())
    }
}

/// Sum of the absolute differences of the column means.
#[allow(clippy::ptr_arg)]
pub fn mean_distance(observed: &Vec<Vec<f64>>, simulated: &Vec<Vec<f64>>) -> f64 {
    let mean = |column: &Vec<f64>| column.iter().sum::<f64>() / column.len() as f64;
    observed
        .iter()
        .zip(simulated)
        .map(|(a, b)| (mean(a) - mean(b)).abs())
        .sum()
}

pub fn priors() -> Result<PriorSet> {
    Ok(PriorSet::from_tuples([
        ("normal", &[0.03, 0.5][..]),
        ("normal", &[0.5, 0.5][..]),
    ])?)
}

/// A short run that finishes quickly.
pub fn small_settings() -> AbcSettings {
    let mut settings = AbcSettings {
        num_particles: 30,
        num_iterations: 6,
        outfile: None,
        seed: 1234,
        ..Default::default()
    };
    settings.tolerance.start = 0.5;
    settings.tolerance.min = 0.02;
    settings
}
