//! Infer the means of two normally distributed columns.
//!
//! Run with `cargo run --release --example gaussian_means`.

use abc_smc_rs::{AbcSettings, PriorSet, Sampler, SimContext, Simulator};
use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const NUM_POINTS: usize = 500;
const SIGMA: f64 = 0.05;

struct TwoColumns;

fn draw<R: Rng + ?Sized>(means: &[f64], rng: &mut R) -> Result<Vec<Vec<f64>>> {
    means
        .iter()
        .map(|&mean| -> Result<Vec<f64>> {
            let normal = Normal::new(mean, SIGMA)?;
            Ok((0..NUM_POINTS).map(|_| normal.sample(rng)).collect())
        })
        .collect()
}

impl Simulator for TwoColumns {
    type Data = Vec<Vec<f64>>;

    fn simulate(&self, params: &[f64], ctx: &mut SimContext) -> Result<Self::Data> {
        draw(params, ctx.rng())
    }
}

fn column_means(data: &[Vec<f64>]) -> Vec<f64> {
    data.iter()
        .map(|column| column.iter().sum::<f64>() / column.len() as f64)
        .collect()
}

fn main() -> Result<()> {
    let true_means = [0.037579, 0.573537];
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let observed = draw(&true_means, &mut rng)?;

    let distance = |observed: &Vec<Vec<f64>>, simulated: &Vec<Vec<f64>>| -> f64 {
        column_means(observed)
            .iter()
            .zip(column_means(simulated))
            .map(|(a, b)| (a - b).abs())
            .sum()
    };

    let priors = PriorSet::from_tuples([
        ("normal", &[0.03, 0.5][..]),
        ("normal", &[0.5, 0.5][..]),
    ])?;

    let mut settings = AbcSettings {
        num_particles: 100,
        num_iterations: 20,
        ..Default::default()
    };
    settings.tolerance.start = 0.5;
    settings.tolerance.min = 0.002;
    for (key, value) in [("tol_type", "exp"), ("mp", "1"), ("verbose", "1")] {
        settings.set_option(key, value)?;
    }

    let mut sampler = Sampler::new(priors, observed, distance, settings)?.with_progress(|summary| {
        println!(
            "iteration {:2}  tolerance {:.4}  acceptance {:.3}  mean {:?}",
            summary.iteration, summary.tolerance, summary.acceptance_rate, summary.mean
        );
    });
    let output = sampler.sample(&TwoColumns)?;

    println!("stopped: {:?}", output.stop_reason);
    println!("posterior mean: {:?}", output.population.mean());
    println!("posterior variance: {:?}", output.population.variance());
    println!("true means: {:?}", true_means);
    Ok(())
}
