//! Likelihood-free inference with population Monte Carlo ABC.
//!
//! A weighted population of parameter vectors is moved towards the
//! posterior of a simulation based model by repeated rounds of resampling,
//! perturbation, simulation and rejection against a shrinking tolerance.
//!
//! ```no_run
//! use abc_smc_rs::{AbcSettings, PriorSet, Sampler, SimContext};
//! use rand_distr::{Distribution, Normal};
//!
//! # fn main() -> anyhow::Result<()> {
//! let observed = 1.2f64;
//! let simulator = |params: &[f64], ctx: &mut SimContext| -> anyhow::Result<f64> {
//!     Ok(Normal::new(params[0], 0.1)?.sample(ctx.rng()))
//! };
//! let distance = |a: &f64, b: &f64| (a - b).abs();
//!
//! let priors = PriorSet::from_tuples([("uniform", &[-5., 5.][..])])?;
//! let mut sampler = Sampler::new(priors, observed, distance, AbcSettings::default())?;
//! let output = sampler.sample(&simulator)?;
//! println!("{:?}", output.population.mean());
//! # Ok(())
//! # }
//! ```

pub(crate) mod checkpoint;
pub(crate) mod covariance;
pub(crate) mod error;
pub(crate) mod executor;
pub(crate) mod kernel;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod output;
pub(crate) mod particle;
pub(crate) mod prior;
pub(crate) mod sampler;
pub(crate) mod tolerance;

pub use checkpoint::{Checkpoint, CheckpointStore, StoredCovariance, StoredMatrix, CHECKPOINT_VERSION};
pub use covariance::{
    ledoit_wolf, nearest_neighbours, sample_covariance, weighted_covariance, CovarianceEstimator,
    CovarianceState, KernelMatrix, VarianceMethod,
};
pub use error::{AbcError, Result};
pub use executor::{Evaluation, ExecutionMode, ParallelExecutor, Proposal};
pub use kernel::PerturbationKernel;
pub use model::{Distance, DistanceEvaluator, SimContext, Simulator};
pub use output::OutputWriter;
pub use particle::{Particle, Population, Resampler};
pub use prior::{Prior, PriorSet};
pub use sampler::{sample_abc, AbcSettings, IterationSummary, SampleOutput, Sampler, StopReason};
pub use tolerance::{quantile, ToleranceKind, ToleranceSchedule, ToleranceSettings};
