use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, log, warn, Level};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    covariance::{CovarianceEstimator, CovarianceState, VarianceMethod},
    error::{AbcError, Result},
    executor::{default_parallelism, ExecutionMode, ParallelExecutor, Proposal},
    kernel::PerturbationKernel,
    math::log_sum_exp,
    model::{Distance, DistanceEvaluator, SimContext, Simulator},
    output::OutputWriter,
    particle::{Particle, Population, Resampler},
    prior::PriorSet,
    tolerance::{ToleranceSchedule, ToleranceSettings},
};

/// Settings for the ABC-SMC sampler
#[derive(Debug, Clone)]
pub struct AbcSettings {
    /// Number of particles in every population.
    pub num_particles: usize,
    /// Maximum number of iterations, the first one sampling from the prior.
    pub num_iterations: usize,
    /// Expected number of parameters. Checked against the priors if set.
    pub num_params: Option<usize>,
    pub tolerance: ToleranceSettings,
    pub kernel: PerturbationKernel,
    pub variance_method: VarianceMethod,
    /// Neighbour count of the k-nearest-neighbour covariance.
    pub k_near: usize,
    pub execution: ExecutionMode,
    /// Per-iteration summary file. Disabled if `None`.
    pub outfile: Option<PathBuf>,
    /// Checkpoint file, rewritten after every iteration. Disabled if `None`.
    pub restart: Option<PathBuf>,
    /// Continue from the checkpoint in `restart` instead of starting over.
    pub from_restart: bool,
    /// Log a summary of every iteration at info level instead of debug.
    pub verbose: bool,
    pub seed: u64,
    /// Maximum number of simulations per population slot and iteration.
    pub max_attempts: usize,
    /// Maximum number of redraws of a proposal outside the prior support.
    pub max_prior_retries: usize,
}

impl Default for AbcSettings {
    fn default() -> Self {
        Self {
            num_particles: 100,
            num_iterations: 20,
            num_params: None,
            tolerance: ToleranceSettings::default(),
            kernel: PerturbationKernel::ComponentWise,
            variance_method: VarianceMethod::Weighted,
            k_near: 5,
            execution: ExecutionMode::Sequential,
            outfile: Some(PathBuf::from("abc_out.txt")),
            restart: None,
            from_restart: false,
            verbose: false,
            seed: 0,
            max_attempts: 100_000,
            max_prior_retries: 10_000,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        AbcError::Configuration(format!("invalid value '{}' for option '{}'", value, key))
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AbcError::Configuration(format!(
            "invalid value '{}' for flag '{}'",
            value, key
        ))),
    }
}

fn parse_path(value: &str) -> Option<PathBuf> {
    match value.trim() {
        "" | "none" => None,
        path => Some(PathBuf::from(path)),
    }
}

impl AbcSettings {
    /// Set an option by its keyword name, e.g. `("tol_type", "lin")` or
    /// `("variance_method", "4")`.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "tol_type" => self.tolerance.kind = value.parse()?,
            "threshold" => self.tolerance.threshold = parse(key, value)?,
            "adapt_t" => self.tolerance.adaptive = parse_flag(key, value)?,
            "tol_start" => self.tolerance.start = parse(key, value)?,
            "tol_min" => self.tolerance.min = parse(key, value)?,
            "pert_kernel" => self.kernel = PerturbationKernel::from_code(parse(key, value)?)?,
            "variance_method" => {
                self.variance_method = VarianceMethod::from_code(parse(key, value)?)?
            }
            "k_near" => self.k_near = parse(key, value)?,
            "outfile" => self.outfile = parse_path(value),
            "restart" => self.restart = parse_path(value),
            "from_restart" => self.from_restart = parse_flag(key, value)?,
            "mp" => {
                self.execution = if parse_flag(key, value)? {
                    ExecutionMode::Pool {
                        num_workers: self.parallel_workers(),
                    }
                } else if let ExecutionMode::Pool { .. } = self.execution {
                    ExecutionMode::Sequential
                } else {
                    self.execution
                }
            }
            "mpi" => {
                self.execution = if parse_flag(key, value)? {
                    ExecutionMode::Ranked {
                        num_ranks: self.parallel_workers(),
                    }
                } else if let ExecutionMode::Ranked { .. } = self.execution {
                    ExecutionMode::Sequential
                } else {
                    self.execution
                }
            }
            "num_proc" => {
                let count = parse(key, value)?;
                self.execution = match self.execution {
                    ExecutionMode::Ranked { .. } => ExecutionMode::Ranked { num_ranks: count },
                    _ => ExecutionMode::Pool { num_workers: count },
                }
            }
            "verbose" => self.verbose = parse_flag(key, value)?,
            "seed" => self.seed = parse(key, value)?,
            "max_attempts" => self.max_attempts = parse(key, value)?,
            "max_prior_retries" => self.max_prior_retries = parse(key, value)?,
            "particles" => self.num_particles = parse(key, value)?,
            "iterations" => self.num_iterations = parse(key, value)?,
            _ => {
                return Err(AbcError::Configuration(format!(
                    "unknown option '{}'",
                    key
                )))
            }
        }
        Ok(())
    }

    fn parallel_workers(&self) -> usize {
        if self.execution.is_parallel() {
            self.execution.workers()
        } else {
            default_parallelism()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_particles < 2 {
            return Err(AbcError::Configuration(format!(
                "at least two particles are required, got {}",
                self.num_particles
            )));
        }
        ToleranceSchedule::new(&self.tolerance, self.num_iterations)?;
        if self.variance_method == VarianceMethod::KNearest
            && !(2..self.num_particles).contains(&self.k_near)
        {
            return Err(AbcError::Configuration(format!(
                "k_near must lie in [2, {}], got {}",
                self.num_particles - 1,
                self.k_near
            )));
        }
        if self.execution.workers() == 0 {
            return Err(AbcError::Configuration(
                "at least one worker is required".to_string(),
            ));
        }
        if self.max_attempts == 0 || self.max_prior_retries == 0 {
            return Err(AbcError::Configuration(
                "retry budgets must be positive".to_string(),
            ));
        }
        if self.from_restart && self.restart.is_none() {
            return Err(AbcError::Configuration(
                "from_restart requires a restart file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Diagnostics of one finished iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Tolerance the accepted particles passed.
    pub tolerance: f64,
    /// Tolerance of the following iteration.
    pub next_tolerance: f64,
    /// Weighted population mean.
    pub mean: Box<[f64]>,
    /// Accepted particles per simulation.
    pub acceptance_rate: f64,
    pub num_simulations: usize,
    pub effective_sample_size: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All iterations ran.
    Completed,
    /// The tolerance reached its minimum.
    ToleranceFloor,
    /// The interrupt flag was raised.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// The last complete population.
    pub population: Population,
    pub history: Vec<IterationSummary>,
    pub stop_reason: StopReason,
}

/// Loop state between two iterations.
struct SmcState {
    /// Index of the iteration to run next.
    iteration: usize,
    /// Tolerance of that iteration.
    tolerance: f64,
    previous: Option<(Population, CovarianceState)>,
}

type ProgressFn = Box<dyn FnMut(&IterationSummary) + Send>;

/// Population Monte Carlo ABC.
///
/// The sampler owns the priors, the observed data and the distance
/// function. The simulator is passed to [`Sampler::sample`].
pub struct Sampler<D, M> {
    priors: PriorSet,
    observed: D,
    distance: M,
    settings: AbcSettings,
    schedule: ToleranceSchedule,
    estimator: CovarianceEstimator,
    executor: ParallelExecutor,
    progress: Option<ProgressFn>,
    interrupt: Arc<AtomicBool>,
}

impl<D, M> Sampler<D, M>
where
    D: Send + Sync,
    M: Distance<D>,
{
    pub fn new(priors: PriorSet, observed: D, distance: M, settings: AbcSettings) -> Result<Self> {
        settings.validate()?;
        if let Some(num_params) = settings.num_params {
            if num_params != priors.len() {
                return Err(AbcError::Configuration(format!(
                    "{} parameters expected but {} priors given",
                    num_params,
                    priors.len()
                )));
            }
        }

        let schedule = ToleranceSchedule::new(&settings.tolerance, settings.num_iterations)?;
        let estimator = CovarianceEstimator::new(settings.variance_method, settings.k_near);
        let executor = ParallelExecutor::new(settings.execution)?;

        Ok(Self {
            priors,
            observed,
            distance,
            settings,
            schedule,
            estimator,
            executor,
            progress: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Call `callback` after every finished iteration.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&IterationSummary) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Flag that stops sampling at the next iteration boundary once set.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn settings(&self) -> &AbcSettings {
        &self.settings
    }

    pub fn schedule(&self) -> &ToleranceSchedule {
        &self.schedule
    }

    /// Run the sampler, or continue a checkpointed run if `from_restart` is
    /// set.
    pub fn sample<S>(&mut self, simulator: &S) -> Result<SampleOutput>
    where
        S: Simulator<Data = D>,
    {
        let store = self.settings.restart.as_ref().map(CheckpointStore::new);
        let (mut state, mut history, seed) = match &store {
            Some(store) if self.settings.from_restart => self.resume(store)?,
            _ => (
                SmcState {
                    iteration: 0,
                    tolerance: self.schedule.initial(),
                    previous: None,
                },
                vec![],
                self.settings.seed,
            ),
        };

        let mut output = self
            .settings
            .outfile
            .as_ref()
            .map(|path| OutputWriter::restore(path, &history))
            .transpose()?;

        let evaluator = DistanceEvaluator::new(simulator, &self.distance, &self.observed);
        let level = if self.settings.verbose {
            Level::Info
        } else {
            Level::Debug
        };

        let stop_reason = loop {
            if state.iteration >= self.schedule.len() {
                break StopReason::Completed;
            }
            if let Some((population, _)) = &state.previous {
                if self.schedule.reached_floor(population.tolerance()) {
                    break StopReason::ToleranceFloor;
                }
            }
            if self.interrupt.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }

            let start = Instant::now();
            let iteration = state.iteration;
            let (population, num_simulations) = self.iterate(&evaluator, &state, seed)?;

            let next_tolerance =
                self.schedule
                    .next(iteration, state.tolerance, &population.distances());
            let covariance = self.estimator.estimate(&population, next_tolerance)?;

            let summary = IterationSummary {
                iteration,
                tolerance: state.tolerance,
                next_tolerance,
                mean: population.mean(),
                acceptance_rate: population.len() as f64 / num_simulations as f64,
                num_simulations,
                effective_sample_size: population.effective_sample_size(),
                elapsed: start.elapsed(),
            };

            history.push(summary.clone());
            if let Some(store) = &store {
                store.save(&Checkpoint::new(
                    seed,
                    population.clone(),
                    next_tolerance,
                    &covariance,
                    history.clone(),
                ))?;
            }
            if let Some(output) = output.as_mut() {
                output.write_iteration(&summary)?;
            }

            log!(
                level,
                "Iteration {}: tolerance {:.6}, acceptance rate {:.4}, ESS {:.1}, mean {:?}",
                iteration,
                summary.tolerance,
                summary.acceptance_rate,
                summary.effective_sample_size,
                summary.mean
            );
            if let Some(callback) = self.progress.as_mut() {
                callback(&summary);
            }

            state = SmcState {
                iteration: iteration + 1,
                tolerance: next_tolerance,
                previous: Some((population, covariance)),
            };
        };

        let population = state
            .previous
            .map(|(population, _)| population)
            .ok_or(AbcError::Interrupted)?;
        Ok(SampleOutput {
            population,
            history,
            stop_reason,
        })
    }

    fn resume(&self, store: &CheckpointStore) -> Result<(SmcState, Vec<IterationSummary>, u64)> {
        let checkpoint = store.load()?;
        let population = checkpoint.population;
        if population.len() != self.settings.num_particles || population.dim() != self.priors.len()
        {
            return Err(AbcError::Configuration(format!(
                "checkpoint {:?} holds {} particles of dimension {}, expected {} of dimension {}",
                store.path(),
                population.len(),
                population.dim(),
                self.settings.num_particles,
                self.priors.len()
            )));
        }
        if checkpoint.seed != self.settings.seed {
            warn!(
                "Checkpoint was written with seed {}, ignoring configured seed {}",
                checkpoint.seed, self.settings.seed
            );
        }
        let covariance = checkpoint.covariance.restore()?;
        if covariance.dim() != self.priors.len() {
            return Err(AbcError::Configuration(format!(
                "checkpoint {:?} has a covariance of dimension {}",
                store.path(),
                covariance.dim()
            )));
        }

        debug!(
            "Resuming from {:?} at iteration {}",
            store.path(),
            checkpoint.next_iteration
        );
        Ok((
            SmcState {
                iteration: checkpoint.next_iteration,
                tolerance: checkpoint.tolerance,
                previous: Some((population, covariance)),
            },
            checkpoint.history,
            checkpoint.seed,
        ))
    }

    /// Fill a population of particles that pass the tolerance of
    /// `state.iteration`. Returns the weighted population and the number of
    /// simulations it took.
    fn iterate<S>(
        &self,
        evaluator: &DistanceEvaluator<'_, S, M>,
        state: &SmcState,
        seed: u64,
    ) -> Result<(Population, usize)>
    where
        S: Simulator<Data = D>,
    {
        let iteration = state.iteration;
        let tolerance = state.tolerance;
        let num_particles = self.settings.num_particles;

        let mut slot_rngs: Vec<ChaCha8Rng> = (0..num_particles)
            .map(|slot| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(((iteration as u64) << 32) | slot as u64);
                rng
            })
            .collect();
        let previous = state
            .previous
            .as_ref()
            .map(|(population, covariance)| (population, covariance, population.resampler()));

        let mut accepted: Vec<Option<Particle>> = vec![None; num_particles];
        let mut attempts = vec![0usize; num_particles];
        let mut pending: Vec<usize> = (0..num_particles).collect();
        let mut num_simulations = 0;
        let mut round = 0;

        while !pending.is_empty() {
            round += 1;
            let mut proposals = Vec::with_capacity(pending.len());
            for &slot in &pending {
                if attempts[slot] >= self.settings.max_attempts {
                    return Err(AbcError::SamplingDeadlock {
                        iteration,
                        accepted: num_particles - pending.len(),
                        required: num_particles,
                        attempts: self.settings.max_attempts,
                        tolerance,
                    });
                }
                let rng = &mut slot_rngs[slot];
                let (parent, params) = self.propose(iteration, previous.as_ref(), rng)?;
                let context =
                    SimContext::new(iteration, slot, attempts[slot], ChaCha8Rng::from_rng(rng));
                attempts[slot] += 1;
                proposals.push(Proposal {
                    slot,
                    parent,
                    params,
                    context,
                });
            }
            num_simulations += proposals.len();

            let mut unfilled = Vec::new();
            for (proposal, evaluation) in self.executor.score(proposals, evaluator, tolerance) {
                let evaluation = match evaluation {
                    Ok(evaluation) => evaluation,
                    Err(source) => {
                        return Err(AbcError::Simulation {
                            iteration,
                            slot: proposal.slot,
                            parent: proposal.parent,
                            params: proposal.params,
                            source,
                        })
                    }
                };
                if evaluation.accepted {
                    accepted[proposal.slot] = Some(Particle {
                        params: proposal.params,
                        distance: evaluation.distance,
                        weight: 1.,
                    });
                } else {
                    unfilled.push(proposal.slot);
                }
            }
            debug!(
                "Iteration {} round {}: {} of {} particles accepted",
                iteration,
                round,
                num_particles - unfilled.len(),
                num_particles
            );
            pending = unfilled;
        }

        let particles: Vec<Particle> = accepted.into_iter().flatten().collect();
        let population = match &state.previous {
            None => Population::normalized(particles, iteration, tolerance)?,
            Some((previous, covariance)) => {
                self.weigh(particles, previous, covariance, iteration, tolerance)?
            }
        };
        Ok((population, num_simulations))
    }

    fn propose(
        &self,
        iteration: usize,
        previous: Option<&(&Population, &CovarianceState, Resampler)>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Option<usize>, Box<[f64]>)> {
        let Some((population, covariance, resampler)) = previous else {
            return Ok((None, self.priors.sample(rng, self.settings.max_prior_retries)?));
        };

        let mut last = None;
        for _ in 0..self.settings.max_prior_retries {
            let source = resampler.sample(rng);
            let params = self.settings.kernel.propose(
                &population.particles()[source].params,
                covariance.matrix_for(source),
                rng,
            );
            if self.priors.contains(&params) {
                return Ok((Some(source), params));
            }
            last = Some(params);
        }
        Err(AbcError::Configuration(format!(
            "no perturbed particle inside the prior support after {} attempts in iteration {} \
             (last proposal {:?})",
            self.settings.max_prior_retries, iteration, last
        )))
    }

    /// Importance weights `prior(x) / sum_j w_j K(x | x_j)`, in log space.
    fn weigh(
        &self,
        particles: Vec<Particle>,
        previous: &Population,
        covariance: &CovarianceState,
        iteration: usize,
        tolerance: f64,
    ) -> Result<Population> {
        let kernel = self.settings.kernel;
        let priors = &self.priors;
        let candidates: Vec<&[f64]> = particles.iter().map(|p| &p.params[..]).collect();

        let log_weights = self.executor.map(candidates, |params: &[f64]| {
            let terms: Vec<f64> = previous
                .particles()
                .iter()
                .enumerate()
                .map(|(j, source)| {
                    source.weight.ln()
                        + kernel.log_density(&source.params, params, covariance.matrix_for(j))
                })
                .collect();
            priors.log_density(params) - log_sum_exp(&terms)
        });

        let max = log_weights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(AbcError::DegenerateWeights { iteration });
        }

        let particles = particles
            .into_iter()
            .zip(log_weights)
            .map(|(particle, log_weight)| Particle {
                weight: (log_weight - max).exp(),
                ..particle
            })
            .collect();
        Population::normalized(particles, iteration, tolerance)
    }
}

/// Run a sampler with `settings` and return its final population.
pub fn sample_abc<S, M>(
    simulator: &S,
    priors: PriorSet,
    observed: S::Data,
    distance: M,
    settings: AbcSettings,
) -> Result<Population>
where
    S: Simulator,
    S::Data: Sync,
    M: Distance<S::Data>,
{
    let mut sampler = Sampler::new(priors, observed, distance, settings)?;
    Ok(sampler.sample(simulator)?.population)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    use super::{AbcSettings, Sampler, StopReason};
    use crate::{
        covariance::VarianceMethod, error::AbcError, executor::ExecutionMode,
        kernel::PerturbationKernel, model::SimContext, prior::PriorSet,
        tolerance::ToleranceKind,
    };

    #[test]
    fn keyword_options() -> Result<()> {
        let mut settings = AbcSettings::default();
        settings.set_option("tol_type", "log")?;
        settings.set_option("threshold", "60")?;
        settings.set_option("adapt_t", "1")?;
        settings.set_option("pert_kernel", "2")?;
        settings.set_option("variance_method", "4")?;
        settings.set_option("k_near", "7")?;
        settings.set_option("outfile", "none")?;
        settings.set_option("restart", "run.ckpt")?;
        settings.set_option("from_restart", "true")?;
        settings.set_option("verbose", "1")?;
        settings.set_option("seed", "42")?;

        assert_eq!(settings.tolerance.kind, ToleranceKind::Log);
        assert_eq!(settings.tolerance.threshold, 60.);
        assert!(settings.tolerance.adaptive);
        assert_eq!(settings.kernel, PerturbationKernel::Multivariate);
        assert_eq!(settings.variance_method, VarianceMethod::KNearest);
        assert_eq!(settings.k_near, 7);
        assert_eq!(settings.outfile, None);
        assert_eq!(settings.restart, Some(PathBuf::from("run.ckpt")));
        assert!(settings.from_restart && settings.verbose);
        assert_eq!(settings.seed, 42);
        settings.validate()?;

        assert!(settings.set_option("tol_type", "cubic").is_err());
        assert!(settings.set_option("threshold", "high").is_err());
        assert!(settings.set_option("dfunc", "1").is_err());
        Ok(())
    }

    #[test]
    fn execution_options() -> Result<()> {
        let mut settings = AbcSettings::default();
        settings.set_option("num_proc", "3")?;
        settings.set_option("mp", "1")?;
        assert_eq!(settings.execution, ExecutionMode::Pool { num_workers: 3 });
        settings.set_option("mpi", "1")?;
        assert_eq!(settings.execution, ExecutionMode::Ranked { num_ranks: 3 });
        settings.set_option("num_proc", "2")?;
        assert_eq!(settings.execution, ExecutionMode::Ranked { num_ranks: 2 });
        settings.set_option("mp", "0")?;
        assert_eq!(settings.execution, ExecutionMode::Ranked { num_ranks: 2 });
        settings.set_option("mpi", "0")?;
        assert_eq!(settings.execution, ExecutionMode::Sequential);
        Ok(())
    }

    #[test]
    fn invalid_settings() {
        let settings = AbcSettings {
            num_particles: 1,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = AbcSettings {
            variance_method: VarianceMethod::KNearest,
            k_near: 100,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = AbcSettings {
            from_restart: true,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])]).unwrap();
        let settings = AbcSettings {
            num_params: Some(2),
            ..Default::default()
        };
        let distance = |a: &f64, b: &f64| (a - b).abs();
        assert!(matches!(
            Sampler::new(priors, 0.5, distance, settings),
            Err(AbcError::Configuration(_))
        ));
    }

    #[test]
    fn deadlock_is_reported() {
        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])]).unwrap();
        let settings = AbcSettings {
            num_particles: 5,
            num_iterations: 2,
            outfile: None,
            max_attempts: 50,
            ..Default::default()
        };
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let simulator = |params: &[f64], _ctx: &mut SimContext| -> Result<f64> { Ok(params[0]) };
        let mut sampler = Sampler::new(priors, 10., distance, settings).unwrap();

        let err = sampler.sample(&simulator).unwrap_err();
        assert!(matches!(
            err,
            AbcError::SamplingDeadlock {
                iteration: 0,
                accepted: 0,
                required: 5,
                attempts: 50,
                ..
            }
        ));
    }

    #[test]
    fn simulation_errors_are_fatal() {
        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])]).unwrap();
        let settings = AbcSettings {
            num_particles: 5,
            num_iterations: 2,
            outfile: None,
            ..Default::default()
        };
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let simulator = |params: &[f64], ctx: &mut SimContext| -> Result<f64> {
            if ctx.slot() == 3 {
                anyhow::bail!("simulator crashed");
            }
            Ok(params[0] + 0.01 * ctx.rng().random::<f64>())
        };
        let mut sampler = Sampler::new(priors, 0.5, distance, settings).unwrap();

        let err = sampler.sample(&simulator).unwrap_err();
        let AbcError::Simulation {
            iteration,
            slot,
            parent,
            params,
            ..
        } = err
        else {
            panic!("expected a simulation error, got {:?}", err);
        };
        assert_eq!((iteration, slot, parent), (0, 3, None));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn simulation_errors_name_the_parent_particle() {
        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])]).unwrap();
        let mut settings = AbcSettings {
            num_particles: 5,
            num_iterations: 3,
            outfile: None,
            ..Default::default()
        };
        settings.tolerance.start = 1.;
        settings.tolerance.min = 0.6;
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let simulator = |params: &[f64], ctx: &mut SimContext| -> Result<f64> {
            if ctx.iteration() == 1 && ctx.slot() == 2 {
                anyhow::bail!("simulator crashed");
            }
            Ok(params[0])
        };
        let mut sampler = Sampler::new(priors, 0.5, distance, settings).unwrap();

        let err = sampler.sample(&simulator).unwrap_err();
        let AbcError::Simulation {
            iteration,
            slot,
            parent,
            ..
        } = err
        else {
            panic!("expected a simulation error, got {:?}", err);
        };
        assert_eq!((iteration, slot), (1, 2));
        assert!(matches!(parent, Some(index) if index < 5));
    }

    #[test]
    fn interrupted_before_first_population() {
        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])]).unwrap();
        let settings = AbcSettings {
            outfile: None,
            ..Default::default()
        };
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let simulator = |params: &[f64], _ctx: &mut SimContext| -> Result<f64> { Ok(params[0]) };
        let mut sampler = Sampler::new(priors, 0.5, distance, settings).unwrap();
        sampler
            .interrupt_handle()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            sampler.sample(&simulator),
            Err(AbcError::Interrupted)
        ));
    }

    #[test]
    fn stops_at_tolerance_floor() -> Result<()> {
        let priors = PriorSet::from_tuples([("uniform", &[0., 1.][..])])?;
        let mut settings = AbcSettings {
            num_particles: 20,
            num_iterations: 10,
            outfile: None,
            ..Default::default()
        };
        settings.tolerance.start = 0.5;
        settings.tolerance.min = 0.2;
        settings.tolerance.adaptive = true;
        settings.tolerance.threshold = 0.;
        let distance = |a: &f64, b: &f64| (a - b).abs();
        let simulator = |params: &[f64], _ctx: &mut SimContext| -> Result<f64> { Ok(params[0]) };
        let mut sampler = Sampler::new(priors, 0.5, distance, settings)?;

        let output = sampler.sample(&simulator)?;
        assert_eq!(output.stop_reason, StopReason::ToleranceFloor);
        assert!(output.history.len() < 10);
        assert_eq!(output.population.tolerance(), 0.2);
        Ok(())
    }
}
